pub mod user_sync_worker;

pub use user_sync_worker::{LoopState, StopReason, SyncReport, SyncStats, UserSyncWorker};

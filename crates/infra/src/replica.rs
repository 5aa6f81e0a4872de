//! Replica apply logic: one inbound user-change event, one local store write.
//!
//! Redelivery is expected. Every method is idempotent:
//!
//! - create is rejected by the primary key the second time (`Duplicate`)
//! - update / password / delete overwrite, and with the version gate enabled a
//!   replayed or reordered event whose `updated_at` is not strictly newer than
//!   the stored version of the fields it writes is skipped (`Stale`)
//!
//! Profile fields and the password are versioned separately, so a local
//! password reset never makes an older-stamped profile event from another
//! service look stale.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, instrument};

use hrms_auth::UserRecord;
use hrms_events::{Method, UserMessage};

use crate::store::{RecordStore, StoreError, WriteGuard, WriteOutcome, constraints};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The record already exists.
    Duplicate,
    /// The stored fields are as new or newer than the event.
    Stale,
    /// No row to update.
    Missing,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    Skipped(SkipReason),
}

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("undecodable {method} payload: {source}")]
    Decode {
        method: Method,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Applies user-change events to the local replica.
#[derive(Clone)]
pub struct ReplicaApplier {
    store: Arc<dyn RecordStore>,
    version_gate: bool,
}

impl std::fmt::Debug for ReplicaApplier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaApplier")
            .field("version_gate", &self.version_gate)
            .finish_non_exhaustive()
    }
}

impl ReplicaApplier {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            version_gate: true,
        }
    }

    /// Turn the `updated_at` gate on or off (on by default).
    pub fn with_version_gate(mut self, enabled: bool) -> Self {
        self.version_gate = enabled;
        self
    }

    fn guard(&self, incoming: &UserMessage) -> WriteGuard {
        if self.version_gate {
            WriteGuard::IfOlderThan(incoming.updated_at)
        } else {
            WriteGuard::Always
        }
    }

    #[instrument(skip_all, fields(method = %method))]
    pub async fn apply(&self, method: Method, payload: &[u8]) -> Result<ApplyOutcome, ApplyError> {
        let message = UserMessage::from_bytes(payload).map_err(|source| ApplyError::Decode { method, source })?;
        debug!(user_id = %message.id, "applying user event");

        match method {
            Method::CreateUser => self.apply_create(message).await,
            Method::UpdateUser => {
                let guard = self.guard(&message);
                let record = UserRecord::from(message);
                let outcome = self.store.update_profile(&record, guard).await?;
                Ok(outcome.into())
            }
            Method::UpdatePassword => {
                let guard = self.guard(&message);
                let outcome = self
                    .store
                    .update_password(message.id, &message.password, message.updated_at, guard)
                    .await?;
                Ok(outcome.into())
            }
            Method::DeleteUser => {
                let deleted_at = message.deleted_at.unwrap_or(message.updated_at);
                let guard = if self.version_gate {
                    WriteGuard::IfOlderThan(deleted_at)
                } else {
                    WriteGuard::Always
                };
                let outcome = self.store.soft_delete(message.id, deleted_at, guard).await?;
                Ok(outcome.into())
            }
        }
    }

    async fn apply_create(&self, message: UserMessage) -> Result<ApplyOutcome, ApplyError> {
        let record = UserRecord::from(message);
        match self.store.create_user(&record).await {
            Ok(()) => Ok(ApplyOutcome::Applied),
            Err(err) if err.violated(constraints::USERS_PKEY) => Ok(ApplyOutcome::Skipped(SkipReason::Duplicate)),
            Err(err) => Err(err.into()),
        }
    }
}

impl From<WriteOutcome> for ApplyOutcome {
    fn from(outcome: WriteOutcome) -> Self {
        match outcome {
            WriteOutcome::Written => ApplyOutcome::Applied,
            WriteOutcome::Stale => ApplyOutcome::Skipped(SkipReason::Stale),
            WriteOutcome::Missing => ApplyOutcome::Skipped(SkipReason::Missing),
        }
    }
}

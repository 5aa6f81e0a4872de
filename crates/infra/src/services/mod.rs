//! Account and password-reset operations run by the HTTP layer.

pub mod accounts;
pub mod notifier;
pub mod password_reset;

pub use accounts::{AccountService, Session};
pub use notifier::{LogNotifier, ResetNotifier};
pub use password_reset::PasswordResetService;

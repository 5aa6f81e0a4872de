use async_trait::async_trait;
use tracing::{debug, info};

use hrms_auth::UserRecord;

/// Delivers reset links to the user (e-mail, SMS, ...).
#[async_trait]
pub trait ResetNotifier: Send + Sync {
    async fn send_reset_link(&self, user: &UserRecord, url: &str);
}

/// Writes the link to the log instead of sending it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl ResetNotifier for LogNotifier {
    async fn send_reset_link(&self, user: &UserRecord, url: &str) {
        info!(user_id = %user.id, email = %user.email, "reset link issued");
        debug!(url = %url, "reset link");
    }
}

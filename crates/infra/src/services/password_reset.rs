//! Reset-token state machine: `RequestReset` and `VerifyAndConsume`.
//!
//! Each store write commits on its own. The password update and the token
//! invalidation are two commits; retrying the whole verify after a crash
//! between them is harmless because the token still matches and re-hashing
//! the same password converges.
//!
//! Issuing a token is a compare-and-set on the row as it was read. A request
//! that loses the race re-reads the row and runs the daily cap again, so
//! concurrent requests never issue more than the cap.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use hrms_auth::{CredentialHasher, IssuedReset, ResetPolicy, ResetToken, UserRecord};
use hrms_core::{Clock, DomainError, DomainResult};
use hrms_events::Method;

use crate::publisher::EventPublisher;
use crate::store::{RecordStore, WriteGuard, WriteOutcome, constraints};

use super::notifier::ResetNotifier;

/// Read-then-swap rounds before `request_reset` gives up on a contended row.
const MAX_ISSUE_ROUNDS: usize = 5;

pub struct PasswordResetService {
    store: Arc<dyn RecordStore>,
    hasher: Arc<dyn CredentialHasher>,
    clock: Arc<dyn Clock>,
    policy: ResetPolicy,
    publisher: Arc<EventPublisher>,
    notifier: Arc<dyn ResetNotifier>,
}

impl PasswordResetService {
    pub fn new(
        store: Arc<dyn RecordStore>,
        hasher: Arc<dyn CredentialHasher>,
        clock: Arc<dyn Clock>,
        policy: ResetPolicy,
        publisher: Arc<EventPublisher>,
        notifier: Arc<dyn ResetNotifier>,
    ) -> Self {
        Self {
            store,
            hasher,
            clock,
            policy,
            publisher,
            notifier,
        }
    }

    pub fn policy(&self) -> &ResetPolicy {
        &self.policy
    }

    /// Issue (or re-issue) a reset token for an active user.
    #[instrument(skip(self), err)]
    pub async fn request_reset(&self, email: &str) -> DomainResult<IssuedReset> {
        let user = self
            .store
            .find_active_by_email(email)
            .await?
            .ok_or_else(|| DomainError::not_found("email not found"))?;
        let now = self.clock.now();
        let token = self.issue(email, now).await?;

        let url = token.url(&self.policy);
        info!(email = %email, attempt = token.attempt, "reset token issued");
        self.notifier.send_reset_link(&user, &url).await;
        Ok(IssuedReset { token, url })
    }

    async fn issue(&self, email: &str, now: DateTime<Utc>) -> DomainResult<ResetToken> {
        for round in 1..=MAX_ISSUE_ROUNDS {
            match self.store.find_token_by_email(email).await? {
                Some(current) => {
                    let mut next = current.clone();
                    if let Err(err) = next.reissue(&self.policy, now) {
                        warn!(email = %email, attempt = current.attempt, "reset request rate limited");
                        return Err(err);
                    }
                    match self.store.replace_token(&current, &next).await? {
                        WriteOutcome::Written => return Ok(next),
                        WriteOutcome::Stale | WriteOutcome::Missing => {
                            debug!(email = %email, round, "reset token row changed since read; retrying");
                        }
                    }
                }
                None => {
                    let fresh = ResetToken::issue(email, &self.policy, now);
                    match self.store.insert_token(&fresh).await {
                        Ok(()) => return Ok(fresh),
                        Err(err) if err.violated(constraints::RESET_TOKEN_EMAIL_KEY) => {
                            debug!(email = %email, round, "reset token row created concurrently; retrying");
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
            }
        }
        Err(DomainError::internal("reset token row is contended, try again"))
    }

    /// Check `(email, token)`, set the new password and consume the token.
    #[instrument(skip(self, token, password, password_confirm), err)]
    pub async fn verify_and_consume(
        &self,
        email: &str,
        token: &str,
        password: &str,
        password_confirm: &str,
    ) -> DomainResult<UserRecord> {
        if password != password_confirm {
            return Err(DomainError::invalid_argument("password confirmation does not match"));
        }
        if token.is_empty() {
            return Err(DomainError::Invalid);
        }

        let mut row = self
            .store
            .find_token_by_value(token)
            .await?
            .ok_or(DomainError::Invalid)?;
        let now = self.clock.now();
        row.verify(email, token, &self.policy, now)?;

        let mut user = self
            .store
            .find_active_by_email(email)
            .await?
            .ok_or_else(|| DomainError::not_found("email not found"))?;
        self.policy.check_password(password)?;

        let digest = self
            .hasher
            .hash(password)
            .map_err(|e| DomainError::internal(e.to_string()))?;
        match self
            .store
            .update_password(user.id, &digest, now, WriteGuard::Always)
            .await?
        {
            WriteOutcome::Written => {}
            WriteOutcome::Stale | WriteOutcome::Missing => {
                return Err(DomainError::not_found("email not found"));
            }
        }
        user.password_digest = digest;
        user.updated_at = now;

        row.consume();
        self.store.update_token(&row).await?;
        info!(user_id = %user.id, "password reset");

        self.publisher.publish(&user, Method::UpdatePassword).await;
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use hrms_auth::Argon2Hasher;
    use hrms_core::{FixedClock, UserId};

    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::outbox::InMemoryOutboxStore;
    use crate::role::ServiceRole;
    use crate::services::LogNotifier;
    use crate::store::{InMemoryRecordStore, ResetTokenStore, StoreError, UserFilter, UserPage, UserStore};

    struct Fixture {
        store: Arc<InMemoryRecordStore>,
        outbox: Arc<InMemoryOutboxStore>,
        clock: Arc<FixedClock>,
        hasher: Arc<Argon2Hasher>,
        service: PasswordResetService,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(InMemoryRecordStore::new());
        let outbox = InMemoryOutboxStore::arc(64);
        // 10:00 at +7h.
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 3, 4, 3, 0, 0).unwrap()));
        let hasher = Arc::new(Argon2Hasher::with_cost(8, 1, 1).unwrap());
        let publisher = Arc::new(EventPublisher::outbox(
            "users",
            ServiceRole::Auth,
            outbox.clone(),
            clock.clone(),
        ));
        let service = PasswordResetService::new(
            store.clone(),
            hasher.clone(),
            clock.clone(),
            ResetPolicy::default().with_url_base("https://hr.example.com/reset"),
            publisher,
            Arc::new(LogNotifier),
        );

        let now = clock.now();
        store
            .create_user(&UserRecord {
                id: UserId::new(),
                name: "Eka".into(),
                email: "a@x.com".into(),
                phone: "0813".into(),
                password_digest: hasher.hash("old-secret").unwrap(),
                created_at: now,
                updated_at: now,
                deleted_at: None,
            })
            .await
            .unwrap();

        Fixture {
            store,
            outbox,
            clock,
            hasher,
            service,
        }
    }

    #[tokio::test]
    async fn unknown_email_is_not_found() {
        let f = fixture().await;
        let err = f.service.request_reset("nobody@x.com").await.unwrap_err();
        assert!(matches!(err, DomainError::NotFound(_)));
    }

    #[tokio::test]
    async fn first_request_creates_one_row() {
        let f = fixture().await;
        let issued = f.service.request_reset("a@x.com").await.unwrap();
        assert_eq!(issued.token.attempt, 1);
        assert_eq!(issued.token.tokens.len(), 30);
        assert_eq!(
            issued.url,
            format!("https://hr.example.com/reset?email=a@x.com&token={}", issued.token.tokens)
        );
        let stored = f.store.find_token_by_email("a@x.com").await.unwrap().unwrap();
        assert_eq!(stored, issued.token);
    }

    #[tokio::test]
    async fn fourth_request_same_day_is_rate_limited() {
        let f = fixture().await;
        let mut last = None;
        for n in 1..=3 {
            let issued = f.service.request_reset("a@x.com").await.unwrap();
            assert_eq!(issued.token.attempt, n);
            if let Some(prev) = &last {
                assert_eq!(issued.token.id, *prev);
            }
            last = Some(issued.token.id);
            f.clock.advance(Duration::minutes(10));
        }
        let before = f.store.find_token_by_email("a@x.com").await.unwrap().unwrap();

        let err = f.service.request_reset("a@x.com").await.unwrap_err();
        assert_eq!(err, DomainError::RateLimited("too many attempts, retry after 1 day".into()));
        let after = f.store.find_token_by_email("a@x.com").await.unwrap().unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn new_day_at_plus_seven_resets_the_counter() {
        let f = fixture().await;
        for _ in 0..3 {
            f.service.request_reset("a@x.com").await.unwrap();
        }
        // 16:59 UTC is 23:59 at +7h: same day.
        f.clock.set(Utc.with_ymd_and_hms(2024, 3, 4, 16, 59, 0).unwrap());
        assert!(f.service.request_reset("a@x.com").await.is_err());
        // 17:00 UTC is midnight at +7h: next day.
        f.clock.set(Utc.with_ymd_and_hms(2024, 3, 4, 17, 0, 0).unwrap());
        assert_eq!(f.service.request_reset("a@x.com").await.unwrap().token.attempt, 1);
    }

    #[tokio::test]
    async fn reset_end_to_end() {
        let f = fixture().await;
        let issued = f.service.request_reset("a@x.com").await.unwrap();
        let t1 = issued.token.tokens.clone();
        assert!(issued.url.contains(&format!("email=a@x.com&token={t1}")));

        f.clock.advance(Duration::minutes(30));
        let user = f
            .service
            .verify_and_consume("a@x.com", &t1, "secret1", "secret1")
            .await
            .unwrap();
        assert!(f.hasher.verify(&user.password_digest, "secret1").unwrap());
        let stored = f.store.find_active_by_email("a@x.com").await.unwrap().unwrap();
        assert_eq!(stored.password_digest, user.password_digest);
        assert_eq!(stored.updated_at, f.clock.now());

        let row = f.store.find_token_by_email("a@x.com").await.unwrap().unwrap();
        assert!(row.is_consumed());
        assert_eq!(row.attempt, 0);

        let err = f
            .service
            .verify_and_consume("a@x.com", &t1, "secret2", "secret2")
            .await
            .unwrap_err();
        assert_eq!(err, DomainError::Invalid);

        let published: Vec<Method> = f.outbox.entries().iter().map(|e| e.method).collect();
        assert_eq!(published, vec![Method::UpdatePassword]);
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let f = fixture().await;
        let issued = f.service.request_reset("a@x.com").await.unwrap();
        f.clock.advance(Duration::hours(1) + Duration::seconds(1));
        let err = f
            .service
            .verify_and_consume("a@x.com", &issued.token.tokens, "secret1", "secret1")
            .await
            .unwrap_err();
        assert_eq!(err, DomainError::Expired);
    }

    #[tokio::test]
    async fn token_for_another_email_is_invalid() {
        let f = fixture().await;
        let issued = f.service.request_reset("a@x.com").await.unwrap();
        let err = f
            .service
            .verify_and_consume("b@x.com", &issued.token.tokens, "secret1", "secret1")
            .await
            .unwrap_err();
        assert_eq!(err, DomainError::Invalid);
    }

    #[tokio::test]
    async fn password_rules() {
        let f = fixture().await;
        let issued = f.service.request_reset("a@x.com").await.unwrap();
        let t = issued.token.tokens;

        let mismatch = f
            .service
            .verify_and_consume("a@x.com", &t, "secret1", "secret2")
            .await
            .unwrap_err();
        assert!(matches!(mismatch, DomainError::InvalidArgument(_)));

        let short = f.service.verify_and_consume("a@x.com", &t, "abc", "abc").await.unwrap_err();
        assert!(matches!(short, DomainError::InvalidArgument(_)));

        // Still usable after rejected attempts.
        assert!(f.service.verify_and_consume("a@x.com", &t, "abcdef", "abcdef").await.is_ok());
    }

    #[tokio::test]
    async fn empty_token_never_matches_a_consumed_row() {
        let f = fixture().await;
        let issued = f.service.request_reset("a@x.com").await.unwrap();
        f.service
            .verify_and_consume("a@x.com", &issued.token.tokens, "secret1", "secret1")
            .await
            .unwrap();
        let err = f
            .service
            .verify_and_consume("a@x.com", "", "secret1", "secret1")
            .await
            .unwrap_err();
        assert_eq!(err, DomainError::Invalid);
    }

    /// Lets another request re-issue the row between this request's read and
    /// its write, once.
    struct InterleavedStore {
        inner: Arc<InMemoryRecordStore>,
        policy: ResetPolicy,
        now: DateTime<Utc>,
        competitor: Mutex<Option<ResetToken>>,
        raced: Mutex<bool>,
    }

    #[async_trait]
    impl UserStore for InterleavedStore {
        async fn create_user(&self, user: &UserRecord) -> Result<(), StoreError> {
            self.inner.create_user(user).await
        }

        async fn find_active_by_email(&self, email: &str) -> Result<Option<UserRecord>, StoreError> {
            self.inner.find_active_by_email(email).await
        }

        async fn find_active_by_id(&self, id: UserId) -> Result<Option<UserRecord>, StoreError> {
            self.inner.find_active_by_id(id).await
        }

        async fn find_by_id(&self, id: UserId) -> Result<Option<UserRecord>, StoreError> {
            self.inner.find_by_id(id).await
        }

        async fn list_users(&self, filter: &UserFilter) -> Result<UserPage, StoreError> {
            self.inner.list_users(filter).await
        }

        async fn update_profile(&self, user: &UserRecord, guard: WriteGuard) -> Result<WriteOutcome, StoreError> {
            self.inner.update_profile(user, guard).await
        }

        async fn update_password(
            &self,
            id: UserId,
            digest: &str,
            updated_at: DateTime<Utc>,
            guard: WriteGuard,
        ) -> Result<WriteOutcome, StoreError> {
            self.inner.update_password(id, digest, updated_at, guard).await
        }

        async fn soft_delete(
            &self,
            id: UserId,
            deleted_at: DateTime<Utc>,
            guard: WriteGuard,
        ) -> Result<WriteOutcome, StoreError> {
            self.inner.soft_delete(id, deleted_at, guard).await
        }
    }

    #[async_trait]
    impl ResetTokenStore for InterleavedStore {
        async fn find_token_by_email(&self, email: &str) -> Result<Option<ResetToken>, StoreError> {
            let read = self.inner.find_token_by_email(email).await?;
            let first = !std::mem::replace(&mut *self.raced.lock().unwrap(), true);
            if let (true, Some(row)) = (first, &read) {
                let mut other = row.clone();
                other.reissue(&self.policy, self.now).unwrap();
                self.inner.update_token(&other).await?;
                *self.competitor.lock().unwrap() = Some(other);
            }
            Ok(read)
        }

        async fn find_token_by_value(&self, value: &str) -> Result<Option<ResetToken>, StoreError> {
            self.inner.find_token_by_value(value).await
        }

        async fn insert_token(&self, token: &ResetToken) -> Result<(), StoreError> {
            self.inner.insert_token(token).await
        }

        async fn update_token(&self, token: &ResetToken) -> Result<(), StoreError> {
            self.inner.update_token(token).await
        }

        async fn replace_token(&self, current: &ResetToken, next: &ResetToken) -> Result<WriteOutcome, StoreError> {
            self.inner.replace_token(current, next).await
        }
    }

    #[tokio::test]
    async fn concurrent_requests_share_the_daily_cap() {
        let f = fixture().await;
        assert_eq!(f.service.request_reset("a@x.com").await.unwrap().token.attempt, 1);

        let racing = Arc::new(InterleavedStore {
            inner: f.store.clone(),
            policy: f.service.policy().clone(),
            now: f.clock.now(),
            competitor: Mutex::new(None),
            raced: Mutex::new(false),
        });
        let service = PasswordResetService::new(
            racing.clone(),
            f.hasher.clone(),
            f.clock.clone(),
            f.service.policy().clone(),
            Arc::new(EventPublisher::outbox("users", ServiceRole::Auth, f.outbox.clone(), f.clock.clone())),
            Arc::new(LogNotifier),
        );

        // The competitor takes attempt 2 between our read and our write.
        let issued = service.request_reset("a@x.com").await.unwrap();
        let competitor = racing.competitor.lock().unwrap().clone().unwrap();
        assert_eq!(competitor.attempt, 2);
        assert_eq!(issued.token.attempt, 3);
        assert_ne!(issued.token.tokens, competitor.tokens);
        assert_eq!(f.store.find_token_by_email("a@x.com").await.unwrap().unwrap(), issued.token);

        let err = service.request_reset("a@x.com").await.unwrap_err();
        assert!(matches!(err, DomainError::RateLimited(_)));
    }
}

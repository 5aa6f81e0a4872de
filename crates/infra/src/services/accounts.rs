//! Authoritative account operations: each commits locally, then publishes.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, instrument};

use hrms_auth::{CredentialHasher, NewUser, ProfileUpdate, SessionClaims, SessionError, SessionKeys, UserRecord};
use hrms_core::{Clock, DomainError, DomainResult, UserId};
use hrms_events::Method;

use crate::publisher::EventPublisher;
use crate::store::{RecordStore, UserFilter, UserPage, WriteGuard, WriteOutcome};

/// A signed-in session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub token: String,
    pub claims: SessionClaims,
    pub expires_at: DateTime<Utc>,
}

pub struct AccountService {
    store: Arc<dyn RecordStore>,
    hasher: Arc<dyn CredentialHasher>,
    clock: Arc<dyn Clock>,
    publisher: Arc<EventPublisher>,
    keys: SessionKeys,
    session_ttl: Duration,
    min_password_len: usize,
}

impl AccountService {
    pub fn new(
        store: Arc<dyn RecordStore>,
        hasher: Arc<dyn CredentialHasher>,
        clock: Arc<dyn Clock>,
        publisher: Arc<EventPublisher>,
        keys: SessionKeys,
        session_ttl: Duration,
        min_password_len: usize,
    ) -> Self {
        Self {
            store,
            hasher,
            clock,
            publisher,
            keys,
            session_ttl,
            min_password_len,
        }
    }

    #[instrument(skip(self, input), fields(email = %input.email), err)]
    pub async fn register(&self, input: NewUser) -> DomainResult<UserRecord> {
        input.validate(self.min_password_len)?;
        let digest = self
            .hasher
            .hash(&input.password)
            .map_err(|e| DomainError::internal(e.to_string()))?;
        let now = self.clock.now();
        let user = UserRecord {
            id: UserId::new(),
            name: input.name,
            email: input.email,
            phone: input.phone,
            password_digest: digest,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        self.store.create_user(&user).await?;
        info!(user_id = %user.id, "user registered");

        self.publisher.publish(&user, Method::CreateUser).await;
        Ok(user)
    }

    /// Wrong email and wrong password are indistinguishable.
    #[instrument(skip(self, password), err)]
    pub async fn login(&self, email: &str, password: &str) -> DomainResult<Session> {
        let user = self
            .store
            .find_active_by_email(email)
            .await?
            .ok_or(DomainError::Unauthorized)?;
        let valid = self
            .hasher
            .verify(&user.password_digest, password)
            .map_err(|e| DomainError::internal(e.to_string()))?;
        if !valid {
            return Err(DomainError::Unauthorized);
        }

        let now = self.clock.now();
        let claims = SessionClaims::for_user(&user, now, self.session_ttl);
        let token = self
            .keys
            .sign(&claims)
            .map_err(|e| DomainError::internal(e.to_string()))?;
        info!(user_id = %user.id, "user logged in");
        Ok(Session {
            token,
            claims,
            expires_at: now + self.session_ttl,
        })
    }

    /// Validate a session token from the `token` cookie.
    pub fn authenticate(&self, token: &str) -> DomainResult<SessionClaims> {
        self.keys.verify(token).map_err(|e| match e {
            SessionError::Expired | SessionError::Invalid => DomainError::Unauthorized,
            SessionError::Sign(msg) => DomainError::internal(msg),
        })
    }

    #[instrument(skip(self, update), fields(user_id = %id), err)]
    pub async fn update_profile(&self, id: UserId, update: ProfileUpdate) -> DomainResult<UserRecord> {
        update.validate()?;
        let mut user = self
            .store
            .find_active_by_id(id)
            .await?
            .ok_or_else(|| DomainError::not_found("user not found"))?;
        update.merge_into(&mut user);
        user.updated_at = self.clock.now();

        match self.store.update_profile(&user, WriteGuard::Always).await? {
            WriteOutcome::Written => {}
            WriteOutcome::Stale | WriteOutcome::Missing => return Err(DomainError::not_found("user not found")),
        }
        info!("profile updated");

        self.publisher.publish(&user, Method::UpdateUser).await;
        Ok(user)
    }

    pub async fn list_users(&self, filter: &UserFilter) -> DomainResult<UserPage> {
        Ok(self.store.list_users(filter).await?)
    }

    pub async fn get_user(&self, id: UserId) -> DomainResult<UserRecord> {
        self.store
            .find_active_by_id(id)
            .await?
            .ok_or_else(|| DomainError::not_found("user not found"))
    }

    #[instrument(skip(self), fields(user_id = %id), err)]
    pub async fn delete_user(&self, id: UserId) -> DomainResult<UserRecord> {
        let mut user = self.get_user(id).await?;
        let now = self.clock.now();
        match self.store.soft_delete(id, now, WriteGuard::Always).await? {
            WriteOutcome::Written => {}
            WriteOutcome::Stale | WriteOutcome::Missing => return Err(DomainError::not_found("user not found")),
        }
        user.deleted_at = Some(now);
        user.updated_at = now;
        info!("user deleted");

        self.publisher.publish(&user, Method::DeleteUser).await;
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hrms_auth::Argon2Hasher;
    use hrms_core::FixedClock;

    use crate::outbox::InMemoryOutboxStore;
    use crate::role::ServiceRole;
    use crate::store::{InMemoryRecordStore, UserStore};

    struct Fixture {
        store: Arc<InMemoryRecordStore>,
        outbox: Arc<InMemoryOutboxStore>,
        clock: Arc<FixedClock>,
        service: AccountService,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryRecordStore::new());
        let outbox = InMemoryOutboxStore::arc(64);
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let publisher = Arc::new(EventPublisher::outbox("users", ServiceRole::Auth, outbox.clone(), clock.clone()));
        let service = AccountService::new(
            store.clone(),
            Arc::new(Argon2Hasher::with_cost(8, 1, 1).unwrap()),
            clock.clone(),
            publisher,
            SessionKeys::from_secret(b"test-secret"),
            Duration::hours(2),
            6,
        );
        Fixture {
            store,
            outbox,
            clock,
            service,
        }
    }

    fn new_user(email: &str, phone: &str) -> NewUser {
        NewUser {
            name: "Fajar".into(),
            email: email.into(),
            phone: phone.into(),
            password: "secret1".into(),
        }
    }

    fn published(f: &Fixture) -> Vec<Method> {
        f.outbox.entries().iter().map(|e| e.method).collect()
    }

    #[tokio::test]
    async fn register_then_login() {
        let f = fixture();
        let user = f.service.register(new_user("f@x.com", "0814")).await.unwrap();
        assert_ne!(user.password_digest, "secret1");
        assert_eq!(published(&f), vec![Method::CreateUser]);

        let session = f.service.login("f@x.com", "secret1").await.unwrap();
        assert_eq!(session.claims.sub, user.id);
        assert_eq!(f.service.authenticate(&session.token).unwrap(), session.claims);

        assert_eq!(
            f.service.login("f@x.com", "wrong-pass").await.unwrap_err(),
            DomainError::Unauthorized
        );
        assert_eq!(
            f.service.login("nobody@x.com", "secret1").await.unwrap_err(),
            DomainError::Unauthorized
        );
        assert_eq!(f.service.authenticate("garbage").unwrap_err(), DomainError::Unauthorized);
    }

    #[tokio::test]
    async fn duplicate_email_is_a_conflict() {
        let f = fixture();
        f.service.register(new_user("dup@x.com", "1")).await.unwrap();
        let err = f.service.register(new_user("dup@x.com", "2")).await.unwrap_err();
        assert_eq!(err, DomainError::Conflict("email already exists".into()));
        assert_eq!(published(&f).len(), 1);
    }

    #[tokio::test]
    async fn profile_update_keeps_blank_fields_and_publishes() {
        let f = fixture();
        let user = f.service.register(new_user("p@x.com", "0815")).await.unwrap();
        f.clock.advance(Duration::seconds(5));

        let updated = f
            .service
            .update_profile(
                user.id,
                ProfileUpdate {
                    name: "Fajar Nugraha".into(),
                    ..ProfileUpdate::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.name, "Fajar Nugraha");
        assert_eq!(updated.email, "p@x.com");
        assert_eq!(updated.updated_at, f.clock.now());
        assert_eq!(published(&f), vec![Method::CreateUser, Method::UpdateUser]);

        let other = f.service.register(new_user("q@x.com", "0816")).await.unwrap();
        let err = f
            .service
            .update_profile(
                other.id,
                ProfileUpdate {
                    phone: "0815".into(),
                    ..ProfileUpdate::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err, DomainError::Conflict("phone already exists".into()));
    }

    #[tokio::test]
    async fn delete_hides_the_user_and_frees_the_email() {
        let f = fixture();
        let user = f.service.register(new_user("r@x.com", "0817")).await.unwrap();
        let deleted = f.service.delete_user(user.id).await.unwrap();
        assert!(deleted.is_deleted());
        assert!(matches!(f.service.get_user(user.id).await, Err(DomainError::NotFound(_))));
        assert!(f.store.find_by_id(user.id).await.unwrap().unwrap().is_deleted());
        assert_eq!(published(&f), vec![Method::CreateUser, Method::DeleteUser]);

        assert!(f.service.register(new_user("r@x.com", "0817")).await.is_ok());
    }

    #[tokio::test]
    async fn listing_filters_deleted() {
        let f = fixture();
        let a = f.service.register(new_user("s1@x.com", "1")).await.unwrap();
        f.service.register(new_user("s2@x.com", "2")).await.unwrap();
        f.service.delete_user(a.id).await.unwrap();

        let active = f.service.list_users(&UserFilter::default()).await.unwrap();
        assert_eq!(active.total, 1);
        let all = f
            .service
            .list_users(&UserFilter {
                show_deleted: true,
                ..UserFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(all.total, 2);
    }
}

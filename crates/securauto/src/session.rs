//! Admin authentication and session management
//!
//! Login compares the SHA-256 of the submitted password with the hash stored
//! on the admin's credential document. A successful login yields an
//! [`AdminSession`] that is cached in memory and persisted to local storage
//! so it survives a restart; sessions expire 24 hours after capture.
//!
//! Hashes are single-round, unsalted SHA-256 in hex. That is the format of
//! the existing credential documents, so it is kept as-is.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit;
use crate::error::AdminError;
use crate::realtime::Realtime;
use crate::storage::LocalStorage;
use crate::store::{DocumentStore, Query};
use crate::types::{collections, AdminCredential, AdminProfile, AdminRole, AuditAction};

/// Sessions older than this are rejected
pub const SESSION_TTL_HOURS: i64 = 24;

const SESSION_KEY_PREFIX: &str = "session:";

/// Hex-encoded SHA-256 of the password's UTF-8 bytes
pub fn hash_password(password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

/// An authenticated admin, handed explicitly to every screen
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AdminSession {
    pub id: Uuid,

    /// Id of the admin's credential document
    pub credential_id: String,

    pub admin: AdminProfile,
    pub captured_at: DateTime<Utc>,
}

impl AdminSession {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.captured_at >= Duration::hours(SESSION_TTL_HOURS)
    }

    pub fn legion(&self) -> Option<&str> {
        self.admin.legion()
    }
}

fn storage_key(id: Uuid) -> String {
    format!("{}{}", SESSION_KEY_PREFIX, id)
}

pub struct AuthManager {
    store: Arc<DocumentStore>,
    storage: LocalStorage,
    realtime: Arc<Realtime>,
    sessions: RwLock<HashMap<Uuid, AdminSession>>,
}

impl AuthManager {
    pub fn new(store: Arc<DocumentStore>, storage: LocalStorage, realtime: Arc<Realtime>) -> Self {
        Self {
            store,
            storage,
            realtime,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Authenticate an admin by email and password
    pub async fn login(
        &self,
        email: &str,
        password: &str,
        now: DateTime<Utc>,
    ) -> Result<AdminSession, AdminError> {
        let email = email.trim();
        let query = Query::new(collections::ADMINS).where_eq("email", email).limit(1);
        let (credential_id, credential) = self
            .store
            .query_as::<AdminCredential>(&query)?
            .into_iter()
            .next()
            .ok_or(AdminError::NotFound)?;

        if !credential.active {
            warn!(email = %email, "Login attempt on disabled account");
            return Err(AdminError::Disabled);
        }

        if hash_password(password) != credential.password_hash {
            warn!(email = %email, "Login attempt with wrong password");
            return Err(AdminError::Unauthorized);
        }

        let mut fields = Map::new();
        fields.insert("lastLogin".to_string(), json!(now));
        self.store.update(collections::ADMINS, &credential_id, fields)?;
        audit::record(&self.store, email, AuditAction::Login, None, now)?;

        let mut admin = credential.profile();
        admin.last_login = Some(now);

        let session = AdminSession {
            id: Uuid::new_v4(),
            credential_id,
            admin,
            captured_at: now,
        };

        self.storage.set(&storage_key(session.id), &session)?;
        self.sessions.write().await.insert(session.id, session.clone());

        info!(email = %email, session = %session.id, "Admin logged in");
        Ok(session)
    }

    /// Restore one persisted session if it is younger than 24 hours.
    /// Expired sessions are removed from storage.
    pub async fn restore_session(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<AdminSession>, AdminError> {
        let key = storage_key(id);
        let Some(session) = self.storage.get::<AdminSession>(&key)? else {
            return Ok(None);
        };

        if session.is_expired(now) {
            self.storage.remove(&key)?;
            debug!(session = %id, "Discarded expired session");
            return Ok(None);
        }

        self.sessions.write().await.insert(id, session.clone());
        Ok(Some(session))
    }

    /// Restore every persisted session. Run once at startup, before serving.
    pub async fn restore_sessions(&self, now: DateTime<Utc>) -> Result<usize, AdminError> {
        let mut restored = 0;
        for key in self.storage.keys_with_prefix(SESSION_KEY_PREFIX)? {
            let id = match key[SESSION_KEY_PREFIX.len()..].parse::<Uuid>() {
                Ok(id) => id,
                Err(_) => {
                    warn!(key = %key, "Dropping malformed session key");
                    self.storage.remove(&key)?;
                    continue;
                }
            };
            if self.restore_session(id, now).await?.is_some() {
                restored += 1;
            }
        }
        info!(restored = restored, "Sessions restored");
        Ok(restored)
    }

    /// True iff the session is cached in memory
    pub async fn is_authenticated(&self, id: Uuid) -> bool {
        self.sessions.read().await.contains_key(&id)
    }

    /// The cached session, if present and not expired
    pub async fn current(&self, id: Uuid, now: DateTime<Utc>) -> Option<AdminSession> {
        let session = self.sessions.read().await.get(&id).cloned()?;
        if !session.is_expired(now) {
            return Some(session);
        }

        self.sessions.write().await.remove(&id);
        self.realtime.unsubscribe_session(id);
        if let Err(e) = self.storage.remove(&storage_key(id)) {
            warn!(session = %id, error = %e, "Failed to remove expired session");
        }
        None
    }

    /// Replace the cached profile of a live session.
    /// The persisted copy is left alone until the next login.
    pub async fn refresh_profile(&self, id: Uuid, admin: AdminProfile) -> bool {
        match self.sessions.write().await.get_mut(&id) {
            Some(session) => {
                session.admin = admin;
                true
            }
            None => false,
        }
    }

    /// Detach the session's listeners and forget it everywhere
    pub async fn logout(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), AdminError> {
        let detached = self.realtime.unsubscribe_session(id);
        let session = self.sessions.write().await.remove(&id);
        self.storage.remove(&storage_key(id))?;

        if let Some(session) = session {
            audit::record(&self.store, &session.admin.email, AuditAction::Logout, None, now)?;
            info!(email = %session.admin.email, listeners = detached, "Admin logged out");
        }
        Ok(())
    }
}

/// Fields for provisioning an admin account out-of-band
#[derive(Debug, Clone)]
pub struct NewAdmin {
    pub email: String,
    pub password: String,
    pub display_name: String,
    pub role: AdminRole,
    pub legion: Option<String>,
    pub permissions: BTreeMap<String, bool>,
}

/// Create an admin credential document, returning its id
pub fn create_admin(
    store: &DocumentStore,
    admin: NewAdmin,
    now: DateTime<Utc>,
) -> Result<String, AdminError> {
    let email = admin.email.trim();
    if email.is_empty() {
        return Err(AdminError::Validation("L'email est obligatoire".to_string()));
    }
    if admin.password.chars().count() < 8 {
        return Err(AdminError::WeakPassword);
    }
    let legion = admin
        .legion
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty());
    if admin.role == AdminRole::LegionAdmin && legion.is_none() {
        return Err(AdminError::Validation(
            "Un administrateur de légion doit avoir une légion".to_string(),
        ));
    }

    let existing = Query::new(collections::ADMINS).where_eq("email", email);
    if store.exists(&existing)? {
        return Err(AdminError::Validation(format!(
            "Un administrateur avec l'email {} existe déjà",
            email
        )));
    }

    let credential = AdminCredential {
        email: email.to_string(),
        password_hash: hash_password(&admin.password),
        display_name: admin.display_name.trim().to_string(),
        role: admin.role,
        legion,
        permissions: admin.permissions,
        active: true,
        last_login: None,
        created_at: now,
    };
    let id = store.add(collections::ADMINS, &credential)?;
    info!(email = %email, role = %credential.role, "Admin account created");
    Ok(id)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    pub(crate) fn legion_admin(email: &str, password: &str) -> NewAdmin {
        NewAdmin {
            email: email.to_string(),
            password: password.to_string(),
            display_name: "Chef Dakar".to_string(),
            role: AdminRole::LegionAdmin,
            legion: Some("Dakar".to_string()),
            permissions: BTreeMap::new(),
        }
    }

    pub(crate) fn global_admin(email: &str, password: &str) -> NewAdmin {
        NewAdmin {
            email: email.to_string(),
            password: password.to_string(),
            display_name: "Direction".to_string(),
            role: AdminRole::GlobalAdmin,
            legion: None,
            permissions: BTreeMap::new(),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 2, 10, 9, 0, 0).unwrap()
    }

    struct Fixture {
        _temp_dir: TempDir,
        store: Arc<DocumentStore>,
        realtime: Arc<Realtime>,
        auth: AuthManager,
    }

    fn fixture() -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(DocumentStore::open_in_memory().unwrap());
        let realtime = Arc::new(Realtime::new(Arc::clone(&store)));
        let auth = AuthManager::new(
            Arc::clone(&store),
            LocalStorage::new(temp_dir.path().join("sessions.json")),
            Arc::clone(&realtime),
        );
        Fixture {
            _temp_dir: temp_dir,
            store,
            realtime,
            auth,
        }
    }

    fn reopen(fixture: &Fixture) -> AuthManager {
        AuthManager::new(
            Arc::clone(&fixture.store),
            LocalStorage::new(fixture._temp_dir.path().join("sessions.json")),
            Arc::clone(&fixture.realtime),
        )
    }

    // ========== hash_password tests ==========

    #[test]
    fn test_hash_password_known_vector() {
        assert_eq!(
            hash_password("password"),
            "5e884898da28047151d0e56f8dc6292773603d0d6aabbdd62a11ef721d1542d8"
        );
    }

    #[test]
    fn test_hash_password_utf8() {
        let hash = hash_password("mötdepasse");
        assert_eq!(hash.len(), 64);
        assert_ne!(hash, hash_password("motdepasse"));
    }

    // ========== login tests ==========

    #[tokio::test]
    async fn test_login_success() {
        let fx = fixture();
        let id = create_admin(&fx.store, legion_admin("chef@securauto.sn", "secret123"), now()).unwrap();

        let session = fx.auth.login("chef@securauto.sn", "secret123", now()).await.unwrap();

        assert_eq!(session.credential_id, id);
        assert_eq!(session.admin.email, "chef@securauto.sn");
        assert_eq!(session.captured_at, now());
        assert!(fx.auth.is_authenticated(session.id).await);
    }

    #[tokio::test]
    async fn test_login_trims_email() {
        let fx = fixture();
        create_admin(&fx.store, legion_admin("chef@securauto.sn", "secret123"), now()).unwrap();

        assert!(fx.auth.login("  chef@securauto.sn ", "secret123", now()).await.is_ok());
    }

    #[tokio::test]
    async fn test_login_unknown_email() {
        let fx = fixture();
        let result = fx.auth.login("ghost@securauto.sn", "secret123", now()).await;
        assert!(matches!(result, Err(AdminError::NotFound)));
    }

    #[tokio::test]
    async fn test_login_wrong_password() {
        let fx = fixture();
        create_admin(&fx.store, legion_admin("chef@securauto.sn", "secret123"), now()).unwrap();

        let result = fx.auth.login("chef@securauto.sn", "wrong-password", now()).await;
        assert!(matches!(result, Err(AdminError::Unauthorized)));
    }

    #[tokio::test]
    async fn test_login_disabled_account() {
        let fx = fixture();
        let id = create_admin(&fx.store, legion_admin("chef@securauto.sn", "secret123"), now()).unwrap();
        let mut fields = Map::new();
        fields.insert("active".to_string(), json!(false));
        fx.store.update(collections::ADMINS, &id, fields).unwrap();

        // Disabled wins even with the right password
        let result = fx.auth.login("chef@securauto.sn", "secret123", now()).await;
        assert!(matches!(result, Err(AdminError::Disabled)));
    }

    #[tokio::test]
    async fn test_login_stamps_last_login_and_audits() {
        let fx = fixture();
        let id = create_admin(&fx.store, legion_admin("chef@securauto.sn", "secret123"), now()).unwrap();

        fx.auth.login("chef@securauto.sn", "secret123", now()).await.unwrap();

        let cred: AdminCredential = fx.store.get(collections::ADMINS, &id).unwrap().unwrap().decode().unwrap();
        assert_eq!(cred.last_login, Some(now()));
        assert_eq!(audit::login_history(&fx.store, "chef@securauto.sn", 10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_login_leaves_no_session() {
        let fx = fixture();
        create_admin(&fx.store, legion_admin("chef@securauto.sn", "secret123"), now()).unwrap();
        let _ = fx.auth.login("chef@securauto.sn", "nope-nope", now()).await;

        assert_eq!(reopen(&fx).restore_sessions(now()).await.unwrap(), 0);
        assert_eq!(audit::total_count(&fx.store, "chef@securauto.sn").unwrap(), 0);
    }

    // ========== restore tests ==========

    #[tokio::test]
    async fn test_restore_session_fresh() {
        let fx = fixture();
        create_admin(&fx.store, legion_admin("chef@securauto.sn", "secret123"), now()).unwrap();
        let session = fx.auth.login("chef@securauto.sn", "secret123", now()).await.unwrap();

        let restarted = reopen(&fx);
        assert!(!restarted.is_authenticated(session.id).await);

        let later = now() + Duration::hours(23) + Duration::minutes(59);
        let restored = restarted.restore_session(session.id, later).await.unwrap();
        assert_eq!(restored.as_ref().map(|s| s.id), Some(session.id));
        assert!(restarted.is_authenticated(session.id).await);
    }

    #[tokio::test]
    async fn test_restore_session_expired_at_24_hours() {
        let fx = fixture();
        create_admin(&fx.store, legion_admin("chef@securauto.sn", "secret123"), now()).unwrap();
        let session = fx.auth.login("chef@securauto.sn", "secret123", now()).await.unwrap();

        let restarted = reopen(&fx);
        let later = now() + Duration::hours(24);
        assert!(restarted.restore_session(session.id, later).await.unwrap().is_none());
        assert!(!restarted.is_authenticated(session.id).await);

        // The stale session is purged from storage
        assert!(restarted.restore_session(session.id, now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_restore_sessions_counts_fresh_only() {
        let fx = fixture();
        create_admin(&fx.store, legion_admin("chef@securauto.sn", "secret123"), now()).unwrap();
        fx.auth.login("chef@securauto.sn", "secret123", now()).await.unwrap();
        let later = now() + Duration::hours(12);
        fx.auth.login("chef@securauto.sn", "secret123", later).await.unwrap();

        let restarted = reopen(&fx);
        let restored = restarted
            .restore_sessions(now() + Duration::hours(30))
            .await
            .unwrap();
        assert_eq!(restored, 1);
    }

    #[tokio::test]
    async fn test_current_expires_in_memory_session() {
        let fx = fixture();
        create_admin(&fx.store, legion_admin("chef@securauto.sn", "secret123"), now()).unwrap();
        let session = fx.auth.login("chef@securauto.sn", "secret123", now()).await.unwrap();

        assert!(fx.auth.current(session.id, now() + Duration::hours(1)).await.is_some());
        assert!(fx.auth.current(session.id, now() + Duration::hours(25)).await.is_none());
        assert!(!fx.auth.is_authenticated(session.id).await);
    }

    // ========== logout tests ==========

    #[tokio::test]
    async fn test_logout_clears_everything() {
        let fx = fixture();
        create_admin(&fx.store, legion_admin("chef@securauto.sn", "secret123"), now()).unwrap();
        let session = fx.auth.login("chef@securauto.sn", "secret123", now()).await.unwrap();
        let _listener = fx
            .realtime
            .subscribe(Some(&session), Query::new(collections::DETECTIONS), |_| {});
        assert_eq!(fx.realtime.active_count(), 1);

        fx.auth.logout(session.id, now()).await.unwrap();

        assert!(!fx.auth.is_authenticated(session.id).await);
        assert_eq!(fx.realtime.active_count(), 0);
        assert!(reopen(&fx).restore_session(session.id, now()).await.unwrap().is_none());
        let last = audit::last_action(&fx.store, "chef@securauto.sn").unwrap().unwrap();
        assert_eq!(last.action, AuditAction::Logout);
    }

    #[tokio::test]
    async fn test_logout_unknown_session_is_noop() {
        let fx = fixture();
        assert!(fx.auth.logout(Uuid::new_v4(), now()).await.is_ok());
    }

    #[tokio::test]
    async fn test_refresh_profile_memory_only() {
        let fx = fixture();
        create_admin(&fx.store, legion_admin("chef@securauto.sn", "secret123"), now()).unwrap();
        let session = fx.auth.login("chef@securauto.sn", "secret123", now()).await.unwrap();

        let mut profile = session.admin.clone();
        profile.display_name = "Nouveau Nom".to_string();
        assert!(fx.auth.refresh_profile(session.id, profile).await);

        let cached = fx.auth.current(session.id, now()).await.unwrap();
        assert_eq!(cached.admin.display_name, "Nouveau Nom");

        let persisted = reopen(&fx).restore_session(session.id, now()).await.unwrap().unwrap();
        assert_eq!(persisted.admin.display_name, "Chef Dakar");
    }

    // ========== create_admin tests ==========

    #[test]
    fn test_create_admin_rejects_duplicates() {
        let store = DocumentStore::open_in_memory().unwrap();
        create_admin(&store, global_admin("dir@securauto.sn", "secret123"), now()).unwrap();

        let result = create_admin(&store, global_admin("dir@securauto.sn", "other-secret"), now());
        assert!(matches!(result, Err(AdminError::Validation(_))));
    }

    #[test]
    fn test_create_admin_legion_admin_needs_legion() {
        let store = DocumentStore::open_in_memory().unwrap();
        let mut admin = legion_admin("chef@securauto.sn", "secret123");
        admin.legion = Some("  ".to_string());

        assert!(matches!(
            create_admin(&store, admin, now()),
            Err(AdminError::Validation(_))
        ));
    }

    #[test]
    fn test_create_admin_weak_password() {
        let store = DocumentStore::open_in_memory().unwrap();
        assert!(matches!(
            create_admin(&store, global_admin("dir@securauto.sn", "short"), now()),
            Err(AdminError::WeakPassword)
        ));
    }
}

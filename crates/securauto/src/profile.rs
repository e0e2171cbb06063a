//! Profile screen: own account details, activity and credential changes

use chrono::{DateTime, Utc};
use serde_json::{json, Map};
use tracing::{info, warn};

use crate::audit;
use crate::error::AdminError;
use crate::session::{hash_password, AdminSession, AuthManager};
use crate::store::{DocumentStore, Query};
use crate::types::{collections, AdminCredential, AdminProfile, AuditAction, AuditEntry};

/// Minimum length of a new password, in characters
pub const MIN_PASSWORD_LEN: usize = 8;

/// Logins shown in the history table
pub const LOGIN_HISTORY_LIMIT: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct ProfileView {
    pub profile: AdminProfile,
    pub login_history: Vec<AuditEntry>,
    pub monthly_logins: usize,
    pub total_actions: usize,
    pub last_action: Option<AuditEntry>,
}

/// Load the signed-in admin's own profile and activity statistics
pub fn load_profile(
    store: &DocumentStore,
    session: Option<&AdminSession>,
    now: DateTime<Utc>,
) -> Result<ProfileView, AdminError> {
    let session = session.ok_or(AdminError::AccessDenied)?;
    let email = session.admin.email.as_str();

    let query = Query::new(collections::ADMINS).where_eq("email", email).limit(1);
    let (_, credential) = store
        .query_as::<AdminCredential>(&query)?
        .into_iter()
        .next()
        .ok_or(AdminError::NotFound)?;

    Ok(ProfileView {
        profile: credential.profile(),
        login_history: audit::login_history(store, email, LOGIN_HISTORY_LIMIT)?,
        monthly_logins: audit::monthly_login_count(store, email, now)?,
        total_actions: audit::total_count(store, email)?,
        last_action: audit::last_action(store, email)?,
    })
}

fn load_credential(store: &DocumentStore, session: &AdminSession) -> Result<AdminCredential, AdminError> {
    let doc = store
        .get(collections::ADMINS, &session.credential_id)?
        .ok_or(AdminError::NotFound)?;
    Ok(doc.decode()?)
}

/// Rename the admin. Only the in-memory session is refreshed; the persisted
/// session keeps the old name until the next login.
pub async fn update_display_name(
    store: &DocumentStore,
    auth: &AuthManager,
    session: &AdminSession,
    name: &str,
    now: DateTime<Utc>,
) -> Result<AdminProfile, AdminError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(AdminError::Validation("Le nom d'affichage est obligatoire".to_string()));
    }

    let mut fields = Map::new();
    fields.insert("displayName".to_string(), json!(name));
    if !store.update(collections::ADMINS, &session.credential_id, fields)? {
        return Err(AdminError::NotFound);
    }

    let mut profile = session.admin.clone();
    profile.display_name = name.to_string();
    if !auth.refresh_profile(session.id, profile.clone()).await {
        warn!(session = %session.id, "Renamed admin has no cached session");
    }

    audit::record(store, &session.admin.email, AuditAction::UpdateProfile, None, now)?;
    info!(email = %session.admin.email, "Display name updated");
    Ok(profile)
}

/// Replace the admin's password after checking the current one
pub fn change_password(
    store: &DocumentStore,
    session: &AdminSession,
    current: &str,
    new: &str,
    confirm: &str,
    now: DateTime<Utc>,
) -> Result<(), AdminError> {
    if new != confirm {
        return Err(AdminError::Mismatch);
    }
    if new.chars().count() < MIN_PASSWORD_LEN {
        return Err(AdminError::WeakPassword);
    }

    let credential = load_credential(store, session)?;
    if hash_password(current) != credential.password_hash {
        warn!(email = %session.admin.email, "Password change with wrong current password");
        return Err(AdminError::Unauthorized);
    }

    let mut fields = Map::new();
    fields.insert("passwordHash".to_string(), json!(hash_password(new)));
    store.update(collections::ADMINS, &session.credential_id, fields)?;

    audit::record(store, &session.admin.email, AuditAction::ChangePassword, None, now)?;
    info!(email = %session.admin.email, "Password changed");
    Ok(())
}

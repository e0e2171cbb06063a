//! Admin activity log
//!
//! Every login and every mutating admin action appends an entry to the
//! `admin_audit_logs` collection. The profile page reads it back for login
//! history and activity statistics.

use chrono::{DateTime, Datelike, TimeZone, Utc};
use tracing::debug;

use crate::store::{Direction, DocumentStore, FilterOp, Query, StoreError};
use crate::types::{collections, AuditAction, AuditEntry};

/// Append an entry to the activity log
pub fn record(
    store: &DocumentStore,
    admin_email: &str,
    action: AuditAction,
    details: Option<String>,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let entry = AuditEntry {
        admin_email: admin_email.to_string(),
        action,
        timestamp: now,
        details,
    };
    store.add(collections::AUDIT_LOGS, &entry)?;
    debug!(admin = %admin_email, action = action.as_str(), "Audit entry recorded");
    Ok(())
}

fn for_admin(admin_email: &str) -> Query {
    Query::new(collections::AUDIT_LOGS).where_eq("adminEmail", admin_email)
}

/// Most recent successful logins, newest first
pub fn login_history(
    store: &DocumentStore,
    admin_email: &str,
    limit: usize,
) -> Result<Vec<AuditEntry>, StoreError> {
    let query = for_admin(admin_email)
        .where_eq("action", AuditAction::Login.as_str())
        .order_by("timestamp", Direction::Desc)
        .limit(limit);
    decode_all(store, &query)
}

/// Number of logins since the first day of the current month
pub fn monthly_login_count(
    store: &DocumentStore,
    admin_email: &str,
    now: DateTime<Utc>,
) -> Result<usize, StoreError> {
    let query = for_admin(admin_email)
        .where_eq("action", AuditAction::Login.as_str())
        .filter("timestamp", FilterOp::Gte, start_of_month(now).to_rfc3339());
    store.count(&query)
}

/// Total number of entries recorded for this admin
pub fn total_count(store: &DocumentStore, admin_email: &str) -> Result<usize, StoreError> {
    store.count(&for_admin(admin_email))
}

/// The most recent entry that is not a login
pub fn last_action(
    store: &DocumentStore,
    admin_email: &str,
) -> Result<Option<AuditEntry>, StoreError> {
    let query = for_admin(admin_email)
        .filter("action", FilterOp::Ne, AuditAction::Login.as_str())
        .order_by("timestamp", Direction::Desc)
        .limit(1);
    Ok(decode_all(store, &query)?.into_iter().next())
}

fn decode_all(store: &DocumentStore, query: &Query) -> Result<Vec<AuditEntry>, StoreError> {
    Ok(store
        .query_as::<AuditEntry>(query)?
        .into_iter()
        .map(|(_, entry)| entry)
        .collect())
}

fn start_of_month(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(now)
}

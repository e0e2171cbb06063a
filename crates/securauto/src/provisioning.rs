//! Approved-user provisioning
//!
//! Users are added one at a time from the form or in bulk from a
//! spreadsheet. The matricule is the natural key: an insert is refused when
//! a user with the same matricule already exists. The check is a plain read
//! before the write, so two concurrent submissions (or two rows of the same
//! import) can still both land.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::audit;
use crate::error::AdminError;
use crate::parser::SheetRow;
use crate::session::AdminSession;
use crate::store::{Direction, DocumentStore, Query, WriteBatch};
use crate::types::{collections, ApprovedUser, AuditAction};

/// Fields submitted for a new approved user
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct NewUser {
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub matricule: String,
    #[serde(default)]
    pub assignment: String,
}

impl NewUser {
    pub fn trimmed(&self) -> NewUser {
        NewUser {
            first_name: self.first_name.trim().to_string(),
            last_name: self.last_name.trim().to_string(),
            matricule: self.matricule.trim().to_string(),
            assignment: self.assignment.trim().to_string(),
        }
    }

    pub fn is_blank(&self) -> bool {
        [&self.first_name, &self.last_name, &self.matricule, &self.assignment]
            .iter()
            .all(|f| f.trim().is_empty())
    }

    /// Fail on the first blank required field
    pub fn validate(&self) -> Result<(), AdminError> {
        let required = [
            (&self.first_name, "prénom"),
            (&self.last_name, "nom"),
            (&self.matricule, "matricule"),
            (&self.assignment, "lieu d'affectation"),
        ];
        for (value, label) in required {
            if value.trim().is_empty() {
                return Err(AdminError::Validation(format!(
                    "Le champ {} est obligatoire",
                    label
                )));
            }
        }
        Ok(())
    }

    fn into_approved(self, created_by: &str, now: DateTime<Utc>) -> ApprovedUser {
        ApprovedUser::new(
            &self.first_name,
            &self.last_name,
            &self.matricule,
            &self.assignment,
            created_by,
            now,
        )
    }
}

/// Whether an approved user with this matricule exists
pub fn matricule_exists(store: &DocumentStore, matricule: &str) -> Result<bool, AdminError> {
    let query = Query::new(collections::APPROVED_USERS).where_eq("matricule", matricule.trim());
    Ok(store.exists(&query)?)
}

/// Add one approved user from the form
pub fn add_single_user(
    store: &DocumentStore,
    session: &AdminSession,
    fields: &NewUser,
    now: DateTime<Utc>,
) -> Result<ApprovedUser, AdminError> {
    fields.validate()?;
    let fields = fields.trimmed();

    if matricule_exists(store, &fields.matricule)? {
        return Err(AdminError::Duplicate(fields.matricule));
    }

    let user = fields.into_approved(&session.admin.email, now);
    store.add(collections::APPROVED_USERS, &user)?;
    audit::record(
        store,
        &session.admin.email,
        AuditAction::CreateUser,
        Some(user.matricule.clone()),
        now,
    )?;

    info!(matricule = %user.matricule, admin = %session.admin.email, "Approved user added");
    Ok(user)
}

/// Why one import row was skipped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowError {
    pub line: usize,
    pub message: String,
}

/// Outcome of a bulk import
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub imported: usize,
    pub errors: usize,
    pub row_errors: Vec<RowError>,
}

/// Import parsed spreadsheet rows.
///
/// Each row is validated and checked against existing matricules on its own;
/// failing rows are skipped and counted. Every passing row is written in a
/// single atomic commit, so a commit failure fails the whole import.
pub fn import_batch(
    store: &DocumentStore,
    session: &AdminSession,
    rows: &[SheetRow],
    now: DateTime<Utc>,
) -> Result<ImportReport, AdminError> {
    let mut report = ImportReport::default();
    let mut batch = WriteBatch::new();

    for row in rows {
        let outcome = row.user.validate().and_then(|_| {
            let fields = row.user.trimmed();
            if matricule_exists(store, &fields.matricule)? {
                return Err(AdminError::Duplicate(fields.matricule));
            }
            Ok(fields)
        });

        match outcome {
            Ok(fields) => {
                let user = fields.into_approved(&session.admin.email, now);
                batch.add(collections::APPROVED_USERS, &user)?;
            }
            Err(AdminError::Store(e)) => return Err(AdminError::Store(e)),
            Err(e) => {
                debug!(line = row.line, error = %e, "Skipping import row");
                report.errors += 1;
                report.row_errors.push(RowError {
                    line: row.line,
                    message: e.to_string(),
                });
            }
        }
    }

    report.imported = batch.len();
    if !batch.is_empty() {
        store.commit(batch)?;
    }

    audit::record(
        store,
        &session.admin.email,
        AuditAction::ImportUsers,
        Some(format!("{} importés, {} erreurs", report.imported, report.errors)),
        now,
    )?;

    if report.errors > 0 {
        warn!(imported = report.imported, errors = report.errors, "Import finished with errors");
    } else {
        info!(imported = report.imported, "Import finished");
    }
    Ok(report)
}

/// Approved users, most recently created first
pub fn list_users(store: &DocumentStore, limit: usize) -> Result<Vec<ApprovedUser>, AdminError> {
    let query = Query::new(collections::APPROVED_USERS)
        .order_by("createdAt", Direction::Desc)
        .limit(limit);
    Ok(store
        .query_as::<ApprovedUser>(&query)?
        .into_iter()
        .map(|(_, user)| user)
        .collect())
}

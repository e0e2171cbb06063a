use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Collection names used in the document store
pub mod collections {
    pub const ADMINS: &str = "admins";
    pub const APPROVED_USERS: &str = "approved_users";
    pub const DETECTIONS: &str = "detections";
    pub const STOLEN_VEHICLES: &str = "stolen_vehicles";
    pub const VEHICLE_CHECKS: &str = "vehicle_checks";
    pub const AUDIT_LOGS: &str = "admin_audit_logs";
}

/// Status given to every user provisioned from the dashboard
pub const APPROVED_STATUS: &str = "approved";

/// Label for stolen vehicles whose status is missing
pub const UNKNOWN_STATUS: &str = "Inconnu";

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AdminRole {
    GlobalAdmin,
    LegionAdmin,
}

impl AdminRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdminRole::GlobalAdmin => "global_admin",
            AdminRole::LegionAdmin => "legion_admin",
        }
    }

    /// Human-readable label shown on the profile page
    pub fn label(&self) -> &'static str {
        match self {
            AdminRole::GlobalAdmin => "Administrateur global",
            AdminRole::LegionAdmin => "Administrateur de légion",
        }
    }
}

impl fmt::Display for AdminRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AdminRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "global_admin" => Ok(AdminRole::GlobalAdmin),
            "legion_admin" => Ok(AdminRole::LegionAdmin),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// Admin credential document as stored in the `admins` collection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AdminCredential {
    pub email: String,

    /// Hex-encoded SHA-256 of the password
    pub password_hash: String,

    #[serde(default)]
    pub display_name: String,

    pub role: AdminRole,

    #[serde(default)]
    pub legion: Option<String>,

    #[serde(default)]
    pub permissions: BTreeMap<String, bool>,

    #[serde(default = "default_true")]
    pub active: bool,

    #[serde(default)]
    pub last_login: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
}

impl AdminCredential {
    /// Snapshot of this credential without the password hash
    pub fn profile(&self) -> AdminProfile {
        AdminProfile {
            email: self.email.clone(),
            display_name: self.display_name.clone(),
            role: self.role,
            legion: self.legion.clone(),
            permissions: self.permissions.clone(),
            active: self.active,
            last_login: self.last_login,
            created_at: self.created_at,
        }
    }
}

/// Admin profile cached in the session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AdminProfile {
    pub email: String,
    pub display_name: String,
    pub role: AdminRole,
    pub legion: Option<String>,
    #[serde(default)]
    pub permissions: BTreeMap<String, bool>,
    pub active: bool,
    pub last_login: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl AdminProfile {
    /// Name to greet the admin with, falling back to the email
    pub fn name(&self) -> &str {
        if self.display_name.trim().is_empty() {
            &self.email
        } else {
            &self.display_name
        }
    }

    /// Legion this admin is scoped to, if any
    pub fn legion(&self) -> Option<&str> {
        self.legion.as_deref().filter(|l| !l.trim().is_empty())
    }
}

/// A person authorised to use the mobile detection client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ApprovedUser {
    pub first_name: String,
    pub last_name: String,
    pub matricule: String,
    pub assignment: String,
    pub display_name: String,
    pub created_at: DateTime<Utc>,

    /// Email of the admin who provisioned the user
    pub created_by: String,

    pub status: String,
    pub active: bool,
}

impl ApprovedUser {
    pub fn new(
        first_name: &str,
        last_name: &str,
        matricule: &str,
        assignment: &str,
        created_by: &str,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            matricule: matricule.to_string(),
            assignment: assignment.to_string(),
            display_name: format!("{} {}", first_name, last_name),
            created_at,
            created_by: created_by.to_string(),
            status: APPROVED_STATUS.to_string(),
            active: true,
        }
    }
}

/// A lookup logged by the mobile client against the stolen-vehicle registry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DetectionLog {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub plate: String,
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub legion: String,
}

impl DetectionLog {
    /// Whether the lookup matched a stolen vehicle
    pub fn is_stolen(&self) -> bool {
        let result = self.result.trim().to_lowercase();
        matches!(result.as_str(), "stolen" | "vole" | "volé")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StolenVehicle {
    #[serde(default)]
    pub plate: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub legion: String,
    #[serde(default)]
    pub reported_at: Option<DateTime<Utc>>,
}

impl StolenVehicle {
    /// Status used for chart bucketing
    pub fn status_label(&self) -> &str {
        match self.status.as_deref().map(str::trim) {
            Some(s) if !s.is_empty() => s,
            _ => UNKNOWN_STATUS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VehicleCheck {
    #[serde(default)]
    pub plate: String,
    #[serde(default)]
    pub user: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub legion: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Login,
    Logout,
    UpdateProfile,
    ChangePassword,
    CreateUser,
    ImportUsers,
    ExportCsv,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Login => "login",
            AuditAction::Logout => "logout",
            AuditAction::UpdateProfile => "update_profile",
            AuditAction::ChangePassword => "change_password",
            AuditAction::CreateUser => "create_user",
            AuditAction::ImportUsers => "import_users",
            AuditAction::ExportCsv => "export_csv",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            AuditAction::Login => "Connexion",
            AuditAction::Logout => "Déconnexion",
            AuditAction::UpdateProfile => "Modification du profil",
            AuditAction::ChangePassword => "Changement de mot de passe",
            AuditAction::CreateUser => "Ajout d'utilisateur",
            AuditAction::ImportUsers => "Import d'utilisateurs",
            AuditAction::ExportCsv => "Export CSV",
        }
    }
}

/// One entry of the admin activity log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub admin_email: String,
    pub action: AuditAction,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub details: Option<String>,
}

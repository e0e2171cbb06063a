//! Errors surfaced by the admin screens.
//!
//! Every variant carries a French message meant for the admin. Handlers that
//! render pages show the message inline; the JSON and CSV endpoints turn the
//! error into a plain-text response with a matching status code.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::error;

use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    /// No credential document matches the email
    #[error("Aucun compte administrateur ne correspond à cet email")]
    NotFound,

    /// The credential exists but its active flag is false
    #[error("Ce compte administrateur est désactivé")]
    Disabled,

    /// Password hash mismatch
    #[error("Mot de passe incorrect")]
    Unauthorized,

    #[error("{0}")]
    Validation(String),

    /// A user with this matricule already exists
    #[error("Un utilisateur avec le matricule {0} existe déjà")]
    Duplicate(String),

    #[error("Accès refusé")]
    AccessDenied,

    #[error("Les nouveaux mots de passe ne correspondent pas")]
    Mismatch,

    #[error("Le nouveau mot de passe doit contenir au moins 8 caractères")]
    WeakPassword,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AdminError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AdminError::NotFound => StatusCode::NOT_FOUND,
            AdminError::Disabled | AdminError::AccessDenied => StatusCode::FORBIDDEN,
            AdminError::Unauthorized => StatusCode::UNAUTHORIZED,
            AdminError::Validation(_) | AdminError::Mismatch | AdminError::WeakPassword => {
                StatusCode::BAD_REQUEST
            }
            AdminError::Duplicate(_) => StatusCode::CONFLICT,
            AdminError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to show to the admin; storage details stay in the logs
    pub fn public_message(&self) -> String {
        match self {
            AdminError::Store(_) => "Une erreur interne est survenue".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        if let AdminError::Store(ref e) = self {
            error!(error = %e, "Storage failure");
        }
        (self.status_code(), self.public_message()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(AdminError::NotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(AdminError::AccessDenied.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(AdminError::Unauthorized.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            AdminError::Duplicate("M-1".to_string()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(AdminError::WeakPassword.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_duplicate_message_names_matricule() {
        let err = AdminError::Duplicate("M-42".to_string());
        assert!(err.to_string().contains("M-42"));
    }

    #[test]
    fn test_store_errors_are_hidden() {
        let err = AdminError::Store(StoreError::Poisoned);
        assert_eq!(err.public_message(), "Une erreur interne est survenue");
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_into_response_status() {
        let response = AdminError::AccessDenied.into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}

//! Named error kinds (§7) and their HTTP/transport surfacing rules.
//!
//! Most internal code still returns `anyhow::Result` and uses `.context()`
//! freely; `AppError` exists at the boundaries — HTTP handlers and the WS
//! command dispatcher — where a caller needs to know the *kind* of failure
//! to pick a status code or a close-vs-reply behavior.

use axum::http::StatusCode;

/// One of the error kinds named in §7.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AppError {
    #[error("invalid or already-consumed pairing token")]
    InvalidToken,
    #[error("a device is already paired")]
    AlreadyPaired,
    #[error("not authenticated")]
    Unauthenticated,
    #[error("authentication failed")]
    AuthFailure,
    #[error("invalid project id: {0}")]
    InvalidProject(String),
    #[error("a job is already running for this project")]
    BusyProject,
    #[error("no such job")]
    NoSuchJob,
    #[error("failed to spawn agent subprocess: {0}")]
    SubprocessSpawnFailure(String),
    #[error("subprocess produced no output in time")]
    SubprocessTimeout,
    #[error("decryption failed")]
    DecryptionFailure,
    #[error("malformed frame")]
    MalformedFrame,
    #[error("store I/O failure: {0}")]
    StoreIoFailure(String),
    #[error("git failure: {0}")]
    GitFailure(String),
    #[error("push transport failure: {0}")]
    PushTransportFailure(String),
}

impl AppError {
    /// HTTP status code for this error, per §6's status-code table.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidToken
            | Self::InvalidProject(_)
            | Self::MalformedFrame
            | Self::DecryptionFailure => StatusCode::BAD_REQUEST,
            Self::Unauthenticated | Self::AuthFailure => StatusCode::UNAUTHORIZED,
            Self::NoSuchJob => StatusCode::NOT_FOUND,
            Self::AlreadyPaired | Self::BusyProject => StatusCode::CONFLICT,
            Self::SubprocessSpawnFailure(_)
            | Self::SubprocessTimeout
            | Self::StoreIoFailure(_)
            | Self::GitFailure(_)
            | Self::PushTransportFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// `DecryptionFailure` and `MalformedFrame` must close the WS connection
    /// without a reply, so an attacker learns nothing from the response.
    #[must_use]
    pub fn is_silent(&self) -> bool {
        matches!(self, Self::DecryptionFailure | Self::MalformedFrame)
    }
}

impl axum::response::IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = axum::Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silent_kinds_match_spec() {
        assert!(AppError::DecryptionFailure.is_silent());
        assert!(AppError::MalformedFrame.is_silent());
        assert!(!AppError::AuthFailure.is_silent());
    }

    #[test]
    fn status_codes_match_table() {
        assert_eq!(AppError::InvalidProject("x".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(AppError::Unauthenticated.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(AppError::BusyProject.status_code(), StatusCode::CONFLICT);
        assert_eq!(AppError::NoSuchJob.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(AppError::GitFailure("x".into()).status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}

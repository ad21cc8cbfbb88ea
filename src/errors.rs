use crate::services::gateway::GatewayError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

/// Every gateway failure ends here: not-found is the caller's problem,
/// signature rejections are forbidden, everything else is ours.
///
/// Server-side failures carry paths and driver text, so the detail goes to
/// the log and the caller gets a fixed message.
impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        match &err {
            GatewayError::NotFound { .. } => {
                tracing::info!("{}", err);
                AppError::not_found(err.to_string())
            }
            GatewayError::AccessDenied(_) => {
                tracing::info!("{}", err);
                AppError::forbidden(err.to_string())
            }
            GatewayError::Configuration(_) => {
                tracing::error!(alert = true, "{}", err);
                AppError::internal("server configuration error")
            }
            GatewayError::Timeout { .. } => {
                tracing::error!("{}", err);
                AppError::internal("upload exceeded the transfer deadline")
            }
            GatewayError::Entropy(_) => {
                tracing::error!("{}", err);
                AppError::internal("could not generate an object key")
            }
            GatewayError::Signing(_) => {
                tracing::error!("{}", err);
                AppError::internal("could not sign download url")
            }
            GatewayError::Io { .. } | GatewayError::Storage(_) => {
                tracing::error!("{}", err);
                AppError::internal("internal server error")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::signing::VerifyError;

    #[test]
    fn gateway_errors_map_to_statuses() {
        let cases = [
            (
                GatewayError::NotFound {
                    bucket: "b".into(),
                    key: "k".into(),
                },
                StatusCode::NOT_FOUND,
            ),
            (
                GatewayError::AccessDenied(VerifyError::Expired),
                StatusCode::FORBIDDEN,
            ),
            (
                GatewayError::Timeout { bytes_copied: 1 },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                GatewayError::Configuration("no key".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                GatewayError::Signing("bad".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, status) in cases {
            assert_eq!(AppError::from(err).status, status);
        }
    }

    #[test]
    fn server_errors_do_not_echo_internal_detail() {
        let config = AppError::from(GatewayError::Configuration(
            "cannot read private key from /etc/gaefile/signing.pem: permission denied".into(),
        ));
        assert_eq!(config.message, "server configuration error");
        assert!(!config.message.contains("/etc/gaefile"));

        let io = AppError::from(GatewayError::Io {
            bytes_copied: 3,
            source: std::io::Error::other("disk full writing /srv/objects/uploads/.staging/.tmp-1"),
        });
        assert_eq!(io.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!io.message.contains("/srv/objects"));

        let timeout = AppError::from(GatewayError::Timeout { bytes_copied: 7 });
        assert!(timeout.message.contains("deadline"));
    }

    #[test]
    fn not_found_names_the_key() {
        let err = AppError::from(GatewayError::NotFound {
            bucket: "b".into(),
            key: "abc_x.jpg".into(),
        });
        assert!(err.message.contains("abc_x.jpg"));
    }
}

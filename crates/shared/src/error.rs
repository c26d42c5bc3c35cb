use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    NotFound,
    Validation,
    Conflict,
    RateLimited,
    Internal,
}

impl ErrorCode {
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => Self::Unauthorized,
            403 => Self::Forbidden,
            404 | 406 => Self::NotFound,
            400 | 422 => Self::Validation,
            409 => Self::Conflict,
            429 => Self::RateLimited,
            _ => Self::Internal,
        }
    }
}

/// Normalized error reported by the hosted backend (auth or data API).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{code:?} ({status}): {message}")]
pub struct ApiError {
    pub code: ErrorCode,
    pub status: u16,
    pub message: String,
}

impl ApiError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::from_status(status),
            status,
            message: message.into(),
        }
    }

    /// Builds an error from a raw response body. Understands the shapes used by
    /// the auth API (`error_description`, `msg`, `error`) and the data API
    /// (`message`, `details`, `hint`). Falls back to the body text.
    pub fn from_body(status: u16, body: &str) -> Self {
        let parsed: Option<BackendErrorBody> = serde_json::from_str(body).ok();
        let message = parsed
            .and_then(BackendErrorBody::into_message)
            .unwrap_or_else(|| {
                let trimmed = body.trim();
                if trimmed.is_empty() {
                    format!("request failed with status {status}")
                } else {
                    trimmed.to_string()
                }
            });
        Self::new(status, message)
    }
}

#[derive(Debug, Deserialize)]
struct BackendErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<serde_json::Value>,
}

impl BackendErrorBody {
    fn into_message(self) -> Option<String> {
        let text = self
            .error_description
            .or(self.msg)
            .or(self.message)
            .or(self.error)?;
        match self.code {
            Some(serde_json::Value::String(code)) if !code.is_empty() => {
                Some(format!("{text} [{code}]"))
            }
            _ => Some(text),
        }
    }
}

/// Failures of the authentication layer. Cloneable so the controller can keep
/// the last one in its published state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("invalid login credentials")]
    InvalidCredentials,
    #[error("session expired and could not be refreshed: {0}")]
    SessionExpired(String),
    #[error("auth backend rejected request: {0}")]
    Backend(ApiError),
    #[error("auth backend unreachable: {0}")]
    Transport(String),
    #[error("invalid auth backend response: {0}")]
    InvalidResponse(String),
    #[error("auth controller has been shut down")]
    ControllerClosed,
}

impl AuthError {
    pub fn is_credential_rejection(&self) -> bool {
        matches!(self, Self::InvalidCredentials)
    }
}

/// Programmer error: a consumer asked for the auth controller outside of the
/// scope that provides one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{consumer} must be used within a provider")]
pub struct ConfigurationError {
    pub consumer: &'static str,
}

impl ConfigurationError {
    pub fn missing_provider(consumer: &'static str) -> Self {
        Self { consumer }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_api_error_description_wins() {
        let err = ApiError::from_body(
            400,
            r#"{"error":"invalid_grant","error_description":"Invalid login credentials"}"#,
        );
        assert_eq!(err.code, ErrorCode::Validation);
        assert_eq!(err.message, "Invalid login credentials");
    }

    #[test]
    fn data_api_error_includes_code() {
        let err = ApiError::from_body(
            406,
            r#"{"code":"PGRST116","message":"JSON object requested, multiple (or no) rows returned"}"#,
        );
        assert_eq!(err.code, ErrorCode::NotFound);
        assert!(err.message.ends_with("[PGRST116]"));
    }

    #[test]
    fn plain_text_body_is_kept() {
        let err = ApiError::from_body(502, "bad gateway\n");
        assert_eq!(err.code, ErrorCode::Internal);
        assert_eq!(err.message, "bad gateway");
    }

    #[test]
    fn only_invalid_credentials_is_a_credential_rejection() {
        assert!(AuthError::InvalidCredentials.is_credential_rejection());
        assert!(!AuthError::Transport("refused".into()).is_credential_rejection());
        assert!(!AuthError::Backend(ApiError::new(401, "jwt expired")).is_credential_rejection());
    }

    #[test]
    fn configuration_error_names_consumer() {
        let err = ConfigurationError::missing_provider("use_auth");
        assert_eq!(err.to_string(), "use_auth must be used within a provider");
    }
}

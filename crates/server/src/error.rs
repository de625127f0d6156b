// Error code registry for the session protocol.
//
// Every handler-level failure is converted at the dispatch boundary into a
// typed `error` frame carrying a stable code and a human message, correlated
// to the originating request id. Stack traces and internal detail stay in
// the server logs.

use atelier_common::protocol::ServerMessage;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    AuthenticationRequired,
    AuthenticationFailed,
    NotAuthorized,
    WorkspaceNotFound,
    WorkspaceFull,
    ValidationFailed,
    PluginNotFound,
    EngineTimeout,
    EngineFailure,
    Internal,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AuthenticationRequired => "AUTHENTICATION_REQUIRED",
            Self::AuthenticationFailed => "AUTHENTICATION_FAILED",
            Self::NotAuthorized => "NOT_AUTHORIZED",
            Self::WorkspaceNotFound => "WORKSPACE_NOT_FOUND",
            Self::WorkspaceFull => "WORKSPACE_FULL",
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::PluginNotFound => "PLUGIN_NOT_FOUND",
            Self::EngineTimeout => "ENGINE_TIMEOUT",
            Self::EngineFailure => "ENGINE_FAILURE",
            Self::Internal => "INTERNAL",
        }
    }

    pub const fn default_message(self) -> &'static str {
        match self {
            Self::AuthenticationRequired => "authenticate before sending this message",
            Self::AuthenticationFailed => "credential was rejected",
            Self::NotAuthorized => "caller lacks the required permission",
            Self::WorkspaceNotFound => "workspace not found",
            Self::WorkspaceFull => "workspace is at its member limit",
            Self::ValidationFailed => "message payload failed validation",
            Self::PluginNotFound => "no plugin registered under this id",
            Self::EngineTimeout => "analysis engine did not respond in time",
            Self::EngineFailure => "analysis engine reported a failure",
            Self::Internal => "internal server error",
        }
    }

    pub const fn retryable(self) -> bool {
        matches!(self, Self::EngineTimeout | Self::EngineFailure | Self::Internal)
    }
}

/// A handler-level failure on its way to becoming an `error` frame.
#[derive(Debug, Clone)]
pub struct SessionError {
    code: ErrorCode,
    message: String,
    details: Option<Value>,
}

impl SessionError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), details: None }
    }

    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Convert into the wire frame, correlated to the originating request.
    pub fn into_frame(self, id: Option<String>) -> ServerMessage {
        ServerMessage::Error {
            id,
            code: self.code.as_str().to_string(),
            message: self.message,
            details: self.details,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable_screaming_snake() {
        assert_eq!(ErrorCode::WorkspaceFull.as_str(), "WORKSPACE_FULL");
        assert_eq!(ErrorCode::EngineTimeout.as_str(), "ENGINE_TIMEOUT");
        assert_eq!(ErrorCode::ValidationFailed.as_str(), "VALIDATION_FAILED");
    }

    #[test]
    fn engine_errors_are_retryable_auth_errors_are_not() {
        assert!(ErrorCode::EngineTimeout.retryable());
        assert!(ErrorCode::EngineFailure.retryable());
        assert!(!ErrorCode::AuthenticationFailed.retryable());
        assert!(!ErrorCode::WorkspaceFull.retryable());
    }

    #[test]
    fn into_frame_carries_correlation_id_and_details() {
        let frame = SessionError::from_code(ErrorCode::ValidationFailed)
            .with_details(serde_json::json!({"missing": ["workspace_id"]}))
            .into_frame(Some("req-3".into()));

        match frame {
            ServerMessage::Error { id, code, details, .. } => {
                assert_eq!(id.as_deref(), Some("req-3"));
                assert_eq!(code, "VALIDATION_FAILED");
                assert_eq!(details.unwrap()["missing"][0], "workspace_id");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

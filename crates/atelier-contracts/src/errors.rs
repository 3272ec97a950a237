use std::fmt;

use serde_json::{json, Value};

/// Closed failure taxonomy for outbound AI calls. Every failure leaving a
/// pipeline stage is one of these kinds; the wire name is snake_case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    AuthError,
    UpstreamServerError,
    TimedOut,
    ConnectFailed,
    TlsFailed,
    MalformedUpstreamResponse,
    UnsupportedFunction,
    InvalidRequest,
    UnknownError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::AuthError => "auth_error",
            ErrorKind::UpstreamServerError => "upstream_server_error",
            ErrorKind::TimedOut => "timed_out",
            ErrorKind::ConnectFailed => "connect_failed",
            ErrorKind::TlsFailed => "tls_failed",
            ErrorKind::MalformedUpstreamResponse => "malformed_upstream_response",
            ErrorKind::UnsupportedFunction => "unsupported_function",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::UnknownError => "unknown_error",
        }
    }

    /// Fixed message shown to end users; the detailed cause stays in
    /// `CallFailure::message` and the event log.
    pub fn user_message(&self) -> &'static str {
        match self {
            ErrorKind::AuthError => {
                "The service is misconfigured: authentication failed, contact the administrator."
            }
            ErrorKind::UpstreamServerError => {
                "The AI service is unavailable right now, please try again later."
            }
            ErrorKind::TimedOut => "The request timed out, try simplifying your input.",
            ErrorKind::ConnectFailed | ErrorKind::TlsFailed => {
                "Could not reach the AI service, please try again later."
            }
            ErrorKind::MalformedUpstreamResponse => {
                "The AI service returned a response we could not read."
            }
            ErrorKind::UnsupportedFunction => "That function is not supported.",
            ErrorKind::InvalidRequest => "The request was invalid.",
            ErrorKind::UnknownError => "Something went wrong, please try again.",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single failure value crossing stage boundaries.
#[derive(Debug, Clone, PartialEq)]
pub struct CallFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl CallFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for CallFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for CallFailure {}

/// The only value the pipeline ever returns to its caller.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineResult {
    Ok(String),
    Err(CallFailure),
}

impl PipelineResult {
    pub fn ok(data: impl Into<String>) -> Self {
        PipelineResult::Ok(data.into())
    }

    pub fn err(kind: ErrorKind, message: impl Into<String>) -> Self {
        PipelineResult::Err(CallFailure::new(kind, message))
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, PipelineResult::Ok(_))
    }

    /// Renders the fixed boundary shape: `{"success":true,"data":…}` or
    /// `{"success":false,"error":…,"message":…}`.
    pub fn to_value(&self) -> Value {
        match self {
            PipelineResult::Ok(data) => json!({
                "success": true,
                "data": data,
            }),
            PipelineResult::Err(failure) => json!({
                "success": false,
                "error": failure.kind.as_str(),
                "message": failure.message,
            }),
        }
    }
}

impl From<CallFailure> for PipelineResult {
    fn from(failure: CallFailure) -> Self {
        PipelineResult::Err(failure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_result_renders_success_shape() {
        let rendered = PipelineResult::ok(r#"{"image_url":"https://example.test/cat.png"}"#)
            .to_value();
        assert_eq!(rendered["success"], json!(true));
        assert_eq!(
            rendered["data"],
            json!(r#"{"image_url":"https://example.test/cat.png"}"#)
        );
        assert!(rendered.get("error").is_none());
    }

    #[test]
    fn err_result_renders_error_shape() {
        let rendered =
            PipelineResult::err(ErrorKind::TimedOut, "image_generation timed out").to_value();
        assert_eq!(rendered["success"], json!(false));
        assert_eq!(rendered["error"], json!("timed_out"));
        assert_eq!(rendered["message"], json!("image_generation timed out"));
        assert!(rendered.get("data").is_none());
    }

    #[test]
    fn wire_names_are_snake_case() {
        assert_eq!(ErrorKind::AuthError.as_str(), "auth_error");
        assert_eq!(ErrorKind::TlsFailed.as_str(), "tls_failed");
        assert_eq!(
            ErrorKind::MalformedUpstreamResponse.as_str(),
            "malformed_upstream_response"
        );
    }

    #[test]
    fn failure_displays_kind_and_message() {
        let failure = CallFailure::new(ErrorKind::ConnectFailed, "connection refused");
        assert_eq!(failure.to_string(), "connect_failed: connection refused");
    }

    #[test]
    fn every_kind_has_a_user_message() {
        let kinds = [
            ErrorKind::AuthError,
            ErrorKind::UpstreamServerError,
            ErrorKind::TimedOut,
            ErrorKind::ConnectFailed,
            ErrorKind::TlsFailed,
            ErrorKind::MalformedUpstreamResponse,
            ErrorKind::UnsupportedFunction,
            ErrorKind::InvalidRequest,
            ErrorKind::UnknownError,
        ];
        for kind in kinds {
            assert!(!kind.user_message().is_empty());
        }
    }
}

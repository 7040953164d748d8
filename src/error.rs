//! Error types and JSON error responses for the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use thiserror::Error;

/// Failures when allocating a lease
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// An explicit name is already leased
    #[error("host name already taken: {0}")]
    NameTaken(String),
    /// An explicit name does not match `[-_.a-z0-9]+`
    #[error("invalid host name: {0}")]
    InvalidName(String),
    /// Every generated name of the configured length is leased
    #[error("no free host name of length {0}")]
    NamesExhausted(usize),
    /// Every port in the configured range is leased
    #[error("no free port in range {start}..{end}")]
    PortsExhausted { start: u16, end: u16 },
}

/// Failures while forwarding a request to a leased port
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The connection to the local backend failed or was aborted
    #[error("transport failure: {0}")]
    Transport(#[from] hyper_util::client::legacy::Error),
    /// The outbound request could not be built
    #[error("request build error: {0}")]
    RequestBuild(#[from] hyper::http::Error),
    /// A redirect response carried no Location header
    #[error("received status {0} but no Location header")]
    MissingLocation(u16),
}

impl ProxyError {
    pub fn code(&self) -> ProxyErrorCode {
        match self {
            ProxyError::Transport(_) => ProxyErrorCode::ConnectionFailed,
            ProxyError::RequestBuild(_) => ProxyErrorCode::InternalError,
            ProxyError::MissingLocation(_) => ProxyErrorCode::InvalidRedirect,
        }
    }
}

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// No live lease matches the Host header
    UnknownHost,
    /// Failed to connect to backend
    ConnectionFailed,
    /// Backend sent a redirect without a Location header
    InvalidRedirect,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::UnknownHost => StatusCode::NOT_FOUND,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::InvalidRedirect => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::UnknownHost => "UNKNOWN_HOST",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::InvalidRedirect => "INVALID_REDIRECT",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ProxyErrorCode,
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let body = error.to_json();

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(ProxyErrorCode::UnknownHost.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ProxyErrorCode::ConnectionFailed.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(ProxyErrorCode::InvalidRedirect.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            ProxyErrorCode::InternalError.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(ProxyErrorCode::UnknownHost, "No lease for t-api.local");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"UNKNOWN_HOST\""));
        assert!(json.contains("\"message\":\"No lease for t-api.local\""));
        assert!(json.contains("\"status\":404"));
    }

    #[test]
    fn test_json_error_response() {
        let response = json_error_response(ProxyErrorCode::ConnectionFailed, "Backend unreachable");

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers().get("Content-Type").unwrap(), "application/json");
        assert_eq!(response.headers().get("X-Proxy-Error").unwrap(), "CONNECTION_FAILED");
    }

    #[test]
    fn test_proxy_error_codes() {
        assert_eq!(ProxyError::MissingLocation(302).code(), ProxyErrorCode::InvalidRedirect);
        assert_eq!(
            ProxyError::MissingLocation(302).to_string(),
            "received status 302 but no Location header"
        );
    }

    #[test]
    fn test_registry_error_messages() {
        assert_eq!(
            RegistryError::NameTaken("api".into()).to_string(),
            "host name already taken: api"
        );
        assert_eq!(
            RegistryError::PortsExhausted { start: 20000, end: 20010 }.to_string(),
            "no free port in range 20000..20010"
        );
    }
}

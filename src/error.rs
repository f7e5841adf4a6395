//! Error handling and canned responses for the gateway

use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Body served for every path outside the forwarded prefix
pub const NOT_FOUND_PAGE: &str = concat!(
    "<!DOCTYPE html><html lang=\"en\"><head><meta charset=\"UTF-8\">",
    "<meta name=\"viewport\" content=\"width=device-width,initial-scale=1\">",
    "<title>Page not found</title>",
    "<style>body{margin:0;font-family:sans-serif;color:#222;background:#fff}",
    "main{max-width:960px;margin:80px auto;padding:0 18px}",
    "h1{font-size:3em;font-weight:600;margin:0 0 24px}",
    "a{display:inline-block;margin-top:16px;padding:16px 32px;border-radius:16px;",
    "background:#333;color:#fff;text-decoration:none}</style></head>",
    "<body><main><h1>Page not found</h1>",
    "<p>Sorry, we can't find the page you are looking for on this server.</p>",
    "<a href=\"/\">Back Home</a></main></body></html>"
);

/// Error codes for gateway errors
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Could not reach the engine's local port
    UpstreamUnavailable,
    /// The engine did not complete a protocol upgrade
    UpgradeFailed,
    /// Internal gateway error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::UpgradeFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            ProxyErrorCode::UpgradeFailed => "UPGRADE_FAILED",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ProxyErrorCode,
    pub message: String,
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

/// 404 with the static not-found document
pub fn not_found_response() -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header("Content-Type", "text/html; charset=utf-8")
        .body(
            Full::new(Bytes::from_static(NOT_FOUND_PAGE.as_bytes()))
                .map_err(|e| match e {})
                .boxed(),
        )
        .expect("valid response with static headers")
}

/// 204 with an empty body
pub fn no_content_response() -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .body(Empty::<Bytes>::new().map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            ProxyErrorCode::UpstreamUnavailable.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyErrorCode::UpgradeFailed.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyErrorCode::InternalError.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(ProxyErrorCode::UpstreamUnavailable, "Connection refused");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"UPSTREAM_UNAVAILABLE\""));
        assert!(json.contains("\"message\":\"Connection refused\""));
        assert!(json.contains("\"status\":502"));
    }

    #[test]
    fn test_json_error_response_headers() {
        let response = json_error_response(ProxyErrorCode::UpgradeFailed, "no 101");

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "UPGRADE_FAILED"
        );
    }

    #[test]
    fn test_not_found_response() {
        let response = not_found_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response
            .headers()
            .get("Content-Type")
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("text/html"));
        assert!(NOT_FOUND_PAGE.contains("Page not found"));
    }

    #[test]
    fn test_no_content_response() {
        assert_eq!(no_content_response().status(), StatusCode::NO_CONTENT);
    }
}

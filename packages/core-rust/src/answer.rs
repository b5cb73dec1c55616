//! Outbound request description and received answers.

use bytes::Bytes;
use http::Method;
use serde::Deserialize;

use crate::status::ErrorCode;
use crate::types::Headers;

/// Status codes that count as a successful answer.
pub const SUCCESS_CODES: [u16; 4] = [200, 201, 202, 204];

/// The method/path/body/headers of one request, independent of its destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<Bytes>,
    pub headers: Headers,
}

impl OutboundRequest {
    /// Creates a request without body or headers.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            headers: Headers::new(),
        }
    }

    /// Sets the request body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Adds a header. The name is lowercased.
    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }
}

/// A reply received from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    pub status_code: u16,
    pub headers: Headers,
    pub body: Bytes,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    error_num: Option<i32>,
}

impl Answer {
    /// Creates an answer with the given status code and body, without headers.
    pub fn new(status_code: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status_code,
            headers: Headers::new(),
            body: body.into(),
        }
    }

    /// Returns `true` for the conventional 2xx success codes (200/201/202/204).
    #[must_use]
    pub fn is_success(&self) -> bool {
        SUCCESS_CODES.contains(&self.status_code)
    }

    /// Structured error code from a JSON body of the form `{"errorNum": n}`.
    ///
    /// Returns `None` when the body is not JSON or carries no `errorNum`.
    #[must_use]
    pub fn error_num(&self) -> Option<ErrorCode> {
        serde_json::from_slice::<ErrorBody>(&self.body)
            .ok()
            .and_then(|body| body.error_num)
            .map(ErrorCode)
    }

    /// `404` whose body says the addressed data source (shard) does not exist.
    ///
    /// Seen transiently while shard leadership moves between servers.
    #[must_use]
    pub fn is_data_source_not_found(&self) -> bool {
        self.status_code == 404 && self.error_num() == Some(ErrorCode::DATA_SOURCE_NOT_FOUND)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_codes() {
        for code in [200, 201, 202, 204] {
            assert!(Answer::new(code, "").is_success());
        }
        for code in [203, 301, 404, 500, 503] {
            assert!(!Answer::new(code, "").is_success());
        }
    }

    #[test]
    fn parses_error_num() {
        let answer = Answer::new(404, r#"{"error":true,"errorNum":1203,"code":404}"#);
        assert_eq!(answer.error_num(), Some(ErrorCode::DATA_SOURCE_NOT_FOUND));
        assert!(answer.is_data_source_not_found());
    }

    #[test]
    fn other_not_found_is_not_data_source_not_found() {
        assert!(!Answer::new(404, r#"{"errorNum":1202}"#).is_data_source_not_found());
        assert!(!Answer::new(404, "not json").is_data_source_not_found());
        assert!(!Answer::new(500, r#"{"errorNum":1203}"#).is_data_source_not_found());
    }

    #[test]
    fn request_builder_lowercases_headers() {
        let request = OutboundRequest::new(Method::PUT, "/_api/document/c/1")
            .with_body("{}")
            .with_header("Content-Type", "application/json");
        assert_eq!(
            request.headers.get("content-type").map(String::as_str),
            Some("application/json")
        );
        assert_eq!(request.body.as_deref(), Some(&b"{}"[..]));
    }
}

//! HTTP transport seam
//!
//! Every component talks to the server through [`HttpTransport`]. Requests are
//! plain data so the background interceptor can persist them and tests can
//! script responses.

use crate::error::TransportError;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;

/// `Authorization` header name
pub const AUTHORIZATION: &str = "Authorization";

/// HTTP methods used by the dashboard API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// GET
    Get,
    /// POST
    Post,
    /// DELETE
    Delete,
}

impl Method {
    /// Upper-case method name
    #[inline]
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outgoing request, relative to the configured base URL
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    /// Method
    pub method: Method,
    /// Path starting with `/`
    pub path: String,
    /// Query parameters
    pub query: Vec<(String, String)>,
    /// Headers, names compared case-insensitively
    pub headers: Vec<(String, String)>,
    /// JSON body
    pub body: Option<Value>,
}

impl ApiRequest {
    /// Bare request
    #[must_use]
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
        }
    }

    /// GET request
    #[must_use]
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    /// POST request with a JSON body
    #[must_use]
    pub fn post(path: impl Into<String>, body: Value) -> Self {
        let mut request = Self::new(Method::Post, path);
        request.body = Some(body);
        request
    }

    /// Add a query parameter
    #[must_use]
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Add or replace a header
    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.set_header(name, value);
        self
    }

    /// Add or replace a header in place
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self
            .headers
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            Some((_, existing)) => *existing = value,
            None => self.headers.push((name.to_string(), value)),
        }
    }

    /// Header value by case-insensitive name
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Response with its body parsed as JSON (`Null` when empty or not JSON)
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    /// Status code
    pub status: u16,
    /// Parsed body
    pub body: Value,
}

impl ApiResponse {
    /// Build a response
    #[inline]
    #[must_use]
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    /// 2xx
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// 401
    #[inline]
    #[must_use]
    pub fn is_unauthorized(&self) -> bool {
        self.status == 401
    }

    /// `error` field of a JSON object body
    #[must_use]
    pub fn domain_error(&self) -> Option<String> {
        match self.body.get("error")? {
            Value::Null => None,
            Value::String(message) => Some(message.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Synthetic answer of the background interceptor for a stored request
    #[must_use]
    pub fn is_deferred(&self) -> bool {
        self.status == 202 && self.body.get("queued").and_then(Value::as_bool) == Some(true)
    }
}

/// Sends one request and returns the server's response.
///
/// `Err` means no response was obtained; any status code is `Ok`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Send one request
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError>;
}

/// [`HttpTransport`] backed by reqwest
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    base_url: String,
    client: Client,
}

impl ReqwestTransport {
    /// Create transport for a server root such as `http://localhost:5000`
    #[must_use]
    pub fn new(base_url: &str, request_timeout: Duration, connect_timeout: Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: Client::builder()
                .timeout(request_timeout)
                .connect_timeout(connect_timeout)
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    /// Server root
    #[inline]
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Delete => reqwest::Method::DELETE,
        };

        let mut builder = self.client.request(method, self.url(&request.path));
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let bytes = response.bytes().await?;
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|err| {
                tracing::debug!(%status, path = %request.path, "non-JSON response body: {err}");
                Value::Null
            })
        };

        tracing::debug!(method = %request.method, path = %request.path, status, "request completed");
        Ok(ApiResponse::new(status, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_header_replaces_case_insensitively() {
        let mut request = ApiRequest::get("/x").with_header("authorization", "Bearer old");
        request.set_header(AUTHORIZATION, "Bearer new");
        assert_eq!(request.headers.len(), 1);
        assert_eq!(request.header("AUTHORIZATION"), Some("Bearer new"));
    }

    #[test]
    fn domain_error_reads_error_field() {
        let response = ApiResponse::new(200, json!({"error": "duplicate name"}));
        assert_eq!(response.domain_error().as_deref(), Some("duplicate name"));
        assert_eq!(ApiResponse::new(200, json!({"id": 3})).domain_error(), None);
        assert_eq!(ApiResponse::new(200, json!([1, 2])).domain_error(), None);
        assert_eq!(ApiResponse::new(200, json!({"error": null})).domain_error(), None);
    }

    #[test]
    fn deferred_requires_accepted_and_flag() {
        assert!(ApiResponse::new(202, json!({"queued": true})).is_deferred());
        assert!(!ApiResponse::new(200, json!({"queued": true})).is_deferred());
        assert!(!ApiResponse::new(202, json!({})).is_deferred());
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let transport =
            ReqwestTransport::new("http://localhost:5000/", Duration::from_secs(1), Duration::from_secs(1));
        assert_eq!(transport.base_url(), "http://localhost:5000");
        assert_eq!(transport.url("/sync/pull"), "http://localhost:5000/sync/pull");
    }
}

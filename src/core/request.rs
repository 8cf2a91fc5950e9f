use axum::body::Bytes;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method};
use std::net::IpAddr;

/// An inbound request as seen by the gating pipeline.
///
/// Built by the transport once per request and discarded after the verdict.
#[derive(Debug, Clone)]
pub struct ClientRequest {
    /// Client IP address
    pub ip: IpAddr,
    /// HTTP method
    pub method: Method,
    /// Request path without the query string
    pub path: String,
    /// Raw query string, if any
    pub query: Option<String>,
    /// Decoded query parameters in arrival order
    pub query_params: Vec<(String, String)>,
    /// Request headers (case-insensitive lookup)
    pub headers: HeaderMap,
    /// Buffered request body
    pub body: Bytes,
}

impl ClientRequest {
    /// Create a request from the client IP, method and `path?query` target
    pub fn new(ip: IpAddr, method: Method, target: &str) -> Self {
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, Some(query.to_string())),
            None => (target, None),
        };
        let query_params = query
            .as_deref()
            .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
            .unwrap_or_default();

        Self {
            ip,
            method,
            path: if path.is_empty() { "/".to_string() } else { path.to_string() },
            query,
            query_params,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Replace the header map
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Add a single header; invalid names or values are ignored
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => {
                self.headers.append(name, value);
            }
            _ => tracing::debug!(header = %name, "ignoring invalid header"),
        }
        self
    }

    /// Attach the buffered body
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of a query parameter
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query_params
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Header value as text; non-UTF-8 values are treated as absent
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.header(header::USER_AGENT.as_str())
    }

    /// The original request target, `path` plus `?query` when present
    pub fn path_and_query(&self) -> String {
        match &self.query {
            Some(query) => format!("{}?{}", self.path, query),
            None => self.path.clone(),
        }
    }
}

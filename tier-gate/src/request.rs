use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::tier::Principal;

pub const CACHE_CONTROL: &str = "cache-control";
pub const RETRY_AFTER: &str = "retry-after";
pub const X_CACHE: &str = "x-cache";

/// HTTP request method, as far as admission cares.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
    Options,
    Other(String),
}

impl Method {
    /// Responses to these methods may be served from the cache.
    pub fn is_cacheable(&self) -> bool {
        matches!(self, Method::Get | Method::Head)
    }

    /// A successful request with one of these methods invalidates cached reads
    /// of the same resource.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Method::Post | Method::Put | Method::Patch | Method::Delete
        )
    }

    pub fn as_str(&self) -> &str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
            Method::Other(other) => other,
        }
    }
}

impl From<&str> for Method {
    fn from(method: &str) -> Self {
        match method.to_ascii_uppercase().as_str() {
            "GET" => Method::Get,
            "HEAD" => Method::Head,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "PATCH" => Method::Patch,
            "DELETE" => Method::Delete,
            "OPTIONS" => Method::Options,
            other => Method::Other(other.to_string()),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An inbound request as seen by the admission layer.
///
/// Header names are stored lower-cased.
#[derive(Debug, Clone)]
pub struct GateRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub principal: Principal,
}

impl GateRequest {
    pub fn new(method: Method, path: impl Into<String>, principal: Principal) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: Vec::new(),
            principal,
        }
    }

    pub fn get(path: impl Into<String>, principal: Principal) -> Self {
        Self::new(Method::Get, path, principal)
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_ascii_lowercase(), value.into()));
        self
    }

    /// First value of header `name`, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// The application's answer to a [`GateRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Jobs to run after the response has been produced. Never cached.
    #[serde(skip)]
    pub follow_up: Vec<serde_json::Value>,
}

impl GateResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
            follow_up: Vec::new(),
        }
    }

    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self::new(200, body)
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.set_header(name, value);
        self
    }

    /// Replaces every value of header `name` with `value`.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
        self.headers.push((name.to_ascii_lowercase(), value.into()));
    }

    pub fn with_follow_up(mut self, job: serde_json::Value) -> Self {
        self.follow_up.push(job);
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn methods_parse_case_insensitively() {
        assert_eq!(Method::from("get"), Method::Get);
        assert_eq!(Method::from("Delete"), Method::Delete);
        assert_eq!(Method::from("purge"), Method::Other("PURGE".to_string()));
        assert!(Method::Head.is_cacheable());
        assert!(!Method::Post.is_cacheable());
        assert!(Method::Patch.is_mutation());
        assert!(!Method::Options.is_mutation());
    }

    #[test]
    fn headers_are_case_insensitive() {
        let request = GateRequest::get("/", Principal::anonymous("10.0.0.1"))
            .with_header("Accept", "application/json");
        assert_eq!(request.header("accept"), Some("application/json"));
        assert_eq!(request.header("ACCEPT"), Some("application/json"));

        let mut response = GateResponse::ok("x").with_header("X-Cache", "MISS");
        response.set_header("x-cache", "HIT");
        assert_eq!(response.header("X-CACHE"), Some("HIT"));
        assert_eq!(response.headers.len(), 1);
    }
}

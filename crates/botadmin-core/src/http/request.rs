use std::fmt;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;

use super::ApiError;

/// Payload carried by a [`PendingRequest`].
#[derive(Clone, PartialEq)]
pub enum RequestBody {
    Empty,
    Json(serde_json::Value),
    Form(Vec<(String, String)>),
}

// Form bodies carry passwords; only their field names are printed.
impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestBody::Empty => f.write_str("Empty"),
            RequestBody::Json(_) => f.write_str("Json(..)"),
            RequestBody::Form(pairs) => f
                .debug_tuple("Form")
                .field(&pairs.iter().map(|(key, _)| key.as_str()).collect::<Vec<_>>())
                .finish(),
        }
    }
}

/// A backend call captured verbatim so it can be replayed after a token renewal.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    body: RequestBody,
    headers: HeaderMap,
    authenticated: bool,
    replayed: bool,
}

impl PendingRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: RequestBody::Empty,
            headers: HeaderMap::new(),
            authenticated: true,
            replayed: false,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn json(mut self, value: serde_json::Value) -> Self {
        self.body = RequestBody::Json(value);
        self
    }

    pub fn form<I, K, V>(mut self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.body = RequestBody::Form(
            pairs
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        );
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Send without a bearer credential and never enter the renewal protocol.
    pub fn anonymous(mut self) -> Self {
        self.authenticated = false;
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query_pairs(&self) -> &[(String, String)] {
        &self.query
    }

    pub fn body(&self) -> &RequestBody {
        &self.body
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Whether this request is already the single replay allowed after a renewal.
    pub fn is_replay(&self) -> bool {
        self.replayed
    }

    pub(crate) fn mark_replay(&mut self) {
        self.replayed = true;
    }
}

/// A fully buffered backend response.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: String,
}

impl ApiResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: String) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    pub(crate) async fn read(response: reqwest::Response) -> Result<Self, ApiError> {
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await?;
        Ok(Self::new(status, headers, body))
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn text(&self) -> &str {
        &self.body
    }

    pub fn into_text(self) -> String {
        self.body
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults_to_authenticated_first_attempt() {
        let request = PendingRequest::get("users").query("page", "2");
        assert!(request.is_authenticated());
        assert!(!request.is_replay());
        assert_eq!(request.method(), &Method::GET);
        assert_eq!(request.query_pairs(), &[("page".to_owned(), "2".to_owned())]);
        assert_eq!(request.body(), &RequestBody::Empty);
    }

    #[test]
    fn form_debug_hides_values() {
        let request = PendingRequest::post("auth/login")
            .form([("username", "admin"), ("password", "admin123")])
            .anonymous();
        let printed = format!("{request:?}");
        assert!(printed.contains("password"));
        assert!(!printed.contains("admin123"));
        assert!(!request.is_authenticated());
    }

    #[test]
    fn response_json() {
        let response = ApiResponse::new(
            StatusCode::OK,
            HeaderMap::new(),
            r#"{"total": 3}"#.into(),
        );
        let value: serde_json::Value = response.json().unwrap();
        assert_eq!(value["total"], 3);
        assert!(matches!(
            response.json::<Vec<u8>>().unwrap_err(),
            ApiError::Deserialize(_)
        ));
    }
}

//! API request and response values
//!
//! [`ApiRequest`] describes a call to the cloud APIs or the identity
//! provider; the cloud client turns it into an HTTP request, signs it and
//! executes it. [`ApiResponse`] is the completed 2xx answer.

use crate::error::{CloudError, ResponseError};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// HTTP verb of an API request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub(crate) fn as_reqwest(self) -> reqwest::Method {
        match self {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_reqwest().as_str())
    }
}

/// A request to execute through the cloud client
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub(crate) method: Method,
    pub(crate) path: String,
    pub(crate) to_auth: bool,
    pub(crate) secure: Option<bool>,
    pub(crate) params: Vec<(String, String)>,
    pub(crate) body: Option<String>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            to_auth: false,
            secure: None,
            params: Vec::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::Post, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::Put, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    /// Send to the identity provider instead of the APIs; the scheme follows `auth_secured`
    pub fn to_auth(mut self) -> Self {
        self.to_auth = true;
        self
    }

    /// Force https (`true`) or http (`false`); defaults to the configured APIs scheme
    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = Some(secure);
        self
    }

    /// Append a query parameter; only valid on GET requests
    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    /// Serialize `value` as the JSON body; not valid on GET requests
    pub fn json<T: Serialize + ?Sized>(mut self, value: &T) -> Result<Self, CloudError> {
        let body = serde_json::to_string(value).map_err(|e| {
            CloudError::Request(format!(
                "Error on prepare request '[{}] {}' because can't serialize param to json ({})",
                self.method, self.path, e
            ))
        })?;
        self.body = Some(body);
        Ok(self)
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_to_auth(&self) -> bool {
        self.to_auth
    }

    /// Check the request shape before execution
    pub(crate) fn validate(&self) -> Result<(), CloudError> {
        if !self.path.starts_with('/') {
            return Err(CloudError::Request(format!(
                "Error on exec request '[{}] {}' because path must start with '/'",
                self.method, self.path
            )));
        }
        if self.method == Method::Get && self.body.is_some() {
            return Err(CloudError::Request(format!(
                "Error on exec request '[{}] {}' because GET requests can't carry a body",
                self.method, self.path
            )));
        }
        if self.method != Method::Get && !self.params.is_empty() {
            return Err(CloudError::Request(format!(
                "Error on exec request '[{}] {}' because query params are only supported on GET",
                self.method, self.path
            )));
        }
        Ok(())
    }
}

/// Successful answer of an executed request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    url: String,
    status: u16,
    body: String,
}

impl ApiResponse {
    pub(crate) fn new(url: String, status: u16, body: String) -> Self {
        Self { url, status, body }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    /// Raw body as received
    pub fn raw_body(&self) -> &str {
        &self.body
    }

    /// Body with surrounding quotes and whitespace removed
    pub fn text(&self) -> String {
        trim_body(&self.body)
    }

    /// Decode the trimmed body as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, CloudError> {
        serde_json::from_str(&self.body)
            .or_else(|_| serde_json::from_str(&self.text()))
            .map_err(|e| ResponseError::parsing(&self.url, &self.body, e).into())
    }
}

/// Strip one leading and one trailing quote, then whitespace
pub fn trim_body(body: &str) -> String {
    let body = body.strip_prefix('"').unwrap_or(body);
    let body = body.strip_suffix('"').unwrap_or(body);
    body.trim().to_string()
}

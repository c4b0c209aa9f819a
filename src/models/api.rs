use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{ClientError, Result};

// ==================================================================================================
// Request Models
// ==================================================================================================

/// One logical API call
///
/// Kept by value so the call can be rebuilt for a replay; the Authorization
/// header is never part of it.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn with_query<K, V>(mut self, query: &[(K, V)]) -> Self
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        self.query.extend(
            query
                .iter()
                .map(|(k, v)| (k.as_ref().to_string(), v.as_ref().to_string())),
        );
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

// ==================================================================================================
// Response Models
// ==================================================================================================

/// Decoded JSON response
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,

    /// `Null` when the response had no body
    pub body: Value,
}

impl ApiResponse {
    /// Decode the body into a typed value
    pub fn json<T: DeserializeOwned>(self) -> Result<T> {
        serde_json::from_value(self.body).map_err(|e| ClientError::Decode(e.to_string()))
    }
}

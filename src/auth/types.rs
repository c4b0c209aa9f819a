// Authentication types

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::SessionInvalidReason;

/// Storage key for the access token
pub const ACCESS_TOKEN_KEY: &str = "accessToken";

/// Storage key for the refresh token
pub const REFRESH_TOKEN_KEY: &str = "refreshToken";

/// Invoked once when a session cannot be recovered
pub type SessionInvalidHook = Arc<dyn Fn(&SessionInvalidReason) + Send + Sync>;

/// Access and refresh token pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tokens {
    pub access: String,
    pub refresh: Option<String>,
}

impl Tokens {
    pub fn new(access: impl Into<String>, refresh: impl Into<String>) -> Self {
        Self {
            access: access.into(),
            refresh: Some(refresh.into()),
        }
    }
}

/// Refresh exchange request body
#[derive(Debug, Serialize)]
pub struct RefreshRequest<'a> {
    pub refresh: &'a str,
}

/// Refresh exchange response body
///
/// `refresh` is only present when the backend rotates refresh tokens.
#[derive(Debug, Deserialize)]
pub struct RefreshResponse {
    pub access: String,
    #[serde(default)]
    pub refresh: Option<String>,
}

/// Login request body
#[derive(Debug, Serialize)]
pub struct LoginRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
}

/// Login response body
#[derive(Debug, Deserialize)]
pub struct LoginResponse {
    pub access: String,
    pub refresh: String,
}

impl From<LoginResponse> for Tokens {
    fn from(resp: LoginResponse) -> Self {
        Tokens::new(resp.access, resp.refresh)
    }
}

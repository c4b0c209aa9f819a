// HustleHub client - library root

pub mod auth;
pub mod config;
pub mod error;
pub mod http_client;
pub mod models;

pub use auth::{MemoryTokenStore, Session, SessionInvalidHook, SqliteTokenStore, TokenStore, Tokens};
pub use config::ClientSettings;
pub use error::{ClientError, SessionInvalidReason};
pub use http_client::ApiClient;
pub use models::{ApiRequest, ApiResponse};

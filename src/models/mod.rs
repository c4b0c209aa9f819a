// Data models for the HustleHub API

pub mod api;
pub mod user;

pub use api::{ApiRequest, ApiResponse};
pub use user::CurrentUser;

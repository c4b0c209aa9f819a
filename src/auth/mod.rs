// Authentication module
// Session credentials, storage backends and the token refresh protocol

mod refresh;
mod session;
mod sqlite;
mod store;
mod types;

pub use refresh::exchange;
pub use session::{RefreshLease, RefreshTicket, Session, Settlement, Waiter};
pub use sqlite::SqliteTokenStore;
pub use store::{MemoryTokenStore, TokenStore};
pub use types::{
    LoginRequest, LoginResponse, SessionInvalidHook, Tokens, ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY,
};

// Credential storage boundary

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Mutex;

/// Key-value slot holding session credentials
///
/// Implementations must be safe to share between tasks. Calls are made while
/// the session lock is held, so they should not block for long.
pub trait TokenStore: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<String>>;

    fn save(&self, key: &str, value: &str) -> Result<()>;

    fn remove(&self, key: &str) -> Result<()>;
}

/// Process-local token store
#[derive(Default)]
pub struct MemoryTokenStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.entries
            .lock()
            .map_err(|_| anyhow::anyhow!("Token store lock poisoned"))
    }
}

impl TokenStore for MemoryTokenStore {
    fn load(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries()?.get(key).cloned())
    }

    fn save(&self, key: &str, value: &str) -> Result<()> {
        self.entries()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries()?.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryTokenStore::new();
        assert_eq!(store.load("accessToken").unwrap(), None);

        store.save("accessToken", "A1").unwrap();
        assert_eq!(store.load("accessToken").unwrap().as_deref(), Some("A1"));

        store.save("accessToken", "A2").unwrap();
        assert_eq!(store.load("accessToken").unwrap().as_deref(), Some("A2"));

        store.remove("accessToken").unwrap();
        assert_eq!(store.load("accessToken").unwrap(), None);
    }

    #[test]
    fn test_remove_missing_key_is_ok() {
        let store = MemoryTokenStore::new();
        assert!(store.remove("refreshToken").is_ok());
    }
}

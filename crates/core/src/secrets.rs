//! Secret key storage keyed by `(project, api key)`.
//!
//! Secrets are never persisted with the node record. The store is injected
//! into the registry; last write wins.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get(&self, project: &str, key: &str) -> Option<String>;

    async fn set(&self, project: &str, key: &str, secret: String);
}

/// Process-local [`SecretStore`].
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    entries: RwLock<HashMap<(String, String), String>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get(&self, project: &str, key: &str) -> Option<String> {
        self.entries
            .read()
            .await
            .get(&(project.to_string(), key.to_string()))
            .cloned()
    }

    async fn set(&self, project: &str, key: &str, secret: String) {
        self.entries
            .write()
            .await
            .insert((project.to_string(), key.to_string()), secret);
    }
}

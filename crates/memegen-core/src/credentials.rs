use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::watch;

/// Service identifier the imgen client listens for.
pub const IMGEN_SERVICE: &str = "imgen";
/// Credential key holding the Authorization header value.
pub const AUTHORIZATION_KEY: &str = "authorization";

/// On-disk credential store (~/.memegen/credentials.json), keyed by
/// service name, then credential key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialStore {
    #[serde(flatten)]
    services: HashMap<String, HashMap<String, String>>,
}

impl CredentialStore {
    /// Load the store, falling back to an empty one when the file is missing.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read credentials: {}", path.display()))?;
        let store: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse credentials: {}", path.display()))?;
        Ok(store)
    }

    /// Persist the store, creating the parent directory if needed.
    pub fn store(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create credentials dir: {}", parent.display())
            })?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write credentials: {}", path.display()))?;
        Ok(())
    }

    pub fn token(&self, service: &str, key: &str) -> Option<&str> {
        self.services
            .get(service)
            .and_then(|tokens| tokens.get(key))
            .map(String::as_str)
    }

    pub fn set_token(&mut self, service: &str, key: &str, value: &str) {
        self.services
            .entry(service.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
    }

    /// All tokens registered for a service, cloned for publication.
    pub fn service_tokens(&self, service: &str) -> HashMap<String, String> {
        self.services.get(service).cloned().unwrap_or_default()
    }
}

/// A push notification that a service's credentials changed.
#[derive(Debug, Clone)]
pub struct CredentialUpdate {
    pub service: String,
    pub tokens: HashMap<String, String>,
}

/// In-process broadcast of credential updates. Writers publish the full
/// token map for one service; subscribers decide whether the service name
/// concerns them.
pub struct CredentialBus {
    tx: watch::Sender<Option<CredentialUpdate>>,
}

impl CredentialBus {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    pub fn publish(&self, service: &str, tokens: HashMap<String, String>) {
        let _ = self.tx.send(Some(CredentialUpdate {
            service: service.to_string(),
            tokens,
        }));
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<CredentialUpdate>> {
        self.tx.subscribe()
    }
}

impl Default for CredentialBus {
    fn default() -> Self {
        Self::new()
    }
}

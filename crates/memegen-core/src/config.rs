use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Public imgen instance used when no URL has been configured.
pub const DEFAULT_URL: &str = "https://imgen.flaree.xyz/api";

/// Persisted bot configuration (~/.memegen/config.json).
///
/// The base URL is the only durable state the bot keeps; it is
/// rewritten whole whenever the owner confirms a URL change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    #[serde(default = "default_url")]
    pub url: String,
}

fn default_url() -> String {
    DEFAULT_URL.to_string()
}

impl Default for BotConfig {
    fn default() -> Self {
        Self { url: default_url() }
    }
}

/// Load the bot config, falling back to defaults when the file is missing.
pub fn load(path: &Path) -> Result<BotConfig> {
    if !path.exists() {
        return Ok(BotConfig::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config: {}", path.display()))?;
    let config: BotConfig = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse config: {}", path.display()))?;
    Ok(config)
}

/// Persist the bot config, creating the parent directory if needed.
pub fn store(path: &Path, config: &BotConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config dir: {}", parent.display()))?;
    }
    let content = serde_json::to_string_pretty(config)?;
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write config: {}", path.display()))?;
    Ok(())
}

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub discord: DiscordConfig,
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscordConfig {
    pub bot_token: String,
    #[serde(default)]
    pub owner_ids: Vec<u64>,
}

fn default_prefix() -> String {
    "!".to_string()
}

impl GatewayConfig {
    /// Load from environment variables
    pub fn from_env() -> Result<Self> {
        let bot_token = std::env::var("DISCORD_BOT_TOKEN")
            .map_err(|_| anyhow::anyhow!("DISCORD_BOT_TOKEN not set"))?;

        let owner_ids: Vec<u64> = std::env::var("OWNER_IDS")
            .unwrap_or_default()
            .split(',')
            .filter(|s| !s.is_empty())
            .filter_map(|s| s.trim().parse().ok())
            .collect();

        let prefix = std::env::var("COMMAND_PREFIX").unwrap_or_else(|_| default_prefix());

        Ok(Self {
            discord: DiscordConfig {
                bot_token,
                owner_ids,
            },
            prefix,
        })
    }

    /// Load from a JSON config file, with env overrides
    pub fn from_file_or_env(path: &Path) -> Result<Self> {
        if let Ok(content) = std::fs::read_to_string(path) {
            let mut config: Self = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse config: {}", path.display()))?;
            if let Ok(token) = std::env::var("DISCORD_BOT_TOKEN") {
                config.discord.bot_token = token;
            }
            if let Ok(ids) = std::env::var("OWNER_IDS") {
                config.discord.owner_ids = ids
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .filter_map(|s| s.trim().parse().ok())
                    .collect();
            }
            Ok(config)
        } else {
            Self::from_env()
        }
    }

    pub fn is_owner(&self, user_id: &str) -> bool {
        user_id
            .parse::<u64>()
            .map(|id| self.discord.owner_ids.contains(&id))
            .unwrap_or(false)
    }
}

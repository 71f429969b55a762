use std::path::PathBuf;

/// Returns the memegen home directory (~/.memegen)
pub fn memegen_home() -> PathBuf {
    dirs::home_dir()
        .expect("Could not determine home directory")
        .join(".memegen")
}

/// Returns the path to the persisted bot config (base URL)
pub fn bot_config_path() -> PathBuf {
    memegen_home().join("config.json")
}

/// Returns the path to the credential store file
pub fn credentials_path() -> PathBuf {
    memegen_home().join("credentials.json")
}

/// Returns the path to the gateway (Discord) config file
pub fn gateway_config_path() -> PathBuf {
    memegen_home().join("gateway.json")
}

use bytes::Bytes;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::{debug, warn};

use crate::config::BotConfig;
use crate::credentials::{CredentialStore, AUTHORIZATION_KEY, IMGEN_SERVICE};

/// Fixed user-facing text for a 404 or an unreachable/invalid host.
/// The trailing space is part of the contract with existing chat clients.
pub const SERVER_NOT_FOUND: &str =
    "Server not found, ensure the correct URL is setup and is reachable. ";
/// Fixed user-facing text for a non-JSON error body.
pub const SERVER_DOWN: &str = "Server may be down, please try again later.";

/// What one authenticated GET against the imgen service produced.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// 200 with a binary body: the rendered image.
    Image(Bytes),
    /// 200 with a JSON body (only when the caller asked for JSON).
    Json(Value),
    /// Anything else, flattened to the single line shown in chat.
    ServiceError(String),
}

/// Client for the remote image-generation service.
///
/// One long-lived reqwest pool for the process lifetime; the base URL and
/// Authorization header are read-mostly state swapped whole, never
/// partially updated.
pub struct ImgenClient {
    http: reqwest::Client,
    base_url: RwLock<String>,
    authorization: RwLock<Option<String>>,
}

impl ImgenClient {
    pub fn new(base_url: impl Into<String>, authorization: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: RwLock::new(base_url.into()),
            authorization: RwLock::new(authorization.filter(|t| !t.is_empty())),
        }
    }

    /// Build a client from the persisted config and credential store.
    pub fn from_state(config: &BotConfig, store: &CredentialStore) -> Self {
        Self::new(
            config.url.clone(),
            store
                .token(IMGEN_SERVICE, AUTHORIZATION_KEY)
                .map(str::to_string),
        )
    }

    pub fn base_url(&self) -> String {
        self.base_url.read().expect("base_url lock poisoned").clone()
    }

    pub fn set_base_url(&self, url: &str) {
        *self.base_url.write().expect("base_url lock poisoned") = url.to_string();
    }

    fn authorization(&self) -> Option<String> {
        self.authorization
            .read()
            .expect("authorization lock poisoned")
            .clone()
    }

    /// Whether an imgen credential is configured at all. Meme commands are
    /// gated on this before their bodies run.
    pub fn has_token(&self) -> bool {
        self.authorization().is_some()
    }

    /// Apply a credential-update notification. Updates for other services
    /// leave the header untouched; a matching service replaces it whole.
    pub fn apply_credential_update(&self, service: &str, tokens: &HashMap<String, String>) {
        if service != IMGEN_SERVICE {
            return;
        }
        let token = tokens.get(AUTHORIZATION_KEY).cloned().filter(|t| !t.is_empty());
        *self.authorization.write().expect("authorization lock poisoned") = token;
        debug!("imgen authorization header replaced");
    }

    /// Re-read base URL and credentials after the owner commits a change.
    pub fn reinitialize(&self, config: &BotConfig, store: &CredentialStore) {
        self.set_base_url(&config.url);
        self.apply_credential_update(IMGEN_SERVICE, &store.service_tokens(IMGEN_SERVICE));
    }

    /// Issue one authenticated GET against `base_url + suffix`.
    ///
    /// 200 → the binary body (or parsed JSON when `expect_json`); 404 → the
    /// fixed not-found line; any other status → the body's `error` field if
    /// it parses as JSON, the generic server-down line otherwise. Transport
    /// failures collapse into the not-found line. Never retries.
    pub async fn fetch(&self, suffix: &str, expect_json: bool) -> FetchOutcome {
        let url = format!("{}{}", self.base_url(), suffix);
        let mut request = self.http.get(&url);
        if let Some(auth) = self.authorization() {
            request = request.header("Authorization", auth);
        }

        let resp = match request.send().await {
            Ok(resp) => resp,
            Err(e) => {
                warn!("imgen request to {} failed: {}", url, e);
                return FetchOutcome::ServiceError(SERVER_NOT_FOUND.to_string());
            }
        };

        let status = resp.status();
        if status == reqwest::StatusCode::OK {
            if expect_json {
                return match resp.json::<Value>().await {
                    Ok(body) => FetchOutcome::Json(body),
                    Err(e) => {
                        warn!("imgen JSON body from {} unreadable: {}", url, e);
                        FetchOutcome::ServiceError(SERVER_DOWN.to_string())
                    }
                };
            }
            return match resp.bytes().await {
                Ok(body) => FetchOutcome::Image(body),
                Err(e) => {
                    warn!("imgen image body from {} unreadable: {}", url, e);
                    FetchOutcome::ServiceError(SERVER_DOWN.to_string())
                }
            };
        }

        if status == reqwest::StatusCode::NOT_FOUND {
            return FetchOutcome::ServiceError(SERVER_NOT_FOUND.to_string());
        }

        match resp.json::<Value>().await {
            Ok(body) => {
                let message = body
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or(SERVER_DOWN);
                FetchOutcome::ServiceError(message.to_string())
            }
            Err(_) => FetchOutcome::ServiceError(SERVER_DOWN.to_string()),
        }
    }
}

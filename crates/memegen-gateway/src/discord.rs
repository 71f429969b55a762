use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Discord bot client using raw HTTP + WebSocket Gateway
#[derive(Clone)]
pub struct DiscordBot {
    client: reqwest::Client,
    token: String,
    api_base: String,
}

// ── Discord API types ──

#[derive(Debug, Clone, Deserialize)]
pub struct DiscordMessage {
    pub id: String,
    pub channel_id: String,
    pub content: String,
    pub author: DiscordUser,
    #[serde(default)]
    pub guild_id: Option<String>,
    #[serde(default)]
    pub attachments: Vec<DiscordAttachment>,
    #[serde(default)]
    pub mentions: Vec<DiscordUser>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscordUser {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub bot: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscordAttachment {
    pub id: String,
    pub filename: String,
    pub url: String,
    #[serde(default)]
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscordChannel {
    pub id: String,
    #[serde(rename = "type")]
    pub channel_type: u8,
    #[serde(default)]
    pub guild_id: Option<String>,
    #[serde(default)]
    pub permission_overwrites: Vec<PermissionOverwrite>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PermissionOverwrite {
    pub id: String,
    /// 0 = role, 1 = member
    #[serde(rename = "type")]
    pub kind: u8,
    pub allow: String,
    pub deny: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscordRole {
    pub id: String,
    pub permissions: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GuildMember {
    pub roles: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct GatewayResponse {
    url: String,
}

#[derive(Debug, Deserialize)]
struct GatewayPayload {
    op: u8,
    #[serde(default)]
    d: Option<Value>,
    #[serde(default)]
    s: Option<u64>,
    #[serde(default)]
    t: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateMessageRequest {
    content: String,
}

// ── Permission bits (Discord API v10) ──

pub const ADMINISTRATOR: u64 = 1 << 3;
pub const SEND_MESSAGES: u64 = 1 << 11;
pub const ATTACH_FILES: u64 = 1 << 15;

/// Gateway intents: guild + DM messages with content
const INTENT_GUILDS: u64 = 1 << 0;
const INTENT_GUILD_MESSAGES: u64 = 1 << 9;
const INTENT_DIRECT_MESSAGES: u64 = 1 << 12;
const INTENT_MESSAGE_CONTENT: u64 = 1 << 15;

impl DiscordBot {
    pub fn new(token: &str) -> Self {
        Self::with_api_base(token, "https://discord.com/api/v10")
    }

    /// Point the REST client at a different API root (tests).
    pub fn with_api_base(token: &str, api_base: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            token: token.to_string(),
            api_base: api_base.trim_end_matches('/').to_string(),
        }
    }

    fn auth(&self) -> String {
        format!("Bot {}", self.token)
    }

    /// Send a plain text message to a channel
    pub async fn send_message(&self, channel_id: &str, content: &str) -> Result<String> {
        let body = CreateMessageRequest {
            content: content.to_string(),
        };

        let resp = self
            .client
            .post(format!("{}/channels/{}/messages", self.api_base, channel_id))
            .header("Authorization", self.auth())
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .context("Failed to send Discord message")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let err_body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Discord sendMessage failed ({}): {}", status, err_body);
        }

        let msg: Value = resp.json().await?;
        Ok(msg["id"].as_str().unwrap_or("").to_string())
    }

    /// Upload an in-memory buffer as a file attachment
    pub async fn send_file(&self, channel_id: &str, bytes: Vec<u8>, filename: &str) -> Result<String> {
        let part = reqwest::multipart::Part::bytes(bytes).file_name(filename.to_string());
        let form = reqwest::multipart::Form::new().part("files[0]", part);

        let resp = self
            .client
            .post(format!("{}/channels/{}/messages", self.api_base, channel_id))
            .header("Authorization", self.auth())
            .multipart(form)
            .send()
            .await
            .context("Failed to send Discord file")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let err_body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Discord file upload failed ({}): {}", status, err_body);
        }

        let msg: Value = resp.json().await?;
        Ok(msg["id"].as_str().unwrap_or("").to_string())
    }

    /// Send typing indicator (fire and forget)
    pub async fn send_typing(&self, channel_id: &str) -> Result<()> {
        let _ = self
            .client
            .post(format!("{}/channels/{}/typing", self.api_base, channel_id))
            .header("Authorization", self.auth())
            .send()
            .await;
        Ok(())
    }

    /// React to a message (used as the success tick on admin commands)
    pub async fn add_reaction(&self, channel_id: &str, message_id: &str, emoji: &str) -> Result<()> {
        let resp = self
            .client
            .put(format!(
                "{}/channels/{}/messages/{}/reactions/{}/@me",
                self.api_base,
                channel_id,
                message_id,
                urlencoding::encode(emoji)
            ))
            .header("Authorization", self.auth())
            .send()
            .await
            .context("Failed to add Discord reaction")?;

        if !resp.status().is_success() {
            warn!("Discord addReaction failed ({})", resp.status());
        }
        Ok(())
    }

    /// Delete a message (secret hygiene after a token is posted)
    pub async fn delete_message(&self, channel_id: &str, message_id: &str) -> Result<()> {
        let resp = self
            .client
            .delete(format!(
                "{}/channels/{}/messages/{}",
                self.api_base, channel_id, message_id
            ))
            .header("Authorization", self.auth())
            .send()
            .await
            .context("Failed to delete Discord message")?;

        if !resp.status().is_success() {
            warn!("Discord deleteMessage failed ({})", resp.status());
        }
        Ok(())
    }

    /// Get current bot user info
    pub async fn get_me(&self) -> Result<DiscordUser> {
        let resp = self
            .client
            .get(format!("{}/users/@me", self.api_base))
            .header("Authorization", self.auth())
            .send()
            .await
            .context("Failed to call Discord /users/@me")?;

        if !resp.status().is_success() {
            let err = resp.text().await.unwrap_or_default();
            anyhow::bail!("Discord auth failed: {}", err);
        }

        resp.json().await.context("Failed to parse Discord user")
    }

    pub async fn get_channel(&self, channel_id: &str) -> Result<DiscordChannel> {
        let resp = self
            .client
            .get(format!("{}/channels/{}", self.api_base, channel_id))
            .header("Authorization", self.auth())
            .send()
            .await
            .context("Failed to fetch Discord channel")?;

        if !resp.status().is_success() {
            anyhow::bail!("Discord getChannel failed ({})", resp.status());
        }
        resp.json().await.context("Failed to parse Discord channel")
    }

    pub async fn get_guild_roles(&self, guild_id: &str) -> Result<Vec<DiscordRole>> {
        let resp = self
            .client
            .get(format!("{}/guilds/{}/roles", self.api_base, guild_id))
            .header("Authorization", self.auth())
            .send()
            .await
            .context("Failed to fetch guild roles")?;

        if !resp.status().is_success() {
            anyhow::bail!("Discord getGuildRoles failed ({})", resp.status());
        }
        resp.json().await.context("Failed to parse guild roles")
    }

    pub async fn get_guild_member(&self, guild_id: &str, user_id: &str) -> Result<GuildMember> {
        let resp = self
            .client
            .get(format!(
                "{}/guilds/{}/members/{}",
                self.api_base, guild_id, user_id
            ))
            .header("Authorization", self.auth())
            .send()
            .await
            .context("Failed to fetch guild member")?;

        if !resp.status().is_success() {
            anyhow::bail!("Discord getGuildMember failed ({})", resp.status());
        }
        resp.json().await.context("Failed to parse guild member")
    }

    /// Effective permissions of the bot user in a channel. DM channels
    /// carry no overwrites and allow sending and attaching.
    pub async fn permissions_in(&self, channel_id: &str, bot_user_id: &str) -> Result<u64> {
        let channel = self.get_channel(channel_id).await?;
        let Some(guild_id) = channel.guild_id.clone() else {
            return Ok(SEND_MESSAGES | ATTACH_FILES);
        };
        let roles = self.get_guild_roles(&guild_id).await?;
        let member = self.get_guild_member(&guild_id, bot_user_id).await?;
        Ok(compute_permissions(
            bot_user_id,
            &guild_id,
            &roles,
            &member.roles,
            &channel.permission_overwrites,
        ))
    }

    /// Get the Gateway WebSocket URL
    async fn get_gateway_url(&self) -> Result<String> {
        let resp: GatewayResponse = self
            .client
            .get(format!("{}/gateway/bot", self.api_base))
            .header("Authorization", self.auth())
            .send()
            .await
            .context("Failed to get Discord gateway URL")?
            .json()
            .await
            .context("Failed to parse gateway response")?;

        Ok(format!("{}/?v=10&encoding=json", resp.url))
    }

    /// Connect to the Discord Gateway via WebSocket and stream messages.
    /// Returns a receiver that yields MESSAGE_CREATE events.
    pub async fn connect_gateway(self: Arc<Self>) -> Result<mpsc::UnboundedReceiver<DiscordMessage>> {
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();

        let gateway_url = self.get_gateway_url().await?;
        info!("Connecting to Discord Gateway: {}", gateway_url);

        let token = self.token.clone();

        tokio::spawn(async move {
            if let Err(e) = run_gateway_loop(&gateway_url, &token, msg_tx).await {
                error!("Discord Gateway error: {}", e);
            }
        });

        Ok(msg_rx)
    }
}

/// Role bitfields come over the wire as decimal strings
fn parse_bits(bits: &str) -> u64 {
    bits.parse().unwrap_or(0)
}

/// Compute a member's effective channel permissions: union of role
/// permissions, ADMINISTRATOR short-circuit, then @everyone, role, and
/// member overwrites in that order.
pub fn compute_permissions(
    user_id: &str,
    guild_id: &str,
    guild_roles: &[DiscordRole],
    member_role_ids: &[String],
    overwrites: &[PermissionOverwrite],
) -> u64 {
    let mut base = 0u64;
    for role in guild_roles {
        // The @everyone role shares the guild id and applies to everyone
        if role.id == guild_id || member_role_ids.contains(&role.id) {
            base |= parse_bits(&role.permissions);
        }
    }

    if base & ADMINISTRATOR != 0 {
        return u64::MAX;
    }

    let mut perms = base;

    if let Some(ow) = overwrites.iter().find(|o| o.kind == 0 && o.id == guild_id) {
        perms = (perms & !parse_bits(&ow.deny)) | parse_bits(&ow.allow);
    }

    let mut allow = 0u64;
    let mut deny = 0u64;
    for ow in overwrites
        .iter()
        .filter(|o| o.kind == 0 && o.id != guild_id && member_role_ids.contains(&o.id))
    {
        allow |= parse_bits(&ow.allow);
        deny |= parse_bits(&ow.deny);
    }
    perms = (perms & !deny) | allow;

    if let Some(ow) = overwrites.iter().find(|o| o.kind == 1 && o.id == user_id) {
        perms = (perms & !parse_bits(&ow.deny)) | parse_bits(&ow.allow);
    }

    perms
}

/// State for Discord Gateway Resume (avoids re-Identify on reconnect)
struct ResumeState {
    session_id: String,
    sequence: u64,
    resume_url: Option<String>,
}

/// Main Gateway WebSocket loop with reconnection and exponential backoff
async fn run_gateway_loop(
    gateway_url: &str,
    token: &str,
    msg_tx: mpsc::UnboundedSender<DiscordMessage>,
) -> Result<()> {
    let mut reconnect_delay = 1u64;
    let mut resume_state: Option<ResumeState> = None;

    loop {
        let session_start = std::time::Instant::now();
        let connect_url = resume_state
            .as_ref()
            .and_then(|r| r.resume_url.clone())
            .unwrap_or_else(|| gateway_url.to_string());

        match run_gateway_session(&connect_url, token, &msg_tx, &mut resume_state).await {
            Ok(()) => {
                info!("Discord Gateway session ended cleanly, reconnecting in 5s...");
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                if session_start.elapsed().as_secs() > 30 {
                    reconnect_delay = 1;
                }
            }
            Err(e) => {
                let err_str = e.to_string();
                error!(
                    "Discord Gateway session error: {}. Reconnecting in {}s...",
                    err_str, reconnect_delay
                );
                if err_str.contains("Invalid session") {
                    info!("Clearing resume state — will re-Identify");
                    resume_state = None;
                }
                tokio::time::sleep(std::time::Duration::from_secs(reconnect_delay)).await;
                reconnect_delay = (reconnect_delay * 2).min(120);
                if session_start.elapsed().as_secs() > 60 {
                    reconnect_delay = 1;
                }
            }
        }

        if msg_tx.is_closed() {
            info!("Discord message channel closed, stopping gateway loop");
            break;
        }
    }

    Ok(())
}

/// Single Gateway WebSocket session
async fn run_gateway_session(
    gateway_url: &str,
    token: &str,
    msg_tx: &mpsc::UnboundedSender<DiscordMessage>,
    resume_state: &mut Option<ResumeState>,
) -> Result<()> {
    let (ws_stream, _) = tokio_tungstenite::connect_async(gateway_url)
        .await
        .context("Failed to connect to Discord Gateway WebSocket")?;

    let (mut ws_write, mut ws_read) = ws_stream.split();

    // Wait for Hello (op 10) to get heartbeat interval
    let hello = ws_read
        .next()
        .await
        .ok_or_else(|| anyhow::anyhow!("Gateway closed before Hello"))??;

    let hello_payload: GatewayPayload = serde_json::from_str(hello.to_text().unwrap_or("{}"))
        .context("Failed to parse Hello")?;

    if hello_payload.op != 10 {
        anyhow::bail!("Expected Hello (op 10), got op {}", hello_payload.op);
    }

    let heartbeat_ms = hello_payload
        .d
        .as_ref()
        .and_then(|d| d["heartbeat_interval"].as_u64())
        .unwrap_or(41250);

    debug!("Discord Gateway Hello, heartbeat interval: {}ms", heartbeat_ms);

    // Resume or Identify
    let handshake = if let Some(ref state) = resume_state {
        info!("Attempting Gateway Resume (seq={})", state.sequence);
        serde_json::json!({
            "op": 6,
            "d": {
                "token": token,
                "session_id": state.session_id,
                "seq": state.sequence,
            }
        })
    } else {
        serde_json::json!({
            "op": 2,
            "d": {
                "token": token,
                "intents": INTENT_GUILDS
                    | INTENT_GUILD_MESSAGES
                    | INTENT_DIRECT_MESSAGES
                    | INTENT_MESSAGE_CONTENT,
                "properties": {
                    "os": "linux",
                    "browser": "memegen",
                    "device": "memegen",
                }
            }
        })
    };
    ws_write
        .send(tokio_tungstenite::tungstenite::Message::Text(
            handshake.to_string().into(),
        ))
        .await
        .context("Failed to send Identify/Resume")?;

    // Heartbeat + message loop
    let mut sequence: Option<u64> = resume_state.as_ref().map(|r| r.sequence);
    let mut session_id: Option<String> = resume_state.as_ref().map(|r| r.session_id.clone());
    let mut resume_gateway_url: Option<String> = None;
    let mut heartbeat = tokio::time::interval(std::time::Duration::from_millis(heartbeat_ms));
    let mut last_ack = Instant::now();
    let mut awaiting_ack = false;
    let ack_timeout = std::time::Duration::from_secs(45);

    let save_resume = |session_id: &Option<String>,
                       sequence: Option<u64>,
                       resume_url: &Option<String>,
                       state: &mut Option<ResumeState>| {
        if let (Some(sid), Some(seq)) = (session_id, sequence) {
            *state = Some(ResumeState {
                session_id: sid.clone(),
                sequence: seq,
                resume_url: resume_url.clone(),
            });
        }
    };

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if awaiting_ack && last_ack.elapsed() > ack_timeout {
                    warn!("Heartbeat ACK timeout — forcing reconnect");
                    save_resume(&session_id, sequence, &resume_gateway_url, resume_state);
                    return Err(anyhow::anyhow!("Heartbeat ACK timeout"));
                }

                let hb = serde_json::json!({ "op": 1, "d": sequence });
                ws_write
                    .send(tokio_tungstenite::tungstenite::Message::Text(hb.to_string().into()))
                    .await
                    .context("Failed to send heartbeat")?;
                awaiting_ack = true;
            }
            msg = ws_read.next() => {
                match msg {
                    Some(Ok(ws_msg)) => {
                        if ws_msg.is_close() {
                            info!("Discord Gateway closed");
                            return Ok(());
                        }
                        let Ok(text) = ws_msg.to_text() else { continue };
                        let Ok(payload) = serde_json::from_str::<GatewayPayload>(text) else { continue };
                        if let Some(s) = payload.s {
                            sequence = Some(s);
                        }

                        match payload.op {
                            0 => match payload.t.as_deref() {
                                Some("MESSAGE_CREATE") => {
                                    if let Some(ref d) = payload.d {
                                        match serde_json::from_value::<DiscordMessage>(d.clone()) {
                                            Ok(discord_msg) => {
                                                // Never react to other bots (or ourselves)
                                                if discord_msg.author.bot.unwrap_or(false) {
                                                    continue;
                                                }
                                                let _ = msg_tx.send(discord_msg);
                                            }
                                            Err(e) => debug!("Failed to parse MESSAGE_CREATE: {}", e),
                                        }
                                    }
                                }
                                Some("READY") => {
                                    if let Some(ref d) = payload.d {
                                        let user = d["user"]["username"].as_str().unwrap_or("?");
                                        if let Some(sid) = d["session_id"].as_str() {
                                            session_id = Some(sid.to_string());
                                        }
                                        if let Some(url) = d["resume_gateway_url"].as_str() {
                                            resume_gateway_url =
                                                Some(format!("{}/?v=10&encoding=json", url));
                                        }
                                        info!("Discord Gateway READY as {}", user);
                                    }
                                }
                                Some("RESUMED") => info!("Discord Gateway RESUMED successfully"),
                                _ => {}
                            },
                            11 => {
                                last_ack = Instant::now();
                                awaiting_ack = false;
                            }
                            7 => {
                                save_resume(&session_id, sequence, &resume_gateway_url, resume_state);
                                info!("Discord Gateway requested reconnect");
                                return Err(anyhow::anyhow!("Reconnect requested"));
                            }
                            9 => {
                                let resumable = payload.d.as_ref().and_then(Value::as_bool).unwrap_or(false);
                                if !resumable {
                                    warn!("Discord Gateway: invalid session (not resumable)");
                                    *resume_state = None;
                                }
                                return Err(anyhow::anyhow!("Invalid session"));
                            }
                            _ => debug!("Gateway op {}", payload.op),
                        }
                    }
                    Some(Err(e)) => {
                        return Err(anyhow::anyhow!("WebSocket error: {}", e));
                    }
                    None => {
                        save_resume(&session_id, sequence, &resume_gateway_url, resume_state);
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn role(id: &str, permissions: u64) -> DiscordRole {
        DiscordRole {
            id: id.to_string(),
            permissions: permissions.to_string(),
        }
    }

    fn overwrite(id: &str, kind: u8, allow: u64, deny: u64) -> PermissionOverwrite {
        PermissionOverwrite {
            id: id.to_string(),
            kind,
            allow: allow.to_string(),
            deny: deny.to_string(),
        }
    }

    #[test]
    fn test_base_permissions_union_of_roles() {
        let roles = vec![role("guild", SEND_MESSAGES), role("r1", ATTACH_FILES)];
        let perms = compute_permissions("u1", "guild", &roles, &["r1".to_string()], &[]);
        assert!(perms & SEND_MESSAGES != 0);
        assert!(perms & ATTACH_FILES != 0);
    }

    #[test]
    fn test_administrator_short_circuits() {
        let roles = vec![role("guild", 0), role("admin", ADMINISTRATOR)];
        let overwrites = vec![overwrite("guild", 0, 0, SEND_MESSAGES | ATTACH_FILES)];
        let perms = compute_permissions("u1", "guild", &roles, &["admin".to_string()], &overwrites);
        assert!(perms & SEND_MESSAGES != 0);
        assert!(perms & ATTACH_FILES != 0);
    }

    #[test]
    fn test_everyone_overwrite_denies() {
        let roles = vec![role("guild", SEND_MESSAGES | ATTACH_FILES)];
        let overwrites = vec![overwrite("guild", 0, 0, ATTACH_FILES)];
        let perms = compute_permissions("u1", "guild", &roles, &[], &overwrites);
        assert!(perms & SEND_MESSAGES != 0);
        assert!(perms & ATTACH_FILES == 0);
    }

    #[test]
    fn test_role_overwrite_allow_beats_everyone_deny() {
        let roles = vec![role("guild", SEND_MESSAGES)];
        let overwrites = vec![
            overwrite("guild", 0, 0, ATTACH_FILES),
            overwrite("r1", 0, ATTACH_FILES, 0),
        ];
        let perms = compute_permissions("u1", "guild", &roles, &["r1".to_string()], &overwrites);
        assert!(perms & ATTACH_FILES != 0);
    }

    #[test]
    fn test_member_overwrite_applies_last() {
        let roles = vec![role("guild", SEND_MESSAGES | ATTACH_FILES)];
        let overwrites = vec![
            overwrite("r1", 0, ATTACH_FILES, 0),
            overwrite("u1", 1, 0, ATTACH_FILES),
        ];
        let perms = compute_permissions("u1", "guild", &roles, &["r1".to_string()], &overwrites);
        assert!(perms & ATTACH_FILES == 0);
        assert!(perms & SEND_MESSAGES != 0);
    }

    #[test]
    fn test_unrelated_role_overwrites_ignored() {
        let roles = vec![role("guild", SEND_MESSAGES)];
        let overwrites = vec![overwrite("other-role", 0, 0, SEND_MESSAGES)];
        let perms = compute_permissions("u1", "guild", &roles, &[], &overwrites);
        assert!(perms & SEND_MESSAGES != 0);
    }

    #[test]
    fn test_parse_bits_garbage_is_zero() {
        assert_eq!(parse_bits("not-a-number"), 0);
        assert_eq!(parse_bits(""), 0);
    }

    #[test]
    fn test_intents_include_message_content() {
        let intents =
            INTENT_GUILDS | INTENT_GUILD_MESSAGES | INTENT_DIRECT_MESSAGES | INTENT_MESSAGE_CONTENT;
        assert!(intents & INTENT_MESSAGE_CONTENT != 0);
        assert!(intents & INTENT_DIRECT_MESSAGES != 0);
    }
}

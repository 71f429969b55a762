use anyhow::Result;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use memegen_core::client::{FetchOutcome, ImgenClient};
use memegen_core::commands::{self, MemeCommand};
use memegen_core::config::BotConfig;
use memegen_core::credentials::{CredentialBus, CredentialStore, AUTHORIZATION_KEY, IMGEN_SERVICE};

use crate::confirm;
use crate::discord::{DiscordBot, DiscordMessage, ATTACH_FILES, SEND_MESSAGES};
use crate::images;

/// How long the owner gets to answer the seturl confirmation prompt.
pub const CONFIRM_TIMEOUT: Duration = Duration::from_secs(20);

/// Process-wide state shared by all invocations: the imgen client and the
/// paths/identities needed to mutate configuration. Read-mostly; the
/// mutable pieces live behind the client's own locks.
pub struct BotState {
    pub client: ImgenClient,
    pub bus: CredentialBus,
    pub config_path: PathBuf,
    pub credentials_path: PathBuf,
    pub prefix: String,
    pub owner_ids: Vec<u64>,
    pub bot_user_id: String,
    pub confirm_timeout: Duration,
}

impl BotState {
    fn is_owner(&self, user_id: &str) -> bool {
        user_id
            .parse::<u64>()
            .map(|id| self.owner_ids.contains(&id))
            .unwrap_or(false)
    }
}

/// Keeps the channel's typing indicator alive until dropped, so every
/// exit path of the request clears it.
struct TypingGuard {
    cancel: CancellationToken,
}

impl TypingGuard {
    fn start(bot: DiscordBot, channel_id: String) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        tokio::spawn(async move {
            loop {
                bot.send_typing(&channel_id).await.ok();
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(8)) => {}
                    _ = token.cancelled() => break,
                }
            }
        });
        Self { cancel }
    }
}

impl Drop for TypingGuard {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Handle one incoming Discord message
pub async fn handle_message(bot: &DiscordBot, msg: &DiscordMessage, state: &BotState) -> Result<()> {
    let text = msg.content.trim();
    let Some(invocation) = text.strip_prefix(&state.prefix) else {
        return Ok(());
    };

    let mut parts = invocation.splitn(2, char::is_whitespace);
    let command = parts.next().unwrap_or("").to_lowercase();
    let rest = parts.next().unwrap_or("").trim();

    match command.as_str() {
        "memesetup" => send_setup(bot, msg, state).await,
        "memes" => send_command_list(bot, msg, state).await,
        "seturl" => set_url(bot, msg, state, rest).await,
        "settoken" => set_token(bot, msg, state, rest).await,
        _ => match commands::find(&command) {
            Some(cmd) => run_meme(bot, msg, state, cmd, rest).await,
            None => Ok(()),
        },
    }
}

/// The shared request/response/delivery flow behind every meme command.
async fn run_meme(
    bot: &DiscordBot,
    msg: &DiscordMessage,
    state: &BotState,
    cmd: &MemeCommand,
    rest: &str,
) -> Result<()> {
    // No credential, no command. The dispatcher swallows the invocation.
    if !state.client.has_token() {
        debug!("Ignoring {}{}: no imgen credential configured", state.prefix, cmd.name);
        return Ok(());
    }

    let value = if cmd.takes_text() {
        if rest.is_empty() {
            bot.send_message(
                &msg.channel_id,
                &format!("Usage: {}{} <text>", state.prefix, cmd.name),
            )
            .await?;
            return Ok(());
        }
        rest.to_string()
    } else {
        images::resolve_image(msg, rest)
    };

    let outcome = {
        let _typing = TypingGuard::start(bot.clone(), msg.channel_id.clone());
        state.client.fetch(&cmd.build_suffix(&value), false).await
    };

    match outcome {
        FetchOutcome::ServiceError(error) => {
            bot.send_message(
                &msg.channel_id,
                &format!("Oops, an error occured. `{}`", error),
            )
            .await?;
        }
        FetchOutcome::Image(bytes) => {
            deliver(bot, msg, state, bytes.to_vec(), cmd.filename).await?;
        }
        FetchOutcome::Json(_) => {
            // No meme command asks for JSON; the flag exists for the
            // client contract only.
            debug!("Unexpected JSON outcome for {}{}", state.prefix, cmd.name);
        }
    }

    Ok(())
}

/// Deliver a rendered image as a file attachment, honoring channel
/// permissions: missing send-messages is a silent no-op, missing
/// attach-files gets one line, and a failed upload degrades to text.
async fn deliver(
    bot: &DiscordBot,
    msg: &DiscordMessage,
    state: &BotState,
    bytes: Vec<u8>,
    filename: &str,
) -> Result<()> {
    match bot.permissions_in(&msg.channel_id, &state.bot_user_id).await {
        Ok(perms) => {
            if perms & SEND_MESSAGES == 0 {
                debug!("No send permission in channel {}, dropping image", msg.channel_id);
                return Ok(());
            }
            if perms & ATTACH_FILES == 0 {
                bot.send_message(&msg.channel_id, "I don't have permission to attach files.")
                    .await?;
                return Ok(());
            }
        }
        // Permission lookup is advisory; a real failure surfaces on the send
        Err(e) => debug!("Permission lookup failed for {}: {}", msg.channel_id, e),
    }

    if let Err(e) = bot.send_file(&msg.channel_id, bytes, filename).await {
        warn!("File upload to {} failed: {}", msg.channel_id, e);
        let _ = bot
            .send_message(&msg.channel_id, "An error occured sending the picture.")
            .await;
    }
    Ok(())
}

async fn send_setup(bot: &DiscordBot, msg: &DiscordMessage, state: &BotState) -> Result<()> {
    let text = format!(
        "You must host your own instance of imgen or apply for a publically available instance.\n\
        You can then set the url endpoint using the `{prefix}seturl <url>` command. (Support will be limited if using your own instance.)\n\n\
        You can set the token using `{prefix}settoken <key>`",
        prefix = state.prefix
    );
    bot.send_message(&msg.channel_id, &text).await?;
    Ok(())
}

async fn send_command_list(bot: &DiscordBot, msg: &DiscordMessage, state: &BotState) -> Result<()> {
    let mut lines: Vec<String> = commands::COMMANDS
        .iter()
        .map(|c| format!("`{}{}` — {}", state.prefix, c.name, c.help))
        .collect();
    lines.sort();
    bot.send_message(&msg.channel_id, &lines.join("\n")).await?;
    Ok(())
}

/// A URL the seturl command accepts: absolute http(s) with a host.
fn is_valid_url(input: &str) -> bool {
    match url::Url::parse(input) {
        Ok(parsed) => matches!(parsed.scheme(), "http" | "https") && parsed.host_str().is_some(),
        Err(_) => false,
    }
}

/// Owner-only: change the imgen base URL behind a yes/no confirmation
/// prompt bounded by a fixed timeout.
async fn set_url(bot: &DiscordBot, msg: &DiscordMessage, state: &BotState, rest: &str) -> Result<()> {
    if !state.is_owner(&msg.author.id) {
        debug!("Ignoring seturl from non-owner {}", msg.author.id);
        return Ok(());
    }

    let url_arg = rest.trim();
    if !is_valid_url(url_arg) {
        bot.send_message(
            &msg.channel_id,
            &format!("{} doesn't seem to be a valid URL. Please try again.", url_arg),
        )
        .await?;
        return Ok(());
    }

    bot.send_message(
        &msg.channel_id,
        "This has the ability to make every command fail if the URL is not reachable and/or not working. \
        Only use this if you're experienced enough to understand. Type yes to continue, otherwise type no.",
    )
    .await?;

    match confirm::await_confirmation(&msg.channel_id, &msg.author.id, state.confirm_timeout).await {
        None => {
            bot.send_message(&msg.channel_id, "Exiting operation.").await?;
        }
        Some(false) => {
            bot.send_message(&msg.channel_id, "Operation cancelled.").await?;
        }
        Some(true) => {
            let config = BotConfig {
                url: url_arg.to_string(),
            };
            memegen_core::config::store(&state.config_path, &config)?;
            let store = CredentialStore::load(&state.credentials_path)?;
            state.client.reinitialize(&config, &store);
            info!("imgen base URL changed to {}", url_arg);
            bot.add_reaction(&msg.channel_id, &msg.id, "✅").await.ok();
        }
    }

    Ok(())
}

/// Owner-only: store the imgen authorization token and broadcast the
/// credential update. The invoking message is deleted when possible so
/// the secret does not linger in chat.
async fn set_token(bot: &DiscordBot, msg: &DiscordMessage, state: &BotState, rest: &str) -> Result<()> {
    if !state.is_owner(&msg.author.id) {
        debug!("Ignoring settoken from non-owner {}", msg.author.id);
        return Ok(());
    }

    let token = rest.trim();
    if token.is_empty() {
        bot.send_message(
            &msg.channel_id,
            &format!("Usage: {}settoken <key>", state.prefix),
        )
        .await?;
        return Ok(());
    }

    let mut store = CredentialStore::load(&state.credentials_path)?;
    store.set_token(IMGEN_SERVICE, AUTHORIZATION_KEY, token);
    store.store(&state.credentials_path)?;
    state
        .bus
        .publish(IMGEN_SERVICE, store.service_tokens(IMGEN_SERVICE));

    bot.delete_message(&msg.channel_id, &msg.id).await.ok();
    bot.send_message(&msg.channel_id, "Imgen token updated.").await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discord::DiscordUser;
    use memegen_core::client::SERVER_NOT_FOUND;
    use serde_json::json;
    use std::sync::Arc;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_valid_urls() {
        assert!(is_valid_url("https://imgen.flaree.xyz/api"));
        assert!(is_valid_url("http://localhost:8080/api"));
    }

    #[test]
    fn test_invalid_urls() {
        assert!(!is_valid_url("imgen.flaree.xyz/api"));
        assert!(!is_valid_url("ftp://imgen.flaree.xyz/api"));
        assert!(!is_valid_url("not a url at all"));
        assert!(!is_valid_url(""));
    }

    fn state_for(
        imgen: &MockServer,
        token: Option<&str>,
        dir: &std::path::Path,
        confirm_timeout: Duration,
    ) -> BotState {
        BotState {
            client: ImgenClient::new(imgen.uri(), token.map(str::to_string)),
            bus: CredentialBus::new(),
            config_path: dir.join("config.json"),
            credentials_path: dir.join("credentials.json"),
            prefix: "!".to_string(),
            owner_ids: vec![500],
            bot_user_id: "42".to_string(),
            confirm_timeout,
        }
    }

    #[test]
    fn test_owner_check_parses_snowflakes() {
        let state = BotState {
            client: ImgenClient::new("http://localhost", None),
            bus: CredentialBus::new(),
            config_path: PathBuf::from("/tmp/none"),
            credentials_path: PathBuf::from("/tmp/none"),
            prefix: "!".to_string(),
            owner_ids: vec![80351110224678912],
            bot_user_id: "1".to_string(),
            confirm_timeout: CONFIRM_TIMEOUT,
        };
        assert!(state.is_owner("80351110224678912"));
        assert!(!state.is_owner("2"));
        assert!(!state.is_owner("garbage"));
    }

    fn message_in(channel_id: &str, content: &str) -> DiscordMessage {
        DiscordMessage {
            id: "900".to_string(),
            channel_id: channel_id.to_string(),
            content: content.to_string(),
            author: DiscordUser {
                id: "500".to_string(),
                username: "tester".to_string(),
                avatar: None,
                bot: None,
            },
            guild_id: None,
            attachments: vec![],
            mentions: vec![],
        }
    }

    async fn mount_dm_channel(discord: &MockServer, channel_id: &str) {
        Mock::given(method("GET"))
            .and(path(format!("/channels/{}", channel_id)))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "id": channel_id, "type": 1 })),
            )
            .mount(discord)
            .await;
    }

    async fn mount_typing(discord: &MockServer, channel_id: &str) {
        Mock::given(method("POST"))
            .and(path(format!("/channels/{}/typing", channel_id)))
            .respond_with(ResponseTemplate::new(204))
            .mount(discord)
            .await;
    }

    #[tokio::test]
    async fn test_meme_flow_delivers_image() {
        let imgen = MockServer::start().await;
        let discord = MockServer::start().await;
        let image: &[u8] = b"\x89PNG fake image bytes";

        Mock::given(method("GET"))
            .and(path("/abandon"))
            .and(query_param("text", "my son"))
            .and(header("Authorization", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(image))
            .expect(1)
            .mount(&imgen)
            .await;

        mount_dm_channel(&discord, "10").await;
        mount_typing(&discord, "10").await;
        Mock::given(method("POST"))
            .and(path("/channels/10/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "51" })))
            .expect(1)
            .mount(&discord)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let state = state_for(&imgen, Some("secret"), dir.path(), CONFIRM_TIMEOUT);
        let bot = DiscordBot::with_api_base("bot-token", &discord.uri());

        handle_message(&bot, &message_in("10", "!abandon my son"), &state)
            .await
            .unwrap();

        let upload = discord
            .received_requests()
            .await
            .unwrap()
            .into_iter()
            .find(|r| r.url.path() == "/channels/10/messages")
            .expect("file upload request");
        assert!(upload.body.windows(image.len()).any(|w| w == image));
        assert!(String::from_utf8_lossy(&upload.body).contains("abandon.png"));
    }

    #[tokio::test]
    async fn test_remote_404_sends_oops_line() {
        let imgen = MockServer::start().await;
        let discord = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&imgen)
            .await;

        mount_typing(&discord, "11").await;
        Mock::given(method("POST"))
            .and(path("/channels/11/messages"))
            .and(body_json(json!({
                "content": format!("Oops, an error occured. `{}`", SERVER_NOT_FOUND)
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "52" })))
            .expect(1)
            .mount(&discord)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let state = state_for(&imgen, Some("secret"), dir.path(), CONFIRM_TIMEOUT);
        let bot = DiscordBot::with_api_base("bot-token", &discord.uri());

        handle_message(&bot, &message_in("11", "!kabhi aisa"), &state)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_meme_ignored_without_token() {
        let imgen = MockServer::start().await;
        let discord = MockServer::start().await;

        let dir = tempfile::tempdir().unwrap();
        let state = state_for(&imgen, None, dir.path(), CONFIRM_TIMEOUT);
        let bot = DiscordBot::with_api_base("bot-token", &discord.uri());

        handle_message(&bot, &message_in("12", "!abandon my son"), &state)
            .await
            .unwrap();

        assert!(imgen.received_requests().await.unwrap().is_empty());
        assert!(discord.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_image_command_defaults_to_author_avatar() {
        let imgen = MockServer::start().await;
        let discord = MockServer::start().await;

        let msg = message_in("13", "!affect");
        let expected_avatar = images::avatar_url(&msg.author);

        Mock::given(method("GET"))
            .and(path("/affect"))
            .and(query_param("avatar1", expected_avatar.as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"img".as_slice()))
            .expect(1)
            .mount(&imgen)
            .await;

        mount_dm_channel(&discord, "13").await;
        mount_typing(&discord, "13").await;
        Mock::given(method("POST"))
            .and(path("/channels/13/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "53" })))
            .mount(&discord)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let state = state_for(&imgen, Some("secret"), dir.path(), CONFIRM_TIMEOUT);
        let bot = DiscordBot::with_api_base("bot-token", &discord.uri());

        handle_message(&bot, &msg, &state).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_attach_permission_reports() {
        let imgen = MockServer::start().await;
        let discord = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"img".as_slice()))
            .mount(&imgen)
            .await;

        mount_typing(&discord, "14").await;
        Mock::given(method("GET"))
            .and(path("/channels/14"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "14", "type": 0, "guild_id": "g1", "permission_overwrites": []
            })))
            .mount(&discord)
            .await;
        Mock::given(method("GET"))
            .and(path("/guilds/g1/roles"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "id": "g1", "permissions": SEND_MESSAGES.to_string() }
            ])))
            .mount(&discord)
            .await;
        Mock::given(method("GET"))
            .and(path("/guilds/g1/members/42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "roles": [] })))
            .mount(&discord)
            .await;
        Mock::given(method("POST"))
            .and(path("/channels/14/messages"))
            .and(body_json(json!({ "content": "I don't have permission to attach files." })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "54" })))
            .expect(1)
            .mount(&discord)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let state = state_for(&imgen, Some("secret"), dir.path(), CONFIRM_TIMEOUT);
        let bot = DiscordBot::with_api_base("bot-token", &discord.uri());

        handle_message(&bot, &message_in("14", "!brazzers"), &state)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_missing_send_permission_is_silent() {
        let imgen = MockServer::start().await;
        let discord = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"img".as_slice()))
            .mount(&imgen)
            .await;

        mount_typing(&discord, "15").await;
        Mock::given(method("GET"))
            .and(path("/channels/15"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "15", "type": 0, "guild_id": "g2", "permission_overwrites": []
            })))
            .mount(&discord)
            .await;
        Mock::given(method("GET"))
            .and(path("/guilds/g2/roles"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "id": "g2", "permissions": "0" }
            ])))
            .mount(&discord)
            .await;
        Mock::given(method("GET"))
            .and(path("/guilds/g2/members/42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "roles": [] })))
            .mount(&discord)
            .await;
        Mock::given(method("POST"))
            .and(path("/channels/15/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "55" })))
            .expect(0)
            .mount(&discord)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let state = state_for(&imgen, Some("secret"), dir.path(), CONFIRM_TIMEOUT);
        let bot = DiscordBot::with_api_base("bot-token", &discord.uri());

        handle_message(&bot, &message_in("15", "!kyabe"), &state)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_seturl_rejects_invalid_url() {
        let imgen = MockServer::start().await;
        let discord = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/channels/16/messages"))
            .and(body_json(json!({
                "content": "notaurl doesn't seem to be a valid URL. Please try again."
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "56" })))
            .expect(1)
            .mount(&discord)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let state = state_for(&imgen, Some("secret"), dir.path(), CONFIRM_TIMEOUT);
        let old_url = state.client.base_url();
        let bot = DiscordBot::with_api_base("bot-token", &discord.uri());

        handle_message(&bot, &message_in("16", "!seturl notaurl"), &state)
            .await
            .unwrap();

        assert!(!state.config_path.exists());
        assert_eq!(state.client.base_url(), old_url);
    }

    #[tokio::test]
    async fn test_seturl_yes_commits_new_url() {
        let imgen = MockServer::start().await;
        let discord = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/channels/17/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "57" })))
            .mount(&discord)
            .await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&discord)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(state_for(&imgen, Some("secret"), dir.path(), CONFIRM_TIMEOUT));
        let bot = DiscordBot::with_api_base("bot-token", &discord.uri());

        let task_state = state.clone();
        let task_bot = bot.clone();
        let task = tokio::spawn(async move {
            handle_message(
                &task_bot,
                &message_in("17", "!seturl http://imgen.example.org/api"),
                &task_state,
            )
            .await
        });

        let reply = message_in("17", "yes");
        let mut claimed = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if confirm::try_claim(&reply) {
                claimed = true;
                break;
            }
        }
        assert!(claimed, "confirmation prompt never registered");
        task.await.unwrap().unwrap();

        let stored = memegen_core::config::load(&state.config_path).unwrap();
        assert_eq!(stored.url, "http://imgen.example.org/api");
        assert_eq!(state.client.base_url(), "http://imgen.example.org/api");
    }

    #[tokio::test]
    async fn test_seturl_no_leaves_url_unchanged() {
        let imgen = MockServer::start().await;
        let discord = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/channels/18/messages"))
            .and(body_json(json!({ "content": "Operation cancelled." })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "58" })))
            .expect(1)
            .mount(&discord)
            .await;
        Mock::given(method("POST"))
            .and(path("/channels/18/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "59" })))
            .mount(&discord)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(state_for(&imgen, Some("secret"), dir.path(), CONFIRM_TIMEOUT));
        let old_url = state.client.base_url();
        let bot = DiscordBot::with_api_base("bot-token", &discord.uri());

        let task_state = state.clone();
        let task_bot = bot.clone();
        let task = tokio::spawn(async move {
            handle_message(
                &task_bot,
                &message_in("18", "!seturl http://imgen.example.org/api"),
                &task_state,
            )
            .await
        });

        let reply = message_in("18", "no");
        let mut claimed = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if confirm::try_claim(&reply) {
                claimed = true;
                break;
            }
        }
        assert!(claimed);
        task.await.unwrap().unwrap();

        assert!(!state.config_path.exists());
        assert_eq!(state.client.base_url(), old_url);
    }

    #[tokio::test]
    async fn test_seturl_timeout_aborts() {
        let imgen = MockServer::start().await;
        let discord = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/channels/19/messages"))
            .and(body_json(json!({ "content": "Exiting operation." })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "60" })))
            .expect(1)
            .mount(&discord)
            .await;
        Mock::given(method("POST"))
            .and(path("/channels/19/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "61" })))
            .mount(&discord)
            .await;

        let dir = tempfile::tempdir().unwrap();
        // Same code path as production, just a short clock
        let state = state_for(&imgen, Some("secret"), dir.path(), Duration::from_millis(50));
        let old_url = state.client.base_url();
        let bot = DiscordBot::with_api_base("bot-token", &discord.uri());

        handle_message(
            &bot,
            &message_in("19", "!seturl http://imgen.example.org/api"),
            &state,
        )
        .await
        .unwrap();

        assert!(!state.config_path.exists());
        assert_eq!(state.client.base_url(), old_url);
    }

    #[tokio::test]
    async fn test_settoken_stores_and_notifies() {
        let imgen = MockServer::start().await;
        let discord = MockServer::start().await;

        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&discord)
            .await;
        Mock::given(method("POST"))
            .and(path("/channels/20/messages"))
            .and(body_json(json!({ "content": "Imgen token updated." })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "62" })))
            .expect(1)
            .mount(&discord)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(state_for(&imgen, None, dir.path(), CONFIRM_TIMEOUT));
        let bot = DiscordBot::with_api_base("bot-token", &discord.uri());

        // The same subscription wiring main() uses
        let mut cred_rx = state.bus.subscribe();
        let sub_state = state.clone();
        tokio::spawn(async move {
            while cred_rx.changed().await.is_ok() {
                let update = cred_rx.borrow_and_update().clone();
                if let Some(update) = update {
                    sub_state
                        .client
                        .apply_credential_update(&update.service, &update.tokens);
                }
            }
        });

        assert!(!state.client.has_token());
        handle_message(&bot, &message_in("20", "!settoken s3cret"), &state)
            .await
            .unwrap();

        let mut applied = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if state.client.has_token() {
                applied = true;
                break;
            }
        }
        assert!(applied, "credential update never reached the client");

        let store = CredentialStore::load(&state.credentials_path).unwrap();
        assert_eq!(store.token(IMGEN_SERVICE, AUTHORIZATION_KEY), Some("s3cret"));
    }

    #[tokio::test]
    async fn test_settoken_from_non_owner_ignored() {
        let imgen = MockServer::start().await;
        let discord = MockServer::start().await;

        let dir = tempfile::tempdir().unwrap();
        let state = state_for(&imgen, None, dir.path(), CONFIRM_TIMEOUT);
        let bot = DiscordBot::with_api_base("bot-token", &discord.uri());

        let mut msg = message_in("21", "!settoken s3cret");
        msg.author.id = "9999".to_string();
        handle_message(&bot, &msg, &state).await.unwrap();

        assert!(!state.credentials_path.exists());
        assert!(discord.received_requests().await.unwrap().is_empty());
    }
}

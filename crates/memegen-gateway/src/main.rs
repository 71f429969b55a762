mod config;
mod confirm;
mod discord;
mod handler;
mod images;

use std::sync::Arc;
use tracing::{error, info, warn};

use memegen_core::credentials::{CredentialStore, AUTHORIZATION_KEY, IMGEN_SERVICE};
use memegen_core::{client::ImgenClient, credentials::CredentialBus, paths};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "memegen_gateway=info".into()),
        )
        .init();

    let gw_config = config::GatewayConfig::from_file_or_env(&paths::gateway_config_path())?;

    info!("memegen-gateway v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Prefix: {} | Owners: {:?}",
        gw_config.prefix, gw_config.discord.owner_ids
    );

    // ── Verify bot token ──
    let bot = discord::DiscordBot::new(&gw_config.discord.bot_token);
    let me = bot.get_me().await?;
    info!("Discord bot verified: @{}", me.username);

    // ── Load persisted state ──
    let bot_config = memegen_core::config::load(&paths::bot_config_path())?;
    let creds = CredentialStore::load(&paths::credentials_path())?;
    if creds.token(IMGEN_SERVICE, AUTHORIZATION_KEY).is_none() {
        warn!(
            "No imgen credential configured; meme commands stay disabled until {}settoken is used",
            gw_config.prefix
        );
    }
    info!("imgen base URL: {}", bot_config.url);

    let state = Arc::new(handler::BotState {
        client: ImgenClient::from_state(&bot_config, &creds),
        bus: CredentialBus::new(),
        config_path: paths::bot_config_path(),
        credentials_path: paths::credentials_path(),
        prefix: gw_config.prefix.clone(),
        owner_ids: gw_config.discord.owner_ids.clone(),
        bot_user_id: me.id.clone(),
        confirm_timeout: handler::CONFIRM_TIMEOUT,
    });

    // ── Apply credential-update notifications to the client ──
    let mut cred_rx = state.bus.subscribe();
    let cred_state = state.clone();
    tokio::spawn(async move {
        while cred_rx.changed().await.is_ok() {
            let update = cred_rx.borrow_and_update().clone();
            if let Some(update) = update {
                cred_state
                    .client
                    .apply_credential_update(&update.service, &update.tokens);
            }
        }
    });

    // ── Connect the gateway and dispatch messages ──
    let bot = Arc::new(bot);
    let mut msg_rx = bot.clone().connect_gateway().await?;
    info!("Listening for messages...");

    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        let sigterm = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("Failed to install SIGTERM handler")
                .recv()
                .await;
        };
        #[cfg(not(unix))]
        let sigterm = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT (Ctrl+C)"),
            _ = sigterm => info!("Received SIGTERM"),
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown signal received, stopping");
                return Ok(());
            }
            msg = msg_rx.recv() => {
                let Some(msg) = msg else {
                    warn!("Gateway message stream closed");
                    return Ok(());
                };

                // Pending yes/no prompts get first claim on replies
                if confirm::try_claim(&msg) {
                    continue;
                }

                let bot = bot.clone();
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(e) = handler::handle_message(&bot, &msg, &state).await {
                        error!("Handler error: {}", e);
                    }
                });
            }
        }
    }
}

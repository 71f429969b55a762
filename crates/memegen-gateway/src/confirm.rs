use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use tokio::sync::oneshot;

use crate::discord::DiscordMessage;

/// Global registry of pending yes/no confirmations, keyed by
/// (channel, user). The gateway loop offers every incoming message here
/// before normal dispatch; a matching yes/no reply resolves the waiter
/// and is consumed instead of being handled as a command.
static REGISTRY: OnceLock<Mutex<HashMap<(String, String), oneshot::Sender<bool>>>> =
    OnceLock::new();

fn registry() -> &'static Mutex<HashMap<(String, String), oneshot::Sender<bool>>> {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

fn key(channel_id: &str, user_id: &str) -> (String, String) {
    (channel_id.to_string(), user_id.to_string())
}

/// Interpret a reply as yes/no, case-insensitively. Anything else is not
/// an answer and keeps the waiter pending.
pub fn parse_yes_no(text: &str) -> Option<bool> {
    match text.trim().to_lowercase().as_str() {
        "yes" | "y" => Some(true),
        "no" | "n" => Some(false),
        _ => None,
    }
}

fn register(channel_id: &str, user_id: &str) -> oneshot::Receiver<bool> {
    let (tx, rx) = oneshot::channel();
    // A newer prompt for the same user supersedes the old one
    registry().lock().unwrap().insert(key(channel_id, user_id), tx);
    rx
}

fn unregister(channel_id: &str, user_id: &str) {
    registry().lock().unwrap().remove(&key(channel_id, user_id));
}

/// Offer a message to the registry. Returns true when it answered a
/// pending confirmation and must not be dispatched further.
pub fn try_claim(msg: &DiscordMessage) -> bool {
    let Some(answer) = parse_yes_no(&msg.content) else {
        return false;
    };
    let mut map = registry().lock().unwrap();
    if let Some(tx) = map.remove(&key(&msg.channel_id, &msg.author.id)) {
        let _ = tx.send(answer);
        return true;
    }
    false
}

/// Wait for the invoking user's yes/no reply in the same channel.
/// Returns None on timeout.
pub async fn await_confirmation(
    channel_id: &str,
    user_id: &str,
    timeout: std::time::Duration,
) -> Option<bool> {
    let rx = register(channel_id, user_id);
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(answer)) => Some(answer),
        _ => {
            unregister(channel_id, user_id);
            None
        }
    }
}

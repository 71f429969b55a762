use crate::discord::{DiscordAttachment, DiscordMessage, DiscordUser};

const CDN_BASE: &str = "https://cdn.discordapp.com";

/// A user's avatar as a static PNG CDN URL. Users without a custom avatar
/// get the default embed avatar derived from their id.
pub fn avatar_url(user: &DiscordUser) -> String {
    match &user.avatar {
        Some(hash) => format!("{}/avatars/{}/{}.png?size=1024", CDN_BASE, user.id, hash),
        None => {
            let index = user.id.parse::<u64>().map(|id| (id >> 22) % 6).unwrap_or(0);
            format!("{}/embed/avatars/{}.png", CDN_BASE, index)
        }
    }
}

fn is_image_attachment(attachment: &DiscordAttachment) -> bool {
    if let Some(ct) = attachment.content_type.as_deref() {
        return ct.starts_with("image/");
    }
    let name = attachment.filename.to_lowercase();
    [".png", ".jpg", ".jpeg", ".gif", ".webp"]
        .iter()
        .any(|ext| name.ends_with(ext))
}

/// Resolve an "image" argument to a concrete image URL.
///
/// Order: first image attachment, first mentioned user's avatar, a raw
/// http(s) URL argument, and finally the invoking user's own avatar.
pub fn resolve_image(msg: &DiscordMessage, arg: &str) -> String {
    if let Some(attachment) = msg.attachments.iter().find(|a| is_image_attachment(a)) {
        return attachment.url.clone();
    }
    if let Some(mentioned) = msg.mentions.first() {
        return avatar_url(mentioned);
    }
    let arg = arg.trim();
    if !arg.is_empty() {
        if let Ok(parsed) = url::Url::parse(arg) {
            if matches!(parsed.scheme(), "http" | "https") {
                return arg.to_string();
            }
        }
    }
    avatar_url(&msg.author)
}

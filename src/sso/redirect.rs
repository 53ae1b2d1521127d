//! Post-login redirect target from the Teams `sub_entity_id` hint.
//!
//! - `post_preview_<id>` → `/plugins/<plugin>/iframe/notification_preview?post_id=<id>`
//! - `post_<id>` → `/<team>/pl/<id>`, where the team is the post channel's
//!   team, or the user's first team for channels without one
//! - anything else → `/`
//!
//! Lookup failures are logged and fall back to `/`. This path never errors.

use tracing::error;
use url::Url;

use crate::host::ContentDirectory;

/// Home path.
pub const HOME: &str = "/";

const POST_PREVIEW_PREFIX: &str = "post_preview_";
const POST_PREFIX: &str = "post_";

/// Resolve where to send `user_id` after authentication.
pub async fn resolve_redirect(
    content: &dyn ContentDirectory,
    plugin_id: &str,
    user_id: &str,
    sub_entity_id: Option<&str>,
) -> String {
    let Some(hint) = sub_entity_id.filter(|s| !s.is_empty()) else {
        return HOME.to_string();
    };

    // The preview prefix also starts with "post_", so it is checked first
    if let Some(post_id) = hint.strip_prefix(POST_PREVIEW_PREFIX) {
        return notification_preview_path(plugin_id, post_id);
    }
    if let Some(post_id) = hint.strip_prefix(POST_PREFIX) {
        return permalink_path(content, user_id, post_id).await;
    }
    HOME.to_string()
}

fn notification_preview_path(plugin_id: &str, post_id: &str) -> String {
    let Ok(mut url) = Url::parse("http://localhost/") else {
        return HOME.to_string();
    };
    if let Ok(mut segments) = url.path_segments_mut() {
        segments
            .pop_if_empty()
            .extend(["plugins", plugin_id, "iframe", "notification_preview"]);
    }
    url.query_pairs_mut().append_pair("post_id", post_id);
    match url.query() {
        Some(query) => format!("{}?{query}", url.path()),
        None => url.path().to_string(),
    }
}

async fn permalink_path(content: &dyn ContentDirectory, user_id: &str, post_id: &str) -> String {
    let post = match content.get_post(post_id).await {
        Ok(post) => post,
        Err(e) => {
            error!(post_id = %post_id, error = %e, "Failed to get post for redirect");
            return HOME.to_string();
        }
    };

    let channel = match content.get_channel(&post.channel_id).await {
        Ok(channel) => channel,
        Err(e) => {
            error!(channel_id = %post.channel_id, error = %e, "Failed to get channel for redirect");
            return HOME.to_string();
        }
    };

    let team = match channel.team_id.as_deref().filter(|id| !id.is_empty()) {
        Some(team_id) => match content.get_team(team_id).await {
            Ok(team) => team,
            Err(e) => {
                error!(team_id = %team_id, error = %e, "Failed to get team for redirect");
                return HOME.to_string();
            }
        },
        None => match content.get_teams_for_user(user_id).await {
            Ok(teams) => {
                let Some(first) = teams.into_iter().next() else {
                    error!(user_id = %user_id, "User has no teams to build a redirect");
                    return HOME.to_string();
                };
                first
            }
            Err(e) => {
                error!(user_id = %user_id, error = %e, "Failed to get teams for redirect");
                return HOME.to_string();
            }
        },
    };

    format!("/{}/pl/{}", team.name, post.id)
}

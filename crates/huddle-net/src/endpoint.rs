//! URL helpers for the API / relay server.

use reqwest::Url;

use huddle_shared::error::ChannelError;
use huddle_shared::types::UserId;

/// Channel endpoint for `identity`: the API URL with its scheme switched to
/// `ws`/`wss` and its path replaced by `/ws/{identity}`.
pub fn ws_url(api_url: &str, identity: &UserId) -> Result<Url, ChannelError> {
    let mut url = Url::parse(api_url)
        .map_err(|e| ChannelError::Connect(format!("invalid API URL {api_url}: {e}")))?;

    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    };
    url.set_scheme(scheme)
        .map_err(|_| ChannelError::Connect(format!("cannot use {scheme} with {api_url}")))?;

    url.set_query(None);
    url.path_segments_mut()
        .map_err(|_| ChannelError::Connect(format!("API URL cannot be a base: {api_url}")))?
        .clear()
        .push("ws")
        .push(identity.as_str());

    Ok(url)
}

/// `{api}/{path}` without doubled slashes.
pub fn api_url(api_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        api_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

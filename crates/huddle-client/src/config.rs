//! Client configuration loaded from environment variables.

use huddle_shared::constants::{DEFAULT_API_URL, DEFAULT_STUN_URL};
use huddle_shared::types::{Position, UserId};

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Base URL of the API / relay server.
    /// Env: `HUDDLE_API_URL`
    /// Default: `http://localhost:8000`
    pub api_url: String,

    /// Identity handed out by the identity provider.
    /// Env: `HUDDLE_USER_ID` (required)
    pub user_id: Option<UserId>,

    /// Name published with location updates.
    /// Env: `HUDDLE_USERNAME`
    /// Default: the user id.
    pub username: Option<String>,

    /// STUN server for peer connections.
    /// Env: `HUDDLE_STUN_URL`
    pub stun_url: String,

    /// Fixed position reported by the static geolocator.
    /// Env: `HUDDLE_LAT` + `HUDDLE_LNG`
    /// Default: none (geolocation unavailable).
    pub position: Option<Position>,

    /// Accept every incoming call without asking.
    /// Env: `HUDDLE_AUTO_ANSWER` (true/false)
    pub auto_answer: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            user_id: None,
            username: None,
            stun_url: DEFAULT_STUN_URL.to_string(),
            position: None,
            auto_answer: false,
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup, falling back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = lookup("HUDDLE_API_URL").filter(|v| !v.is_empty()) {
            config.api_url = url;
        }

        config.user_id = lookup("HUDDLE_USER_ID")
            .filter(|v| !v.trim().is_empty())
            .map(UserId::from);

        config.username = lookup("HUDDLE_USERNAME").filter(|v| !v.trim().is_empty());

        if let Some(url) = lookup("HUDDLE_STUN_URL").filter(|v| !v.is_empty()) {
            config.stun_url = url;
        }

        let lat = lookup("HUDDLE_LAT").and_then(|v| v.parse::<f64>().ok());
        let lng = lookup("HUDDLE_LNG").and_then(|v| v.parse::<f64>().ok());
        match (lat, lng) {
            (Some(lat), Some(lng)) => {
                config.position = Some(Position {
                    lat,
                    lng,
                    accuracy: None,
                })
            }
            (None, None) => {}
            _ => tracing::warn!("HUDDLE_LAT and HUDDLE_LNG must both be valid numbers, ignoring"),
        }

        if let Some(val) = lookup("HUDDLE_AUTO_ANSWER") {
            config.auto_answer = val == "true" || val == "1";
        }

        config
    }

    /// Username to publish, falling back to the raw identity.
    pub fn display_username(&self) -> String {
        match (&self.username, &self.user_id) {
            (Some(name), _) => name.clone(),
            (None, Some(id)) => id.to_string(),
            (None, None) => String::new(),
        }
    }
}

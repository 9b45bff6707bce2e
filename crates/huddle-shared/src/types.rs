use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque user identity handed out by the identity provider.
/// Stable for the lifetime of a session; never parsed or mutated here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Log-friendly prefix of the identity.
    pub fn short(&self) -> String {
        self.0.chars().take(8).collect()
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Server-assigned chat message identifier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct MessageId(pub i64);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The single current location of one identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Location {
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub lat: f64,
    pub lng: f64,
    /// Accuracy radius in meters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

/// A raw device position sample, before it is attributed to anyone.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    pub lat: f64,
    pub lng: f64,
    pub accuracy: Option<f64>,
}

/// Public profile as served by the directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Profile {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
}

/// What the UI needs to label an identity: a name and maybe an avatar.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DisplayProfile {
    pub display_name: String,
    pub avatar: Option<String>,
}

impl DisplayProfile {
    /// Fallback used when no profile could be resolved.
    pub fn raw(user_id: &UserId) -> Self {
        Self {
            display_name: user_id.to_string(),
            avatar: None,
        }
    }

    pub fn from_profile(profile: Profile, fallback_name: &str) -> Self {
        let display_name = if profile.username.trim().is_empty() {
            fallback_name.to_string()
        } else {
            profile.username
        };
        Self {
            display_name,
            avatar: profile.avatar.filter(|a| !a.is_empty()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_id() {
        assert_eq!(UserId::from("abcdefghijkl").short(), "abcdefgh");
        assert_eq!(UserId::from("abc").short(), "abc");
    }

    #[test]
    fn test_display_profile_fallback() {
        let alice = UserId::from("alice-id");
        let empty = Profile::default();
        assert_eq!(
            DisplayProfile::from_profile(empty, alice.as_str()).display_name,
            "alice-id"
        );
        assert_eq!(DisplayProfile::raw(&alice).avatar, None);
    }
}

//! Directory client: profiles, friend lists, chat history and read status.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use huddle_shared::error::DirectoryError;
use huddle_shared::message::{ChatMessage, MessageStatus};
use huddle_shared::types::{MessageId, Profile, UserId};

use crate::endpoint;

#[async_trait]
pub trait Directory: Send + Sync {
    /// Public profile of `user`. Any failure is reported as
    /// [`DirectoryError::ProfileLookupFailed`].
    async fn profile(&self, user: &UserId) -> Result<Profile, DirectoryError>;

    /// Friend identities of `user`.
    async fn friends(&self, user: &UserId) -> Result<Vec<UserId>, DirectoryError>;

    /// Ordered conversation between `user` and `peer`.
    async fn history(
        &self,
        user: &UserId,
        peer: &UserId,
    ) -> Result<Vec<ChatMessage>, DirectoryError>;

    /// Batched status change for a set of messages.
    async fn update_status(
        &self,
        message_ids: &[MessageId],
        status: MessageStatus,
    ) -> Result<(), DirectoryError>;
}

#[derive(Debug, Deserialize)]
struct FriendEntry {
    user_id: UserId,
}

#[derive(Debug, Deserialize)]
struct FriendsResponse {
    #[serde(default)]
    friends: Vec<FriendEntry>,
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    #[serde(default)]
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Serialize)]
struct StatusRequest<'a> {
    message_ids: &'a [MessageId],
    status: MessageStatus,
}

#[derive(Debug, Serialize)]
struct AddFriendRequest<'a> {
    friend_id: &'a UserId,
}

/// REST implementation against the API server.
#[derive(Debug, Clone)]
pub struct HttpDirectory {
    client: Client,
    api_url: String,
}

impl HttpDirectory {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_url: api_url.into(),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, DirectoryError> {
        let url = endpoint::api_url(&self.api_url, path);
        debug!(url = %url, "GET");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| DirectoryError::Http(e.to_string()))?;

        if !response.status().is_success() {
            return Err(DirectoryError::Status {
                status: response.status().as_u16(),
                path: path.to_string(),
            });
        }

        response
            .json()
            .await
            .map_err(|e| DirectoryError::Http(e.to_string()))
    }

    async fn post_json<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<(), DirectoryError> {
        let url = endpoint::api_url(&self.api_url, path);
        debug!(url = %url, "POST");

        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| DirectoryError::Http(e.to_string()))?;

        if !response.status().is_success() {
            return Err(DirectoryError::Status {
                status: response.status().as_u16(),
                path: path.to_string(),
            });
        }
        Ok(())
    }

    /// Create or replace the profile of `user`.
    pub async fn save_profile(&self, user: &UserId, profile: &Profile) -> Result<(), DirectoryError> {
        self.post_json(&format!("/api/users/{user}/profile"), profile)
            .await
    }

    pub async fn add_friend(&self, user: &UserId, friend: &UserId) -> Result<(), DirectoryError> {
        self.post_json(
            &format!("/api/users/{user}/friends"),
            &AddFriendRequest { friend_id: friend },
        )
        .await
    }
}

#[async_trait]
impl Directory for HttpDirectory {
    async fn profile(&self, user: &UserId) -> Result<Profile, DirectoryError> {
        self.get_json(&format!("/api/users/{user}/profile"))
            .await
            .map_err(|e| {
                warn!(user = %user.short(), error = %e, "Profile lookup failed");
                DirectoryError::ProfileLookupFailed(user.to_string())
            })
    }

    async fn friends(&self, user: &UserId) -> Result<Vec<UserId>, DirectoryError> {
        let response: FriendsResponse = self
            .get_json(&format!("/api/users/{user}/friends"))
            .await?;
        Ok(response.friends.into_iter().map(|f| f.user_id).collect())
    }

    async fn history(
        &self,
        user: &UserId,
        peer: &UserId,
    ) -> Result<Vec<ChatMessage>, DirectoryError> {
        let response: HistoryResponse = self
            .get_json(&format!("/api/messages/{user}/{peer}"))
            .await?;
        Ok(response.messages)
    }

    async fn update_status(
        &self,
        message_ids: &[MessageId],
        status: MessageStatus,
    ) -> Result<(), DirectoryError> {
        if message_ids.is_empty() {
            return Ok(());
        }
        self.post_json(
            "/api/messages/status",
            &StatusRequest {
                message_ids,
                status,
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_friends_response_ignores_extra_fields() {
        let raw = r#"{"friends": [{"user_id": "a", "username": "Anh"}, {"user_id": "b"}]}"#;
        let parsed: FriendsResponse = serde_json::from_str(raw).unwrap();
        let ids: Vec<_> = parsed.friends.into_iter().map(|f| f.user_id).collect();
        assert_eq!(ids, vec![UserId::from("a"), UserId::from("b")]);
    }

    #[test]
    fn test_status_request_shape() {
        let ids = [MessageId(5), MessageId(7)];
        let body = serde_json::to_value(StatusRequest {
            message_ids: &ids,
            status: MessageStatus::Read,
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({"message_ids": [5, 7], "status": "read"}));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_lookup_failure() {
        let directory = HttpDirectory::new("http://127.0.0.1:9");
        let err = directory.profile(&UserId::from("ghost")).await.unwrap_err();
        assert_eq!(err, DirectoryError::ProfileLookupFailed("ghost".into()));
    }
}

//! Discord REST implementation of `NotificationChannel`.

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use super::{NotificationChannel, TransportError};
use cellar_core::{ChannelId, MemberId, MessageId};

#[derive(Debug, Serialize)]
struct CreateMessageRequest<'a> {
    content: &'a str,
    allowed_mentions: AllowedMentions,
}

/// Mentions Discord may turn into notifications. An empty `parse` with no
/// `users` renders every mention as a plain name.
#[derive(Debug, Serialize)]
struct AllowedMentions {
    parse: Vec<&'static str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    users: Vec<String>,
}

impl<'a> CreateMessageRequest<'a> {
    fn new(content: &'a str, ping: &[MemberId]) -> Self {
        Self {
            content,
            allowed_mentions: AllowedMentions {
                parse: vec![],
                users: ping.iter().map(|member| member.0.to_string()).collect(),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreateMessageResponse {
    id: String,
}

/// Talks to the Discord HTTP API with a bot token.
#[derive(Clone)]
pub struct DiscordChannel {
    client: Client,
    base_url: Url,
    token: String,
}

impl DiscordChannel {
    pub fn new(base_url: &str, token: impl Into<String>) -> Result<Self, TransportError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| TransportError::other(format!("invalid API base URL: {}", e)))?;
        let client = Client::builder()
            .user_agent(concat!("cellar/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransportError::other(e.to_string()))?;
        Ok(Self {
            client,
            base_url,
            token: token.into(),
        })
    }

    /// Build an endpoint URL from path segments, percent-encoding each one.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, TransportError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| TransportError::other("API base URL cannot be a base"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .header("Authorization", format!("Bot {}", self.token))
    }

    /// Map a non-success status to a transport error.
    async fn check(
        operation: &str,
        response: reqwest::Response,
    ) -> Result<reqwest::Response, TransportError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        match status {
            StatusCode::NOT_FOUND => Err(TransportError::NotFound),
            StatusCode::FORBIDDEN => Err(TransportError::Forbidden),
            _ => {
                let body = response.text().await.unwrap_or_default();
                error!("Discord {} failed with {}: {}", operation, status, body);
                Err(TransportError::other(format!("{} returned {}", operation, status)))
            }
        }
    }

    async fn reaction_request(
        &self,
        method: Method,
        channel: ChannelId,
        message: MessageId,
        emoji: &str,
    ) -> Result<(), TransportError> {
        let channel = channel.to_string();
        let message = message.to_string();
        let url = self.endpoint(&[
            "channels",
            &channel,
            "messages",
            &message,
            "reactions",
            emoji,
            "@me",
        ])?;
        let response = self
            .request(method, url)
            .send()
            .await
            .map_err(|e| TransportError::other(e.to_string()))?;
        Self::check("reaction", response).await?;
        Ok(())
    }
}

#[async_trait]
impl NotificationChannel for DiscordChannel {
    async fn send(
        &self,
        channel: ChannelId,
        text: &str,
        ping: &[MemberId],
    ) -> Result<MessageId, TransportError> {
        let channel_str = channel.to_string();
        let url = self.endpoint(&["channels", &channel_str, "messages"])?;
        let body = CreateMessageRequest::new(text, ping);

        let response = self
            .request(Method::POST, url)
            .json(&body)
            .send()
            .await
            .map_err(|e| TransportError::other(e.to_string()))?;
        let created: CreateMessageResponse = Self::check("send message", response)
            .await?
            .json()
            .await
            .map_err(|e| TransportError::other(format!("invalid send response: {}", e)))?;

        let id = created
            .id
            .parse::<u64>()
            .map_err(|e| TransportError::other(format!("invalid message id: {}", e)))?;
        debug!("Sent message {} to channel {}", id, channel);
        Ok(MessageId(id))
    }

    async fn delete(&self, channel: ChannelId, message: MessageId) -> Result<(), TransportError> {
        let channel = channel.to_string();
        let message = message.to_string();
        let url = self.endpoint(&["channels", &channel, "messages", &message])?;
        let response = self
            .request(Method::DELETE, url)
            .send()
            .await
            .map_err(|e| TransportError::other(e.to_string()))?;
        Self::check("delete message", response).await?;
        Ok(())
    }

    async fn add_reaction(
        &self,
        channel: ChannelId,
        message: MessageId,
        emoji: &str,
    ) -> Result<(), TransportError> {
        self.reaction_request(Method::PUT, channel, message, emoji)
            .await
    }

    async fn remove_reaction(
        &self,
        channel: ChannelId,
        message: MessageId,
        emoji: &str,
    ) -> Result<(), TransportError> {
        self.reaction_request(Method::DELETE, channel, message, emoji)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_encodes_emoji() {
        let channel = DiscordChannel::new("https://discord.com/api/v10", "token").unwrap();
        let url = channel
            .endpoint(&["channels", "1", "messages", "2", "reactions", "✅", "@me"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://discord.com/api/v10/channels/1/messages/2/reactions/%E2%9C%85/@me"
        );
    }

    #[test]
    fn test_endpoint_with_trailing_slash_base() {
        let channel = DiscordChannel::new("https://example.test/api/", "token").unwrap();
        let url = channel.endpoint(&["channels", "9", "messages"]).unwrap();
        assert_eq!(url.as_str(), "https://example.test/api/channels/9/messages");
    }

    #[test]
    fn test_message_body_without_pings_suppresses_mentions() {
        let body = serde_json::to_value(CreateMessageRequest::new("status", &[])).unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "content": "status",
                "allowed_mentions": { "parse": [] }
            })
        );
    }

    #[test]
    fn test_message_body_pings_only_named_members() {
        let body =
            serde_json::to_value(CreateMessageRequest::new("<@42> reminder", &[MemberId(42)]))
                .unwrap();
        assert_eq!(body["allowed_mentions"]["parse"], serde_json::json!([]));
        assert_eq!(body["allowed_mentions"]["users"], serde_json::json!(["42"]));
    }

    #[test]
    fn test_invalid_base_url_rejected() {
        assert!(DiscordChannel::new("not a url", "token").is_err());
    }
}

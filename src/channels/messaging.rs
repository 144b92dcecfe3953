//! Messaging provider transport: outbound text and media download.
//!
//! The provider is reached over a small JSON HTTP API:
//! - `POST {api_url}/messages` with `{ "to": ..., "text": ... }` → `{ "id": ... }`
//! - `GET {api_url}/media/{reference}` → raw bytes

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::config::MessagingConfig;
use crate::error::ChannelError;

/// Provider limit for a single text message.
const MAX_MESSAGE_LENGTH: usize = 4096;

const CHANNEL_NAME: &str = "messaging";

/// Provider acknowledgment for one logical send.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAck {
    /// One id per chunk actually delivered.
    pub message_ids: Vec<String>,
}

/// Downloaded media.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaBlob {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

/// Outbound side of the messaging provider.
#[async_trait]
pub trait MessagingTransport: Send + Sync {
    async fn send_message(&self, target_id: &str, content: &str)
    -> Result<DeliveryAck, ChannelError>;

    async fn download_media(&self, reference: &str) -> Result<MediaBlob, ChannelError>;
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    id: String,
}

/// HTTP client for the messaging provider.
pub struct HttpMessagingClient {
    api_url: String,
    token: SecretString,
    client: reqwest::Client,
}

impl HttpMessagingClient {
    pub fn new(config: &MessagingConfig, timeout: std::time::Duration) -> Result<Self, ChannelError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChannelError::Http(e.to_string()))?;
        Ok(Self {
            api_url: config.api_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.api_url)
    }

    async fn send_chunk(&self, target_id: &str, text: &str) -> Result<String, ChannelError> {
        let body = serde_json::json!({
            "to": target_id,
            "text": text,
        });

        let resp = self
            .client
            .post(self.url("messages"))
            .bearer_auth(self.token.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: CHANNEL_NAME.into(),
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ChannelError::RateLimited {
                name: CHANNEL_NAME.into(),
            });
        }
        if !status.is_success() {
            let err = resp.text().await.unwrap_or_default();
            return Err(ChannelError::SendFailed {
                name: CHANNEL_NAME.into(),
                reason: format!("{status}: {err}"),
            });
        }

        let parsed: SendResponse = resp
            .json()
            .await
            .map_err(|e| ChannelError::InvalidMessage(format!("send response: {e}")))?;
        Ok(parsed.id)
    }
}

#[async_trait]
impl MessagingTransport for HttpMessagingClient {
    async fn send_message(
        &self,
        target_id: &str,
        content: &str,
    ) -> Result<DeliveryAck, ChannelError> {
        if content.trim().is_empty() {
            return Err(ChannelError::InvalidMessage("empty message".into()));
        }
        let mut ack = DeliveryAck::default();
        for chunk in split_message(content, MAX_MESSAGE_LENGTH) {
            ack.message_ids.push(self.send_chunk(target_id, &chunk).await?);
        }
        tracing::debug!(target_id, chunks = ack.message_ids.len(), "Message delivered");
        Ok(ack)
    }

    async fn download_media(&self, reference: &str) -> Result<MediaBlob, ChannelError> {
        let media_err = |reason: String| ChannelError::MediaFailed {
            reference: reference.to_string(),
            reason,
        };

        let resp = self
            .client
            .get(self.url(&format!("media/{reference}")))
            .bearer_auth(self.token.expose_secret())
            .send()
            .await
            .map_err(|e| media_err(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(media_err(format!("status {}", resp.status())));
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = resp.bytes().await.map_err(|e| media_err(e.to_string()))?;

        Ok(MediaBlob {
            bytes: bytes.to_vec(),
            content_type,
        })
    }
}

/// Split a message into chunks that fit the provider's limit.
/// Tries to split on newlines, then spaces, then hard-cuts on a char boundary.
pub fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }

        let mut boundary = max_len;
        while !remaining.is_char_boundary(boundary) {
            boundary -= 1;
        }
        let chunk = &remaining[..boundary];
        let split_at = chunk
            .rfind('\n')
            .or_else(|| chunk.rfind(' '))
            .unwrap_or(boundary);

        // Don't split at position 0 (infinite loop guard)
        let split_at = if split_at == 0 { boundary } else { split_at };

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> HttpMessagingClient {
        let config = MessagingConfig {
            api_url: "http://127.0.0.1:9/".into(),
            token: SecretString::from("fake-token"),
        };
        HttpMessagingClient::new(&config, std::time::Duration::from_millis(200)).unwrap()
    }

    #[test]
    fn url_strips_trailing_slash() {
        assert_eq!(client().url("messages"), "http://127.0.0.1:9/messages");
    }

    #[tokio::test]
    async fn unreachable_provider_is_send_failure() {
        let result = client().send_message("chat-1", "hola").await;
        assert!(matches!(result, Err(ChannelError::SendFailed { .. })));
    }

    #[tokio::test]
    async fn empty_message_is_rejected() {
        let result = client().send_message("chat-1", "   ").await;
        assert!(matches!(result, Err(ChannelError::InvalidMessage(_))));
    }

    #[test]
    fn split_message_short() {
        assert_eq!(split_message("Hola", 4096), vec!["Hola"]);
    }

    #[test]
    fn split_message_over_limit_on_newline() {
        let msg = format!("{}\n{}", "a".repeat(2000), "b".repeat(3000));
        let chunks = split_message(&msg, 4096);
        assert_eq!(chunks, vec!["a".repeat(2000), "b".repeat(3000)]);
    }

    #[test]
    fn split_message_no_good_split_point() {
        let msg = "a".repeat(5000);
        let chunks = split_message(&msg, 4096);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].len(), 904);
    }

    #[test]
    fn split_message_respects_char_boundaries() {
        let msg = "ñ".repeat(3000);
        let chunks = split_message(&msg, 4095);
        assert!(chunks.iter().all(|c| c.len() <= 4095));
        assert_eq!(chunks.concat(), msg);
    }
}

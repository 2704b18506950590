//! Messaging provider boundary and its HTTP client
//!
//! `HttpMessageProvider` talks to a JSON messaging API:
//! `POST {base}/v1/messages` with a bearer key, answering `{messageKey}` on
//! success and `{code, message}` on rejection. The client does not retry;
//! the queue's backoff table owns retries.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{NotificationError, NotificationResult, ProviderError};
use crate::models::Notification;

/// One message as handed to the provider
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub template_code: String,
    pub recipient: String,
    pub variables: serde_json::Value,
    /// Queue row id, echoed back by providers that support it
    pub reference: Uuid,
}

impl From<&Notification> for OutboundMessage {
    fn from(row: &Notification) -> Self {
        Self {
            template_code: row.template_code.clone(),
            recipient: row.recipient.clone(),
            variables: row.variables.clone(),
            reference: row.id,
        }
    }
}

#[async_trait]
pub trait MessageProvider: Send + Sync {
    /// Send one message, returning the provider's message key
    async fn send(&self, message: &OutboundMessage) -> Result<String, ProviderError>;
}

#[derive(Clone)]
pub struct ProviderConfig {
    pub api_base: String,
    pub api_key: String,
    pub sender_key: String,
    pub timeout: Duration,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_base", &self.api_base)
            .field("api_key", &"<redacted>")
            .field("sender_key", &self.sender_key)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ProviderConfig {
    pub fn from_env() -> NotificationResult<Self> {
        let required = |name: &str| {
            std::env::var(name)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| NotificationError::Config(format!("{} not configured", name)))
        };

        Ok(Self {
            api_base: required("MESSAGING_API_BASE")?,
            api_key: required("MESSAGING_API_KEY")?,
            sender_key: required("MESSAGING_SENDER_KEY")?,
            timeout: Duration::from_secs(10),
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SendBody<'a> {
    sender_key: &'a str,
    #[serde(flatten)]
    message: &'a OutboundMessage,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendResponse {
    message_key: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: String,
    message: String,
}

#[derive(Clone)]
pub struct HttpMessageProvider {
    http: reqwest::Client,
    config: ProviderConfig,
}

impl HttpMessageProvider {
    pub fn new(config: ProviderConfig) -> NotificationResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| NotificationError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { http, config })
    }

    pub fn from_env() -> NotificationResult<Self> {
        Self::new(ProviderConfig::from_env()?)
    }

    fn messages_url(&self) -> String {
        format!("{}/v1/messages", self.config.api_base.trim_end_matches('/'))
    }
}

#[async_trait]
impl MessageProvider for HttpMessageProvider {
    async fn send(&self, message: &OutboundMessage) -> Result<String, ProviderError> {
        let response = self
            .http
            .post(self.messages_url())
            .bearer_auth(&self.config.api_key)
            .json(&SendBody {
                sender_key: &self.config.sender_key,
                message,
            })
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            let body: SendResponse = response
                .json()
                .await
                .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
            return Ok(body.message_key);
        }

        let text = response.text().await.unwrap_or_default();
        match serde_json::from_str::<ErrorBody>(&text) {
            Ok(err) => Err(ProviderError::Rejected {
                code: err.code,
                message: err.message,
            }),
            Err(_) if status.is_server_error() => {
                Err(ProviderError::Transport(format!("HTTP {}", status)))
            }
            Err(_) => Err(ProviderError::InvalidResponse(format!(
                "HTTP {} with unparseable body",
                status
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn provider(base: String) -> HttpMessageProvider {
        HttpMessageProvider::new(ProviderConfig {
            api_base: base,
            api_key: "msg_live_key".to_string(),
            sender_key: "academy-sender".to_string(),
            timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    fn message() -> OutboundMessage {
        OutboundMessage {
            template_code: "ATTENDANCE_ALERT".to_string(),
            recipient: "010-1234-5678".to_string(),
            variables: serde_json::json!({"studentName": "Kim Minji", "event": "CHECK_IN"}),
            reference: Uuid::nil(),
        }
    }

    #[tokio::test]
    async fn test_send_returns_message_key() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/messages")
            .match_header("authorization", "Bearer msg_live_key")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "senderKey": "academy-sender",
                "templateCode": "ATTENDANCE_ALERT",
                "recipient": "010-1234-5678",
                "variables": {"studentName": "Kim Minji", "event": "CHECK_IN"},
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"messageKey":"msg_0001"}"#)
            .create_async()
            .await;

        let key = provider(server.url()).send(&message()).await.unwrap();

        assert_eq!(key, "msg_0001");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_rejection_carries_provider_code() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/messages")
            .with_status(400)
            .with_body(r#"{"code":"INVALID_RECIPIENT","message":"Unknown phone number"}"#)
            .create_async()
            .await;

        let err = provider(server.url()).send(&message()).await.unwrap_err();

        assert_eq!(err.code(), "INVALID_RECIPIENT");
        assert_eq!(err.message(), "Unknown phone number");
    }

    #[tokio::test]
    async fn test_bare_server_error_is_transport() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/messages")
            .with_status(503)
            .with_body("Service Unavailable")
            .expect(1)
            .create_async()
            .await;

        let err = provider(server.url()).send(&message()).await.unwrap_err();

        assert!(matches!(err, ProviderError::Transport(_)));
        assert_eq!(err.code(), "UNKNOWN_ERROR");
        mock.assert_async().await;
    }

    #[test]
    fn test_debug_redacts_api_key() {
        let config = ProviderConfig {
            api_base: "https://msg.example.test".to_string(),
            api_key: "msg_live_secret".to_string(),
            sender_key: "academy-sender".to_string(),
            timeout: Duration::from_secs(5),
        };
        assert!(!format!("{:?}", config).contains("msg_live_secret"));
    }
}

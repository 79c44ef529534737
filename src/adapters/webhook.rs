//! Chat webhook notifications
//!
//! Pushes challenge prompts and purchase notices to an incoming-webhook URL.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::domain::StoreId;
use crate::error::{CartwatchError, Result};

/// Webhook notification client
#[derive(Clone)]
pub struct WebhookNotifier {
    client: Client,
    webhook_url: String,
}

#[derive(Serialize)]
struct WebhookMessage {
    msg_type: String,
    content: WebhookContent,
}

#[derive(Serialize)]
struct WebhookContent {
    text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    image_base64: Option<String>,
}

impl WebhookNotifier {
    /// Create a notifier with an explicit URL
    pub fn new(webhook_url: String) -> Arc<Self> {
        info!("Webhook notifications enabled");
        Arc::new(Self {
            client: Client::new(),
            webhook_url,
        })
    }

    /// Send a message, optionally carrying an image
    pub async fn send_message(&self, text: &str, image: Option<&[u8]>) -> Result<()> {
        let message = WebhookMessage {
            msg_type: if image.is_some() { "image_text" } else { "text" }.to_string(),
            content: WebhookContent {
                text: text.to_string(),
                image_base64: image.map(|bytes| STANDARD.encode(bytes)),
            },
        };

        let resp = self
            .client
            .post(&self.webhook_url)
            .json(&message)
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            debug!("Webhook notification sent successfully");
            return Ok(());
        }

        let body = resp.text().await.unwrap_or_default();
        error!("Webhook notification failed: {} - {}", status, body);
        Err(CartwatchError::Webhook {
            status: status.as_u16(),
            body,
        })
    }

    /// Ask the operator to solve a challenge
    pub async fn notify_challenge(&self, store: &StoreId, prompt: &str, image: &[u8]) -> Result<()> {
        let text = format!(
            "🧩 {} needs a human\n\
             {}\n\
             Reply in the cartwatch console.",
            store, prompt
        );
        self.send_message(&text, Some(image)).await
    }

    /// Send error notification
    pub async fn notify_error(&self, error: &str) {
        let text = format!("⚠️ Error: {}", error);
        if let Err(e) = self.send_message(&text, None).await {
            error!("Failed to send error notification: {}", e);
        }
    }
}

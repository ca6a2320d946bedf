//! Alert transports.
//!
//! [`WebhookTransport`] posts alerts to an HTTP bridge in front of the chat
//! platform. [`LogTransport`] only logs them.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, info};
use uuid::Uuid;

use spawnwatch_tracker::{Alert, DeliveryError, Destination, MessageRef, Transport};

/// Delivers alerts to `<base_url>/destinations/<destination>/messages`.
pub struct WebhookTransport {
    http: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct CreatedMessage {
    id: String,
}

impl WebhookTransport {
    pub fn new(base_url: impl Into<String>) -> Result<Self, DeliveryError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| DeliveryError::Transport(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn messages_url(&self, destination: &Destination) -> String {
        format!("{}/destinations/{}/messages", self.base_url, destination)
    }
}

/// Map a non-success status to a delivery error.
fn status_error(status: StatusCode, destination: &Destination, body: &str) -> DeliveryError {
    match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => DeliveryError::Unreachable(destination.clone()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            DeliveryError::PermissionDenied(destination.clone())
        }
        _ => DeliveryError::Transport(format!("webhook returned {}: {}", status, body)),
    }
}

fn request_error(e: reqwest::Error) -> DeliveryError {
    DeliveryError::Transport(e.to_string())
}

#[async_trait]
impl Transport for WebhookTransport {
    async fn deliver(
        &self,
        destination: &Destination,
        alert: &Alert,
    ) -> Result<MessageRef, DeliveryError> {
        let response = self
            .http
            .post(self.messages_url(destination))
            .json(alert)
            .send()
            .await
            .map_err(request_error)?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(status_error(status, destination, &text));
        }

        let created: CreatedMessage = response.json().await.map_err(request_error)?;
        debug!(destination = %destination, message_id = %created.id, "webhook accepted alert");
        Ok(MessageRef {
            destination: destination.clone(),
            id: created.id,
        })
    }

    async fn strip_response_options(&self, message: &MessageRef) -> Result<(), DeliveryError> {
        let url = format!(
            "{}/{}/strip",
            self.messages_url(&message.destination),
            message.id
        );
        let response = self.http.post(url).send().await.map_err(request_error)?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(status_error(status, &message.destination, &text));
        }
        Ok(())
    }
}

/// Writes alerts to the log. Used when no webhook is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogTransport;

#[async_trait]
impl Transport for LogTransport {
    async fn deliver(
        &self,
        destination: &Destination,
        alert: &Alert,
    ) -> Result<MessageRef, DeliveryError> {
        let id = Uuid::new_v4().to_string();
        info!(
            destination = %destination,
            message_id = %id,
            kind = ?alert.kind,
            boss = %alert.name,
            location = %alert.location,
            window_start = ?alert.window_start,
            window_end = ?alert.window_end,
            is_window = alert.is_window,
            "alert"
        );
        Ok(MessageRef {
            destination: destination.clone(),
            id,
        })
    }

    async fn strip_response_options(&self, message: &MessageRef) -> Result<(), DeliveryError> {
        info!(destination = %message.destination, message_id = %message.id, "response options removed");
        Ok(())
    }
}

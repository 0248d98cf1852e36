use anyhow::Context;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_sqs::Client;

use crate::core::config::Settings;

/// One received queue message. The receipt handle is the acknowledgment
/// token; the message stays visible for redelivery until it is acked.
#[derive(Debug, Clone)]
pub(crate) struct QueueMessage {
    pub(crate) body: String,
    pub(crate) receipt_handle: String,
}

#[derive(Debug, Clone)]
pub(crate) struct QueueService {
    client: Client,
    queue_url: String,
}

impl QueueService {
    /// Returns None when no queue URL is configured; the service then runs
    /// without a poller (local development, tests).
    pub(crate) async fn from_settings(settings: &Settings) -> Option<Self> {
        if settings.sqs().queue_url.is_empty() {
            return None;
        }

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(settings.sqs().region.clone()));

        if !settings.s3().access_key.is_empty() && !settings.s3().secret_key.is_empty() {
            loader = loader.credentials_provider(Credentials::new(
                settings.s3().access_key.clone(),
                settings.s3().secret_key.clone(),
                None,
                None,
                "gradi-static",
            ));
        }

        if let Some(endpoint) = settings.sqs().endpoint.clone() {
            loader = loader.endpoint_url(endpoint);
        }

        let config = loader.load().await;

        Some(Self { client: Client::new(&config), queue_url: settings.sqs().queue_url.clone() })
    }

    pub(crate) fn queue_url(&self) -> &str {
        &self.queue_url
    }

    /// Long-polls the queue for up to `wait_seconds`. An empty batch is a
    /// successful fetch, not an error.
    pub(crate) async fn fetch_batch(
        &self,
        max_messages: i32,
        wait_seconds: i32,
    ) -> anyhow::Result<Vec<QueueMessage>> {
        let output = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max_messages)
            .wait_time_seconds(wait_seconds)
            .send()
            .await
            .context("Failed to receive messages from SQS")?;

        let messages = output
            .messages
            .unwrap_or_default()
            .into_iter()
            .filter_map(|message| {
                let body = message.body?;
                let receipt_handle = message.receipt_handle?;
                Some(QueueMessage { body, receipt_handle })
            })
            .collect();

        Ok(messages)
    }

    /// Deletes a message after it has been applied. Never called for
    /// messages whose processing failed, so the queue redelivers them.
    pub(crate) async fn ack(&self, receipt_handle: &str) -> anyhow::Result<()> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .context("Failed to delete SQS message")?;

        Ok(())
    }
}

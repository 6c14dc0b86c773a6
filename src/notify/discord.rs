use super::{Attachment, Notifier};
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode, multipart};
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
struct PostedMessage {
    id: String,
}

/// [`Notifier`] posting to a Discord webhook.
pub struct DiscordWebhook {
    client: Client,
    url: String,
}

impl DiscordWebhook {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            url: url.into().trim_end_matches('/').to_string(),
        }
    }

    fn message_url(&self, message_id: &str) -> String {
        format!("{}/messages/{}", self.url, message_id)
    }

    async fn check(response: Response, message_id: Option<&str>) -> Result<Response> {
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(Error::MessageNotFound(
                message_id.unwrap_or("webhook").to_string(),
            ));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Notification(format!("{}: {}", status, body)));
        }
        Ok(response)
    }
}

#[async_trait]
impl Notifier for DiscordWebhook {
    #[tracing::instrument(skip(self, content))]
    async fn post(&self, content: &str) -> Result<String> {
        let response = self
            .client
            .post(format!("{}?wait=true", self.url))
            .json(&json!({ "content": content }))
            .send()
            .await?;
        let message: PostedMessage = Self::check(response, None).await?.json().await?;
        Ok(message.id)
    }

    #[tracing::instrument(skip(self, content))]
    async fn edit(&self, message_id: &str, content: &str) -> Result<()> {
        let response = self
            .client
            .patch(self.message_url(message_id))
            .json(&json!({ "content": content }))
            .send()
            .await?;
        Self::check(response, Some(message_id)).await?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn delete(&self, message_id: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.message_url(message_id))
            .send()
            .await?;
        Self::check(response, Some(message_id)).await?;
        Ok(())
    }

    #[tracing::instrument(skip(self, content, attachment), fields(file = %attachment.file_name))]
    async fn post_attachment(&self, content: &str, attachment: Attachment) -> Result<String> {
        let payload = json!({ "content": content }).to_string();
        let part = multipart::Part::bytes(attachment.bytes).file_name(attachment.file_name);
        let form = multipart::Form::new()
            .text("payload_json", payload)
            .part("files[0]", part);

        let response = self
            .client
            .post(format!("{}?wait=true", self.url))
            .multipart(form)
            .send()
            .await?;
        let message: PostedMessage = Self::check(response, None).await?.json().await?;
        Ok(message.id)
    }
}

//! External notification channel.
//!
//! Pipelines announce what they do through [`Notifier::post`]; the watchdog
//! keeps a status message up to date with [`Notifier::edit`] and refreshes its
//! graphs with [`Notifier::delete`] + [`Notifier::post_attachment`].
mod discord;

pub use discord::DiscordWebhook;

use crate::error::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};

/// A file sent along with a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// Posts, edits and deletes messages on an external channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Posts a message and returns its id.
    async fn post(&self, content: &str) -> Result<String>;

    /// Replaces the content of a posted message.
    ///
    /// # Errors
    ///
    /// [`Error::MessageNotFound`](crate::Error::MessageNotFound) when the id is
    /// no longer known to the channel.
    async fn edit(&self, message_id: &str, content: &str) -> Result<()>;

    /// Deletes a posted message.
    async fn delete(&self, message_id: &str) -> Result<()>;

    /// Posts a message with one attachment and returns its id.
    async fn post_attachment(&self, content: &str, attachment: Attachment) -> Result<String>;
}

/// [`Notifier`] used when no channel is configured: writes to the log.
#[derive(Default)]
pub struct LogNotifier {
    next_id: AtomicU64,
}

impl LogNotifier {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn post(&self, content: &str) -> Result<String> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(message_id = id, "{}", content);
        Ok(id.to_string())
    }

    async fn edit(&self, message_id: &str, content: &str) -> Result<()> {
        tracing::info!(message_id, "{}", content);
        Ok(())
    }

    async fn delete(&self, _message_id: &str) -> Result<()> {
        Ok(())
    }

    async fn post_attachment(&self, content: &str, attachment: Attachment) -> Result<String> {
        tracing::info!(
            file = %attachment.file_name,
            bytes = attachment.bytes.len(),
            "{}",
            content
        );
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(id.to_string())
    }
}

/// Posts a notification, logging instead of failing.
pub(crate) async fn announce(notifier: &dyn Notifier, content: &str) {
    if let Err(e) = notifier.post(content).await {
        tracing::warn!(error = %e, "Failed to post notification");
    }
}

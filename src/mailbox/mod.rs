//! Mailbox provider abstraction.
//!
//! The pipeline only needs five RPCs: list ids, fetch one message, list
//! labels, create a label, add a label to a message. Everything else about
//! the provider stays behind this trait.

pub mod auth;
pub mod gmail;
pub mod memory;

pub use gmail::GmailMailbox;
pub use memory::InMemoryMailbox;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::MailboxError;

/// A mailbox-side category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub id: String,
    pub name: String,
}

/// A single header as delivered by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Body tree of a provider message.
///
/// Leaves carry a base64url payload (possibly absent, e.g. for attachments
/// stored out of line). Containers carry nested parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessagePart {
    Leaf {
        mime_type: String,
        data: Option<String>,
    },
    Container {
        mime_type: String,
        parts: Vec<MessagePart>,
    },
}

/// A message as fetched from the provider, before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub id: String,
    pub headers: Vec<Header>,
    pub payload: MessagePart,
}

impl RawMessage {
    /// Value of the first header named exactly `name`.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name == name)
            .map(|h| h.value.as_str())
    }
}

/// Mailbox provider. All calls are network RPCs in production and may fail.
#[async_trait]
pub trait Mailbox: Send + Sync {
    /// Provider name for logging (e.g. "gmail").
    fn name(&self) -> &str;

    /// Up to `max_results` message ids carrying `label_id`, provider order.
    async fn list_message_ids(
        &self,
        label_id: &str,
        max_results: usize,
    ) -> Result<Vec<String>, MailboxError>;

    /// Fetch one message with headers and its full body tree.
    async fn get_message(&self, id: &str) -> Result<RawMessage, MailboxError>;

    async fn list_labels(&self) -> Result<Vec<Label>, MailboxError>;

    async fn create_label(&self, name: &str) -> Result<Label, MailboxError>;

    /// Add a label to a message. Adding a label already present succeeds.
    async fn add_label(&self, message_id: &str, label_id: &str) -> Result<(), MailboxError>;
}

/// Case-insensitive label lookup by name.
pub fn find_label<'a>(labels: &'a [Label], name: &str) -> Option<&'a Label> {
    labels.iter().find(|l| l.name.eq_ignore_ascii_case(name))
}

//! Gmail REST adapter.
//!
//! Talks to `gmail/v1/users/me` with a bearer token from the
//! [`Authenticator`]. Messages are fetched with `format=full` and their
//! payload tree is mapped onto [`MessagePart`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::auth::Authenticator;
use super::{Header, Label, Mailbox, MessagePart, RawMessage};
use crate::error::MailboxError;

const PROVIDER: &str = "gmail";
const DEFAULT_BASE_URL: &str = "https://gmail.googleapis.com/gmail/v1/users/me";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct GmailMailbox {
    client: reqwest::Client,
    auth: Arc<Authenticator>,
    base_url: String,
}

impl GmailMailbox {
    pub fn new(auth: Arc<Authenticator>) -> Result<Self, MailboxError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            auth,
            base_url: DEFAULT_BASE_URL.to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, MailboxError> {
        let token = self.auth.access_token().await?;
        let response = request.bearer_auth(token.expose_secret()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, response.text().await.unwrap_or_default()));
        }
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| MailboxError::Decode(e.to_string()))
    }
}

fn status_error(status: reqwest::StatusCode, body: String) -> MailboxError {
    match status.as_u16() {
        401 | 403 => MailboxError::Auth {
            provider: PROVIDER.into(),
        },
        code => MailboxError::Api {
            provider: PROVIDER.into(),
            status: code,
            message: body.chars().take(300).collect(),
        },
    }
}

#[async_trait]
impl Mailbox for GmailMailbox {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn list_message_ids(
        &self,
        label_id: &str,
        max_results: usize,
    ) -> Result<Vec<String>, MailboxError> {
        let request = self
            .client
            .get(format!("{}/messages", self.base_url))
            .query(&[
                ("labelIds", label_id),
                ("maxResults", max_results.to_string().as_str()),
            ]);
        let list: MessageList = self.send(request).await?;
        let ids: Vec<String> = list.messages.into_iter().map(|m| m.id).collect();
        debug!(label = label_id, count = ids.len(), "listed messages");
        Ok(ids)
    }

    async fn get_message(&self, id: &str) -> Result<RawMessage, MailboxError> {
        let request = self
            .client
            .get(format!("{}/messages/{}", self.base_url, id))
            .query(&[("format", "full")]);
        let message: GmailMessage = match self.send(request).await {
            Err(MailboxError::Api { status: 404, .. }) => {
                return Err(MailboxError::NotFound { id: id.to_string() });
            }
            other => other?,
        };
        Ok(message.into_raw())
    }

    async fn list_labels(&self) -> Result<Vec<Label>, MailboxError> {
        let request = self.client.get(format!("{}/labels", self.base_url));
        let list: LabelList = self.send(request).await?;
        Ok(list.labels.into_iter().map(Into::into).collect())
    }

    async fn create_label(&self, name: &str) -> Result<Label, MailboxError> {
        let request = self
            .client
            .post(format!("{}/labels", self.base_url))
            .json(&serde_json::json!({
                "name": name,
                "labelListVisibility": "labelShow",
                "messageListVisibility": "show",
            }));
        let label: GmailLabel = self.send(request).await?;
        Ok(label.into())
    }

    async fn add_label(&self, message_id: &str, label_id: &str) -> Result<(), MailboxError> {
        let request = self
            .client
            .post(format!("{}/messages/{}/modify", self.base_url, message_id))
            .json(&serde_json::json!({ "addLabelIds": [label_id] }));
        let _: serde_json::Value = self.send(request).await?;
        Ok(())
    }
}

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct MessageList {
    #[serde(default)]
    messages: Vec<MessageRef>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct LabelList {
    #[serde(default)]
    labels: Vec<GmailLabel>,
}

#[derive(Debug, Deserialize)]
struct GmailLabel {
    id: String,
    name: String,
}

impl From<GmailLabel> for Label {
    fn from(l: GmailLabel) -> Self {
        Label {
            id: l.id,
            name: l.name,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GmailMessage {
    id: String,
    payload: GmailPart,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailPart {
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    headers: Vec<GmailHeader>,
    #[serde(default)]
    body: Option<GmailBody>,
    #[serde(default)]
    parts: Option<Vec<GmailPart>>,
}

#[derive(Debug, Deserialize)]
struct GmailHeader {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct GmailBody {
    #[serde(default)]
    data: Option<String>,
}

impl GmailMessage {
    fn into_raw(self) -> RawMessage {
        let headers = self
            .payload
            .headers
            .iter()
            .map(|h| Header::new(&h.name, &h.value))
            .collect();
        RawMessage {
            id: self.id,
            headers,
            payload: self.payload.into_part(),
        }
    }
}

impl GmailPart {
    /// A part with a `parts` array is a container, anything else a leaf.
    fn into_part(self) -> MessagePart {
        match self.parts {
            Some(parts) => MessagePart::Container {
                mime_type: self.mime_type,
                parts: parts.into_iter().map(GmailPart::into_part).collect(),
            },
            None => MessagePart::Leaf {
                mime_type: self.mime_type,
                data: self.body.and_then(|b| b.data),
            },
        }
    }
}

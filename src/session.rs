//! Process-wide mailbox session.
//!
//! Built once at startup: holds the mailbox handle and the flagged label,
//! resolved (or created) a single time and cached by id.

use std::sync::Arc;

use tracing::info;

use crate::config::DEFAULT_FOLDER;
use crate::error::{InitError, MailboxError};
use crate::mailbox::{Label, Mailbox, find_label};

pub struct Session {
    mailbox: Arc<dyn Mailbox>,
    flagged_label: Label,
}

impl Session {
    pub fn new(mailbox: Arc<dyn Mailbox>, flagged_label: Label) -> Self {
        Self {
            mailbox,
            flagged_label,
        }
    }

    /// Look up `label_name` case-insensitively, creating it when absent.
    pub async fn initialize(
        mailbox: Arc<dyn Mailbox>,
        label_name: &str,
    ) -> Result<Self, InitError> {
        let setup_error = |source: MailboxError| InitError::LabelSetup {
            name: label_name.to_string(),
            source,
        };

        let labels = mailbox.list_labels().await.map_err(setup_error)?;
        let label = match find_label(&labels, label_name) {
            Some(existing) => existing.clone(),
            None => {
                let created = mailbox.create_label(label_name).await.map_err(setup_error)?;
                info!(label = %created.name, id = %created.id, "Created mailbox label");
                created
            }
        };

        info!(
            provider = mailbox.name(),
            label = %label.name,
            id = %label.id,
            "Session ready"
        );
        Ok(Self::new(mailbox, label))
    }

    pub fn mailbox(&self) -> &Arc<dyn Mailbox> {
        &self.mailbox
    }

    pub fn flagged_label(&self) -> &Label {
        &self.flagged_label
    }

    /// Label id for a folder name, matched case-insensitively.
    /// Unknown names fall back to the inbox.
    pub async fn resolve_folder(&self, folder: &str) -> Result<String, MailboxError> {
        let labels = self.mailbox.list_labels().await?;
        Ok(find_label(&labels, folder)
            .map(|l| l.id.clone())
            .unwrap_or_else(|| DEFAULT_FOLDER.to_string()))
    }
}

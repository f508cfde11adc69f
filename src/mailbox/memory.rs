//! In-process mailbox. Backs tests and offline dry runs.

use std::collections::{BTreeSet, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{Label, Mailbox, RawMessage};
use crate::error::MailboxError;

const PROVIDER: &str = "memory";

#[derive(Default)]
struct State {
    labels: Vec<Label>,
    /// Newest first, like a provider listing.
    messages: Vec<(RawMessage, BTreeSet<String>)>,
    next_label: usize,
    fetched: Vec<String>,
    label_mutations: usize,
    fail_listing: bool,
    fail_get: HashSet<String>,
    fail_add_label: HashSet<String>,
}

/// Mailbox held entirely in memory.
pub struct InMemoryMailbox {
    state: Mutex<State>,
}

impl Default for InMemoryMailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryMailbox {
    /// Empty mailbox with the system `INBOX` label.
    pub fn new() -> Self {
        let state = State {
            labels: vec![Label {
                id: "INBOX".into(),
                name: "INBOX".into(),
            }],
            ..Default::default()
        };
        Self {
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A poisoned lock only means another test thread panicked mid-call.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register an existing label.
    pub fn with_label(self, id: &str, name: &str) -> Self {
        self.lock().labels.push(Label {
            id: id.into(),
            name: name.into(),
        });
        self
    }

    /// Append a message to the inbox. Later pushes list after earlier ones.
    pub fn push(&self, message: RawMessage) {
        self.push_with_labels(message, &["INBOX"]);
    }

    pub fn push_with_labels(&self, message: RawMessage, labels: &[&str]) {
        let labels = labels.iter().map(|l| l.to_string()).collect();
        self.lock().messages.push((message, labels));
    }

    /// Make `list_message_ids` fail.
    pub fn fail_listing(&self) {
        self.lock().fail_listing = true;
    }

    /// Make `get_message(id)` fail.
    pub fn fail_get(&self, id: &str) {
        self.lock().fail_get.insert(id.to_string());
    }

    /// Make `add_label(id, _)` fail.
    pub fn fail_add_label(&self, id: &str) {
        self.lock().fail_add_label.insert(id.to_string());
    }

    /// Labels currently on a message.
    pub fn labels_of(&self, id: &str) -> Vec<String> {
        self.lock()
            .messages
            .iter()
            .find(|(m, _)| m.id == id)
            .map(|(_, l)| l.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Ids passed to `get_message`, in call order.
    pub fn fetched_ids(&self) -> Vec<String> {
        self.lock().fetched.clone()
    }

    /// Number of successful `add_label` calls.
    pub fn label_mutations(&self) -> usize {
        self.lock().label_mutations
    }

    pub fn labels(&self) -> Vec<Label> {
        self.lock().labels.clone()
    }
}

#[async_trait]
impl Mailbox for InMemoryMailbox {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn list_message_ids(
        &self,
        label_id: &str,
        max_results: usize,
    ) -> Result<Vec<String>, MailboxError> {
        let state = self.lock();
        if state.fail_listing {
            return Err(MailboxError::Transport("listing unavailable".into()));
        }
        Ok(state
            .messages
            .iter()
            .filter(|(_, labels)| labels.contains(label_id))
            .take(max_results)
            .map(|(m, _)| m.id.clone())
            .collect())
    }

    async fn get_message(&self, id: &str) -> Result<RawMessage, MailboxError> {
        let mut state = self.lock();
        state.fetched.push(id.to_string());
        if state.fail_get.contains(id) {
            return Err(MailboxError::Transport(format!("fetch of {id} failed")));
        }
        state
            .messages
            .iter()
            .find(|(m, _)| m.id == id)
            .map(|(m, _)| m.clone())
            .ok_or_else(|| MailboxError::NotFound { id: id.to_string() })
    }

    async fn list_labels(&self) -> Result<Vec<Label>, MailboxError> {
        Ok(self.lock().labels.clone())
    }

    async fn create_label(&self, name: &str) -> Result<Label, MailboxError> {
        let mut state = self.lock();
        if super::find_label(&state.labels, name).is_some() {
            return Err(MailboxError::Api {
                provider: PROVIDER.into(),
                status: 409,
                message: format!("label {name} already exists"),
            });
        }
        state.next_label += 1;
        let label = Label {
            id: format!("Label_{}", state.next_label),
            name: name.to_string(),
        };
        state.labels.push(label.clone());
        Ok(label)
    }

    async fn add_label(&self, message_id: &str, label_id: &str) -> Result<(), MailboxError> {
        let mut state = self.lock();
        if state.fail_add_label.contains(message_id) {
            return Err(MailboxError::Transport(format!(
                "modify of {message_id} failed"
            )));
        }
        if !state.labels.iter().any(|l| l.id == label_id) {
            return Err(MailboxError::Api {
                provider: PROVIDER.into(),
                status: 400,
                message: format!("invalid label: {label_id}"),
            });
        }
        let (_, labels) = state
            .messages
            .iter_mut()
            .find(|(m, _)| m.id == message_id)
            .ok_or_else(|| MailboxError::NotFound {
                id: message_id.to_string(),
            })?;
        labels.insert(label_id.to_string());
        state.label_mutations += 1;
        Ok(())
    }
}

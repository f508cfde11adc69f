//! Shared fixtures for integration tests: scripted LLMs, a mailbox wrapper
//! that panics on demand, and canned messages.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rust_decimal::Decimal;

use mail_guard::error::{LlmError, MailboxError};
use mail_guard::llm::provider::{CompletionRequest, CompletionResponse, FinishReason, LlmProvider};
use mail_guard::mailbox::{Header, InMemoryMailbox, Label, Mailbox, MessagePart, RawMessage};
use mail_guard::pipeline::{BatchOrchestrator, LocalArchive};
use mail_guard::session::Session;

pub const FLAGGED_LABEL: &str = "Flagged_Suspicious";

/// Answers each stage the way a cautious model would: lookalike PayPal
/// domains are phishing, everything else is benign.
pub struct PhishingAwareLlm;

#[async_trait]
impl LlmProvider for PhishingAwareLlm {
    fn model_name(&self) -> &str {
        "phishing-aware"
    }

    fn cost_per_token(&self) -> (Decimal, Decimal) {
        (Decimal::new(1, 6), Decimal::new(2, 6))
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let prompt = request.user_text();
        let content = if prompt.starts_with("Analyze this email") {
            if prompt.contains("paypa1") {
                "1. Urgent request to verify account 2. Lookalike domain paypa1-secure.com"
            } else {
                "No suspicious elements found."
            }
        } else if prompt.starts_with("Analyze email format") {
            if prompt.contains("paypa1") {
                "Format risk: 9/10 - spoofed brand domain"
            } else {
                "Format risk: 1/10 - consistent headers"
            }
        } else if prompt.starts_with("Perform final risk") {
            if prompt.contains("9/10") {
                "Final risk score: 95 - credential phishing"
            } else {
                "Final risk score: 10 - routine newsletter"
            }
        } else if prompt.contains("score: 95") {
            "YES"
        } else {
            "NO"
        };
        Ok(CompletionResponse {
            content: content.to_string(),
            input_tokens: 100,
            output_tokens: 10,
            finish_reason: FinishReason::Stop,
            response_id: None,
        })
    }
}

/// Every call fails, as during a provider outage.
pub struct FailingLlm;

#[async_trait]
impl LlmProvider for FailingLlm {
    fn model_name(&self) -> &str {
        "failing"
    }

    fn cost_per_token(&self) -> (Decimal, Decimal) {
        (Decimal::ZERO, Decimal::ZERO)
    }

    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        Err(LlmError::RequestFailed {
            provider: "failing".into(),
            reason: "service unavailable".into(),
        })
    }
}

/// Delegates to an in-memory mailbox but panics when labelling one message.
pub struct PanickingMailbox {
    pub inner: Arc<InMemoryMailbox>,
    pub panic_on_label: String,
}

#[async_trait]
impl Mailbox for PanickingMailbox {
    fn name(&self) -> &str {
        "panicking"
    }

    async fn list_message_ids(
        &self,
        label_id: &str,
        max_results: usize,
    ) -> Result<Vec<String>, MailboxError> {
        self.inner.list_message_ids(label_id, max_results).await
    }

    async fn get_message(&self, id: &str) -> Result<RawMessage, MailboxError> {
        self.inner.get_message(id).await
    }

    async fn list_labels(&self) -> Result<Vec<Label>, MailboxError> {
        self.inner.list_labels().await
    }

    async fn create_label(&self, name: &str) -> Result<Label, MailboxError> {
        self.inner.create_label(name).await
    }

    async fn add_label(&self, message_id: &str, label_id: &str) -> Result<(), MailboxError> {
        if message_id == self.panic_on_label {
            panic!("label service exploded for {message_id}");
        }
        self.inner.add_label(message_id, label_id).await
    }
}

fn b64(s: &str) -> String {
    URL_SAFE_NO_PAD.encode(s.as_bytes())
}

/// The classic lookalike-domain credential phish, as multipart/alternative.
pub fn phishing_message(id: &str) -> RawMessage {
    RawMessage {
        id: id.into(),
        headers: vec![
            Header::new("Subject", "Urgent: Your account has been suspended"),
            Header::new("From", "PayPal Security <security@paypa1-secure.com>"),
            Header::new("Date", "Tue, 2 Jan 2024 09:14:00 +0000"),
        ],
        payload: MessagePart::Container {
            mime_type: "multipart/alternative".into(),
            parts: vec![
                MessagePart::Leaf {
                    mime_type: "text/plain".into(),
                    data: Some(b64(
                        "We detected unusual activity. Verify your account within 24 hours \
                         at http://paypa1-secure.com/login or it will be closed.",
                    )),
                },
                MessagePart::Leaf {
                    mime_type: "text/html".into(),
                    data: Some(b64("<p>Verify <a href='http://paypa1-secure.com'>now</a></p>")),
                },
            ],
        },
    }
}

/// An HTML-only newsletter.
pub fn newsletter_message(id: &str) -> RawMessage {
    RawMessage {
        id: id.into(),
        headers: vec![
            Header::new("Subject", "This week in Rust"),
            Header::new("From", "newsletter@this-week-in-rust.org"),
            Header::new("Date", "Wed, 3 Jan 2024 12:00:00 +0000"),
        ],
        payload: MessagePart::Leaf {
            mime_type: "text/html".into(),
            data: Some(b64(
                "<html><body><h1>Updates</h1><p>New crates released.</p></body></html>",
            )),
        },
    }
}

pub fn files_in(dir: &Path) -> Vec<std::path::PathBuf> {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
        Err(_) => Vec::new(),
    }
}

/// Session over `mailbox` with the flagged label set up, and an orchestrator
/// archiving into `dir`.
pub async fn orchestrator(
    mailbox: Arc<dyn Mailbox>,
    llm: Arc<dyn LlmProvider>,
    dir: &Path,
) -> BatchOrchestrator {
    let session = Arc::new(Session::initialize(mailbox, FLAGGED_LABEL).await.unwrap());
    let archive = LocalArchive::new(dir);
    archive.ensure_dir().await.unwrap();
    BatchOrchestrator::new(session, llm, archive)
}

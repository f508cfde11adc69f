//! Batch orchestrator: fetch → normalize → cascade → dispose, one message
//! at a time.
//!
//! A message that fails at any point (including a panic) is logged, counted
//! and skipped; the rest of the batch carries on.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::watch;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::llm::LlmProvider;
use crate::pipeline::cascade::AnalysisCascade;
use crate::pipeline::disposition::{DispositionExecutor, LocalArchive};
use crate::pipeline::normalizer::normalize;
use crate::pipeline::types::{
    BatchProgress, BatchReport, FlaggedRecord, MessageFailure, TokenUsage,
};
use crate::session::Session;

/// What one message produced.
struct MessageOutcome {
    flagged: Option<FlaggedRecord>,
    usage: TokenUsage,
}

pub struct BatchOrchestrator {
    session: Arc<Session>,
    cascade: AnalysisCascade,
    executor: DispositionExecutor,
    progress: watch::Sender<BatchProgress>,
}

impl BatchOrchestrator {
    pub fn new(session: Arc<Session>, llm: Arc<dyn LlmProvider>, archive: LocalArchive) -> Self {
        let (progress, _) = watch::channel(BatchProgress::default());
        Self {
            cascade: AnalysisCascade::new(llm),
            executor: DispositionExecutor::new(Arc::clone(&session), archive),
            session,
            progress,
        }
    }

    /// Progress updates, published after every message.
    pub fn subscribe(&self) -> watch::Receiver<BatchProgress> {
        self.progress.subscribe()
    }

    /// Latest progress snapshot.
    pub fn progress(&self) -> BatchProgress {
        self.progress.borrow().clone()
    }

    /// Flagged records of one batch.
    pub async fn run_batch(&self, folder: &str, limit: usize) -> Vec<FlaggedRecord> {
        self.run(folder, limit).await.flagged
    }

    /// Process up to `limit` messages from `folder` and report on the run.
    pub async fn run(&self, folder: &str, limit: usize) -> BatchReport {
        let run_id = Uuid::new_v4();
        let span = info_span!("batch", run_id = %run_id, folder = %folder);
        self.run_inner(run_id, folder, limit).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, folder: &str, limit: usize) -> BatchReport {
        let mut report = BatchReport {
            run_id,
            folder: folder.to_string(),
            requested: limit,
            fetched: 0,
            processed: 0,
            failed: 0,
            failures: Vec::new(),
            flagged: Vec::new(),
            usage: TokenUsage::default(),
            fetch_error: None,
            started_at: Utc::now(),
            finished_at: Utc::now(),
        };

        info!(limit, "Processing batch of {limit} emails");
        let ids = match self.list(folder, limit).await {
            Ok(ids) => ids,
            Err(e) => {
                error!(kind = ?e.kind(), error = %e, "Failed to fetch messages");
                report.fetch_error = Some(e.to_string());
                report.finished_at = Utc::now();
                return report;
            }
        };
        if ids.is_empty() {
            warn!("No emails found to process");
        }
        report.fetched = ids.len();

        let total = ids.len();
        self.publish(BatchProgress {
            run_id: Some(run_id),
            processed: 0,
            total,
            flagged: 0,
            running: true,
        });

        for (i, id) in ids.into_iter().enumerate() {
            let attempt = AssertUnwindSafe(self.process_message(&id))
                .catch_unwind()
                .instrument(info_span!("message", id = %id))
                .await;
            let result = attempt.unwrap_or_else(|panic| {
                Err(PipelineError::MessageProcessing {
                    id: id.clone(),
                    reason: panic_reason(panic.as_ref()),
                })
            });

            match result {
                Ok(outcome) => {
                    report.processed += 1;
                    report.usage.merge(&outcome.usage);
                    if let Some(record) = outcome.flagged {
                        report.flagged.push(record);
                    }
                }
                Err(e) => {
                    error!(id = %id, kind = ?e.kind(), error = %e, "Failed to process email");
                    report.failed += 1;
                    report.failures.push(MessageFailure {
                        message_id: id.clone(),
                        kind: e.kind(),
                        error: e.to_string(),
                    });
                }
            }

            self.publish(BatchProgress {
                run_id: Some(run_id),
                processed: i + 1,
                total,
                flagged: report.flagged.len(),
                running: true,
            });
        }

        report.finished_at = Utc::now();
        self.publish(BatchProgress {
            run_id: Some(run_id),
            processed: total,
            total,
            flagged: report.flagged.len(),
            running: false,
        });
        info!(
            processed = report.processed,
            failed = report.failed,
            flagged = report.flagged.len(),
            cost_usd = %report.usage.cost_usd,
            "Batch complete"
        );
        report
    }

    async fn list(&self, folder: &str, limit: usize) -> Result<Vec<String>, PipelineError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let label_id = self
            .session
            .resolve_folder(folder)
            .await
            .map_err(PipelineError::Fetch)?;
        let mut ids = self
            .session
            .mailbox()
            .list_message_ids(&label_id, limit)
            .await
            .map_err(PipelineError::Fetch)?;
        // Providers may ignore the page size.
        ids.truncate(limit);
        Ok(ids)
    }

    async fn process_message(&self, id: &str) -> Result<MessageOutcome, PipelineError> {
        let raw = self
            .session
            .mailbox()
            .get_message(id)
            .await
            .map_err(PipelineError::Fetch)?;
        let message = normalize(&raw);
        info!(id = %message.id, subject = %message.subject, "Analyzing email");

        let outcome = self.cascade.run(&message).await;
        let flagged = if outcome.decision.is_flag() {
            Some(self.executor.dispose(&message, &outcome.risk).await)
        } else {
            None
        };
        Ok(MessageOutcome {
            flagged,
            usage: outcome.usage,
        })
    }

    fn publish(&self, progress: BatchProgress) {
        self.progress.send_replace(progress);
    }
}

fn panic_reason(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}

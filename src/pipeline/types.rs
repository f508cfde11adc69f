//! Shared types for the classification pipeline.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::llm::CompletionResponse;

// ── Canonical message ───────────────────────────────────────────────

/// A fetched message reduced to the fields the cascade reads.
///
/// `sender` and `date` are raw header values, never parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalMessage {
    /// Opaque provider identifier.
    pub id: String,
    pub subject: String,
    pub sender: String,
    pub date: String,
    /// Plain text, markup stripped.
    pub body: String,
}

// ── Stage outputs ───────────────────────────────────────────────────

/// The four cascade stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Detection,
    FormatAnalysis,
    RiskAssessment,
    FinalDecision,
}

impl StageKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Detection => "detection",
            Self::FormatAnalysis => "format_analysis",
            Self::RiskAssessment => "risk_assessment",
            Self::FinalDecision => "final_decision",
        }
    }

    /// Upper bound of the score this stage is asked to produce.
    pub fn score_range(self) -> Option<u32> {
        match self {
            Self::FormatAnalysis => Some(10),
            Self::RiskAssessment => Some(100),
            Self::Detection | Self::FinalDecision => None,
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StageStatus {
    Completed,
    /// The engine call failed; `narrative` holds the fixed fallback text.
    Degraded { reason: String },
}

/// Output of one analysis stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageOutput {
    pub stage: StageKind,
    /// Raw engine text, kept for audit whether or not a score parses.
    pub narrative: String,
    pub score: Option<u32>,
    pub status: StageStatus,
}

impl StageOutput {
    pub fn completed(stage: StageKind, narrative: String, score: Option<u32>) -> Self {
        Self {
            stage,
            narrative,
            score,
            status: StageStatus::Completed,
        }
    }

    pub fn degraded(stage: StageKind, narrative: String, reason: String) -> Self {
        Self {
            stage,
            narrative,
            score: None,
            status: StageStatus::Degraded { reason },
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self.status, StageStatus::Degraded { .. })
    }
}

/// Terminal verdict of the cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Flag,
    Pass,
}

impl Decision {
    pub fn is_flag(self) -> bool {
        self == Self::Flag
    }
}

/// Everything the cascade produced for one message.
#[derive(Debug, Clone)]
pub struct CascadeOutcome {
    pub detection: StageOutput,
    pub format: StageOutput,
    pub risk: StageOutput,
    pub decision: Decision,
    pub usage: TokenUsage,
}

// ── Results ─────────────────────────────────────────────────────────

/// Evidence kept for a flagged message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlaggedRecord {
    pub subject: String,
    pub sender: String,
    pub date: String,
    /// Narrative of the risk assessment stage.
    pub risk_narrative: String,
    /// Score parsed from `risk_narrative`, when one was found.
    pub risk_score: Option<u32>,
    pub message_id: String,
    /// `None` when the archive write failed.
    pub local_archive_path: Option<PathBuf>,
    /// Whether the remote label mutation succeeded.
    pub label_applied: bool,
    pub original: CanonicalMessage,
}

/// Token and cost totals over a set of engine calls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub calls: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: Decimal,
}

impl TokenUsage {
    /// Account for one completion at the given per-token rates.
    pub fn record(&mut self, response: &CompletionResponse, rates: (Decimal, Decimal)) {
        let (input_rate, output_rate) = rates;
        self.calls += 1;
        self.input_tokens += u64::from(response.input_tokens);
        self.output_tokens += u64::from(response.output_tokens);
        self.cost_usd += input_rate * Decimal::from(response.input_tokens)
            + output_rate * Decimal::from(response.output_tokens);
    }

    pub fn merge(&mut self, other: &TokenUsage) {
        self.calls += other.calls;
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cost_usd += other.cost_usd;
    }
}

/// A message that could not be processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFailure {
    pub message_id: String,
    pub kind: ErrorKind,
    pub error: String,
}

/// Summary of one batch run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub run_id: Uuid,
    /// Folder name as requested.
    pub folder: String,
    pub requested: usize,
    /// Ids returned by the listing (never more than `requested`).
    pub fetched: usize,
    /// Messages that went through the whole cascade.
    pub processed: usize,
    pub failed: usize,
    pub failures: Vec<MessageFailure>,
    pub flagged: Vec<FlaggedRecord>,
    pub usage: TokenUsage,
    /// Set when the folder could not be resolved or listed.
    pub fetch_error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Live progress of the current (or last) run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchProgress {
    pub run_id: Option<Uuid>,
    /// Messages attempted so far, successful or not.
    pub processed: usize,
    pub total: usize,
    pub flagged: usize,
    pub running: bool,
}

//! Classification pipeline.
//!
//! Every scanned message flows through:
//! 1. `normalizer::normalize()`: provider message → `CanonicalMessage`
//! 2. `AnalysisCascade::run()`: four LLM stages ending in Flag or Pass
//! 3. `DispositionExecutor::dispose()`: label + local archive, flagged only
//!
//! `BatchOrchestrator` drives the three over a bounded batch.

pub mod cascade;
pub mod disposition;
pub mod normalizer;
pub mod orchestrator;
pub mod types;

pub use cascade::AnalysisCascade;
pub use disposition::{ArchivedRecord, DispositionExecutor, LocalArchive};
pub use orchestrator::BatchOrchestrator;
pub use types::{
    BatchProgress, BatchReport, CanonicalMessage, Decision, FlaggedRecord, StageKind,
    StageOutput, StageStatus, TokenUsage,
};

//! Operator surface: REST endpoints to trigger scans and read results, plus
//! the plain-text results view used by the CLI.

use std::fmt::Write as _;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use tokio::sync::{Mutex, RwLock};
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use crate::config::{DEFAULT_BATCH_LIMIT, validate_batch_limit};
use crate::pipeline::{BatchOrchestrator, BatchReport};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct OperatorState {
    orchestrator: Arc<BatchOrchestrator>,
    default_folder: String,
    /// Held for the duration of a scan; scans never overlap.
    scan_lock: Arc<Mutex<()>>,
    last_report: Arc<RwLock<Option<BatchReport>>>,
}

impl OperatorState {
    pub fn new(orchestrator: Arc<BatchOrchestrator>, default_folder: impl Into<String>) -> Self {
        Self {
            orchestrator,
            default_folder: default_folder.into(),
            scan_lock: Arc::new(Mutex::new(())),
            last_report: Arc::new(RwLock::new(None)),
        }
    }
}

/// Build the Axum router with the operator routes.
pub fn operator_routes(state: OperatorState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/scan", post(start_scan))
        .route("/api/scan/progress", get(scan_progress))
        .route("/api/results", get(last_results))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "mail-guard"
    }))
}

// ── Scans ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ScanRequest {
    limit: Option<usize>,
    folder: Option<String>,
}

async fn start_scan(
    State(state): State<OperatorState>,
    Json(body): Json<ScanRequest>,
) -> impl IntoResponse {
    let limit = match validate_batch_limit(body.limit.unwrap_or(DEFAULT_BATCH_LIMIT)) {
        Ok(limit) => limit,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": e.to_string()})),
            );
        }
    };
    let folder = body
        .folder
        .filter(|f| !f.trim().is_empty())
        .unwrap_or_else(|| state.default_folder.clone());

    let Ok(guard) = state.scan_lock.clone().try_lock_owned() else {
        warn!("Scan requested while another is running");
        return (
            StatusCode::CONFLICT,
            Json(serde_json::json!({"error": "A scan is already running"})),
        );
    };

    info!(limit, folder = %folder, "Scan requested");
    let orchestrator = state.orchestrator.clone();
    let last_report = state.last_report.clone();
    // The batch owns the lock and outlives the request: a client that hangs
    // up must not cancel it between the label and the archive write.
    let task = tokio::spawn(async move {
        let _guard = guard;
        let report = orchestrator.run(&folder, limit).await;
        *last_report.write().await = Some(report.clone());
        report
    });

    match task.await {
        Ok(report) => (StatusCode::OK, Json(serde_json::json!(report))),
        Err(e) => {
            error!(error = %e, "Scan task failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "Scan task failed"})),
            )
        }
    }
}

async fn scan_progress(State(state): State<OperatorState>) -> impl IntoResponse {
    Json(state.orchestrator.progress())
}

async fn last_results(State(state): State<OperatorState>) -> impl IntoResponse {
    match state.last_report.read().await.as_ref() {
        Some(report) => (StatusCode::OK, Json(serde_json::json!(report))),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "No scan has completed yet"})),
        ),
    }
}

// ── Results view ────────────────────────────────────────────────────────

/// Human-readable summary of a batch.
pub fn render_report(report: &BatchReport, label_name: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Results");
    if let Some(err) = &report.fetch_error {
        let _ = writeln!(out, "Could not fetch emails: {err}");
    }
    if report.flagged.is_empty() {
        let _ = writeln!(out, "No suspicious emails found in this batch");
    } else {
        let _ = writeln!(
            out,
            "Found {} potentially suspicious emails:",
            report.flagged.len()
        );
        for (i, record) in report.flagged.iter().enumerate() {
            let _ = writeln!(out, "\nEmail {}: {}", i + 1, record.subject);
            let _ = writeln!(out, "  From: {}", record.sender);
            let _ = writeln!(out, "  Date: {}", record.date);
            let _ = writeln!(out, "  Risk Assessment: {}", record.risk_narrative);
            match &record.local_archive_path {
                Some(path) => {
                    let _ = writeln!(out, "  Stored locally at: {}", path.display());
                }
                None => {
                    let _ = writeln!(out, "  Stored locally at: (not saved)");
                }
            }
            if record.label_applied {
                let _ = writeln!(out, "  Note: labelled '{label_name}' in the mailbox.");
            } else {
                let _ = writeln!(out, "  Note: the '{label_name}' label could not be applied.");
            }
        }
    }
    let _ = writeln!(
        out,
        "\nProcessed {} of {} fetched ({} failed). Cost: ${}",
        report.processed,
        report.fetched,
        report.failed,
        report.usage.cost_usd.round_dp(4)
    );
    out
}

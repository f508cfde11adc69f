use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;

use mail_guard::config::{
    self, DEFAULT_BATCH_LIMIT, GuardConfig, LOG_FILE_NAME, validate_batch_limit,
};
use mail_guard::llm::create_provider;
use mail_guard::mailbox::GmailMailbox;
use mail_guard::mailbox::auth::Authenticator;
use mail_guard::operator::{OperatorState, operator_routes, render_report};
use mail_guard::pipeline::{BatchOrchestrator, LocalArchive};
use mail_guard::session::Session;

#[derive(Parser, Debug)]
#[command(
    name = "mail-guard",
    version,
    about = "Flag suspicious emails with a chain of LLM analysis stages"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the operator HTTP API.
    Serve,
    /// Scan one batch and print the results.
    Scan {
        /// Number of emails to process (1-50).
        #[arg(long, default_value_t = DEFAULT_BATCH_LIMIT)]
        limit: usize,
        /// Folder (label name) to scan; defaults to MAIL_GUARD_FOLDER.
        #[arg(long)]
        folder: Option<String>,
    },
    /// Run the Gmail authorization flow and store a fresh token.
    Auth,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_tracing(&config::log_dir_from_env())?;

    if let Command::Auth = cli.command {
        let (credentials, token) = config::credential_paths_from_env();
        Authenticator::reauthorize(&credentials, &token).await?;
        eprintln!("Token saved to {}", token.display());
        return Ok(());
    }

    let config = GuardConfig::from_env().context("invalid configuration")?;

    eprintln!("🛡️  mail-guard v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", config.llm.model);
    eprintln!("   Label: {}", config.flagged_label);
    eprintln!("   Archive: {}", config.output_dir.display());

    let orchestrator = match build_orchestrator(&config).await {
        Ok(o) => Arc::new(o),
        Err(e) => {
            tracing::error!(error = %e, "Initialization failed");
            return Err(e.into());
        }
    };
    tracing::info!("System initialized successfully");

    match cli.command {
        Command::Serve => {
            let state = OperatorState::new(Arc::clone(&orchestrator), config.folder.clone());
            let app = operator_routes(state);
            let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
                .await
                .with_context(|| format!("failed to bind port {}", config.port))?;
            eprintln!("   API: http://0.0.0.0:{}/api/scan", config.port);
            tracing::info!(port = config.port, "Operator API started");
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = tokio::signal::ctrl_c().await;
                })
                .await?;
        }
        Command::Scan { limit, folder } => {
            let limit = validate_batch_limit(limit)?;
            let folder = folder.unwrap_or_else(|| config.folder.clone());
            let report = orchestrator.run(&folder, limit).await;
            println!("{}", render_report(&report, &config.flagged_label));
            tracing::info!(
                "Processing completed. See {} and the {} folder for details",
                LOG_FILE_NAME,
                config.output_dir.display()
            );
        }
        Command::Auth => {}
    }

    Ok(())
}

/// Authorize, open the session and wire the pipeline.
async fn build_orchestrator(config: &GuardConfig) -> mail_guard::error::Result<BatchOrchestrator> {
    let auth = Authenticator::load_or_authorize(&config.credentials_path, &config.token_path).await?;
    let mailbox = Arc::new(GmailMailbox::new(Arc::new(auth))?);
    tracing::info!("Gmail API authentication successful");

    let session = Arc::new(Session::initialize(mailbox, &config.flagged_label).await?);

    let archive = LocalArchive::new(&config.output_dir);
    archive.ensure_dir().await?;

    let llm = create_provider(&config.llm)?;
    Ok(BatchOrchestrator::new(session, llm, archive))
}

/// Console logging plus `email_processing.log` in `log_dir`.
fn init_tracing(log_dir: &Path) -> anyhow::Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(LOG_FILE_NAME)
        .build(log_dir)
        .context("failed to open log file")?;
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();
    Ok(guard)
}

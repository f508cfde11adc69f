//! Disposition of flagged messages: remote label plus local evidence file.
//!
//! The two effects are independent. A failed label mutation does not stop
//! the archive write, and neither failure escapes `dispose`.

use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Local};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{error, info, warn};

use crate::error::{DispositionError, InitError, PipelineError};
use crate::pipeline::cascade::truncate_chars;
use crate::pipeline::types::{CanonicalMessage, FlaggedRecord, StageOutput};
use crate::session::Session;

/// Body characters kept in an archive file.
pub const ARCHIVE_BODY_CHARS: usize = 1000;

const RISK_MARKER: &str = "\n\nRisk Assessment:\n";
const BODY_MARKER: &str = "\n\nEmail Body (truncated):\n";
const ELLIPSIS: &str = "...";

/// Attempts at a unique file name before giving up.
const MAX_NAME_ATTEMPTS: usize = 100;

// ── Local archive ───────────────────────────────────────────────────

/// Directory of one text file per flagged message.
#[derive(Debug, Clone)]
pub struct LocalArchive {
    dir: PathBuf,
}

/// Fields read back from an archive file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedRecord {
    pub subject: String,
    pub sender: String,
    pub date: String,
    pub message_id: String,
    pub risk_narrative: String,
    /// Body prefix, without the trailing ellipsis.
    pub body: String,
}

impl LocalArchive {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the output directory if needed.
    pub async fn ensure_dir(&self) -> Result<(), InitError> {
        if tokio::fs::try_exists(&self.dir).await.unwrap_or(false) {
            return Ok(());
        }
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| InitError::OutputDir {
                path: self.dir.clone(),
                source,
            })?;
        info!(path = %self.dir.display(), "Created local output directory");
        Ok(())
    }

    /// `flagged_email_{yyyyMMdd_HHmmss}_{id}.txt`
    pub fn file_name_for(timestamp: DateTime<Local>, message_id: &str) -> String {
        format!(
            "flagged_email_{}_{}.txt",
            timestamp.format("%Y%m%d_%H%M%S"),
            sanitize_id(message_id)
        )
    }

    /// Write a new archive file. Never overwrites: a taken name gets a
    /// numeric suffix.
    pub async fn write(
        &self,
        message: &CanonicalMessage,
        risk_narrative: &str,
    ) -> Result<PathBuf, DispositionError> {
        let contents = render_record(message, risk_narrative);
        let base = Self::file_name_for(Local::now(), &message.id);
        let stem = base.trim_end_matches(".txt");

        for attempt in 0..MAX_NAME_ATTEMPTS {
            let path = if attempt == 0 {
                self.dir.join(&base)
            } else {
                self.dir.join(format!("{stem}_{attempt}.txt"))
            };
            let file = tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await;
            let file = match file {
                Ok(f) => f,
                Err(e) if e.kind() == IoErrorKind::AlreadyExists => continue,
                Err(source) => return Err(DispositionError::Archive { path, source }),
            };
            return fill_or_discard(path, file, contents.as_bytes()).await;
        }

        Err(DispositionError::Archive {
            path: self.dir.join(base),
            source: std::io::Error::new(IoErrorKind::AlreadyExists, "no free archive file name"),
        })
    }

    /// Parse an archive file back into its fields.
    pub async fn read(path: &Path) -> Result<ArchivedRecord, DispositionError> {
        let text =
            tokio::fs::read_to_string(path)
                .await
                .map_err(|source| DispositionError::Archive {
                    path: path.to_path_buf(),
                    source,
                })?;
        parse_record(&text).map_err(|reason| DispositionError::MalformedArchive {
            path: path.to_path_buf(),
            reason,
        })
    }
}

/// Write `contents` to a freshly created file. On failure the partial file
/// is removed so no archive entry exists without a record pointing at it.
async fn fill_or_discard<W>(
    path: PathBuf,
    mut file: W,
    contents: &[u8],
) -> Result<PathBuf, DispositionError>
where
    W: AsyncWrite + Unpin,
{
    let written = async {
        file.write_all(contents).await?;
        file.flush().await
    }
    .await;
    drop(file);

    match written {
        Ok(()) => Ok(path),
        Err(source) => {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == IoErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to remove partial archive file")
                }
            }
            Err(DispositionError::Archive { path, source })
        }
    }
}

/// Provider ids are opaque; keep file names portable.
fn sanitize_id(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

pub fn render_record(message: &CanonicalMessage, risk_narrative: &str) -> String {
    format!(
        "Subject: {}\nFrom: {}\nDate: {}\nMessage ID: {}{RISK_MARKER}{}{BODY_MARKER}{}{ELLIPSIS}",
        message.subject,
        message.sender,
        message.date,
        message.id,
        risk_narrative,
        truncate_chars(&message.body, ARCHIVE_BODY_CHARS),
    )
}

pub fn parse_record(text: &str) -> Result<ArchivedRecord, String> {
    let (head, rest) = text
        .split_once(RISK_MARKER)
        .ok_or("missing risk assessment section")?;
    let (risk_narrative, body) = rest
        .split_once(BODY_MARKER)
        .ok_or("missing email body section")?;
    let body = body.strip_suffix(ELLIPSIS).ok_or("body is not terminated")?;

    let mut lines = head.lines();
    let mut field = |prefix: &str| -> Result<String, String> {
        lines
            .next()
            .and_then(|l| l.strip_prefix(prefix))
            .map(str::to_string)
            .ok_or_else(|| format!("missing '{}' line", prefix.trim_end()))
    };

    Ok(ArchivedRecord {
        subject: field("Subject: ")?,
        sender: field("From: ")?,
        date: field("Date: ")?,
        message_id: field("Message ID: ")?,
        risk_narrative: risk_narrative.to_string(),
        body: body.to_string(),
    })
}

// ── Executor ────────────────────────────────────────────────────────

/// Applies the flagged label and writes the archive file.
pub struct DispositionExecutor {
    session: Arc<Session>,
    archive: LocalArchive,
}

impl DispositionExecutor {
    pub fn new(session: Arc<Session>, archive: LocalArchive) -> Self {
        Self { session, archive }
    }

    pub fn archive(&self) -> &LocalArchive {
        &self.archive
    }

    /// Label and archive one message. Failures are logged and reflected in
    /// the record, never returned.
    pub async fn dispose(&self, message: &CanonicalMessage, risk: &StageOutput) -> FlaggedRecord {
        let label_applied = match self.apply_label(&message.id).await {
            Ok(()) => {
                info!(
                    id = %message.id,
                    label = %self.session.flagged_label().name,
                    "Labelled flagged message"
                );
                true
            }
            Err(e) => {
                let err = PipelineError::from(e);
                error!(
                    id = %message.id,
                    kind = ?err.kind(),
                    error = %err,
                    "Failed to label flagged message"
                );
                false
            }
        };

        let local_archive_path = match self.archive.write(message, &risk.narrative).await {
            Ok(path) => {
                info!(id = %message.id, path = %path.display(), "Saved flagged message locally");
                Some(path)
            }
            Err(e) => {
                let err = PipelineError::from(e);
                error!(
                    id = %message.id,
                    kind = ?err.kind(),
                    error = %err,
                    "Failed to save flagged message locally"
                );
                None
            }
        };

        FlaggedRecord {
            subject: message.subject.clone(),
            sender: message.sender.clone(),
            date: message.date.clone(),
            risk_narrative: risk.narrative.clone(),
            risk_score: risk.score,
            message_id: message.id.clone(),
            local_archive_path,
            label_applied,
            original: message.clone(),
        }
    }

    async fn apply_label(&self, message_id: &str) -> Result<(), DispositionError> {
        let label_id = &self.session.flagged_label().id;
        self.session
            .mailbox()
            .add_label(message_id, label_id)
            .await
            .map_err(|source| DispositionError::Label {
                message_id: message_id.to_string(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::{Header, InMemoryMailbox, Label, MessagePart, RawMessage};
    use crate::pipeline::types::StageKind;
    use chrono::TimeZone;

    fn message(id: &str, body: &str) -> CanonicalMessage {
        CanonicalMessage {
            id: id.into(),
            subject: "Urgent: verify your account".into(),
            sender: "security@paypa1-secure.com".into(),
            date: "Mon, 1 Jan 2024 10:00:00 +0000".into(),
            body: body.into(),
        }
    }

    fn risk() -> StageOutput {
        StageOutput::completed(
            StageKind::RiskAssessment,
            "Final risk score: 92\nCredential phishing.".into(),
            Some(92),
        )
    }

    #[test]
    fn file_name_layout() {
        let ts = Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(
            LocalArchive::file_name_for(ts, "18c2f/a b"),
            "flagged_email_20240309_070501_18c2f_a_b.txt"
        );
    }

    #[tokio::test]
    async fn round_trip_keeps_fields_and_body_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let archive = LocalArchive::new(dir.path());
        let body: String = "abcdefghij".repeat(150);
        let msg = message("m1", &body);

        let path = archive.write(&msg, &risk().narrative).await.unwrap();
        let back = LocalArchive::read(&path).await.unwrap();

        assert_eq!(back.subject, msg.subject);
        assert_eq!(back.sender, msg.sender);
        assert_eq!(back.date, msg.date);
        assert_eq!(back.message_id, "m1");
        assert_eq!(back.risk_narrative, "Final risk score: 92\nCredential phishing.");
        assert_eq!(back.body.chars().count(), ARCHIVE_BODY_CHARS);
        assert_eq!(back.body, body[..ARCHIVE_BODY_CHARS]);
    }

    #[tokio::test]
    async fn file_layout_matches_format() {
        let dir = tempfile::tempdir().unwrap();
        let archive = LocalArchive::new(dir.path());
        let path = archive.write(&message("m1", "short"), "85 - risky").await.unwrap();
        let text = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(
            text,
            "Subject: Urgent: verify your account\n\
             From: security@paypa1-secure.com\n\
             Date: Mon, 1 Jan 2024 10:00:00 +0000\n\
             Message ID: m1\n\
             \n\
             Risk Assessment:\n\
             85 - risky\n\
             \n\
             Email Body (truncated):\n\
             short..."
        );
    }

    #[tokio::test]
    async fn names_are_distinct_within_a_second() {
        let dir = tempfile::tempdir().unwrap();
        let archive = LocalArchive::new(dir.path());
        let mut paths = Vec::new();
        for id in ["a", "b", "c"] {
            paths.push(archive.write(&message(id, "x"), "r").await.unwrap());
        }
        // Same message twice in the same second never overwrites.
        paths.push(archive.write(&message("a", "y"), "r").await.unwrap());
        paths.sort();
        paths.dedup();
        assert_eq!(paths.len(), 4);
    }

    /// Accepts nothing, as on a full disk.
    struct FullDisk;

    impl AsyncWrite for FullDisk {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            std::task::Poll::Ready(Err(std::io::Error::other("no space left on device")))
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn failed_write_leaves_no_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flagged_email_20240101_000000_m1.txt");
        tokio::fs::write(&path, "").await.unwrap();

        let err = fill_or_discard(path.clone(), FullDisk, b"Subject: x")
            .await
            .unwrap_err();

        assert!(matches!(err, DispositionError::Archive { .. }));
        assert!(err.to_string().contains("no space left"));
        assert!(!path.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn malformed_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bogus.txt");
        tokio::fs::write(&path, "Subject: x\n").await.unwrap();
        let err = LocalArchive::read(&path).await.unwrap_err();
        assert!(matches!(err, DispositionError::MalformedArchive { .. }));
    }

    #[tokio::test]
    async fn ensure_dir_creates_nested_path() {
        let dir = tempfile::tempdir().unwrap();
        let archive = LocalArchive::new(dir.path().join("a/b/flagged"));
        archive.ensure_dir().await.unwrap();
        archive.ensure_dir().await.unwrap();
        assert!(archive.dir().is_dir());
    }

    fn session_with(mailbox: Arc<InMemoryMailbox>) -> Arc<Session> {
        Arc::new(Session::new(
            mailbox,
            Label {
                id: "Label_1".into(),
                name: "Flagged_Suspicious".into(),
            },
        ))
    }

    fn raw(id: &str) -> RawMessage {
        RawMessage {
            id: id.into(),
            headers: vec![Header::new("Subject", "s")],
            payload: MessagePart::Leaf {
                mime_type: "text/plain".into(),
                data: None,
            },
        }
    }

    #[tokio::test]
    async fn dispose_labels_and_archives() {
        let dir = tempfile::tempdir().unwrap();
        let mailbox = Arc::new(InMemoryMailbox::new().with_label("Label_1", "Flagged_Suspicious"));
        mailbox.push(raw("m1"));
        let executor = DispositionExecutor::new(session_with(mailbox.clone()), LocalArchive::new(dir.path()));

        let record = executor.dispose(&message("m1", "body"), &risk()).await;
        assert!(record.label_applied);
        assert_eq!(record.risk_score, Some(92));
        assert!(record.local_archive_path.as_ref().unwrap().exists());
        assert_eq!(mailbox.labels_of("m1"), vec!["INBOX", "Label_1"]);

        // Second disposition of the same message is harmless.
        let again = executor.dispose(&message("m1", "body"), &risk()).await;
        assert!(again.label_applied);
        assert_eq!(mailbox.labels_of("m1"), vec!["INBOX", "Label_1"]);
    }

    #[tokio::test]
    async fn label_failure_still_archives() {
        let dir = tempfile::tempdir().unwrap();
        let mailbox = Arc::new(InMemoryMailbox::new().with_label("Label_1", "Flagged_Suspicious"));
        mailbox.push(raw("m1"));
        mailbox.fail_add_label("m1");
        let executor = DispositionExecutor::new(session_with(mailbox.clone()), LocalArchive::new(dir.path()));

        let record = executor.dispose(&message("m1", "body"), &risk()).await;
        assert!(!record.label_applied);
        assert!(record.local_archive_path.is_some());
        assert_eq!(mailbox.label_mutations(), 0);
    }

    #[tokio::test]
    async fn archive_failure_still_labels() {
        let dir = tempfile::tempdir().unwrap();
        let mailbox = Arc::new(InMemoryMailbox::new().with_label("Label_1", "Flagged_Suspicious"));
        mailbox.push(raw("m1"));
        // Directory never created.
        let archive = LocalArchive::new(dir.path().join("missing"));
        let executor = DispositionExecutor::new(session_with(mailbox.clone()), archive);

        let record = executor.dispose(&message("m1", "body"), &risk()).await;
        assert!(record.label_applied);
        assert!(record.local_archive_path.is_none());
    }
}

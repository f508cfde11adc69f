//! End-to-end scans over an in-memory mailbox with scripted LLMs.

mod common;

use std::sync::Arc;

use common::{
    FLAGGED_LABEL, FailingLlm, PanickingMailbox, PhishingAwareLlm, files_in, newsletter_message,
    orchestrator, phishing_message,
};
use mail_guard::error::ErrorKind;
use mail_guard::mailbox::{InMemoryMailbox, find_label};
use mail_guard::pipeline::LocalArchive;
use mail_guard::pipeline::disposition::ARCHIVE_BODY_CHARS;

#[tokio::test]
async fn phishing_is_labelled_and_archived_once() {
    let dir = tempfile::tempdir().unwrap();
    let mailbox = Arc::new(InMemoryMailbox::new());
    mailbox.push(phishing_message("p1"));

    let orch = orchestrator(mailbox.clone(), Arc::new(PhishingAwareLlm), dir.path()).await;
    let records = orch.run_batch("INBOX", 5).await;

    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.message_id, "p1");
    assert_eq!(record.sender, "PayPal Security <security@paypa1-secure.com>");
    assert_eq!(record.risk_score, Some(95));
    assert!(record.label_applied);

    assert_eq!(mailbox.label_mutations(), 1);
    let label = find_label(&mailbox.labels(), FLAGGED_LABEL).unwrap().clone();
    assert!(mailbox.labels_of("p1").contains(&label.id));

    let files = files_in(dir.path());
    assert_eq!(files.len(), 1);
    assert_eq!(record.local_archive_path.as_ref(), Some(&files[0]));

    let archived = LocalArchive::read(&files[0]).await.unwrap();
    assert_eq!(archived.subject, "Urgent: Your account has been suspended");
    assert_eq!(archived.message_id, "p1");
    assert!(archived.risk_narrative.contains("95"));
    assert!(archived.body.starts_with("We detected unusual activity."));
    assert!(archived.body.chars().count() <= ARCHIVE_BODY_CHARS);
}

#[tokio::test]
async fn newsletter_leaves_no_trace() {
    let dir = tempfile::tempdir().unwrap();
    let mailbox = Arc::new(InMemoryMailbox::new());
    mailbox.push(newsletter_message("n1"));

    let orch = orchestrator(mailbox.clone(), Arc::new(PhishingAwareLlm), dir.path()).await;
    let report = orch.run("INBOX", 5).await;

    assert!(report.flagged.is_empty());
    assert_eq!(report.processed, 1);
    assert_eq!(mailbox.label_mutations(), 0);
    assert!(files_in(dir.path()).is_empty());
}

#[tokio::test]
async fn limit_caps_the_batch() {
    let dir = tempfile::tempdir().unwrap();
    let mailbox = Arc::new(InMemoryMailbox::new());
    for i in 0..12 {
        mailbox.push(newsletter_message(&format!("n{i}")));
    }

    let orch = orchestrator(mailbox.clone(), Arc::new(PhishingAwareLlm), dir.path()).await;
    let report = orch.run("INBOX", 5).await;

    assert_eq!(report.requested, 5);
    assert_eq!(report.processed, 5);
    assert_eq!(mailbox.fetched_ids().len(), 5);
}

#[tokio::test]
async fn panic_during_disposition_skips_only_that_message() {
    let dir = tempfile::tempdir().unwrap();
    let inner = Arc::new(InMemoryMailbox::new());
    for id in ["p0", "p1", "p2"] {
        inner.push(phishing_message(id));
    }
    let mailbox = Arc::new(PanickingMailbox {
        inner: inner.clone(),
        panic_on_label: "p1".into(),
    });

    let orch = orchestrator(mailbox, Arc::new(PhishingAwareLlm), dir.path()).await;
    let report = orch.run("INBOX", 5).await;

    let ids: Vec<_> = report.flagged.iter().map(|r| r.message_id.as_str()).collect();
    assert_eq!(ids, vec!["p0", "p2"]);
    assert_eq!(report.failed, 1);
    assert_eq!(report.failures[0].message_id, "p1");
    assert_eq!(report.failures[0].kind, ErrorKind::MessageProcessing);
    assert!(report.failures[0].error.contains("exploded"));
    assert_eq!(inner.label_mutations(), 2);
    assert_eq!(files_in(dir.path()).len(), 2);
}

#[tokio::test]
async fn fetch_failure_skips_only_that_message() {
    let dir = tempfile::tempdir().unwrap();
    let mailbox = Arc::new(InMemoryMailbox::new());
    mailbox.push(phishing_message("p0"));
    mailbox.push(newsletter_message("n1"));
    mailbox.push(phishing_message("p2"));
    mailbox.fail_get("n1");

    let orch = orchestrator(mailbox.clone(), Arc::new(PhishingAwareLlm), dir.path()).await;
    let report = orch.run("INBOX", 5).await;

    assert_eq!(report.flagged.len(), 2);
    assert_eq!(report.processed, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.failures[0].kind, ErrorKind::Fetch);
}

#[tokio::test]
async fn engine_outage_flags_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let mailbox = Arc::new(InMemoryMailbox::new());
    mailbox.push(phishing_message("p0"));
    mailbox.push(phishing_message("p1"));

    let orch = orchestrator(mailbox.clone(), Arc::new(FailingLlm), dir.path()).await;
    let report = orch.run("INBOX", 5).await;

    assert!(report.flagged.is_empty());
    assert_eq!(report.processed, 2);
    assert_eq!(report.failed, 0);
    assert_eq!(mailbox.label_mutations(), 0);
    assert!(files_in(dir.path()).is_empty());
}

#[tokio::test]
async fn rescan_reapplies_label_without_duplicating_it() {
    let dir = tempfile::tempdir().unwrap();
    let mailbox = Arc::new(InMemoryMailbox::new());
    mailbox.push(phishing_message("p1"));

    let orch = orchestrator(mailbox.clone(), Arc::new(PhishingAwareLlm), dir.path()).await;
    orch.run("INBOX", 5).await;
    orch.run("INBOX", 5).await;

    assert_eq!(mailbox.labels_of("p1").len(), 2);
    // One archive file per flagging, never overwritten.
    assert_eq!(files_in(dir.path()).len(), 2);
}

#[tokio::test]
async fn usage_is_accounted() {
    let dir = tempfile::tempdir().unwrap();
    let mailbox = Arc::new(InMemoryMailbox::new());
    mailbox.push(phishing_message("p1"));

    let orch = orchestrator(mailbox, Arc::new(PhishingAwareLlm), dir.path()).await;
    let report = orch.run("INBOX", 5).await;

    assert_eq!(report.usage.calls, 4);
    assert_eq!(report.usage.input_tokens, 400);
    assert_eq!(report.usage.output_tokens, 40);
    assert!(report.usage.cost_usd > rust_decimal::Decimal::ZERO);
}

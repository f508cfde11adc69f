//! Four-stage analysis cascade.
//!
//! Detection → Format Analysis → Risk Assessment → Final Decision, strictly
//! sequential. Each stage feeds its narrative to the next. A failed engine
//! call never aborts the cascade: the stage returns a fixed fallback text
//! and is marked degraded, and any degraded stage forces `Decision::Pass`.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::{debug, info, warn};

use crate::error::{LlmError, PipelineError};
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};
use crate::pipeline::types::{
    CanonicalMessage, CascadeOutcome, Decision, StageKind, StageOutput, TokenUsage,
};

/// Body characters shown to the detection stage.
pub const DETECTION_BODY_CHARS: usize = 10_000;

/// Body characters shown to the risk assessment stage.
pub const RISK_BODY_CHARS: usize = 5_000;

/// All stages run deterministically.
const TEMPERATURE: f32 = 0.0;

pub const FORMAT_FALLBACK: &str = "5 - Error in analysis";
pub const RISK_FALLBACK: &str = "50 - Error in assessment";

fn detection_fallback(reason: &str) -> String {
    format!("Error in detection: {reason}")
}

/// Runs the stages for one message at a time.
pub struct AnalysisCascade {
    llm: Arc<dyn LlmProvider>,
}

impl AnalysisCascade {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }

    /// Run all four stages.
    pub async fn run(&self, message: &CanonicalMessage) -> CascadeOutcome {
        let mut usage = TokenUsage::default();
        let detection = self.detect(message, &mut usage).await;
        let format = self.analyze_format(message, &detection, &mut usage).await;
        let risk = self.assess_risk(message, &format, &mut usage).await;
        let decision = self
            .decide(&message.id, [&detection, &format, &risk], &mut usage)
            .await;

        info!(
            id = %message.id,
            decision = ?decision,
            risk_score = ?risk.score,
            calls = usage.calls,
            "Cascade complete"
        );
        CascadeOutcome {
            detection,
            format,
            risk,
            decision,
            usage,
        }
    }

    /// Stage 1: suspicious content findings.
    pub async fn detect(&self, message: &CanonicalMessage, usage: &mut TokenUsage) -> StageOutput {
        let prompt = format!(
            "Analyze this email for suspicious elements:\n\
             Subject: {}\nSender: {}\n\n{}\n\n\
             Identify: 1. Urgent requests 2. Unusual sender addresses \
             3. Grammar mistakes 4. Suspicious links/attachments. \
             Output: List of findings.",
            message.subject,
            message.sender,
            truncate_chars(&message.body, DETECTION_BODY_CHARS),
        );
        match self.ask(StageKind::Detection, &message.id, prompt, usage).await {
            Ok(text) => StageOutput::completed(StageKind::Detection, text, None),
            Err(reason) => {
                StageOutput::degraded(StageKind::Detection, detection_fallback(&reason), reason)
            }
        }
    }

    /// Stage 2: header and format risk, 0-10. Does not see the body.
    pub async fn analyze_format(
        &self,
        message: &CanonicalMessage,
        detection: &StageOutput,
        usage: &mut TokenUsage,
    ) -> StageOutput {
        let prompt = format!(
            "Analyze email format based on detection report:\n\n\
             Detection Report:\n{}\n\n\
             Email Metadata:\nFrom: {}\nDate: {}\n\n\
             Check for: 1. Spoofed headers 2. Mismatched domains \
             3. Unusual formatting 4. Hidden content. \
             Output: Format risk score 0-10 with explanation.",
            detection.narrative, message.sender, message.date,
        );
        self.scored_stage(StageKind::FormatAnalysis, &message.id, prompt, FORMAT_FALLBACK, usage)
            .await
    }

    /// Stage 3: overall risk, 0-100.
    pub async fn assess_risk(
        &self,
        message: &CanonicalMessage,
        format: &StageOutput,
        usage: &mut TokenUsage,
    ) -> StageOutput {
        let prompt = format!(
            "Perform final risk assessment:\n\n\
             Subject: {}\nFormat Risk: {}\n\n\
             Content Summary (truncated):\n{}\n\n\
             Output: Final risk score 0-100 with justification.",
            message.subject,
            format.narrative,
            truncate_chars(&message.body, RISK_BODY_CHARS),
        );
        self.scored_stage(StageKind::RiskAssessment, &message.id, prompt, RISK_FALLBACK, usage)
            .await
    }

    /// Stage 4: flag or pass.
    ///
    /// The engine's YES/NO answer is trusted. When any upstream stage is
    /// degraded the engine is not consulted and the message passes.
    pub async fn decide(
        &self,
        message_id: &str,
        upstream: [&StageOutput; 3],
        usage: &mut TokenUsage,
    ) -> Decision {
        if let Some(degraded) = upstream.iter().find(|s| s.is_degraded()) {
            warn!(
                id = %message_id,
                stage = %degraded.stage,
                "Upstream stage degraded, passing message"
            );
            return Decision::Pass;
        }
        let risk = upstream[2];
        let prompt = format!(
            "Based on risk assessment, should this email be flagged?\n\
             Assessment: {}\n\n\
             Decision Criteria: Flag if risk > 70 or critical threats detected.\n\
             Output: ONLY 'YES' or 'NO'.",
            risk.narrative
        );
        match self.ask(StageKind::FinalDecision, message_id, prompt, usage).await {
            Ok(answer) => parse_decision(&answer),
            Err(_) => Decision::Pass,
        }
    }

    async fn scored_stage(
        &self,
        stage: StageKind,
        message_id: &str,
        prompt: String,
        fallback: &str,
        usage: &mut TokenUsage,
    ) -> StageOutput {
        match self.ask(stage, message_id, prompt, usage).await {
            Ok(text) => {
                let score = stage.score_range().and_then(|max| extract_score(&text, max));
                StageOutput::completed(stage, text, score)
            }
            Err(reason) => StageOutput::degraded(stage, fallback.to_string(), reason),
        }
    }

    /// One engine call. Errors come back as their display text after logging.
    async fn ask(
        &self,
        stage: StageKind,
        message_id: &str,
        prompt: String,
        usage: &mut TokenUsage,
    ) -> Result<String, String> {
        let request =
            CompletionRequest::new(vec![ChatMessage::user(prompt)]).with_temperature(TEMPERATURE);

        match self.llm.complete(request).await {
            Ok(response) => {
                usage.record(&response, self.llm.cost_per_token());
                debug!(
                    id = %message_id,
                    stage = %stage,
                    input_tokens = response.input_tokens,
                    output_tokens = response.output_tokens,
                    "Stage completed"
                );
                Ok(response.content)
            }
            Err(source) => {
                let reason = source.to_string();
                log_stage_failure(message_id, stage, source);
                Err(reason)
            }
        }
    }
}

fn log_stage_failure(message_id: &str, stage: StageKind, source: LlmError) {
    let err = PipelineError::Stage {
        stage: stage.name(),
        source,
    };
    warn!(id = %message_id, kind = ?err.kind(), error = %err, "Stage failed, using fallback");
}

/// `YES` (case-insensitive, surrounding whitespace ignored) flags; anything else passes.
pub fn parse_decision(answer: &str) -> Decision {
    if answer.trim().to_uppercase() == "YES" {
        Decision::Flag
    } else {
        Decision::Pass
    }
}

static LABELLED_SCORE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:score|risk)\b[^0-9\n]{0,24}(\d{1,3})\b").unwrap());
static FRACTION_SCORE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{1,3})\s*/\s*(\d{1,3})\b").unwrap());
static BARE_NUMBER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b(\d{1,3})\b").unwrap());
static SCALE_RANGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{1,3}\s*[-–]\s*(\d{1,3})\b").unwrap());

/// Pull a score in `0..=max` out of free text.
///
/// Tries, in order: a number after "score"/"risk", an `n/max` fraction, the
/// first bare number. Values above `max` are ignored, and so is an echoed
/// scale such as `(0-10)` or `0-100`.
pub fn extract_score(text: &str, max: u32) -> Option<u32> {
    let in_range = |raw: &str| raw.parse::<u32>().ok().filter(|v| *v <= max);

    let text = SCALE_RANGE.replace_all(text, |c: &regex::Captures| {
        if c[1].parse::<u32>().ok() == Some(max) {
            " ".repeat(c[0].len())
        } else {
            c[0].to_string()
        }
    });
    let text = text.as_ref();

    let labelled = LABELLED_SCORE
        .captures_iter(text)
        .find_map(|c| in_range(&c[1]));
    if labelled.is_some() {
        return labelled;
    }

    let fraction = FRACTION_SCORE.captures_iter(text).find_map(|c| {
        let denominator = c[2].parse::<u32>().ok()?;
        if denominator == max { in_range(&c[1]) } else { None }
    });
    if fraction.is_some() {
        return fraction;
    }

    BARE_NUMBER.captures_iter(text).find_map(|c| in_range(&c[1]))
}

/// First `max` characters of `s`.
pub fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

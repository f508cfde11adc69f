//! Bridges rig's `CompletionModel` to our `LlmProvider` trait.

use async_trait::async_trait;
use rig::completion::{AssistantContent, CompletionModel, Message};
use rust_decimal::Decimal;

use super::costs::model_cost;
use super::provider::{
    ChatMessage, CompletionRequest, CompletionResponse, FinishReason, LlmProvider, Role,
};
use crate::error::LlmError;

/// Anthropic rejects requests without a token cap.
const DEFAULT_MAX_TOKENS: u64 = 1024;

/// An `LlmProvider` backed by any rig completion model.
pub struct RigAdapter<M: CompletionModel> {
    model: M,
    provider: &'static str,
    model_name: String,
}

impl<M: CompletionModel> RigAdapter<M> {
    pub fn new(model: M, provider: &'static str, model_name: &str) -> Self {
        Self {
            model,
            provider,
            model_name: model_name.to_string(),
        }
    }
}

#[async_trait]
impl<M> LlmProvider for RigAdapter<M>
where
    M: CompletionModel + 'static,
{
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn cost_per_token(&self) -> (Decimal, Decimal) {
        model_cost(&self.model_name)
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let transcript =
            Transcript::split(&request.messages).ok_or_else(|| LlmError::RequestFailed {
                provider: self.provider.to_string(),
                reason: "request must end with a user message".to_string(),
            })?;
        let max_tokens = request
            .max_tokens
            .map(u64::from)
            .unwrap_or(DEFAULT_MAX_TOKENS);

        let mut builder = self
            .model
            .completion_request(Message::user(transcript.prompt))
            .messages(transcript.history.iter().map(to_rig_message).collect())
            .max_tokens(max_tokens);
        if let Some(preamble) = transcript.preamble {
            builder = builder.preamble(preamble);
        }
        if let Some(temperature) = request.temperature {
            builder = builder.temperature(f64::from(temperature));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| classify_failure(self.provider, e.to_string()))?;

        let content: String = response
            .choice
            .iter()
            .filter_map(|c| match c {
                AssistantContent::Text(text) => Some(text.text.as_str()),
                _ => None,
            })
            .collect();
        if content.is_empty() {
            return Err(LlmError::InvalidResponse {
                provider: self.provider.to_string(),
                reason: "response carried no text".to_string(),
            });
        }

        let output_tokens = response.usage.output_tokens;
        Ok(CompletionResponse {
            content,
            input_tokens: saturate(response.usage.input_tokens),
            output_tokens: saturate(output_tokens),
            finish_reason: if output_tokens >= max_tokens {
                FinishReason::Length
            } else {
                FinishReason::Stop
            },
            response_id: None,
        })
    }
}

/// A chat transcript in rig's shape.
#[derive(Debug, PartialEq, Eq)]
struct Transcript {
    /// System messages, joined.
    preamble: Option<String>,
    /// Turns before the prompt.
    history: Vec<ChatMessage>,
    /// The final user message.
    prompt: String,
}

impl Transcript {
    fn split(messages: &[ChatMessage]) -> Option<Self> {
        let system: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();
        let turns: Vec<&ChatMessage> = messages.iter().filter(|m| m.role != Role::System).collect();
        let (last, history) = turns.split_last()?;
        if last.role != Role::User {
            return None;
        }
        Some(Self {
            preamble: (!system.is_empty()).then(|| system.join("\n\n")),
            history: history.iter().map(|m| (*m).clone()).collect(),
            prompt: last.content.clone(),
        })
    }
}

fn to_rig_message(message: &ChatMessage) -> Message {
    match message.role {
        Role::Assistant => Message::assistant(message.content.clone()),
        Role::User | Role::System => Message::user(message.content.clone()),
    }
}

fn saturate(tokens: u64) -> u32 {
    u32::try_from(tokens).unwrap_or(u32::MAX)
}

/// rig flattens HTTP failures into text; recover the cases callers act on.
fn classify_failure(provider: &str, reason: String) -> LlmError {
    let lower = reason.to_lowercase();
    if lower.contains("401")
        || lower.contains("403")
        || lower.contains("unauthorized")
        || lower.contains("invalid api key")
        || lower.contains("authentication")
    {
        LlmError::AuthFailed {
            provider: provider.to_string(),
        }
    } else if lower.contains("429") || lower.contains("rate limit") || lower.contains("rate_limit") {
        LlmError::RateLimited {
            provider: provider.to_string(),
            retry_after: None,
        }
    } else {
        LlmError::RequestFailed {
            provider: provider.to_string(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcript_moves_system_text_to_preamble() {
        let t = Transcript::split(&[
            ChatMessage::system("be terse"),
            ChatMessage::user("first"),
            ChatMessage::assistant("ok"),
            ChatMessage::user("second"),
        ])
        .unwrap();
        assert_eq!(t.preamble.as_deref(), Some("be terse"));
        assert_eq!(
            t.history,
            vec![ChatMessage::user("first"), ChatMessage::assistant("ok")]
        );
        assert_eq!(t.prompt, "second");
    }

    #[test]
    fn single_prompt_has_no_history() {
        let t = Transcript::split(&[ChatMessage::user("Analyze this email")]).unwrap();
        assert_eq!(t.preamble, None);
        assert!(t.history.is_empty());
        assert_eq!(t.prompt, "Analyze this email");
    }

    #[test]
    fn transcript_must_end_with_user() {
        assert!(Transcript::split(&[]).is_none());
        assert!(Transcript::split(&[ChatMessage::system("only system")]).is_none());
        assert!(
            Transcript::split(&[ChatMessage::user("q"), ChatMessage::assistant("a")]).is_none()
        );
    }

    #[test]
    fn failures_are_classified() {
        assert!(matches!(
            classify_failure("openai", "ProviderError: 401 Unauthorized".into()),
            LlmError::AuthFailed { .. }
        ));
        assert!(matches!(
            classify_failure("anthropic", "HttpError: status 429 rate_limit_error".into()),
            LlmError::RateLimited { .. }
        ));
        match classify_failure("openai", "HttpError: connection reset".into()) {
            LlmError::RequestFailed { provider, reason } => {
                assert_eq!(provider, "openai");
                assert!(reason.contains("connection reset"));
            }
            other => panic!("expected RequestFailed, got {other:?}"),
        }
    }

    #[test]
    fn token_counts_saturate() {
        assert_eq!(saturate(42), 42);
        assert_eq!(saturate(u64::MAX), u32::MAX);
    }
}

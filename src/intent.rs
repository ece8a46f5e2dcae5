//! Intent Detectors (C4): three small LLM-driven classifiers —
//! database-needed, auth-needed, payment-needed.
//!
//! Built on the same `reqwest`-backed `Llm` trait and JSON-parse
//! discipline `agentic_loop.rs`'s response parsing uses, scaled down to
//! a single non-streaming call with no conversation state. Each
//! detector's system prompt demands *JSON-only* output naming exactly
//! the keys in `DetectionResult`; on any failure — transport error or
//! unparseable JSON — the detector returns the safe default
//! `needed=false` per §4.4, never propagates.

use async_trait::async_trait;

use crate::adapters::Llm;
use crate::adapters::llm::TokenUsage;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct DetectionResult {
    pub needed: bool,
    pub reasoning: String,
}

impl DetectionResult {
    fn detection_failed() -> Self {
        Self {
            needed: false,
            reasoning: "detection failed".to_string(),
        }
    }
}

pub struct DetectionOutcome {
    pub result: DetectionResult,
    pub usage: TokenUsage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionKind {
    Database,
    Auth,
    Payment,
}

impl DetectionKind {
    fn noun(self) -> &'static str {
        match self {
            Self::Database => "a relational database",
            Self::Auth => "user authentication/login",
            Self::Payment => "payment processing",
        }
    }

    /// Cost-ledger `messageType` tag for this detector's calls.
    pub fn message_type(self) -> &'static str {
        match self {
            Self::Database => "database-detection",
            Self::Auth => "auth-detection",
            Self::Payment => "payment-detection",
        }
    }
}

#[async_trait]
pub trait IntentDetector: Send + Sync {
    async fn detect(&self, kind: DetectionKind, user_prompt: &str) -> DetectionOutcome;
}

pub struct LlmIntentDetector {
    llm: std::sync::Arc<dyn Llm>,
}

impl LlmIntentDetector {
    pub fn new(llm: std::sync::Arc<dyn Llm>) -> Self {
        Self { llm }
    }

    fn system_prompt(kind: DetectionKind) -> String {
        format!(
            "You are a classifier. Decide whether the user's backend request requires {}. \
             Respond with JSON ONLY, no prose, matching exactly this shape: \
             {{\"needed\": boolean, \"reasoning\": string}}.",
            kind.noun()
        )
    }
}

#[async_trait]
impl IntentDetector for LlmIntentDetector {
    async fn detect(&self, kind: DetectionKind, user_prompt: &str) -> DetectionOutcome {
        let system = Self::system_prompt(kind);
        match self.llm.generate(user_prompt, Some(&system)).await {
            Ok(response) => {
                let result = parse_detection(&response.text).unwrap_or_else(|| {
                    tracing::warn!(?kind, "intent detector returned unparseable JSON");
                    DetectionResult::detection_failed()
                });
                DetectionOutcome {
                    result,
                    usage: response.usage,
                }
            }
            Err(e) => {
                tracing::warn!(?kind, error = %e, "intent detector LLM call failed");
                DetectionOutcome {
                    result: DetectionResult::detection_failed(),
                    usage: TokenUsage::default(),
                }
            }
        }
    }
}

fn parse_detection(text: &str) -> Option<DetectionResult> {
    serde_json::from_str(text.trim()).ok().or_else(|| {
        // Agents/classifiers sometimes wrap JSON in a fenced code block
        // despite the "JSON ONLY" instruction; strip fences once before
        // giving up, the same one-shot tolerance §4.8's response
        // sanitizer applies to the agentic loop's replies.
        let stripped = text
            .trim()
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim();
        serde_json::from_str(stripped).ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::AdapterError;
    use crate::adapters::llm::LlmResponse;

    struct ScriptedLlm {
        response: Result<String, String>,
    }

    #[async_trait]
    impl Llm for ScriptedLlm {
        async fn generate(&self, _prompt: &str, _system: Option<&str>) -> Result<LlmResponse, AdapterError> {
            match &self.response {
                Ok(text) => Ok(LlmResponse {
                    text: text.clone(),
                    usage: TokenUsage {
                        prompt_tokens: 10,
                        completion_tokens: 5,
                        total_tokens: 15,
                    },
                }),
                Err(e) => Err(AdapterError::Llm(e.clone())),
            }
        }
    }

    #[tokio::test]
    async fn detects_true_from_clean_json() {
        let llm = std::sync::Arc::new(ScriptedLlm {
            response: Ok(r#"{"needed": true, "reasoning": "user wants persistent storage"}"#.to_string()),
        });
        let detector = LlmIntentDetector::new(llm);
        let outcome = detector.detect(DetectionKind::Database, "store users and posts").await;
        assert!(outcome.result.needed);
        assert_eq!(outcome.usage.total_tokens, 15);
    }

    #[tokio::test]
    async fn tolerates_fenced_json() {
        let llm = std::sync::Arc::new(ScriptedLlm {
            response: Ok("```json\n{\"needed\": false, \"reasoning\": \"stateless passthrough\"}\n```".to_string()),
        });
        let detector = LlmIntentDetector::new(llm);
        let outcome = detector.detect(DetectionKind::Database, "weather passthrough").await;
        assert!(!outcome.result.needed);
    }

    #[tokio::test]
    async fn llm_failure_yields_safe_default() {
        let llm = std::sync::Arc::new(ScriptedLlm {
            response: Err("timeout".to_string()),
        });
        let detector = LlmIntentDetector::new(llm);
        let outcome = detector.detect(DetectionKind::Auth, "anything").await;
        assert!(!outcome.result.needed);
        assert_eq!(outcome.result.reasoning, "detection failed");
    }

    #[tokio::test]
    async fn unparseable_json_yields_safe_default() {
        let llm = std::sync::Arc::new(ScriptedLlm {
            response: Ok("not json at all".to_string()),
        });
        let detector = LlmIntentDetector::new(llm);
        let outcome = detector.detect(DetectionKind::Payment, "anything").await;
        assert!(!outcome.result.needed);
        assert_eq!(outcome.result.reasoning, "detection failed");
    }

    #[test]
    fn message_type_tags_match_spec_vocabulary() {
        assert_eq!(DetectionKind::Database.message_type(), "database-detection");
        assert_eq!(DetectionKind::Auth.message_type(), "auth-detection");
        assert_eq!(DetectionKind::Payment.message_type(), "payment-detection");
    }
}

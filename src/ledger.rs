//! Activity Ledger & Cost Accumulator (C3).
//!
//! One small function per row shape; failures are logged and contained
//! rather than bubbled past the caller that doesn't actually need to
//! know about them. §7 class 6 ("Ancillary error") is the entire reason
//! this module exists as a thin wrapper rather than callers using
//! `ControlDb` directly: every write here is swallowed on failure
//! (§4.3 "failures are logged and must not propagate").

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;

use crate::adapters::ControlDb;
use crate::adapters::db::Tx;
use worker_common::domain::{ActivityEntry, ActionType, MessageCostEntry};
use worker_common::ids::{ActionId, CostId, JobId, ProjectId, RequestId, UserId};

/// Static price table, USD per 1K tokens, keyed by model name (§4.3
/// "costFor... using a statically-configured price table"). Unknown
/// models fall back to `DEFAULT_MODEL_PRICE` and log a warning.
const PRICE_TABLE: &[(&str, f64, f64)] = &[
    ("gpt-4o-mini", 0.000150, 0.000600),
    ("gpt-4o", 0.0025, 0.010),
    ("gpt-4-turbo", 0.010, 0.030),
    ("claude-3-5-sonnet", 0.003, 0.015),
    ("claude-3-haiku", 0.00025, 0.00125),
];

const DEFAULT_INPUT_PRICE_PER_1K: f64 = 0.0025;
const DEFAULT_OUTPUT_PRICE_PER_1K: f64 = 0.010;

/// Computes the USD cost of one LLM call from token counts and model
/// name. Degrades to a configured default for unknown models (§4.3).
pub fn cost_for(input_tokens: u64, output_tokens: u64, model: &str) -> f64 {
    let (input_price, output_price) = PRICE_TABLE
        .iter()
        .find(|(name, _, _)| *name == model)
        .map(|(_, i, o)| (*i, *o))
        .unwrap_or_else(|| {
            tracing::warn!(%model, "unknown model in cost table, using default pricing");
            (DEFAULT_INPUT_PRICE_PER_1K, DEFAULT_OUTPUT_PRICE_PER_1K)
        });

    (input_tokens as f64 / 1000.0) * input_price + (output_tokens as f64 / 1000.0) * output_price
}

/// Truncates prompt text before it's persisted, matching §3's
/// "promptContent (truncated)".
const PROMPT_TRUNCATE_CHARS: usize = 2000;

fn truncate_prompt(prompt: &str) -> String {
    if prompt.chars().count() <= PROMPT_TRUNCATE_CHARS {
        prompt.to_string()
    } else {
        let truncated: String = prompt.chars().take(PROMPT_TRUNCATE_CHARS).collect();
        format!("{truncated}…")
    }
}

pub struct Ledger {
    db: Arc<dyn ControlDb>,
}

impl Ledger {
    pub fn new(db: Arc<dyn ControlDb>) -> Self {
        Self { db }
    }

    /// Writes one Activity Entry within the caller's outer transaction.
    /// Never propagates failure (§4.3, §7 class 6, I4).
    #[allow(clippy::too_many_arguments)]
    pub async fn record_activity(
        &self,
        tx: &mut Tx<'_>,
        project_id: &ProjectId,
        user_id: &UserId,
        request_id: Option<&RequestId>,
        action_type: ActionType,
        details: impl Into<String>,
        reference_ids: HashMap<String, String>,
    ) {
        let entry = ActivityEntry {
            action_id: ActionId::new(),
            project_id: project_id.clone(),
            user_id: user_id.clone(),
            request_id: request_id.cloned(),
            action_type,
            action_details: details.into(),
            status: "completed".to_string(),
            environment: environment_tag(),
            reference_ids,
            created_at: Utc::now(),
        };
        if let Err(e) = self.db.insert_activity(tx, &entry).await {
            tracing::warn!(
                project_id = %project_id,
                action_type = action_type.as_str(),
                error = %e,
                "activity ledger write failed, continuing"
            );
        }
    }

    /// Same contract, for call sites with no outer job transaction
    /// (the secret-sync job, §4.10).
    pub async fn record_activity_standalone(
        &self,
        project_id: &ProjectId,
        user_id: &UserId,
        action_type: ActionType,
        details: impl Into<String>,
        status: &str,
        reference_ids: HashMap<String, String>,
    ) {
        let entry = ActivityEntry {
            action_id: ActionId::new(),
            project_id: project_id.clone(),
            user_id: user_id.clone(),
            request_id: None,
            action_type,
            action_details: details.into(),
            status: status.to_string(),
            environment: environment_tag(),
            reference_ids,
            created_at: Utc::now(),
        };
        if let Err(e) = self.db.insert_activity_standalone(&entry).await {
            tracing::warn!(
                project_id = %project_id,
                action_type = action_type.as_str(),
                error = %e,
                "standalone activity ledger write failed, continuing"
            );
        }
    }

    /// Writes one Message-Cost row. Never propagates failure (§4.3).
    /// Returns the USD cost computed so the caller can fold it into a
    /// running total for the terminal message (I10) even when the
    /// write itself is swallowed.
    #[allow(clippy::too_many_arguments)]
    pub async fn record_message(
        &self,
        tx: &mut Tx<'_>,
        project_id: &ProjectId,
        job_id: &JobId,
        user_id: &UserId,
        prompt: &str,
        message_type: &str,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
        time_to_completion_ms: u64,
        started_at: chrono::DateTime<Utc>,
    ) -> f64 {
        let cost_usd = cost_for(input_tokens, output_tokens, model);
        let entry = MessageCostEntry {
            cost_id: CostId::new(),
            project_id: project_id.clone(),
            job_id: job_id.clone(),
            user_id: user_id.clone(),
            prompt_content: truncate_prompt(prompt),
            message_type: message_type.to_string(),
            model: model.to_string(),
            input_tokens,
            output_tokens,
            cost_usd,
            time_to_completion_ms,
            started_at,
            created_at: Utc::now(),
        };
        if let Err(e) = self.db.insert_message_cost(tx, &entry).await {
            tracing::warn!(
                project_id = %project_id,
                message_type,
                error = %e,
                "cost accumulator write failed, continuing"
            );
        }
        cost_usd
    }
}

fn environment_tag() -> String {
    std::env::var("NODE_ENV").unwrap_or_else(|_| "development".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_model_uses_its_own_price() {
        let cost = cost_for(1000, 1000, "gpt-4o-mini");
        assert!((cost - (0.000150 + 0.000600)).abs() < 1e-9);
    }

    #[test]
    fn unknown_model_falls_back_to_default() {
        let cost = cost_for(1000, 0, "some-future-model");
        assert!((cost - DEFAULT_INPUT_PRICE_PER_1K).abs() < 1e-9);
    }

    #[test]
    fn zero_tokens_cost_zero() {
        assert_eq!(cost_for(0, 0, "gpt-4o"), 0.0);
    }

    #[test]
    fn prompt_truncation_appends_ellipsis_only_when_needed() {
        let short = "a".repeat(10);
        assert_eq!(truncate_prompt(&short), short);
        let long = "a".repeat(PROMPT_TRUNCATE_CHARS + 10);
        let truncated = truncate_prompt(&long);
        assert!(truncated.ends_with('…'));
        assert_eq!(truncated.chars().count(), PROMPT_TRUNCATE_CHARS + 1);
    }
}

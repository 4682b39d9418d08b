//! Extended-reasoning ("thinking") request transform
//!
//! Clients select a thinking budget by suffixing the model name, e.g.
//! `claude-sonnet-4-5-thinking-8000`. The relay strips the suffix, injects a
//! `thinking` block with the clamped budget, and makes sure the max-output
//! field leaves room for the visible answer.

use serde_json::{json, Map, Value};
use tracing::{debug, info};

/// Upper bound for max-output tokens; budgets are clamped below it
pub const HARD_TOKEN_CAP: i64 = 32000;
/// Minimum tokens reserved above the thinking budget
pub const MINIMUM_HEADROOM: i64 = 1024;
/// Fraction of the budget reserved as headroom when larger than the minimum
pub const HEADROOM_RATIO: f64 = 0.10;
/// Capability token sent in `anthropic-beta` for thinking requests
pub const THINKING_BETA: &str = "interleaved-thinking-2025-05-14";

const THINKING_INFIX: &str = "-thinking-";
const THINKING_SUFFIX: &str = "-thinking";
const MAX_TOKENS: &str = "max_tokens";
const MAX_OUTPUT_TOKENS: &str = "max_output_tokens";

/// Model prefixes the transform and the cloud gateway apply to
const THINKING_FAMILIES: &[&str] = &["claude-", "gemini-claude-"];
const GEMINI_CLAUDE_PREFIX: &str = "gemini-claude-";

/// Result of inspecting a model name for a thinking suffix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThinkingRequest {
    /// Model name with any budget suffix removed
    pub model: String,
    /// Clamped budget, when the suffix carried a valid one
    pub budget: Option<i64>,
    /// Whether the thinking capability header must be sent
    pub beta_required: bool,
}

/// Outcome of running the transform over a request body
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Transformed {
    /// Rewritten body, `None` when the original bytes should be forwarded
    pub body: Option<Vec<u8>>,
    pub beta_required: bool,
}

/// Whether `model` belongs to a family that understands thinking parameters
pub fn is_thinking_family(model: &str) -> bool {
    THINKING_FAMILIES.iter().any(|prefix| model.starts_with(prefix))
}

/// Clamp a parsed budget into `[1, HARD_TOKEN_CAP - 1]`
pub fn clamp_budget(budget: i64) -> i64 {
    budget.clamp(1, HARD_TOKEN_CAP - 1)
}

/// Max-output value that leaves headroom above `budget`, never above the hard cap
pub fn required_max_tokens(budget: i64) -> i64 {
    let scaled = (budget as f64 * HEADROOM_RATIO).round() as i64;
    let headroom = scaled.max(MINIMUM_HEADROOM);
    let mut required = (budget + headroom).min(HARD_TOKEN_CAP);
    if required <= budget {
        required = (budget + 1).min(HARD_TOKEN_CAP);
    }
    required
}

/// Inspect a model name. Returns `None` for models outside the thinking
/// families or without any thinking marker.
pub fn parse_model(model: &str) -> Option<ThinkingRequest> {
    if !is_thinking_family(model) {
        return None;
    }

    let Some(index) = model.rfind(THINKING_INFIX) else {
        if model.ends_with(THINKING_SUFFIX) || model.contains("-thinking(") {
            return Some(ThinkingRequest {
                model: model.to_string(),
                budget: None,
                beta_required: true,
            });
        }
        return None;
    };

    let budget_str = &model[index + THINKING_INFIX.len()..];
    // gemini-claude-* models keep "-thinking" in their canonical name
    let clean = if model.starts_with(GEMINI_CLAUDE_PREFIX) {
        model[..index + THINKING_SUFFIX.len()].to_string()
    } else {
        model[..index].to_string()
    };

    let budget = budget_str
        .parse::<i64>()
        .ok()
        .filter(|b| *b > 0)
        .map(clamp_budget);

    Some(ThinkingRequest {
        model: clean,
        budget,
        beta_required: true,
    })
}

/// Read the `model` field of a JSON body, if any
pub fn body_model(body: &[u8]) -> Option<String> {
    let payload: Value = serde_json::from_slice(body).ok()?;
    payload.get("model")?.as_str().map(String::from)
}

/// Whether the body names a model the cloud gateway serves
pub fn is_gateway_eligible(body: &[u8]) -> bool {
    body_model(body).is_some_and(|m| is_thinking_family(&m))
}

/// Apply the thinking transform to a JSON request body.
///
/// Bodies that are not JSON objects, carry no string `model`, or name a model
/// outside the thinking families pass through untouched.
pub fn apply_thinking(body: &[u8]) -> Transformed {
    let Ok(Value::Object(mut payload)) = serde_json::from_slice::<Value>(body) else {
        return Transformed::default();
    };

    let Some(original) = payload.get("model").and_then(Value::as_str).map(String::from) else {
        return Transformed::default();
    };

    let Some(request) = parse_model(&original) else {
        return Transformed::default();
    };

    if request.model == original {
        // Bare "-thinking" marker: header only
        debug!(model = %original, "Thinking model detected, enabling beta header");
        return Transformed {
            body: None,
            beta_required: true,
        };
    }

    payload.insert("model".to_string(), Value::String(request.model.clone()));

    let Some(budget) = request.budget else {
        info!(model = %original, cleaned = %request.model, "Stripped invalid thinking suffix");
        return Transformed {
            body: serde_json::to_vec(&payload).ok(),
            beta_required: true,
        };
    };

    payload.insert(
        "thinking".to_string(),
        json!({ "type": "enabled", "budget_tokens": budget }),
    );
    raise_max_tokens(&mut payload, budget);

    info!(
        model = %original,
        cleaned = %request.model,
        budget,
        "Injected thinking budget"
    );

    Transformed {
        body: serde_json::to_vec(&payload).ok(),
        beta_required: true,
    }
}

/// Raise existing max-output fields that are at or below `budget`; add
/// `max_tokens` when neither field is present.
fn raise_max_tokens(payload: &mut Map<String, Value>, budget: i64) {
    let required = required_max_tokens(budget);
    let mut present = false;

    for field in [MAX_TOKENS, MAX_OUTPUT_TOKENS] {
        let Some(current) = payload.get(field).and_then(Value::as_f64) else {
            continue;
        };
        present = true;
        if (current as i64) <= budget {
            payload.insert(field.to_string(), Value::from(required));
        }
    }

    if !present {
        let field = if payload.contains_key(MAX_OUTPUT_TOKENS) {
            MAX_OUTPUT_TOKENS
        } else {
            MAX_TOKENS
        };
        payload.insert(field.to_string(), Value::from(required));
    }
}

//! Turning free-form model text into an [`ActionPlan`].
//!
//! Models wrap JSON in code fences, prepend reasoning, or leave trailing
//! commas. One repair pass handles those; anything it cannot fix is reported
//! as [`PlannerError::Malformed`] with the raw text attached.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::errors::PlannerError;
use crate::executor::action::plan_from_value;
use crate::executor::ActionPlan;

/// Raw text kept on a malformed error, in characters.
const RAW_EXCERPT: usize = 2000;

static FENCE_RE: OnceLock<Regex> = OnceLock::new();
static THINK_RE: OnceLock<Regex> = OnceLock::new();
static TRAILING_COMMA_RE: OnceLock<Regex> = OnceLock::new();

fn fence_re() -> &'static Regex {
    FENCE_RE.get_or_init(|| Regex::new(r"(?s)```[A-Za-z]*\s*(.*?)\s*```").expect("fence pattern compiles"))
}

fn think_re() -> &'static Regex {
    THINK_RE.get_or_init(|| Regex::new(r"(?s)<think>.*?</think>").expect("think pattern compiles"))
}

fn trailing_comma_re() -> &'static Regex {
    TRAILING_COMMA_RE.get_or_init(|| Regex::new(r",\s*([}\]])").expect("trailing comma pattern compiles"))
}

pub(crate) fn excerpt(raw: &str) -> String {
    raw.chars().take(RAW_EXCERPT).collect()
}

/// Parses model output into a validated plan, repairing it once if needed.
pub fn parse_plan(raw: &str) -> Result<ActionPlan, PlannerError> {
    let value = parse_json_lenient(raw)?;
    plan_from_value(&value).map_err(|e| PlannerError::malformed(e.to_string(), excerpt(raw)))
}

/// Strict parse first, then one repair pass.
pub fn parse_json_lenient(raw: &str) -> Result<Value, PlannerError> {
    let text = raw.trim();
    if text.is_empty() {
        return Err(PlannerError::malformed("empty response", ""));
    }
    if let Ok(v) = serde_json::from_str::<Value>(text) {
        return Ok(v);
    }
    match repair_json(text) {
        Some(v) => {
            tracing::debug!("planner output needed JSON repair");
            Ok(v)
        }
        None => Err(PlannerError::malformed("no JSON object in response", excerpt(raw))),
    }
}

fn repair_json(text: &str) -> Option<Value> {
    let without_thoughts = think_re().replace_all(text, "");
    let unfenced = match fence_re().captures(&without_thoughts) {
        Some(c) => c.get(1).map(|m| m.as_str().to_string()).unwrap_or_default(),
        None => without_thoughts.to_string(),
    };
    let candidate = first_object(&unfenced).unwrap_or(unfenced.as_str());
    serde_json::from_str(candidate)
        .ok()
        .or_else(|| serde_json::from_str(&trailing_comma_re().replace_all(candidate, "$1")).ok())
}

/// The first balanced `{...}` span, ignoring braces inside strings.
fn first_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

// Shared HTTP plumbing for the planner backends.
use std::time::Duration;

use reqwest::StatusCode;
use serde_json::Value;

use crate::errors::PlannerError;
use crate::planner::repair::excerpt;

pub(crate) fn client(timeout: Duration) -> Result<reqwest::Client, PlannerError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| PlannerError::Fatal(format!("HTTP client could not be built: {e}")))
}

/// Maps a non-success status onto the planner error taxonomy.
pub(crate) fn classify_status(status: StatusCode, body: &str) -> PlannerError {
    let detail = format!("{status}: {}", excerpt(body.trim()));
    match status {
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => PlannerError::Transient(detail),
        s if s.is_server_error() => PlannerError::Transient(detail),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            PlannerError::Fatal(format!("credentials rejected ({detail})"))
        }
        _ => PlannerError::Fatal(detail),
    }
}

/// Reads a response body as JSON, classifying failures.
pub(crate) async fn read_json(response: reqwest::Response) -> Result<Value, PlannerError> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(classify_status(status, &body));
    }
    serde_json::from_str(&body)
        .map_err(|e| PlannerError::malformed(format!("response body is not JSON: {e}"), excerpt(&body)))
}

/// Text of a chat completion in either OpenAI (`choices[0].message.content`)
/// or Ollama (`message.content`) shape.
pub(crate) fn extract_chat_text(body: &Value) -> Option<String> {
    let message = body
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .or_else(|| body.get("message"))?;
    let text = match message.get("content")? {
        Value::String(s) => Some(s.clone()),
        // Some servers return content parts.
        Value::Array(parts) => Some(
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join(""),
        ),
        _ => None,
    };
    text.filter(|s| !s.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn statuses_map_onto_the_taxonomy() {
        assert!(matches!(classify_status(StatusCode::TOO_MANY_REQUESTS, ""), PlannerError::Transient(_)));
        assert!(matches!(classify_status(StatusCode::SERVICE_UNAVAILABLE, ""), PlannerError::Transient(_)));
        assert!(matches!(classify_status(StatusCode::REQUEST_TIMEOUT, ""), PlannerError::Transient(_)));
        assert!(matches!(classify_status(StatusCode::UNAUTHORIZED, "bad key"), PlannerError::Fatal(_)));
        assert!(matches!(classify_status(StatusCode::BAD_REQUEST, "unknown model"), PlannerError::Fatal(_)));
    }

    #[test]
    fn chat_text_in_both_shapes() {
        let openai = json!({"choices": [{"message": {"role": "assistant", "content": "{\"a\":1}"}}]});
        assert_eq!(extract_chat_text(&openai).as_deref(), Some("{\"a\":1}"));
        let ollama = json!({"model": "qwen3-vl", "message": {"role": "assistant", "content": "hi"}, "done": true});
        assert_eq!(extract_chat_text(&ollama).as_deref(), Some("hi"));
        let parts = json!({"choices": [{"message": {"content": [{"type": "text", "text": "a"}, {"type": "text", "text": "b"}]}}]});
        assert_eq!(extract_chat_text(&parts).as_deref(), Some("ab"));
        assert_eq!(extract_chat_text(&json!({"choices": []})), None);
        assert_eq!(extract_chat_text(&json!({"message": {"content": "  "}})), None);
    }
}

// Hosted multimodal planner (Gemini `generateContent` REST API).
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::agent_engine::state::AgentState;
use crate::config::{resolve_api_key, PlannerConfig};
use crate::errors::PlannerError;
use crate::executor::ActionPlan;
use crate::perception::types::Observation;
use crate::planner::provider::Planner;
use crate::planner::{http, prompt, repair};

pub struct RemotePlanner {
    api_base: String,
    model: String,
    /// `None` when no key is configured; every call then fails fatally.
    api_key: Option<String>,
    client: reqwest::Client,
}

impl RemotePlanner {
    pub fn from_config(cfg: &PlannerConfig) -> Result<Self, PlannerError> {
        let api_key = resolve_api_key("remote", Some("GEMINI_API_KEY"), &cfg.remote.api_key);
        if api_key.is_none() {
            tracing::warn!("no API key for the remote planner; set DESKPILOT_REMOTE_API_KEY or GEMINI_API_KEY");
        }
        Ok(Self {
            api_base: cfg.remote.api_base.trim_end_matches('/').to_string(),
            model: cfg.remote.model.clone(),
            api_key,
            client: http::client(cfg.timeout())?,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/models/{}:generateContent", self.api_base, self.model)
    }

    fn request_body(&self, observation: &Observation, state: &AgentState) -> Result<Value, PlannerError> {
        let image = observation
            .to_base64_png()
            .map_err(|e| PlannerError::Transient(format!("screenshot encoding failed: {e}")))?;
        Ok(json!({
            "contents": [{
                "role": "user",
                "parts": [
                    { "text": prompt::render(state, Some(&observation.meta), None) },
                    { "inline_data": { "mime_type": "image/png", "data": image } }
                ]
            }],
            "generationConfig": {
                "temperature": 0.0,
                "responseMimeType": "application/json"
            }
        }))
    }
}

/// Concatenated text parts of the first candidate.
fn candidate_text(body: &Value) -> Result<String, PlannerError> {
    if let Some(reason) = body.pointer("/promptFeedback/blockReason").and_then(|r| r.as_str()) {
        return Err(PlannerError::malformed(format!("prompt blocked: {reason}"), body.to_string()));
    }
    let parts = body
        .pointer("/candidates/0/content/parts")
        .and_then(|p| p.as_array())
        .ok_or_else(|| PlannerError::malformed("response has no candidate content", repair::excerpt(&body.to_string())))?;
    let text: String = parts.iter().filter_map(|p| p.get("text").and_then(|t| t.as_str())).collect();
    Ok(text)
}

#[async_trait]
impl Planner for RemotePlanner {
    fn name(&self) -> &str {
        "remote"
    }

    async fn propose(&self, observation: &Observation, state: &AgentState) -> Result<ActionPlan, PlannerError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| PlannerError::Fatal("remote planner has no API key".into()))?;

        tracing::debug!(model = %self.model, width = observation.meta.physical_width, "requesting remote plan");
        let body = self.request_body(observation, state)?;
        let response = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", api_key)
            .json(&body)
            .send()
            .await?;
        let value = http::read_json(response).await?;
        let text = candidate_text(&value)?;
        repair::parse_plan(&text)
    }
}

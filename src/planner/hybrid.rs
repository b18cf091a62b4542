// Two-stage planner: scene description first, then a text-only model.
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::agent_engine::state::AgentState;
use crate::config::{resolve_api_key, PlannerConfig};
use crate::errors::PlannerError;
use crate::executor::ActionPlan;
use crate::perception::types::Observation;
use crate::planner::provider::Planner;
use crate::planner::vision::{HttpVisionService, SceneDescription, VisionHandle, VisionService};
use crate::planner::{http, prompt, repair};

pub struct HybridPlanner {
    vision: VisionHandle,
    text_url: String,
    text_model: String,
    text_api_key: Option<String>,
    client: reqwest::Client,
}

impl HybridPlanner {
    pub fn from_config(cfg: &PlannerConfig) -> Result<Self, PlannerError> {
        let vision_base = cfg.hybrid.vision_base_url.clone();
        let vision_model = cfg.hybrid.vision_model.clone().filter(|m| !m.trim().is_empty());
        let timeout = cfg.timeout();
        let vision = VisionHandle::lazy(move || {
            let service = HttpVisionService::new(&vision_base, vision_model.clone(), timeout)?;
            Ok(Arc::new(service) as Arc<dyn VisionService>)
        });
        Self::with_vision(cfg, vision)
    }

    /// Builds the planner around an explicitly supplied vision handle.
    pub fn with_vision(cfg: &PlannerConfig, vision: VisionHandle) -> Result<Self, PlannerError> {
        Ok(Self {
            vision,
            text_url: completions_url(&cfg.hybrid.text_base_url),
            text_model: cfg.hybrid.text_model.clone(),
            text_api_key: resolve_api_key("text", Some("TEXT_API_KEY"), &cfg.hybrid.text_api_key),
            client: http::client(cfg.timeout())?,
        })
    }

    async fn describe(&self, observation: &Observation) -> Result<SceneDescription, PlannerError> {
        let png = observation
            .to_png()
            .map_err(|e| PlannerError::Transient(format!("screenshot encoding failed: {e}")))?;
        let service = self.vision.get().await?;
        let scene = service.describe_scene(&png).await?;
        tracing::debug!(
            caption_len = scene.caption.len(),
            regions = scene.text_regions.len(),
            "scene described"
        );
        Ok(scene)
    }
}

fn completions_url(base: &str) -> String {
    let base = base.trim_end_matches('/');
    if base.ends_with("/chat/completions") {
        base.to_string()
    } else {
        format!("{base}/chat/completions")
    }
}

#[async_trait]
impl Planner for HybridPlanner {
    fn name(&self) -> &str {
        "hybrid"
    }

    async fn propose(&self, observation: &Observation, state: &AgentState) -> Result<ActionPlan, PlannerError> {
        let scene = self.describe(observation).await?;
        let text = prompt::render(state, Some(&observation.meta), Some(&scene));
        let body = json!({
            "model": self.text_model,
            "messages": [{ "role": "system", "content": text }],
            "temperature": 0,
            "stream": false
        });

        tracing::debug!(url = %self.text_url, model = %self.text_model, "requesting text plan");
        let mut request = self.client.post(&self.text_url).json(&body);
        if let Some(key) = &self.text_api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await?;
        let value = http::read_json(response).await?;
        let content = http::extract_chat_text(&value)
            .ok_or_else(|| PlannerError::malformed("text model response has no message content", repair::excerpt(&value.to_string())))?;
        repair::parse_plan(&content)
    }
}

//! Scene description service used by the two-stage planner.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::OnceCell;

use crate::errors::PlannerError;
use crate::planner::{http, repair};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SceneDescription {
    pub caption: String,
    pub text_regions: Vec<String>,
}

impl SceneDescription {
    /// Accepts `{description|caption, detected_text|text_regions}`, where the
    /// text may be one OCR string, a list of strings, or a list of `{text}`.
    pub fn from_value(v: &Value) -> Result<Self, PlannerError> {
        if let Some(err) = v.get("error").and_then(|e| e.as_str()) {
            return Err(PlannerError::Transient(format!("vision service error: {err}")));
        }
        let caption = ["description", "caption", "scene"]
            .iter()
            .find_map(|k| v.get(*k).and_then(|c| c.as_str()))
            .unwrap_or_default()
            .trim()
            .to_string();

        let raw_text = v.get("detected_text").or_else(|| v.get("text_regions"));
        let text_regions = match raw_text {
            Some(Value::String(s)) => s.lines().map(str::trim).filter(|l| !l.is_empty()).map(str::to_string).collect(),
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|i| i.as_str().or_else(|| i.get("text").and_then(|t| t.as_str())))
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        };

        if caption.is_empty() && text_regions.is_empty() {
            return Err(PlannerError::malformed("vision response has neither caption nor text", repair::excerpt(&v.to_string())));
        }
        Ok(Self { caption, text_regions })
    }
}

#[async_trait]
pub trait VisionService: Send + Sync {
    async fn describe_scene(&self, png: &[u8]) -> Result<SceneDescription, PlannerError>;
}

/// Multipart `POST {base}/vision` client.
pub struct HttpVisionService {
    base_url: String,
    model: Option<String>,
    client: reqwest::Client,
}

impl HttpVisionService {
    pub fn new(base_url: &str, model: Option<String>, timeout: std::time::Duration) -> Result<Self, PlannerError> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            client: http::client(timeout)?,
        })
    }
}

#[async_trait]
impl VisionService for HttpVisionService {
    async fn describe_scene(&self, png: &[u8]) -> Result<SceneDescription, PlannerError> {
        let mut payload = json!({ "inputs": [], "parameters": { "task": "detailed_scene" } });
        if let Some(model) = &self.model {
            payload["model"] = json!(model);
        }
        let image = reqwest::multipart::Part::bytes(png.to_vec())
            .file_name("screenshot.png")
            .mime_str("image/png")
            .map_err(|e| PlannerError::Fatal(format!("multipart part could not be built: {e}")))?;
        let form = reqwest::multipart::Form::new()
            .text("payload", payload.to_string())
            .part("image", image);

        let url = format!("{}/vision", self.base_url);
        tracing::debug!(url = %url, bytes = png.len(), "requesting scene description");
        let response = self.client.post(&url).multipart(form).send().await?;
        let body = http::read_json(response).await?;
        SceneDescription::from_value(&body)
    }
}

type VisionFactory = Box<dyn Fn() -> Result<Arc<dyn VisionService>, PlannerError> + Send + Sync>;

/// Owned, lazily initialized vision service. The factory runs at most once
/// successfully; a failed initialization is retried on the next call.
pub struct VisionHandle {
    factory: VisionFactory,
    cell: OnceCell<Arc<dyn VisionService>>,
}

impl VisionHandle {
    pub fn lazy<F>(factory: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn VisionService>, PlannerError> + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
            cell: OnceCell::new(),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.cell.initialized()
    }

    pub async fn get(&self) -> Result<&Arc<dyn VisionService>, PlannerError> {
        self.cell
            .get_or_try_init(|| async {
                tracing::info!("initializing vision service");
                (self.factory)()
            })
            .await
    }
}

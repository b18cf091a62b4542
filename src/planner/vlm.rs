// Locally hosted vision-language model: OpenAI-compatible first, Ollama on 404.
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};

use crate::agent_engine::state::AgentState;
use crate::config::{resolve_api_key, PlannerConfig};
use crate::errors::PlannerError;
use crate::executor::ActionPlan;
use crate::perception::types::Observation;
use crate::planner::provider::Planner;
use crate::planner::{http, prompt, repair};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Convention {
    /// `POST .../v1/chat/completions` with `image_url` content parts.
    OpenAi,
    /// `POST .../api/chat` with a bare `images` array.
    Ollama,
}

pub struct VlmPlanner {
    base_url: String,
    model: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

/// Endpoints to try in order. Explicit paths in `base_url` are honored.
pub(crate) fn chat_urls(base_url: &str) -> Vec<(Convention, String)> {
    let mut root = base_url.trim_end_matches('/').to_string();

    let openai = if let Some(stripped) = root.strip_suffix("/v1/chat/completions") {
        let url = root.clone();
        root = stripped.to_string();
        url
    } else if let Some(stripped) = root.strip_suffix("/chat/completions") {
        let url = root.clone();
        root = stripped.to_string();
        url
    } else if let Some(stripped) = root.strip_suffix("/v1") {
        let url = format!("{root}/chat/completions");
        root = stripped.to_string();
        url
    } else if let Some(stripped) = root.strip_suffix("/api/chat") {
        // Explicit Ollama endpoint: skip the OpenAI attempt entirely.
        return vec![(Convention::Ollama, format!("{stripped}/api/chat"))];
    } else {
        format!("{root}/v1/chat/completions")
    };

    let ollama = match root.strip_suffix("/api") {
        Some(_) => format!("{root}/chat"),
        None => format!("{root}/api/chat"),
    };

    vec![(Convention::OpenAi, openai), (Convention::Ollama, ollama)]
}

impl VlmPlanner {
    pub fn from_config(cfg: &PlannerConfig) -> Result<Self, PlannerError> {
        Ok(Self {
            base_url: cfg.vlm.base_url.clone(),
            model: cfg.vlm.model.clone(),
            api_key: resolve_api_key("vlm", Some("VLM_API_KEY"), &cfg.vlm.api_key),
            client: http::client(cfg.timeout())?,
        })
    }

    fn request_body(&self, convention: Convention, text: &str, image_b64: &str) -> Value {
        match convention {
            Convention::OpenAi => json!({
                "model": self.model,
                "stream": false,
                "temperature": 0.0,
                "messages": [{
                    "role": "user",
                    "content": [
                        { "type": "text", "text": text },
                        { "type": "image_url", "image_url": { "url": format!("data:image/png;base64,{image_b64}") } }
                    ]
                }]
            }),
            Convention::Ollama => json!({
                "model": self.model,
                "stream": false,
                "options": { "temperature": 0.0, "seed": 1 },
                "messages": [{
                    "role": "user",
                    "content": text,
                    "images": [image_b64]
                }]
            }),
        }
    }
}

#[async_trait]
impl Planner for VlmPlanner {
    fn name(&self) -> &str {
        "vlm"
    }

    async fn propose(&self, observation: &Observation, state: &AgentState) -> Result<ActionPlan, PlannerError> {
        let image = observation
            .to_base64_png()
            .map_err(|e| PlannerError::Transient(format!("screenshot encoding failed: {e}")))?;
        let text = format!(
            "{}\nAnalyze the screenshot and respond with JSON only.",
            prompt::render(state, Some(&observation.meta), None)
        );

        let mut last_404 = None;
        for (convention, url) in chat_urls(&self.base_url) {
            tracing::debug!(url = %url, model = %self.model, ?convention, "requesting local VLM plan");
            let mut request = self.client.post(&url).json(&self.request_body(convention, &text, &image));
            if let Some(key) = &self.api_key {
                request = request.bearer_auth(key);
            }
            let response = request.send().await?;
            if response.status() == StatusCode::NOT_FOUND {
                tracing::warn!(url = %url, "VLM endpoint returned 404, trying next convention");
                last_404 = Some(url);
                continue;
            }
            let body = http::read_json(response).await?;
            let content = http::extract_chat_text(&body)
                .ok_or_else(|| PlannerError::malformed("VLM response has no message content", repair::excerpt(&body.to_string())))?;
            return repair::parse_plan(&content);
        }

        Err(PlannerError::Fatal(format!(
            "no chat endpoint found for model '{}' (last tried {})",
            self.model,
            last_404.unwrap_or_default()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use image::RgbaImage;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    use crate::executor::Verb;

    /// Loopback HTTP server answering canned JSON per path; any other path
    /// gets 404. Returns the base URL and the paths requested so far.
    async fn stub_server(routes: Vec<(&'static str, u16, Value)>) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let routes: HashMap<&str, (u16, String)> =
            routes.into_iter().map(|(path, code, body)| (path, (code, body.to_string()))).collect();
        let hits = Arc::new(Mutex::new(Vec::new()));
        let seen = hits.clone();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let path = read_request_path(&mut socket).await;
                seen.lock().unwrap().push(path.clone());
                let (code, body) = routes.get(path.as_str()).cloned().unwrap_or((404, "{}".into()));
                let response = format!(
                    "HTTP/1.1 {code} Stub\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        (format!("http://{addr}"), hits)
    }

    /// Reads one request (headers and body) and returns its path.
    async fn read_request_path(socket: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 8192];
        let header_end = loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                break buf.len();
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };
        let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
        let length = head
            .lines()
            .filter_map(|line| line.split_once(':'))
            .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        while buf.len() < header_end + length {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        head.split_whitespace().nth(1).unwrap_or_default().to_string()
    }

    fn planner_for(base_url: String) -> VlmPlanner {
        VlmPlanner {
            base_url,
            model: "qwen3-vl".into(),
            api_key: None,
            client: http::client(Duration::from_secs(5)).unwrap(),
        }
    }

    async fn propose(planner: &VlmPlanner) -> Result<ActionPlan, PlannerError> {
        planner
            .propose(&Observation::from_image(RgbaImage::new(32, 32)), &AgentState::new(2))
            .await
    }

    #[tokio::test]
    async fn missing_openai_route_falls_back_to_ollama() {
        let reply = json!({
            "model": "qwen3-vl",
            "message": {
                "role": "assistant",
                "content": r#"{"action":"CLICK","target":{"x":0.25,"y":0.75},"confidence":0.9}"#
            },
            "done": true
        });
        let (url, hits) = stub_server(vec![("/api/chat", 200, reply)]).await;

        let plan = propose(&planner_for(url)).await.unwrap();
        assert_eq!(plan.verb, Verb::Click);
        assert_eq!(*hits.lock().unwrap(), vec!["/v1/chat/completions", "/api/chat"]);
    }

    #[tokio::test]
    async fn openai_answer_is_used_without_fallback() {
        let reply = json!({
            "choices": [{ "message": { "role": "assistant", "content": r#"{"action":"WAIT","seconds":2,"confidence":0.8}"# } }]
        });
        let (url, hits) = stub_server(vec![("/v1/chat/completions", 200, reply)]).await;

        let plan = propose(&planner_for(url)).await.unwrap();
        assert_eq!(plan.verb, Verb::Wait);
        assert_eq!(*hits.lock().unwrap(), vec!["/v1/chat/completions"]);
    }

    #[tokio::test]
    async fn no_chat_endpoint_at_all_is_fatal() {
        let (url, hits) = stub_server(Vec::new()).await;
        let err = propose(&planner_for(url)).await.unwrap_err();
        assert!(matches!(err, PlannerError::Fatal(ref msg) if msg.contains("/api/chat")), "{err:?}");
        assert_eq!(hits.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn overloaded_server_is_transient_and_not_a_fallback() {
        let (url, hits) =
            stub_server(vec![("/v1/chat/completions", 503, json!({ "error": "model is loading" }))]).await;
        let err = propose(&planner_for(url)).await.unwrap_err();
        assert!(matches!(err, PlannerError::Transient(_)), "{err:?}");
        assert_eq!(*hits.lock().unwrap(), vec!["/v1/chat/completions"]);
    }

    fn urls(base: &str) -> Vec<String> {
        chat_urls(base).into_iter().map(|(_, u)| u).collect()
    }

    #[test]
    fn bare_host_tries_openai_then_ollama() {
        let got = chat_urls("http://127.0.0.1:11434/");
        assert_eq!(got[0], (Convention::OpenAi, "http://127.0.0.1:11434/v1/chat/completions".into()));
        assert_eq!(got[1], (Convention::Ollama, "http://127.0.0.1:11434/api/chat".into()));
    }

    #[test]
    fn explicit_openai_paths_are_honored() {
        assert_eq!(
            urls("http://h:1/v1"),
            vec!["http://h:1/v1/chat/completions", "http://h:1/api/chat"]
        );
        assert_eq!(
            urls("http://h:1/v1/chat/completions"),
            vec!["http://h:1/v1/chat/completions", "http://h:1/api/chat"]
        );
        assert_eq!(
            urls("http://h:1/chat/completions"),
            vec!["http://h:1/chat/completions", "http://h:1/api/chat"]
        );
    }

    #[test]
    fn explicit_ollama_paths_are_honored() {
        assert_eq!(urls("http://h:1/api/chat"), vec!["http://h:1/api/chat"]);
        assert_eq!(
            urls("http://h:1/api"),
            vec!["http://h:1/api/v1/chat/completions", "http://h:1/api/chat"]
        );
    }

    #[test]
    fn bodies_follow_each_convention() {
        let planner = VlmPlanner {
            base_url: "http://h:1".into(),
            model: "qwen3-vl".into(),
            api_key: None,
            client: reqwest::Client::new(),
        };
        let openai = planner.request_body(Convention::OpenAi, "plan", "AAAA");
        assert_eq!(
            openai.pointer("/messages/0/content/1/image_url/url").unwrap(),
            "data:image/png;base64,AAAA"
        );
        let ollama = planner.request_body(Convention::Ollama, "plan", "AAAA");
        assert_eq!(ollama.pointer("/messages/0/images/0").unwrap(), "AAAA");
        assert_eq!(ollama["stream"], false);
    }
}

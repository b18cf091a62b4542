use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{DeskError, DeskResult};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub planner: PlannerConfig,
    #[serde(default)]
    pub platform: PlatformConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Where `state.json`, `actions.log` and `snapshots/` live.
    /// Falls back to the platform data directory when unset.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default = "default_pacing_secs")]
    pub pacing_secs: f64,
    /// Cadence used while reflecting (voluntary idling) or outside active hours.
    #[serde(default = "default_reflection_pacing_secs")]
    pub reflection_pacing_secs: f64,
    #[serde(default = "default_reflection_after")]
    pub reflection_after_idle_iterations: u32,
    #[serde(default = "default_emotion_dims")]
    pub emotion_dims: usize,
    /// Non-WAIT plans below this confidence are not dispatched.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    /// Write the PNG of each planned observation next to its snapshot.
    #[serde(default)]
    pub save_screenshots: bool,
    /// Consecutive failed iterations (planner retries exhausted or execution
    /// failed) before the run moves to ERROR. 0 disables the limit.
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
}

fn default_pacing_secs() -> f64 {
    5.0
}

fn default_reflection_pacing_secs() -> f64 {
    20.0
}

fn default_reflection_after() -> u32 {
    3
}

fn default_emotion_dims() -> usize {
    10
}

fn default_min_confidence() -> f64 {
    0.55
}

fn default_max_consecutive_failures() -> u32 {
    5
}

/// Longest accepted pacing interval (one day).
pub const MAX_PACING_SECS: f64 = 86_400.0;

fn pacing_duration(secs: f64) -> Duration {
    let secs = if secs.is_nan() { 0.0 } else { secs.clamp(0.0, MAX_PACING_SECS) };
    Duration::from_secs_f64(secs)
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            pacing_secs: default_pacing_secs(),
            reflection_pacing_secs: default_reflection_pacing_secs(),
            reflection_after_idle_iterations: default_reflection_after(),
            emotion_dims: default_emotion_dims(),
            min_confidence: default_min_confidence(),
            save_screenshots: false,
            max_consecutive_failures: default_max_consecutive_failures(),
        }
    }
}

impl AgentConfig {
    pub fn pacing(&self) -> Duration {
        pacing_duration(self.pacing_secs)
    }

    pub fn reflection_pacing(&self) -> Duration {
        pacing_duration(self.reflection_pacing_secs)
    }

    /// `data_dir` if configured, else `<data dir>/DeskPilot`, else `./data`.
    pub fn resolved_data_dir(&self) -> PathBuf {
        if let Some(dir) = &self.data_dir {
            return dir.clone();
        }
        dirs::data_local_dir()
            .map(|d| d.join("DeskPilot"))
            .unwrap_or_else(|| PathBuf::from("data"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Fingerprint distance strictly below this reuses the previous plan.
    #[serde(default = "default_reuse_threshold")]
    pub reuse_threshold: f64,
    /// How many times a cached plan may be replayed before the planner is asked again.
    #[serde(default = "default_max_reuses")]
    pub max_reuses: u32,
}

fn default_reuse_threshold() -> f64 {
    0.05
}

fn default_max_reuses() -> u32 {
    2
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            reuse_threshold: default_reuse_threshold(),
            max_reuses: default_max_reuses(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlannerBackend {
    /// Hosted multimodal model (Gemini REST API).
    #[default]
    Remote,
    /// Locally hosted OpenAI-compatible or Ollama endpoint.
    Vlm,
    /// Vision description service followed by a text-reasoning model.
    Hybrid,
}

impl std::str::FromStr for PlannerBackend {
    type Err = DeskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "remote" | "gemini" => Ok(Self::Remote),
            "vlm" | "local" => Ok(Self::Vlm),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(DeskError::Config(format!("unknown planner backend '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    #[serde(default)]
    pub backend: PlannerBackend,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Per-request HTTP timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub remote: RemoteEntry,
    #[serde(default)]
    pub vlm: VlmEntry,
    #[serde(default)]
    pub hybrid: HybridEntry,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_timeout_secs() -> u64 {
    120
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            backend: PlannerBackend::default(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            timeout_secs: default_timeout_secs(),
            remote: RemoteEntry::default(),
            vlm: VlmEntry::default(),
            hybrid: HybridEntry::default(),
        }
    }
}

impl PlannerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteEntry {
    #[serde(default = "default_remote_base")]
    pub api_base: String,
    #[serde(default = "default_remote_model")]
    pub model: String,
    /// Falls back to env var DESKPILOT_REMOTE_API_KEY, then GEMINI_API_KEY.
    #[serde(default)]
    pub api_key: Option<String>,
}

fn default_remote_base() -> String {
    "https://generativelanguage.googleapis.com/v1beta".into()
}

fn default_remote_model() -> String {
    "gemini-2.5-flash".into()
}

impl Default for RemoteEntry {
    fn default() -> Self {
        Self {
            api_base: default_remote_base(),
            model: default_remote_model(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VlmEntry {
    #[serde(default = "default_vlm_base")]
    pub base_url: String,
    #[serde(default = "default_vlm_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

fn default_vlm_base() -> String {
    "http://127.0.0.1:11434".into()
}

fn default_vlm_model() -> String {
    "qwen3-vl".into()
}

impl Default for VlmEntry {
    fn default() -> Self {
        Self {
            base_url: default_vlm_base(),
            model: default_vlm_model(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HybridEntry {
    #[serde(default = "default_vision_base")]
    pub vision_base_url: String,
    #[serde(default)]
    pub vision_model: Option<String>,
    #[serde(default = "default_text_base")]
    pub text_base_url: String,
    #[serde(default = "default_text_model")]
    pub text_model: String,
    #[serde(default)]
    pub text_api_key: Option<String>,
}

fn default_vision_base() -> String {
    "http://127.0.0.1:8000/v1".into()
}

fn default_text_base() -> String {
    "http://127.0.0.1:11434/v1".into()
}

fn default_text_model() -> String {
    "deepseek-r1:14b".into()
}

impl Default for HybridEntry {
    fn default() -> Self {
        Self {
            vision_base_url: default_vision_base(),
            vision_model: None,
            text_base_url: default_text_base(),
            text_model: default_text_model(),
            text_api_key: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    /// Real screen capture and input injection (requires the `desktop` feature).
    Desktop,
    /// Headless adapter: blank frames, no physical effects.
    #[default]
    Null,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    #[serde(default)]
    pub adapter: AdapterKind,
    #[serde(default = "default_null_width")]
    pub null_width: u32,
    #[serde(default = "default_null_height")]
    pub null_height: u32,
}

fn default_null_width() -> u32 {
    1280
}

fn default_null_height() -> u32 {
    720
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            adapter: AdapterKind::default(),
            null_width: default_null_width(),
            null_height: default_null_height(),
        }
    }
}

/// Reads `DESKPILOT_<NAME>_API_KEY`, then `fallback_env`, then the config value.
pub fn resolve_api_key(name: &str, fallback_env: Option<&str>, configured: &Option<String>) -> Option<String> {
    let primary = format!("DESKPILOT_{}_API_KEY", name.to_uppercase());
    std::env::var(&primary)
        .ok()
        .or_else(|| fallback_env.and_then(|k| std::env::var(k).ok()))
        .or_else(|| configured.clone())
        .filter(|k| !k.trim().is_empty())
}

fn resolve_config_path() -> DeskResult<PathBuf> {
    if let Ok(explicit) = std::env::var("DESKPILOT_CONFIG") {
        let candidate = PathBuf::from(explicit);
        if candidate.exists() {
            tracing::debug!(path = %candidate.display(), "config taken from DESKPILOT_CONFIG");
            return Ok(candidate);
        }
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(parent) = exe.parent() {
            let candidate = parent.join("config.toml");
            if candidate.exists() {
                tracing::debug!(path = %candidate.display(), "config found next to executable");
                return Ok(candidate);
            }
        }
    }

    let cwd = std::env::current_dir()?;
    let candidate = cwd.join("config.toml");
    if candidate.exists() {
        tracing::debug!(path = %candidate.display(), "config found in working directory");
        return Ok(candidate);
    }

    Err(DeskError::Config(
        "config.toml not found next to executable or in working directory".into(),
    ))
}

/// Applies environment overrides that take precedence over the file.
pub(crate) fn apply_env_overrides(config: &mut AppConfig) {
    if let Ok(backend) = std::env::var("PLANNER_BACKEND") {
        match backend.parse() {
            Ok(b) => config.planner.backend = b,
            Err(e) => tracing::warn!(error = %e, "ignoring PLANNER_BACKEND"),
        }
    }
}

impl AppConfig {
    /// Rejects values TOML accepts but the agent cannot run with
    /// (`inf`, `nan`, negative intervals, ratios outside [0, 1]).
    pub fn validate(&self) -> DeskResult<()> {
        let in_range = |name: &str, v: f64, max: f64| {
            if v.is_finite() && (0.0..=max).contains(&v) {
                Ok(())
            } else {
                Err(DeskError::Config(format!("{name} = {v} is outside [0, {max}]")))
            }
        };
        in_range("agent.pacing_secs", self.agent.pacing_secs, MAX_PACING_SECS)?;
        in_range("agent.reflection_pacing_secs", self.agent.reflection_pacing_secs, MAX_PACING_SECS)?;
        in_range("agent.min_confidence", self.agent.min_confidence, 1.0)?;
        in_range("cache.reuse_threshold", self.cache.reuse_threshold, 1.0)?;
        Ok(())
    }
}

pub fn parse_config(content: &str) -> DeskResult<AppConfig> {
    let config: AppConfig = toml::from_str(content)?;
    config.validate()?;
    Ok(config)
}

pub fn load_config() -> DeskResult<AppConfig> {
    let path = resolve_config_path()?;
    let content = std::fs::read_to_string(&path)?;
    let mut config = parse_config(&content)?;
    apply_env_overrides(&mut config);
    tracing::info!(path = %path.display(), backend = ?config.planner.backend, "config loaded");
    Ok(config)
}

use chrono::{DateTime, Local, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{DeskError, DeskResult};
use crate::executor::ExecutionResult;

/// Starting value of every emotion dimension.
const EMOTION_BASELINE: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentMode {
    #[default]
    Goal,
    FreeRoam,
}

impl std::str::FromStr for AgentMode {
    type Err = DeskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace(['-', ' '], "_").as_str() {
            "GOAL" => Ok(Self::Goal),
            "FREE_ROAM" | "FREEROAM" | "ROAM" => Ok(Self::FreeRoam),
            other => Err(DeskError::Config(format!("unknown mode '{other}'"))),
        }
    }
}

/// Lifecycle of a run.
///
/// ```text
/// IDLE ──start──▶ RUNNING ──pause──▶ PAUSED ──resume──▶ RUNNING
///                 RUNNING ──failure─▶ ERROR ──restart──▶ RUNNING
///       RUNNING | PAUSED | ERROR ──stop──▶ IDLE
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    #[default]
    Idle,
    Running,
    Paused,
    Error,
}

impl AgentStatus {
    pub fn can_transition_to(self, to: AgentStatus) -> bool {
        use AgentStatus::*;
        matches!(
            (self, to),
            (Idle, Running)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Error)
                | (Error, Running)
                | (Running, Idle)
                | (Paused, Idle)
                | (Error, Idle)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Idle => "IDLE",
            AgentStatus::Running => "RUNNING",
            AgentStatus::Paused => "PAUSED",
            AgentStatus::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed-length vector of values clamped to [0, 1].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EmotionVector(Vec<f64>);

impl EmotionVector {
    pub fn new(dims: usize) -> Self {
        Self(vec![EMOTION_BASELINE; dims])
    }

    pub fn values(&self) -> &[f64] {
        &self.0
    }

    pub fn dims(&self) -> usize {
        self.0.len()
    }

    /// Truncates or pads with the baseline so the vector has exactly `dims`
    /// entries, and re-clamps every value.
    pub fn fit(&mut self, dims: usize) {
        self.0.resize(dims, EMOTION_BASELINE);
        for v in &mut self.0 {
            *v = if v.is_finite() { v.clamp(0.0, 1.0) } else { EMOTION_BASELINE };
        }
    }

    pub fn stimulate(&mut self, delta: f64) {
        for v in &mut self.0 {
            *v = (*v + delta).clamp(0.0, 1.0);
        }
    }

    pub fn decay(&mut self, factor: f64) {
        for v in &mut self.0 {
            *v = (*v * (1.0 - factor)).clamp(0.0, 1.0);
        }
    }
}

/// Local-time window during which the agent acts; outside it, it reflects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveHours {
    pub start: NaiveTime,
    pub stop: NaiveTime,
}

impl ActiveHours {
    /// Parses `HH:MM` bounds.
    pub fn parse(start: &str, stop: &str) -> DeskResult<Self> {
        let parse = |s: &str| {
            NaiveTime::parse_from_str(s.trim(), "%H:%M")
                .map_err(|e| DeskError::Config(format!("invalid time '{s}': {e}")))
        };
        Ok(Self {
            start: parse(start)?,
            stop: parse(stop)?,
        })
    }

    /// Inclusive on both ends; a window with `stop < start` wraps midnight.
    pub fn contains(&self, t: NaiveTime) -> bool {
        if self.start <= self.stop {
            self.start <= t && t <= self.stop
        } else {
            t >= self.start || t <= self.stop
        }
    }

    pub fn contains_now(&self) -> bool {
        self.contains(Local::now().time())
    }
}

/// The agent's single mutable record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub mode: AgentMode,
    pub status: AgentStatus,
    pub goal: Option<String>,
    pub current_task: Option<String>,
    pub active_window_hint: Option<String>,
    pub inner_monologue: String,
    pub emotion_vector: EmotionVector,
    pub last_updated: DateTime<Utc>,
    pub step_count: u64,
    /// Voluntary low-frequency idling; not an error.
    #[serde(default)]
    pub reflecting: bool,
    #[serde(default)]
    pub last_action: Option<String>,
    #[serde(default)]
    pub last_action_time: Option<DateTime<Utc>>,
    /// Outcome of the last dispatched action, fed back into the next prompt.
    #[serde(default)]
    pub last_result: Option<ExecutionResult>,
    #[serde(default)]
    pub active_hours: Option<ActiveHours>,
    pub session_start: DateTime<Utc>,
}

impl AgentState {
    pub fn new(emotion_dims: usize) -> Self {
        let now = Utc::now();
        Self {
            mode: AgentMode::Goal,
            status: AgentStatus::Idle,
            goal: None,
            current_task: None,
            active_window_hint: None,
            inner_monologue: String::new(),
            emotion_vector: EmotionVector::new(emotion_dims),
            last_updated: now,
            step_count: 0,
            reflecting: false,
            last_action: None,
            last_action_time: None,
            last_result: None,
            active_hours: None,
            session_start: now,
        }
    }

    /// Moves `status` along the state machine, rejecting illegal edges.
    pub fn transition(&mut self, to: AgentStatus) -> DeskResult<()> {
        if !self.status.can_transition_to(to) {
            return Err(DeskError::InvalidTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        tracing::info!(from = %self.status, to = %to, "agent status transition");
        self.status = to;
        if to != AgentStatus::Running {
            self.reflecting = false;
        }
        self.touch();
        Ok(())
    }

    /// Records one executed step and nudges the emotion vector by its outcome.
    pub fn record_step(&mut self, summary: String, result: Option<ExecutionResult>) {
        self.step_count += 1;
        match &result {
            Some(r) if r.is_success() => self.emotion_vector.stimulate(0.02),
            Some(_) => self.emotion_vector.decay(0.05),
            None => {}
        }
        self.last_action = Some(summary);
        self.last_action_time = Some(Utc::now());
        self.last_result = result;
        self.touch();
    }

    pub fn set_monologue(&mut self, text: impl Into<String>) {
        self.inner_monologue = text.into();
        self.touch();
    }

    /// Reflection tick: quiet decay, new monologue, no step.
    pub fn reflect(&mut self, text: impl Into<String>) {
        self.emotion_vector.decay(0.03);
        self.set_monologue(text);
    }

    pub fn touch(&mut self) {
        self.last_updated = Utc::now();
    }

    pub fn seconds_since_last_action(&self) -> Option<f64> {
        self.last_action_time
            .map(|t| (Utc::now() - t).num_milliseconds().max(0) as f64 / 1000.0)
    }

    pub fn has_goal(&self) -> bool {
        self.goal.as_deref().is_some_and(|g| !g.trim().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use AgentStatus::*;

    #[test]
    fn defined_transitions_only() {
        let all = [Idle, Running, Paused, Error];
        let allowed = [
            (Idle, Running),
            (Running, Paused),
            (Paused, Running),
            (Running, Error),
            (Error, Running),
            (Running, Idle),
            (Paused, Idle),
            (Error, Idle),
        ];
        for from in all {
            for to in all {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn illegal_transition_leaves_status_untouched() {
        let mut s = AgentState::new(4);
        let err = s.transition(Paused).unwrap_err();
        assert!(matches!(err, DeskError::InvalidTransition { .. }));
        assert_eq!(s.status, Idle);
    }

    #[test]
    fn leaving_running_clears_reflection() {
        let mut s = AgentState::new(4);
        s.transition(Running).unwrap();
        s.reflecting = true;
        s.transition(Paused).unwrap();
        assert!(!s.reflecting);
    }

    #[test]
    fn emotions_stay_bounded_with_fixed_dims() {
        let mut e = EmotionVector::new(10);
        for _ in 0..100 {
            e.stimulate(0.05);
        }
        assert!(e.values().iter().all(|v| *v == 1.0));
        for _ in 0..500 {
            e.decay(0.5);
        }
        assert!(e.values().iter().all(|v| (0.0..=1.0).contains(v)));
        assert_eq!(e.dims(), 10);
    }

    #[test]
    fn fit_resizes_and_clamps() {
        let mut e = EmotionVector(vec![1.7, -0.2, f64::NAN]);
        e.fit(5);
        assert_eq!(e.values(), &[1.0, 0.0, 0.2, 0.2, 0.2]);
        e.fit(2);
        assert_eq!(e.dims(), 2);
    }

    #[test]
    fn step_outcome_moves_emotions() {
        let mut s = AgentState::new(3);
        s.record_step("CLICK".into(), Some(ExecutionResult::success("ok")));
        assert_eq!(s.step_count, 1);
        assert!(s.emotion_vector.values().iter().all(|v| (*v - 0.22).abs() < 1e-9));
        s.record_step("CLICK".into(), Some(ExecutionResult::failure("nope")));
        assert_eq!(s.step_count, 2);
        assert!(s.emotion_vector.values().iter().all(|v| *v < 0.22));
        assert_eq!(s.last_action.as_deref(), Some("CLICK"));
        assert!(s.seconds_since_last_action().is_some());
    }

    #[test]
    fn active_hours_wrap_midnight() {
        let day = ActiveHours::parse("09:00", "17:30").unwrap();
        assert!(day.contains(NaiveTime::from_hms_opt(9, 0, 0).unwrap()));
        assert!(!day.contains(NaiveTime::from_hms_opt(18, 0, 0).unwrap()));
        let night = ActiveHours::parse("22:00", "02:00").unwrap();
        assert!(night.contains(NaiveTime::from_hms_opt(23, 15, 0).unwrap()));
        assert!(night.contains(NaiveTime::from_hms_opt(1, 0, 0).unwrap()));
        assert!(!night.contains(NaiveTime::from_hms_opt(12, 0, 0).unwrap()));
        assert!(ActiveHours::parse("25:00", "02:00").is_err());
    }

    #[test]
    fn modes_parse_loosely() {
        assert_eq!("free-roam".parse::<AgentMode>().unwrap(), AgentMode::FreeRoam);
        assert_eq!("goal".parse::<AgentMode>().unwrap(), AgentMode::Goal);
    }
}

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{DeskError, DeskResult};
use crate::platform::MouseButton;

/// Longest WAIT a plan may request.
pub const MAX_WAIT_SECS: f64 = 30.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verb {
    Move,
    Click,
    Drag,
    Scroll,
    Type,
    Keypress,
    Wait,
    FocusWindow,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Move => "MOVE",
            Verb::Click => "CLICK",
            Verb::Drag => "DRAG",
            Verb::Scroll => "SCROLL",
            Verb::Type => "TYPE",
            Verb::Keypress => "KEYPRESS",
            Verb::Wait => "WAIT",
            Verb::FocusWindow => "FOCUS_WINDOW",
        }
    }

    pub fn needs_target(&self) -> bool {
        matches!(self, Verb::Move | Verb::Click | Verb::Drag)
    }
}

impl std::fmt::Display for Verb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Verb {
    type Err = DeskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let norm = s.trim().to_ascii_uppercase().replace(['-', ' '], "_");
        match norm.as_str() {
            "MOVE" => Ok(Verb::Move),
            "CLICK" => Ok(Verb::Click),
            "DRAG" => Ok(Verb::Drag),
            "SCROLL" => Ok(Verb::Scroll),
            "TYPE" => Ok(Verb::Type),
            "KEYPRESS" | "KEY_PRESS" | "HOTKEY" => Ok(Verb::Keypress),
            "WAIT" => Ok(Verb::Wait),
            "FOCUS_WINDOW" => Ok(Verb::FocusWindow),
            other => Err(DeskError::Grammar(format!("unsupported verb '{other}'"))),
        }
    }
}

/// A point in the unit square, relative to the observed screen.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormPoint {
    pub x: f64,
    pub y: f64,
}

impl NormPoint {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn is_valid(&self) -> bool {
        unit(self.x) && unit(self.y)
    }
}

fn unit(v: f64) -> bool {
    v.is_finite() && (0.0..=1.0).contains(&v)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    #[default]
    None,
    Button { button: MouseButton },
    Text { text: String },
    /// Normalized `+`-joined chord, e.g. `ctrl+l`.
    Keys { chord: String },
    Wait { seconds: f64 },
    Window { hint: String },
    /// SCROLL: wheel notches. DRAG: offset of the end point in normalized units.
    Delta { dx: f64, dy: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanSignal {
    GoalComplete,
    Unrecoverable,
}

/// A single validated directive proposed by a planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionPlan {
    pub verb: Verb,
    pub target: Option<NormPoint>,
    #[serde(default)]
    pub payload: Payload,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<PlanSignal>,
    /// Sub-task the planner reports working on; becomes `current_task`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    /// Later steps of a batch, dispatched one per iteration in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub follow_up: Vec<ActionPlan>,
}

impl ActionPlan {
    pub fn new(verb: Verb, target: Option<NormPoint>, payload: Payload, confidence: f64) -> Self {
        Self {
            verb,
            target,
            payload,
            confidence,
            rationale: None,
            signal: None,
            task: None,
            follow_up: Vec::new(),
        }
    }

    pub fn click(x: f64, y: f64, confidence: f64) -> Self {
        Self::new(Verb::Click, Some(NormPoint::new(x, y)), Payload::None, confidence)
    }

    pub fn wait(seconds: f64, confidence: f64) -> Self {
        Self::new(Verb::Wait, None, Payload::Wait { seconds }, confidence)
    }

    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = Some(rationale.into());
        self
    }

    pub fn with_signal(mut self, signal: PlanSignal) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        self.task = Some(task.into());
        self
    }

    /// Appends `step` to the batch started by this plan.
    pub fn then(mut self, step: ActionPlan) -> Self {
        self.follow_up.push(step);
        self
    }

    /// Number of steps in the batch, this one included.
    pub fn step_count(&self) -> usize {
        1 + self.follow_up.len()
    }

    /// Detaches the remaining batch steps from the first one.
    pub fn split_first(mut self) -> (ActionPlan, Vec<ActionPlan>) {
        let rest = std::mem::take(&mut self.follow_up);
        (self, rest)
    }

    /// Checks every grammar invariant. Plans that fail never reach an adapter.
    pub fn validate(&self) -> DeskResult<()> {
        if !unit(self.confidence) {
            return Err(grammar(format!("confidence {} outside [0,1]", self.confidence)));
        }
        if let Some(t) = &self.target {
            if !t.is_valid() {
                return Err(grammar(format!("target ({}, {}) outside the unit square", t.x, t.y)));
            }
        }
        if self.verb.needs_target() && self.target.is_none() {
            return Err(grammar(format!("{} requires a target", self.verb)));
        }

        match (self.verb, &self.payload) {
            (Verb::Move, Payload::None) => Ok(()),
            (Verb::Click, Payload::None | Payload::Button { .. }) => Ok(()),
            (Verb::Drag, Payload::Delta { dx, dy }) => {
                let start = self.target.unwrap_or(NormPoint::new(0.0, 0.0));
                let end = NormPoint::new(start.x + dx, start.y + dy);
                if end.is_valid() {
                    Ok(())
                } else {
                    Err(grammar("DRAG end point leaves the unit square".into()))
                }
            }
            (Verb::Scroll, Payload::Delta { dx, dy }) if dx.is_finite() && dy.is_finite() => Ok(()),
            (Verb::Type, Payload::Text { text }) if !text.is_empty() => Ok(()),
            (Verb::Keypress, Payload::Keys { chord }) if !chord.is_empty() => Ok(()),
            (Verb::Wait, Payload::Wait { seconds }) if seconds.is_finite() && (0.0..=MAX_WAIT_SECS).contains(seconds) => Ok(()),
            // Without an explicit window the orchestrator substitutes the active-window hint.
            (Verb::FocusWindow, Payload::None) => Ok(()),
            (Verb::FocusWindow, Payload::Window { hint }) if !hint.trim().is_empty() => Ok(()),
            (verb, payload) => Err(grammar(format!("{verb} cannot carry payload {payload:?}"))),
        }
    }

    pub fn wait_duration(&self) -> Option<Duration> {
        match (self.verb, &self.payload) {
            (Verb::Wait, Payload::Wait { seconds }) => Some(Duration::from_secs_f64(seconds.clamp(0.0, MAX_WAIT_SECS))),
            _ => None,
        }
    }

    /// One-line human summary, e.g. `CLICK @ (0.10,0.10) (0.90)`.
    pub fn summary(&self) -> String {
        let target = self
            .target
            .map(|t| format!(" @ ({:.2},{:.2})", t.x, t.y))
            .unwrap_or_default();
        let detail = match &self.payload {
            Payload::Keys { chord } => format!("({chord})"),
            Payload::Wait { seconds } => format!("({seconds:.1}s)"),
            Payload::Window { hint } => format!("({hint})"),
            Payload::Delta { dx, dy } => format!("(dx={dx},dy={dy})"),
            Payload::Button { button } if *button != MouseButton::Left => format!("({button:?})"),
            _ => String::new(),
        };
        format!("{}{}{} ({:.2})", self.verb, detail, target, self.confidence)
    }
}

fn grammar(msg: String) -> DeskError {
    DeskError::Grammar(msg)
}

// ── Normalization of raw planner JSON ──────────────────────────────────────

/// Turns a decoded planner response into a validated plan.
///
/// Accepts either a single action object or an `{"actions": [...]}` batch.
/// A batch becomes the first step with the rest as `follow_up`, in order; one
/// invalid step rejects the whole batch.
pub fn plan_from_value(value: &Value) -> DeskResult<ActionPlan> {
    let Some(actions) = value.get("actions") else {
        return action_from_value(value);
    };
    let entries = actions
        .as_array()
        .ok_or_else(|| grammar("`actions` is not an array".into()))?;
    let mut steps = entries
        .iter()
        .enumerate()
        .map(|(i, entry)| action_from_value(entry).map_err(|e| grammar(format!("step {}: {e}", i + 1))))
        .collect::<DeskResult<Vec<_>>>()?
        .into_iter();
    let mut first = steps.next().ok_or_else(|| grammar("`actions` is empty".into()))?;
    if first.task.is_none() {
        first.task = text_field(&value["task"]);
    }
    first.follow_up = steps.collect();
    Ok(first)
}

fn text_field(v: &Value) -> Option<String> {
    v.as_str().map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}

fn action_from_value(v: &Value) -> DeskResult<ActionPlan> {
    if !v.is_object() {
        return Err(grammar("action is not a JSON object".into()));
    }
    let verb: Verb = v["action"]
        .as_str()
        .or_else(|| v["verb"].as_str())
        .ok_or_else(|| grammar("missing `action`".into()))?
        .parse()?;
    let confidence = number(&v["confidence"]).ok_or_else(|| grammar("missing `confidence`".into()))?;
    let target = target_from_value(&v["target"])?;

    let payload = match verb {
        Verb::Move => Payload::None,
        Verb::Click => match v["button"].as_str() {
            Some(b) => Payload::Button { button: b.parse()? },
            None => Payload::None,
        },
        Verb::Type => {
            let text = v["text"]
                .as_str()
                .or_else(|| v["payload"].as_str())
                .ok_or_else(|| grammar("TYPE requires `text`".into()))?;
            Payload::Text { text: text.to_string() }
        }
        Verb::Keypress => {
            let raw = if !v["keys"].is_null() { &v["keys"] } else { &v["key"] };
            Payload::Keys { chord: normalize_chord(raw)? }
        }
        Verb::Wait => {
            let seconds = number(&v["wait_seconds"])
                .or_else(|| number(&v["seconds"]))
                .or_else(|| number(&v["duration"]))
                .ok_or_else(|| grammar("WAIT requires `wait_seconds`".into()))?;
            Payload::Wait { seconds }
        }
        Verb::FocusWindow => match v["window"].as_str().or_else(|| v["text"].as_str()) {
            Some(hint) => Payload::Window { hint: hint.to_string() },
            None => Payload::None,
        },
        Verb::Scroll | Verb::Drag => {
            let raw = if !v["scroll"].is_null() { &v["scroll"] } else { &v["delta"] };
            if !raw.is_object() {
                return Err(grammar(format!("{verb} requires a `delta` object")));
            }
            Payload::Delta {
                dx: number(&raw["dx"]).unwrap_or(0.0),
                dy: number(&raw["dy"]).unwrap_or(0.0),
            }
        }
    };

    let signal = match v["signal"].as_str().map(|s| s.trim().to_ascii_lowercase()) {
        None => None,
        Some(s) if s == "goal_complete" || s == "done" => Some(PlanSignal::GoalComplete),
        Some(s) if s == "unrecoverable" || s == "give_up" => Some(PlanSignal::Unrecoverable),
        Some(s) if s.is_empty() || s == "none" || s == "continue" => None,
        Some(other) => return Err(grammar(format!("unknown signal '{other}'"))),
    };

    let plan = ActionPlan {
        verb,
        target,
        payload,
        confidence,
        rationale: text_field(&v["rationale"]),
        signal,
        task: text_field(&v["task"]),
        follow_up: Vec::new(),
    };
    plan.validate()?;
    Ok(plan)
}

fn number(v: &Value) -> Option<f64> {
    v.as_f64().or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
}

fn target_from_value(v: &Value) -> DeskResult<Option<NormPoint>> {
    if v.is_null() {
        return Ok(None);
    }
    let (x, y) = if let Some(arr) = v.as_array() {
        (arr.first().and_then(number), arr.get(1).and_then(number))
    } else {
        (number(&v["x"]), number(&v["y"]))
    };
    match (x, y) {
        (Some(x), Some(y)) => Ok(Some(NormPoint::new(x, y))),
        _ => Err(grammar("target needs numeric `x` and `y`".into())),
    }
}

/// Normalizes `"Ctrl+L"`, `["control", "l"]` and friends to `ctrl+l`.
pub fn normalize_chord(raw: &Value) -> DeskResult<String> {
    let parts: Vec<String> = match raw {
        Value::String(s) => s.split('+').map(str::to_string).collect(),
        Value::Array(items) => items
            .iter()
            .filter_map(|i| i.as_str())
            .flat_map(|s| s.split('+').map(str::to_string).collect::<Vec<_>>())
            .collect(),
        _ => return Err(grammar("KEYPRESS requires `keys`".into())),
    };
    let normalized: Vec<String> = parts
        .iter()
        .map(|p| p.trim().to_lowercase())
        .filter(|p| !p.is_empty())
        .map(|p| canonical_key(&p).to_string())
        .collect();
    if normalized.is_empty() {
        return Err(grammar("KEYPRESS requires at least one key".into()));
    }
    Ok(normalized.join("+"))
}

fn canonical_key(name: &str) -> &str {
    match name {
        "control" | "ctl" => "ctrl",
        "cmd" | "command" | "win" | "windows" | "super" | "meta" => "meta",
        "option" | "opt" => "alt",
        "return" => "enter",
        "escape" => "esc",
        "del" => "delete",
        "pgup" | "page_up" => "pageup",
        "pgdn" | "page_down" => "pagedown",
        "arrowup" | "up_arrow" => "up",
        "arrowdown" | "down_arrow" => "down",
        "arrowleft" | "left_arrow" => "left",
        "arrowright" | "right_arrow" => "right",
        other => other,
    }
}

// Plan → adapter primitive dispatch.
use std::panic::{catch_unwind, AssertUnwindSafe};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{DeskError, DeskResult};
use crate::executor::action::{ActionPlan, NormPoint, Payload, Verb};
use crate::executor::coordinator::normalized_to_physical;
use crate::platform::{MouseButton, PlatformAdapter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionResult {
    pub fn success(detail: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Success,
            detail: detail.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn failure(detail: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Failure,
            detail: detail.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }
}

/// Executes one plan against the adapter.
///
/// Never fails and never unwinds: adapter errors and adapter panics both come
/// back as a `Failure` result.
pub fn execute(plan: &ActionPlan, adapter: &mut dyn PlatformAdapter) -> ExecutionResult {
    if let Err(e) = plan.validate() {
        tracing::warn!(error = %e, "refusing to dispatch invalid plan");
        return ExecutionResult::failure(e.to_string());
    }

    let outcome = catch_unwind(AssertUnwindSafe(|| dispatch(plan, adapter)));
    let result = match outcome {
        Ok(Ok(detail)) => ExecutionResult::success(detail),
        Ok(Err(e)) => ExecutionResult::failure(format!("{} failed: {e}", plan.verb)),
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".into());
            ExecutionResult::failure(format!("{} aborted: adapter panicked: {msg}", plan.verb))
        }
    };

    tracing::info!(
        verb = %plan.verb,
        adapter = adapter.name(),
        success = result.is_success(),
        detail = %result.detail,
        "action dispatched"
    );
    result
}

fn dispatch(plan: &ActionPlan, adapter: &mut dyn PlatformAdapter) -> DeskResult<String> {
    match (plan.verb, &plan.payload) {
        (Verb::Move, _) => {
            let (x, y) = resolve(adapter, required_target(plan)?)?;
            adapter.move_to(x, y)?;
            Ok(format!("moved to ({x},{y})"))
        }
        (Verb::Click, payload) => {
            let button = match payload {
                Payload::Button { button } => *button,
                _ => MouseButton::Left,
            };
            let (x, y) = resolve(adapter, required_target(plan)?)?;
            adapter.click(x, y, button)?;
            Ok(format!("clicked {button:?} at ({x},{y})"))
        }
        (Verb::Drag, Payload::Delta { dx, dy }) => {
            let start = required_target(plan)?;
            let end = NormPoint::new(start.x + dx, start.y + dy);
            let resolution = adapter.screen_resolution()?;
            let (x0, y0) = normalized_to_physical(start, resolution);
            let (x1, y1) = normalized_to_physical(end, resolution);
            adapter.drag(x0, y0, x1, y1)?;
            Ok(format!("dragged ({x0},{y0}) -> ({x1},{y1})"))
        }
        (Verb::Scroll, Payload::Delta { dx, dy }) => {
            let (dx, dy) = (dx.round() as i32, dy.round() as i32);
            adapter.scroll(dx, dy)?;
            Ok(format!("scrolled dx={dx} dy={dy}"))
        }
        (Verb::Type, Payload::Text { text }) => {
            adapter.type_text(text)?;
            Ok(format!("typed {} chars", text.chars().count()))
        }
        (Verb::Keypress, Payload::Keys { chord }) => {
            adapter.key_press(chord)?;
            Ok(format!("pressed {chord}"))
        }
        // The pause itself is taken by the orchestrator so stop/pause can cut it short.
        (Verb::Wait, Payload::Wait { seconds }) => Ok(format!("wait {seconds:.1}s")),
        (Verb::FocusWindow, Payload::Window { hint }) => {
            if adapter.focus_window(hint)? {
                Ok(format!("focused '{hint}'"))
            } else {
                Ok(format!("focus '{hint}' not supported by {} adapter; no-op", adapter.name()))
            }
        }
        (Verb::FocusWindow, _) => Err(DeskError::Grammar(
            "FOCUS_WINDOW without a window and no active-window hint".into(),
        )),
        (verb, payload) => Err(DeskError::Grammar(format!("{verb} cannot carry payload {payload:?}"))),
    }
}

fn required_target(plan: &ActionPlan) -> DeskResult<NormPoint> {
    plan.target
        .ok_or_else(|| DeskError::Grammar(format!("{} requires a target", plan.verb)))
}

/// Resolution is read fresh for every dispatch so a display change between
/// capture and action is honored.
fn resolve(adapter: &dyn PlatformAdapter, point: NormPoint) -> DeskResult<(i32, i32)> {
    let resolution = adapter.screen_resolution()?;
    Ok(normalized_to_physical(point, resolution))
}

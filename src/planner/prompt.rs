use crate::agent_engine::state::{AgentMode, AgentState};
use crate::perception::types::ScreenshotMeta;
use crate::planner::vision::SceneDescription;

const INSTRUCTIONS: &str = "\
You are an autonomous desktop agent. You control the mouse and keyboard.
Respond ONLY with a single JSON object. No markdown. No code fences.
Either one action object, or {\"actions\": [...]} for a short sequence that is
carried out in order, one step per observation.

Action grammar:
- action: one of MOVE, CLICK, DRAG, SCROLL, TYPE, KEYPRESS, WAIT, FOCUS_WINDOW
- target: {\"x\": 0..1, \"y\": 0..1} normalized to the screenshot; required for MOVE, CLICK, DRAG
- button: left | right | middle (CLICK, optional)
- text: string (TYPE)
- keys: chord such as \"ctrl+l\" or [\"alt\", \"tab\"] (KEYPRESS)
- delta: {\"dx\", \"dy\"}: wheel notches for SCROLL, normalized offset of the end point for DRAG
- wait_seconds: 0..30 (WAIT)
- window: title fragment (FOCUS_WINDOW)
- confidence: 0..1 (always)
- rationale: one short sentence describing your reasoning (always)
- task: the sub-task you are working on, e.g. \"open the settings app\" (optional)
- signal: \"goal_complete\" once the goal is achieved, \"unrecoverable\" if it cannot be achieved (optional)

Rules:
- Click near the center of the intended element, never near its edges.
- If you cannot target the right element with confidence of at least 0.55, return WAIT and say what you need to see.
- Prefer keyboard shortcuts (ctrl+l, ctrl+f, alt+tab, enter, esc) when they are likely to work.
- Check the outcome of the last action before changing course.";

fn or_none(v: Option<&str>) -> &str {
    v.filter(|s| !s.trim().is_empty()).unwrap_or("<none>")
}

/// Renders the planning prompt for one iteration.
///
/// `scene` is present only for the two-stage planner, which sends text
/// instead of the screenshot itself.
pub fn render(state: &AgentState, meta: Option<&ScreenshotMeta>, scene: Option<&SceneDescription>) -> String {
    let mut out = String::with_capacity(2048);
    out.push_str(INSTRUCTIONS);
    out.push_str("\n\n");

    if let Some(scene) = scene {
        out.push_str("Scene understanding (from the vision model):\n");
        out.push_str(&format!("Caption: {}\n", or_none(Some(&scene.caption))));
        if scene.text_regions.is_empty() {
            out.push_str("Visible text: <none>\n");
        } else {
            out.push_str("Visible text:\n");
            for region in &scene.text_regions {
                out.push_str(&format!("- {region}\n"));
            }
        }
        out.push('\n');
    }

    let mode = match state.mode {
        AgentMode::Goal => "GOAL",
        AgentMode::FreeRoam => "FREE_ROAM",
    };
    let emotions: Vec<String> = state.emotion_vector.values().iter().map(|v| format!("{v:.2}")).collect();
    let hours = state
        .active_hours
        .map(|h| format!("{} -> {}", h.start.format("%H:%M"), h.stop.format("%H:%M")))
        .unwrap_or_else(|| "<unset>".into());
    let since = state
        .seconds_since_last_action()
        .map(|s| format!("{s:.1}"))
        .unwrap_or_else(|| "<never>".into());

    out.push_str(&format!("Agent mode: {mode}\n"));
    out.push_str(&format!("Agent status: {}\n", state.status));
    out.push_str(&format!("Current goal: {}\n", or_none(state.goal.as_deref())));
    out.push_str(&format!("Current task: {}\n", or_none(state.current_task.as_deref())));
    out.push_str(&format!("Active window: {}\n", or_none(state.active_window_hint.as_deref())));
    out.push_str(&format!("Active hours: {hours}\n"));
    out.push_str(&format!("Steps taken: {}\n", state.step_count));
    out.push_str(&format!("Last action: {}\n", or_none(state.last_action.as_deref())));
    match &state.last_result {
        Some(r) => out.push_str(&format!("Last result: {:?}: {}\n", r.status, r.detail)),
        None => out.push_str("Last result: <none>\n"),
    }
    out.push_str(&format!("Time since last action (s): {since}\n"));
    out.push_str(&format!("Inner monologue: {}\n", or_none(Some(&state.inner_monologue))));
    out.push_str(&format!("Emotion vector: [{}]\n", emotions.join(", ")));
    if state.reflecting {
        out.push_str("You are reflecting: nothing will be executed. Use the rationale to summarize what you observe.\n");
    }
    match meta {
        Some(m) => out.push_str(&format!(
            "Screenshot: {}x{} physical pixels @ scale {:.2}\n",
            m.physical_width, m.physical_height, m.scale_factor
        )),
        None => out.push_str("Screenshot: <none>\n"),
    }
    out
}

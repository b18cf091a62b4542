//! Scriptable adapter used by unit tests.

use std::collections::VecDeque;

use image::{Rgba, RgbaImage};

use crate::errors::{DeskError, DeskResult};
use crate::perception::types::Observation;
use crate::platform::{MouseButton, PlatformAdapter};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Move(i32, i32),
    Click(i32, i32, MouseButton),
    Drag(i32, i32, i32, i32),
    Scroll(i32, i32),
    Type(String),
    Key(String),
    Focus(String),
}

pub struct RecordingAdapter {
    pub size: (u32, u32),
    pub calls: Vec<Call>,
    /// Luma of successive frames; the last one repeats once drained.
    pub frames: VecDeque<u8>,
    /// Captures that fail before the display comes back.
    pub failing_captures: u32,
    pub fail_input: bool,
    pub panic_input: bool,
    pub supports_focus: bool,
    last_frame: u8,
}

impl RecordingAdapter {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            size: (width, height),
            calls: Vec::new(),
            frames: VecDeque::new(),
            failing_captures: 0,
            fail_input: false,
            panic_input: false,
            supports_focus: false,
            last_frame: 24,
        }
    }

    pub fn with_frames(mut self, frames: &[u8]) -> Self {
        self.frames = frames.iter().copied().collect();
        self
    }

    fn record(&mut self, call: Call) -> DeskResult<()> {
        if self.panic_input {
            panic!("input backend exploded");
        }
        if self.fail_input {
            return Err(DeskError::Adapter("input rejected".into()));
        }
        self.calls.push(call);
        Ok(())
    }
}

impl PlatformAdapter for RecordingAdapter {
    fn name(&self) -> &str {
        "recording"
    }

    fn capture_screen(&mut self) -> DeskResult<Observation> {
        if self.failing_captures > 0 {
            self.failing_captures -= 1;
            return Err(DeskError::Capture("display unavailable".into()));
        }
        if let Some(v) = self.frames.pop_front() {
            self.last_frame = v;
        }
        let v = self.last_frame;
        let image = RgbaImage::from_pixel(self.size.0 / 10, self.size.1 / 10, Rgba([v, v, v, 255]));
        Ok(Observation::from_image(image))
    }

    fn screen_resolution(&self) -> DeskResult<(u32, u32)> {
        Ok(self.size)
    }

    fn move_to(&mut self, x: i32, y: i32) -> DeskResult<()> {
        self.record(Call::Move(x, y))
    }

    fn click(&mut self, x: i32, y: i32, button: MouseButton) -> DeskResult<()> {
        self.record(Call::Click(x, y, button))
    }

    fn drag(&mut self, x0: i32, y0: i32, x1: i32, y1: i32) -> DeskResult<()> {
        self.record(Call::Drag(x0, y0, x1, y1))
    }

    fn scroll(&mut self, dx: i32, dy: i32) -> DeskResult<()> {
        self.record(Call::Scroll(dx, dy))
    }

    fn type_text(&mut self, text: &str) -> DeskResult<()> {
        self.record(Call::Type(text.to_string()))
    }

    fn key_press(&mut self, chord: &str) -> DeskResult<()> {
        self.record(Call::Key(chord.to_string()))
    }

    fn focus_window(&mut self, hint: &str) -> DeskResult<bool> {
        self.record(Call::Focus(hint.to_string()))?;
        Ok(self.supports_focus)
    }
}

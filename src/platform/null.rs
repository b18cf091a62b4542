use image::{Rgba, RgbaImage};

use crate::errors::DeskResult;
use crate::perception::types::Observation;
use crate::platform::{MouseButton, PlatformAdapter};

/// Headless adapter: every call succeeds with no physical effect and every
/// capture is the same dark frame.
pub struct NullAdapter {
    width: u32,
    height: u32,
}

impl NullAdapter {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl Default for NullAdapter {
    fn default() -> Self {
        Self::new(1280, 720)
    }
}

impl PlatformAdapter for NullAdapter {
    fn name(&self) -> &str {
        "null"
    }

    fn capture_screen(&mut self) -> DeskResult<Observation> {
        let image = RgbaImage::from_pixel(self.width, self.height, Rgba([24, 24, 24, 255]));
        Ok(Observation::from_image(image))
    }

    fn screen_resolution(&self) -> DeskResult<(u32, u32)> {
        Ok((self.width, self.height))
    }

    fn move_to(&mut self, _x: i32, _y: i32) -> DeskResult<()> {
        Ok(())
    }

    fn click(&mut self, _x: i32, _y: i32, _button: MouseButton) -> DeskResult<()> {
        Ok(())
    }

    fn drag(&mut self, _x0: i32, _y0: i32, _x1: i32, _y1: i32) -> DeskResult<()> {
        Ok(())
    }

    fn scroll(&mut self, _dx: i32, _dy: i32) -> DeskResult<()> {
        Ok(())
    }

    fn type_text(&mut self, _text: &str) -> DeskResult<()> {
        Ok(())
    }

    fn key_press(&mut self, _chord: &str) -> DeskResult<()> {
        Ok(())
    }

    fn focus_window(&mut self, _hint: &str) -> DeskResult<bool> {
        Ok(false)
    }
}

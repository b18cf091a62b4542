use crate::errors::DeskResult;
use crate::perception::screenshot::capture_primary;
use crate::perception::types::Observation;
use crate::platform::{input, MouseButton, PlatformAdapter};

/// Real desktop: xcap for capture, enigo for input.
#[derive(Default)]
pub struct DesktopAdapter;

impl DesktopAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl PlatformAdapter for DesktopAdapter {
    fn name(&self) -> &str {
        "desktop"
    }

    fn capture_screen(&mut self) -> DeskResult<Observation> {
        let (image, meta) = capture_primary()?;
        Ok(Observation::new(image, meta))
    }

    fn screen_resolution(&self) -> DeskResult<(u32, u32)> {
        input::display_size()
    }

    fn move_to(&mut self, x: i32, y: i32) -> DeskResult<()> {
        input::mouse_move(x, y)
    }

    fn click(&mut self, x: i32, y: i32, button: MouseButton) -> DeskResult<()> {
        input::mouse_click(x, y, button)
    }

    fn drag(&mut self, x0: i32, y0: i32, x1: i32, y1: i32) -> DeskResult<()> {
        input::mouse_drag(x0, y0, x1, y1)
    }

    fn scroll(&mut self, dx: i32, dy: i32) -> DeskResult<()> {
        input::scroll(dx, dy)
    }

    fn type_text(&mut self, text: &str) -> DeskResult<()> {
        input::type_text(text)
    }

    fn key_press(&mut self, chord: &str) -> DeskResult<()> {
        input::press_chord(chord)
    }

    fn focus_window(&mut self, hint: &str) -> DeskResult<bool> {
        focus_native(hint)
    }
}

#[cfg(windows)]
fn focus_native(hint: &str) -> DeskResult<bool> {
    use windows::core::PCWSTR;
    use windows::Win32::UI::WindowsAndMessaging::{FindWindowW, SetForegroundWindow};

    let title: Vec<u16> = hint.encode_utf16().chain(std::iter::once(0)).collect();
    // SAFETY: `title` is NUL-terminated and outlives both calls.
    let hwnd = unsafe { FindWindowW(PCWSTR::null(), PCWSTR(title.as_ptr())) };
    match hwnd {
        Ok(hwnd) if !hwnd.is_invalid() => {
            let focused = unsafe { SetForegroundWindow(hwnd) }.as_bool();
            tracing::debug!(hint, focused, "focus_window");
            Ok(focused)
        }
        _ => {
            tracing::debug!(hint, "focus_window: no window with that title");
            Ok(false)
        }
    }
}

#[cfg(not(windows))]
fn focus_native(hint: &str) -> DeskResult<bool> {
    tracing::debug!(hint, "focus_window not supported on this platform");
    Ok(false)
}

// Physical input simulation through enigo.
use enigo::{Axis, Button, Coordinate, Direction, Enigo, Key, Keyboard, Mouse, Settings};

use crate::errors::{DeskError, DeskResult};
use crate::platform::MouseButton;

fn connect() -> DeskResult<Enigo> {
    Enigo::new(&Settings::default())
        .map_err(|e| DeskError::Adapter(format!("input backend unavailable: {e}")))
}

fn input_err(e: enigo::InputError) -> DeskError {
    DeskError::Adapter(e.to_string())
}

fn to_button(button: MouseButton) -> Button {
    match button {
        MouseButton::Left => Button::Left,
        MouseButton::Right => Button::Right,
        MouseButton::Middle => Button::Middle,
    }
}

pub fn display_size() -> DeskResult<(u32, u32)> {
    let (w, h) = connect()?.main_display().map_err(input_err)?;
    Ok((w.max(0) as u32, h.max(0) as u32))
}

pub fn mouse_move(x: i32, y: i32) -> DeskResult<()> {
    connect()?.move_mouse(x, y, Coordinate::Abs).map_err(input_err)
}

pub fn mouse_click(x: i32, y: i32, button: MouseButton) -> DeskResult<()> {
    let mut enigo = connect()?;
    enigo.move_mouse(x, y, Coordinate::Abs).map_err(input_err)?;
    enigo.button(to_button(button), Direction::Click).map_err(input_err)
}

pub fn mouse_drag(x0: i32, y0: i32, x1: i32, y1: i32) -> DeskResult<()> {
    let mut enigo = connect()?;
    enigo.move_mouse(x0, y0, Coordinate::Abs).map_err(input_err)?;
    enigo.button(Button::Left, Direction::Press).map_err(input_err)?;
    let moved = enigo.move_mouse(x1, y1, Coordinate::Abs).map_err(input_err);
    // Always release, even if the move failed, so the button is not left held.
    let released = enigo.button(Button::Left, Direction::Release).map_err(input_err);
    moved.and(released)
}

pub fn scroll(dx: i32, dy: i32) -> DeskResult<()> {
    let mut enigo = connect()?;
    if dy != 0 {
        enigo.scroll(dy, Axis::Vertical).map_err(input_err)?;
    }
    if dx != 0 {
        enigo.scroll(dx, Axis::Horizontal).map_err(input_err)?;
    }
    Ok(())
}

pub fn type_text(text: &str) -> DeskResult<()> {
    connect()?.text(text).map_err(input_err)
}

/// Presses a normalized chord (`ctrl+shift+t`): modifiers down, last key
/// clicked, modifiers released in reverse order.
pub fn press_chord(chord: &str) -> DeskResult<()> {
    let keys = chord
        .split('+')
        .map(|name| {
            key_for(name).ok_or_else(|| DeskError::Adapter(format!("unsupported key '{name}'")))
        })
        .collect::<DeskResult<Vec<Key>>>()?;
    let Some((last, modifiers)) = keys.split_last() else {
        return Err(DeskError::Adapter("empty key chord".into()));
    };

    let mut enigo = connect()?;
    for m in modifiers {
        enigo.key(*m, Direction::Press).map_err(input_err)?;
    }
    let clicked = enigo.key(*last, Direction::Click).map_err(input_err);
    for m in modifiers.iter().rev() {
        let _ = enigo.key(*m, Direction::Release);
    }
    clicked
}

fn key_for(name: &str) -> Option<Key> {
    let key = match name {
        "ctrl" => Key::Control,
        "alt" => Key::Alt,
        "shift" => Key::Shift,
        "meta" => Key::Meta,
        "enter" => Key::Return,
        "esc" => Key::Escape,
        "tab" => Key::Tab,
        "space" => Key::Space,
        "backspace" => Key::Backspace,
        "delete" => Key::Delete,
        "home" => Key::Home,
        "end" => Key::End,
        "pageup" => Key::PageUp,
        "pagedown" => Key::PageDown,
        "up" => Key::UpArrow,
        "down" => Key::DownArrow,
        "left" => Key::LeftArrow,
        "right" => Key::RightArrow,
        "f1" => Key::F1,
        "f2" => Key::F2,
        "f3" => Key::F3,
        "f4" => Key::F4,
        "f5" => Key::F5,
        "f6" => Key::F6,
        "f7" => Key::F7,
        "f8" => Key::F8,
        "f9" => Key::F9,
        "f10" => Key::F10,
        "f11" => Key::F11,
        "f12" => Key::F12,
        other => {
            let mut chars = other.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => Key::Unicode(c),
                _ => return None,
            }
        }
    };
    Some(key)
}

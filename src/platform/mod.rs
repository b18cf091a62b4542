//! Screen capture and input injection seam.
//!
//! The orchestrator only ever talks to a [`PlatformAdapter`]; which one is
//! behind it is decided once at startup by [`build_adapter`].

#[cfg(feature = "desktop")]
pub mod desktop;
#[cfg(feature = "desktop")]
pub mod input;
pub mod null;
#[cfg(test)]
pub(crate) mod recording;

use serde::{Deserialize, Serialize};

use crate::config::{AdapterKind, PlatformConfig};
use crate::errors::{DeskError, DeskResult};
use crate::perception::types::Observation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MouseButton {
    #[default]
    Left,
    Right,
    Middle,
}

impl std::str::FromStr for MouseButton {
    type Err = DeskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "left" | "" => Ok(Self::Left),
            "right" => Ok(Self::Right),
            "middle" => Ok(Self::Middle),
            other => Err(DeskError::Grammar(format!("unknown mouse button '{other}'"))),
        }
    }
}

/// Capability set the agent needs from the host desktop.
///
/// All coordinates are physical pixels in the space reported by
/// [`screen_resolution`](PlatformAdapter::screen_resolution). Calls are
/// blocking and must only be issued from one thread at a time.
pub trait PlatformAdapter: Send {
    fn name(&self) -> &str;

    fn capture_screen(&mut self) -> DeskResult<Observation>;

    fn screen_resolution(&self) -> DeskResult<(u32, u32)>;

    fn move_to(&mut self, x: i32, y: i32) -> DeskResult<()>;

    fn click(&mut self, x: i32, y: i32, button: MouseButton) -> DeskResult<()>;

    /// Press at the start point, move to the end point, release.
    fn drag(&mut self, x0: i32, y0: i32, x1: i32, y1: i32) -> DeskResult<()>;

    /// Wheel notches; positive `dy` scrolls down, positive `dx` scrolls right.
    fn scroll(&mut self, dx: i32, dy: i32) -> DeskResult<()>;

    fn type_text(&mut self, text: &str) -> DeskResult<()>;

    /// A `+`-joined chord such as `ctrl+shift+t` or a single key name.
    fn key_press(&mut self, chord: &str) -> DeskResult<()>;

    /// Returns `Ok(false)` when the adapter cannot address window focus.
    fn focus_window(&mut self, hint: &str) -> DeskResult<bool>;
}

pub fn build_adapter(cfg: &PlatformConfig) -> DeskResult<Box<dyn PlatformAdapter>> {
    match cfg.adapter {
        AdapterKind::Null => {
            tracing::info!(width = cfg.null_width, height = cfg.null_height, "using null platform adapter");
            Ok(Box::new(null::NullAdapter::new(cfg.null_width, cfg.null_height)))
        }
        #[cfg(feature = "desktop")]
        AdapterKind::Desktop => {
            tracing::info!("using desktop platform adapter");
            Ok(Box::new(desktop::DesktopAdapter::new()))
        }
        #[cfg(not(feature = "desktop"))]
        AdapterKind::Desktop => Err(DeskError::Config(
            "desktop adapter requested but deskpilot was built without the `desktop` feature".into(),
        )),
    }
}

use image::RgbaImage;

use crate::errors::{DeskError, DeskResult};
use crate::perception::types::ScreenshotMeta;

/// Captures the primary monitor (or the first one if none is flagged primary).
pub fn capture_primary() -> DeskResult<(RgbaImage, ScreenshotMeta)> {
    let monitors = xcap::Monitor::all().map_err(|e| DeskError::Capture(e.to_string()))?;

    let (index, monitor) = monitors
        .iter()
        .enumerate()
        .find(|(_, m)| m.is_primary())
        .or_else(|| monitors.iter().enumerate().next())
        .ok_or_else(|| DeskError::Capture("no monitors available".into()))?;

    let image = monitor
        .capture_image()
        .map_err(|e| DeskError::Capture(e.to_string()))?;

    let meta = ScreenshotMeta {
        monitor_index: index as u32,
        scale_factor: monitor.scale_factor() as f64,
        physical_width: image.width(),
        physical_height: image.height(),
        logical_width: monitor.width(),
        logical_height: monitor.height(),
    };

    tracing::debug!(
        monitor = index,
        phys = %format!("{}×{}", meta.physical_width, meta.physical_height),
        scale = meta.scale_factor,
        "screen captured"
    );

    Ok((image, meta))
}

// Normalized → physical coordinate mapping.
use crate::executor::action::NormPoint;

/// Maps a unit-square point onto a `width`×`height` pixel grid.
///
/// The result is clamped to the last addressable pixel, so `1.0` lands on
/// `width - 1` rather than one past the edge.
pub fn normalized_to_physical(point: NormPoint, (width, height): (u32, u32)) -> (i32, i32) {
    (scale(point.x, width), scale(point.y, height))
}

fn scale(v: f64, extent: u32) -> i32 {
    if extent == 0 {
        return 0;
    }
    let max = (extent - 1) as f64;
    (v * extent as f64).round().clamp(0.0, max) as i32
}

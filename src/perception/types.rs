use std::path::PathBuf;

use base64::Engine as _;
use chrono::{DateTime, Utc};
use image::RgbaImage;
use serde::{Deserialize, Serialize};

use crate::errors::DeskResult;
use crate::perception::fingerprint::Fingerprint;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreenshotMeta {
    pub monitor_index: u32,
    pub scale_factor: f64,
    pub physical_width: u32,
    pub physical_height: u32,
    pub logical_width: u32,
    pub logical_height: u32,
}

impl ScreenshotMeta {
    /// Meta for a single unscaled display of the given size.
    pub fn unscaled(width: u32, height: u32) -> Self {
        Self {
            monitor_index: 0,
            scale_factor: 1.0,
            physical_width: width,
            physical_height: height,
            logical_width: width,
            logical_height: height,
        }
    }
}

/// One captured frame plus its similarity fingerprint.
///
/// Owned by a single loop iteration; only its [`ObservationRef`] outlives it,
/// inside a snapshot.
#[derive(Debug, Clone)]
pub struct Observation {
    pub id: uuid::Uuid,
    pub image: RgbaImage,
    pub meta: ScreenshotMeta,
    pub fingerprint: Fingerprint,
    pub captured_at: DateTime<Utc>,
}

impl Observation {
    pub fn new(image: RgbaImage, meta: ScreenshotMeta) -> Self {
        let fingerprint = Fingerprint::of_image(&image);
        Self {
            id: uuid::Uuid::new_v4(),
            image,
            meta,
            fingerprint,
            captured_at: Utc::now(),
        }
    }

    /// Convenience for frames whose size is also the display size.
    pub fn from_image(image: RgbaImage) -> Self {
        let meta = ScreenshotMeta::unscaled(image.width(), image.height());
        Self::new(image, meta)
    }

    pub fn to_png(&self) -> DeskResult<Vec<u8>> {
        let mut buf = std::io::Cursor::new(Vec::new());
        self.image.write_to(&mut buf, image::ImageFormat::Png)?;
        Ok(buf.into_inner())
    }

    pub fn to_base64_png(&self) -> DeskResult<String> {
        Ok(base64::engine::general_purpose::STANDARD.encode(self.to_png()?))
    }

    pub fn reference(&self, image_path: Option<PathBuf>) -> ObservationRef {
        ObservationRef {
            id: self.id,
            captured_at: self.captured_at,
            width: self.meta.physical_width,
            height: self.meta.physical_height,
            fingerprint: self.fingerprint.to_hex(),
            image_path,
        }
    }
}

/// What a snapshot keeps of an observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationRef {
    pub id: uuid::Uuid,
    pub captured_at: DateTime<Utc>,
    pub width: u32,
    pub height: u32,
    pub fingerprint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_path: Option<PathBuf>,
}

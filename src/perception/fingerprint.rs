use image::RgbaImage;

/// Side length of the downsampled grid.
pub const GRID: u32 = 16;

/// Per-cell luma difference that counts as "changed".
const CELL_TOLERANCE: u8 = 10;

/// Cheap similarity digest of a frame: a GRID×GRID grayscale thumbnail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    cells: Vec<u8>,
}

impl Fingerprint {
    pub fn of_image(image: &RgbaImage) -> Self {
        if image.width() == 0 || image.height() == 0 {
            return Self { cells: Vec::new() };
        }
        let thumb = image::imageops::thumbnail(image, GRID, GRID);
        let cells = thumb
            .pixels()
            .map(|p| {
                let [r, g, b, _] = p.0;
                ((299 * r as u32 + 587 * g as u32 + 114 * b as u32) / 1000) as u8
            })
            .collect();
        Self { cells }
    }

    pub fn from_cells(cells: Vec<u8>) -> Self {
        Self { cells }
    }

    pub fn cells(&self) -> &[u8] {
        &self.cells
    }

    /// Fraction of cells whose luma moved by more than the tolerance, in [0, 1].
    ///
    /// Fingerprints of different shape, or empty ones, are maximally distant.
    pub fn distance(&self, other: &Fingerprint) -> f64 {
        if self.cells.is_empty() || self.cells.len() != other.cells.len() {
            return 1.0;
        }
        let changed = self
            .cells
            .iter()
            .zip(&other.cells)
            .filter(|(a, b)| a.abs_diff(**b) > CELL_TOLERANCE)
            .count();
        changed as f64 / self.cells.len() as f64
    }

    pub fn to_hex(&self) -> String {
        self.cells.iter().map(|c| format!("{c:02x}")).collect()
    }
}

//! Spot-shape diagnostics: JSON dump and PNG rendering.

use std::path::Path;

use image::{GrayImage, Luma};
use serde::{Deserialize, Serialize};

use crate::shape::SpotShape;

/// Flat, self-describing dump of a calibrated spot shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpotShapeDump {
    /// `[y, x, z]` extent.
    pub shape: [usize; 3],
    /// Mean spot in y/x/z linear order.
    pub mean_spot: Vec<f32>,
    /// Template in y/x/z linear order.
    pub template: Vec<u8>,
    pub tile: usize,
    pub n_isolated: usize,
    pub n_positive: usize,
    pub genes_used: Vec<usize>,
    pub warnings: Vec<String>,
}

impl SpotShapeDump {
    pub fn from_shape(shape: &SpotShape) -> Self {
        Self {
            shape: shape.mean_spot.shape(),
            mean_spot: shape.mean_spot.as_slice().to_vec(),
            template: shape.template.as_slice().to_vec(),
            tile: shape.tile,
            n_isolated: shape.n_isolated,
            n_positive: shape.n_positive(),
            genes_used: shape.genes_used.clone(),
            warnings: shape.warnings.iter().map(|w| w.to_string()).collect(),
        }
    }

    pub fn write_json(&self, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Render the spot shape as an 8-bit image.
///
/// Z-planes are laid out left to right with a one-pixel gap. The top row of
/// planes shows the mean spot scaled to 0..255; the bottom row shows the
/// template.
pub fn render_spot_shape(shape: &SpotShape) -> GrayImage {
    let [ny, nx, nz] = shape.mean_spot.shape();
    let width = (nz * (nx + 1)).saturating_sub(1).max(1) as u32;
    let height = (2 * ny + 1) as u32;
    let mut img = GrayImage::new(width, height);

    let values = shape.mean_spot.as_slice();
    let lo = values.iter().copied().fold(f32::INFINITY, f32::min);
    let hi = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let range = hi - lo;
    let scale = |v: f32| {
        if range > 0.0 {
            (((v - lo) / range) * 255.0).round().clamp(0.0, 255.0) as u8
        } else {
            0
        }
    };

    for z in 0..nz {
        let x0 = z * (nx + 1);
        for y in 0..ny {
            for x in 0..nx {
                let px = (x0 + x) as u32;
                img.put_pixel(px, y as u32, Luma([scale(shape.mean_spot.get([y, x, z]))]));
                let t = if shape.template.get([y, x, z]) != 0 { 255 } else { 0 };
                img.put_pixel(px, (ny + 1 + y) as u32, Luma([t]));
            }
        }
    }
    img
}

/// Write [`render_spot_shape`] to a PNG file.
pub fn write_spot_shape_png(
    shape: &SpotShape,
    path: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    render_spot_shape(shape).save(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::CalibrationWarning;
    use crate::volume::Volume3;

    fn plus_shape() -> SpotShape {
        let mean_spot = Volume3::from_fn([3, 3, 2], |[y, x, z]| {
            if y == 1 && x == 1 {
                1.0 - 0.5 * z as f32
            } else {
                0.0
            }
        });
        let template = mean_spot.map(|v| u8::from(v >= 0.1));
        SpotShape {
            mean_spot,
            template,
            tile: 2,
            genes_used: vec![0],
            n_isolated: 4,
            warnings: vec![CalibrationWarning::FewTemplatePositives {
                found: 2,
                minimum: 5,
            }],
        }
    }

    #[test]
    fn dump_flattens_shape() {
        let dump = SpotShapeDump::from_shape(&plus_shape());
        assert_eq!(dump.shape, [3, 3, 2]);
        assert_eq!(dump.mean_spot.len(), 18);
        assert_eq!(dump.n_positive, 2);
        assert_eq!(dump.warnings.len(), 1);
        let json = serde_json::to_string(&dump).unwrap();
        assert!(json.contains("\"tile\":2"));
    }

    #[test]
    fn render_tiles_planes_and_template() {
        let img = render_spot_shape(&plus_shape());
        assert_eq!(img.dimensions(), (7, 7));
        assert_eq!(img.get_pixel(1, 1)[0], 255);
        assert_eq!(img.get_pixel(5, 1)[0], 128);
        assert_eq!(img.get_pixel(0, 0)[0], 0);
        assert_eq!(img.get_pixel(1, 5)[0], 255);
        assert_eq!(img.get_pixel(3, 1)[0], 0);
    }
}

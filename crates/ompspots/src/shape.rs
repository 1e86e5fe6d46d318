//! Empirical spot-shape calibration.
//!
//! Isolated, strong coefficient maxima of the calibration tile are cropped
//! and averaged into a mean spot. The template marks the voxels of the mean
//! spot that are bright enough to take part in scoring.

use serde::{Deserialize, Serialize};

use crate::coefficients::CoefficientStore;
use crate::config::SpotShapeConfig;
use crate::error::{OmpError, OmpResult};
use crate::maxima::{isolated_maxima, Peak};
use crate::provider::TileGeometry;
use crate::score::score_kernel;
use crate::volume::Volume3;

/// Non-fatal calibration findings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CalibrationWarning {
    /// Fewer isolated spots than `min_isolated_spots` were averaged.
    FewIsolatedSpots { found: usize, minimum: usize },
    /// The template touches the y/x faces, so the spot may be truncated.
    TruncatedTemplate { edge_ones: usize },
    /// Fewer template voxels than `min_template_positives`.
    FewTemplatePositives { found: usize, minimum: usize },
}

impl std::fmt::Display for CalibrationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FewIsolatedSpots { found, minimum } => write!(
                f,
                "only {} isolated spots found for the mean spot (want at least {})",
                found, minimum
            ),
            Self::TruncatedTemplate { edge_ones } => write!(
                f,
                "{} template voxels lie on the y/x border, consider a larger spot_shape",
                edge_ones
            ),
            Self::FewTemplatePositives { found, minimum } => write!(
                f,
                "template has only {} positive voxels (want at least {})",
                found, minimum
            ),
        }
    }
}

/// Calibrated mean spot and scoring template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpotShape {
    pub mean_spot: Volume3<f32>,
    /// 1 where `mean_spot >= shape_sign_threshold`, else 0.
    pub template: Volume3<u8>,
    /// Tile the shape was calibrated on.
    pub tile: usize,
    /// Genes that contributed at least one isolated spot.
    pub genes_used: Vec<usize>,
    /// Number of isolated spots averaged.
    pub n_isolated: usize,
    pub warnings: Vec<CalibrationWarning>,
}

impl SpotShape {
    /// Number of template voxels set.
    pub fn n_positive(&self) -> usize {
        self.template.as_slice().iter().filter(|&&t| t != 0).count()
    }

    /// Unit-sum scoring kernel built from the mean spot and template.
    pub fn kernel(&self) -> OmpResult<Volume3<f32>> {
        score_kernel(&self.mean_spot, &self.template)
    }
}

/// Template ones lying on the y/x border faces.
pub fn count_edge_ones(template: &Volume3<u8>) -> usize {
    let [ny, nx, nz] = template.shape();
    let mut count = 0;
    for y in 0..ny {
        for x in 0..nx {
            if y != 0 && x != 0 && y + 1 != ny && x + 1 != nx {
                continue;
            }
            count += (0..nz).filter(|&z| template.get([y, x, z]) != 0).count();
        }
    }
    count
}

/// Add the `extent`-shaped patch of `volume` centred on `centre` to `acc`.
/// Voxels outside the volume count as zero.
fn accumulate_patch(acc: &mut Volume3<f32>, volume: &Volume3<f32>, centre: [usize; 3]) {
    let [ky, kx, kz] = acc.shape();
    let half = [ky / 2, kx / 2, kz / 2];
    for y in 0..ky {
        for x in 0..kx {
            for z in 0..kz {
                let p = [
                    centre[0] as isize + y as isize - half[0] as isize,
                    centre[1] as isize + x as isize - half[1] as isize,
                    centre[2] as isize + z as isize - half[2] as isize,
                ];
                if let Some(v) = volume.get_signed(p) {
                    let i = acc.index([y, x, z]);
                    acc.as_mut_slice()[i] += v;
                }
            }
        }
    }
}

/// Mean of `spot_shape` patches around `peaks`. Returns `None` for no peaks.
pub fn mean_spot_from(
    volume: &Volume3<f32>,
    peaks: &[Peak],
    spot_shape: [usize; 3],
) -> Option<Volume3<f32>> {
    if peaks.is_empty() {
        return None;
    }
    let mut acc = Volume3::zeros(spot_shape);
    for peak in peaks {
        accumulate_patch(&mut acc, volume, peak.yxz);
    }
    let n = peaks.len() as f32;
    Some(acc.map(|v| v / n))
}

/// Calibrate the spot shape from the coefficient store of `tile`.
///
/// Genes are visited in index order until `spot_shape_max_spots` isolated
/// spots are collected. Per-gene mean spots are combined weighted by their
/// isolated counts.
pub fn calibrate(
    store: &CoefficientStore,
    geometry: &TileGeometry,
    tile: usize,
    config: &SpotShapeConfig,
) -> OmpResult<SpotShape> {
    if config.spot_shape.iter().any(|&n| n == 0 || n % 2 == 0) {
        return Err(OmpError::input(format!(
            "spot_shape extents must be odd, got {:?}",
            config.spot_shape
        )));
    }
    let isolation_z = config.isolation_distance_z(geometry.pixel_size_xy, geometry.pixel_size_z);
    let mut sum = Volume3::<f32>::zeros(config.spot_shape);
    let mut n_isolated = 0usize;
    let mut genes_used = Vec::new();

    for gene in 0..store.n_genes() {
        if n_isolated >= config.spot_shape_max_spots {
            break;
        }
        let volume = store.gene_volume(gene, geometry.tile_shape)?;
        let peaks = isolated_maxima(
            &volume,
            config.shape_coefficient_threshold,
            config.shape_isolation_distance_yx,
            isolation_z,
        );
        let Some(gene_mean) = mean_spot_from(&volume, &peaks, config.spot_shape) else {
            continue;
        };
        let weight = peaks.len() as f32;
        for (s, &m) in sum.as_mut_slice().iter_mut().zip(gene_mean.as_slice()) {
            *s += weight * m;
        }
        tracing::debug!(gene, isolated = peaks.len(), "collected calibration spots");
        n_isolated += peaks.len();
        genes_used.push(gene);
    }

    if n_isolated == 0 {
        return Err(OmpError::CalibrationFailure {
            tile,
            reason: format!(
                "no isolated coefficient maxima >= {} found",
                config.shape_coefficient_threshold
            ),
        });
    }

    let mut warnings = Vec::new();
    if n_isolated < config.min_isolated_spots {
        warnings.push(CalibrationWarning::FewIsolatedSpots {
            found: n_isolated,
            minimum: config.min_isolated_spots,
        });
    }

    let mean_spot = sum.map(|v| v / n_isolated as f32);
    let template = mean_spot.map(|v| u8::from(v >= config.shape_sign_threshold));

    let edge_ones = count_edge_ones(&template);
    if edge_ones > 0 {
        warnings.push(CalibrationWarning::TruncatedTemplate { edge_ones });
    }
    let n_positive = template.as_slice().iter().filter(|&&t| t != 0).count();
    if n_positive == 0 {
        return Err(OmpError::CalibrationFailure {
            tile,
            reason: format!(
                "no mean-spot voxel reaches shape_sign_threshold {}",
                config.shape_sign_threshold
            ),
        });
    }
    if n_positive < config.min_template_positives {
        warnings.push(CalibrationWarning::FewTemplatePositives {
            found: n_positive,
            minimum: config.min_template_positives,
        });
    }

    for warning in &warnings {
        tracing::warn!(tile, "{}", warning);
    }
    tracing::info!(
        tile,
        n_isolated,
        n_positive,
        genes = genes_used.len(),
        "spot shape calibrated"
    );

    Ok(SpotShape {
        mean_spot,
        template,
        tile,
        genes_used,
        n_isolated,
        warnings,
    })
}

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{OmpError, OmpResult};

/// Pursuit policy for the per-pixel coefficient solver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoefficientConfig {
    /// Maximum number of genes assigned to one pixel.
    pub maximum_iterations: usize,
    /// A gene is only added if its normalised dot product with the residual
    /// has at least this magnitude.
    pub dot_product_threshold: f32,
    /// Added to the residual norm when normalising dot products.
    pub dot_product_norm_shift: f32,
    /// Stop once the residual intensity (median over rounds of the max over
    /// channels of `|residual|`) drops below this value.
    pub minimum_intensity: f32,
    /// Down-weighting strength of large-residual entries in the weighted fit.
    pub alpha: f32,
    /// Weight floor in `[0, 1]` of the weighted fit.
    pub beta: f32,
    /// Refit coefficients with residual-dependent weights after each addition.
    pub weight_coefficient_fit: bool,
    /// Allow genes whose dot product with the residual is negative.
    pub allow_negative_coefficients: bool,
    /// Fit one background code per channel before gene pursuit.
    pub fit_background: bool,
    /// Multiply colours by the provider's per-tile normalisation factor.
    pub colour_normalise: bool,
}

impl Default for CoefficientConfig {
    fn default() -> Self {
        Self {
            maximum_iterations: 5,
            dot_product_threshold: 0.225,
            dot_product_norm_shift: 0.0,
            minimum_intensity: 1e-3,
            alpha: 1.0,
            beta: 0.1,
            weight_coefficient_fit: true,
            allow_negative_coefficients: false,
            fit_background: true,
            colour_normalise: true,
        }
    }
}

/// Spot-shape calibration controls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpotShapeConfig {
    /// Extent `[y, x, z]` of the mean spot. Every extent must be odd.
    pub spot_shape: [usize; 3],
    /// Minimum coefficient of a local maximum used for calibration.
    pub shape_coefficient_threshold: f32,
    /// Minimum yx distance (pixels) between a calibration maximum and any other.
    pub shape_isolation_distance_yx: f32,
    /// Minimum z distance (z-planes). Derived from the pixel sizes when unset.
    pub shape_isolation_distance_z: Option<f32>,
    /// Mean-spot voxels at or above this value are set in the template.
    pub shape_sign_threshold: f32,
    /// Stop visiting genes once this many isolated spots were collected.
    pub spot_shape_max_spots: usize,
    /// Warn when fewer isolated spots were collected.
    pub min_isolated_spots: usize,
    /// Warn when the template has fewer positive voxels.
    pub min_template_positives: usize,
}

impl Default for SpotShapeConfig {
    fn default() -> Self {
        Self {
            spot_shape: [9, 9, 5],
            shape_coefficient_threshold: 0.8,
            shape_isolation_distance_yx: 10.0,
            shape_isolation_distance_z: None,
            shape_sign_threshold: 0.1,
            spot_shape_max_spots: 5_000,
            min_isolated_spots: 10,
            min_template_positives: 5,
        }
    }
}

impl SpotShapeConfig {
    /// Isolation distance in z, derived from the anisotropy when not configured.
    pub fn isolation_distance_z(&self, pixel_size_xy: f32, pixel_size_z: f32) -> f32 {
        match self.shape_isolation_distance_z {
            Some(z) => z,
            None if pixel_size_z > 0.0 => {
                (self.shape_isolation_distance_yx * pixel_size_xy / pixel_size_z).ceil()
            }
            None => 0.0,
        }
    }
}

/// Scoring and final spot detection controls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Coefficients are mapped through `c / (c + high_coef_bias)` before scoring.
    pub high_coef_bias: f32,
    /// Minimum score of a detected spot (inclusive).
    pub score_threshold: f32,
    /// Non-maximum suppression radius in y/x (pixels).
    pub radius_xy: f32,
    /// Non-maximum suppression radius in z (z-planes).
    pub radius_z: f32,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            high_coef_bias: 0.4,
            score_threshold: 0.1,
            radius_xy: 3.0,
            radius_z: 2.0,
        }
    }
}

/// Memory bounds for colour loading and coefficient computation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Pixels per coefficient computation subset.
    pub subset_pixels: usize,
    /// Optional hard cap on pixels per colour loading batch, applied on top of
    /// the available-memory estimate.
    pub max_colour_batch_pixels: Option<usize>,
    /// Optional hard cap on genes scored concurrently, applied on top of the
    /// available-memory estimate.
    pub max_genes_in_flight: Option<usize>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            subset_pixels: 50_000,
            max_colour_batch_pixels: None,
            max_genes_in_flight: None,
        }
    }
}

/// Numeric backend selection, fixed for a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Single-threaded reference backend.
    Serial,
    /// Rayon data-parallel backend (requires the `parallel` feature).
    #[default]
    Parallel,
}

/// Top-level gene-calling configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OmpConfig {
    /// Coefficient solver policy.
    pub coefficients: CoefficientConfig,
    /// Spot-shape calibration controls.
    pub spot_shape: SpotShapeConfig,
    /// Scoring and detection controls.
    pub scoring: ScoringConfig,
    /// Memory bounds.
    pub batching: BatchConfig,
    /// Numeric backend.
    pub backend: BackendKind,
    /// Keep every tile's coefficient store in the result.
    pub keep_coefficients: bool,
}

impl OmpConfig {
    /// Load a configuration from a JSON file. Missing fields take defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let data = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject parameter combinations the pipeline cannot run with.
    pub fn validate(&self) -> OmpResult<()> {
        let c = &self.coefficients;
        if !(0.0..=1.0).contains(&c.beta) {
            return Err(OmpError::input(format!("beta must lie in [0, 1], got {}", c.beta)));
        }
        if c.alpha < 0.0 || !c.alpha.is_finite() {
            return Err(OmpError::input(format!("alpha must be finite and >= 0, got {}", c.alpha)));
        }
        if c.dot_product_norm_shift < 0.0 {
            return Err(OmpError::input("dot_product_norm_shift must be >= 0"));
        }
        let s = &self.spot_shape;
        if s.spot_shape.iter().any(|&n| n == 0 || n % 2 == 0) {
            return Err(OmpError::input(format!(
                "spot_shape extents must be odd, got {:?}",
                s.spot_shape
            )));
        }
        if s.shape_isolation_distance_yx.is_nan() || s.shape_isolation_distance_yx < 0.0 {
            return Err(OmpError::input("shape_isolation_distance_yx must be >= 0"));
        }
        if let Some(z) = s.shape_isolation_distance_z {
            if z.is_nan() || z < 0.0 {
                return Err(OmpError::input(format!(
                    "shape_isolation_distance_z must be >= 0, got {}",
                    z
                )));
            }
        }
        if s.shape_sign_threshold.is_nan() {
            return Err(OmpError::input("shape_sign_threshold must be a number"));
        }
        let sc = &self.scoring;
        if sc.high_coef_bias.is_nan() || sc.high_coef_bias <= 0.0 {
            return Err(OmpError::input(format!(
                "high_coef_bias must be > 0, got {}",
                sc.high_coef_bias
            )));
        }
        if sc.score_threshold.is_nan() {
            return Err(OmpError::input("score_threshold must be a number"));
        }
        if sc.radius_xy < 0.0 || sc.radius_z < 0.0 {
            return Err(OmpError::input("detection radii must be >= 0"));
        }
        if self.batching.subset_pixels == 0 {
            return Err(OmpError::input("subset_pixels must be > 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        OmpConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: OmpConfig =
            serde_json::from_str(r#"{"scoring": {"score_threshold": 0.25}, "backend": "serial"}"#)
                .unwrap();
        assert!((cfg.scoring.score_threshold - 0.25).abs() < 1e-6);
        assert!((cfg.scoring.high_coef_bias - 0.4).abs() < 1e-6);
        assert_eq!(cfg.backend, BackendKind::Serial);
        assert_eq!(cfg.coefficients.maximum_iterations, 5);
    }

    #[test]
    fn even_spot_shape_is_rejected() {
        let mut cfg = OmpConfig::default();
        cfg.spot_shape.spot_shape = [8, 9, 5];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn non_positive_bias_is_rejected() {
        let mut cfg = OmpConfig::default();
        cfg.scoring.high_coef_bias = 0.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn nan_and_negative_thresholds_are_rejected() {
        let mut cfg = OmpConfig::default();
        cfg.spot_shape.shape_isolation_distance_z = Some(-1.0);
        assert!(matches!(cfg.validate(), Err(OmpError::InputViolation { .. })));
        cfg.spot_shape.shape_isolation_distance_z = Some(f32::NAN);
        assert!(cfg.validate().is_err());
        cfg.spot_shape.shape_isolation_distance_z = Some(0.0);
        cfg.validate().unwrap();

        let mut cfg = OmpConfig::default();
        cfg.scoring.score_threshold = f32::NAN;
        assert!(cfg.validate().is_err());

        let mut cfg = OmpConfig::default();
        cfg.spot_shape.shape_sign_threshold = f32::NAN;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn isolation_z_derives_from_pixel_sizes() {
        let cfg = SpotShapeConfig::default();
        // 10 px * 0.26 um / 0.9 um = 2.9 -> 3 planes
        assert_eq!(cfg.isolation_distance_z(0.26, 0.9), 3.0);
        let explicit = SpotShapeConfig {
            shape_isolation_distance_z: Some(1.5),
            ..SpotShapeConfig::default()
        };
        assert_eq!(explicit.isolation_distance_z(0.26, 0.9), 1.5);
    }
}

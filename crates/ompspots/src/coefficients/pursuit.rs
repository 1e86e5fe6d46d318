//! Greedy orthogonal matching pursuit for one pixel colour.
//!
//! The active set starts with the per-channel background codes. Each
//! iteration picks the inactive gene whose code best matches the residual and
//! refits every active code jointly against the original colour, so earlier
//! coefficients are corrected as genes are added.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::codebook::CodeBook;
use crate::config::CoefficientConfig;
use crate::error::{OmpError, OmpResult};

use super::lstsq;
use super::weighting::residual_weights;

/// One accepted pursuit iteration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PursuitStep {
    /// Gene added in this iteration.
    pub gene: usize,
    /// Normalised dot product that selected the gene.
    pub dot_product: f32,
    /// Gene coefficient right after the refit of this iteration.
    pub coefficient: f32,
    /// Residual L2 norm after this iteration.
    pub residual_norm: f32,
}

/// Why the pursuit of a pixel stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The colour is identically zero.
    ZeroColour,
    /// `maximum_iterations` genes were added.
    MaxIterations,
    /// Residual intensity fell below `minimum_intensity`.
    LowIntensity,
    /// Best dot product magnitude fell below `dot_product_threshold`.
    BelowThreshold,
    /// Best candidate would have a negative coefficient.
    NegativeCandidate,
    /// Best candidate is linearly dependent on the active codes.
    Degenerate,
    /// Every gene is already active.
    Exhausted,
}

/// Pursuit result of a single pixel.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelFit {
    /// Selected genes in selection order with their final coefficients.
    pub genes: Vec<(usize, f32)>,
    /// Final background coefficient per channel (zero when background is not fitted).
    pub background: Vec<f32>,
    /// L2 norm of the final residual.
    pub residual_norm: f32,
    /// Stop condition.
    pub stop: StopReason,
    /// Per-iteration trace, when requested.
    pub trace: Option<Vec<PursuitStep>>,
}

impl PixelFit {
    /// Coefficient of `gene` (zero when not selected).
    pub fn coefficient(&self, gene: usize) -> f32 {
        self.genes
            .iter()
            .find(|(g, _)| *g == gene)
            .map_or(0.0, |&(_, c)| c)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActiveCode {
    Background(usize),
    Gene(usize),
}

/// Per-pixel pursuit solver bound to one code book and policy.
#[derive(Debug)]
pub struct PursuitSolver<'a> {
    codebook: &'a CodeBook,
    config: &'a CoefficientConfig,
    gene_codes: DMatrix<f64>,
}

impl<'a> PursuitSolver<'a> {
    /// Validate the code book and prepare the solver.
    pub fn new(codebook: &'a CodeBook, config: &'a CoefficientConfig) -> OmpResult<Self> {
        codebook.validate()?;
        let n_rc = codebook.n_rounds_channels();
        let gene_codes = DMatrix::from_fn(codebook.n_genes(), n_rc, |g, i| {
            codebook.gene_code(g)[i] as f64
        });
        Ok(Self {
            codebook,
            config,
            gene_codes,
        })
    }

    pub fn codebook(&self) -> &CodeBook {
        self.codebook
    }

    /// Run the pursuit on one colour of length `n_rounds * n_channels`.
    pub fn solve(&self, colour: &[f32], record_trace: bool) -> OmpResult<PixelFit> {
        let n_rc = self.codebook.n_rounds_channels();
        let n_channels = self.codebook.n_channels();
        if colour.len() != n_rc {
            return Err(OmpError::input(format!(
                "pixel colour has length {}, expected {}",
                colour.len(),
                n_rc
            )));
        }
        if let Some(i) = colour.iter().position(|v| !v.is_finite()) {
            return Err(OmpError::input(format!(
                "pixel colour entry {} is not finite ({})",
                i, colour[i]
            )));
        }
        let cfg = self.config;
        let mut trace = record_trace.then(Vec::new);

        if colour.iter().all(|&v| v == 0.0) {
            return Ok(PixelFit {
                genes: Vec::new(),
                background: vec![0.0; n_channels],
                residual_norm: 0.0,
                stop: StopReason::ZeroColour,
                trace,
            });
        }

        let target = DVector::from_iterator(n_rc, colour.iter().map(|&v| v as f64));
        let mut active: Vec<ActiveCode> = if cfg.fit_background {
            (0..n_channels).map(ActiveCode::Background).collect()
        } else {
            Vec::new()
        };

        let mut fit = lstsq::solve(&self.design(&active), &target, None).ok_or_else(|| {
            OmpError::input("background codes are not linearly independent")
        })?;
        let mut residual = &target - &fit.fitted;
        let mut residual_norm = residual.norm();
        let mut stop = StopReason::MaxIterations;

        for _ in 0..cfg.maximum_iterations {
            if residual_intensity(&residual, n_channels) < cfg.minimum_intensity as f64 {
                stop = StopReason::LowIntensity;
                break;
            }
            let Some((gene, dot_product)) = self.best_gene(&residual, residual_norm, &active)
            else {
                stop = StopReason::Exhausted;
                break;
            };
            if dot_product.abs() < cfg.dot_product_threshold as f64 {
                stop = StopReason::BelowThreshold;
                break;
            }
            if dot_product < 0.0 && !cfg.allow_negative_coefficients {
                stop = StopReason::NegativeCandidate;
                break;
            }

            let mut candidate = active.clone();
            candidate.push(ActiveCode::Gene(gene));
            let design = self.design(&candidate);
            let Some(mut new_fit) = lstsq::solve(&design, &target, None) else {
                stop = StopReason::Degenerate;
                break;
            };
            if cfg.weight_coefficient_fit {
                let weights = residual_weights(
                    &(&target - &new_fit.fitted),
                    cfg.alpha as f64,
                    cfg.beta as f64,
                );
                if let Some(weighted) = lstsq::solve(&design, &target, Some(&weights)) {
                    // Dropped when the weighted refit explains the colour worse
                    // than the active set before this iteration did.
                    if (&target - &weighted.fitted).norm() <= residual_norm {
                        new_fit = weighted;
                    }
                }
            }

            active = candidate;
            fit = new_fit;
            residual = &target - &fit.fitted;
            residual_norm = residual.norm();
            if let Some(trace) = trace.as_mut() {
                trace.push(PursuitStep {
                    gene,
                    dot_product: dot_product as f32,
                    coefficient: fit.coefs[active.len() - 1] as f32,
                    residual_norm: residual_norm as f32,
                });
            }
        }

        let mut genes = Vec::new();
        let mut background = vec![0.0f32; n_channels];
        for (code, &coef) in active.iter().zip(fit.coefs.iter()) {
            match *code {
                ActiveCode::Background(c) => background[c] = coef as f32,
                ActiveCode::Gene(g) => genes.push((g, coef as f32)),
            }
        }

        Ok(PixelFit {
            genes,
            background,
            residual_norm: residual_norm as f32,
            stop,
            trace,
        })
    }

    /// Design matrix with one column per active code.
    fn design(&self, active: &[ActiveCode]) -> DMatrix<f64> {
        let n_rc = self.codebook.n_rounds_channels();
        DMatrix::from_fn(n_rc, active.len(), |i, j| match active[j] {
            ActiveCode::Background(c) => self.codebook.background_code(c)[i] as f64,
            ActiveCode::Gene(g) => self.gene_codes[(g, i)],
        })
    }

    /// Inactive gene with the largest normalised dot-product magnitude.
    fn best_gene(
        &self,
        residual: &DVector<f64>,
        residual_norm: f64,
        active: &[ActiveCode],
    ) -> Option<(usize, f64)> {
        let denom = residual_norm + self.config.dot_product_norm_shift as f64;
        let dots = &self.gene_codes * residual;
        let mut best: Option<(usize, f64)> = None;
        for (g, &dot) in dots.iter().enumerate() {
            if active.contains(&ActiveCode::Gene(g)) {
                continue;
            }
            let dp = if denom > 0.0 { dot / denom } else { 0.0 };
            match best {
                Some((_, b)) if dp.abs() <= b.abs() => {}
                _ => best = Some((g, dp)),
            }
        }
        best
    }
}

/// Median over rounds of the max over channels of `|residual|`.
pub(crate) fn residual_intensity(residual: &DVector<f64>, n_channels: usize) -> f64 {
    let mut round_max: Vec<f64> = residual
        .as_slice()
        .chunks(n_channels)
        .map(|round| round.iter().fold(0.0f64, |m, v| m.max(v.abs())))
        .collect();
    if round_max.is_empty() {
        return 0.0;
    }
    round_max.sort_by(f64::total_cmp);
    let n = round_max.len();
    if n % 2 == 1 {
        round_max[n / 2]
    } else {
        0.5 * (round_max[n / 2 - 1] + round_max[n / 2])
    }
}

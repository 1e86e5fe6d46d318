//! ompspots — orthogonal matching pursuit gene calling for multiplexed
//! fluorescence imaging.
//!
//! Every pixel colour (rounds × channels) is decomposed into a sparse
//! combination of per-gene bled codes plus per-channel background. The
//! pipeline stages per tile are:
//!
//! 1. **Coefficients** – greedy pursuit with joint (optionally reweighted)
//!    least-squares refits, in memory-bounded pixel subsets.
//! 2. **Spot shape** – mean spot of isolated strong maxima on the
//!    calibration tile, thresholded into a template.
//! 3. **Scoring** – saturated coefficients correlated with the spot kernel.
//! 4. **Detection** – ellipsoidal non-maximum suppression of score volumes.
//!
//! # Public API
//! - [`GeneCaller`] as the primary entry point
//! - [`OmpConfig`] for tuning
//! - [`PixelColourProvider`] for supplying colours, [`InMemoryDataset`] as a
//!   ready-made implementation
//! - result structures ([`GeneCallResult`], [`SpotTable`], [`SpotShape`])

mod api;
pub mod backend;
mod codebook;
pub mod coefficients;
mod config;
pub mod diagnostics;
mod error;
pub mod maxima;
mod pipeline;
mod provider;
pub mod score;
mod shape;
pub mod volume;

#[cfg(test)]
pub(crate) mod test_utils;

pub use api::GeneCaller;
pub use backend::{select_backend, Backend, NumericBackend, SerialBackend};
pub use codebook::{background_codes, CodeBook, UNIT_NORM_TOLERANCE};
pub use coefficients::{CoefficientStore, PixelFit, PursuitSolver, PursuitStep, StopReason};
pub use config::{
    BackendKind, BatchConfig, CoefficientConfig, OmpConfig, ScoringConfig, SpotShapeConfig,
};
pub use error::{OmpError, OmpResult};
pub use maxima::{detect_local_maxima, Peak};
pub use pipeline::{
    available_memory_gb, calibrate_spot_shape, colour_batch_pixels, compute_tile_coefficients,
    genes_in_flight, run, score_and_detect, DetectedSpot, GeneCallResult, SpotTable,
    TileCoefficients, COLOUR_MEMORY_FRACTION, SCORE_MEMORY_FRACTION,
};
pub use provider::{
    InMemoryDataset, PixelColourProvider, ProviderError, TileColours, TileGeometry,
};
pub use shape::{calibrate, count_edge_ones, mean_spot_from, CalibrationWarning, SpotShape};
pub use volume::Volume3;

#[cfg(feature = "parallel")]
pub use backend::ParallelBackend;

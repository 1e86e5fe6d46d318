//! Tile-level gene-calling pipeline.
//!
//! This module wires the stages together per tile:
//! colour loading -> coefficient solving -> (calibration tile only) spot-shape
//! calibration -> per-gene scoring and detection -> colour gathering.
//!
//! Algorithmic primitives live in `crate::coefficients`, `crate::shape`,
//! `crate::score` and `crate::maxima`. The pipeline layer owns call order,
//! memory bounds and data flow.

mod colours;
mod result;
mod run;

pub use colours::{
    available_memory_gb, colour_batch_pixels, genes_in_flight, COLOUR_MEMORY_FRACTION,
    SCORE_MEMORY_FRACTION,
};
pub use result::{DetectedSpot, GeneCallResult, SpotTable, TileCoefficients};
pub use run::{calibrate_spot_shape, compute_tile_coefficients, run, score_and_detect};

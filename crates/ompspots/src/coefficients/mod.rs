//! Per-pixel OMP coefficient computation.

mod lstsq;
mod pursuit;
pub(crate) mod store;
mod weighting;

pub use pursuit::{PixelFit, PursuitSolver, PursuitStep, StopReason};
pub use store::{CoefficientBatch, CoefficientStore};

use crate::error::{OmpError, OmpResult};

/// Solve a contiguous block of pixel colours serially.
///
/// `colours` holds `n_pixels * n_rounds_channels` values, one colour per
/// pixel. This is the element kernel shared by every numeric backend.
pub fn solve_block(
    solver: &PursuitSolver<'_>,
    colours: &[f32],
    record_trace: bool,
) -> OmpResult<Vec<PixelFit>> {
    let n_rc = solver.codebook().n_rounds_channels();
    if colours.len() % n_rc != 0 {
        return Err(OmpError::input(format!(
            "colour block of {} values is not a multiple of {} rounds x channels",
            colours.len(),
            n_rc
        )));
    }
    colours
        .chunks(n_rc)
        .map(|colour| solver.solve(colour, record_trace))
        .collect()
}

//! Memory bounds for colour loading and per-gene scoring.

use std::ops::Range;

use sysinfo::System;

use crate::error::{OmpError, OmpResult};
use crate::provider::PixelColourProvider;
use crate::volume::position_of;

/// Share of available memory one colour loading batch may occupy.
pub const COLOUR_MEMORY_FRACTION: f64 = 0.052;

/// Share of available memory the per-gene score volumes in flight may occupy.
pub const SCORE_MEMORY_FRACTION: f64 = 0.25;

/// Full-tile f32 volumes alive per gene while scoring: coefficients,
/// saturated coefficients, score.
const SCORE_VOLUMES_PER_GENE: usize = 3;

/// Currently available system memory in GB (10^9 bytes).
pub fn available_memory_gb() -> f64 {
    let mut system = System::new();
    system.refresh_memory();
    system.available_memory() as f64 / 1e9
}

fn units_within(available_gb: f64, fraction: f64, bytes_per_unit: usize, cap: Option<usize>) -> usize {
    let budget = available_gb.max(0.0) * 1e9 * fraction;
    let raw = (budget / bytes_per_unit.max(1) as f64).floor();
    let units = if raw.is_finite() && raw >= 1.0 {
        raw as usize
    } else {
        1
    };
    match cap {
        Some(cap) => units.min(cap.max(1)),
        None => units,
    }
}

/// Pixels per colour loading batch.
///
/// A batch holds every round and channel of its pixels as `f32`, so it takes
/// `pixels * n_rounds * n_channels * 4` bytes; the batch is sized to
/// [`COLOUR_MEMORY_FRACTION`] of `available_gb`. At least one, optionally
/// capped.
pub fn colour_batch_pixels(
    available_gb: f64,
    n_rounds: usize,
    n_channels: usize,
    cap: Option<usize>,
) -> usize {
    let bytes_per_pixel = n_rounds * n_channels * std::mem::size_of::<f32>();
    units_within(available_gb, COLOUR_MEMORY_FRACTION, bytes_per_pixel, cap)
}

/// Genes scored concurrently on a tile of `n_voxels` voxels, sized to
/// [`SCORE_MEMORY_FRACTION`] of `available_gb`. At least one, optionally
/// capped.
pub fn genes_in_flight(available_gb: f64, n_voxels: usize, cap: Option<usize>) -> usize {
    let bytes_per_gene = SCORE_VOLUMES_PER_GENE * n_voxels * std::mem::size_of::<f32>();
    units_within(available_gb, SCORE_MEMORY_FRACTION, bytes_per_gene, cap)
}

fn provider_error(tile: usize, round: usize, message: impl ToString) -> OmpError {
    OmpError::Provider {
        tile,
        round,
        message: message.to_string(),
    }
}

/// Read every round of `positions` and interleave into per-position colours
/// of length `n_rounds * n_channels`.
pub(crate) fn read_colours<P: PixelColourProvider + ?Sized>(
    provider: &P,
    tile: usize,
    positions: &[[isize; 3]],
    n_rounds: usize,
    n_channels: usize,
) -> OmpResult<Vec<f32>> {
    let n_rc = n_rounds * n_channels;
    let mut colours = vec![0.0f32; positions.len() * n_rc];
    for round in 0..n_rounds {
        let values = provider
            .get_colours(tile, round, positions)
            .map_err(|e| provider_error(tile, round, e))?;
        if values.len() != positions.len() * n_channels {
            return Err(provider_error(
                tile,
                round,
                format!(
                    "returned {} values for {} positions x {} channels",
                    values.len(),
                    positions.len(),
                    n_channels
                ),
            ));
        }
        for (p, chunk) in values.chunks(n_channels).enumerate() {
            let dst = p * n_rc + round * n_channels;
            colours[dst..dst + n_channels].copy_from_slice(chunk);
        }
    }
    Ok(colours)
}

/// Colours of the pixels with linear indices `pixels`, optionally scaled by
/// a per-tile normalisation factor.
pub(crate) fn load_pixel_range<P: PixelColourProvider + ?Sized>(
    provider: &P,
    tile: usize,
    tile_shape: [usize; 3],
    pixels: Range<usize>,
    n_rounds: usize,
    n_channels: usize,
    norm_factor: Option<&[f32]>,
) -> OmpResult<Vec<f32>> {
    let positions: Vec<[isize; 3]> = pixels
        .map(|i| {
            let [y, x, z] = position_of(tile_shape, i);
            [y as isize, x as isize, z as isize]
        })
        .collect();
    let mut colours = read_colours(provider, tile, &positions, n_rounds, n_channels)?;
    if let Some(norm) = norm_factor {
        for colour in colours.chunks_mut(norm.len()) {
            colour.iter_mut().zip(norm).for_each(|(v, f)| *v *= f);
        }
    }
    Ok(colours)
}

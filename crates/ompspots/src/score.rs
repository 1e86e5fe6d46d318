//! Coefficient-image scoring.
//!
//! A gene's coefficient volume is saturated with `c / (c + bias)` and
//! correlated with the calibrated spot kernel. Pixels whose neighbourhood
//! looks like a bright, well-formed spot score close to one; isolated noisy
//! coefficients score low.

use std::ops::Range;

use crate::error::{OmpError, OmpResult};
use crate::volume::Volume3;

/// Saturating coefficient map `max(c, 0) / (max(c, 0) + bias)`.
#[inline]
pub fn saturate(coef: f32, bias: f32) -> f32 {
    let c = coef.max(0.0);
    c / (c + bias)
}

/// Scoring kernel: the mean spot restricted to its template (and to
/// non-negative values), normalised to unit sum.
pub fn score_kernel(mean_spot: &Volume3<f32>, template: &Volume3<u8>) -> OmpResult<Volume3<f32>> {
    if mean_spot.shape() != template.shape() {
        return Err(OmpError::input(format!(
            "mean spot shape {:?} does not match template shape {:?}",
            mean_spot.shape(),
            template.shape()
        )));
    }
    if mean_spot.shape().iter().any(|&n| n % 2 == 0) {
        return Err(OmpError::input(format!(
            "spot kernel extents must be odd, got {:?}",
            mean_spot.shape()
        )));
    }
    let masked: Vec<f32> = mean_spot
        .as_slice()
        .iter()
        .zip(template.as_slice())
        .map(|(&m, &t)| if t != 0 { m.max(0.0) } else { 0.0 })
        .collect();
    let total: f32 = masked.iter().sum();
    if total.is_nan() || total <= 0.0 {
        return Err(OmpError::input(
            "spot template selects no positive mean-spot weight",
        ));
    }
    let data = masked.into_iter().map(|v| v / total).collect();
    Volume3::from_vec(mean_spot.shape(), data)
        .ok_or_else(|| OmpError::input("spot kernel buffer has the wrong length"))
}

/// Non-zero taps of a kernel as offsets from its centre.
pub(crate) fn kernel_taps(kernel: &Volume3<f32>) -> Vec<([isize; 3], f32)> {
    let [ky, kx, kz] = kernel.shape();
    let centre = [(ky / 2) as isize, (kx / 2) as isize, (kz / 2) as isize];
    let mut taps = Vec::new();
    for y in 0..ky {
        for x in 0..kx {
            for z in 0..kz {
                let w = kernel.get([y, x, z]);
                if w != 0.0 {
                    taps.push((
                        [
                            y as isize - centre[0],
                            x as isize - centre[1],
                            z as isize - centre[2],
                        ],
                        w,
                    ));
                }
            }
        }
    }
    taps
}

/// Zero-padded "same" correlation restricted to y rows `rows`.
///
/// Returns the output voxels of those rows in linear order.
pub(crate) fn correlate_rows(
    volume: &Volume3<f32>,
    taps: &[([isize; 3], f32)],
    rows: Range<usize>,
) -> Vec<f32> {
    let [_, nx, nz] = volume.shape();
    let mut out = Vec::with_capacity(rows.len() * nx * nz);
    for y in rows {
        for x in 0..nx {
            for z in 0..nz {
                let mut acc = 0.0f32;
                for &([dy, dx, dz], w) in taps {
                    if let Some(v) =
                        volume.get_signed([y as isize + dy, x as isize + dx, z as isize + dz])
                    {
                        acc += w * v;
                    }
                }
                out.push(acc);
            }
        }
    }
    out
}

/// Serial zero-padded "same" correlation of `volume` with an odd-extent kernel.
pub fn correlate(volume: &Volume3<f32>, kernel: &Volume3<f32>) -> Volume3<f32> {
    let taps = kernel_taps(kernel);
    let data = correlate_rows(volume, &taps, 0..volume.shape()[0]);
    Volume3::from_vec(volume.shape(), data).unwrap_or_else(|| Volume3::zeros(volume.shape()))
}

/// Saturated copy of a coefficient volume. Rejects a non-positive bias.
pub fn saturate_volume(coefficients: &Volume3<f32>, bias: f32) -> OmpResult<Volume3<f32>> {
    if bias.is_nan() || bias <= 0.0 {
        return Err(OmpError::input(format!(
            "high_coef_bias must be > 0, got {}",
            bias
        )));
    }
    Ok(coefficients.map(|c| saturate(c, bias)))
}

/// Serial score volume of one gene.
pub fn score_volume(
    coefficients: &Volume3<f32>,
    kernel: &Volume3<f32>,
    bias: f32,
) -> OmpResult<Volume3<f32>> {
    Ok(correlate(&saturate_volume(coefficients, bias)?, kernel))
}

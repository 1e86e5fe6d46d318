//! Non-maximum-suppressed peak finding over 2-D and 3-D volumes.
//!
//! A voxel is a peak when its value is at least the threshold and no voxel
//! of its ellipsoidal neighbourhood is larger. Equal-valued neighbours at a
//! lower linear index suppress the voxel, so plateaus resolve to a single
//! deterministic peak.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::volume::Volume3;

/// A detected peak.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Peak {
    /// Position `[y, x, z]`.
    pub yxz: [usize; 3],
    /// Volume value at the peak.
    pub value: f32,
}

/// Offsets `[dy, dx, dz]` (excluding the centre) inside the ellipsoid
/// `(dy² + dx²) / r_xy² + dz² / r_z² ≤ 1`.
///
/// A zero radius collapses that axis. Volumes with a single z-plane never
/// look across z.
pub fn ellipsoid_offsets(radius_xy: f32, radius_z: f32, shape: [usize; 3]) -> Vec<[isize; 3]> {
    let r_xy = radius_xy.max(0.0);
    let r_z = if shape[2] <= 1 { 0.0 } else { radius_z.max(0.0) };
    let n_xy = r_xy.floor() as isize;
    let n_z = r_z.floor() as isize;
    let mut offsets = Vec::new();
    for dy in -n_xy..=n_xy {
        for dx in -n_xy..=n_xy {
            for dz in -n_z..=n_z {
                if dy == 0 && dx == 0 && dz == 0 {
                    continue;
                }
                let mut d = 0.0f32;
                if n_xy > 0 {
                    d += (dy * dy + dx * dx) as f32 / (r_xy * r_xy);
                }
                if n_z > 0 {
                    d += (dz * dz) as f32 / (r_z * r_z);
                }
                if d <= 1.0 {
                    offsets.push([dy, dx, dz]);
                }
            }
        }
    }
    offsets
}

/// Peaks of `volume` with value ≥ `threshold`, in linear-index order.
pub fn detect_local_maxima(
    volume: &Volume3<f32>,
    threshold: f32,
    radius_xy: f32,
    radius_z: f32,
) -> Vec<Peak> {
    let offsets = ellipsoid_offsets(radius_xy, radius_z, volume.shape());
    detect_in_rows(volume, threshold, &offsets, 0..volume.shape()[0])
}

/// Peak scan restricted to y rows `rows`; the neighbourhood still reads
/// outside the rows. Concatenating disjoint row ranges in order reproduces
/// [`detect_local_maxima`].
pub(crate) fn detect_in_rows(
    volume: &Volume3<f32>,
    threshold: f32,
    offsets: &[[isize; 3]],
    rows: Range<usize>,
) -> Vec<Peak> {
    let [ny, nx, nz] = volume.shape();
    let data = volume.as_slice();
    let mut peaks = Vec::new();
    for y in rows {
        for x in 0..nx {
            for z in 0..nz {
                let idx = volume.index([y, x, z]);
                let val = data[idx];
                if val.is_nan() || val < threshold {
                    continue;
                }
                let mut is_max = true;
                for &[dy, dx, dz] in offsets {
                    let (py, px, pz) = (y as isize + dy, x as isize + dx, z as isize + dz);
                    if py < 0
                        || px < 0
                        || pz < 0
                        || py >= ny as isize
                        || px >= nx as isize
                        || pz >= nz as isize
                    {
                        continue;
                    }
                    let nidx = volume.index([py as usize, px as usize, pz as usize]);
                    if data[nidx] > val || (data[nidx] == val && nidx < idx) {
                        is_max = false;
                        break;
                    }
                }
                if is_max {
                    peaks.push(Peak {
                        yxz: [y, x, z],
                        value: val,
                    });
                }
            }
        }
    }
    peaks
}

/// Peaks that have no other peak within the isolation ellipsoid.
///
/// Candidate peaks are found with a small suppression neighbourhood first,
/// then every candidate closer than (`isolation_yx`, `isolation_z`) to
/// another candidate is dropped, whichever is larger.
pub fn isolated_maxima(
    volume: &Volume3<f32>,
    threshold: f32,
    isolation_yx: f32,
    isolation_z: f32,
) -> Vec<Peak> {
    const CANDIDATE_RADIUS: f32 = 1.5;
    let candidates = detect_local_maxima(volume, threshold, CANDIDATE_RADIUS, CANDIDATE_RADIUS);
    let single_plane = volume.shape()[2] <= 1;
    let within = |a: &Peak, b: &Peak| {
        let dy = a.yxz[0] as f32 - b.yxz[0] as f32;
        let dx = a.yxz[1] as f32 - b.yxz[1] as f32;
        let dz = a.yxz[2] as f32 - b.yxz[2] as f32;
        let d_yx = if isolation_yx > 0.0 {
            (dy * dy + dx * dx) / (isolation_yx * isolation_yx)
        } else if dy == 0.0 && dx == 0.0 {
            0.0
        } else {
            f32::INFINITY
        };
        let d_z = if single_plane || dz == 0.0 {
            0.0
        } else if isolation_z > 0.0 {
            dz * dz / (isolation_z * isolation_z)
        } else {
            f32::INFINITY
        };
        d_yx + d_z <= 1.0
    };

    // Candidates are sorted by y, so neighbours lie in a y window.
    let reach = isolation_yx.max(0.0).floor() as usize;
    let mut isolated = Vec::new();
    for (i, peak) in candidates.iter().enumerate() {
        let y = peak.yxz[0];
        let lo = candidates[..i].partition_point(|p| p.yxz[0] + reach < y);
        let hi = i + 1 + candidates[i + 1..].partition_point(|p| p.yxz[0] <= y + reach);
        let crowded = (lo..hi).any(|j| j != i && within(peak, &candidates[j]));
        if !crowded {
            isolated.push(*peak);
        }
    }
    isolated
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volume_with(shape: [usize; 3], values: &[([usize; 3], f32)]) -> Volume3<f32> {
        let mut v = Volume3::zeros(shape);
        for &(p, val) in values {
            v.set(p, val);
        }
        v
    }

    #[test]
    fn threshold_boundary_is_inclusive() {
        let v = volume_with([7, 7, 1], &[([3, 3, 0], 5.0)]);
        let peaks = detect_local_maxima(&v, 5.0, 2.0, 0.0);
        assert_eq!(peaks.len(), 1);
        assert_eq!(peaks[0].yxz, [3, 3, 0]);
        assert_eq!(peaks[0].value, 5.0);
        assert!(detect_local_maxima(&v, 6.0, 2.0, 0.0).is_empty());
    }

    #[test]
    fn close_maxima_collapse_to_larger() {
        let v = volume_with([9, 9, 1], &[([4, 2, 0], 3.0), ([4, 4, 0], 7.0)]);
        let peaks = detect_local_maxima(&v, 1.0, 3.0, 0.0);
        assert_eq!(peaks.len(), 1);
        assert_eq!(peaks[0].yxz, [4, 4, 0]);
    }

    #[test]
    fn equal_maxima_resolve_to_lower_linear_index() {
        let v = volume_with([9, 9, 1], &[([4, 5, 0], 2.0), ([4, 3, 0], 2.0)]);
        let peaks = detect_local_maxima(&v, 1.0, 3.0, 0.0);
        assert_eq!(peaks.len(), 1);
        assert_eq!(peaks[0].yxz, [4, 3, 0]);
    }

    #[test]
    fn distant_maxima_are_both_kept() {
        let v = volume_with([12, 12, 1], &[([2, 2, 0], 2.0), ([9, 9, 0], 1.0)]);
        let peaks = detect_local_maxima(&v, 0.5, 3.0, 0.0);
        assert_eq!(peaks.len(), 2);
        assert_eq!(peaks[0].yxz, [2, 2, 0]);
        assert_eq!(peaks[1].yxz, [9, 9, 0]);
    }

    #[test]
    fn z_radius_separates_planes() {
        let v = volume_with([5, 5, 6], &[([2, 2, 0], 2.0), ([2, 2, 4], 1.5)]);
        assert_eq!(detect_local_maxima(&v, 1.0, 1.0, 2.0).len(), 2);
        assert_eq!(detect_local_maxima(&v, 1.0, 1.0, 4.0).len(), 1);
    }

    #[test]
    fn offsets_of_single_plane_volume_stay_in_plane() {
        let offsets = ellipsoid_offsets(2.0, 3.0, [10, 10, 1]);
        assert!(offsets.iter().all(|o| o[2] == 0));
        assert!(offsets.contains(&[2, 0, 0]));
        assert!(!offsets.contains(&[2, 1, 0]));
    }

    #[test]
    fn row_ranges_concatenate_to_full_scan() {
        let v = Volume3::from_fn([10, 8, 3], |[y, x, z]| {
            ((y * 7 + x * 3 + z * 5) % 11) as f32
        });
        let offsets = ellipsoid_offsets(1.5, 1.0, v.shape());
        let full = detect_local_maxima(&v, 4.0, 1.5, 1.0);
        let mut split = detect_in_rows(&v, 4.0, &offsets, 0..4);
        split.extend(detect_in_rows(&v, 4.0, &offsets, 4..10));
        assert_eq!(full, split);
    }

    #[test]
    fn crowded_peaks_are_not_isolated() {
        let v = volume_with(
            [20, 20, 1],
            &[([3, 3, 0], 1.0), ([3, 7, 0], 0.9), ([15, 15, 0], 1.2)],
        );
        let isolated = isolated_maxima(&v, 0.5, 6.0, 0.0);
        assert_eq!(isolated.len(), 1);
        assert_eq!(isolated[0].yxz, [15, 15, 0]);
    }
}

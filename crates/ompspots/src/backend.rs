//! Numeric backends.
//!
//! Every heavy loop of the pipeline goes through [`NumericBackend`]. The
//! serial backend runs the element kernels in order; the parallel backend
//! (feature `parallel`, on by default) splits the same kernels across rayon
//! workers along independent axes (pixel subsets, y rows, genes) and
//! reassembles results in order, so both produce identical output.

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::coefficients::{solve_block, CoefficientBatch, PursuitSolver};
use crate::config::BackendKind;
use crate::error::{OmpError, OmpResult};
use crate::maxima::{detect_in_rows, ellipsoid_offsets, Peak};
use crate::score::{correlate_rows, kernel_taps};
use crate::volume::Volume3;

/// Capabilities the pipeline needs from a numeric backend.
pub trait NumericBackend {
    fn name(&self) -> &'static str;

    /// Solve consecutive pixel colours in subsets of `subset_pixels`.
    ///
    /// `colours` holds one `n_rounds * n_channels` colour per pixel, the
    /// first pixel having linear index `start`. One batch is returned per
    /// subset, in pixel order.
    fn solve_pixels(
        &self,
        solver: &PursuitSolver<'_>,
        colours: &[f32],
        start: usize,
        subset_pixels: usize,
    ) -> OmpResult<Vec<CoefficientBatch>>;

    /// Peaks of `volume`, as [`crate::maxima::detect_local_maxima`].
    fn local_maxima(
        &self,
        volume: &Volume3<f32>,
        threshold: f32,
        radius_xy: f32,
        radius_z: f32,
    ) -> Vec<Peak>;

    /// Zero-padded "same" correlation, as [`crate::score::correlate`].
    fn correlate(&self, volume: &Volume3<f32>, kernel: &Volume3<f32>) -> Volume3<f32>;

    /// Evaluate `f` for every gene, results in gene order.
    fn map_genes<T, F>(&self, n_genes: usize, f: F) -> Vec<T>
    where
        T: Send,
        F: Fn(usize) -> T + Sync + Send;
}

fn subset_len(subset_pixels: usize, n_rc: usize) -> OmpResult<usize> {
    if subset_pixels == 0 {
        return Err(OmpError::input("subset_pixels must be > 0"));
    }
    Ok(subset_pixels * n_rc)
}

fn volume_from_rows(shape: [usize; 3], data: Vec<f32>) -> Volume3<f32> {
    Volume3::from_vec(shape, data).unwrap_or_else(|| Volume3::zeros(shape))
}

/// Single-threaded backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialBackend;

impl NumericBackend for SerialBackend {
    fn name(&self) -> &'static str {
        "serial"
    }

    fn solve_pixels(
        &self,
        solver: &PursuitSolver<'_>,
        colours: &[f32],
        start: usize,
        subset_pixels: usize,
    ) -> OmpResult<Vec<CoefficientBatch>> {
        let chunk = subset_len(subset_pixels, solver.codebook().n_rounds_channels())?;
        colours
            .chunks(chunk)
            .enumerate()
            .map(|(i, block)| {
                let fits = solve_block(solver, block, false)?;
                Ok(CoefficientBatch::from_fits(start + i * subset_pixels, &fits))
            })
            .collect()
    }

    fn local_maxima(
        &self,
        volume: &Volume3<f32>,
        threshold: f32,
        radius_xy: f32,
        radius_z: f32,
    ) -> Vec<Peak> {
        let offsets = ellipsoid_offsets(radius_xy, radius_z, volume.shape());
        detect_in_rows(volume, threshold, &offsets, 0..volume.shape()[0])
    }

    fn correlate(&self, volume: &Volume3<f32>, kernel: &Volume3<f32>) -> Volume3<f32> {
        let taps = kernel_taps(kernel);
        let data = correlate_rows(volume, &taps, 0..volume.shape()[0]);
        volume_from_rows(volume.shape(), data)
    }

    fn map_genes<T, F>(&self, n_genes: usize, f: F) -> Vec<T>
    where
        T: Send,
        F: Fn(usize) -> T + Sync + Send,
    {
        (0..n_genes).map(f).collect()
    }
}

/// Rayon data-parallel backend.
#[cfg(feature = "parallel")]
#[derive(Debug, Clone, Copy, Default)]
pub struct ParallelBackend;

#[cfg(feature = "parallel")]
impl NumericBackend for ParallelBackend {
    fn name(&self) -> &'static str {
        "parallel"
    }

    fn solve_pixels(
        &self,
        solver: &PursuitSolver<'_>,
        colours: &[f32],
        start: usize,
        subset_pixels: usize,
    ) -> OmpResult<Vec<CoefficientBatch>> {
        let chunk = subset_len(subset_pixels, solver.codebook().n_rounds_channels())?;
        colours
            .par_chunks(chunk)
            .enumerate()
            .map(|(i, block)| {
                let fits = solve_block(solver, block, false)?;
                Ok(CoefficientBatch::from_fits(start + i * subset_pixels, &fits))
            })
            .collect()
    }

    fn local_maxima(
        &self,
        volume: &Volume3<f32>,
        threshold: f32,
        radius_xy: f32,
        radius_z: f32,
    ) -> Vec<Peak> {
        let offsets = ellipsoid_offsets(radius_xy, radius_z, volume.shape());
        let rows: Vec<Vec<Peak>> = (0..volume.shape()[0])
            .into_par_iter()
            .map(|y| detect_in_rows(volume, threshold, &offsets, y..y + 1))
            .collect();
        rows.into_iter().flatten().collect()
    }

    fn correlate(&self, volume: &Volume3<f32>, kernel: &Volume3<f32>) -> Volume3<f32> {
        let taps = kernel_taps(kernel);
        let rows: Vec<Vec<f32>> = (0..volume.shape()[0])
            .into_par_iter()
            .map(|y| correlate_rows(volume, &taps, y..y + 1))
            .collect();
        volume_from_rows(volume.shape(), rows.concat())
    }

    fn map_genes<T, F>(&self, n_genes: usize, f: F) -> Vec<T>
    where
        T: Send,
        F: Fn(usize) -> T + Sync + Send,
    {
        (0..n_genes).into_par_iter().map(f).collect()
    }
}

/// Backend chosen once per run.
#[derive(Debug, Clone, Copy)]
pub enum Backend {
    Serial(SerialBackend),
    #[cfg(feature = "parallel")]
    Parallel(ParallelBackend),
}

/// Resolve a configured backend kind.
///
/// Without the `parallel` feature a parallel request falls back to serial.
pub fn select_backend(kind: BackendKind) -> Backend {
    match kind {
        BackendKind::Serial => Backend::Serial(SerialBackend),
        #[cfg(feature = "parallel")]
        BackendKind::Parallel => Backend::Parallel(ParallelBackend),
        #[cfg(not(feature = "parallel"))]
        BackendKind::Parallel => {
            tracing::warn!("parallel backend requested but the `parallel` feature is disabled");
            Backend::Serial(SerialBackend)
        }
    }
}

macro_rules! dispatch {
    ($self:ident, $b:ident => $call:expr) => {
        match $self {
            Backend::Serial($b) => $call,
            #[cfg(feature = "parallel")]
            Backend::Parallel($b) => $call,
        }
    };
}

impl NumericBackend for Backend {
    fn name(&self) -> &'static str {
        dispatch!(self, b => b.name())
    }

    fn solve_pixels(
        &self,
        solver: &PursuitSolver<'_>,
        colours: &[f32],
        start: usize,
        subset_pixels: usize,
    ) -> OmpResult<Vec<CoefficientBatch>> {
        dispatch!(self, b => b.solve_pixels(solver, colours, start, subset_pixels))
    }

    fn local_maxima(
        &self,
        volume: &Volume3<f32>,
        threshold: f32,
        radius_xy: f32,
        radius_z: f32,
    ) -> Vec<Peak> {
        dispatch!(self, b => b.local_maxima(volume, threshold, radius_xy, radius_z))
    }

    fn correlate(&self, volume: &Volume3<f32>, kernel: &Volume3<f32>) -> Volume3<f32> {
        dispatch!(self, b => b.correlate(volume, kernel))
    }

    fn map_genes<T, F>(&self, n_genes: usize, f: F) -> Vec<T>
    where
        T: Send,
        F: Fn(usize) -> T + Sync + Send,
    {
        dispatch!(self, b => b.map_genes(n_genes, f))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codebook::CodeBook;
    use crate::config::CoefficientConfig;
    use crate::test_utils::normalise;
    use rand::{Rng, SeedableRng};

    fn random_volume(rng: &mut rand::rngs::StdRng, shape: [usize; 3]) -> Volume3<f32> {
        Volume3::from_fn(shape, |_| rng.gen_range(0.0..1.0))
    }

    fn backends() -> Vec<Backend> {
        vec![select_backend(BackendKind::Serial), select_backend(BackendKind::Parallel)]
    }

    #[test]
    fn backends_solve_identically() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(3);
        let codes = (0..6)
            .map(|_| normalise((0..8).map(|_| rng.gen_range(0.0..1.0)).collect()))
            .collect();
        let book = CodeBook::new(4, 2, codes).unwrap();
        let cfg = CoefficientConfig {
            dot_product_threshold: 0.05,
            ..CoefficientConfig::default()
        };
        let solver = PursuitSolver::new(&book, &cfg).unwrap();
        let colours: Vec<f32> = (0..37 * 8).map(|_| rng.gen_range(0.0..2.0)).collect();
        let results: Vec<Vec<CoefficientBatch>> = backends()
            .iter()
            .map(|b| b.solve_pixels(&solver, &colours, 100, 5).unwrap())
            .collect();
        assert_eq!(results[0].len(), 8);
        assert_eq!(results[0][7].start, 135);
        assert_eq!(results[0][7].len(), 2);
        assert_eq!(results[0], results[1]);
    }

    #[test]
    fn backends_detect_and_correlate_identically() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(8);
        let volume = random_volume(&mut rng, [16, 12, 4]);
        let kernel = random_volume(&mut rng, [3, 5, 3]);
        let b = backends();
        assert_eq!(
            b[0].local_maxima(&volume, 0.5, 2.0, 1.0),
            b[1].local_maxima(&volume, 0.5, 2.0, 1.0)
        );
        assert_eq!(b[0].correlate(&volume, &kernel), b[1].correlate(&volume, &kernel));
        assert_eq!(
            b[1].correlate(&volume, &kernel),
            crate::score::correlate(&volume, &kernel)
        );
    }

    #[test]
    fn map_genes_keeps_gene_order() {
        for b in backends() {
            assert_eq!(b.map_genes(5, |g| g * 10), vec![0, 10, 20, 30, 40]);
        }
    }

    #[test]
    fn zero_subset_is_rejected() {
        let book = crate::test_utils::two_gene_codebook();
        let cfg = CoefficientConfig::default();
        let solver = PursuitSolver::new(&book, &cfg).unwrap();
        assert!(SerialBackend.solve_pixels(&solver, &[0.0; 6], 0, 0).is_err());
    }
}

//! High-level gene-calling API.
//!
//! [`GeneCaller`] is the primary entry point. It wraps a [`CodeBook`] and an
//! [`OmpConfig`] and runs the tile pipeline against any
//! [`PixelColourProvider`].

use std::path::Path;

use crate::codebook::CodeBook;
use crate::coefficients::{PixelFit, PursuitSolver};
use crate::config::OmpConfig;
use crate::error::OmpResult;
use crate::pipeline::{self, GeneCallResult};
use crate::provider::{InMemoryDataset, PixelColourProvider, TileGeometry};
use crate::shape::SpotShape;

/// Primary gene-calling interface.
///
/// Create once, call on many datasets sharing a code book.
///
/// # Examples
///
/// ```no_run
/// use ompspots::{GeneCaller, InMemoryDataset};
/// use std::path::Path;
///
/// let dataset = InMemoryDataset::from_json_file(Path::new("dataset.json")).unwrap();
/// let caller = GeneCaller::new(dataset.codebook().unwrap());
/// let result = caller.call(&dataset, &dataset.geometry).unwrap();
/// println!("Found {} spots", result.spots.len());
/// ```
#[derive(Debug, Clone)]
pub struct GeneCaller {
    codebook: CodeBook,
    config: OmpConfig,
}

impl GeneCaller {
    /// Create a caller with the default configuration.
    pub fn new(codebook: CodeBook) -> Self {
        Self::with_config(codebook, OmpConfig::default())
    }

    /// Create with full config control.
    pub fn with_config(codebook: CodeBook, config: OmpConfig) -> Self {
        Self { codebook, config }
    }

    /// Load a JSON config and create a caller in one step.
    pub fn from_config_json_file(
        codebook: CodeBook,
        path: &Path,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        Ok(Self::with_config(codebook, OmpConfig::from_json_file(path)?))
    }

    /// Create a caller for the code book of an in-memory dataset.
    pub fn for_dataset(dataset: &InMemoryDataset, config: OmpConfig) -> OmpResult<Self> {
        Ok(Self::with_config(dataset.codebook()?, config))
    }

    pub fn codebook(&self) -> &CodeBook {
        &self.codebook
    }

    /// Access the current configuration.
    pub fn config(&self) -> &OmpConfig {
        &self.config
    }

    /// Mutable access to configuration for post-construction tuning.
    pub fn config_mut(&mut self) -> &mut OmpConfig {
        &mut self.config
    }

    /// Run the pursuit on a single colour and return the full trace.
    pub fn solve_pixel(&self, colour: &[f32]) -> OmpResult<PixelFit> {
        PursuitSolver::new(&self.codebook, &self.config.coefficients)?.solve(colour, true)
    }

    /// Calibrate the spot shape on the calibration tile of `geometry`.
    pub fn calibrate<P>(&self, provider: &P, geometry: &TileGeometry) -> OmpResult<SpotShape>
    where
        P: PixelColourProvider + ?Sized,
    {
        pipeline::calibrate_spot_shape(provider, &self.codebook, geometry, &self.config)
            .map(|(shape, _)| shape)
    }

    /// Run gene calling on every tile, calibrating on the calibration tile.
    pub fn call<P>(&self, provider: &P, geometry: &TileGeometry) -> OmpResult<GeneCallResult>
    where
        P: PixelColourProvider + ?Sized,
    {
        pipeline::run(provider, &self.codebook, geometry, &self.config, None)
    }

    /// Run gene calling with a previously calibrated spot shape.
    pub fn call_with_shape<P>(
        &self,
        provider: &P,
        geometry: &TileGeometry,
        spot_shape: SpotShape,
    ) -> OmpResult<GeneCallResult>
    where
        P: PixelColourProvider + ?Sized,
    {
        pipeline::run(provider, &self.codebook, geometry, &self.config, Some(spot_shape))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coefficients::StopReason;
    use crate::error::OmpError;
    use crate::test_utils::{spot_dataset, two_gene_codebook};

    fn caller_for(dataset: &InMemoryDataset) -> GeneCaller {
        let mut caller = GeneCaller::for_dataset(dataset, OmpConfig::default()).unwrap();
        caller.config_mut().spot_shape.spot_shape = [3, 3, 1];
        caller
    }

    #[test]
    fn config_mut_changes_config() {
        let mut caller = GeneCaller::new(two_gene_codebook());
        caller.config_mut().scoring.score_threshold = 0.5;
        assert!((caller.config().scoring.score_threshold - 0.5).abs() < 1e-6);
        assert_eq!(caller.codebook().n_genes(), 2);
    }

    #[test]
    fn solve_pixel_reports_trace() {
        let caller = GeneCaller::new(two_gene_codebook());
        let colour: Vec<f32> = caller.codebook().gene_code(1).iter().map(|v| 2.0 * v).collect();
        let fit = caller.solve_pixel(&colour).unwrap();
        assert_eq!(fit.genes.len(), 1);
        assert_eq!(fit.genes[0].0, 1);
        assert_eq!(fit.trace.as_ref().map(Vec::len), Some(1));
        assert_eq!(fit.stop, StopReason::LowIntensity);
    }

    #[test]
    fn calibrate_then_call_matches_single_call() {
        let dataset = spot_dataset([10, 10, 1], &[(0, [3, 3, 0], 1.0), (1, [7, 6, 0], 1.5)]);
        let caller = caller_for(&dataset);
        let shape = caller.calibrate(&dataset, &dataset.geometry).unwrap();
        let two_phase = caller
            .call_with_shape(&dataset, &dataset.geometry, shape)
            .unwrap();
        let one_phase = caller.call(&dataset, &dataset.geometry).unwrap();
        assert_eq!(two_phase.spots, one_phase.spots);
        assert_eq!(one_phase.spots.len(), 2);
        assert_eq!(one_phase.spots.gene_counts(2), vec![1, 1]);
    }

    #[test]
    fn invalid_config_is_rejected_before_any_work() {
        let dataset = spot_dataset([6, 6, 1], &[(0, [3, 3, 0], 1.0)]);
        let mut caller = caller_for(&dataset);
        caller.config_mut().scoring.high_coef_bias = -1.0;
        let err = caller.call(&dataset, &dataset.geometry).unwrap_err();
        assert!(matches!(err, OmpError::InputViolation { .. }));
    }
}

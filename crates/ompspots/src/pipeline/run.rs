//! Tile orchestrator: coefficients → calibration → scoring → detection.

use tracing::{debug, info};

use super::colours::{
    available_memory_gb, colour_batch_pixels, genes_in_flight, load_pixel_range, read_colours,
};
use super::result::{DetectedSpot, GeneCallResult, SpotTable, TileCoefficients};
use crate::backend::{select_backend, NumericBackend};
use crate::codebook::CodeBook;
use crate::coefficients::{CoefficientStore, PursuitSolver};
use crate::config::{OmpConfig, ScoringConfig};
use crate::error::{OmpError, OmpResult};
use crate::maxima::Peak;
use crate::provider::{PixelColourProvider, TileGeometry};
use crate::score::saturate_volume;
use crate::shape::{calibrate, SpotShape};
use crate::volume::Volume3;

/// Solve every pixel of `tile` and assemble its coefficient store.
///
/// Colours are loaded in memory-bounded batches and solved in
/// `subset_pixels` subsets; the store is assembled once all subsets finish.
pub fn compute_tile_coefficients<P, B>(
    backend: &B,
    provider: &P,
    solver: &PursuitSolver<'_>,
    geometry: &TileGeometry,
    tile: usize,
    config: &OmpConfig,
) -> OmpResult<CoefficientStore>
where
    P: PixelColourProvider + ?Sized,
    B: NumericBackend,
{
    let book = solver.codebook();
    let (n_rounds, n_channels) = (book.n_rounds(), book.n_channels());
    let n_pixels = geometry.n_pixels();

    let norm_factor = if config.coefficients.colour_normalise {
        provider.colour_norm_factor(tile)
    } else {
        None
    };
    if let Some(norm) = &norm_factor {
        if norm.len() != book.n_rounds_channels() {
            return Err(OmpError::input(format!(
                "tile {} colour norm factor has length {}, expected {}",
                tile,
                norm.len(),
                book.n_rounds_channels()
            )));
        }
    }

    let batch_pixels = colour_batch_pixels(
        available_memory_gb(),
        n_rounds,
        n_channels,
        config.batching.max_colour_batch_pixels,
    );
    let n_batches = n_pixels.div_ceil(batch_pixels);
    debug!(tile, batch_pixels, n_batches, "loading tile colours");

    let mut batches = Vec::new();
    for (b, start) in (0..n_pixels).step_by(batch_pixels).enumerate() {
        let end = (start + batch_pixels).min(n_pixels);
        let colours = load_pixel_range(
            provider,
            tile,
            geometry.tile_shape,
            start..end,
            n_rounds,
            n_channels,
            norm_factor.as_deref(),
        )?;
        batches.extend(backend.solve_pixels(
            solver,
            &colours,
            start,
            config.batching.subset_pixels,
        )?);
        debug!(tile, batch = b + 1, n_batches, "colour batch solved");
    }

    let store = CoefficientStore::assemble(n_pixels, book.n_genes(), batches)?;
    info!(
        tile,
        nnz = store.nnz(),
        max_genes_per_pixel = store.max_genes_per_pixel(),
        "coefficients computed"
    );
    Ok(store)
}

/// Score every gene's coefficient volume and detect its spots.
///
/// Genes are handed to the backend in chunks of at most `genes_in_flight`,
/// which bounds how many full-tile score volumes exist at once. Returns
/// `(gene, peak)` pairs in gene order, then linear-index order.
pub fn score_and_detect<B>(
    backend: &B,
    store: &CoefficientStore,
    tile_shape: [usize; 3],
    kernel: &Volume3<f32>,
    scoring: &ScoringConfig,
    genes_in_flight: usize,
) -> OmpResult<Vec<(usize, Peak)>>
where
    B: NumericBackend + Sync,
{
    let n_genes = store.n_genes();
    let chunk = genes_in_flight.max(1);
    let mut detections = Vec::new();
    for first in (0..n_genes).step_by(chunk) {
        let n = chunk.min(n_genes - first);
        let per_gene = backend.map_genes(n, |offset| -> OmpResult<Vec<Peak>> {
            let coefficients = store.gene_volume(first + offset, tile_shape)?;
            let saturated = saturate_volume(&coefficients, scoring.high_coef_bias)?;
            let score = backend.correlate(&saturated, kernel);
            Ok(backend.local_maxima(
                &score,
                scoring.score_threshold,
                scoring.radius_xy,
                scoring.radius_z,
            ))
        });
        for (offset, peaks) in per_gene.into_iter().enumerate() {
            let gene = first + offset;
            let peaks = peaks?;
            debug!(gene, spots = peaks.len(), "gene scored");
            detections.extend(peaks.into_iter().map(|p| (gene, p)));
        }
    }
    Ok(detections)
}

/// Detect a tile's spots and gather their uncorrected colours.
fn detect_tile_spots<P, B>(
    backend: &B,
    provider: &P,
    codebook: &CodeBook,
    store: &CoefficientStore,
    geometry: &TileGeometry,
    tile: usize,
    kernel: &Volume3<f32>,
    config: &OmpConfig,
) -> OmpResult<Vec<DetectedSpot>>
where
    P: PixelColourProvider + ?Sized,
    B: NumericBackend + Sync,
{
    let in_flight = genes_in_flight(
        available_memory_gb(),
        geometry.n_pixels(),
        config.batching.max_genes_in_flight,
    );
    debug!(tile, genes_in_flight = in_flight, "scoring genes");
    let detections = score_and_detect(
        backend,
        store,
        geometry.tile_shape,
        kernel,
        &config.scoring,
        in_flight,
    )?;
    if detections.is_empty() {
        return Err(OmpError::TileYieldFailure { tile });
    }
    let positions: Vec<[isize; 3]> = detections
        .iter()
        .map(|(_, p)| [p.yxz[0] as isize, p.yxz[1] as isize, p.yxz[2] as isize])
        .collect();
    let n_rc = codebook.n_rounds_channels();
    let colours = read_colours(
        provider,
        tile,
        &positions,
        codebook.n_rounds(),
        codebook.n_channels(),
    )?;
    let spots = detections
        .into_iter()
        .zip(colours.chunks(n_rc))
        .map(|((gene, peak), colour)| DetectedSpot {
            tile,
            yxz: peak.yxz,
            gene,
            gene_name: codebook.gene_names()[gene].clone(),
            score: peak.value,
            colour: colour.to_vec(),
        })
        .collect::<Vec<_>>();
    info!(tile, spots = spots.len(), "tile spots detected");
    Ok(spots)
}

fn prepare<'a>(
    codebook: &'a CodeBook,
    geometry: &TileGeometry,
    config: &'a OmpConfig,
) -> OmpResult<PursuitSolver<'a>> {
    config.validate()?;
    geometry.validate()?;
    PursuitSolver::new(codebook, &config.coefficients)
}

/// Calibrate the spot shape on the calibration tile.
///
/// Returns the shape and the calibration tile's coefficient store.
pub fn calibrate_spot_shape<P>(
    provider: &P,
    codebook: &CodeBook,
    geometry: &TileGeometry,
    config: &OmpConfig,
) -> OmpResult<(SpotShape, CoefficientStore)>
where
    P: PixelColourProvider + ?Sized,
{
    let solver = prepare(codebook, geometry, config)?;
    let backend = select_backend(config.backend);
    let tile = geometry
        .calibration_tile()
        .ok_or_else(|| OmpError::input("no calibration tile"))?;
    let store = compute_tile_coefficients(&backend, provider, &solver, geometry, tile, config)?;
    let shape = calibrate(&store, geometry, tile, &config.spot_shape)?;
    Ok((shape, store))
}

/// Run gene calling over every tile of `geometry`.
///
/// The calibration tile is processed first. Without a precomputed
/// `spot_shape` the shape is calibrated once from that tile's coefficients.
pub fn run<P>(
    provider: &P,
    codebook: &CodeBook,
    geometry: &TileGeometry,
    config: &OmpConfig,
    spot_shape: Option<SpotShape>,
) -> OmpResult<GeneCallResult>
where
    P: PixelColourProvider + ?Sized,
{
    let solver = prepare(codebook, geometry, config)?;
    let backend = select_backend(config.backend);
    info!(
        backend = backend.name(),
        tiles = geometry.tiles.len(),
        genes = codebook.n_genes(),
        "starting OMP gene calling"
    );

    let mut spot_shape = spot_shape;
    let mut kernel = spot_shape.as_ref().map(SpotShape::kernel).transpose()?;
    let mut spots = SpotTable::default();
    let mut coefficients = Vec::new();

    for tile in geometry.processing_order() {
        info!(tile, "processing tile");
        let store = compute_tile_coefficients(&backend, provider, &solver, geometry, tile, config)?;
        let tile_kernel = match kernel.take() {
            Some(k) => k,
            None => {
                let shape = calibrate(&store, geometry, tile, &config.spot_shape)?;
                let k = shape.kernel()?;
                spot_shape = Some(shape);
                k
            }
        };
        let tile_spots = detect_tile_spots(
            &backend,
            provider,
            codebook,
            &store,
            geometry,
            tile,
            &tile_kernel,
            config,
        )?;
        kernel = Some(tile_kernel);
        spots.spots.extend(tile_spots);
        if config.keep_coefficients {
            coefficients.push(TileCoefficients { tile, store });
        }
    }

    let spot_shape = spot_shape.ok_or_else(|| OmpError::input("spot shape was never calibrated"))?;
    info!(spots = spots.len(), "OMP gene calling finished");
    Ok(GeneCallResult {
        spots,
        spot_shape,
        coefficients,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendKind;
    use crate::provider::{InMemoryDataset, TileColours};
    use crate::test_utils::spot_dataset;
    use approx::assert_relative_eq;

    fn small_config() -> OmpConfig {
        let mut config = OmpConfig::default();
        config.spot_shape.spot_shape = [3, 3, 1];
        config.spot_shape.shape_isolation_distance_yx = 4.0;
        config.batching.subset_pixels = 7;
        config.batching.max_colour_batch_pixels = Some(50);
        config
    }

    fn with_empty_tile(mut dataset: InMemoryDataset, tile: usize) -> InMemoryDataset {
        let len = dataset.tiles[0].data.len();
        dataset.tiles.push(TileColours {
            tile,
            data: vec![0.0; len],
            norm_factor: None,
        });
        dataset.geometry.tiles.push(tile);
        dataset
    }

    fn call(dataset: &InMemoryDataset, config: &OmpConfig) -> OmpResult<GeneCallResult> {
        let book = dataset.codebook()?;
        run(dataset, &book, &dataset.geometry, config, None)
    }

    #[test]
    fn single_spot_is_called_at_its_pixel() {
        let dataset = spot_dataset([9, 9, 1], &[(0, [4, 4, 0], 1.0)]);
        let result = call(&dataset, &small_config()).unwrap();

        assert_eq!(result.spots.len(), 1);
        let spot = &result.spots.spots[0];
        assert_eq!(spot.yxz, [4, 4, 0]);
        assert_eq!(spot.gene, 0);
        assert_eq!(spot.gene_name, "alpha");
        assert_relative_eq!(spot.score, 1.0 / 1.4, epsilon = 1e-4);
        let book = dataset.codebook().unwrap();
        for (got, want) in spot.colour.iter().zip(book.gene_code(0)) {
            assert_relative_eq!(*got, *want, epsilon = 1e-6);
        }

        let shape = &result.spot_shape;
        assert_eq!(shape.n_isolated, 1);
        assert_eq!(shape.n_positive(), 1);
        assert_relative_eq!(shape.mean_spot.get([1, 1, 0]), 1.0, epsilon = 1e-4);
        assert!(result.coefficients.is_empty());
    }

    #[test]
    fn calibration_tile_runs_first_and_empty_tile_fails() {
        let mut dataset = with_empty_tile(spot_dataset([9, 9, 1], &[(1, [2, 6, 0], 2.0)]), 5);
        dataset.geometry.tiles = vec![5, 0];
        dataset.geometry.calibration_tile = Some(0);
        let err = call(&dataset, &small_config()).unwrap_err();
        assert_eq!(err, OmpError::TileYieldFailure { tile: 5 });
    }

    #[test]
    fn empty_calibration_tile_fails_calibration() {
        let dataset = spot_dataset([9, 9, 1], &[]);
        let err = call(&dataset, &small_config()).unwrap_err();
        assert!(matches!(err, OmpError::CalibrationFailure { tile: 0, .. }));
    }

    #[test]
    fn kept_coefficients_cover_every_tile() {
        let mut dataset = spot_dataset([8, 8, 1], &[(0, [2, 2, 0], 1.0)]);
        let mut second = dataset.tiles[0].clone();
        second.tile = 3;
        dataset.tiles.push(second);
        dataset.geometry.tiles.push(3);
        let config = OmpConfig {
            keep_coefficients: true,
            ..small_config()
        };
        let result = call(&dataset, &config).unwrap();
        let tiles: Vec<usize> = result.coefficients.iter().map(|c| c.tile).collect();
        assert_eq!(tiles, vec![0, 3]);
        let store = &result.coefficients[1].store;
        assert_relative_eq!(store.get(2 * 8 + 2, 0), 1.0, epsilon = 1e-4);
        assert_eq!(result.spots.for_tile(3).count(), 1);
        assert_eq!(result.spots.gene_counts(2), vec![2, 0]);
    }

    #[test]
    fn precomputed_shape_reproduces_inline_calibration() {
        let dataset = spot_dataset(
            [12, 12, 3],
            &[(0, [3, 3, 1], 2.0), (1, [8, 8, 1], 1.5), (0, [9, 2, 0], 1.0)],
        );
        let mut config = small_config();
        config.spot_shape.spot_shape = [3, 3, 3];
        config.spot_shape.shape_isolation_distance_z = Some(1.0);
        let book = dataset.codebook().unwrap();
        let inline = run(&dataset, &book, &dataset.geometry, &config, None).unwrap();
        let (shape, _) = calibrate_spot_shape(&dataset, &book, &dataset.geometry, &config).unwrap();
        assert_eq!(shape, inline.spot_shape);
        let reused = run(&dataset, &book, &dataset.geometry, &config, Some(shape)).unwrap();
        assert_eq!(reused.spots, inline.spots);
    }

    #[test]
    fn serial_and_parallel_runs_agree() {
        let dataset = spot_dataset(
            [10, 11, 2],
            &[(0, [2, 3, 0], 1.2), (1, [7, 7, 1], 0.9), (1, [2, 9, 1], 1.4)],
        );
        let mut config = small_config();
        config.spot_shape.spot_shape = [3, 3, 1];
        config.backend = BackendKind::Serial;
        let serial = call(&dataset, &config).unwrap();
        config.backend = BackendKind::Parallel;
        let parallel = call(&dataset, &config).unwrap();
        assert_eq!(serial.spots, parallel.spots);
        assert_eq!(serial.spot_shape, parallel.spot_shape);
    }

    #[test]
    fn gene_chunking_keeps_detections_unchanged() {
        let dataset = spot_dataset(
            [10, 10, 1],
            &[(1, [2, 2, 0], 1.0), (0, [7, 6, 0], 1.5), (1, [6, 8, 0], 0.8)],
        );
        let config = small_config();
        let book = dataset.codebook().unwrap();
        let solver = PursuitSolver::new(&book, &config.coefficients).unwrap();
        let backend = select_backend(BackendKind::Parallel);
        let store =
            compute_tile_coefficients(&backend, &dataset, &solver, &dataset.geometry, 0, &config)
                .unwrap();
        let shape = calibrate(&store, &dataset.geometry, 0, &config.spot_shape).unwrap();
        let kernel = shape.kernel().unwrap();

        let detect = |in_flight| {
            score_and_detect(&backend, &store, [10, 10, 1], &kernel, &config.scoring, in_flight)
                .unwrap()
        };
        let all_at_once = detect(64);
        let genes: Vec<usize> = all_at_once.iter().map(|(g, _)| *g).collect();
        assert_eq!(genes, vec![0, 1, 1]);
        assert_eq!(detect(1), all_at_once);
        assert_eq!(detect(0), all_at_once);

        let mut capped = config.clone();
        capped.batching.max_genes_in_flight = Some(1);
        assert_eq!(call(&dataset, &capped).unwrap().spots, call(&dataset, &config).unwrap().spots);
    }

    #[test]
    fn mismatched_norm_factor_is_input_violation() {
        let mut dataset = spot_dataset([6, 6, 1], &[(0, [3, 3, 0], 1.0)]);
        dataset.tiles[0].norm_factor = Some(vec![1.0; 2]);
        let err = call(&dataset, &small_config()).unwrap_err();
        assert!(matches!(err, OmpError::InputViolation { .. }));
    }
}

use serde::{Deserialize, Serialize};

use crate::coefficients::CoefficientStore;
use crate::shape::SpotShape;

/// One gene-labelled point detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedSpot {
    pub tile: usize,
    /// Tile-local position `[y, x, z]`.
    pub yxz: [usize; 3],
    pub gene: usize,
    pub gene_name: String,
    /// Score at the spot, in `[0, 1)`.
    pub score: f32,
    /// Uncorrected colour (`n_rounds * n_channels`, round-major).
    pub colour: Vec<f32>,
}

/// Detections of a run, ordered by tile processing order, then gene, then
/// linear index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpotTable {
    pub spots: Vec<DetectedSpot>,
}

impl SpotTable {
    pub fn len(&self) -> usize {
        self.spots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spots.is_empty()
    }

    /// Detections of one tile.
    pub fn for_tile(&self, tile: usize) -> impl Iterator<Item = &DetectedSpot> + '_ {
        self.spots.iter().filter(move |s| s.tile == tile)
    }

    /// Number of detections per gene.
    pub fn gene_counts(&self, n_genes: usize) -> Vec<usize> {
        let mut counts = vec![0; n_genes];
        for spot in &self.spots {
            if let Some(c) = counts.get_mut(spot.gene) {
                *c += 1;
            }
        }
        counts
    }
}

/// Coefficient store retained for one tile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileCoefficients {
    pub tile: usize,
    pub store: CoefficientStore,
}

/// Output of a full gene-calling run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneCallResult {
    pub spots: SpotTable,
    pub spot_shape: SpotShape,
    /// Per-tile coefficient stores, when `keep_coefficients` is set.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub coefficients: Vec<TileCoefficients>,
}

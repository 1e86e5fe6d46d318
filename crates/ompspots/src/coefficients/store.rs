//! Sparse per-tile coefficient storage.
//!
//! Coefficient subsets are solved independently and each produces a
//! write-once [`CoefficientBatch`]. Only after every subset of a tile has
//! finished are the batches assembled into one [`CoefficientStore`], a
//! compressed row (pixel) by column (gene) matrix with a gene-major index for
//! fast per-gene volume extraction.

use serde::{Deserialize, Serialize};

use crate::error::{OmpError, OmpResult};
use crate::volume::Volume3;

use super::pursuit::PixelFit;

/// Coefficients of a contiguous run of pixels.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoefficientBatch {
    /// Linear index of the first pixel.
    pub start: usize,
    /// One row per pixel: `(gene, coefficient)` pairs sorted by gene.
    pub rows: Vec<Vec<(u32, f32)>>,
}

impl CoefficientBatch {
    /// Collect the non-zero gene coefficients of consecutive pixel fits.
    pub fn from_fits(start: usize, fits: &[PixelFit]) -> Self {
        let rows = fits
            .iter()
            .map(|fit| {
                let mut row: Vec<(u32, f32)> = fit
                    .genes
                    .iter()
                    .filter(|(_, c)| *c != 0.0)
                    .map(|&(g, c)| (g as u32, c))
                    .collect();
                row.sort_by_key(|&(g, _)| g);
                row
            })
            .collect();
        Self { start, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Sparse pixel x gene coefficients of one tile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoefficientStore {
    n_pixels: usize,
    n_genes: usize,
    row_offsets: Vec<usize>,
    row_genes: Vec<u32>,
    row_values: Vec<f32>,
    #[serde(skip)]
    gene_index: GeneIndex,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct GeneIndex {
    offsets: Vec<usize>,
    pixels: Vec<usize>,
    values: Vec<f32>,
}

impl CoefficientStore {
    /// Assemble a tile's store from its batches.
    ///
    /// Every pixel in `0..n_pixels` must be covered by exactly one batch.
    pub fn assemble(
        n_pixels: usize,
        n_genes: usize,
        mut batches: Vec<CoefficientBatch>,
    ) -> OmpResult<Self> {
        let mut coverage = vec![0usize; n_pixels];
        for batch in &batches {
            for pixel in batch.start..batch.start + batch.len() {
                match coverage.get_mut(pixel) {
                    Some(count) => *count += 1,
                    None => {
                        return Err(OmpError::input(format!(
                            "coefficient batch covers pixel {} outside a tile of {} pixels",
                            pixel, n_pixels
                        )))
                    }
                }
            }
        }
        if let Some((pixel, &count)) = coverage.iter().enumerate().find(|&(_, &c)| c != 1) {
            return Err(OmpError::CoverageViolation { pixel, count });
        }

        batches.sort_by_key(|b| b.start);
        let mut row_offsets = Vec::with_capacity(n_pixels + 1);
        let mut row_genes = Vec::new();
        let mut row_values = Vec::new();
        row_offsets.push(0);
        for row in batches.into_iter().flat_map(|b| b.rows) {
            for (g, c) in row {
                if g as usize >= n_genes {
                    return Err(OmpError::input(format!(
                        "coefficient for gene {} but the code book has {} genes",
                        g, n_genes
                    )));
                }
                row_genes.push(g);
                row_values.push(c);
            }
            row_offsets.push(row_genes.len());
        }

        let mut store = Self {
            n_pixels,
            n_genes,
            row_offsets,
            row_genes,
            row_values,
            gene_index: GeneIndex::default(),
        };
        store.gene_index = store.build_gene_index();
        Ok(store)
    }

    fn build_gene_index(&self) -> GeneIndex {
        let mut counts = vec![0usize; self.n_genes + 1];
        for &g in &self.row_genes {
            counts[g as usize + 1] += 1;
        }
        for g in 0..self.n_genes {
            counts[g + 1] += counts[g];
        }
        let offsets = counts.clone();
        let mut cursor = counts;
        let nnz = self.row_genes.len();
        let mut pixels = vec![0usize; nnz];
        let mut values = vec![0.0f32; nnz];
        for pixel in 0..self.n_pixels {
            for k in self.row_offsets[pixel]..self.row_offsets[pixel + 1] {
                let g = self.row_genes[k] as usize;
                pixels[cursor[g]] = pixel;
                values[cursor[g]] = self.row_values[k];
                cursor[g] += 1;
            }
        }
        GeneIndex {
            offsets,
            pixels,
            values,
        }
    }

    pub fn n_pixels(&self) -> usize {
        self.n_pixels
    }

    pub fn n_genes(&self) -> usize {
        self.n_genes
    }

    /// Number of stored non-zero coefficients.
    pub fn nnz(&self) -> usize {
        self.row_genes.len()
    }

    /// Non-zero `(gene, coefficient)` pairs of one pixel.
    pub fn row(&self, pixel: usize) -> impl Iterator<Item = (usize, f32)> + '_ {
        let range = self.row_offsets[pixel]..self.row_offsets[pixel + 1];
        self.row_genes[range.clone()]
            .iter()
            .zip(&self.row_values[range])
            .map(|(&g, &c)| (g as usize, c))
    }

    /// Coefficient of `gene` at `pixel` (zero when not selected).
    pub fn get(&self, pixel: usize, gene: usize) -> f32 {
        self.row(pixel)
            .find(|&(g, _)| g == gene)
            .map_or(0.0, |(_, c)| c)
    }

    /// Largest number of genes assigned to a single pixel.
    pub fn max_genes_per_pixel(&self) -> usize {
        self.row_offsets
            .windows(2)
            .map(|w| w[1] - w[0])
            .max()
            .unwrap_or(0)
    }

    /// Dense coefficient volume of one gene.
    pub fn gene_volume(&self, gene: usize, shape: [usize; 3]) -> OmpResult<Volume3<f32>> {
        if shape[0] * shape[1] * shape[2] != self.n_pixels {
            return Err(OmpError::input(format!(
                "tile shape {:?} does not match a store of {} pixels",
                shape, self.n_pixels
            )));
        }
        if gene >= self.n_genes {
            return Err(OmpError::input(format!(
                "gene {} out of range for {} genes",
                gene, self.n_genes
            )));
        }
        let mut volume = Volume3::zeros(shape);
        let index = &self.gene_index;
        let data = volume.as_mut_slice();
        if index.offsets.len() == self.n_genes + 1 {
            for k in index.offsets[gene]..index.offsets[gene + 1] {
                data[index.pixels[k]] = index.values[k];
            }
        } else {
            // Deserialised store without a gene index.
            for (pixel, value) in data.iter_mut().enumerate() {
                *value = self.get(pixel, gene);
            }
        }
        Ok(volume)
    }

    /// Rebuild the gene-major index after deserialisation.
    pub fn reindex(&mut self) {
        self.gene_index = self.build_gene_index();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(start: usize, rows: Vec<Vec<(u32, f32)>>) -> CoefficientBatch {
        CoefficientBatch { start, rows }
    }

    #[test]
    fn batches_assemble_in_pixel_order() {
        let batches = vec![
            batch(2, vec![vec![(1, 0.5)], vec![]]),
            batch(0, vec![vec![(0, 1.0), (2, 0.25)], vec![]]),
        ];
        let store = CoefficientStore::assemble(4, 3, batches).unwrap();
        assert_eq!(store.nnz(), 3);
        assert_eq!(store.get(0, 0), 1.0);
        assert_eq!(store.get(0, 2), 0.25);
        assert_eq!(store.get(2, 1), 0.5);
        assert_eq!(store.get(3, 1), 0.0);
        assert_eq!(store.max_genes_per_pixel(), 2);
    }

    #[test]
    fn gene_volume_scatters_column() {
        let batches = vec![batch(
            0,
            vec![vec![(1, 2.0)], vec![], vec![(0, 3.0), (1, 4.0)], vec![]],
        )];
        let store = CoefficientStore::assemble(4, 2, batches).unwrap();
        let v = store.gene_volume(1, [2, 2, 1]).unwrap();
        assert_eq!(v.as_slice(), &[2.0, 0.0, 4.0, 0.0]);
        let v0 = store.gene_volume(0, [2, 2, 1]).unwrap();
        assert_eq!(v0.as_slice(), &[0.0, 0.0, 3.0, 0.0]);
        assert!(store.gene_volume(0, [3, 1, 1]).is_err());
    }

    #[test]
    fn missing_pixel_is_coverage_violation() {
        let err = CoefficientStore::assemble(3, 1, vec![batch(0, vec![vec![], vec![]])])
            .unwrap_err();
        assert_eq!(err, OmpError::CoverageViolation { pixel: 2, count: 0 });
    }

    #[test]
    fn overlapping_batches_are_coverage_violation() {
        let err = CoefficientStore::assemble(
            2,
            1,
            vec![batch(0, vec![vec![], vec![]]), batch(1, vec![vec![]])],
        )
        .unwrap_err();
        assert_eq!(err, OmpError::CoverageViolation { pixel: 1, count: 2 });
    }

    #[test]
    fn reindex_restores_gene_volumes_after_json_round_trip() {
        let store =
            CoefficientStore::assemble(2, 1, vec![batch(0, vec![vec![(0, 1.5)], vec![]])])
                .unwrap();
        let json = serde_json::to_string(&store).unwrap();
        let mut back: CoefficientStore = serde_json::from_str(&json).unwrap();
        back.reindex();
        assert_eq!(back.gene_volume(0, [2, 1, 1]).unwrap().as_slice(), &[1.5, 0.0]);
    }
}

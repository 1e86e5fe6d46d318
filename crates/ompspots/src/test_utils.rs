use crate::codebook::CodeBook;
use crate::provider::{InMemoryDataset, TileColours, TileGeometry};

/// Scale a vector to unit L2 norm.
pub(crate) fn normalise(mut v: Vec<f32>) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
    v
}

/// Code book with 3 rounds, 2 channels and two genes that have no
/// dot-product tie against each other's residual.
pub(crate) fn two_gene_codebook() -> CodeBook {
    CodeBook::new(
        3,
        2,
        vec![
            normalise(vec![1.0, 0.0, 0.0, 1.0, 1.0, 0.0]),
            normalise(vec![1.0, 0.0, 1.0, 0.0, 0.0, 1.0]),
        ],
    )
    .expect("valid code book")
}

/// Single-tile dataset over [`two_gene_codebook`] with `spots` placed as
/// `(gene, [y, x, z], amplitude)`; every other pixel is zero.
pub(crate) fn spot_dataset(
    tile_shape: [usize; 3],
    spots: &[(usize, [usize; 3], f32)],
) -> InMemoryDataset {
    let book = two_gene_codebook();
    let (n_r, n_c) = (book.n_rounds(), book.n_channels());
    let n_pixels: usize = tile_shape.iter().product();
    let mut data = vec![0.0f32; n_r * n_pixels * n_c];
    for &(gene, [y, x, z], amplitude) in spots {
        let voxel = (y * tile_shape[1] + x) * tile_shape[2] + z;
        for r in 0..n_r {
            for c in 0..n_c {
                data[(r * n_pixels + voxel) * n_c + c] +=
                    amplitude * book.gene_code(gene)[r * n_c + c];
            }
        }
    }
    InMemoryDataset {
        n_rounds: n_r,
        n_channels: n_c,
        gene_names: vec!["alpha".to_string(), "beta".to_string()],
        gene_codes: (0..book.n_genes()).map(|g| book.gene_code(g).to_vec()).collect(),
        geometry: TileGeometry::new(tile_shape, vec![0]),
        tiles: vec![TileColours {
            tile: 0,
            data,
            norm_factor: None,
        }],
    }
}

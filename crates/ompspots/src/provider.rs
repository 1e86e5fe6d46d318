//! Pixel colour sources and tile geometry.
//!
//! The pipeline never reads raw image files itself. Registered, filtered
//! colours are supplied through [`PixelColourProvider`]; [`InMemoryDataset`]
//! is a dense implementation loaded from JSON for the CLI and tests.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::codebook::CodeBook;
use crate::error::{OmpError, OmpResult};

/// Error returned by a colour provider.
pub type ProviderError = Box<dyn std::error::Error + Send + Sync>;

/// Source of registered pixel colours.
pub trait PixelColourProvider {
    /// Colours of one round at `positions` (`[y, x, z]`, tile-local).
    ///
    /// Returns `positions.len() * n_channels` values, position-major. Positions
    /// outside the tile yield zeros.
    fn get_colours(
        &self,
        tile: usize,
        round: usize,
        positions: &[[isize; 3]],
    ) -> Result<Vec<f32>, ProviderError>;

    /// Per-tile multiplicative factor of length `n_rounds * n_channels`.
    fn colour_norm_factor(&self, _tile: usize) -> Option<Vec<f32>> {
        None
    }
}

/// Tile layout of a dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileGeometry {
    /// Shape `[ny, nx, nz]` shared by every tile.
    pub tile_shape: [usize; 3],
    /// Tiles to process, in processing order.
    pub tiles: Vec<usize>,
    /// Tile used for spot-shape calibration; the first tile when unset.
    #[serde(default)]
    pub calibration_tile: Option<usize>,
    /// Pixel size in y/x (microns).
    #[serde(default = "default_pixel_size")]
    pub pixel_size_xy: f32,
    /// Z-plane spacing (microns).
    #[serde(default = "default_pixel_size")]
    pub pixel_size_z: f32,
}

fn default_pixel_size() -> f32 {
    1.0
}

impl TileGeometry {
    pub fn new(tile_shape: [usize; 3], tiles: Vec<usize>) -> Self {
        Self {
            tile_shape,
            tiles,
            calibration_tile: None,
            pixel_size_xy: 1.0,
            pixel_size_z: 1.0,
        }
    }

    pub fn n_pixels(&self) -> usize {
        self.tile_shape.iter().product()
    }

    /// Calibration tile, falling back to the first processed tile.
    pub fn calibration_tile(&self) -> Option<usize> {
        self.calibration_tile.or_else(|| self.tiles.first().copied())
    }

    /// Tiles in processing order: calibration tile first, the rest as listed.
    pub fn processing_order(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.tiles.len());
        if let Some(cal) = self.calibration_tile() {
            order.push(cal);
        }
        order.extend(self.tiles.iter().copied().filter(|&t| Some(t) != self.calibration_tile()));
        order
    }

    pub fn validate(&self) -> OmpResult<()> {
        if self.tile_shape.contains(&0) {
            return Err(OmpError::input(format!(
                "tile shape {:?} has an empty axis",
                self.tile_shape
            )));
        }
        if self.tiles.is_empty() {
            return Err(OmpError::input("no tiles to process"));
        }
        for (i, tile) in self.tiles.iter().enumerate() {
            if self.tiles[..i].contains(tile) {
                return Err(OmpError::input(format!("tile {} is listed twice", tile)));
            }
        }
        if let Some(cal) = self.calibration_tile {
            if !self.tiles.contains(&cal) {
                return Err(OmpError::input(format!(
                    "calibration tile {} is not among the processed tiles {:?}",
                    cal, self.tiles
                )));
            }
        }
        if self.pixel_size_xy.is_nan() || self.pixel_size_xy <= 0.0 {
            return Err(OmpError::input("pixel_size_xy must be > 0"));
        }
        if self.pixel_size_z.is_nan() || self.pixel_size_z <= 0.0 {
            return Err(OmpError::input("pixel_size_z must be > 0"));
        }
        Ok(())
    }
}

/// Dense colours of one tile, laid out `[round][y][x][z][channel]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileColours {
    pub tile: usize,
    pub data: Vec<f32>,
    /// Optional colour normalisation factor (`n_rounds * n_channels`).
    #[serde(default)]
    pub norm_factor: Option<Vec<f32>>,
}

/// A whole dataset held in memory: code book, geometry and colours.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InMemoryDataset {
    pub n_rounds: usize,
    pub n_channels: usize,
    /// Gene names; `gene_<g>` when empty.
    #[serde(default)]
    pub gene_names: Vec<String>,
    /// Bled codes, one `n_rounds * n_channels` vector per gene. Normalised on load.
    pub gene_codes: Vec<Vec<f32>>,
    pub geometry: TileGeometry,
    pub tiles: Vec<TileColours>,
}

impl InMemoryDataset {
    /// Load and validate a dataset from a JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let data = std::fs::read_to_string(path)?;
        let dataset: Self = serde_json::from_str(&data)?;
        dataset.validate()?;
        Ok(dataset)
    }

    /// Normalised code book of the dataset.
    pub fn codebook(&self) -> OmpResult<CodeBook> {
        let book = CodeBook::normalised(self.n_rounds, self.n_channels, self.gene_codes.clone())?;
        if self.gene_names.is_empty() {
            Ok(book)
        } else {
            book.with_gene_names(self.gene_names.clone())
        }
    }

    pub fn validate(&self) -> OmpResult<()> {
        self.geometry.validate()?;
        let n_rc = self.n_rounds * self.n_channels;
        let expected = self.n_rounds * self.geometry.n_pixels() * self.n_channels;
        for &tile in &self.geometry.tiles {
            let colours = self.tile(tile).ok_or_else(|| {
                OmpError::input(format!("dataset has no colours for tile {}", tile))
            })?;
            if colours.data.len() != expected {
                return Err(OmpError::input(format!(
                    "tile {} has {} colour values, expected {}",
                    tile,
                    colours.data.len(),
                    expected
                )));
            }
            if let Some(norm) = &colours.norm_factor {
                if norm.len() != n_rc {
                    return Err(OmpError::input(format!(
                        "tile {} colour norm factor has length {}, expected {}",
                        tile,
                        norm.len(),
                        n_rc
                    )));
                }
            }
        }
        Ok(())
    }

    fn tile(&self, tile: usize) -> Option<&TileColours> {
        self.tiles.iter().find(|t| t.tile == tile)
    }
}

impl PixelColourProvider for InMemoryDataset {
    fn get_colours(
        &self,
        tile: usize,
        round: usize,
        positions: &[[isize; 3]],
    ) -> Result<Vec<f32>, ProviderError> {
        let colours = self
            .tile(tile)
            .ok_or_else(|| format!("no colours for tile {}", tile))?;
        if round >= self.n_rounds {
            return Err(format!("round {} out of range for {} rounds", round, self.n_rounds).into());
        }
        let [ny, nx, nz] = self.geometry.tile_shape;
        let n_c = self.n_channels;
        let round_offset = round * ny * nx * nz * n_c;
        let mut out = vec![0.0f32; positions.len() * n_c];
        for (i, &[y, x, z]) in positions.iter().enumerate() {
            if y < 0 || x < 0 || z < 0 || y >= ny as isize || x >= nx as isize || z >= nz as isize
            {
                continue;
            }
            let voxel = (y as usize * nx + x as usize) * nz + z as usize;
            let src = round_offset + voxel * n_c;
            out[i * n_c..(i + 1) * n_c].copy_from_slice(&colours.data[src..src + n_c]);
        }
        Ok(out)
    }

    fn colour_norm_factor(&self, tile: usize) -> Option<Vec<f32>> {
        self.tile(tile).and_then(|t| t.norm_factor.clone())
    }
}

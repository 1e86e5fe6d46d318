//! Gene and background spectral signatures.
//!
//! Every code is a vector of length `n_rounds * n_channels` laid out
//! round-major (`index = r * n_channels + c`) with unit L2 norm, so that dot
//! products against a residual are directly comparable across genes.

use serde::{Deserialize, Serialize};

use crate::error::{OmpError, OmpResult};

/// Maximum deviation of a code's L2 norm from 1.
pub const UNIT_NORM_TOLERANCE: f32 = 1e-5;

/// Normalised gene codes plus one background code per channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeBook {
    n_rounds: usize,
    n_channels: usize,
    gene_names: Vec<String>,
    gene_codes: Vec<f32>,
    background_codes: Vec<f32>,
}

impl CodeBook {
    /// Build a code book from already-normalised gene codes.
    ///
    /// Fails with [`OmpError::InputViolation`] if any code has the wrong
    /// length, contains NaN, or is not unit norm.
    pub fn new(n_rounds: usize, n_channels: usize, codes: Vec<Vec<f32>>) -> OmpResult<Self> {
        if n_rounds == 0 || n_channels == 0 {
            return Err(OmpError::input(format!(
                "code book needs at least one round and channel, got {}x{}",
                n_rounds, n_channels
            )));
        }
        let n_rc = n_rounds * n_channels;
        let mut gene_codes = Vec::with_capacity(codes.len() * n_rc);
        for (g, code) in codes.iter().enumerate() {
            if code.len() != n_rc {
                return Err(OmpError::input(format!(
                    "gene {} code has length {}, expected {} ({} rounds x {} channels)",
                    g,
                    code.len(),
                    n_rc,
                    n_rounds,
                    n_channels
                )));
            }
            gene_codes.extend_from_slice(code);
        }
        let gene_names = (0..codes.len()).map(|g| format!("gene_{}", g)).collect();
        let book = Self {
            n_rounds,
            n_channels,
            gene_names,
            gene_codes,
            background_codes: background_codes(n_rounds, n_channels),
        };
        book.validate()?;
        Ok(book)
    }

    /// Normalise raw (bled) codes to unit L2 norm, then build the code book.
    ///
    /// An all-zero code cannot be normalised and is rejected.
    pub fn normalised(
        n_rounds: usize,
        n_channels: usize,
        mut codes: Vec<Vec<f32>>,
    ) -> OmpResult<Self> {
        for (g, code) in codes.iter_mut().enumerate() {
            let norm = l2_norm(code);
            if norm.is_nan() || norm <= 0.0 {
                return Err(OmpError::input(format!(
                    "gene {} code has norm {} and cannot be normalised",
                    g, norm
                )));
            }
            code.iter_mut().for_each(|v| *v /= norm);
        }
        Self::new(n_rounds, n_channels, codes)
    }

    /// Attach gene names (one per gene).
    pub fn with_gene_names(mut self, names: Vec<String>) -> OmpResult<Self> {
        if names.len() != self.n_genes() {
            return Err(OmpError::input(format!(
                "{} gene names given for {} genes",
                names.len(),
                self.n_genes()
            )));
        }
        self.gene_names = names;
        Ok(self)
    }

    /// Check that every gene and background code is NaN free and unit norm.
    pub fn validate(&self) -> OmpResult<()> {
        let n_rc = self.n_rounds_channels();
        let codes = self
            .gene_codes
            .chunks(n_rc)
            .enumerate()
            .map(|(g, c)| (format!("gene {}", g), c))
            .chain(
                self.background_codes
                    .chunks(n_rc)
                    .enumerate()
                    .map(|(c, code)| (format!("background channel {}", c), code)),
            );
        for (label, code) in codes {
            if code.iter().any(|v| v.is_nan()) {
                return Err(OmpError::input(format!("{} code contains NaN", label)));
            }
            let norm = l2_norm(code);
            if (norm - 1.0).abs() > UNIT_NORM_TOLERANCE {
                return Err(OmpError::input(format!(
                    "{} code must be L2 normalised, norm is {}",
                    label, norm
                )));
            }
        }
        Ok(())
    }

    pub fn n_rounds(&self) -> usize {
        self.n_rounds
    }

    pub fn n_channels(&self) -> usize {
        self.n_channels
    }

    /// Length of every code vector.
    pub fn n_rounds_channels(&self) -> usize {
        self.n_rounds * self.n_channels
    }

    pub fn n_genes(&self) -> usize {
        self.gene_names.len()
    }

    pub fn gene_names(&self) -> &[String] {
        &self.gene_names
    }

    /// Normalised code of gene `g`.
    pub fn gene_code(&self, g: usize) -> &[f32] {
        let n_rc = self.n_rounds_channels();
        &self.gene_codes[g * n_rc..(g + 1) * n_rc]
    }

    /// Background code of channel `c`.
    pub fn background_code(&self, c: usize) -> &[f32] {
        let n_rc = self.n_rounds_channels();
        &self.background_codes[c * n_rc..(c + 1) * n_rc]
    }
}

/// One unit-norm code per channel, uniform across rounds in that channel.
pub fn background_codes(n_rounds: usize, n_channels: usize) -> Vec<f32> {
    let n_rc = n_rounds * n_channels;
    let value = 1.0 / (n_rounds as f32).sqrt();
    let mut codes = vec![0.0f32; n_channels * n_rc];
    for c in 0..n_channels {
        for r in 0..n_rounds {
            codes[c * n_rc + r * n_channels + c] = value;
        }
    }
    codes
}

fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn background_codes_are_unit_norm_and_channel_local() {
        let (n_rounds, n_channels) = (3, 4);
        let codes = background_codes(n_rounds, n_channels);
        let n_rc = n_rounds * n_channels;
        for c in 0..n_channels {
            let code = &codes[c * n_rc..(c + 1) * n_rc];
            assert!((l2_norm(code) - 1.0).abs() < 1e-5);
            for (i, &v) in code.iter().enumerate() {
                if i % n_channels == c {
                    assert!(v > 0.0);
                } else {
                    assert_eq!(v, 0.0);
                }
            }
        }
    }

    #[test]
    fn normalised_codes_pass_validation() {
        let book = CodeBook::normalised(
            3,
            2,
            vec![
                vec![1.0, 0.0, 0.0, 1.0, 1.0, 0.0],
                vec![0.0, 2.0, 2.0, 0.0, 0.0, 2.0],
            ],
        )
        .unwrap();
        for g in 0..book.n_genes() {
            assert!((l2_norm(book.gene_code(g)) - 1.0).abs() < UNIT_NORM_TOLERANCE);
        }
        for c in 0..book.n_channels() {
            assert!((l2_norm(book.background_code(c)) - 1.0).abs() < UNIT_NORM_TOLERANCE);
        }
    }

    #[test]
    fn non_unit_code_is_rejected() {
        let err = CodeBook::new(1, 2, vec![vec![1.0, 1.0]]).unwrap_err();
        assert!(matches!(err, OmpError::InputViolation { .. }));
    }

    #[test]
    fn nan_code_is_rejected() {
        let err = CodeBook::new(1, 2, vec![vec![f32::NAN, 1.0]]).unwrap_err();
        assert!(err.to_string().contains("NaN"), "{}", err);
    }

    #[test]
    fn wrong_length_is_rejected() {
        assert!(CodeBook::new(2, 2, vec![vec![1.0, 0.0, 0.0]]).is_err());
    }

    #[test]
    fn zero_code_cannot_be_normalised() {
        assert!(CodeBook::normalised(1, 2, vec![vec![0.0, 0.0]]).is_err());
    }
}

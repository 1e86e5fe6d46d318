//! Error type shared by every stage of the gene-calling pipeline.

/// Fatal conditions that abort a run.
#[derive(Debug, Clone, PartialEq)]
pub enum OmpError {
    /// Malformed input: non-unit or NaN codes, shape mismatches, bad parameters.
    InputViolation {
        /// Human-readable description of the offending input.
        context: String,
    },
    /// Spot-shape calibration produced an unusable template.
    CalibrationFailure {
        /// Calibration tile.
        tile: usize,
        /// Why the template was rejected.
        reason: String,
    },
    /// A processed tile produced no spots at all.
    TileYieldFailure {
        /// Offending tile.
        tile: usize,
    },
    /// The pixel colour provider failed.
    Provider {
        /// Tile being loaded.
        tile: usize,
        /// Round being loaded.
        round: usize,
        /// Provider message.
        message: String,
    },
    /// A pixel of a coefficient store was computed zero or several times.
    CoverageViolation {
        /// First offending pixel (linear index).
        pixel: usize,
        /// Number of batches that covered it.
        count: usize,
    },
}

impl OmpError {
    pub(crate) fn input(context: impl Into<String>) -> Self {
        Self::InputViolation {
            context: context.into(),
        }
    }
}

impl std::fmt::Display for OmpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InputViolation { context } => write!(f, "input violation: {}", context),
            Self::CalibrationFailure { tile, reason } => {
                write!(f, "spot shape calibration failed on tile {}: {}", tile, reason)
            }
            Self::TileYieldFailure { tile } => write!(
                f,
                "no OMP spots found on tile {}; check registration and reference spot calling, \
                 or adjust the OMP configuration",
                tile
            ),
            Self::Provider {
                tile,
                round,
                message,
            } => write!(
                f,
                "pixel colour provider failed for tile {} round {}: {}",
                tile, round, message
            ),
            Self::CoverageViolation { pixel, count } => write!(
                f,
                "pixel {} was covered by {} coefficient batches (expected exactly 1)",
                pixel, count
            ),
        }
    }
}

impl std::error::Error for OmpError {}

/// Result alias used throughout the crate.
pub type OmpResult<T> = Result<T, OmpError>;

//! Dense y/x/z volumes.
//!
//! Voxels are stored row-major with z fastest: the linear index of `[y, x, z]`
//! is `(y * nx + x) * nz + z`. This matches the pixel ordering of the
//! coefficient store, so a gene's column can be reshaped into a volume
//! without permutation.

use serde::{Deserialize, Serialize};

/// A dense 3-D array in y/x/z order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volume3<T> {
    shape: [usize; 3],
    data: Vec<T>,
}

impl<T: Copy + Default> Volume3<T> {
    /// Volume of the given shape filled with `T::default()`.
    pub fn zeros(shape: [usize; 3]) -> Self {
        Self {
            shape,
            data: vec![T::default(); shape[0] * shape[1] * shape[2]],
        }
    }
}

impl<T: Copy> Volume3<T> {
    /// Wrap an existing buffer. Returns `None` when the length does not match.
    pub fn from_vec(shape: [usize; 3], data: Vec<T>) -> Option<Self> {
        (data.len() == shape[0] * shape[1] * shape[2]).then_some(Self { shape, data })
    }

    /// Build a volume by evaluating `f` at every `[y, x, z]`.
    pub fn from_fn(shape: [usize; 3], mut f: impl FnMut([usize; 3]) -> T) -> Self {
        let mut data = Vec::with_capacity(shape[0] * shape[1] * shape[2]);
        for y in 0..shape[0] {
            for x in 0..shape[1] {
                for z in 0..shape[2] {
                    data.push(f([y, x, z]));
                }
            }
        }
        Self { shape, data }
    }

    /// Shape `[ny, nx, nz]`.
    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    /// Number of voxels.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Linear index of `[y, x, z]`.
    #[inline]
    pub fn index(&self, yxz: [usize; 3]) -> usize {
        linear_index(self.shape, yxz)
    }

    /// Inverse of [`Volume3::index`].
    #[inline]
    pub fn position(&self, index: usize) -> [usize; 3] {
        position_of(self.shape, index)
    }

    #[inline]
    pub fn get(&self, yxz: [usize; 3]) -> T {
        self.data[self.index(yxz)]
    }

    /// Value at a signed position, or `None` outside the volume.
    #[inline]
    pub fn get_signed(&self, yxz: [isize; 3]) -> Option<T> {
        let in_bounds = yxz
            .iter()
            .zip(self.shape.iter())
            .all(|(&p, &n)| p >= 0 && (p as usize) < n);
        in_bounds.then(|| self.get([yxz[0] as usize, yxz[1] as usize, yxz[2] as usize]))
    }

    #[inline]
    pub fn set(&mut self, yxz: [usize; 3], value: T) {
        let i = self.index(yxz);
        self.data[i] = value;
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<T> {
        self.data
    }

    /// Apply `f` to every voxel, producing a new volume of the same shape.
    pub fn map<U: Copy>(&self, f: impl Fn(T) -> U) -> Volume3<U> {
        Volume3 {
            shape: self.shape,
            data: self.data.iter().map(|&v| f(v)).collect(),
        }
    }
}

/// Linear index of `[y, x, z]` in a volume of `shape`.
#[inline]
pub fn linear_index(shape: [usize; 3], yxz: [usize; 3]) -> usize {
    (yxz[0] * shape[1] + yxz[1]) * shape[2] + yxz[2]
}

/// Position of a linear index in a volume of `shape`.
#[inline]
pub fn position_of(shape: [usize; 3], index: usize) -> [usize; 3] {
    let z = index % shape[2];
    let yx = index / shape[2];
    [yx / shape[1], yx % shape[1], z]
}

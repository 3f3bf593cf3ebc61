//! Launch geometry and problem descriptions shared by host and device code.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Two-dimensional extent of either a grid of tile groups or one tile group.
///
/// `x` counts columns and `y` counts rows. Both components must be at least 1
/// for the extent to be launchable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dimension {
    pub x: u32,
    pub y: u32,
}

impl Dimension {
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }

    pub const fn single() -> Self {
        Self { x: 1, y: 1 }
    }

    pub fn is_valid(&self) -> bool {
        self.x >= 1 && self.y >= 1
    }

    /// Number of cells covered by this extent.
    pub fn area(&self) -> usize {
        self.x as usize * self.y as usize
    }

    /// True when `self` fits inside `outer` without rotation.
    pub fn fits_within(&self, outer: Dimension) -> bool {
        self.x <= outer.x && self.y <= outer.y
    }

    /// Row-major iteration over every coordinate inside this extent.
    pub fn coords(&self) -> impl Iterator<Item = TileCoord> {
        let Dimension { x: width, y: height } = *self;
        (0..height).flat_map(move |y| (0..width).map(move |x| TileCoord::new(x, y)))
    }
}

impl Default for Dimension {
    fn default() -> Self {
        Self::single()
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.x, self.y)
    }
}

/// Position of a tile inside its tile group, or of a tile group inside the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileCoord {
    pub x: u32,
    pub y: u32,
}

impl TileCoord {
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }

    /// Row-major linear index of this coordinate within `extent`.
    pub fn linear(&self, extent: Dimension) -> usize {
        self.y as usize * extent.x as usize + self.x as usize
    }
}

impl fmt::Display for TileCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Dense row-major `lhs (m x k) * rhs (k x n) = out (m x n)` problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MatmulProblem {
    pub m: usize,
    pub n: usize,
    pub k: usize,
}

impl MatmulProblem {
    pub fn new(m: usize, n: usize, k: usize) -> Self {
        Self { m, n, k }
    }

    pub fn square(size: usize) -> Self {
        Self::new(size, size, size)
    }

    pub fn flops(&self) -> f64 {
        2.0 * self.m as f64 * self.n as f64 * self.k as f64
    }

    pub fn lhs_len(&self) -> usize {
        self.m * self.k
    }

    pub fn rhs_len(&self) -> usize {
        self.k * self.n
    }

    pub fn out_len(&self) -> usize {
        self.m * self.n
    }

    pub fn data_footprint_bytes(&self) -> usize {
        (self.lhs_len() + self.rhs_len() + self.out_len()) * std::mem::size_of::<f32>()
    }
}

/// The two device-kernel argument conventions for the same matmul.
///
/// They partition output elements differently and are mutually exclusive
/// launch configurations: pick one per launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatmulVariant {
    /// `kernel_matrix_mul(A, B, C, M, N, P, block_size_y, block_size_x)`:
    /// every tile group owns a rectangle of the output.
    BlockTiled,
    /// `kernel_matrix_mult_4x4(A, B, C, N, block_size)`: every tile group owns
    /// a contiguous run of linear output indices, dealt round-robin to tiles.
    #[default]
    LinearIndex,
}

impl MatmulVariant {
    pub fn entry_point(&self) -> &'static str {
        match self {
            MatmulVariant::BlockTiled => crate::matmul::BLOCK_TILED_SYMBOL,
            MatmulVariant::LinearIndex => crate::matmul::LINEAR_INDEX_SYMBOL,
        }
    }

    /// Number of 32-bit argument words the entry point expects.
    pub fn arity(&self) -> usize {
        match self {
            MatmulVariant::BlockTiled => 8,
            MatmulVariant::LinearIndex => 5,
        }
    }
}

impl fmt::Display for MatmulVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatmulVariant::BlockTiled => write!(f, "block-tiled"),
            MatmulVariant::LinearIndex => write!(f, "linear-index"),
        }
    }
}

impl std::str::FromStr for MatmulVariant {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "block-tiled" | "block" => Ok(MatmulVariant::BlockTiled),
            "linear-index" | "linear" => Ok(MatmulVariant::LinearIndex),
            other => Err(format!(
                "unknown matmul variant `{other}` (expected `block-tiled` or `linear-index`)"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coords_are_row_major() {
        let dim = Dimension::new(3, 2);
        let coords: Vec<_> = dim.coords().collect();
        assert_eq!(coords.len(), 6);
        assert_eq!(coords[0], TileCoord::new(0, 0));
        assert_eq!(coords[2], TileCoord::new(2, 0));
        assert_eq!(coords[3], TileCoord::new(0, 1));
        assert_eq!(coords[4].linear(dim), 4);
    }

    #[test]
    fn zero_extent_is_invalid() {
        assert!(Dimension::new(1, 1).is_valid());
        assert!(!Dimension::new(0, 4).is_valid());
        assert!(!Dimension::new(4, 0).is_valid());
    }

    #[test]
    fn variant_metadata_matches_entry_points() {
        assert_eq!(MatmulVariant::BlockTiled.entry_point(), "kernel_matrix_mul");
        assert_eq!(MatmulVariant::BlockTiled.arity(), 8);
        assert_eq!(MatmulVariant::LinearIndex.entry_point(), "kernel_matrix_mult_4x4");
        assert_eq!(MatmulVariant::LinearIndex.arity(), 5);
    }

    #[test]
    fn variant_parses_from_its_display_name() {
        for variant in [MatmulVariant::BlockTiled, MatmulVariant::LinearIndex] {
            assert_eq!(variant.to_string().parse::<MatmulVariant>().unwrap(), variant);
        }
        assert_eq!(" Linear ".parse::<MatmulVariant>().unwrap(), MatmulVariant::LinearIndex);
        assert!("diagonal".parse::<MatmulVariant>().is_err());
    }

    #[test]
    fn problem_footprint_counts_all_three_matrices() {
        let problem = MatmulProblem::square(4);
        assert_eq!(problem.data_footprint_bytes(), 3 * 16 * 4);
        assert_eq!(problem.flops(), 128.0);
    }
}

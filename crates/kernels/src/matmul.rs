//! Matrix multiplication kernels.
//!
//! Two device entry points implement the same operation with different
//! argument conventions and work partitioning, plus a host reference used
//! for validation and CPU fallback.

use crate::config::MatmulProblem;
use crate::memory::{element_address, DeviceMemory, KernelArgs};
use crate::tile::TileContext;
use crate::utils::validate_matmul_inputs;
use anyhow::{ensure, Context, Result};
use ndarray::{Array2, ArrayView2};
use std::sync::Arc;

pub const BLOCK_TILED_SYMBOL: &str = "kernel_matrix_mul";
pub const LINEAR_INDEX_SYMBOL: &str = "kernel_matrix_mult_4x4";

/// A device entry point executed by every tile of every launched tile group.
///
/// The argument words are trusted: their count and meaning are a contract
/// with the host that marshaled them and are not checked against a signature.
pub trait TileKernel: Send + Sync {
    fn symbol(&self) -> &'static str;
    fn run(&self, tile: &TileContext<'_>, args: KernelArgs<'_>) -> Result<()>;
}

pub type DynTileKernel = Arc<dyn TileKernel>;

/// `kernel_matrix_mul(A, B, C, M, N, P, block_size_y, block_size_x)`.
///
/// Tile group `(gx, gy)` owns output rows `[gy*bsy, gy*bsy + bsy)` and columns
/// `[gx*bsx, gx*bsx + bsx)`, clipped to the `M x P` output. Tiles stride that
/// rectangle by the tile-group shape so no element is written twice.
#[derive(Debug, Default)]
pub struct BlockTiledMatmul;

impl BlockTiledMatmul {
    pub fn new() -> Self {
        Self
    }

    fn compute(&self, tile: &TileContext<'_>, args: &KernelArgs<'_>) -> Result<()> {
        let lhs = args.address(0)?;
        let rhs = args.address(1)?;
        let out = args.address(2)?;
        let m = args.scalar(3)?;
        let n = args.scalar(4)?;
        let p = args.scalar(5)?;
        let block_y = args.scalar(6)?;
        let block_x = args.scalar(7)?;
        ensure!(block_y > 0 && block_x > 0, "block sizes must be non-zero");

        let start_y = tile.group_id.y as usize * block_y;
        let start_x = tile.group_id.x as usize * block_x;
        let end_y = (start_y + block_y).min(m);
        let end_x = (start_x + block_x).min(p);

        for row in (start_y + tile.tile.y as usize..end_y).step_by(tile.group_dim.y as usize) {
            for col in (start_x + tile.tile.x as usize..end_x).step_by(tile.group_dim.x as usize) {
                let sum = dot(tile.memory, lhs, rhs, row, col, n, p)?;
                tile.memory.store_f32(element_address(out, row * p + col)?, sum)?;
            }
        }
        Ok(())
    }
}

impl TileKernel for BlockTiledMatmul {
    fn symbol(&self) -> &'static str {
        BLOCK_TILED_SYMBOL
    }

    fn run(&self, tile: &TileContext<'_>, args: KernelArgs<'_>) -> Result<()> {
        let outcome = self.compute(tile, &args);
        // Every tile reaches the barrier, even after a failed compute.
        tile.sync()?;
        outcome.with_context(|| format!("{} on tile {}", BLOCK_TILED_SYMBOL, tile.tile))
    }
}

/// `kernel_matrix_mult_4x4(A, B, C, N, block_size)` for square `N x N` inputs.
///
/// Tile group `g` (row-major in the grid) owns linear output indices
/// `[g*block_size, (g+1)*block_size)`; the tile with linear id `t` computes
/// indices `t, t+T, t+2T, ...` where `T` is the number of tiles in the group.
#[derive(Debug, Default)]
pub struct LinearIndexMatmul;

impl LinearIndexMatmul {
    pub fn new() -> Self {
        Self
    }

    fn compute(&self, tile: &TileContext<'_>, args: &KernelArgs<'_>) -> Result<()> {
        let lhs = args.address(0)?;
        let rhs = args.address(1)?;
        let out = args.address(2)?;
        let n = args.scalar(3)?;
        let block_size = args.scalar(4)?;
        ensure!(n > 0, "matrix dimension must be non-zero");

        let start = block_size * tile.group_linear_id();
        let total = n * n;

        for element in (tile.tile_id()..block_size).step_by(tile.tiles_per_group()) {
            let index = start + element;
            if index >= total {
                break;
            }
            let (row, col) = (index / n, index % n);
            let sum = dot(tile.memory, lhs, rhs, row, col, n, n)?;
            tile.memory.store_f32(element_address(out, index)?, sum)?;
        }
        Ok(())
    }
}

impl TileKernel for LinearIndexMatmul {
    fn symbol(&self) -> &'static str {
        LINEAR_INDEX_SYMBOL
    }

    fn run(&self, tile: &TileContext<'_>, args: KernelArgs<'_>) -> Result<()> {
        let outcome = self.compute(tile, &args);
        tile.sync()?;
        outcome.with_context(|| format!("{} on tile {}", LINEAR_INDEX_SYMBOL, tile.tile))
    }
}

/// Dot product of row `row` of `lhs` (row length `inner`) with column `col`
/// of `rhs` (row length `cols`), accumulated in index order.
fn dot(
    memory: &dyn DeviceMemory,
    lhs: u32,
    rhs: u32,
    row: usize,
    col: usize,
    inner: usize,
    cols: usize,
) -> Result<f32> {
    let mut sum = 0.0f32;
    for k in 0..inner {
        let a = memory.load_f32(element_address(lhs, row * inner + k)?)?;
        let b = memory.load_f32(element_address(rhs, k * cols + col)?)?;
        sum += a * b;
    }
    Ok(sum)
}

/// Host reference: `lhs * rhs` for row-major slices shaped by `problem`.
pub fn reference_matmul(problem: &MatmulProblem, lhs: &[f32], rhs: &[f32]) -> Result<Array2<f32>> {
    let lhs = ArrayView2::from_shape((problem.m, problem.k), lhs).context("lhs shape")?;
    let rhs = ArrayView2::from_shape((problem.k, problem.n), rhs).context("rhs shape")?;
    validate_matmul_inputs(&lhs, &rhs)?;
    Ok(lhs.dot(&rhs))
}

/// Naive triple-loop product accumulated in the same order as the device
/// kernels, so results agree bit for bit.
pub fn naive_matmul(problem: &MatmulProblem, lhs: &[f32], rhs: &[f32]) -> Result<Vec<f32>> {
    ensure!(lhs.len() == problem.lhs_len(), "lhs holds {} elements, expected {}", lhs.len(), problem.lhs_len());
    ensure!(rhs.len() == problem.rhs_len(), "rhs holds {} elements, expected {}", rhs.len(), problem.rhs_len());

    let mut out = vec![0.0f32; problem.out_len()];
    for i in 0..problem.m {
        for j in 0..problem.n {
            let mut sum = 0.0f32;
            for k in 0..problem.k {
                sum += lhs[i * problem.k + k] * rhs[k * problem.n + j];
            }
            out[i * problem.n + j] = sum;
        }
    }
    Ok(out)
}

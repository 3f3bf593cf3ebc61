//! Launch planning for the matmul entry points.

use crate::handle::BufferHandle;
use crate::launch::LaunchDescriptor;
use anyhow::{ensure, Context, Result};
use manycore_kernels::config::{Dimension, MatmulProblem, MatmulVariant};
use serde::{Deserialize, Serialize};

/// Geometry of a planned matmul launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatmulLaunchPlan {
    pub variant: MatmulVariant,
    pub problem: MatmulProblem,
    pub grid: Dimension,
    pub tile_group: Dimension,
    /// Output rectangle per tile group (block-tiled).
    pub block: Dimension,
    /// Linear output indices per tile group (linear-index).
    pub block_size: u32,
}

impl MatmulLaunchPlan {
    /// Builds the launch with arguments in the entry point's parameter order.
    pub fn descriptor(&self, lhs: &BufferHandle, rhs: &BufferHandle, out: &BufferHandle) -> Result<LaunchDescriptor> {
        let builder = LaunchDescriptor::builder(self.variant.entry_point())
            .grid(self.grid)
            .tile_group(self.tile_group)
            .arity(self.variant.arity())
            .buffer(lhs)
            .buffer(rhs)
            .buffer(out);

        let builder = match self.variant {
            MatmulVariant::BlockTiled => builder
                .scalar(to_word(self.problem.m, "m")?)
                .scalar(to_word(self.problem.k, "k")?)
                .scalar(to_word(self.problem.n, "n")?)
                .scalar(self.block.y)
                .scalar(self.block.x),
            MatmulVariant::LinearIndex => builder
                .scalar(to_word(self.problem.n, "n")?)
                .scalar(self.block_size),
        };
        Ok(builder.build())
    }
}

/// Chooses grid and block geometry for a matmul problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchPlanner {
    pub tile_group: Dimension,
    /// Output rectangle handled by one tile group in the block-tiled variant.
    pub block: Dimension,
    /// Tile groups the linear-index variant splits the output across.
    pub linear_groups: u32,
}

impl LaunchPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tile_group(mut self, tile_group: Dimension) -> Self {
        self.tile_group = tile_group;
        self
    }

    pub fn with_block(mut self, block: Dimension) -> Self {
        self.block = block;
        self
    }

    pub fn with_linear_groups(mut self, groups: u32) -> Self {
        self.linear_groups = groups;
        self
    }

    pub fn plan_matmul(&self, variant: MatmulVariant, problem: MatmulProblem) -> Result<MatmulLaunchPlan> {
        ensure!(
            problem.m > 0 && problem.n > 0 && problem.k > 0,
            "matmul dimensions must be non-zero, got {}x{}x{}",
            problem.m,
            problem.n,
            problem.k
        );
        ensure!(self.tile_group.is_valid(), "tile group {} has a zero component", self.tile_group);

        match variant {
            MatmulVariant::BlockTiled => {
                ensure!(self.block.is_valid(), "block {} has a zero component", self.block);
                let cols = to_word(problem.n, "n")?;
                let rows = to_word(problem.m, "m")?;
                to_word(problem.k, "k")?;
                Ok(MatmulLaunchPlan {
                    variant,
                    problem,
                    grid: Dimension::new(cols.div_ceil(self.block.x), rows.div_ceil(self.block.y)),
                    tile_group: self.tile_group,
                    block: self.block,
                    block_size: self.block.y * self.block.x,
                })
            }
            MatmulVariant::LinearIndex => {
                ensure!(
                    problem.m == problem.n && problem.n == problem.k,
                    "{} requires square inputs, got {}x{}x{}",
                    variant,
                    problem.m,
                    problem.n,
                    problem.k
                );
                ensure!(self.linear_groups > 0, "linear-index launch needs at least one tile group");
                let total = problem
                    .n
                    .checked_mul(problem.n)
                    .context("output element count overflows")?;
                let total = to_word(total, "n*n")?;
                let groups = self.linear_groups.min(total);
                Ok(MatmulLaunchPlan {
                    variant,
                    problem,
                    grid: Dimension::new(groups, 1),
                    tile_group: self.tile_group,
                    block: self.block,
                    block_size: total.div_ceil(groups),
                })
            }
        }
    }
}

impl Default for LaunchPlanner {
    fn default() -> Self {
        Self {
            tile_group: Dimension::new(2, 2),
            block: Dimension::new(4, 4),
            linear_groups: 1,
        }
    }
}

fn to_word(value: usize, name: &str) -> Result<u32> {
    u32::try_from(value).with_context(|| format!("{name} = {value} does not fit a 32-bit argument word"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_tiled_grid_covers_the_output() {
        let planner = LaunchPlanner::new().with_block(Dimension::new(4, 2));
        let plan = planner
            .plan_matmul(MatmulVariant::BlockTiled, MatmulProblem::new(5, 9, 3))
            .unwrap();
        // 9 columns / 4 -> 3, 5 rows / 2 -> 3.
        assert_eq!(plan.grid, Dimension::new(3, 3));
        assert_eq!(plan.tile_group, Dimension::new(2, 2));
    }

    #[test]
    fn linear_index_splits_output_across_groups() {
        let planner = LaunchPlanner::new().with_linear_groups(3);
        let plan = planner
            .plan_matmul(MatmulVariant::LinearIndex, MatmulProblem::square(4))
            .unwrap();
        assert_eq!(plan.grid, Dimension::new(3, 1));
        assert_eq!(plan.block_size, 6);
        assert!(plan.block_size * plan.grid.x >= 16);
    }

    #[test]
    fn linear_index_rejects_rectangular_inputs() {
        let err = LaunchPlanner::new()
            .plan_matmul(MatmulVariant::LinearIndex, MatmulProblem::new(4, 4, 2))
            .unwrap_err();
        assert!(err.to_string().contains("square"));
    }

    #[test]
    fn empty_problems_are_rejected() {
        assert!(LaunchPlanner::new()
            .plan_matmul(MatmulVariant::BlockTiled, MatmulProblem::new(0, 4, 4))
            .is_err());
    }
}

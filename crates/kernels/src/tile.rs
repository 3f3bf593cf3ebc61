//! Per-tile execution context handed to a kernel entry point.

use crate::barrier::TileGroupBarrier;
use crate::config::{Dimension, TileCoord};
use crate::memory::DeviceMemory;
use anyhow::Result;

/// Everything one tile can observe about where it runs.
pub struct TileContext<'a> {
    /// Position of this tile inside its tile group.
    pub tile: TileCoord,
    /// Position of the tile group inside the grid.
    pub group_id: TileCoord,
    pub group_dim: Dimension,
    pub grid_dim: Dimension,
    pub memory: &'a dyn DeviceMemory,
    barrier: &'a TileGroupBarrier,
}

impl<'a> TileContext<'a> {
    pub fn new(
        tile: TileCoord,
        group_id: TileCoord,
        group_dim: Dimension,
        grid_dim: Dimension,
        memory: &'a dyn DeviceMemory,
        barrier: &'a TileGroupBarrier,
    ) -> Self {
        Self {
            tile,
            group_id,
            group_dim,
            grid_dim,
            memory,
            barrier,
        }
    }

    /// Linear id of this tile within its group.
    pub fn tile_id(&self) -> usize {
        self.tile.linear(self.group_dim)
    }

    /// Linear id of this tile group within the grid.
    pub fn group_linear_id(&self) -> usize {
        self.group_id.linear(self.grid_dim)
    }

    pub fn tiles_per_group(&self) -> usize {
        self.group_dim.area()
    }

    /// Waits until every tile of the group has reached this point.
    pub fn sync(&self) -> Result<()> {
        self.barrier.arrive_at(self.tile)
    }
}

//! Tile-grid execution engine.
//!
//! Queued launches run in enqueue order. Within a launch, tile groups run in
//! parallel on the rayon pool and every tile of a group runs on its own
//! scoped thread, so tiles that block on the group barrier never starve the
//! tiles they are waiting for.

use anyhow::{anyhow, Context, Result};
use manycore_kernels::barrier::TileGroupBarrier;
use manycore_kernels::config::{Dimension, TileCoord};
use manycore_kernels::matmul::DynTileKernel;
use manycore_kernels::memory::{DeviceMemory, KernelArgs};
use manycore_kernels::tile::TileContext;
use rayon::prelude::*;
use std::thread;
use std::time::Instant;
use tracing::debug;

/// A launch resolved against the loaded program, waiting to run.
#[derive(Clone)]
pub struct PendingLaunch {
    pub kernel: DynTileKernel,
    pub grid: Dimension,
    pub tile_group: Dimension,
    pub argv: Vec<u32>,
}

impl std::fmt::Debug for PendingLaunch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingLaunch")
            .field("kernel", &self.kernel.symbol())
            .field("grid", &self.grid)
            .field("tile_group", &self.tile_group)
            .field("argv", &self.argv)
            .finish()
    }
}

/// Work done by one drain of the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ExecutionSummary {
    pub launches: usize,
    pub tile_groups: usize,
    pub tiles: usize,
    pub elapsed_ms: f64,
}

#[derive(Debug, Default)]
pub struct TileGridEngine {
    queue: Vec<PendingLaunch>,
}

impl TileGridEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, launch: PendingLaunch) {
        self.queue.push(launch);
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Drops queued launches without running them.
    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Runs every queued launch to completion against `memory`.
    ///
    /// The queue is drained even when a launch fails; launches after the
    /// failing one do not run.
    pub fn execute_pending(&mut self, memory: &dyn DeviceMemory) -> Result<ExecutionSummary> {
        let start = Instant::now();
        let mut summary = ExecutionSummary::default();
        for launch in std::mem::take(&mut self.queue) {
            run_launch(&launch, memory)?;
            summary.launches += 1;
            summary.tile_groups += launch.grid.area();
            summary.tiles += launch.grid.area() * launch.tile_group.area();
        }
        summary.elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        Ok(summary)
    }
}

fn run_launch(launch: &PendingLaunch, memory: &dyn DeviceMemory) -> Result<()> {
    let symbol = launch.kernel.symbol();
    debug!(
        kernel = symbol,
        grid = %launch.grid,
        tile_group = %launch.tile_group,
        argc = launch.argv.len(),
        "dispatching tile groups"
    );
    let groups: Vec<TileCoord> = launch.grid.coords().collect();
    groups
        .par_iter()
        .try_for_each(|group_id| run_group(launch, *group_id, memory))
        .with_context(|| format!("launch of `{symbol}` failed"))
}

fn run_group(launch: &PendingLaunch, group_id: TileCoord, memory: &dyn DeviceMemory) -> Result<()> {
    let barrier = TileGroupBarrier::for_group(launch.tile_group);
    let args = KernelArgs::new(&launch.argv);

    let outcomes: Vec<(TileCoord, Result<()>)> = thread::scope(|scope| {
        let workers: Vec<_> = launch
            .tile_group
            .coords()
            .map(|tile| {
                let barrier = &barrier;
                let worker = scope.spawn(move || {
                    let context = TileContext::new(
                        tile,
                        group_id,
                        launch.tile_group,
                        launch.grid,
                        memory,
                        barrier,
                    );
                    launch.kernel.run(&context, args)
                });
                (tile, worker)
            })
            .collect();

        workers
            .into_iter()
            .map(|(tile, worker)| {
                let outcome = worker
                    .join()
                    .unwrap_or_else(|_| Err(anyhow!("tile {tile} panicked")));
                (tile, outcome)
            })
            .collect()
    });

    for (tile, outcome) in outcomes {
        outcome.with_context(|| format!("tile {tile} of tile group {group_id}"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dram::DeviceDram;
    use anyhow::bail;
    use manycore_kernels::matmul::{LinearIndexMatmul, TileKernel};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// How many tiles ran and how many passed the barrier.
    #[derive(Default)]
    struct Counts {
        before: AtomicUsize,
        after: AtomicUsize,
    }

    struct CountingKernel {
        counts: Arc<Counts>,
    }

    impl TileKernel for CountingKernel {
        fn symbol(&self) -> &'static str {
            "kernel_count"
        }

        fn run(&self, tile: &TileContext<'_>, _args: KernelArgs<'_>) -> Result<()> {
            self.counts.before.fetch_add(1, Ordering::SeqCst);
            tile.sync()?;
            self.counts.after.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingKernel;

    impl TileKernel for FailingKernel {
        fn symbol(&self) -> &'static str {
            "kernel_fail"
        }

        fn run(&self, tile: &TileContext<'_>, _args: KernelArgs<'_>) -> Result<()> {
            tile.sync()?;
            if tile.tile_id() == 1 {
                bail!("tile refused to compute");
            }
            Ok(())
        }
    }

    #[test]
    fn every_tile_of_every_group_runs() {
        let counts = Arc::new(Counts::default());
        let mut engine = TileGridEngine::new();
        engine.enqueue(PendingLaunch {
            kernel: Arc::new(CountingKernel {
                counts: Arc::clone(&counts),
            }),
            grid: Dimension::new(3, 2),
            tile_group: Dimension::new(2, 3),
            argv: Vec::new(),
        });
        let dram = DeviceDram::new(0x1000, 16).unwrap();
        let summary = engine.execute_pending(&dram).unwrap();

        assert_eq!(summary.launches, 1);
        assert_eq!(summary.tile_groups, 6);
        assert_eq!(summary.tiles, 36);
        assert_eq!(counts.before.load(Ordering::SeqCst), 36);
        assert_eq!(counts.after.load(Ordering::SeqCst), 36);
        assert_eq!(engine.pending(), 0);
    }

    #[test]
    fn tile_failure_surfaces_with_location() {
        let mut engine = TileGridEngine::new();
        engine.enqueue(PendingLaunch {
            kernel: Arc::new(FailingKernel),
            grid: Dimension::single(),
            tile_group: Dimension::new(2, 2),
            argv: Vec::new(),
        });
        let dram = DeviceDram::new(0x1000, 16).unwrap();
        let err = engine.execute_pending(&dram).unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("kernel_fail"));
        assert!(message.contains("tile refused to compute"));
        assert_eq!(engine.pending(), 0);
    }

    #[test]
    fn launches_run_in_enqueue_order() {
        let mut dram = DeviceDram::new(0x1000, 256).unwrap();
        let lhs = dram.allocate(16).unwrap();
        let rhs = dram.allocate(16).unwrap();
        let mid = dram.allocate(16).unwrap();
        let out = dram.allocate(16).unwrap();
        dram.write(lhs, bytemuck::cast_slice(&[1.0f32, 2.0, 3.0, 4.0])).unwrap();
        dram.write(rhs, bytemuck::cast_slice(&[1.0f32, 0.0, 0.0, 1.0])).unwrap();

        // mid = lhs * I, then out = mid * mid.
        let mut engine = TileGridEngine::new();
        for argv in [vec![lhs, rhs, mid, 2, 4], vec![mid, mid, out, 2, 4]] {
            engine.enqueue(PendingLaunch {
                kernel: Arc::new(LinearIndexMatmul::new()),
                grid: Dimension::single(),
                tile_group: Dimension::new(2, 2),
                argv,
            });
        }
        assert_eq!(engine.pending(), 2);
        engine.execute_pending(&dram).unwrap();

        let mut result = [0.0f32; 4];
        dram.read(bytemuck::cast_slice_mut(&mut result), out).unwrap();
        assert_eq!(result, [7.0, 10.0, 15.0, 22.0]);
    }
}

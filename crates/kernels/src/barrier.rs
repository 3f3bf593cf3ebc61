//! Two-phase hierarchical barrier for a rectangular tile group.
//!
//! Tiles first rendezvous within their row. The last tile to arrive in a row
//! becomes the row representative and carries the row into a single column
//! rendezvous. The last representative to arrive there knows the whole group
//! has arrived: it resets and releases the column, and every representative
//! then resets and releases its own row. A barrier use costs O(rows + cols)
//! hand-offs instead of an all-pairs exchange.
//!
//! There is no timeout. A tile that never arrives blocks its whole group
//! forever, so every tile of a group must reach every barrier call the same
//! number of times.

use crate::config::{Dimension, TileCoord};
use anyhow::{ensure, Result};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// Inclusive rectangular bounds of a tile group, in tile coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierBounds {
    row_min: u32,
    row_max: u32,
    col_min: u32,
    col_max: u32,
}

impl BarrierBounds {
    pub fn new(row_min: u32, row_max: u32, col_min: u32, col_max: u32) -> Result<Self> {
        ensure!(
            row_min <= row_max && col_min <= col_max,
            "inverted barrier bounds: rows {row_min}..={row_max}, cols {col_min}..={col_max}"
        );
        Ok(Self {
            row_min,
            row_max,
            col_min,
            col_max,
        })
    }

    /// Bounds covering a whole tile group anchored at the origin.
    pub fn for_group(group: Dimension) -> Self {
        Self {
            row_min: 0,
            row_max: group.y.saturating_sub(1),
            col_min: 0,
            col_max: group.x.saturating_sub(1),
        }
    }

    pub fn rows(&self) -> usize {
        (self.row_max - self.row_min) as usize + 1
    }

    pub fn cols(&self) -> usize {
        (self.col_max - self.col_min) as usize + 1
    }

    pub fn row_min(&self) -> u32 {
        self.row_min
    }

    pub fn col_min(&self) -> u32 {
        self.col_min
    }

    pub fn contains(&self, row: u32, col: u32) -> bool {
        (self.row_min..=self.row_max).contains(&row) && (self.col_min..=self.col_max).contains(&col)
    }
}

#[derive(Debug, Default)]
struct Phase {
    arrived: usize,
    generation: u64,
}

#[derive(Debug, PartialEq, Eq)]
enum Arrival {
    /// Some other participant completed the rendezvous and released us.
    Released,
    /// We were the last to arrive; the caller owns the release.
    Last,
}

/// Arrival counter with a generation number so it can be reused.
#[derive(Debug, Default)]
struct ArrivalCounter {
    phase: Mutex<Phase>,
    released: Condvar,
}

impl ArrivalCounter {
    fn lock(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers one arrival out of `expected`. Every arrival but the last
    /// blocks until [`ArrivalCounter::release`] is called for this generation.
    fn arrive(&self, expected: usize) -> Arrival {
        let mut phase = self.lock();
        let generation = phase.generation;
        phase.arrived += 1;
        if phase.arrived >= expected {
            return Arrival::Last;
        }
        while phase.generation == generation {
            phase = self
                .released
                .wait(phase)
                .unwrap_or_else(PoisonError::into_inner);
        }
        Arrival::Released
    }

    /// Resets the count for the next use and wakes every waiter.
    fn release(&self) {
        let mut phase = self.lock();
        phase.arrived = 0;
        phase.generation = phase.generation.wrapping_add(1);
        self.released.notify_all();
    }

    fn arrived(&self) -> usize {
        self.lock().arrived
    }
}

/// Synchronization object for one running tile group.
///
/// Owned by the tile group's execution context and shared by reference with
/// every tile of the group. Not reentrant: a tile must not arrive twice for
/// the same synchronization point.
#[derive(Debug)]
pub struct TileGroupBarrier {
    bounds: BarrierBounds,
    rows: Vec<ArrivalCounter>,
    column: ArrivalCounter,
}

impl TileGroupBarrier {
    pub fn new(bounds: BarrierBounds) -> Self {
        let rows = (0..bounds.rows()).map(|_| ArrivalCounter::default()).collect();
        Self {
            bounds,
            rows,
            column: ArrivalCounter::default(),
        }
    }

    pub fn for_group(group: Dimension) -> Self {
        Self::new(BarrierBounds::for_group(group))
    }

    pub fn bounds(&self) -> BarrierBounds {
        self.bounds
    }

    /// Number of participants the barrier waits for.
    pub fn participants(&self) -> usize {
        self.bounds.rows() * self.bounds.cols()
    }

    /// Blocks the tile at `(row, col)` until every tile inside the bounds has
    /// arrived.
    pub fn arrive_and_wait(&self, row: u32, col: u32) -> Result<()> {
        ensure!(
            self.bounds.contains(row, col),
            "tile (row {row}, col {col}) is outside barrier bounds {:?}",
            self.bounds
        );
        let row_counter = &self.rows[(row - self.bounds.row_min) as usize];

        if row_counter.arrive(self.bounds.cols()) == Arrival::Released {
            return Ok(());
        }

        // Row representative from here on.
        if self.column.arrive(self.bounds.rows()) == Arrival::Last {
            self.column.release();
        }
        row_counter.release();
        Ok(())
    }

    /// Convenience wrapper taking a tile coordinate (`x` = column, `y` = row).
    pub fn arrive_at(&self, tile: TileCoord) -> Result<()> {
        self.arrive_and_wait(self.bounds.row_min + tile.y, self.bounds.col_min + tile.x)
    }

    /// Tiles currently parked in the row phase, summed over all rows.
    pub fn pending_arrivals(&self) -> usize {
        self.rows.iter().map(ArrivalCounter::arrived).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    fn run_group(rows: u32, cols: u32) {
        let barrier = TileGroupBarrier::for_group(Dimension::new(cols, rows));
        let total = (rows * cols) as usize;
        let arrived = AtomicUsize::new(0);

        thread::scope(|scope| {
            for tile in Dimension::new(cols, rows).coords() {
                let barrier = &barrier;
                let arrived = &arrived;
                scope.spawn(move || {
                    arrived.fetch_add(1, Ordering::SeqCst);
                    barrier.arrive_at(tile).expect("arrive");
                    assert_eq!(arrived.load(Ordering::SeqCst), total);
                });
            }
        });
    }

    #[test]
    fn no_tile_passes_before_all_arrive() {
        for (rows, cols) in [(1, 1), (1, 4), (4, 1), (2, 2), (3, 3), (4, 4), (2, 5)] {
            run_group(rows, cols);
        }
    }

    #[test]
    fn withholding_last_tile_keeps_group_blocked() {
        let group = Dimension::new(3, 2);
        let barrier = TileGroupBarrier::for_group(group);
        let passed = AtomicUsize::new(0);
        let mut tiles: Vec<_> = group.coords().collect();
        let withheld = tiles.pop().expect("non-empty group");

        thread::scope(|scope| {
            for tile in tiles {
                let barrier = &barrier;
                let passed = &passed;
                scope.spawn(move || {
                    barrier.arrive_at(tile).expect("arrive");
                    passed.fetch_add(1, Ordering::SeqCst);
                });
            }

            thread::sleep(Duration::from_millis(150));
            assert_eq!(passed.load(Ordering::SeqCst), 0);

            barrier.arrive_at(withheld).expect("arrive");
        });

        assert_eq!(passed.load(Ordering::SeqCst), group.area() - 1);
    }

    #[test]
    fn barrier_is_reusable_across_rounds() {
        let group = Dimension::new(4, 3);
        let barrier = TileGroupBarrier::for_group(group);
        let rounds = 64;
        let counters: Vec<AtomicUsize> = (0..rounds).map(|_| AtomicUsize::new(0)).collect();

        thread::scope(|scope| {
            for tile in group.coords() {
                let barrier = &barrier;
                let counters = &counters;
                scope.spawn(move || {
                    for round in 0..rounds {
                        counters[round].fetch_add(1, Ordering::SeqCst);
                        barrier.arrive_at(tile).expect("arrive");
                        assert_eq!(counters[round].load(Ordering::SeqCst), group.area());
                    }
                });
            }
        });

        assert_eq!(barrier.pending_arrivals(), 0);
    }

    #[test]
    fn offset_bounds_accept_only_inside_tiles() {
        let barrier = TileGroupBarrier::new(BarrierBounds::new(2, 2, 5, 5).unwrap());
        assert_eq!(barrier.participants(), 1);
        assert_eq!(barrier.bounds().row_min(), 2);
        assert_eq!(barrier.bounds().col_min(), 5);
        assert!(barrier.arrive_and_wait(0, 0).is_err());
        barrier.arrive_and_wait(2, 5).expect("single tile passes immediately");
    }

    #[test]
    fn inverted_bounds_are_rejected() {
        assert!(BarrierBounds::new(3, 1, 0, 0).is_err());
        assert!(BarrierBounds::new(0, 0, 4, 2).is_err());
        let single = BarrierBounds::new(7, 7, 0, 0).unwrap();
        assert_eq!((single.rows(), single.cols()), (1, 1));
    }
}

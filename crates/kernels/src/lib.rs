//! Device-side primitives for the manycore tile grid: launch geometry, the
//! tile-group barrier, the per-tile context and the matmul entry points.

pub mod barrier;
pub mod config;
pub mod matmul;
pub mod memory;
pub mod registry;
pub mod tile;
pub mod utils;

pub use barrier::*;
pub use config::*;
pub use matmul::*;
pub use memory::*;
pub use registry::*;
pub use tile::*;
pub use utils::*;

//! Host-side device runtime for the manycore tile grid: sessions, buffers,
//! transfers, launches and the in-process simulated device.

pub mod backend;
pub mod dram;
pub mod engine;
pub mod error;
pub mod fault;
pub mod handle;
pub mod launch;
pub mod planner;
pub mod session;
pub mod simulator;
mod transfer;

pub use backend::*;
pub use dram::*;
pub use engine::*;
pub use error::*;
pub use fault::*;
pub use handle::*;
pub use launch::*;
pub use planner::*;
pub use session::*;
pub use simulator::*;

//! Application-facing matmul offload: configuration, the stage-coded bridge
//! with host fallback, evaluation reports and the CLI.

pub mod bridge;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod eval;

pub use bridge::*;
#[cfg(feature = "cli")]
pub use cli::*;
pub use config::*;
pub use eval::*;

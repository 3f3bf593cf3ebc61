//! Kernel launch descriptors and typed argument marshaling.
//!
//! Argument order must match the entry point's parameter order exactly. The
//! compiled program that defines the entry point is outside this process, so
//! only the count the caller declares is checked, never the real signature.

use crate::handle::BufferHandle;
use manycore_kernels::config::Dimension;
use std::fmt;

/// One launch argument, marshaled to a single 32-bit word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelArg {
    Buffer(BufferHandle),
    Scalar(u32),
}

impl KernelArg {
    pub fn word(&self) -> u32 {
        match self {
            KernelArg::Buffer(handle) => handle.address(),
            KernelArg::Scalar(value) => *value,
        }
    }
}

impl From<BufferHandle> for KernelArg {
    fn from(handle: BufferHandle) -> Self {
        KernelArg::Buffer(handle)
    }
}

impl From<&BufferHandle> for KernelArg {
    fn from(handle: &BufferHandle) -> Self {
        KernelArg::Buffer(*handle)
    }
}

impl From<u32> for KernelArg {
    fn from(value: u32) -> Self {
        KernelArg::Scalar(value)
    }
}

/// A kernel invocation: entry point, grid of tile groups, tile-group shape
/// and ordered arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchDescriptor {
    entry_point: String,
    grid: Dimension,
    tile_group: Dimension,
    args: Vec<KernelArg>,
    declared_arity: Option<usize>,
}

impl LaunchDescriptor {
    pub fn builder(entry_point: impl Into<String>) -> LaunchBuilder {
        LaunchBuilder::new(entry_point)
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    pub fn grid(&self) -> Dimension {
        self.grid
    }

    pub fn tile_group(&self) -> Dimension {
        self.tile_group
    }

    pub fn args(&self) -> &[KernelArg] {
        &self.args
    }

    pub fn declared_arity(&self) -> Option<usize> {
        self.declared_arity
    }

    /// Argument words in declaration order.
    pub fn marshal(&self) -> Vec<u32> {
        self.args.iter().map(KernelArg::word).collect()
    }

    pub fn buffers(&self) -> impl Iterator<Item = &BufferHandle> {
        self.args.iter().filter_map(|arg| match arg {
            KernelArg::Buffer(handle) => Some(handle),
            KernelArg::Scalar(_) => None,
        })
    }

    /// Total tiles the launch occupies across all tile groups.
    pub fn tile_count(&self) -> usize {
        self.grid.area() * self.tile_group.area()
    }

    /// Shape and argument-count checks performed at enqueue time.
    pub fn validate(&self) -> Result<(), String> {
        if self.entry_point.is_empty() {
            return Err("entry point name is empty".to_string());
        }
        if !self.grid.is_valid() {
            return Err(format!("grid {} has a zero component", self.grid));
        }
        if !self.tile_group.is_valid() {
            return Err(format!("tile group {} has a zero component", self.tile_group));
        }
        if let Some(expected) = self.declared_arity {
            if expected != self.args.len() {
                return Err(format!(
                    "`{}` declared {} arguments but {} were supplied",
                    self.entry_point,
                    expected,
                    self.args.len()
                ));
            }
        }
        Ok(())
    }
}

impl fmt::Display for LaunchDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}(argc={}) grid={} tile_group={}",
            self.entry_point,
            self.args.len(),
            self.grid,
            self.tile_group
        )
    }
}

#[derive(Debug, Clone)]
pub struct LaunchBuilder {
    entry_point: String,
    grid: Dimension,
    tile_group: Dimension,
    args: Vec<KernelArg>,
    declared_arity: Option<usize>,
}

impl LaunchBuilder {
    pub fn new(entry_point: impl Into<String>) -> Self {
        Self {
            entry_point: entry_point.into(),
            grid: Dimension::single(),
            tile_group: Dimension::single(),
            args: Vec::new(),
            declared_arity: None,
        }
    }

    pub fn grid(mut self, grid: Dimension) -> Self {
        self.grid = grid;
        self
    }

    pub fn tile_group(mut self, tile_group: Dimension) -> Self {
        self.tile_group = tile_group;
        self
    }

    /// Declares how many arguments the entry point takes; enqueue rejects the
    /// launch when the supplied count differs.
    pub fn arity(mut self, arity: usize) -> Self {
        self.declared_arity = Some(arity);
        self
    }

    pub fn arg(mut self, arg: impl Into<KernelArg>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn buffer(self, handle: &BufferHandle) -> Self {
        self.arg(handle)
    }

    pub fn scalar(self, value: u32) -> Self {
        self.arg(value)
    }

    pub fn build(self) -> LaunchDescriptor {
        LaunchDescriptor {
            entry_point: self.entry_point,
            grid: self.grid,
            tile_group: self.tile_group,
            args: self.args,
            declared_arity: self.declared_arity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::SessionId;

    #[test]
    fn marshal_preserves_argument_order() {
        let session = SessionId::next();
        let a = BufferHandle::new(0x1000, 64, session);
        let b = BufferHandle::new(0x1040, 64, session);
        let launch = LaunchDescriptor::builder("kernel")
            .buffer(&a)
            .scalar(4)
            .buffer(&b)
            .scalar(16)
            .arity(4)
            .build();

        assert_eq!(launch.marshal(), vec![0x1000, 4, 0x1040, 16]);
        assert_eq!(launch.buffers().count(), 2);
        assert!(launch.validate().is_ok());
    }

    #[test]
    fn validation_rejects_bad_shapes_and_counts() {
        let zero_grid = LaunchDescriptor::builder("kernel")
            .grid(Dimension::new(0, 1))
            .build();
        assert!(zero_grid.validate().unwrap_err().contains("grid"));

        let zero_group = LaunchDescriptor::builder("kernel")
            .tile_group(Dimension::new(2, 0))
            .build();
        assert!(zero_group.validate().unwrap_err().contains("tile group"));

        let short = LaunchDescriptor::builder("kernel").scalar(1).arity(2).build();
        assert!(short.validate().unwrap_err().contains("declared 2"));

        let unnamed = LaunchDescriptor::builder("").build();
        assert!(unnamed.validate().is_err());
    }

    #[test]
    fn undeclared_arity_is_not_checked() {
        let launch = LaunchDescriptor::builder("kernel").scalar(7).build();
        assert!(launch.validate().is_ok());
        assert_eq!(launch.tile_count(), 1);
    }
}

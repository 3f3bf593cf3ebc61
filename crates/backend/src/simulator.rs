//! In-process manycore device: a tile mesh, simulated DRAM and the tile-grid
//! engine behind the [`DeviceBackend`] primitives.

use crate::backend::{DeviceBackend, DeviceIdentity};
use crate::dram::DeviceDram;
use crate::engine::{ExecutionSummary, PendingLaunch, TileGridEngine};
use crate::launch::LaunchDescriptor;
use anyhow::{anyhow, bail, ensure, Context, Result};
use manycore_kernels::config::Dimension;
use manycore_kernels::registry::{ProgramCatalog, ProgramImage};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

pub const DEFAULT_ALLOCATOR: &str = "default_allocator";

/// Shape and memory of the simulated device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManycoreConfig {
    /// Tiles available to a single tile group.
    pub mesh: Dimension,
    pub dram_base: u32,
    pub dram_bytes: usize,
    /// Allocator names a program may be loaded against.
    pub allocators: Vec<String>,
}

impl Default for ManycoreConfig {
    fn default() -> Self {
        Self {
            mesh: Dimension::new(4, 4),
            dram_base: 0x1000,
            dram_bytes: 1 << 20,
            allocators: vec![DEFAULT_ALLOCATOR.to_string()],
        }
    }
}

#[derive(Debug)]
pub struct SimulatedManycore {
    config: ManycoreConfig,
    catalog: ProgramCatalog,
    attached: Option<DeviceIdentity>,
    program: Option<ProgramImage>,
    dram: Option<DeviceDram>,
    engine: TileGridEngine,
    last_execution: Option<ExecutionSummary>,
}

impl SimulatedManycore {
    pub fn new(config: ManycoreConfig) -> Self {
        Self::with_catalog(config, ProgramCatalog::with_default_programs())
    }

    pub fn with_catalog(config: ManycoreConfig, catalog: ProgramCatalog) -> Self {
        Self {
            config,
            catalog,
            attached: None,
            program: None,
            dram: None,
            engine: TileGridEngine::new(),
            last_execution: None,
        }
    }

    pub fn config(&self) -> &ManycoreConfig {
        &self.config
    }

    pub fn attached(&self) -> Option<&DeviceIdentity> {
        self.attached.as_ref()
    }

    pub fn program(&self) -> Option<&ProgramImage> {
        self.program.as_ref()
    }

    pub fn dram(&self) -> Option<&DeviceDram> {
        self.dram.as_ref()
    }

    pub fn queued_launches(&self) -> usize {
        self.engine.pending()
    }

    pub fn last_execution(&self) -> Option<ExecutionSummary> {
        self.last_execution
    }

    fn dram_mut(&mut self) -> Result<&mut DeviceDram> {
        self.dram.as_mut().ok_or_else(|| anyhow!("device is not attached"))
    }

    fn attached_dram(&self) -> Result<&DeviceDram> {
        self.dram.as_ref().ok_or_else(|| anyhow!("device is not attached"))
    }
}

impl Default for SimulatedManycore {
    fn default() -> Self {
        Self::new(ManycoreConfig::default())
    }
}

impl DeviceBackend for SimulatedManycore {
    fn init(&mut self, identity: &DeviceIdentity) -> Result<()> {
        ensure!(self.attached.is_none(), "device is already attached");
        ensure!(!identity.name.is_empty(), "device name is empty");
        ensure!(self.config.mesh.is_valid(), "tile mesh {} is empty", self.config.mesh);
        let dram = DeviceDram::new(self.config.dram_base, self.config.dram_bytes)
            .context("failed to map device DRAM")?;
        debug!(
            device = %identity,
            mesh = %self.config.mesh,
            dram_bytes = dram.capacity(),
            "simulated device attached"
        );
        self.dram = Some(dram);
        self.attached = Some(identity.clone());
        Ok(())
    }

    fn load_program(&mut self, binary: &Path, allocator: &str) -> Result<()> {
        ensure!(self.attached.is_some(), "device is not attached");
        ensure!(
            self.config.allocators.iter().any(|name| name == allocator),
            "unknown allocator `{allocator}`"
        );
        let image = self
            .catalog
            .resolve(binary)
            .cloned()
            .ok_or_else(|| anyhow!("no program image found at {}", binary.display()))?;
        info!(
            binary = %binary.display(),
            program = image.name(),
            symbols = image.symbols().count(),
            "program image resolved"
        );
        self.program = Some(image);
        Ok(())
    }

    fn malloc(&mut self, len: usize) -> Result<u32> {
        self.dram_mut()?.allocate(len)
    }

    fn memset(&mut self, address: u32, value: u8, len: usize) -> Result<()> {
        self.attached_dram()?.fill(address, value, len)
    }

    fn copy_to_device(&mut self, address: u32, src: &[u8]) -> Result<()> {
        self.attached_dram()?.write(address, src)
    }

    fn copy_to_host(&mut self, dst: &mut [u8], address: u32) -> Result<()> {
        self.attached_dram()?.read(dst, address)
    }

    fn enqueue(&mut self, launch: &LaunchDescriptor) -> Result<()> {
        let program = self
            .program
            .as_ref()
            .ok_or_else(|| anyhow!("no program is loaded"))?;
        let kernel = program.find_kernel(launch.entry_point()).ok_or_else(|| {
            anyhow!(
                "entry point `{}` is not defined by {}",
                launch.entry_point(),
                program.name()
            )
        })?;
        if !launch.tile_group().fits_within(self.config.mesh) {
            bail!(
                "tile group {} does not fit the {} tile mesh",
                launch.tile_group(),
                self.config.mesh
            );
        }
        self.engine.enqueue(PendingLaunch {
            kernel,
            grid: launch.grid(),
            tile_group: launch.tile_group(),
            argv: launch.marshal(),
        });
        Ok(())
    }

    fn execute_pending(&mut self) -> Result<()> {
        let dram = self
            .dram
            .as_ref()
            .ok_or_else(|| anyhow!("device is not attached"))?;
        let summary = self.engine.execute_pending(dram)?;
        debug!(
            launches = summary.launches,
            tile_groups = summary.tile_groups,
            tiles = summary.tiles,
            elapsed_ms = summary.elapsed_ms,
            "tile grid drained"
        );
        self.last_execution = Some(summary);
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.engine.clear();
        self.program = None;
        self.dram = None;
        if let Some(identity) = self.attached.take() {
            debug!(device = %identity, "simulated device released");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use manycore_kernels::matmul::LINEAR_INDEX_SYMBOL;
    use manycore_kernels::registry::MATMUL_PROGRAM;

    fn attached() -> SimulatedManycore {
        let mut device = SimulatedManycore::default();
        device.init(&DeviceIdentity::default()).unwrap();
        device
    }

    #[test]
    fn init_twice_is_rejected() {
        let mut device = attached();
        assert!(device.init(&DeviceIdentity::default()).is_err());
    }

    #[test]
    fn unknown_allocator_or_binary_fails_to_load() {
        let mut device = attached();
        assert!(device
            .load_program(Path::new(MATMUL_PROGRAM), "bump_allocator")
            .is_err());
        assert!(device
            .load_program(Path::new("spmd/other/main.riscv"), DEFAULT_ALLOCATOR)
            .is_err());
        assert!(device.program().is_none());
    }

    #[test]
    fn enqueue_checks_symbol_and_mesh() {
        let mut device = attached();
        device
            .load_program(Path::new(MATMUL_PROGRAM), DEFAULT_ALLOCATOR)
            .unwrap();

        let unknown = LaunchDescriptor::builder("kernel_vector_add").build();
        assert!(device.enqueue(&unknown).is_err());

        let oversized = LaunchDescriptor::builder(LINEAR_INDEX_SYMBOL)
            .tile_group(Dimension::new(8, 1))
            .build();
        let err = device.enqueue(&oversized).unwrap_err();
        assert!(err.to_string().contains("does not fit"));
        assert_eq!(device.queued_launches(), 0);
    }

    #[test]
    fn finish_releases_everything_and_is_safe_when_detached() {
        let mut device = SimulatedManycore::default();
        device.finish().unwrap();

        let mut device = attached();
        device.malloc(64).unwrap();
        device.finish().unwrap();
        assert!(device.attached().is_none());
        assert!(device.dram().is_none());
        assert!(device.malloc(4).is_err());
        device.init(&DeviceIdentity::default()).expect("re-attach after finish");
    }
}

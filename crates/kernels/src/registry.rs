//! Program images and the catalog that resolves binary references to them.

use crate::matmul::{BlockTiledMatmul, DynTileKernel, LinearIndexMatmul, TileKernel};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Binary reference of the program exporting both matmul entry points.
pub const MATMUL_PROGRAM: &str = "matrix_mult_4x4/main.riscv";

/// An executable image: the set of entry points a launch may name.
#[derive(Default, Clone)]
pub struct ProgramImage {
    name: String,
    kernels: Vec<DynTileKernel>,
}

impl ProgramImage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kernels: Vec::new(),
        }
    }

    pub fn with_matmul_kernels() -> Self {
        let mut image = Self::new(MATMUL_PROGRAM);
        image.register(BlockTiledMatmul::new());
        image.register(LinearIndexMatmul::new());
        image
    }

    pub fn register<K>(&mut self, kernel: K)
    where
        K: TileKernel + 'static,
    {
        self.kernels.push(Arc::new(kernel));
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn symbols(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.kernels.iter().map(|kernel| kernel.symbol())
    }

    pub fn find_kernel(&self, symbol: &str) -> Option<DynTileKernel> {
        self.kernels
            .iter()
            .find(|kernel| kernel.symbol() == symbol)
            .map(Arc::clone)
    }
}

impl std::fmt::Debug for ProgramImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgramImage")
            .field("name", &self.name)
            .field("symbols", &self.symbols().collect::<Vec<_>>())
            .finish()
    }
}

/// Known program images keyed by binary reference.
///
/// A reference resolves when it equals a registered key or ends with the
/// key's path components, so an absolute install path such as
/// `/opt/sdk/spmd/matrix_mult_4x4/main.riscv` finds `matrix_mult_4x4/main.riscv`.
#[derive(Debug, Default, Clone)]
pub struct ProgramCatalog {
    images: BTreeMap<String, ProgramImage>,
}

impl ProgramCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_programs() -> Self {
        let mut catalog = Self::new();
        catalog.insert(ProgramImage::with_matmul_kernels());
        catalog
    }

    pub fn insert(&mut self, image: ProgramImage) {
        self.images.insert(image.name().to_string(), image);
    }

    pub fn resolve(&self, binary: &Path) -> Option<&ProgramImage> {
        if let Some(image) = binary.to_str().and_then(|key| self.images.get(key)) {
            return Some(image);
        }
        self.images
            .iter()
            .find(|(key, _)| binary.ends_with(Path::new(key.as_str())))
            .map(|(_, image)| image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matmul::{BLOCK_TILED_SYMBOL, LINEAR_INDEX_SYMBOL};

    #[test]
    fn matmul_program_exports_both_conventions() {
        let image = ProgramImage::with_matmul_kernels();
        assert!(image.find_kernel(BLOCK_TILED_SYMBOL).is_some());
        assert!(image.find_kernel(LINEAR_INDEX_SYMBOL).is_some());
        assert!(image.find_kernel("kernel_vector_add").is_none());
    }

    #[test]
    fn catalog_resolves_install_paths_by_suffix() {
        let catalog = ProgramCatalog::with_default_programs();
        assert!(catalog.resolve(Path::new(MATMUL_PROGRAM)).is_some());
        assert!(catalog
            .resolve(Path::new("/home/dev/spmd/cuda_lite_runtime/matrix_mult_4x4/main.riscv"))
            .is_some());
        assert!(catalog.resolve(Path::new("/tmp/other/main.riscv")).is_none());
        assert!(catalog.resolve(Path::new("")).is_none());
    }
}

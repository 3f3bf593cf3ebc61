//! Bridge configuration: JSON file, environment overrides and defaults.

use anyhow::{Context, Result};
use manycore_backend::{DeviceIdentity, LaunchPlanner, ManycoreConfig, DEFAULT_ALLOCATOR};
use manycore_kernels::config::MatmulVariant;
use manycore_kernels::registry::MATMUL_PROGRAM;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const BINARY_PATH_ENV: &str = "MANYCORE_BINARY_PATH";
pub const VARIANT_ENV: &str = "MANYCORE_VARIANT";

/// Everything needed to run one offload: which device, which program, which
/// kernel convention and launch geometry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub device: DeviceIdentity,
    /// Program image exporting the matmul entry points. Empty means the
    /// default program.
    pub binary_path: PathBuf,
    pub allocator: String,
    pub variant: MatmulVariant,
    pub planner: LaunchPlanner,
    pub simulator: ManycoreConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            device: DeviceIdentity::default(),
            binary_path: PathBuf::from(MATMUL_PROGRAM),
            allocator: DEFAULT_ALLOCATOR.to_string(),
            variant: MatmulVariant::default(),
            planner: LaunchPlanner::default(),
            simulator: ManycoreConfig::default(),
        }
    }
}

impl BridgeConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let blob = fs::read_to_string(path)
            .with_context(|| format!("failed to read bridge config {}", path.display()))?;
        let config = serde_json::from_str(&blob)
            .with_context(|| format!("failed to parse bridge config {}", path.display()))?;
        info!(path = %path.display(), "bridge config loaded");
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Defaults with the process environment applied on top.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(
            std::env::var(BINARY_PATH_ENV).ok(),
            std::env::var(VARIANT_ENV).ok(),
        )
    }

    /// Applies raw override values. An unrecognized variant is ignored with a
    /// warning rather than aborting the offload.
    pub fn with_overrides(mut self, binary_path: Option<String>, variant: Option<String>) -> Self {
        if let Some(path) = binary_path {
            self.binary_path = PathBuf::from(path);
        }
        if let Some(raw) = variant {
            match raw.parse::<MatmulVariant>() {
                Ok(variant) => self.variant = variant,
                Err(reason) => warn!(%reason, "ignoring matmul variant override"),
            }
        }
        self
    }

    /// The program path to load; an empty configured path resolves to the
    /// default program.
    pub fn resolved_binary(&self) -> PathBuf {
        if self.binary_path.as_os_str().is_empty() {
            PathBuf::from(MATMUL_PROGRAM)
        } else {
            self.binary_path.clone()
        }
    }
}

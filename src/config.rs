//! Configuration management for fabric-emu.
//!
//! Configuration is loaded from multiple sources in priority order:
//! 1. Environment variables (`FABRIC_EMU_CLUSTERS`, `FABRIC_EMU_CORES`,
//!    `FABRIC_EMU_STREAMING`)
//! 2. Project-local config file (`./fabric-emu.toml`)
//! 3. User config file (`~/.config/fabric-emu/config.toml`)
//! 4. Built-in defaults
//!
//! Command-line flags are applied on top by the binary.
//!
//! # Config File Format
//!
//! ```toml
//! # fabric-emu.toml
//! clusters = 2
//! compute_cores = 8
//! clm_size = 131072
//! cluster_offset = 262144
//! streaming = true
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration validation or loading error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A geometry parameter is out of range.
    #[error("invalid fabric geometry: {0}")]
    Geometry(String),

    /// A config file could not be read or parsed.
    #[error("failed to load {path}: {reason}")]
    Load { path: String, reason: String },
}

/// Fabric geometry and feature configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricConfig {
    /// Number of clusters (C).
    pub clusters: usize,

    /// Compute cores per cluster (P). Each cluster also has one DMA core.
    pub compute_cores: usize,

    /// Base address of cluster 0's CLM.
    pub clm_base: u64,

    /// Size of each cluster's CLM in bytes.
    pub clm_size: u64,

    /// Address distance between consecutive clusters' CLMs (S).
    pub cluster_offset: u64,

    /// CLM bytes reserved at the bottom of each CLM before the kernel heap.
    pub clm_reserved: u64,

    /// Base address of the global store.
    pub global_base: u64,

    /// Size of the global store in bytes.
    pub global_size: u64,

    /// Bytes a DMA channel moves per engine step.
    pub dma_bus_width: u64,

    /// Number of independent DMA channels per cluster.
    pub dma_channels: u32,

    /// Whether compute cores have operand streaming and hardware repeat.
    pub streaming: bool,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            clusters: 2,
            compute_cores: 8,
            clm_base: 0x1000_0000,
            clm_size: 0x2_0000,
            cluster_offset: 0x4_0000,
            clm_reserved: 0,
            global_base: 0x8000_0000,
            global_size: 0x40_0000,
            dma_bus_width: 64,
            dma_channels: 4,
            streaming: true,
        }
    }
}

/// Partial configuration as found in a config file.
///
/// Only fields present in the file override the current values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct ConfigFile {
    clusters: Option<usize>,
    compute_cores: Option<usize>,
    clm_base: Option<u64>,
    clm_size: Option<u64>,
    cluster_offset: Option<u64>,
    clm_reserved: Option<u64>,
    global_base: Option<u64>,
    global_size: Option<u64>,
    dma_bus_width: Option<u64>,
    dma_channels: Option<u32>,
    streaming: Option<bool>,
}

impl FabricConfig {
    /// Load configuration from all sources.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. Project-local `fabric-emu.toml`
    /// 3. User config `~/.config/fabric-emu/config.toml`
    /// 4. Defaults
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(path) = Self::user_config_path() {
            if let Some(file) = Self::load_file(&path) {
                config.merge(file);
            }
        }

        if let Some(file) = Self::load_file(Path::new("fabric-emu.toml")) {
            config.merge(file);
        }

        config.apply_env_overrides();
        log::debug!("Loaded configuration: {:?}", config);
        config
    }

    /// Load defaults overridden by one specific file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Load {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml(&content).map_err(|e| match e {
            ConfigError::Load { reason, .. } => ConfigError::Load {
                path: path.display().to_string(),
                reason,
            },
            other => other,
        })
    }

    /// Parse defaults overridden by TOML text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(content).map_err(|e| ConfigError::Load {
            path: "<inline>".to_string(),
            reason: e.to_string(),
        })?;
        let mut config = Self::default();
        config.merge(file);
        Ok(config)
    }

    /// Load a partial config file, logging (not failing) on errors.
    fn load_file(path: &Path) -> Option<ConfigFile> {
        if !path.exists() {
            return None;
        }

        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(file) => {
                    log::info!("Loaded config from {}", path.display());
                    Some(file)
                }
                Err(e) => {
                    log::warn!("Failed to parse {}: {}", path.display(), e);
                    None
                }
            },
            Err(e) => {
                log::warn!("Failed to read {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Merge a partial config into this one.
    fn merge(&mut self, other: ConfigFile) {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if let Some(v) = other.$field { self.$field = v; })*
            };
        }
        take!(
            clusters,
            compute_cores,
            clm_base,
            clm_size,
            cluster_offset,
            clm_reserved,
            global_base,
            global_size,
            dma_bus_width,
            dma_channels,
            streaming
        );
    }

    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_parse::<usize>("FABRIC_EMU_CLUSTERS") {
            log::info!("Using FABRIC_EMU_CLUSTERS from environment: {}", v);
            self.clusters = v;
        }
        if let Some(v) = env_parse::<usize>("FABRIC_EMU_CORES") {
            log::info!("Using FABRIC_EMU_CORES from environment: {}", v);
            self.compute_cores = v;
        }
        if let Some(v) = env_parse::<bool>("FABRIC_EMU_STREAMING") {
            log::info!("Using FABRIC_EMU_STREAMING from environment: {}", v);
            self.streaming = v;
        }
    }

    /// Check that the geometry describes a buildable fabric.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: String| Err(ConfigError::Geometry(msg));
        if self.clusters == 0 || self.compute_cores == 0 {
            return fail(format!(
                "need at least one cluster and one compute core (got {}x{})",
                self.clusters, self.compute_cores
            ));
        }
        if self.cluster_offset < self.clm_size {
            return fail(format!(
                "cluster offset 0x{:x} smaller than CLM size 0x{:x}",
                self.cluster_offset, self.clm_size
            ));
        }
        if self.clm_reserved >= self.clm_size {
            return fail(format!("reserved CLM 0x{:x} leaves no heap", self.clm_reserved));
        }
        if self.clm_base % 8 != 0 || self.cluster_offset % 8 != 0 || self.global_base % 8 != 0 {
            return fail("memory bases must be 8-byte aligned".to_string());
        }
        let clm_end = self.clm_base + self.clusters as u64 * self.cluster_offset;
        let global_end = self.global_base + self.global_size;
        if self.clm_base < global_end && self.global_base < clm_end {
            return fail("CLM window overlaps the global store".to_string());
        }
        if self.dma_bus_width == 0 || self.dma_channels == 0 {
            return fail("DMA needs a non-zero bus width and at least one channel".to_string());
        }
        Ok(())
    }

    /// Get the path to the user config file (for display/creation).
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("fabric-emu").join("config.toml"))
    }

    /// Generate a sample config file content.
    pub fn sample_config() -> String {
        r#"# fabric-emu configuration
# Place this file at ~/.config/fabric-emu/config.toml or ./fabric-emu.toml

# Fabric geometry
clusters = 2
compute_cores = 8

# Cluster-local memory: cluster k lives at clm_base + k * cluster_offset
clm_base = 0x10000000
clm_size = 0x20000
cluster_offset = 0x40000

# Global store
global_base = 0x80000000
global_size = 0x400000

# Bulk DMA engine
dma_bus_width = 64
dma_channels = 4

# Operand streaming and hardware repeat on compute cores
streaming = true
"#
        .to_string()
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            log::warn!("Ignoring unparsable {}={}", key, raw);
            None
        }
    }
}

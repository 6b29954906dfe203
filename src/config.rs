//! Driver configuration.
//!
//! Loaded from TOML; every section and field has a default so an empty file
//! describes a single queue pair on a simulated controller.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::memory::{MemorySource, HUGE_PAGE_SIZE, PAGE_SIZE};
use crate::queues::QUEUE_LENGTH;

/// Largest simulated MDTS exponent accepted (4 KiB << 16 = 256 MiB).
pub const MAX_SIMULATED_MDTS: u8 = 16;

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub queues: QueueConfig,
    pub io: IoConfig,
    pub memory: MemoryConfig,
    pub simulator: SimulatorConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Pci,
    Simulated,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub backend: Backend,
    /// PCI address such as `0000:01:00.0`; required for the pci backend.
    pub pci_address: Option<String>,
    pub namespace_id: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Simulated,
            pci_address: None,
            namespace_id: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Number of I/O queue pairs.
    pub io_queues: u16,
    /// Entries per I/O queue, clamped to the controller limit.
    pub depth: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            io_queues: 1,
            depth: 256,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IoConfig {
    pub timeout_ms: u64,
    pub max_transfer_bytes: usize,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5000,
            max_transfer_bytes: 2 * 1024 * 1024,
        }
    }
}

impl IoConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryKind {
    /// Pinned pages from a hugetlbfs mount.
    Hugetlbfs,
    /// Heap memory; addresses double as bus addresses (simulator only).
    Anonymous,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub source: MemoryKind,
    pub page_size: usize,
    pub pool_pages: usize,
    pub hugetlbfs_dir: String,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            source: MemoryKind::Anonymous,
            page_size: HUGE_PAGE_SIZE,
            pool_pages: 64,
            hugetlbfs_dir: "/mnt/huge".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompletionOrder {
    InOrder,
    Reversed,
    Shuffled,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Namespace size in logical blocks.
    pub blocks: u64,
    pub block_size: u64,
    /// Maximum data transfer size as a power of two of 4 KiB pages.
    pub mdts: u8,
    pub doorbell_stride: u8,
    pub completion_order: CompletionOrder,
    pub seed: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            blocks: 1 << 21,
            block_size: 512,
            mdts: 9,
            doorbell_stride: 0,
            completion_order: CompletionOrder::InOrder,
            seed: 0,
        }
    }
}

impl Config {
    /// Load and validate a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration for a simulated controller with a small anonymous pool.
    pub fn simulated() -> Self {
        let mut config = Self::default();
        config.memory.page_size = PAGE_SIZE;
        config.memory.pool_pages = 8192;
        config
    }

    pub fn memory_source(&self) -> MemorySource {
        match self.memory.source {
            MemoryKind::Hugetlbfs => MemorySource::HugeTlbFs {
                dir: PathBuf::from(&self.memory.hugetlbfs_dir),
            },
            MemoryKind::Anonymous => MemorySource::Anonymous,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.queues.io_queues == 0 {
            return Err(Error::Config("io_queues must be at least 1".into()));
        }
        if self.queues.depth < 2 || self.queues.depth > QUEUE_LENGTH {
            return Err(Error::Config(format!(
                "queue depth must be between 2 and {QUEUE_LENGTH}"
            )));
        }
        if !self.memory.page_size.is_power_of_two() || self.memory.page_size < PAGE_SIZE {
            return Err(Error::Config(format!(
                "page_size must be a power of two of at least {PAGE_SIZE}"
            )));
        }
        if self.memory.pool_pages == 0 {
            return Err(Error::Config("pool_pages must be at least 1".into()));
        }
        if self.io.max_transfer_bytes < 512 {
            return Err(Error::Config("max_transfer_bytes below one block".into()));
        }
        if self.device.backend == Backend::Pci && self.device.pci_address.is_none() {
            return Err(Error::Config("pci backend needs device.pci_address".into()));
        }
        if self.device.backend == Backend::Pci && self.memory.source == MemoryKind::Anonymous {
            return Err(Error::Config("pci backend needs hugetlbfs memory".into()));
        }
        if self.device.backend == Backend::Simulated && self.memory.source == MemoryKind::Hugetlbfs {
            return Err(Error::Config(
                "simulated backend needs anonymous memory; it cannot reach physical addresses".into(),
            ));
        }
        if self.simulator.mdts > MAX_SIMULATED_MDTS {
            return Err(Error::Config(format!(
                "simulator mdts must be at most {MAX_SIMULATED_MDTS}"
            )));
        }
        let bs = self.simulator.block_size;
        if !bs.is_power_of_two() || !(512..=PAGE_SIZE as u64).contains(&bs) {
            return Err(Error::Config(
                "simulator block_size must be a power of two in 512..=4096".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.device.backend, Backend::Simulated);
        assert_eq!(config.device.namespace_id, 1);
        assert_eq!(config.queues.io_queues, 1);
        assert_eq!(config.queues.depth, 256);
        assert_eq!(config.io.timeout(), Duration::from_secs(5));
        assert_eq!(config.memory.page_size, HUGE_PAGE_SIZE);
    }

    #[test]
    fn parses_sections() {
        let config = Config::from_toml_str(
            r#"
            [device]
            backend = "pci"
            pci_address = "0000:01:00.0"

            [queues]
            io_queues = 4
            depth = 64

            [memory]
            source = "hugetlbfs"
            pool_pages = 16

            [simulator]
            completion_order = "reversed"
            "#,
        )
        .unwrap();
        assert_eq!(config.device.backend, Backend::Pci);
        assert_eq!(config.device.pci_address.as_deref(), Some("0000:01:00.0"));
        assert_eq!(config.queues.io_queues, 4);
        assert_eq!(config.queues.depth, 64);
        assert_eq!(config.memory.source, MemoryKind::Hugetlbfs);
        assert_eq!(config.simulator.completion_order, CompletionOrder::Reversed);
    }

    #[test]
    fn rejects_pci_without_address() {
        let err = Config::from_toml_str("[device]\nbackend = \"pci\"\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn rejects_pci_on_heap_memory() {
        let err = Config::from_toml_str(
            "[device]\nbackend = \"pci\"\npci_address = \"0000:01:00.0\"\n",
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("hugetlbfs")));
    }

    #[test]
    fn rejects_simulator_on_hugetlbfs_memory() {
        let err = Config::from_toml_str("[memory]\nsource = \"hugetlbfs\"\n").unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("anonymous")));
    }

    #[test]
    fn rejects_unbounded_mdts() {
        assert!(Config::from_toml_str("[simulator]\nmdts = 16\n").is_ok());
        let err = Config::from_toml_str("[simulator]\nmdts = 64\n").unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("mdts")));
    }

    #[test]
    fn rejects_bad_queue_depth() {
        assert!(Config::from_toml_str("[queues]\ndepth = 1\n").is_err());
        assert!(Config::from_toml_str("[queues]\ndepth = 4096\n").is_err());
    }

    #[test]
    fn rejects_unparseable_toml() {
        let err = Config::from_toml_str("[queues\n").unwrap_err();
        assert!(matches!(err, Error::Toml(_)));
    }
}

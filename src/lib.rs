//! Userspace NVMe block I/O over hugepage-backed DMA buffers.
//!
//! [`initialize`] brings up a controller (a PCIe device or the in-memory
//! [`SimulatedController`]) and returns a [`Driver`] through which buffers
//! are allocated and block-aligned reads and writes are issued.

pub mod bench;
pub mod builder;
pub mod cmd;
pub mod config;
pub mod driver;
pub mod error;
pub mod memory;
pub mod nvme;
pub mod pci;
pub mod queues;
pub mod request;
pub mod sim;
pub mod transport;

pub use config::Config;
pub use driver::{Driver, Ticket};
pub use error::{Error, Result, StatusCode};
pub use memory::{DmaBuffer, HugePageAllocator, MemorySource, HUGE_PAGE_SIZE};
pub use nvme::{ControllerInfo, NvmeDevice};
pub use queues::{NvmeQueuePair, QUEUE_LENGTH};
pub use sim::SimulatedController;
pub use transport::Transport;

/// Bring up the controller described by `config`.
pub fn initialize(config: &Config) -> Result<Driver> {
    Driver::initialize(config)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NvmeNamespace {
    pub id: u32,
    pub blocks: u64,
    pub block_size: u64,
}

impl NvmeNamespace {
    pub fn size_bytes(&self) -> u64 {
        self.blocks * self.block_size
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NvmeStats {
    pub completions: u64,
    pub submissions: u64,
}

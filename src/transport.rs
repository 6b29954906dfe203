//! Register-level access to an NVMe controller.
//!
//! The driver only ever talks to the device through [`Transport`]: BAR0
//! register reads and writes, including doorbells. [`crate::pci::PciTransport`]
//! maps a real device, [`crate::sim::SimulatedController`] emulates one in
//! memory.

/// NVMe spec 3.1 controller registers, 32 bit wide
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NvmeRegs32 {
    /// Version
    VS = 0x8,
    /// Interrupt mask set
    INTMS = 0xC,
    /// Interrupt mask clear
    INTMC = 0x10,
    /// Controller configuration
    CC = 0x14,
    /// Controller status
    CSTS = 0x1C,
    /// Admin queue attributes
    AQA = 0x24,
}

/// NVMe spec 3.1 controller registers, 64 bit wide
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NvmeRegs64 {
    /// Controller capabilities
    CAP = 0x0,
    /// Admin submission queue base address
    ASQ = 0x28,
    /// Admin completion queue base address
    ACQ = 0x30,
}

/// First doorbell register
pub const DOORBELL_BASE: usize = 0x1000;

// CC fields
pub const CC_EN: u32 = 1;
pub const CC_CSS_NVM: u32 = 0 << 4;
pub const CC_MPS_SHIFT: u32 = 7;
pub const CC_SHN_NORMAL: u32 = 1 << 14;
pub const CC_SHN_MASK: u32 = 3 << 14;
pub const CC_IOSQES: u32 = 6 << 16;
pub const CC_IOCQES: u32 = 4 << 20;

// CSTS fields
pub const CSTS_RDY: u32 = 1;
pub const CSTS_CFS: u32 = 1 << 1;
pub const CSTS_SHST_MASK: u32 = 3 << 2;
pub const CSTS_SHST_COMPLETE: u32 = 2 << 2;

/// Decoded CAP register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Maximum queue entries supported (1's based)
    pub max_queue_entries: usize,
    /// Worst case time to become ready, in milliseconds
    pub timeout_ms: u64,
    /// Doorbell stride exponent: registers are `4 << dstrd` bytes apart
    pub doorbell_stride: u8,
    /// Minimum memory page size in bytes
    pub min_page_size: usize,
}

impl From<u64> for Capabilities {
    fn from(cap: u64) -> Self {
        Self {
            max_queue_entries: (cap & 0xffff) as usize + 1,
            timeout_ms: ((cap >> 24) & 0xff) * 500,
            doorbell_stride: ((cap >> 32) & 0xf) as u8,
            min_page_size: 1 << (12 + ((cap >> 48) & 0xf)),
        }
    }
}

/// Offset of the doorbell register of queue `qid`.
///
/// Submission tail doorbells sit at even indices, completion head doorbells
/// at odd ones.
pub fn doorbell_offset(qid: u16, completion: bool, dstrd: u8) -> usize {
    DOORBELL_BASE + (2 * qid as usize + completion as usize) * (4 << dstrd)
}

/// Inverse of [`doorbell_offset`].
pub fn decode_doorbell(offset: usize, dstrd: u8) -> Option<(u16, bool)> {
    let index = offset.checked_sub(DOORBELL_BASE)?;
    let stride = 4 << dstrd;
    if index % stride != 0 {
        return None;
    }
    let index = index / stride;
    Some(((index / 2) as u16, index % 2 == 1))
}

/// Register window of one controller.
///
/// Implementations must tolerate concurrent access from several queue pairs;
/// ordering between doorbell writes and ring memory is the caller's job.
pub trait Transport: Send + Sync {
    /// Stable identity of the device, e.g. its PCI address.
    fn name(&self) -> &str;

    /// Address the register window is mapped at.
    fn base_address(&self) -> usize;

    fn read32(&self, offset: usize) -> u32;

    fn write32(&self, offset: usize, value: u32);

    fn read64(&self, offset: usize) -> u64;

    fn write64(&self, offset: usize, value: u64);

    fn read_reg32(&self, reg: NvmeRegs32) -> u32 {
        self.read32(reg as usize)
    }

    fn write_reg32(&self, reg: NvmeRegs32, value: u32) {
        self.write32(reg as usize, value)
    }

    fn read_reg64(&self, reg: NvmeRegs64) -> u64 {
        self.read64(reg as usize)
    }

    fn write_reg64(&self, reg: NvmeRegs64, value: u64) {
        self.write64(reg as usize, value)
    }
}

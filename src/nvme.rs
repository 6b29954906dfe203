use std::hint::spin_loop;
use std::sync::Arc;
use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};

use crate::cmd::NvmeCommand;
use crate::error::{Error, Result};
use crate::memory::{DmaBuffer, HugePageAllocator, PAGE_SIZE};
use crate::queues::{Completion, NvmeQueuePair, MAX_PRP_TRANSFER};
use crate::transport::*;
use crate::NvmeNamespace;

/// Entries in the admin submission and completion queues
pub const ADMIN_QUEUE_LENGTH: usize = 32;

/// What bring-up learned about the controller and its namespace.
#[derive(Debug, Clone)]
pub struct ControllerInfo {
    pub name: String,
    pub base_address: usize,
    pub version: u32,
    pub vendor_id: u16,
    pub serial: String,
    pub model: String,
    pub firmware: String,
    /// Largest single transfer the driver will issue, in bytes
    pub max_transfer_bytes: usize,
    pub max_queue_entries: usize,
    pub doorbell_stride: u8,
    pub namespace: NvmeNamespace,
}

impl ControllerInfo {
    pub fn namespace_bytes(&self) -> u64 {
        self.namespace.size_bytes()
    }

    /// `(major, minor, tertiary)` from the VS register.
    pub fn version_triple(&self) -> (u16, u8, u8) {
        (
            (self.version >> 16) as u16,
            (self.version >> 8) as u8,
            self.version as u8,
        )
    }
}

/// Identify controller fields the driver uses.
#[derive(Debug, Clone, Default)]
pub struct IdentifyController {
    pub vendor_id: u16,
    pub serial: String,
    pub model: String,
    pub firmware: String,
    pub mdts: u8,
}

impl IdentifyController {
    pub fn parse(data: &[u8]) -> Self {
        Self {
            vendor_id: LittleEndian::read_u16(&data[0..2]),
            serial: ascii_field(&data[4..24]),
            model: ascii_field(&data[24..64]),
            firmware: ascii_field(&data[64..72]),
            mdts: data[77],
        }
    }
}

/// Identify namespace fields the driver uses.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentifyNamespace {
    pub size: u64,
    pub capacity: u64,
    pub utilization: u64,
    pub block_size: u64,
}

impl IdentifyNamespace {
    pub fn parse(data: &[u8]) -> Self {
        let flbas = (data[26] & 0xf) as usize;
        let lbaf = LittleEndian::read_u32(&data[128 + 4 * flbas..132 + 4 * flbas]);
        let lbads = (lbaf >> 16) & 0xff;
        Self {
            size: LittleEndian::read_u64(&data[0..8]),
            capacity: LittleEndian::read_u64(&data[8..16]),
            utilization: LittleEndian::read_u64(&data[16..24]),
            block_size: if lbads >= 9 { 1 << lbads } else { 0 },
        }
    }
}

fn ascii_field(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .trim_matches(|c: char| c == '\0' || c.is_whitespace())
        .to_string()
}

/// One controller behind a [`Transport`], driven through its admin queue.
pub struct NvmeDevice {
    transport: Arc<dyn Transport>,
    admin: NvmeQueuePair,
    caps: Capabilities,
    ready_timeout: Duration,
    admin_timeout: Duration,
}

impl NvmeDevice {
    /// Reset the controller, install the admin queues and enable it.
    pub fn init(
        transport: Arc<dyn Transport>,
        allocator: &mut HugePageAllocator,
        admin_timeout: Duration,
    ) -> Result<Self> {
        let caps = Capabilities::from(transport.read_reg64(NvmeRegs64::CAP));
        if caps.min_page_size > PAGE_SIZE {
            return Err(Error::ControllerInit(format!(
                "controller needs pages of at least {} bytes",
                caps.min_page_size
            )));
        }
        let ready_timeout = Duration::from_millis(caps.timeout_ms.max(500));

        tracing::debug!(name = transport.name(), ?caps, "resetting controller");
        let cc = transport.read_reg32(NvmeRegs32::CC);
        transport.write_reg32(NvmeRegs32::CC, cc & !CC_EN);
        wait_for_status(transport.as_ref(), CSTS_RDY, 0, ready_timeout)
            .map_err(|_| Error::ControllerInit("timed out waiting for controller reset".into()))?;

        let admin = NvmeQueuePair::new(
            Arc::clone(&transport),
            allocator,
            0,
            ADMIN_QUEUE_LENGTH,
            caps.doorbell_stride,
        )?;
        let entries = (ADMIN_QUEUE_LENGTH - 1) as u32;
        transport.write_reg32(NvmeRegs32::AQA, (entries << 16) | entries);
        transport.write_reg64(NvmeRegs64::ASQ, admin.sub_queue.get_addr() as u64);
        transport.write_reg64(NvmeRegs64::ACQ, admin.comp_queue.get_addr() as u64);

        let device = Self {
            transport,
            admin,
            caps,
            ready_timeout,
            admin_timeout,
        };

        let cc = CC_EN | CC_CSS_NVM | (((PAGE_SIZE >> 12) as u32 - 1) << CC_MPS_SHIFT) | CC_IOSQES | CC_IOCQES;
        device.transport.write_reg32(NvmeRegs32::CC, cc);
        if let Err(e) = wait_for_status(device.transport.as_ref(), CSTS_RDY, CSTS_RDY, ready_timeout) {
            device.release(allocator)?;
            return Err(e);
        }
        tracing::info!(name = device.transport.name(), "controller enabled");
        Ok(device)
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    pub fn name(&self) -> &str {
        self.transport.name()
    }

    /// Run one admin command to completion.
    pub fn admin(&mut self, cmd: NvmeCommand, buffer: Option<&DmaBuffer>) -> Result<Completion> {
        let opcode = cmd.opcode;
        let id = self.admin.submit(cmd, buffer)?;
        let result = self.admin.wait(id, self.admin_timeout);
        if let Err(e) = &result {
            tracing::debug!(opcode, error = %e, "admin command failed");
        }
        result
    }

    pub fn identify_controller(&mut self, allocator: &mut HugePageAllocator) -> Result<IdentifyController> {
        let data = self.identify(allocator, |ptr| NvmeCommand::identify_controller(0, ptr))?;
        let ctrl = IdentifyController::parse(&data);
        tracing::info!(
            vendor = ctrl.vendor_id,
            model = %ctrl.model,
            serial = %ctrl.serial,
            firmware = %ctrl.firmware,
            mdts = ctrl.mdts,
            "identified controller"
        );
        Ok(ctrl)
    }

    pub fn identify_namespace_list(&mut self, allocator: &mut HugePageAllocator, base: u32) -> Result<Vec<u32>> {
        let data = self.identify(allocator, |ptr| NvmeCommand::identify_namespace_list(0, ptr, base))?;
        Ok(data
            .chunks_exact(4)
            .map(LittleEndian::read_u32)
            .take_while(|&id| id != 0)
            .collect())
    }

    pub fn identify_namespace(&mut self, allocator: &mut HugePageAllocator, ns_id: u32) -> Result<IdentifyNamespace> {
        let data = self.identify(allocator, |ptr| NvmeCommand::identify_namespace(0, ptr, ns_id))?;
        let ns = IdentifyNamespace::parse(&data);
        tracing::debug!(ns_id, blocks = ns.size, block_size = ns.block_size, "identified namespace");
        Ok(ns)
    }

    /// Identify the controller and namespace `ns_id` and work out transfer limits.
    pub fn probe(
        &mut self,
        allocator: &mut HugePageAllocator,
        ns_id: u32,
        max_transfer_bytes: usize,
    ) -> Result<ControllerInfo> {
        let ctrl = self.identify_controller(allocator)?;

        let active = self.identify_namespace_list(allocator, 0)?;
        if !active.contains(&ns_id) {
            return Err(Error::ControllerInit(format!("namespace {ns_id} is inactive")));
        }
        let ns = self.identify_namespace(allocator, ns_id)?;
        if ns.size == 0 || ns.block_size == 0 {
            return Err(Error::ControllerInit(format!("namespace {ns_id} is inactive")));
        }

        let mdts_bytes = match ctrl.mdts {
            0 => usize::MAX,
            mdts => 1usize
                .checked_shl(u32::from(mdts))
                .and_then(|pages| pages.checked_mul(self.caps.min_page_size))
                .unwrap_or(usize::MAX),
        };
        let max_transfer_bytes = mdts_bytes
            .min(max_transfer_bytes)
            .min(MAX_PRP_TRANSFER)
            .max(ns.block_size as usize);

        Ok(ControllerInfo {
            name: self.transport.name().to_string(),
            base_address: self.transport.base_address(),
            version: self.transport.read_reg32(NvmeRegs32::VS),
            vendor_id: ctrl.vendor_id,
            serial: ctrl.serial,
            model: ctrl.model,
            firmware: ctrl.firmware,
            max_transfer_bytes,
            max_queue_entries: self.caps.max_queue_entries,
            doorbell_stride: self.caps.doorbell_stride,
            namespace: NvmeNamespace {
                id: ns_id,
                blocks: ns.size,
                block_size: ns.block_size,
            },
        })
    }

    /// Allocate rings for I/O queue `qid` and register them with the controller.
    pub fn create_io_queue_pair(
        &mut self,
        allocator: &mut HugePageAllocator,
        qid: u16,
        len: usize,
    ) -> Result<NvmeQueuePair> {
        let len = len.min(self.caps.max_queue_entries);
        let pair = NvmeQueuePair::new(
            Arc::clone(&self.transport),
            allocator,
            qid,
            len,
            self.caps.doorbell_stride,
        )?;
        let size = pair.depth() as u16;

        let created = self
            .admin(
                NvmeCommand::create_io_completion_queue(0, qid, pair.comp_queue.get_addr(), size),
                None,
            )
            .and_then(|_| {
                let cmd = NvmeCommand::create_io_submission_queue(
                    0,
                    qid,
                    pair.sub_queue.get_addr(),
                    size,
                    qid,
                );
                self.admin(cmd, None).inspect_err(|_| {
                    let _ = self.admin(NvmeCommand::delete_io_completion_queue(0, qid), None);
                })
            });
        if let Err(e) = created {
            pair.release(allocator)?;
            return Err(e);
        }
        tracing::debug!(qid, len = pair.depth() + 1, "created io queue pair");
        Ok(pair)
    }

    /// Unregister an I/O queue pair and return its memory.
    pub fn delete_io_queue_pair(
        &mut self,
        pair: NvmeQueuePair,
        allocator: &mut HugePageAllocator,
    ) -> Result<()> {
        let qid = pair.id;
        let deleted = self
            .admin(NvmeCommand::delete_io_submission_queue(0, qid), None)
            .and_then(|_| self.admin(NvmeCommand::delete_io_completion_queue(0, qid), None));
        pair.release(allocator)?;
        tracing::debug!(qid, "deleted io queue pair");
        deleted.map(|_| ())
    }

    /// Normal shutdown, then release the admin queues.
    pub fn shutdown(self, allocator: &mut HugePageAllocator) -> Result<()> {
        let cc = self.transport.read_reg32(NvmeRegs32::CC);
        self.transport
            .write_reg32(NvmeRegs32::CC, (cc & !CC_SHN_MASK) | CC_SHN_NORMAL);
        let done = wait_for_status(
            self.transport.as_ref(),
            CSTS_SHST_MASK,
            CSTS_SHST_COMPLETE,
            self.ready_timeout,
        );
        tracing::info!(name = self.transport.name(), "controller shut down");
        self.release(allocator)?;
        done
    }

    fn release(self, allocator: &mut HugePageAllocator) -> Result<()> {
        self.admin.release(allocator)
    }

    fn identify(
        &mut self,
        allocator: &mut HugePageAllocator,
        cmd: impl FnOnce(usize) -> NvmeCommand,
    ) -> Result<Vec<u8>> {
        let buffer = allocator.allocate(PAGE_SIZE)?;
        let result = self.admin(cmd(buffer.phys_addr(0)), Some(&buffer));
        let data = buffer[..PAGE_SIZE].to_vec();
        // a timed out command keeps the page pinned until it drains
        drop(buffer);
        result.map(|_| data)
    }
}

/// Spin until `CSTS & mask == value`, failing early on controller fatal status.
fn wait_for_status(transport: &dyn Transport, mask: u32, value: u32, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        let csts = transport.read_reg32(NvmeRegs32::CSTS);
        if csts & CSTS_CFS != 0 {
            return Err(Error::ControllerInit("controller fatal status".into()));
        }
        if csts & mask == value {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(Error::ControllerInit(format!(
                "timed out waiting for status {value:#x} (csts {csts:#x})"
            )));
        }
        spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_identify_controller() {
        let mut data = vec![0u8; PAGE_SIZE];
        LittleEndian::write_u16(&mut data[0..2], 0x8086);
        data[4..12].copy_from_slice(b"SN123   ");
        data[24..33].copy_from_slice(b"Fast SSD ");
        data[64..68].copy_from_slice(b"1.0 ");
        data[77] = 5;

        let ctrl = IdentifyController::parse(&data);
        assert_eq!(ctrl.vendor_id, 0x8086);
        assert_eq!(ctrl.serial, "SN123");
        assert_eq!(ctrl.model, "Fast SSD");
        assert_eq!(ctrl.firmware, "1.0");
        assert_eq!(ctrl.mdts, 5);
    }

    #[test]
    fn parses_identify_namespace_lba_format() {
        let mut data = vec![0u8; PAGE_SIZE];
        LittleEndian::write_u64(&mut data[0..8], 1000);
        LittleEndian::write_u64(&mut data[8..16], 1000);
        data[26] = 1; // second lba format in use
        LittleEndian::write_u32(&mut data[128..132], 9 << 16);
        LittleEndian::write_u32(&mut data[132..136], 12 << 16);

        let ns = IdentifyNamespace::parse(&data);
        assert_eq!(ns.size, 1000);
        assert_eq!(ns.block_size, 4096);
    }
}

//! In-memory NVMe controller.
//!
//! [`SimulatedController`] implements [`Transport`] by emulating the register
//! file of a single-namespace controller. Ring doorbells make it fetch
//! submission entries, execute them against a sparse block store and post
//! completions with the proper phase tag, so the whole driver can run without
//! hardware.
//!
//! Bus addresses found in commands and queue registers are dereferenced as
//! pointers of this process: pair it only with
//! [`MemorySource::Anonymous`](crate::memory::MemorySource::Anonymous) pools.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::{mem, ptr};

use byteorder::{ByteOrder, LittleEndian};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::cmd::*;
use crate::config::{CompletionOrder, SimulatorConfig};
use crate::error::{StatusCode, SCT_COMMAND_SPECIFIC, SCT_GENERIC, SCT_MEDIA};
use crate::memory::PAGE_SIZE;
use crate::queues::{NvmeCompletion, QUEUE_LENGTH};
use crate::transport::*;

/// Namespace exposed by the simulator
pub const SIM_NAMESPACE_ID: u32 = 1;
/// PCI vendor id reported in identify controller (QEMU)
pub const SIM_VENDOR_ID: u16 = 0x1b36;
/// Version 1.4.0
const SIM_VERSION: u32 = 0x0001_0400;

const SC_SUCCESS: u8 = 0x00;
const SC_INVALID_OPCODE: u8 = 0x01;
const SC_INVALID_FIELD: u8 = 0x02;
const SC_INVALID_NAMESPACE: u8 = 0x0b;
const SC_LBA_OUT_OF_RANGE: u8 = 0x80;
const SC_COMPLETION_QUEUE_INVALID: u8 = 0x00;
const SC_INVALID_QUEUE_ID: u8 = 0x01;
const SC_INVALID_QUEUE_SIZE: u8 = 0x02;
const SC_INVALID_QUEUE_DELETION: u8 = 0x0c;
const SC_UNRECOVERED_READ: u8 = 0x81;

struct SimSq {
    base: usize,
    len: usize,
    head: usize,
    cqid: u16,
}

struct SimCq {
    base: usize,
    len: usize,
    head: usize,
    tail: usize,
    phase: bool,
}

struct SimState {
    cc: u32,
    csts: u32,
    aqa: u32,
    asq: u64,
    acq: u64,
    sqs: HashMap<u16, SimSq>,
    cqs: HashMap<u16, SimCq>,
    blocks: HashMap<u64, Box<[u8]>>,
    hold: bool,
    deferred: VecDeque<(u16, NvmeCompletion)>,
    media_errors: HashSet<u64>,
    fail_enable: bool,
    order: CompletionOrder,
    rng: StdRng,
    namespace_blocks: u64,
    block_size: u64,
    mdts: u8,
}

pub struct SimulatedController {
    name: String,
    config: SimulatorConfig,
    cap: u64,
    state: Mutex<SimState>,
}

impl SimulatedController {
    pub fn new(name: impl Into<String>, config: SimulatorConfig) -> Self {
        let cap = (QUEUE_LENGTH as u64 - 1) // MQES
            | (1 << 16) // contiguous queues required
            | (2 << 24) // 1s ready timeout
            | ((config.doorbell_stride as u64 & 0xf) << 32)
            | (1 << 37); // NVM command set
        let state = SimState {
            cc: 0,
            csts: 0,
            aqa: 0,
            asq: 0,
            acq: 0,
            sqs: HashMap::new(),
            cqs: HashMap::new(),
            blocks: HashMap::new(),
            hold: false,
            deferred: VecDeque::new(),
            media_errors: HashSet::new(),
            fail_enable: false,
            order: config.completion_order,
            rng: StdRng::seed_from_u64(config.seed),
            namespace_blocks: config.blocks,
            block_size: config.block_size,
            mdts: config.mdts,
        };
        Self {
            name: name.into(),
            config,
            cap,
            state: Mutex::new(state),
        }
    }

    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, SimulatorConfig::default())
    }

    /// Keep I/O completions back until released; commands still execute.
    pub fn hold_completions(&self, hold: bool) {
        let mut state = self.lock();
        state.hold = hold;
        if !hold {
            state.release_deferred();
        }
    }

    pub fn set_completion_order(&self, order: CompletionOrder) {
        self.lock().order = order;
    }

    /// Completions executed but not yet visible to the host.
    pub fn pending_completions(&self) -> usize {
        self.lock().deferred.len()
    }

    /// Make reads touching `lba` fail with an unrecovered read error.
    pub fn inject_media_error(&self, lba: u64) {
        self.lock().media_errors.insert(lba);
    }

    /// Make the next enable report controller fatal status.
    pub fn fail_next_enable(&self) {
        self.lock().fail_enable = true;
    }

    /// Number of blocks that were ever written.
    pub fn written_blocks(&self) -> usize {
        self.lock().blocks.len()
    }

    /// Register an I/O queue pair without going through admin commands.
    pub fn attach_io_queue(&self, qid: u16, sq_base: usize, cq_base: usize, len: usize) {
        let mut state = self.lock();
        state.cqs.insert(
            qid,
            SimCq {
                base: cq_base,
                len,
                head: 0,
                tail: 0,
                phase: true,
            },
        );
        state.sqs.insert(
            qid,
            SimSq {
                base: sq_base,
                len,
                head: 0,
                cqid: qid,
            },
        );
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Transport for SimulatedController {
    fn name(&self) -> &str {
        &self.name
    }

    fn base_address(&self) -> usize {
        self as *const Self as usize
    }

    fn read32(&self, offset: usize) -> u32 {
        let state = self.lock();
        match offset {
            o if o == NvmeRegs32::VS as usize => SIM_VERSION,
            o if o == NvmeRegs32::CC as usize => state.cc,
            o if o == NvmeRegs32::CSTS as usize => state.csts,
            o if o == NvmeRegs32::AQA as usize => state.aqa,
            o if o == NvmeRegs64::CAP as usize => self.cap as u32,
            _ => 0,
        }
    }

    fn write32(&self, offset: usize, value: u32) {
        let mut state = self.lock();
        match offset {
            o if o == NvmeRegs32::CC as usize => state.write_cc(value),
            o if o == NvmeRegs32::AQA as usize => state.aqa = value,
            o if o >= DOORBELL_BASE => match decode_doorbell(o, self.config.doorbell_stride) {
                Some((qid, false)) => state.ring_submission(&self.config, qid, value as usize),
                Some((qid, true)) => state.ring_completion(qid, value as usize),
                None => tracing::warn!(offset = o, "write to unaligned doorbell"),
            },
            _ => {}
        }
    }

    fn read64(&self, offset: usize) -> u64 {
        let state = self.lock();
        match offset {
            o if o == NvmeRegs64::CAP as usize => self.cap,
            o if o == NvmeRegs64::ASQ as usize => state.asq,
            o if o == NvmeRegs64::ACQ as usize => state.acq,
            _ => 0,
        }
    }

    fn write64(&self, offset: usize, value: u64) {
        let mut state = self.lock();
        match offset {
            o if o == NvmeRegs64::ASQ as usize => state.asq = value,
            o if o == NvmeRegs64::ACQ as usize => state.acq = value,
            _ => {}
        }
    }
}

impl SimState {
    fn write_cc(&mut self, value: u32) {
        let was_enabled = self.cc & CC_EN != 0;
        self.cc = value;

        if value & CC_EN != 0 && !was_enabled {
            if mem::take(&mut self.fail_enable) || self.asq == 0 || self.acq == 0 {
                self.csts |= CSTS_CFS;
                return;
            }
            let sq_len = (self.aqa & 0xfff) as usize + 1;
            let cq_len = ((self.aqa >> 16) & 0xfff) as usize + 1;
            self.sqs.insert(
                0,
                SimSq {
                    base: self.asq as usize,
                    len: sq_len,
                    head: 0,
                    cqid: 0,
                },
            );
            self.cqs.insert(
                0,
                SimCq {
                    base: self.acq as usize,
                    len: cq_len,
                    head: 0,
                    tail: 0,
                    phase: true,
                },
            );
            self.csts = CSTS_RDY;
        } else if value & CC_EN == 0 && was_enabled {
            self.sqs.clear();
            self.cqs.clear();
            self.deferred.clear();
            self.csts = 0;
        } else if value & CC_EN == 0 {
            self.csts &= !CSTS_CFS;
        }

        if value & CC_SHN_MASK != 0 {
            self.csts = (self.csts & !CSTS_SHST_MASK) | CSTS_SHST_COMPLETE;
        }
    }

    fn ring_submission(&mut self, config: &SimulatorConfig, qid: u16, tail: usize) {
        let Some(sq) = self.sqs.get(&qid) else {
            tracing::warn!(qid, "doorbell for unknown submission queue");
            return;
        };
        let (base, len, cqid, mut head) = (sq.base, sq.len, sq.cqid, sq.head);

        let mut produced = Vec::new();
        while head != tail % len {
            let cmd = unsafe { ptr::read_volatile((base as *const NvmeCommand).add(head)) };
            head = (head + 1) % len;
            if let Some(sq) = self.sqs.get_mut(&qid) {
                sq.head = head;
            }

            let (status, result) = if qid == 0 {
                self.execute_admin(&cmd)
            } else {
                self.execute_io(config, &cmd)
            };
            produced.push(NvmeCompletion {
                command_specific: result,
                sq_id: qid,
                c_id: cmd.c_id,
                status: status.0 << 1,
                ..Default::default()
            });
        }

        // only I/O completions are held back or reordered
        if qid == 0 {
            for entry in produced {
                if !self.post(cqid, entry) {
                    self.deferred.push_back((cqid, entry));
                }
            }
            return;
        }
        self.reorder(&mut produced);
        self.deferred.extend(produced.into_iter().map(|entry| (cqid, entry)));
        if !self.hold {
            self.flush_deferred();
        }
    }

    fn ring_completion(&mut self, qid: u16, head: usize) {
        if let Some(cq) = self.cqs.get_mut(&qid) {
            cq.head = head % cq.len;
        }
        if !self.hold {
            self.flush_deferred();
        }
    }

    fn release_deferred(&mut self) {
        let mut pending: Vec<_> = self.deferred.drain(..).collect();
        if self.order != CompletionOrder::InOrder {
            let mut entries: Vec<_> = pending.iter().map(|&(_, entry)| entry).collect();
            self.reorder(&mut entries);
            pending = entries
                .into_iter()
                .map(|entry| {
                    let sq_id = entry.sq_id;
                    let cqid = self.sqs.get(&sq_id).map_or(0, |sq| sq.cqid);
                    (cqid, entry)
                })
                .collect();
        }
        self.deferred.extend(pending);
        self.flush_deferred();
    }

    fn reorder(&mut self, entries: &mut [NvmeCompletion]) {
        match self.order {
            CompletionOrder::InOrder => {}
            CompletionOrder::Reversed => entries.reverse(),
            CompletionOrder::Shuffled => entries.shuffle(&mut self.rng),
        }
    }

    fn flush_deferred(&mut self) {
        while let Some((cqid, entry)) = self.deferred.pop_front() {
            if !self.post(cqid, entry) {
                self.deferred.push_front((cqid, entry));
                break;
            }
        }
    }

    /// Write a completion at the queue's tail; false if the queue is full.
    fn post(&mut self, cqid: u16, mut entry: NvmeCompletion) -> bool {
        let sq_id = entry.sq_id;
        let sq_head = self.sqs.get(&sq_id).map_or(0, |sq| sq.head);
        let Some(cq) = self.cqs.get_mut(&cqid) else {
            tracing::warn!(cqid, "dropping completion for deleted queue");
            return true;
        };
        if (cq.tail + 1) % cq.len == cq.head {
            return false;
        }

        entry.sq_head = sq_head as u16;
        entry.status = (entry.status & !1) | cq.phase as u16;
        unsafe { ptr::write_volatile((cq.base as *mut NvmeCompletion).add(cq.tail), entry) };

        cq.tail = (cq.tail + 1) % cq.len;
        if cq.tail == 0 {
            cq.phase = !cq.phase;
        }
        true
    }

    fn execute_admin(&mut self, cmd: &NvmeCommand) -> (StatusCode, u32) {
        let generic = |sc| (StatusCode::new(SCT_GENERIC, sc), 0);
        let specific = |sc| (StatusCode::new(SCT_COMMAND_SPECIFIC, sc), 0);
        let cdw10 = cmd.cdw10;
        let cdw11 = cmd.cdw11;
        let qid = (cdw10 & 0xffff) as u16;
        let size = (cdw10 >> 16) as usize + 1;
        let base = cmd.d_ptr[0] as usize;

        match cmd.opcode {
            ADMIN_IDENTIFY => self.identify(cmd),
            ADMIN_CREATE_IO_CQ => {
                if qid == 0 || self.cqs.contains_key(&qid) {
                    return specific(SC_INVALID_QUEUE_ID);
                }
                if size < 2 || size > QUEUE_LENGTH {
                    return specific(SC_INVALID_QUEUE_SIZE);
                }
                self.cqs.insert(
                    qid,
                    SimCq {
                        base,
                        len: size,
                        head: 0,
                        tail: 0,
                        phase: true,
                    },
                );
                generic(SC_SUCCESS)
            }
            ADMIN_CREATE_IO_SQ => {
                let cqid = (cdw11 >> 16) as u16;
                if qid == 0 || self.sqs.contains_key(&qid) {
                    return specific(SC_INVALID_QUEUE_ID);
                }
                if cqid == 0 || !self.cqs.contains_key(&cqid) {
                    return specific(SC_COMPLETION_QUEUE_INVALID);
                }
                if size < 2 || size > QUEUE_LENGTH {
                    return specific(SC_INVALID_QUEUE_SIZE);
                }
                self.sqs.insert(
                    qid,
                    SimSq {
                        base,
                        len: size,
                        head: 0,
                        cqid,
                    },
                );
                generic(SC_SUCCESS)
            }
            ADMIN_DELETE_IO_SQ => match qid {
                0 => specific(SC_INVALID_QUEUE_ID),
                _ if self.sqs.remove(&qid).is_none() => specific(SC_INVALID_QUEUE_ID),
                _ => generic(SC_SUCCESS),
            },
            ADMIN_DELETE_IO_CQ => {
                if qid == 0 || !self.cqs.contains_key(&qid) {
                    return specific(SC_INVALID_QUEUE_ID);
                }
                if self.sqs.values().any(|sq| sq.cqid == qid) {
                    return specific(SC_INVALID_QUEUE_DELETION);
                }
                self.cqs.remove(&qid);
                self.deferred.retain(|&(cqid, _)| cqid != qid);
                generic(SC_SUCCESS)
            }
            _ => generic(SC_INVALID_OPCODE),
        }
    }

    fn identify(&mut self, cmd: &NvmeCommand) -> (StatusCode, u32) {
        let mut data = vec![0u8; PAGE_SIZE];
        let ns_id = cmd.ns_id;
        match cmd.cdw10 & 0xff {
            CNS_CONTROLLER => self.identify_controller(&mut data),
            CNS_NAMESPACE => {
                if ns_id == SIM_NAMESPACE_ID {
                    self.identify_namespace(&mut data);
                } else if ns_id == 0 || ns_id == u32::MAX {
                    return (StatusCode::new(SCT_GENERIC, SC_INVALID_NAMESPACE), 0);
                }
            }
            CNS_ACTIVE_NAMESPACES => {
                if ns_id < SIM_NAMESPACE_ID {
                    LittleEndian::write_u32(&mut data[0..4], SIM_NAMESPACE_ID);
                }
            }
            _ => return (StatusCode::new(SCT_GENERIC, SC_INVALID_FIELD), 0),
        }
        let dest = cmd.d_ptr[0] as *mut u8;
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), dest, PAGE_SIZE) };
        (StatusCode::new(SCT_GENERIC, SC_SUCCESS), 0)
    }

    fn identify_controller(&self, data: &mut [u8]) {
        LittleEndian::write_u16(&mut data[0..2], SIM_VENDOR_ID);
        LittleEndian::write_u16(&mut data[2..4], SIM_VENDOR_ID);
        pad_ascii(&mut data[4..24], "SIM0001");
        pad_ascii(&mut data[24..64], "hugenvme simulated controller");
        pad_ascii(&mut data[64..72], "1.0");
        data[77] = self.mdts;
        data[512] = 0x66; // SQES
        data[513] = 0x44; // CQES
        LittleEndian::write_u32(&mut data[516..520], 1); // NN
    }

    fn identify_namespace(&self, data: &mut [u8]) {
        LittleEndian::write_u64(&mut data[0..8], self.namespace_blocks);
        LittleEndian::write_u64(&mut data[8..16], self.namespace_blocks);
        LittleEndian::write_u64(&mut data[16..24], self.blocks.len() as u64);
        data[25] = 0; // NLBAF, 0's based
        data[26] = 0; // FLBAS
        let lbads = self.block_size.trailing_zeros();
        LittleEndian::write_u32(&mut data[128..132], lbads << 16);
    }

    fn execute_io(&mut self, config: &SimulatorConfig, cmd: &NvmeCommand) -> (StatusCode, u32) {
        let generic = |sc| (StatusCode::new(SCT_GENERIC, sc), 0);
        if cmd.ns_id != SIM_NAMESPACE_ID {
            return generic(SC_INVALID_NAMESPACE);
        }

        let opcode = cmd.opcode;
        if opcode == IO_FLUSH {
            return generic(SC_SUCCESS);
        }
        if opcode != IO_READ && opcode != IO_WRITE {
            return generic(SC_INVALID_OPCODE);
        }

        let lba = cmd.lba();
        let count = cmd.block_count() as u64;
        if lba.checked_add(count).map_or(true, |end| end > config.blocks) {
            return generic(SC_LBA_OUT_OF_RANGE);
        }
        let block_size = config.block_size as usize;
        let len = count as usize * block_size;
        let [prp1, prp2] = cmd.d_ptr;
        let Some(segments) = prp_segments(prp1 as usize, prp2 as usize, len) else {
            return generic(SC_INVALID_FIELD);
        };

        if opcode == IO_READ {
            if (lba..lba + count).any(|block| self.media_errors.contains(&block)) {
                return (StatusCode::new(SCT_MEDIA, SC_UNRECOVERED_READ), 0);
            }
            let mut data = vec![0u8; len];
            for (i, chunk) in data.chunks_exact_mut(block_size).enumerate() {
                if let Some(stored) = self.blocks.get(&(lba + i as u64)) {
                    chunk.copy_from_slice(stored);
                }
            }
            scatter(&data, &segments);
        } else {
            let data = gather(&segments, len);
            for (i, chunk) in data.chunks_exact(block_size).enumerate() {
                self.blocks.insert(lba + i as u64, chunk.into());
            }
        }
        generic(SC_SUCCESS)
    }
}

fn pad_ascii(field: &mut [u8], value: &str) {
    field.fill(b' ');
    field[..value.len()].copy_from_slice(value.as_bytes());
}

/// Walk PRP1/PRP2 into `(address, length)` segments covering `len` bytes.
fn prp_segments(prp1: usize, prp2: usize, len: usize) -> Option<Vec<(usize, usize)>> {
    let first = (PAGE_SIZE - prp1 % PAGE_SIZE).min(len);
    let mut segments = vec![(prp1, first)];
    let mut remaining = len - first;
    if remaining == 0 {
        return Some(segments);
    }
    if remaining <= PAGE_SIZE {
        segments.push((prp2, remaining));
        return Some(segments);
    }
    if prp2 % 8 != 0 {
        return None;
    }
    let list = prp2 as *const u64;
    let mut index = 0;
    while remaining > 0 {
        if index >= PAGE_SIZE / 8 {
            return None;
        }
        let addr = unsafe { ptr::read_volatile(list.add(index)) } as usize;
        let chunk = remaining.min(PAGE_SIZE);
        segments.push((addr, chunk));
        remaining -= chunk;
        index += 1;
    }
    Some(segments)
}

fn gather(segments: &[(usize, usize)], len: usize) -> Vec<u8> {
    let mut data = Vec::with_capacity(len);
    for &(addr, chunk) in segments {
        data.extend_from_slice(unsafe { std::slice::from_raw_parts(addr as *const u8, chunk) });
    }
    data
}

fn scatter(data: &[u8], segments: &[(usize, usize)]) {
    let mut offset = 0;
    for &(addr, chunk) in segments {
        unsafe { ptr::copy_nonoverlapping(data[offset..].as_ptr(), addr as *mut u8, chunk) };
        offset += chunk;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{HugePageAllocator, MemorySource};
    use crate::nvme::NvmeDevice;
    use std::sync::Arc;
    use std::time::Duration;

    fn device(sim: &Arc<SimulatedController>) -> (NvmeDevice, HugePageAllocator) {
        let mut allocator =
            HugePageAllocator::new(&MemorySource::Anonymous, PAGE_SIZE, 256).unwrap();
        let transport: Arc<dyn Transport> = sim.clone();
        let device = NvmeDevice::init(transport, &mut allocator, Duration::from_secs(1)).unwrap();
        (device, allocator)
    }

    #[test]
    fn enable_requires_admin_queues() {
        let sim = SimulatedController::with_defaults("sim-enable");
        sim.write32(NvmeRegs32::CC as usize, CC_EN);
        assert_eq!(sim.read32(NvmeRegs32::CSTS as usize) & CSTS_CFS, CSTS_CFS);

        sim.write32(NvmeRegs32::CC as usize, 0);
        assert_eq!(sim.read32(NvmeRegs32::CSTS as usize), 0);
    }

    #[test]
    fn probe_reports_configured_geometry() {
        let config = SimulatorConfig {
            blocks: 4096,
            block_size: 4096,
            mdts: 5,
            doorbell_stride: 2,
            ..Default::default()
        };
        let sim = Arc::new(SimulatedController::new("sim-probe", config));
        let (mut device, mut allocator) = device(&sim);
        assert_eq!(device.capabilities().doorbell_stride, 2);

        let info = device.probe(&mut allocator, SIM_NAMESPACE_ID, 1 << 30).unwrap();
        assert_eq!(info.vendor_id, SIM_VENDOR_ID);
        assert_eq!(info.serial, "SIM0001");
        assert_eq!(info.namespace.blocks, 4096);
        assert_eq!(info.namespace.block_size, 4096);
        assert_eq!(info.max_transfer_bytes, PAGE_SIZE << 5);
        assert_eq!(info.version_triple(), (1, 4, 0));

        assert!(matches!(
            device.probe(&mut allocator, 2, 1 << 20),
            Err(crate::Error::ControllerInit(_))
        ));
    }

    #[test]
    fn io_queue_lifecycle_through_admin_commands() {
        let sim = Arc::new(SimulatedController::with_defaults("sim-queues"));
        let (mut device, mut allocator) = device(&sim);
        let pages = allocator.free_pages();

        let pair = device.create_io_queue_pair(&mut allocator, 1, 64).unwrap();
        // a second queue with the same id is rejected and cleaned up
        assert!(matches!(
            device.create_io_queue_pair(&mut allocator, 1, 64),
            Err(crate::Error::Io { .. })
        ));
        device.delete_io_queue_pair(pair, &mut allocator).unwrap();
        assert_eq!(allocator.free_pages(), pages);

        device.shutdown(&mut allocator).unwrap();
        let csts = sim.read32(NvmeRegs32::CSTS as usize);
        assert_eq!(csts & CSTS_SHST_MASK, CSTS_SHST_COMPLETE);
    }

    #[test]
    fn fatal_status_fails_bring_up() {
        let sim = Arc::new(SimulatedController::with_defaults("sim-fatal"));
        sim.fail_next_enable();
        let mut allocator =
            HugePageAllocator::new(&MemorySource::Anonymous, PAGE_SIZE, 64).unwrap();
        let transport: Arc<dyn Transport> = sim.clone();
        let pages = allocator.free_pages();
        assert!(matches!(
            NvmeDevice::init(transport, &mut allocator, Duration::from_secs(1)),
            Err(crate::Error::ControllerInit(_))
        ));
        assert_eq!(allocator.free_pages(), pages);
    }

    #[test]
    fn prp_walk_covers_list_pages() {
        let list = vec![0x10_000u64, 0x11_000, 0x12_000];
        let segments =
            prp_segments(0x1800, list.as_ptr() as usize, 2048 + 3 * PAGE_SIZE).unwrap();
        assert_eq!(
            segments,
            vec![(0x1800, 2048), (0x10_000, 4096), (0x11_000, 4096), (0x12_000, 4096)]
        );

        // second page addressed directly
        let segments = prp_segments(0x1000, 0x9000, 2 * PAGE_SIZE).unwrap();
        assert_eq!(segments, vec![(0x1000, 4096), (0x9000, 4096)]);
    }
}

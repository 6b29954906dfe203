use std::collections::HashSet;
use std::hint::spin_loop;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Poll, Waker};
use std::time::{Duration, Instant};

use lazy_static::lazy_static;

use crate::builder::{CommandBuilder, IoOpcode};
use crate::cmd::NvmeCommand;
use crate::config::{Backend, Config};
use crate::error::{Error, Result};
use crate::memory::{BufferId, DmaBuffer, HugePageAllocator};
use crate::nvme::{ControllerInfo, NvmeDevice};
use crate::pci::PciTransport;
use crate::queues::{CommandId, NvmeQueuePair};
use crate::sim::SimulatedController;
use crate::transport::Transport;
use crate::NvmeStats;

/// Device name used for the simulated backend created by [`Driver::initialize`].
pub const SIMULATED_DEVICE: &str = "simulated";

lazy_static! {
    static ref ATTACHED: Mutex<HashSet<String>> = Mutex::new(HashSet::new());
}

/// Claim on a device name, released on drop.
#[derive(Debug)]
struct Registration(String);

impl Registration {
    fn claim(name: &str) -> Result<Self> {
        if !lock(&ATTACHED).insert(name.to_string()) {
            return Err(Error::AlreadyInitialized(name.to_string()));
        }
        Ok(Self(name.to_string()))
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        lock(&ATTACHED).remove(&self.0);
    }
}

/// An in-flight command issued through [`Driver::submit_read`],
/// [`Driver::submit_write`] or [`Driver::submit_flush`].
#[derive(Debug, PartialEq, Eq)]
#[must_use = "an unawaited ticket leaves its command outstanding"]
pub struct Ticket {
    queue: usize,
    id: CommandId,
}

impl Ticket {
    /// Index of the I/O queue pair carrying the command.
    pub fn queue(&self) -> usize {
        self.queue
    }

    pub fn command_id(&self) -> CommandId {
        self.id
    }
}

/// An attached controller with its I/O queue pairs and buffer pool.
///
/// Every operation takes `&self`; each queue pair and the allocator sit
/// behind their own mutex so several threads may issue I/O concurrently.
/// Commands are spread over the queue pairs round-robin.
pub struct Driver {
    nvme: Mutex<Option<NvmeDevice>>,
    pairs: Vec<Mutex<NvmeQueuePair>>,
    allocator: Mutex<HugePageAllocator>,
    info: ControllerInfo,
    builder: CommandBuilder,
    timeout: Duration,
    next_queue: AtomicUsize,
    registration: Option<Registration>,
}

impl Driver {
    /// Bring up the controller selected by `config`.
    pub fn initialize(config: &Config) -> Result<Self> {
        config.validate()?;
        let transport: Arc<dyn Transport> = match config.device.backend {
            Backend::Pci => {
                let address = config.device.pci_address.as_deref().ok_or_else(|| {
                    Error::Config("pci backend needs device.pci_address".into())
                })?;
                Arc::new(PciTransport::open(address).map_err(bring_up)?)
            }
            Backend::Simulated => Arc::new(SimulatedController::new(
                SIMULATED_DEVICE,
                config.simulator.clone(),
            )),
        };
        Self::with_transport(config, transport)
    }

    /// Bring up the controller behind `transport`.
    ///
    /// Fails with [`Error::AlreadyInitialized`] while another live driver
    /// owns a device of the same name.
    pub fn with_transport(config: &Config, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        let registration = Registration::claim(transport.name())?;

        let mut allocator = HugePageAllocator::new(
            &config.memory_source(),
            config.memory.page_size,
            config.memory.pool_pages,
        )?;
        let timeout = config.io.timeout();

        let mut nvme =
            NvmeDevice::init(Arc::clone(&transport), &mut allocator, timeout).map_err(bring_up)?;
        let info = match nvme.probe(
            &mut allocator,
            config.device.namespace_id,
            config.io.max_transfer_bytes,
        ) {
            Ok(info) => info,
            Err(e) => {
                abort_bring_up(nvme, Vec::new(), &mut allocator);
                return Err(bring_up(e));
            }
        };

        let mut pairs = Vec::with_capacity(config.queues.io_queues as usize);
        for qid in 1..=config.queues.io_queues {
            match nvme.create_io_queue_pair(&mut allocator, qid, config.queues.depth) {
                Ok(pair) => pairs.push(pair),
                Err(e) => {
                    abort_bring_up(nvme, pairs, &mut allocator);
                    return Err(bring_up(e));
                }
            }
        }

        tracing::info!(
            name = %info.name,
            model = %info.model,
            namespace = info.namespace.id,
            blocks = info.namespace.blocks,
            block_size = info.namespace.block_size,
            max_transfer = info.max_transfer_bytes,
            io_queues = pairs.len(),
            "driver initialized"
        );

        Ok(Self {
            nvme: Mutex::new(Some(nvme)),
            pairs: pairs.into_iter().map(Mutex::new).collect(),
            allocator: Mutex::new(allocator),
            builder: CommandBuilder::new(info.namespace, info.max_transfer_bytes),
            info,
            timeout,
            next_queue: AtomicUsize::new(0),
            registration: Some(registration),
        })
    }

    pub fn controller(&self) -> &ControllerInfo {
        &self.info
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_initialized(&self) -> bool {
        self.registration.is_some()
    }

    /// Number of I/O queue pairs.
    pub fn queue_count(&self) -> usize {
        self.pairs.len()
    }

    /// Allocate a zeroed, pinned buffer from the driver's pool.
    pub fn allocate(&self, size: usize) -> Result<DmaBuffer> {
        self.ensure_live()?;
        lock(&self.allocator).allocate(size)
    }

    /// Return `buffer` to the pool.
    ///
    /// A buffer still referenced by an outstanding command fails with
    /// [`Error::BufferBusy`]; its pages are reclaimed once that command's
    /// completion has been drained. Dropping a buffer releases it the same way.
    pub fn free(&self, buffer: DmaBuffer) -> Result<()> {
        let id = buffer.id();
        let result = lock(&self.allocator).free(buffer);
        if let Err(Error::BufferBusy(_)) = result {
            tracing::debug!(id, "freeing busy buffer deferred");
        }
        result
    }

    /// Bytes still free in the pool.
    pub fn free_bytes(&self) -> usize {
        let allocator = lock(&self.allocator);
        allocator.free_pages() * allocator.page_size()
    }

    /// Read `size` bytes at byte `offset` into `buffer`, waiting for completion.
    pub fn read(&self, buffer: &mut DmaBuffer, offset: u64, size: usize) -> Result<()> {
        let ticket = self.submit(IoOpcode::Read, buffer, offset, size)?;
        self.wait(ticket)
    }

    /// Write `size` bytes of `buffer` to byte `offset`, waiting for completion.
    pub fn write(&self, buffer: &DmaBuffer, offset: u64, size: usize) -> Result<()> {
        let ticket = self.submit(IoOpcode::Write, buffer, offset, size)?;
        self.wait(ticket)
    }

    /// Queue a read without waiting for it.
    ///
    /// `buffer` must not be touched until the ticket has completed.
    pub fn submit_read(&self, buffer: &mut DmaBuffer, offset: u64, size: usize) -> Result<Ticket> {
        self.submit(IoOpcode::Read, buffer, offset, size)
    }

    /// Queue a write without waiting for it.
    pub fn submit_write(&self, buffer: &DmaBuffer, offset: u64, size: usize) -> Result<Ticket> {
        self.submit(IoOpcode::Write, buffer, offset, size)
    }

    /// Queue a flush of the namespace's volatile write cache.
    pub fn submit_flush(&self) -> Result<Ticket> {
        self.ensure_live()?;
        let queue = self.pick_queue();
        let entry = NvmeCommand::flush(0, self.info.namespace.id);
        let id = self.pair(queue)?.submit(entry, None)?;
        Ok(Ticket { queue, id })
    }

    /// Flush the namespace, waiting for completion.
    pub fn flush(&self) -> Result<()> {
        let ticket = self.submit_flush()?;
        self.wait(ticket)
    }

    /// Drain every completion queue; returns the number of entries consumed.
    pub fn poll_completions(&self) -> usize {
        let mut drained = 0;
        for pair in &self.pairs {
            let mut pair = lock(pair);
            while pair.poll().is_some() {
                drained += 1;
            }
        }
        drained
    }

    /// The ticket's result if its completion has arrived.
    pub fn try_complete(&self, ticket: &Ticket) -> Option<Result<()>> {
        let mut pair = match self.pair(ticket.queue) {
            Ok(pair) => pair,
            Err(e) => return Some(Err(e)),
        };
        let completion = pair.try_complete(ticket.id)?;
        tracing::trace!(
            queue = ticket.queue,
            c_id = ticket.id.0,
            status = completion.status,
            "ticket completed"
        );
        Some(completion.into_result().map(drop))
    }

    /// The ticket's result if its completion has arrived, otherwise park
    /// `waker` until a poll of the ring consumes it.
    pub(crate) fn poll_ticket(&self, ticket: &Ticket, waker: &Waker) -> Poll<Result<()>> {
        match self.pair(ticket.queue) {
            Ok(mut pair) => pair
                .poll_waiting(ticket.id, waker)
                .map(|completion| completion.into_result().map(drop)),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    /// Spin until the ticket completes or the I/O timeout elapses.
    ///
    /// On timeout the command is abandoned: its buffer stays busy until the
    /// late completion has been drained.
    pub fn wait(&self, ticket: Ticket) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        loop {
            if let Some(result) = self.try_complete(&ticket) {
                return result;
            }
            if Instant::now() >= deadline {
                let mut pair = self.pair(ticket.queue)?;
                if let Some(completion) = pair.try_complete(ticket.id) {
                    return completion.into_result().map(drop);
                }
                pair.abandon(ticket.id);
                tracing::warn!(
                    queue = ticket.queue,
                    c_id = ticket.id.0,
                    timeout = ?self.timeout,
                    "command timed out"
                );
                return Err(Error::IoTimeout(self.timeout));
            }
            spin_loop();
        }
    }

    /// Stop waiting for `ticket`; a late completion is drained, not matched.
    pub fn abandon(&self, ticket: Ticket) {
        if let Ok(mut pair) = self.pair(ticket.queue) {
            pair.abandon(ticket.id);
        }
    }

    /// Commands the device still owns across all queue pairs.
    pub fn outstanding(&self) -> usize {
        self.pairs.iter().map(|pair| lock(pair).in_flight()).sum()
    }

    pub fn stats(&self) -> NvmeStats {
        self.pairs.iter().fold(NvmeStats::default(), |mut total, pair| {
            let pair = lock(pair);
            total.submissions += pair.stats().submissions;
            total.completions += pair.stats().completions;
            total
        })
    }

    /// Delete the I/O queues, shut the controller down and release the device.
    ///
    /// Fails with [`Error::QueuesNotDrained`] while any command is
    /// outstanding, leaving the driver usable.
    pub fn finalize(&mut self) -> Result<()> {
        self.ensure_live()?;
        let outstanding = self.outstanding();
        if outstanding > 0 {
            return Err(Error::QueuesNotDrained { outstanding });
        }
        let result = self.teardown();
        tracing::info!(name = %self.info.name, "driver finalized");
        result
    }

    fn submit(&self, opcode: IoOpcode, buffer: &DmaBuffer, offset: u64, size: usize) -> Result<Ticket> {
        self.ensure_live()?;
        let block_size = self.info.namespace.block_size;
        if offset % block_size != 0 || size as u64 % block_size != 0 {
            return Err(Error::Misaligned {
                offset,
                size,
                block_size,
            });
        }
        if !lock(&self.allocator).owns(buffer) {
            return Err(Error::InvalidHandle(buffer.id()));
        }
        if self.is_buffer_busy(buffer.id()) {
            return Err(Error::BufferBusy(buffer.id()));
        }

        let lba = offset / block_size;
        let blocks = size as u64 / block_size;
        let command = match opcode {
            IoOpcode::Read => self.builder.build_read(lba, blocks, buffer)?,
            IoOpcode::Write => self.builder.build_write(lba, blocks, buffer)?,
        };

        let queue = self.pick_queue();
        let id = self.pair(queue)?.submit_io(command)?;
        Ok(Ticket { queue, id })
    }

    fn pair(&self, queue: usize) -> Result<MutexGuard<'_, NvmeQueuePair>> {
        self.pairs.get(queue).map(lock).ok_or(Error::NotInitialized)
    }

    fn pick_queue(&self) -> usize {
        self.next_queue.fetch_add(1, Ordering::Relaxed) % self.pairs.len()
    }

    fn is_buffer_busy(&self, id: BufferId) -> bool {
        self.pairs.iter().any(|pair| lock(pair).is_buffer_busy(id))
    }

    fn ensure_live(&self) -> Result<()> {
        if self.registration.is_some() {
            Ok(())
        } else {
            Err(Error::NotInitialized)
        }
    }

    fn teardown(&mut self) -> Result<()> {
        let allocator = self
            .allocator
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);

        let Some(mut nvme) = self.nvme.get_mut().unwrap_or_else(PoisonError::into_inner).take() else {
            return Ok(());
        };
        let mut failure = None;
        for pair in self.pairs.drain(..).rev() {
            let pair = pair.into_inner().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = nvme.delete_io_queue_pair(pair, allocator) {
                tracing::warn!(error = %e, "deleting io queue pair failed");
                failure.get_or_insert(e);
            }
        }
        if let Err(e) = nvme.shutdown(allocator) {
            tracing::warn!(error = %e, "controller shutdown failed");
            failure.get_or_insert(e);
        }
        self.registration = None;
        failure.map_or(Ok(()), Err)
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        if self.registration.is_none() {
            return;
        }
        let outstanding = self.outstanding();
        if outstanding > 0 {
            tracing::warn!(outstanding, "dropping driver with commands in flight");
        }
        if let Err(e) = self.teardown() {
            tracing::warn!(error = %e, "teardown on drop failed");
        }
    }
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("controller", &self.info.name)
            .field("io_queues", &self.pairs.len())
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

/// Bring-up failures reported by the device surface as [`Error::ControllerInit`].
fn bring_up(e: Error) -> Error {
    match e {
        Error::Io { .. } | Error::IoTimeout(_) | Error::Os(_) => Error::ControllerInit(e.to_string()),
        e => e,
    }
}

fn abort_bring_up(mut nvme: NvmeDevice, pairs: Vec<NvmeQueuePair>, allocator: &mut HugePageAllocator) {
    for pair in pairs.into_iter().rev() {
        if let Err(e) = nvme.delete_io_queue_pair(pair, allocator) {
            tracing::warn!(error = %e, "cleanup of io queue pair failed");
        }
    }
    if let Err(e) = nvme.shutdown(allocator) {
        tracing::warn!(error = %e, "cleanup shutdown failed");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver(name: &str) -> (Arc<SimulatedController>, Driver) {
        let config = Config::simulated();
        let sim = Arc::new(SimulatedController::new(name, config.simulator.clone()));
        let driver = Driver::with_transport(&config, sim.clone()).unwrap();
        (sim, driver)
    }

    #[test]
    fn registration_is_exclusive_per_name() {
        let first = Registration::claim("driver-unit-registration").unwrap();
        assert!(matches!(
            Registration::claim("driver-unit-registration"),
            Err(Error::AlreadyInitialized(_))
        ));
        drop(first);
        assert!(Registration::claim("driver-unit-registration").is_ok());
    }

    #[test]
    fn tickets_spread_over_queues() {
        let mut config = Config::simulated();
        config.queues.io_queues = 3;
        let sim = Arc::new(SimulatedController::new("driver-unit-rr", config.simulator.clone()));
        let driver = Driver::with_transport(&config, sim).unwrap();
        assert_eq!(driver.queue_count(), 3);

        let buffer = driver.allocate(512).unwrap();
        let mut queues = Vec::new();
        for _ in 0..6 {
            let ticket = driver.submit_write(&buffer, 0, 512).unwrap();
            queues.push(ticket.queue());
            driver.wait(ticket).unwrap();
        }
        assert_eq!(queues, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn foreign_buffer_is_rejected() {
        let (_sim, driver) = driver("driver-unit-foreign");
        let mut other = HugePageAllocator::new(
            &crate::memory::MemorySource::Anonymous,
            crate::memory::PAGE_SIZE,
            4,
        )
        .unwrap();
        let foreign = other.allocate(512).unwrap();
        let id = foreign.id();
        assert!(matches!(driver.write(&foreign, 0, 512), Err(Error::InvalidHandle(i)) if i == id));
        assert!(matches!(driver.free(foreign), Err(Error::InvalidHandle(_))));
    }

    #[test]
    fn busy_buffer_free_is_deferred() {
        let (sim, driver) = driver("driver-unit-parked");
        let before = driver.free_bytes();
        let buffer = driver.allocate(4096).unwrap();

        sim.hold_completions(true);
        let ticket = driver.submit_write(&buffer, 0, 4096).unwrap();
        assert!(matches!(driver.free(buffer), Err(Error::BufferBusy(_))));
        assert!(driver.free_bytes() < before);

        sim.hold_completions(false);
        assert_eq!(driver.poll_completions(), 1);
        assert_eq!(driver.try_complete(&ticket).map(|r| r.is_ok()), Some(true));
        assert_eq!(driver.free_bytes(), before);
    }

    #[test]
    fn dropped_buffer_returns_to_pool() {
        let (sim, driver) = driver("driver-unit-dropped");
        let before = driver.free_bytes();
        drop(driver.allocate(4096).unwrap());
        assert_eq!(driver.free_bytes(), before);

        // dropped while the device still owns it: pages wait for the completion
        sim.hold_completions(true);
        let buffer = driver.allocate(4096).unwrap();
        let ticket = driver.submit_write(&buffer, 0, 4096).unwrap();
        drop(buffer);
        assert!(driver.free_bytes() < before);
        sim.hold_completions(false);
        driver.wait(ticket).unwrap();
        assert_eq!(driver.free_bytes(), before);
    }

    #[test]
    fn completed_ticket_after_finalize_reports_not_initialized() {
        let (_sim, mut driver) = driver("driver-unit-stale-ticket");
        let buffer = driver.allocate(512).unwrap();
        let ticket = driver.submit_write(&buffer, 0, 512).unwrap();
        assert_eq!(driver.poll_completions(), 1);
        driver.finalize().unwrap();
        assert!(matches!(driver.try_complete(&ticket), Some(Err(Error::NotInitialized))));
    }

    #[test]
    fn operations_after_finalize_fail() {
        let (_sim, mut driver) = driver("driver-unit-finalized");
        driver.finalize().unwrap();
        assert!(!driver.is_initialized());
        assert!(matches!(driver.allocate(512), Err(Error::NotInitialized)));
        assert!(matches!(driver.flush(), Err(Error::NotInitialized)));
        assert!(matches!(driver.finalize(), Err(Error::NotInitialized)));
    }
}

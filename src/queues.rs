use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;
use std::task::{Poll, Waker};
use std::time::{Duration, Instant};
use std::{hint::spin_loop, ptr};

use crate::builder::IoCommand;
use crate::cmd::NvmeCommand;
use crate::error::{Error, Result, StatusCode};
use crate::memory::*;
use crate::transport::{doorbell_offset, Transport};
use crate::NvmeStats;

/// NVMe spec 4.6
/// Completion queue entry
#[allow(dead_code)]
#[derive(Clone, Copy, Debug, Default)]
#[repr(C, packed)]
pub struct NvmeCompletion {
    /// Command specific
    pub command_specific: u32,
    /// Reserved
    pub _rsvd: u32,
    // Submission queue head
    pub sq_head: u16,
    // Submission queue ID
    pub sq_id: u16,
    // Command ID
    pub c_id: u16,
    //  Status field
    pub status: u16,
}

/// maximum amount of submission entries on a 2MiB huge page
pub const QUEUE_LENGTH: usize = 1024;

/// PRP entries in one list page
pub const PRP_LIST_ENTRIES: usize = PAGE_SIZE / 8;

/// Largest transfer describable by PRP1 plus a single list page
pub const MAX_PRP_TRANSFER: usize = PAGE_SIZE * PRP_LIST_ENTRIES;

/// Identifies a command on its queue pair until its completion is reaped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId(pub u16);

/// A consumed completion queue entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Completion {
    pub id: CommandId,
    /// Status field without the phase tag
    pub status: u16,
    pub phase: bool,
    pub sq_head: u16,
    /// Command specific dword 0
    pub result: u32,
}

impl Completion {
    pub fn status_code(&self) -> StatusCode {
        StatusCode::from(self.status)
    }

    pub fn is_success(&self) -> bool {
        self.status_code().is_success()
    }

    /// `Ok` for a successful completion, [`Error::Io`] otherwise.
    pub fn into_result(self) -> Result<Completion> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(Error::Io {
                status_code: self.status,
            })
        }
    }
}

impl From<NvmeCompletion> for Completion {
    fn from(entry: NvmeCompletion) -> Self {
        let status = entry.status;
        Self {
            id: CommandId(entry.c_id),
            status: status >> 1,
            phase: status & 1 == 1,
            sq_head: entry.sq_head,
            result: entry.command_specific,
        }
    }
}

/// Submission queue
#[derive(Debug)]
pub struct NvmeSubQueue {
    commands: Dma<NvmeCommand>,
    pub head: usize,
    pub tail: usize,
    len: usize,
    pub doorbell: usize,
}

impl NvmeSubQueue {
    pub fn new(allocator: &mut HugePageAllocator, len: usize, doorbell: usize) -> Result<Self> {
        let len = len.min(QUEUE_LENGTH);
        Ok(Self {
            commands: Dma::allocate(allocator, len)?,
            head: 0,
            tail: 0,
            len,
            doorbell,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub fn is_full(&self) -> bool {
        self.head == (self.tail + 1) % self.len
    }

    #[inline(always)]
    pub fn submit(&mut self, entry: NvmeCommand) -> usize {
        self.commands.write(self.tail, entry);

        self.tail = (self.tail + 1) % self.len;
        self.tail
    }

    pub fn get_addr(&self) -> usize {
        self.commands.phys
    }

    pub fn len(&self) -> usize {
        self.len
    }

    fn release(self, allocator: &mut HugePageAllocator) -> Result<()> {
        allocator.free(self.commands.into_buffer())
    }
}

/// Completion queue
#[derive(Debug)]
pub struct NvmeCompQueue {
    commands: Dma<NvmeCompletion>,
    head: usize,
    phase: bool,
    len: usize,
    pub doorbell: usize,
}

impl NvmeCompQueue {
    pub fn new(allocator: &mut HugePageAllocator, len: usize, doorbell: usize) -> Result<Self> {
        let len = len.min(QUEUE_LENGTH);
        Ok(Self {
            commands: Dma::allocate(allocator, len)?,
            head: 0,
            phase: true,
            len,
            doorbell,
        })
    }

    /// Consume the entry at head if its phase tag matches.
    ///
    /// Returns the new head, the entry and the slot it was read from.
    #[inline(always)]
    pub fn complete(&mut self) -> Option<(usize, NvmeCompletion, usize)> {
        let entry = self.commands.read(self.head);

        if ((entry.status & 1) == 1) == self.phase {
            let prev = self.head;
            self.head = (self.head + 1) % self.len;
            if self.head == 0 {
                self.phase = !self.phase;
            }
            Some((self.head, entry, prev))
        } else {
            None
        }
    }

    pub fn head(&self) -> usize {
        self.head
    }

    pub fn phase(&self) -> bool {
        self.phase
    }

    pub fn get_addr(&self) -> usize {
        self.commands.phys
    }

    fn release(self, allocator: &mut HugePageAllocator) -> Result<()> {
        allocator.free(self.commands.into_buffer())
    }
}

/// Lifecycle of one command identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    Free,
    /// Entry written to the ring, doorbell not yet rung
    Submitted,
    AwaitingCompletion,
    /// Completion consumed from the ring, waiting to be reaped
    Completed(Completion),
    /// Waiter gave up; the completion is drained when it arrives
    Abandoned,
}

impl SlotState {
    fn in_flight(&self) -> bool {
        matches!(
            self,
            SlotState::Submitted | SlotState::AwaitingCompletion | SlotState::Abandoned
        )
    }
}

#[derive(Debug)]
struct Slot {
    state: SlotState,
    pin: Option<BufferPin>,
    waker: Option<Waker>,
}

impl Slot {
    const FREE: Slot = Slot {
        state: SlotState::Free,
        pin: None,
        waker: None,
    };
}

/// A submission queue and its completion queue, plus per-command tracking.
///
/// Not internally synchronized: callers serialize access (the driver keeps
/// each pair behind its own mutex).
pub struct NvmeQueuePair {
    pub id: u16,
    pub sub_queue: NvmeSubQueue,
    pub comp_queue: NvmeCompQueue,
    slots: Vec<Slot>,
    /// Waiter that keeps polling the ring on behalf of the parked ones
    poller: Option<usize>,
    prp_lists: DmaBuffer,
    next_slot: usize,
    stats: NvmeStats,
    transport: Arc<dyn Transport>,
}

impl NvmeQueuePair {
    pub fn new(
        transport: Arc<dyn Transport>,
        allocator: &mut HugePageAllocator,
        id: u16,
        len: usize,
        doorbell_stride: u8,
    ) -> Result<Self> {
        let len = len.clamp(2, QUEUE_LENGTH);
        let sub_queue = NvmeSubQueue::new(allocator, len, doorbell_offset(id, false, doorbell_stride))?;
        let comp_queue =
            match NvmeCompQueue::new(allocator, len, doorbell_offset(id, true, doorbell_stride)) {
                Ok(queue) => queue,
                Err(e) => {
                    sub_queue.release(allocator)?;
                    return Err(e);
                }
            };
        let prp_lists = match allocator.allocate(len * PAGE_SIZE) {
            Ok(buffer) => buffer,
            Err(e) => {
                sub_queue.release(allocator)?;
                comp_queue.release(allocator)?;
                return Err(e);
            }
        };
        tracing::debug!(qid = id, len, "queue pair allocated");

        Ok(Self {
            id,
            sub_queue,
            comp_queue,
            slots: (0..len).map(|_| Slot::FREE).collect(),
            poller: None,
            prp_lists,
            next_slot: 0,
            stats: NvmeStats::default(),
            transport,
        })
    }

    /// Entries the submission ring can hold at once.
    pub fn depth(&self) -> usize {
        self.sub_queue.len() - 1
    }

    /// Submit a raw command; `buffer` marks the region it transfers to or from.
    #[tracing::instrument(level = "trace", skip(self, entry), fields(qid = self.id))]
    pub fn submit(&mut self, entry: NvmeCommand, buffer: Option<&DmaBuffer>) -> Result<CommandId> {
        let slot = self.reserve()?;
        Ok(self.push(slot, entry, buffer.map(DmaBuffer::pin)))
    }

    /// Submit a validated read or write, describing its buffer with PRPs.
    #[tracing::instrument(level = "trace", skip(self, command), fields(qid = self.id, lba = command.lba))]
    pub fn submit_io(&mut self, command: IoCommand<'_>) -> Result<CommandId> {
        let slot = self.reserve()?;
        let (prp1, prp2) = self.setup_prps(slot, command.buffer, command.transfer_len())?;
        let entry = NvmeCommand::io(
            command.opcode.opcode(),
            0,
            command.namespace_id,
            command.lba,
            command.block_count as u16,
            prp1,
            prp2,
        );
        Ok(self.push(slot, entry, Some(command.buffer.pin())))
    }

    /// Consume at most one completion from the ring.
    ///
    /// The entry is only valid if its phase tag matches the expected phase.
    /// A consumed completion moves its command to [`SlotState::Completed`],
    /// except for abandoned commands which are released right away.
    pub fn poll(&mut self) -> Option<Completion> {
        let (head, entry, _) = self.comp_queue.complete()?;
        self.transport.write32(self.comp_queue.doorbell, head as u32);

        let completion = Completion::from(entry);
        self.sub_queue.head = completion.sq_head as usize % self.sub_queue.len();
        self.stats.completions += 1;

        let index = completion.id.0 as usize;
        match self.slots.get(index).map(|slot| slot.state) {
            Some(SlotState::Submitted | SlotState::AwaitingCompletion) => {
                self.slots[index].state = SlotState::Completed(completion);
                // the device is done with the buffer
                self.slots[index].pin = None;
                tracing::trace!(qid = self.id, c_id = index, status = completion.status, "completed");
                if let Some(waker) = self.slots[index].waker.take() {
                    waker.wake();
                }
            }
            Some(SlotState::Abandoned) => {
                self.free_slot(index);
                tracing::warn!(
                    qid = self.id,
                    c_id = index,
                    status = completion.status,
                    "drained completion of abandoned command"
                );
            }
            _ => {
                tracing::warn!(qid = self.id, c_id = index, "completion for idle command id");
            }
        }
        Some(completion)
    }

    /// Take a completed command's completion, freeing its slot.
    pub fn reap(&mut self, id: CommandId) -> Option<Completion> {
        let index = id.0 as usize;
        match self.slots.get(index)?.state {
            SlotState::Completed(completion) => {
                self.free_slot(index);
                Some(completion)
            }
            _ => None,
        }
    }

    /// Reap `id` if done, polling the ring once dry otherwise.
    pub fn try_complete(&mut self, id: CommandId) -> Option<Completion> {
        if let Some(completion) = self.reap(id) {
            return Some(completion);
        }
        while self.poll().is_some() {}
        self.reap(id)
    }

    /// Reap `id` if done, otherwise park `waker` on its slot.
    ///
    /// One waiter per pair keeps polling the ring by waking itself again;
    /// the others sleep until a poll consumes their completion or the
    /// polling waiter leaves.
    pub fn poll_waiting(&mut self, id: CommandId, waker: &Waker) -> Poll<Completion> {
        if let Some(completion) = self.try_complete(id) {
            return Poll::Ready(completion);
        }
        let index = id.0 as usize;
        match self.slots.get_mut(index) {
            Some(slot) if matches!(slot.state, SlotState::Submitted | SlotState::AwaitingCompletion) => {
                if !slot.waker.as_ref().is_some_and(|parked| parked.will_wake(waker)) {
                    slot.waker = Some(waker.clone());
                }
            }
            _ => {
                waker.wake_by_ref();
                return Poll::Pending;
            }
        }
        if self.poller.is_none() {
            self.poller = Some(index);
        }
        if self.poller == Some(index) {
            waker.wake_by_ref();
        }
        Poll::Pending
    }

    /// Spin until `id` completes or `timeout` elapses.
    ///
    /// On timeout the command is abandoned and [`Error::IoTimeout`] returned.
    pub fn wait(&mut self, id: CommandId, timeout: Duration) -> Result<Completion> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(completion) = self.try_complete(id) {
                return completion.into_result();
            }
            if Instant::now() >= deadline {
                self.abandon(id);
                return Err(Error::IoTimeout(timeout));
            }
            spin_loop();
        }
    }

    /// Stop waiting for `id`. Its completion will still be drained.
    ///
    /// Returns false if the command was not in flight.
    pub fn abandon(&mut self, id: CommandId) -> bool {
        let index = id.0 as usize;
        match self.slots.get(index).map(|slot| slot.state) {
            Some(SlotState::Submitted | SlotState::AwaitingCompletion) => {
                self.slots[index].state = SlotState::Abandoned;
                self.slots[index].waker = None;
                self.step_down(index);
                tracing::debug!(qid = self.id, c_id = id.0, "command abandoned");
                true
            }
            Some(SlotState::Completed(_)) => {
                self.free_slot(index);
                false
            }
            _ => false,
        }
    }

    pub fn state(&self, id: CommandId) -> Option<SlotState> {
        self.slots.get(id.0 as usize).map(|slot| slot.state)
    }

    /// Commands the device still owns, abandoned ones included.
    pub fn in_flight(&self) -> usize {
        self.slots.iter().filter(|slot| slot.state.in_flight()).count()
    }

    pub fn is_buffer_busy(&self, buffer: BufferId) -> bool {
        self.slots
            .iter()
            .any(|slot| slot.state.in_flight() && slot.pin.as_ref().map(BufferPin::id) == Some(buffer))
    }

    pub fn stats(&self) -> &NvmeStats {
        &self.stats
    }

    /// Return the rings and PRP lists to `allocator`.
    pub fn release(self, allocator: &mut HugePageAllocator) -> Result<()> {
        self.sub_queue.release(allocator)?;
        self.comp_queue.release(allocator)?;
        allocator.free(self.prp_lists)
    }

    fn reserve(&self) -> Result<usize> {
        if self.sub_queue.is_full() {
            return Err(Error::QueueFull { queue: self.id });
        }
        let len = self.slots.len();
        (0..len)
            .map(|offset| (self.next_slot + offset) % len)
            .find(|&index| self.slots[index].state == SlotState::Free)
            .ok_or(Error::QueueFull { queue: self.id })
    }

    fn free_slot(&mut self, index: usize) {
        self.slots[index] = Slot::FREE;
        self.step_down(index);
    }

    /// Hand the polling duty on to another parked waiter.
    fn step_down(&mut self, index: usize) {
        if self.poller != Some(index) {
            return;
        }
        self.poller = None;
        let next = self
            .slots
            .iter()
            .filter(|slot| matches!(slot.state, SlotState::Submitted | SlotState::AwaitingCompletion))
            .find_map(|slot| slot.waker.as_ref());
        if let Some(waker) = next {
            waker.wake_by_ref();
        }
    }

    fn push(&mut self, slot: usize, mut entry: NvmeCommand, pin: Option<BufferPin>) -> CommandId {
        entry.c_id = slot as u16;
        self.slots[slot] = Slot {
            state: SlotState::Submitted,
            pin,
            waker: None,
        };
        let tail = self.sub_queue.submit(entry);

        // ring memory must be visible before the doorbell write
        fence(Ordering::SeqCst);
        self.transport.write32(self.sub_queue.doorbell, tail as u32);

        self.slots[slot].state = SlotState::AwaitingCompletion;
        self.stats.submissions += 1;
        self.next_slot = (slot + 1) % self.slots.len();
        CommandId(slot as u16)
    }

    fn setup_prps(&mut self, slot: usize, buffer: &DmaBuffer, len: usize) -> Result<(u64, u64)> {
        let prp1 = buffer.phys_addr(0);
        let first = (PAGE_SIZE - prp1 % PAGE_SIZE).min(len);
        if len == first {
            return Ok((prp1 as u64, 0));
        }

        let rest = len - first;
        if rest <= PAGE_SIZE {
            return Ok((prp1 as u64, buffer.phys_addr(first) as u64));
        }

        let entries = rest.div_ceil(PAGE_SIZE);
        if entries > PRP_LIST_ENTRIES {
            return Err(Error::InvalidRange {
                lba: 0,
                blocks: 0,
                reason: "transfer does not fit a single prp list",
            });
        }
        let list = unsafe {
            (self.prp_lists.as_mut_ptr() as *mut u64).add(slot * PRP_LIST_ENTRIES)
        };
        for i in 0..entries {
            let addr = buffer.phys_addr(first + i * PAGE_SIZE) as u64;
            unsafe { ptr::write_volatile(list.add(i), addr) };
        }
        Ok((prp1 as u64, self.prp_lists.phys_addr(slot * PAGE_SIZE) as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::{IO_READ, IO_WRITE};
    use crate::sim::SimulatedController;
    use futures::task::{waker, ArcWake};
    use std::sync::atomic::AtomicUsize;

    /// Controller with one I/O queue pair created behind the driver's back.
    fn setup(len: usize) -> (Arc<SimulatedController>, HugePageAllocator, NvmeQueuePair) {
        let sim = Arc::new(SimulatedController::with_defaults("queues-unit"));
        let transport: Arc<dyn Transport> = sim.clone();
        let mut allocator =
            HugePageAllocator::new(&MemorySource::Anonymous, PAGE_SIZE, 512).unwrap();
        let pair = NvmeQueuePair::new(transport, &mut allocator, 1, len, 0).unwrap();
        sim.attach_io_queue(1, pair.sub_queue.get_addr(), pair.comp_queue.get_addr(), len);
        (sim, allocator, pair)
    }

    fn read_cmd(lba: u64, ptr: usize) -> NvmeCommand {
        NvmeCommand::io(IO_READ, 0, 1, lba, 1, ptr as u64, 0)
    }

    #[test]
    fn completion_strips_phase() {
        let entry = NvmeCompletion {
            c_id: 3,
            status: (0x0281 << 1) | 1,
            sq_head: 9,
            ..Default::default()
        };
        let completion = Completion::from(entry);
        assert_eq!(completion.id, CommandId(3));
        assert!(completion.phase);
        assert_eq!(completion.status, 0x0281);
        assert!(!completion.is_success());
        assert!(matches!(
            completion.into_result(),
            Err(Error::Io { status_code: 0x0281 })
        ));
    }

    #[test]
    fn empty_ring_polls_none() {
        let (_sim, _allocator, mut pair) = setup(8);
        assert_eq!(pair.poll(), None);
        assert_eq!(pair.in_flight(), 0);
    }

    #[test]
    fn submit_then_poll_completes() {
        let (_sim, mut allocator, mut pair) = setup(8);
        let buffer = allocator.allocate(512).unwrap();
        let id = pair.submit(read_cmd(0, buffer.phys_addr(0)), Some(&buffer)).unwrap();
        assert_eq!(pair.state(id), Some(SlotState::AwaitingCompletion));
        assert!(pair.is_buffer_busy(buffer.id()));

        let completion = pair.poll().unwrap();
        assert_eq!(completion.id, id);
        assert!(completion.is_success());
        assert_eq!(pair.state(id), Some(SlotState::Completed(completion)));
        assert!(!pair.is_buffer_busy(buffer.id()));

        assert_eq!(pair.reap(id), Some(completion));
        assert_eq!(pair.state(id), Some(SlotState::Free));
        assert_eq!(pair.stats().submissions, 1);
        assert_eq!(pair.stats().completions, 1);
    }

    #[test]
    fn full_queue_rejects_until_polled() {
        let (_sim, mut allocator, mut pair) = setup(8);
        let buffer = allocator.allocate(512).unwrap();
        let mut ids = Vec::new();
        for lba in 0..pair.depth() as u64 {
            ids.push(pair.submit(read_cmd(lba, buffer.phys_addr(0)), None).unwrap());
        }
        assert!(matches!(
            pair.submit(read_cmd(0, buffer.phys_addr(0)), None),
            Err(Error::QueueFull { queue: 1 })
        ));

        let first = pair.poll().unwrap();
        assert_eq!(first.id, ids[0]);
        assert!(pair.submit(read_cmd(0, buffer.phys_addr(0)), None).is_ok());
    }

    #[test]
    fn completions_match_ids_when_reversed() {
        let (sim, mut allocator, mut pair) = setup(16);
        sim.set_completion_order(crate::config::CompletionOrder::Reversed);
        sim.hold_completions(true);
        let buffer = allocator.allocate(512).unwrap();

        let submitted: Vec<CommandId> = (0..10)
            .map(|lba| pair.submit(read_cmd(lba, buffer.phys_addr(0)), None).unwrap())
            .collect();
        assert_eq!(pair.poll(), None);
        sim.hold_completions(false);

        let mut seen = Vec::new();
        for _ in 0..submitted.len() {
            let completion = pair.poll().unwrap();
            assert!(completion.is_success());
            assert_eq!(pair.reap(completion.id), Some(completion));
            seen.push(completion.id);
        }
        assert_eq!(pair.poll(), None);

        let mut expected = submitted.clone();
        expected.reverse();
        assert_eq!(seen, expected);
    }

    #[test]
    fn phase_toggles_across_wraps() {
        let (_sim, mut allocator, mut pair) = setup(4);
        let buffer = allocator.allocate(512).unwrap();
        assert!(pair.comp_queue.phase());
        for round in 0..10u64 {
            let id = pair.submit(read_cmd(round, buffer.phys_addr(0)), None).unwrap();
            let completion = pair.wait(id, Duration::from_secs(1)).unwrap();
            assert_eq!(completion.id, id);
        }
        // 10 completions on a 4 entry ring: two full wraps
        assert_eq!(pair.comp_queue.head(), 2);
        assert!(pair.comp_queue.phase());
    }

    #[test]
    fn abandoned_command_is_drained_not_matched() {
        let (sim, mut allocator, mut pair) = setup(8);
        sim.hold_completions(true);
        let buffer = allocator.allocate(512).unwrap();
        let id = pair.submit(read_cmd(0, buffer.phys_addr(0)), Some(&buffer)).unwrap();

        assert!(matches!(
            pair.wait(id, Duration::from_millis(10)),
            Err(Error::IoTimeout(_))
        ));
        assert_eq!(pair.state(id), Some(SlotState::Abandoned));
        assert_eq!(pair.in_flight(), 1);
        assert!(pair.is_buffer_busy(buffer.id()));

        sim.hold_completions(false);
        let drained = pair.poll().unwrap();
        assert_eq!(drained.id, id);
        assert_eq!(pair.state(id), Some(SlotState::Free));
        assert_eq!(pair.reap(id), None);
        assert_eq!(pair.in_flight(), 0);
    }

    #[derive(Default)]
    struct CountingWaker(AtomicUsize);

    impl ArcWake for CountingWaker {
        fn wake_by_ref(arc_self: &Arc<Self>) {
            arc_self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl CountingWaker {
        fn wakes(&self) -> usize {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn parked_waiters_are_woken_by_the_polling_one() {
        let (sim, mut allocator, mut pair) = setup(8);
        sim.hold_completions(true);
        let buffer = allocator.allocate(512).unwrap();
        let first = pair.submit(read_cmd(0, buffer.phys_addr(0)), None).unwrap();
        let second = pair.submit(read_cmd(1, buffer.phys_addr(0)), None).unwrap();

        let polling = Arc::new(CountingWaker::default());
        let parked = Arc::new(CountingWaker::default());
        let polling_waker = waker(polling.clone());
        let parked_waker = waker(parked.clone());

        assert!(pair.poll_waiting(first, &polling_waker).is_pending());
        assert_eq!(polling.wakes(), 1);
        assert!(pair.poll_waiting(second, &parked_waker).is_pending());
        assert_eq!(parked.wakes(), 0);

        sim.hold_completions(false);
        assert!(pair.poll_waiting(first, &polling_waker).is_ready());
        // the same ring poll consumed the parked waiter's completion
        assert_eq!(parked.wakes(), 1);
        assert!(pair.poll_waiting(second, &parked_waker).is_ready());
        assert_eq!(pair.in_flight(), 0);
    }

    #[test]
    fn abandoning_the_polling_waiter_wakes_a_parked_one() {
        let (sim, mut allocator, mut pair) = setup(8);
        sim.hold_completions(true);
        let buffer = allocator.allocate(512).unwrap();
        let first = pair.submit(read_cmd(0, buffer.phys_addr(0)), None).unwrap();
        let second = pair.submit(read_cmd(1, buffer.phys_addr(0)), None).unwrap();

        let polling = Arc::new(CountingWaker::default());
        let parked = Arc::new(CountingWaker::default());
        let parked_waker = waker(parked.clone());
        assert!(pair.poll_waiting(first, &waker(polling.clone())).is_pending());
        assert!(pair.poll_waiting(second, &parked_waker).is_pending());
        assert_eq!(parked.wakes(), 0);

        assert!(pair.abandon(first));
        assert_eq!(parked.wakes(), 1);
        // the woken waiter now polls on its own behalf
        assert!(pair.poll_waiting(second, &parked_waker).is_pending());
        assert_eq!(parked.wakes(), 2);
        sim.hold_completions(false);
    }

    #[test]
    fn large_transfer_uses_prp_list() {
        let (_sim, mut allocator, mut pair) = setup(8);
        let mut source = allocator.allocate(64 * 1024).unwrap();
        for (i, byte) in source.iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
        let write = NvmeCommand::io(IO_WRITE, 0, 1, 0, 128, 0, 0);
        let (prp1, prp2) = pair.setup_prps(0, &source, source.len()).unwrap();
        assert_ne!(prp2, 0);
        let id = pair
            .submit(NvmeCommand { d_ptr: [prp1, prp2], ..write }, Some(&source))
            .unwrap();
        pair.wait(id, Duration::from_secs(1)).unwrap();

        let dest = allocator.allocate(64 * 1024).unwrap();
        let (prp1, prp2) = pair.setup_prps(1, &dest, dest.len()).unwrap();
        let read = NvmeCommand::io(IO_READ, 0, 1, 0, 128, prp1, prp2);
        let id = pair.submit(read, Some(&dest)).unwrap();
        pair.wait(id, Duration::from_secs(1)).unwrap();
        assert_eq!(&source[..], &dest[..]);
    }
}

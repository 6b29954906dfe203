use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Seek, SeekFrom};
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::{alloc, mem, process, ptr, slice};

use byteorder::{NativeEndian, ReadBytesExt};

use crate::error::{Error, Result};

/// 2 MiB huge page
pub const HUGE_PAGE_SIZE: usize = 1 << 21;

/// NVMe memory page size (CC.MPS = 0)
pub const PAGE_SIZE: usize = 4096;

/// Granularity of buffer sizes handed out by the allocator
pub const DMA_ALIGN: usize = 512;

static NEXT_ALLOCATOR_ID: AtomicU64 = AtomicU64::new(1);
static HUGEPAGE_ID: AtomicU64 = AtomicU64::new(0);

pub type BufferId = u64;

/// Where the allocator pool comes from.
#[derive(Debug, Clone)]
pub enum MemorySource {
    /// Pages from a hugetlbfs mount, locked and translated through pagemap.
    HugeTlbFs { dir: PathBuf },
    /// Heap memory whose virtual addresses are used as bus addresses.
    /// Only meaningful with the simulated controller.
    Anonymous,
}

enum Backing {
    Mapped { path: PathBuf },
    Heap(alloc::Layout),
}

/// One contiguous virtual mapping backing a whole pool.
struct PoolMemory {
    base: *mut u8,
    size: usize,
    page_size: usize,
    phys_pages: Vec<usize>,
    backing: Backing,
}

// the mapping is only reached through allocator-issued, non-overlapping regions
unsafe impl Send for PoolMemory {}
unsafe impl Sync for PoolMemory {}

impl PoolMemory {
    fn hugetlbfs(dir: &Path, page_size: usize, pages: usize) -> Result<Self> {
        let size = page_size * pages;
        let id = HUGEPAGE_ID.fetch_add(1, Ordering::SeqCst);
        let path = dir.join(format!("hugenvme-{}-{}", process::id(), id));

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(size as u64)?;

        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_HUGETLB | libc::MAP_LOCKED,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            let _ = fs::remove_file(&path);
            return Err(Error::Allocation {
                size,
                reason: format!("mmap of {} failed: {}", path.display(), io::Error::last_os_error()),
            });
        }
        if unsafe { libc::mlock(ptr, size) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::munmap(ptr, size) };
            let _ = fs::remove_file(&path);
            return Err(Error::Allocation {
                size,
                reason: format!("mlock failed: {err}"),
            });
        }

        let base = ptr as *mut u8;
        let mut memory = PoolMemory {
            base,
            size,
            page_size,
            phys_pages: Vec::with_capacity(pages),
            backing: Backing::Mapped { path },
        };
        for page in 0..pages {
            let addr = unsafe { base.add(page * page_size) };
            // fault the page in before asking for its frame
            unsafe { ptr::write_volatile(addr, 0) };
            memory.phys_pages.push(virt_to_phys(addr as usize)?);
        }
        Ok(memory)
    }

    fn anonymous(page_size: usize, pages: usize) -> Result<Self> {
        let size = page_size * pages;
        let layout = alloc::Layout::from_size_align(size, page_size).map_err(|e| {
            Error::Allocation {
                size,
                reason: e.to_string(),
            }
        })?;
        let base = unsafe { alloc::alloc_zeroed(layout) };
        if base.is_null() {
            return Err(Error::Allocation {
                size,
                reason: "out of memory".into(),
            });
        }
        let phys_pages = (0..pages)
            .map(|page| base as usize + page * page_size)
            .collect();
        Ok(PoolMemory {
            base,
            size,
            page_size,
            phys_pages,
            backing: Backing::Heap(layout),
        })
    }

    fn phys(&self, offset: usize) -> usize {
        self.phys_pages[offset / self.page_size] + offset % self.page_size
    }
}

impl Drop for PoolMemory {
    fn drop(&mut self) {
        match &self.backing {
            Backing::Mapped { path } => unsafe {
                libc::munlock(self.base as *const libc::c_void, self.size);
                libc::munmap(self.base as *mut libc::c_void, self.size);
                let _ = fs::remove_file(path);
            },
            Backing::Heap(layout) => unsafe { alloc::dealloc(self.base, *layout) },
        }
    }
}

/// Translate a virtual address of the current process to a physical one.
pub fn virt_to_phys(addr: usize) -> Result<usize> {
    let pagesize = unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) } as usize;

    let mut file = OpenOptions::new().read(true).open("/proc/self/pagemap")?;
    file.seek(SeekFrom::Start((addr / pagesize * mem::size_of::<u64>()) as u64))?;
    let entry = file.read_u64::<NativeEndian>()?;

    if entry & (1 << 63) == 0 {
        return Err(io::Error::other(format!("page at {addr:#x} not present")).into());
    }
    let pfn = entry & 0x7f_ffff_ffff_ffff;
    if pfn == 0 {
        return Err(io::Error::other("pagemap hides frame numbers (need CAP_SYS_ADMIN)").into());
    }
    Ok(pfn as usize * pagesize + addr % pagesize)
}

struct Allocation {
    first_page: usize,
    pages: usize,
    /// Outstanding commands transferring to or from the buffer
    pins: usize,
    /// Handle gone while pinned; pages return on the last unpin
    orphaned: bool,
}

/// Page bookkeeping shared by an allocator and every buffer it hands out.
struct PoolState {
    free: Vec<bool>,
    live: HashMap<BufferId, Allocation>,
}

impl PoolState {
    fn release(&mut self, id: BufferId) {
        if let Some(allocation) = self.live.remove(&id) {
            for page in &mut self.free[allocation.first_page..allocation.first_page + allocation.pages] {
                *page = true;
            }
            tracing::trace!(id, pages = allocation.pages, "buffer released");
        }
    }

    fn handle_dropped(&mut self, id: BufferId) {
        let Some(allocation) = self.live.get_mut(&id) else {
            return;
        };
        if allocation.pins > 0 {
            allocation.orphaned = true;
        } else {
            self.release(id);
        }
    }

    fn unpin(&mut self, id: BufferId) {
        if let Some(allocation) = self.live.get_mut(&id) {
            allocation.pins -= 1;
            if allocation.pins == 0 && allocation.orphaned {
                self.release(id);
            }
        }
    }
}

type SharedPool = Arc<Mutex<PoolState>>;

fn lock(pool: &SharedPool) -> MutexGuard<'_, PoolState> {
    pool.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Pool of pinned pages handing out DMA-capable buffers.
///
/// Every buffer starts on a page boundary and occupies whole pages; the pool
/// never moves a region once handed out. Dropping a buffer returns its pages,
/// unless a command still references it, in which case they return once the
/// last such command has completed.
pub struct HugePageAllocator {
    id: u64,
    memory: Arc<PoolMemory>,
    pool: SharedPool,
    next_buffer: BufferId,
}

impl HugePageAllocator {
    pub fn new(source: &MemorySource, page_size: usize, pages: usize) -> Result<Self> {
        if !page_size.is_power_of_two() || page_size < PAGE_SIZE || pages == 0 {
            return Err(Error::Allocation {
                size: page_size * pages,
                reason: format!("unsupported pool geometry: {pages} x {page_size}"),
            });
        }
        let memory = match source {
            MemorySource::HugeTlbFs { dir } => PoolMemory::hugetlbfs(dir, page_size, pages)?,
            MemorySource::Anonymous => PoolMemory::anonymous(page_size, pages)?,
        };
        tracing::debug!(page_size, pages, ?source, "page pool reserved");
        Ok(Self {
            id: NEXT_ALLOCATOR_ID.fetch_add(1, Ordering::Relaxed),
            memory: Arc::new(memory),
            pool: Arc::new(Mutex::new(PoolState {
                free: vec![true; pages],
                live: HashMap::new(),
            })),
            next_buffer: 1,
        })
    }

    pub fn page_size(&self) -> usize {
        self.memory.page_size
    }

    pub fn total_pages(&self) -> usize {
        lock(&self.pool).free.len()
    }

    pub fn free_pages(&self) -> usize {
        lock(&self.pool).free.iter().filter(|&&free| free).count()
    }

    /// Number of buffers whose pages have not returned to the pool.
    pub fn outstanding(&self) -> usize {
        lock(&self.pool).live.len()
    }

    pub fn owns(&self, buffer: &DmaBuffer) -> bool {
        buffer.allocator == self.id && lock(&self.pool).live.contains_key(&buffer.id)
    }

    /// Hand out a zeroed buffer of `size` bytes.
    ///
    /// `size` must be a non-zero multiple of [`DMA_ALIGN`].
    pub fn allocate(&mut self, size: usize) -> Result<DmaBuffer> {
        if size == 0 || size % DMA_ALIGN != 0 {
            return Err(Error::Allocation {
                size,
                reason: format!("size is not a positive multiple of {DMA_ALIGN}"),
            });
        }
        let page_size = self.memory.page_size;
        let pages = size.div_ceil(page_size);
        let mut pool = lock(&self.pool);
        let first_page = find_run(&pool.free, pages).ok_or_else(|| Error::Allocation {
            size,
            reason: format!(
                "page pool exhausted ({} of {} pages free)",
                pool.free.iter().filter(|&&free| free).count(),
                pool.free.len()
            ),
        })?;

        for page in &mut pool.free[first_page..first_page + pages] {
            *page = false;
        }
        let id = self.next_buffer;
        self.next_buffer += 1;
        pool.live.insert(
            id,
            Allocation {
                first_page,
                pages,
                pins: 0,
                orphaned: false,
            },
        );
        drop(pool);

        let offset = first_page * page_size;
        unsafe { ptr::write_bytes(self.memory.base.add(offset), 0, pages * page_size) };
        tracing::trace!(id, size, first_page, pages, "buffer allocated");

        Ok(DmaBuffer {
            id,
            allocator: self.id,
            memory: Arc::clone(&self.memory),
            pool: Arc::clone(&self.pool),
            offset,
            len: size,
        })
    }

    /// Return a buffer's pages to the pool.
    ///
    /// Fails with [`Error::BufferBusy`] while a command references the
    /// buffer; its pages then return once that command has completed.
    pub fn free(&mut self, buffer: DmaBuffer) -> Result<()> {
        if buffer.allocator != self.id {
            return Err(Error::InvalidHandle(buffer.id));
        }
        let mut pool = lock(&self.pool);
        let Some(allocation) = pool.live.get_mut(&buffer.id) else {
            return Err(Error::InvalidHandle(buffer.id));
        };
        if allocation.pins > 0 {
            allocation.orphaned = true;
            return Err(Error::BufferBusy(buffer.id));
        }
        pool.release(buffer.id);
        Ok(())
    }
}

fn find_run(free: &[bool], pages: usize) -> Option<usize> {
    let mut run = 0;
    for (index, &free) in free.iter().enumerate() {
        if free {
            run += 1;
            if run == pages {
                return Some(index + 1 - pages);
            }
        } else {
            run = 0;
        }
    }
    None
}

/// Keeps a buffer's pages reserved while the device may still access them.
pub struct BufferPin {
    id: BufferId,
    pool: SharedPool,
}

impl BufferPin {
    pub fn id(&self) -> BufferId {
        self.id
    }
}

impl Drop for BufferPin {
    fn drop(&mut self) {
        lock(&self.pool).unpin(self.id);
    }
}

impl std::fmt::Debug for BufferPin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("BufferPin").field(&self.id).finish()
    }
}

/// A pinned, DMA-capable memory region owned by the caller.
///
/// The backing pool stays mapped as long as any buffer refers to it.
pub struct DmaBuffer {
    id: BufferId,
    allocator: u64,
    memory: Arc<PoolMemory>,
    pool: SharedPool,
    offset: usize,
    len: usize,
}

impl DmaBuffer {
    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *const u8 {
        unsafe { self.memory.base.add(self.offset) }
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        unsafe { self.memory.base.add(self.offset) }
    }

    /// Bus address of the byte at `offset` within the buffer.
    pub fn phys_addr(&self, offset: usize) -> usize {
        debug_assert!(offset < self.len.max(1));
        self.memory.phys(self.offset + offset)
    }

    /// Reserve the buffer's pages until the returned pin is dropped.
    pub fn pin(&self) -> BufferPin {
        if let Some(allocation) = lock(&self.pool).live.get_mut(&self.id) {
            allocation.pins += 1;
        }
        BufferPin {
            id: self.id,
            pool: Arc::clone(&self.pool),
        }
    }

    /// Whether the whole buffer is backed by consecutive physical addresses.
    pub fn is_phys_contiguous(&self) -> bool {
        let page_size = self.memory.page_size;
        let start = self.phys_addr(0);
        (page_size..self.len)
            .step_by(page_size)
            .all(|offset| self.phys_addr(offset) == start + offset)
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        lock(&self.pool).handle_dropped(self.id);
    }
}

impl Deref for DmaBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.as_ptr(), self.len) }
    }
}

impl DerefMut for DmaBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.as_mut_ptr(), self.len) }
    }
}

impl std::fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("id", &self.id)
            .field("len", &self.len)
            .field("phys", &format_args!("{:#x}", self.phys_addr(0)))
            .finish()
    }
}

/// Typed view over a buffer, used for rings the device reads and writes.
pub struct Dma<T> {
    virt: *mut T,
    pub phys: usize,
    count: usize,
    buffer: DmaBuffer,
    _marker: PhantomData<T>,
}

unsafe impl<T: Send> Send for Dma<T> {}

impl<T: Copy> Dma<T> {
    /// Allocate room for `count` entries of `T` from `allocator`.
    pub fn allocate(allocator: &mut HugePageAllocator, count: usize) -> Result<Self> {
        let size = (count * mem::size_of::<T>()).next_multiple_of(DMA_ALIGN);
        let mut buffer = allocator.allocate(size)?;
        if !buffer.is_phys_contiguous() {
            allocator.free(buffer)?;
            return Err(Error::Allocation {
                size,
                reason: "region is not physically contiguous".into(),
            });
        }
        Ok(Self {
            virt: buffer.as_mut_ptr() as *mut T,
            phys: buffer.phys_addr(0),
            count,
            buffer,
            _marker: PhantomData,
        })
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[inline(always)]
    pub fn read(&self, index: usize) -> T {
        assert!(index < self.count);
        unsafe { ptr::read_volatile(self.virt.add(index)) }
    }

    #[inline(always)]
    pub fn write(&mut self, index: usize, value: T) {
        assert!(index < self.count);
        unsafe { ptr::write_volatile(self.virt.add(index), value) }
    }

    /// Bus address of entry `index`.
    pub fn phys_at(&self, index: usize) -> usize {
        self.phys + index * mem::size_of::<T>()
    }

    pub fn into_buffer(self) -> DmaBuffer {
        self.buffer
    }
}

impl<T> std::fmt::Debug for Dma<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dma")
            .field("phys", &format_args!("{:#x}", self.phys))
            .field("count", &self.count)
            .finish()
    }
}

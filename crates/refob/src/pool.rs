//! Body allocation pools.
//!
//! The primary pool is the global allocator. The secondary pool carves
//! bodies out of page runs mapped directly from the OS: small bodies are
//! routed to power-of-two size classes served by bump allocation with a
//! per-class free list, and anything above the largest class gets a run of
//! its own. Both pools can be capped with a byte limit, which is what turns
//! exhaustion into an ordinary `OutOfMemory` result.
//!
//! Large runs are unmapped as soon as their body is freed. Small-body runs
//! are shared, so they stay mapped while any small block is live; when the
//! last one is freed every run but the newest is unmapped and the newest is
//! rewound for reuse.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use sys_alloc::PageRun;

use crate::error::{ObjectError, ObjectResult};
use crate::flags::PoolPolicy;

/// Size classes of the secondary pool.
pub const SIZE_CLASSES: [usize; 8] = [16, 32, 64, 128, 256, 512, 1024, 2048];

/// Bodies larger than this get a dedicated page run.
pub const MAX_SMALL_BODY_SIZE: usize = 2048;

/// Bytes mapped at a time for small-body bump allocation.
const RUN_SIZE: usize = 64 * 1024;

/// A body allocation, remembered so it can be returned to the right pool.
#[derive(Debug)]
pub struct BodyBlock {
    ptr: NonNull<u8>,
    layout: Layout,
    pool: PoolPolicy,
}

impl BodyBlock {
    pub const fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    pub const fn size(&self) -> usize {
        self.layout.size()
    }
}

// SAFETY: a `BodyBlock` is the unique owner of its allocation.
unsafe impl Send for BodyBlock {}
// SAFETY: `&BodyBlock` only exposes the address and layout.
unsafe impl Sync for BodyBlock {}

/// Byte budget shared by concurrent allocators of one pool.
#[derive(Debug)]
struct Budget {
    limit: Option<usize>,
    in_use: AtomicUsize,
}

impl Budget {
    const fn new(limit: Option<usize>) -> Self {
        Self {
            limit,
            in_use: AtomicUsize::new(0),
        }
    }

    fn reserve(&self, bytes: usize) -> bool {
        self.in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                let next = used.checked_add(bytes)?;
                match self.limit {
                    Some(limit) if next > limit => None,
                    _ => Some(next),
                }
            })
            .is_ok()
    }

    fn release(&self, bytes: usize) {
        self.in_use.fetch_sub(bytes, Ordering::AcqRel);
    }

    fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }
}

/// The pair of pools owned by a registry.
#[derive(Debug)]
pub struct Pools {
    primary: Budget,
    secondary: Budget,
    pages: Mutex<PageHeap>,
}

impl Pools {
    pub fn new(primary_limit: Option<usize>, secondary_limit: Option<usize>) -> Self {
        Self {
            primary: Budget::new(primary_limit),
            secondary: Budget::new(secondary_limit),
            pages: Mutex::new(PageHeap::new()),
        }
    }

    /// Allocates a zeroed block for `layout` from `pool`.
    pub fn allocate(&self, pool: PoolPolicy, layout: Layout) -> ObjectResult<BodyBlock> {
        let oom = ObjectError::OutOfMemory {
            requested: layout.size(),
            pool,
        };
        let budget = self.budget(pool);
        if !budget.reserve(layout.size()) {
            return Err(oom);
        }

        let ptr = if layout.size() == 0 {
            Some(dangling(layout))
        } else {
            match pool {
                // SAFETY: the layout has a non-zero size.
                PoolPolicy::Primary => NonNull::new(unsafe { alloc_zeroed(layout) }),
                PoolPolicy::Secondary => self.pages.lock().allocate(layout),
            }
        };

        ptr.map_or_else(
            || {
                budget.release(layout.size());
                Err(oom)
            },
            |ptr| Ok(BodyBlock { ptr, layout, pool }),
        )
    }

    /// Returns a block to the pool it came from.
    pub fn deallocate(&self, block: BodyBlock) {
        let size = block.layout.size();
        if size != 0 {
            match block.pool {
                // SAFETY: the block was allocated by `alloc_zeroed` with this
                // layout and is released exactly once.
                PoolPolicy::Primary => unsafe { dealloc(block.ptr.as_ptr(), block.layout) },
                PoolPolicy::Secondary => self.pages.lock().deallocate(block.ptr, block.layout),
            }
        }
        self.budget(block.pool).release(size);
    }

    /// Bytes currently handed out by `pool`.
    pub fn in_use(&self, pool: PoolPolicy) -> usize {
        self.budget(pool).in_use()
    }

    /// Bytes the secondary pool currently holds mapped from the OS.
    pub fn secondary_mapped(&self) -> usize {
        self.pages.lock().mapped_bytes()
    }

    const fn budget(&self, pool: PoolPolicy) -> &Budget {
        match pool {
            PoolPolicy::Primary => &self.primary,
            PoolPolicy::Secondary => &self.secondary,
        }
    }
}

fn dangling(layout: Layout) -> NonNull<u8> {
    // An address equal to the alignment is non-null and suitably aligned.
    NonNull::new(std::ptr::without_provenance_mut(layout.align())).unwrap_or(NonNull::dangling())
}

/// Returns the size-class index serving `layout`, or `None` for large bodies.
fn size_class(layout: Layout) -> Option<usize> {
    let need = layout.size().max(layout.align());
    if need > MAX_SMALL_BODY_SIZE {
        return None;
    }
    SIZE_CLASSES.iter().position(|&class| class >= need)
}

/// Secondary pool state, guarded by the pool mutex.
#[derive(Debug)]
struct PageHeap {
    /// Runs feeding the small-body classes.
    runs: Vec<PageRun>,
    /// Bump pointer into the newest run.
    bump_ptr: *mut u8,
    /// End of the newest run.
    bump_end: *const u8,
    free_lists: [Vec<NonNull<u8>>; SIZE_CLASSES.len()],
    /// Dedicated runs of large bodies, keyed by start address.
    large: HashMap<usize, PageRun>,
    /// Small blocks currently handed out.
    small_live: usize,
}

// SAFETY: the raw pointers only ever address runs owned by this heap.
unsafe impl Send for PageHeap {}

impl PageHeap {
    fn new() -> Self {
        Self {
            runs: Vec::new(),
            bump_ptr: std::ptr::null_mut(),
            bump_end: std::ptr::null(),
            free_lists: Default::default(),
            large: HashMap::new(),
            small_live: 0,
        }
    }

    fn allocate(&mut self, layout: Layout) -> Option<NonNull<u8>> {
        let Some(class) = size_class(layout) else {
            return self.allocate_large(layout);
        };
        let block_size = SIZE_CLASSES[class];

        if let Some(block) = self.free_lists[class].pop() {
            // Recycled blocks must look freshly mapped.
            // SAFETY: `block` is an unused block of `block_size` bytes inside
            // one of our runs.
            unsafe { std::ptr::write_bytes(block.as_ptr(), 0, block_size) };
            self.small_live += 1;
            return Some(block);
        }

        // Blocks are aligned to their class size, which covers `layout`.
        let fits = !self.bump_ptr.is_null() && {
            let pad = self.bump_ptr.align_offset(block_size);
            (self.bump_end as usize) - (self.bump_ptr as usize) >= pad + block_size
        };
        if !fits {
            let run = PageRun::map(RUN_SIZE).ok()?;
            self.bump_ptr = run.as_ptr();
            // SAFETY: one past the end of the run.
            self.bump_end = unsafe { run.as_ptr().add(run.len()) };
            self.runs.push(run);
        }

        let pad = self.bump_ptr.align_offset(block_size);
        // SAFETY: `fits` (or the fresh page-aligned run) guarantees that
        // `pad + block_size` bytes remain in the run.
        let block = unsafe { self.bump_ptr.add(pad) };
        self.bump_ptr = unsafe { block.add(block_size) };
        self.small_live += 1;
        NonNull::new(block)
    }

    fn allocate_large(&mut self, layout: Layout) -> Option<NonNull<u8>> {
        if layout.align() > sys_alloc::page_size() {
            return None;
        }
        let run = PageRun::map(layout.size()).ok()?;
        let block = NonNull::new(run.as_ptr())?;
        self.large.insert(block.as_ptr() as usize, run);
        Some(block)
    }

    fn deallocate(&mut self, ptr: NonNull<u8>, layout: Layout) {
        match size_class(layout) {
            Some(class) => {
                self.free_lists[class].push(ptr);
                self.small_live -= 1;
                if self.small_live == 0 {
                    self.release_idle_runs();
                }
            }
            None => {
                // Dropping the run unmaps it.
                self.large.remove(&(ptr.as_ptr() as usize));
            }
        }
    }

    /// Unmaps every small-body run but the newest and rewinds the newest.
    /// Only valid while no small block is live.
    fn release_idle_runs(&mut self) {
        for list in &mut self.free_lists {
            list.clear();
        }
        let Some(newest) = self.runs.pop() else {
            return;
        };
        self.runs.clear();
        let start = newest.as_ptr();
        let used = self.bump_ptr as usize - start as usize;
        // SAFETY: the bump pointer lies inside the newest run, and every
        // block below it has been freed.
        unsafe { std::ptr::write_bytes(start, 0, used) };
        self.bump_ptr = start;
        self.runs.push(newest);
    }

    fn mapped_bytes(&self) -> usize {
        self.runs
            .iter()
            .chain(self.large.values())
            .map(PageRun::len)
            .sum()
    }
}

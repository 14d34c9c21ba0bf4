//! Object headers.
//!
//! Headers live in a side table of slots instead of in front of the body.
//! Each slot packs the slot generation and the signed reference count into
//! one `AtomicU64`, so every count update also proves the caller's handle
//! still names the object it was created for. A freed slot bumps its
//! generation before it is recycled, which turns use-after-free and double
//! free through a stale handle into a detectable mismatch instead of a read
//! of released memory.
//!
//! The table grows in fixed-size chunks published with a CAS, so lookups
//! never take a lock.

use std::any::TypeId;
use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crossbeam_queue::SegQueue;

use crate::flags::ObjectFlags;
use crate::object::ObjectId;
use crate::pool::BodyBlock;
use crate::types::ObjectType;

/// End-of-list marker for slot indices.
pub const NIL: u32 = u32::MAX;

const CHUNK_BITS: u32 = 10;
/// Slots per chunk.
pub const CHUNK_SIZE: usize = 1 << CHUNK_BITS;

// ============================================================================
// Packed generation / reference count word
// ============================================================================

#[allow(clippy::cast_sign_loss)]
const fn pack(generation: u32, count: i32) -> u64 {
    ((generation as u64) << 32) | (count as u32 as u64)
}

#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
const fn unpack(word: u64) -> (u32, i32) {
    ((word >> 32) as u32, word as u32 as i32)
}

/// Why a count update was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountError {
    /// The slot no longer holds the object the handle was created for.
    Stale,
    /// The update would drive the count below zero; carries the count seen.
    Underflow(i32),
    /// Increment of an object whose count already reached zero.
    Dead,
    /// The count would exceed `i32::MAX`.
    Overflow,
}

// ============================================================================
// Lifecycle state
// ============================================================================

/// Lifecycle state of an object slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ObjectState {
    /// Slot holds no object.
    Vacant = 0,
    /// At least one reference is outstanding.
    Referenced = 1,
    /// The count reached zero; teardown has not been scheduled yet.
    ZeroRefs = 2,
    /// Waiting on the deferred-free stack.
    Queued = 3,
    /// Taken off the deferred-free stack by a drain.
    Draining = 4,
    /// `free` owns the slot and is tearing the object down.
    Freeing = 5,
}

impl ObjectState {
    const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Referenced,
            2 => Self::ZeroRefs,
            3 => Self::Queued,
            4 => Self::Draining,
            5 => Self::Freeing,
            _ => Self::Vacant,
        }
    }
}

// ============================================================================
// Slot payload
// ============================================================================

/// Type-erased drop glue for a typed body.
#[derive(Debug, Clone, Copy)]
pub struct ValueMeta {
    pub type_id: TypeId,
    pub drop_fn: unsafe fn(*mut u8),
}

impl ValueMeta {
    pub fn of<T: 'static>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            drop_fn: drop_value::<T>,
        }
    }
}

/// Drops the `T` at `ptr` in place.
///
/// # Safety
///
/// `ptr` must point to an initialized `T` that is never used again.
unsafe fn drop_value<T>(ptr: *mut u8) {
    // SAFETY: guaranteed by the caller.
    unsafe { ptr::drop_in_place(ptr.cast::<T>()) };
}

/// Everything about an object besides its count, written once at creation.
#[derive(Debug)]
pub struct SlotData {
    pub flags: ObjectFlags,
    pub ty: Arc<ObjectType>,
    pub owning_type: ObjectId,
    pub block: BodyBlock,
    pub value: Option<ValueMeta>,
}

// ============================================================================
// Slot
// ============================================================================

/// One object header.
pub struct Slot {
    word: AtomicU64,
    state: AtomicU8,
    /// Link in the deferred-free stack, `NIL` when not queued.
    pub deferred_next: AtomicU32,
    data: UnsafeCell<Option<SlotData>>,
}

impl Slot {
    fn new() -> Self {
        Self {
            word: AtomicU64::new(pack(0, 0)),
            state: AtomicU8::new(ObjectState::Vacant as u8),
            deferred_next: AtomicU32::new(NIL),
            data: UnsafeCell::new(None),
        }
    }

    /// Current generation of the slot.
    pub fn generation(&self) -> u32 {
        unpack(self.word.load(Ordering::Acquire)).0
    }

    /// Count if the slot is still at `generation`.
    pub fn count(&self, generation: u32) -> Option<i32> {
        let (g, count) = unpack(self.word.load(Ordering::Acquire));
        (g == generation).then_some(count)
    }

    pub fn state(&self) -> ObjectState {
        ObjectState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: ObjectState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Moves `from` to `to`; fails if the slot is in another state.
    pub fn transition(&self, from: ObjectState, to: ObjectState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Claims the slot for `free`. Fails if it is vacant or already being
    /// freed, which makes concurrent frees of one object collapse into one.
    pub fn claim_free(&self) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                match ObjectState::from_u8(s) {
                    ObjectState::Vacant | ObjectState::Freeing => None,
                    _ => Some(ObjectState::Freeing as u8),
                }
            })
            .is_ok()
    }

    /// Adds one reference. Increments from zero are refused: a zero count
    /// means teardown is already under way.
    pub fn increment(&self, generation: u32) -> Result<i32, CountError> {
        self.update(generation, |count| {
            if count <= 0 {
                return Err(CountError::Dead);
            }
            count.checked_add(1).ok_or(CountError::Overflow)
        })
    }

    /// Subtracts `n` references and returns the new count.
    pub fn decrement(&self, generation: u32, n: i32) -> Result<i32, CountError> {
        self.update(generation, |count| {
            let next = count - n;
            if next < 0 {
                Err(CountError::Underflow(count))
            } else {
                Ok(next)
            }
        })
    }

    fn update(
        &self,
        generation: u32,
        f: impl Fn(i32) -> Result<i32, CountError>,
    ) -> Result<i32, CountError> {
        let mut word = self.word.load(Ordering::Acquire);
        loop {
            let (g, count) = unpack(word);
            if g != generation {
                return Err(CountError::Stale);
            }
            let next = f(count)?;
            match self.word.compare_exchange_weak(
                word,
                pack(g, next),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(next),
                Err(current) => word = current,
            }
        }
    }

    /// Installs a new object and returns its generation.
    ///
    /// # Safety
    ///
    /// The caller must own the vacant slot (popped from the free queue).
    pub unsafe fn install(&self, data: SlotData, count: i32) -> u32 {
        // SAFETY: the slot is vacant and exclusively ours.
        unsafe { *self.data.get() = Some(data) };
        let generation = self.generation();
        self.deferred_next.store(NIL, Ordering::Relaxed);
        self.set_state(ObjectState::Referenced);
        self.word.store(pack(generation, count), Ordering::Release);
        generation
    }

    /// Shared access to the payload.
    ///
    /// # Safety
    ///
    /// The caller must hold a reference, own the zero-count object, or hold
    /// the directory lock while the slot is linked and not being freed.
    pub unsafe fn data(&self) -> Option<&SlotData> {
        // SAFETY: guaranteed by the caller; the payload is only replaced by
        // `install` and `take_data`, neither of which can run concurrently.
        unsafe { (*self.data.get()).as_ref() }
    }

    /// Removes the payload.
    ///
    /// # Safety
    ///
    /// The caller must have won `claim_free`.
    pub unsafe fn take_data(&self) -> Option<SlotData> {
        // SAFETY: guaranteed by the caller.
        unsafe { (*self.data.get()).take() }
    }

    /// Invalidates every outstanding handle and marks the slot vacant.
    pub fn retire(&self) {
        let generation = self.generation().wrapping_add(1);
        self.word.store(pack(generation, 0), Ordering::Release);
        self.deferred_next.store(NIL, Ordering::Relaxed);
        self.set_state(ObjectState::Vacant);
    }
}

// ============================================================================
// SlotTable
// ============================================================================

/// Chunked, lock-free table of headers.
pub struct SlotTable {
    chunks: Box<[AtomicPtr<Slot>]>,
    capacity: u32,
    next_fresh: AtomicU32,
    free: SegQueue<u32>,
}

// SAFETY: slot payloads are accessed only under the ownership protocol
// documented on `Slot::data` / `Slot::take_data`.
unsafe impl Send for SlotTable {}
// SAFETY: see above.
unsafe impl Sync for SlotTable {}

impl SlotTable {
    /// Table able to hold `capacity` live objects (rounded up to a chunk).
    pub fn new(capacity: u32) -> Self {
        let chunk_count = (capacity as usize).div_ceil(CHUNK_SIZE).max(1);
        let chunks = (0..chunk_count)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect();
        Self {
            chunks,
            capacity,
            next_fresh: AtomicU32::new(0),
            free: SegQueue::new(),
        }
    }

    /// Slot at `index`, if it has ever been handed out.
    pub fn get(&self, index: u32) -> Option<&Slot> {
        let chunk = self.chunks.get(index as usize >> CHUNK_BITS)?;
        let base = chunk.load(Ordering::Acquire);
        if base.is_null() {
            return None;
        }
        // SAFETY: published chunks hold `CHUNK_SIZE` slots and live as long
        // as the table.
        Some(unsafe { &*base.add(index as usize & (CHUNK_SIZE - 1)) })
    }

    /// Hands out a vacant slot index, or `None` when the table is full.
    pub fn claim(&self) -> Option<u32> {
        if let Some(index) = self.free.pop() {
            return Some(index);
        }
        let index = self
            .next_fresh
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .ok()?;
        self.ensure_chunk(index as usize >> CHUNK_BITS);
        Some(index)
    }

    /// Returns a retired slot to the free queue.
    pub fn recycle(&self, index: u32) {
        self.free.push(index);
    }

    fn ensure_chunk(&self, chunk: usize) {
        let cell = &self.chunks[chunk];
        if !cell.load(Ordering::Acquire).is_null() {
            return;
        }
        let fresh: Box<[Slot]> = (0..CHUNK_SIZE).map(|_| Slot::new()).collect();
        let fresh = Box::into_raw(fresh).cast::<Slot>();
        if cell
            .compare_exchange(ptr::null_mut(), fresh, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Another thread published this chunk first.
            // SAFETY: `fresh` came from `Box::into_raw` above and was never
            // shared.
            drop(unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(fresh, CHUNK_SIZE)) });
        }
    }
}

impl Drop for SlotTable {
    fn drop(&mut self) {
        for chunk in &*self.chunks {
            let base = chunk.load(Ordering::Acquire);
            if !base.is_null() {
                // SAFETY: every published chunk came from `Box::into_raw` of a
                // `CHUNK_SIZE` slice.
                drop(unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(base, CHUNK_SIZE)) });
            }
        }
    }
}

impl std::fmt::Debug for SlotTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotTable")
            .field("capacity", &self.capacity)
            .field("handed_out", &self.next_fresh.load(Ordering::Relaxed))
            .field("free", &self.free.len())
            .finish()
    }
}

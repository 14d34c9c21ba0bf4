//! The global object directory.
//!
//! An insertion-ordered, doubly linked list threaded through slot indices
//! and guarded by one short-held mutex. It is the only place that can
//! answer "which objects are alive right now", which is what enumeration and
//! bulk shutdown need.

use std::cell::RefCell;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::header::NIL;

thread_local! {
    /// Ids of the registries whose directory lock this thread holds,
    /// innermost last.
    static HELD_DIRECTORIES: RefCell<Vec<u32>> = const { RefCell::new(Vec::new()) };
}

#[derive(Debug, Clone, Copy)]
struct Link {
    prev: u32,
    next: u32,
    linked: bool,
}

impl Link {
    const UNLINKED: Self = Self {
        prev: NIL,
        next: NIL,
        linked: false,
    };
}

/// The list itself. Only reachable through a [`DirectoryGuard`].
#[derive(Debug)]
pub struct Links {
    head: u32,
    tail: u32,
    len: usize,
    nodes: Vec<Link>,
}

impl Links {
    const fn new() -> Self {
        Self {
            head: NIL,
            tail: NIL,
            len: 0,
            nodes: Vec::new(),
        }
    }

    /// Appends `index` at the tail.
    pub fn insert(&mut self, index: u32) {
        let i = index as usize;
        if i >= self.nodes.len() {
            self.nodes.resize(i + 1, Link::UNLINKED);
        }
        debug_assert!(!self.nodes[i].linked, "slot {index} linked twice");

        self.nodes[i] = Link {
            prev: self.tail,
            next: NIL,
            linked: true,
        };
        if self.tail == NIL {
            self.head = index;
        } else {
            self.nodes[self.tail as usize].next = index;
        }
        self.tail = index;
        self.len += 1;
    }

    /// Unlinks `index`. Returns `false` if it was not linked.
    pub fn remove(&mut self, index: u32) -> bool {
        let Some(link) = self.nodes.get(index as usize).copied() else {
            return false;
        };
        if !link.linked {
            return false;
        }

        if link.prev == NIL {
            self.head = link.next;
        } else {
            self.nodes[link.prev as usize].next = link.next;
        }
        if link.next == NIL {
            self.tail = link.prev;
        } else {
            self.nodes[link.next as usize].prev = link.prev;
        }
        self.nodes[index as usize] = Link::UNLINKED;
        self.len -= 1;
        true
    }

    /// Unlinks and returns the oldest entry.
    pub fn pop_front(&mut self) -> Option<u32> {
        let head = self.head;
        if head == NIL {
            return None;
        }
        self.remove(head);
        Some(head)
    }

    /// Number of linked entries.
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Entries from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        std::iter::successors((self.head != NIL).then_some(self.head), move |&i| {
            let next = self.nodes[i as usize].next;
            (next != NIL).then_some(next)
        })
    }
}

/// Lock around [`Links`].
#[derive(Debug)]
pub struct Directory {
    /// Id of the owning registry.
    registry: u32,
    links: Mutex<Links>,
    /// Mirror of `Links::len`, readable without the lock.
    len: AtomicUsize,
}

impl Directory {
    pub fn new(registry: u32) -> Self {
        Self {
            registry,
            links: Mutex::new(Links::new()),
            len: AtomicUsize::new(0),
        }
    }

    /// Takes the directory lock.
    pub fn lock(&self) -> DirectoryGuard<'_> {
        let links = self.links.lock();
        HELD_DIRECTORIES.with(|held| held.borrow_mut().push(self.registry));
        DirectoryGuard {
            links,
            len: &self.len,
            registry: self.registry,
        }
    }

    /// Returns `true` if the calling thread holds this directory's lock.
    ///
    /// Releasing the last reference on such a thread must not free inline:
    /// `free` would try to take the same lock again.
    pub fn held_by_current_thread(&self) -> bool {
        HELD_DIRECTORIES.with(|held| held.borrow().contains(&self.registry))
    }

    pub fn insert(&self, index: u32) {
        self.lock().insert(index);
    }

    pub fn remove(&self, index: u32) -> bool {
        self.lock().remove(index)
    }

    /// Number of linked entries; safe to call while holding the lock.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }
}

/// Held directory lock; also marks the thread as a lock holder.
pub struct DirectoryGuard<'a> {
    links: MutexGuard<'a, Links>,
    len: &'a AtomicUsize,
    registry: u32,
}

impl DirectoryGuard<'_> {
    pub fn insert(&mut self, index: u32) {
        self.links.insert(index);
        self.len.store(self.links.len(), Ordering::Release);
    }

    pub fn remove(&mut self, index: u32) -> bool {
        let removed = self.links.remove(index);
        self.len.store(self.links.len(), Ordering::Release);
        removed
    }

    pub fn pop_front(&mut self) -> Option<u32> {
        let head = self.links.pop_front();
        self.len.store(self.links.len(), Ordering::Release);
        head
    }
}

impl std::ops::Deref for DirectoryGuard<'_> {
    type Target = Links;

    fn deref(&self) -> &Links {
        &self.links
    }
}

impl Drop for DirectoryGuard<'_> {
    fn drop(&mut self) {
        HELD_DIRECTORIES.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(pos) = held.iter().rposition(|&id| id == self.registry) {
                held.remove(pos);
            }
        });
    }
}

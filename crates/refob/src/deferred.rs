//! Deferred deletion.
//!
//! Objects whose teardown may not run in the releasing context are pushed
//! onto a lock-free LIFO threaded through the slots' `deferred_next` links.
//! A push that finds the stack empty wakes the worker thread, which takes
//! the whole chain with one swap and frees it at passive context.
//!
//! Consumers never pop single nodes: the chain is detached atomically and
//! walked privately, so a slot cannot be recycled and re-pushed underneath a
//! concurrent pop.

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;

use crate::header::{Slot, SlotTable, NIL};

/// Treiber stack of slot indices.
#[derive(Debug)]
pub struct DeferredStack {
    head: AtomicU32,
}

impl DeferredStack {
    pub const fn new() -> Self {
        Self {
            head: AtomicU32::new(NIL),
        }
    }

    /// Pushes `index`, whose header is `slot`. Returns `true` if the stack
    /// was empty before the push.
    pub fn push(&self, index: u32, slot: &Slot) -> bool {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            slot.deferred_next.store(head, Ordering::Relaxed);
            match self
                .head
                .compare_exchange_weak(head, index, Ordering::Release, Ordering::Acquire)
            {
                Ok(_) => return head == NIL,
                Err(current) => head = current,
            }
        }
    }

    /// Detaches the whole chain and returns its first index (`NIL` if empty).
    pub fn take_all(&self) -> u32 {
        self.head.swap(NIL, Ordering::AcqRel)
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == NIL
    }
}

/// Iterator over a detached chain. Unlinks each node before yielding it,
/// so the caller may free and recycle the slot immediately.
pub struct Chain<'a> {
    slots: &'a SlotTable,
    next: u32,
}

impl<'a> Chain<'a> {
    pub const fn new(slots: &'a SlotTable, first: u32) -> Self {
        Self { slots, next: first }
    }
}

impl<'a> Iterator for Chain<'a> {
    type Item = (u32, &'a Slot);

    fn next(&mut self) -> Option<Self::Item> {
        if self.next == NIL {
            return None;
        }
        let index = self.next;
        let Some(slot) = self.slots.get(index) else {
            self.next = NIL;
            return None;
        };
        self.next = slot.deferred_next.swap(NIL, Ordering::AcqRel);
        Some((index, slot))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerMessage {
    Wake,
    Stop,
}

/// The deferred-deletion thread.
#[derive(Debug)]
pub struct DeferredWorker {
    sender: Sender<WorkerMessage>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DeferredWorker {
    /// Spawns the worker. `drain` is called on every wake-up and returns
    /// `false` once there is nothing left to serve.
    pub fn spawn<F>(name: &str, drain: F) -> io::Result<Self>
    where
        F: Fn() -> bool + Send + 'static,
    {
        let (sender, receiver) = channel::unbounded();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run(&receiver, &drain))?;
        #[cfg(feature = "tracing")]
        crate::tracing::internal::log_worker_started(name);
        Ok(Self {
            sender,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn wake(&self) {
        // A disconnected channel means the worker already stopped.
        let _ = self.sender.send(WorkerMessage::Wake);
    }

    /// Stops the worker and waits for it unless called from the worker
    /// itself.
    pub fn stop(&self) {
        let _ = self.sender.send(WorkerMessage::Stop);
        let Some(handle) = self.handle.lock().take() else {
            return;
        };
        if handle.thread().id() != thread::current().id() {
            let _ = handle.join();
        }
    }
}

fn run(receiver: &Receiver<WorkerMessage>, drain: &dyn Fn() -> bool) {
    #[cfg(feature = "tracing")]
    let mut activations = 0u64;
    while let Ok(message) = receiver.recv() {
        match message {
            WorkerMessage::Wake => {
                #[cfg(feature = "tracing")]
                {
                    activations += 1;
                }
                if !drain() {
                    break;
                }
            }
            WorkerMessage::Stop => break,
        }
    }
    #[cfg(feature = "tracing")]
    crate::tracing::internal::log_worker_stopped(activations);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_push_reports_empty_and_take_all_is_lifo() {
        let table = SlotTable::new(8);
        let indices: Vec<u32> = (0..3).map(|_| table.claim().unwrap()).collect();
        let stack = DeferredStack::new();

        assert!(stack.push(indices[0], table.get(indices[0]).unwrap()));
        assert!(!stack.push(indices[1], table.get(indices[1]).unwrap()));
        assert!(!stack.push(indices[2], table.get(indices[2]).unwrap()));

        let first = stack.take_all();
        assert!(stack.is_empty());
        let order: Vec<u32> = Chain::new(&table, first).map(|(i, _)| i).collect();
        assert_eq!(order, vec![indices[2], indices[1], indices[0]]);
        for &i in &indices {
            assert_eq!(table.get(i).unwrap().deferred_next.load(Ordering::Relaxed), NIL);
        }
    }

    #[test]
    fn test_concurrent_pushes_are_all_kept() {
        let table = Arc::new(SlotTable::new(4096));
        let stack = Arc::new(DeferredStack::new());
        let empties = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let table = Arc::clone(&table);
                let stack = Arc::clone(&stack);
                let empties = Arc::clone(&empties);
                thread::spawn(move || {
                    for _ in 0..256 {
                        let i = table.claim().unwrap();
                        if stack.push(i, table.get(i).unwrap()) {
                            empties.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        let mut seen: Vec<u32> = Chain::new(&table, stack.take_all()).map(|(i, _)| i).collect();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 8 * 256);
        assert_eq!(empties.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_worker_drains_on_wake_and_stops() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let worker = DeferredWorker::spawn("refob-test-worker", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        })
        .unwrap();

        worker.wake();
        worker.wake();
        worker.stop();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        // Stopping twice is harmless.
        worker.stop();
        worker.wake();
    }

    #[test]
    fn test_worker_exits_when_drain_declines() {
        let worker = DeferredWorker::spawn("refob-test-orphan", || false).unwrap();
        worker.wake();
        worker.stop();
    }
}

use crossbeam::queue::ArrayQueue;

use crate::debugger::debugger::Signal;
use crate::kernel::{LibraryRef, TaskRef};

/// Maximum debug events in flight at once.
pub const MAX_DEBUG_RECORDS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Exception,
    TaskAttached,
    TaskTerminated,
    LibraryOpened,
    LibraryClosed,
}

/// One hook-observed occurrence awaiting the wait loop. Records live in the
/// pool; `slot` identifies the preallocated entry a record occupies so a
/// record can never be issued twice before it is freed.
#[derive(Debug, Clone, Copy)]
pub struct EventRecord {
    pub slot: u8,
    pub kind: EventKind,
    /// `None` marks an informational record; those never produce a stop.
    pub signal: Option<Signal>,
    pub process: TaskRef,
    pub library: Option<LibraryRef>,
}

/// Fixed-capacity record pool. The free list is a lock-free queue: the
/// allocating side runs on the faulting task's own execution context, where
/// blocking on a mutex held by the wait loop would deadlock the machine.
pub struct EventPool {
    free: ArrayQueue<EventRecord>,
}

impl EventPool {
    pub fn new() -> EventPool {
        let free = ArrayQueue::new(MAX_DEBUG_RECORDS);
        for slot in 0..MAX_DEBUG_RECORDS {
            let record = EventRecord {
                slot: slot as u8,
                kind: EventKind::Exception,
                signal: None,
                process: TaskRef(0),
                library: None,
            };
            free.push(record).ok();
        }
        EventPool { free }
    }

    /// Take a record off the free list, reinitialized for `process`.
    /// `None` when all records are in flight; the caller owns the drop
    /// policy for that case.
    pub fn alloc(&self, process: TaskRef) -> Option<EventRecord> {
        let mut record = self.free.pop()?;
        record.kind = EventKind::Exception;
        record.signal = None;
        record.process = process;
        record.library = None;
        Some(record)
    }

    /// Return a record to the free list.
    pub fn free(&self, record: EventRecord) {
        // capacity equals the number of preallocated slots, so this can only
        // fail if a record is freed twice
        if self.free.push(record).is_err() {
            log::error!("event record freed while the pool is full");
        }
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }
}

impl Default for EventPool {
    fn default() -> EventPool {
        EventPool::new()
    }
}

use std::mem;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::host::ObjectHandle;
use crate::location_table::Backtrace;

/// Which stream a record is exported under.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SampleKind {
    Allocation,
    Heap,
}

/// A single sampled allocation.
///
/// Records are shared (`Arc`) between the allocation ledger and the heap
/// index. The strong count is the record's refcount: 2 while both containers
/// hold it, 1 once either drops it. Whoever drops the last reference returns
/// the backtrace to the location table (see `CollectorState::release`).
#[derive(Debug)]
pub struct SampleRecord {
    backtrace: Backtrace,
    allocation_size: AtomicUsize,
    current_size: AtomicUsize,
    // Weak reference to the allocated object; 0 once it is known to be dead.
    handle: AtomicU64,
}

impl SampleRecord {
    pub fn new(backtrace: Backtrace, handle: ObjectHandle, size_hint: usize) -> Self {
        Self {
            backtrace,
            allocation_size: AtomicUsize::new(size_hint),
            current_size: AtomicUsize::new(size_hint),
            handle: AtomicU64::new(handle.0),
        }
    }

    pub fn refcount(this: &Arc<Self>) -> usize {
        Arc::strong_count(this)
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    pub fn into_backtrace(self) -> Backtrace {
        self.backtrace
    }

    pub fn handle(&self) -> Option<ObjectHandle> {
        match self.handle.load(Ordering::Acquire) {
            0 => None,
            value => Some(ObjectHandle(value)),
        }
    }

    pub fn set_handle(&self, handle: ObjectHandle) {
        self.handle.store(handle.0, Ordering::Release);
    }

    pub fn clear_handle(&self) {
        self.handle.store(ObjectHandle::NONE.0, Ordering::Release);
    }

    pub fn allocation_size(&self) -> usize {
        self.allocation_size.load(Ordering::Relaxed)
    }

    pub fn current_size(&self) -> usize {
        self.current_size.load(Ordering::Relaxed)
    }

    /// Records the size observed once the object finished initialising.
    pub fn resolve_size(&self, size: usize) {
        self.allocation_size.store(size, Ordering::Relaxed);
        self.current_size.store(size, Ordering::Relaxed);
    }

    pub fn set_current_size(&self, size: usize) {
        self.current_size.store(size, Ordering::Relaxed);
    }

    pub fn memsize(&self) -> usize {
        mem::size_of::<Self>() + self.backtrace.memsize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes_start_at_hint() {
        let record = SampleRecord::new(Backtrace::default(), ObjectHandle(8), 40);
        assert_eq!(record.allocation_size(), 40);
        assert_eq!(record.current_size(), 40);

        record.resolve_size(128);
        record.set_current_size(256);
        assert_eq!(record.allocation_size(), 128);
        assert_eq!(record.current_size(), 256);
    }

    #[test]
    fn test_clear_handle() {
        let record = SampleRecord::new(Backtrace::default(), ObjectHandle(8), 40);
        assert_eq!(record.handle(), Some(ObjectHandle(8)));
        record.clear_handle();
        assert_eq!(record.handle(), None);
    }

    #[test]
    fn test_refcount_tracks_owners() {
        let record = Arc::new(SampleRecord::new(Backtrace::default(), ObjectHandle(8), 40));
        let second_owner = Arc::clone(&record);
        assert_eq!(SampleRecord::refcount(&record), 2);
        drop(second_owner);
        assert_eq!(SampleRecord::refcount(&record), 1);
    }
}

use std::collections::HashMap;
use std::sync::Arc;

use crate::host::ObjectHandle;
use crate::sample::SampleRecord;

/// Live object handle -> the sample recorded when it was allocated.
/// Approximates the currently live sampled heap.
#[derive(Debug)]
pub struct HeapIndex {
    capacity: usize,
    entries: HashMap<ObjectHandle, Arc<SampleRecord>>,
}

impl HeapIndex {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn get(&self, handle: ObjectHandle) -> Option<&Arc<SampleRecord>> {
        self.entries.get(&handle)
    }

    /// Inserts `record` under `handle`, returning whatever was there before.
    pub fn insert(&mut self, handle: ObjectHandle, record: Arc<SampleRecord>) -> Option<Arc<SampleRecord>> {
        self.entries.insert(handle, record)
    }

    pub fn remove(&mut self, handle: ObjectHandle) -> Option<Arc<SampleRecord>> {
        self.entries.remove(&handle)
    }

    /// Removes the entry for `handle` only if it still points at `record`.
    /// A different record means the slot was already reused.
    pub fn remove_if_same(&mut self, handle: ObjectHandle, record: &Arc<SampleRecord>) -> Option<Arc<SampleRecord>> {
        match self.entries.get(&handle) {
            Some(existing) if Arc::ptr_eq(existing, record) => self.entries.remove(&handle),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjectHandle, &Arc<SampleRecord>)> {
        self.entries.iter().map(|(handle, record)| (*handle, record))
    }

    pub fn drain(&mut self) -> Vec<Arc<SampleRecord>> {
        self.entries.drain().map(|(_, record)| record).collect()
    }

    /// Rewrites keys after the host moved objects. Returns records displaced
    /// by a collision, which the caller must release.
    pub fn relocate(&mut self, remap: &mut dyn FnMut(ObjectHandle) -> ObjectHandle) -> Vec<Arc<SampleRecord>> {
        let moves: Vec<(ObjectHandle, ObjectHandle)> = self
            .entries
            .keys()
            .filter_map(|&old| {
                let new = remap(old);
                (new != old).then_some((old, new))
            })
            .collect();

        // Take every moving entry out before reinserting, so chains of moves
        // (a -> b, b -> c) don't clobber each other.
        let moved: Vec<(ObjectHandle, Arc<SampleRecord>)> = moves
            .into_iter()
            .filter_map(|(old, new)| self.entries.remove(&old).map(|record| (new, record)))
            .collect();

        let mut displaced = vec![];
        for (new, record) in moved {
            record.set_handle(new);
            if let Some(previous) = self.entries.insert(new, record) {
                displaced.push(previous);
            }
        }
        displaced
    }
}

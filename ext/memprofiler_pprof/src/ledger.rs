use std::collections::VecDeque;
use std::sync::Arc;

use crate::sample::SampleRecord;

/// Bounded, time-ordered list of allocation samples. The most recently pushed
/// record is at the front.
#[derive(Debug)]
pub struct Ledger {
    capacity: usize,
    records: VecDeque<Arc<SampleRecord>>,
}

#[derive(Debug, PartialEq)]
pub enum LedgerError {
    Full,
}

impl Ledger {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            records: VecDeque::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    // Shrinking below the current length keeps existing records; new pushes
    // are refused until enough are thinned or flushed.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.records.len() >= self.capacity
    }

    pub fn push(&mut self, record: Arc<SampleRecord>) -> Result<(), LedgerError> {
        if self.is_full() {
            return Err(LedgerError::Full);
        }
        self.records.push_front(record);
        Ok(())
    }

    /// Most recent first.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<SampleRecord>> {
        self.records.iter()
    }

    /// Removes `record` (by identity) and hands back the ledger's reference.
    pub fn unlink(&mut self, record: &Arc<SampleRecord>) -> Option<Arc<SampleRecord>> {
        let position = self.records.iter().position(|r| Arc::ptr_eq(r, record))?;
        self.records.remove(position)
    }

    /// Swaps the whole list out, leaving the ledger empty with the same
    /// capacity.
    pub fn detach(&mut self) -> Vec<Arc<SampleRecord>> {
        std::mem::take(&mut self.records).into()
    }

    pub fn contains(&self, record: &Arc<SampleRecord>) -> bool {
        self.records.iter().any(|r| Arc::ptr_eq(r, record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::ObjectHandle;
    use crate::location_table::Backtrace;

    fn record(handle: u64) -> Arc<SampleRecord> {
        Arc::new(SampleRecord::new(Backtrace::default(), ObjectHandle(handle), 40))
    }

    #[test]
    fn test_ledger() {
        let mut ledger = Ledger::new(2);
        assert!(ledger.is_empty());

        ledger.push(record(1)).unwrap();
        ledger.push(record(2)).unwrap();

        let handles: Vec<_> = ledger.iter().map(|r| r.handle().unwrap().0).collect();
        assert_eq!(handles, vec![2, 1]);
    }

    #[test]
    fn test_ledger_full() {
        let mut ledger = Ledger::new(1);
        ledger.push(record(1)).unwrap();
        assert_eq!(ledger.push(record(2)), Err(LedgerError::Full));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_ledger_zero_capacity() {
        let mut ledger = Ledger::new(0);
        assert!(ledger.is_full());
        assert_eq!(ledger.push(record(1)), Err(LedgerError::Full));
    }

    #[test]
    fn test_ledger_unlink() {
        let mut ledger = Ledger::new(3);
        let a = record(1);
        let b = record(2);
        ledger.push(Arc::clone(&a)).unwrap();
        ledger.push(Arc::clone(&b)).unwrap();

        let removed = ledger.unlink(&a).unwrap();
        assert!(Arc::ptr_eq(&removed, &a));
        assert!(!ledger.contains(&a));
        assert!(ledger.contains(&b));
        assert!(ledger.unlink(&a).is_none());
    }

    #[test]
    fn test_ledger_detach() {
        let mut ledger = Ledger::new(3);
        ledger.push(record(1)).unwrap();
        ledger.push(record(2)).unwrap();

        let detached = ledger.detach();
        assert_eq!(detached.len(), 2);
        assert_eq!(detached[0].handle(), Some(ObjectHandle(2)));
        assert!(ledger.is_empty());
        assert_eq!(ledger.capacity(), 3);
    }
}

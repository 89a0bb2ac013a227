pub mod configuration;
#[cfg(feature = "ruby")]
pub mod ruby_object;

use std::cell::{RefCell, RefMut};
#[cfg(test)]
use std::sync::atomic::AtomicBool;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use self::configuration::{BacktraceMethod, Configuration, Rate};
use crate::error::{CollectorError, ConfigurationError, HostError, SerializationError};
use crate::fork::{ForkRegistry, Registration};
use crate::heap_index::HeapIndex;
use crate::host::{Host, ObjectHandle};
use crate::ledger::Ledger;
use crate::location_table::LocationTable;
use crate::lock::{CollectorLock, CollectorLockGuard};
use crate::sample::{SampleKind, SampleRecord};
use crate::serialization::serializer::SerializationContext;
use crate::string_table::{StringIndex, StringTable, Vocabulary};
use crate::util::fatal;

// Captures that may be in progress at once on the thread holding the lock.
// Walking a stack can allocate, so without a bound every capture could start
// another one.
const MAX_CAPTURE_DEPTH: usize = 2;

/// The sampling engine. Receives allocation, free and call-return events from
/// the host and turns the sampled ones into pprof profiles on `flush`.
///
/// Every access to `state` happens with `lock` held, and a borrow of `state`
/// is never held across a call into the host.
pub struct Collector {
    lock: Arc<CollectorLock>,
    state: RefCell<CollectorState>,
    host: Arc<dyn Host>,
    // Read on every allocation, so kept outside of `state`.
    sample_rate: AtomicU32,
    dropped_samples_nolock: AtomicU64,
    dropped_samples_allocation_bufsize: AtomicU64,
    dropped_samples_heap_bufsize: AtomicU64,
    // Only changed with `lock` held, so it counts the captures of one thread.
    capture_depth: AtomicUsize,
    _fork_registration: Registration,
    #[cfg(test)]
    fail_next_serialization: AtomicBool,
}

// `state` is only touched while `lock` is held (see `state_mut`).
unsafe impl Sync for Collector {}

struct CollectorState {
    running: bool,
    allocation_retain_rate: Rate,
    backtrace_method: BacktraceMethod,
    // Number of records at the front of the ledger whose size has not been
    // resolved yet.
    pending_size_count: usize,
    strings: StringTable,
    locations: LocationTable,
    ledger: Ledger,
    heap: HeapIndex,
}

impl CollectorState {
    /// Drops one reference to `record`. The last one returns the backtrace to
    /// the location table.
    fn release(&mut self, record: Arc<SampleRecord>) {
        if let Some(record) = Arc::into_inner(record) {
            self.locations
                .release_backtrace(&mut self.strings, record.into_backtrace());
        }
    }

    fn release_all(&mut self, records: Vec<Arc<SampleRecord>>) {
        for record in records {
            self.release(record);
        }
    }

    fn evict_from_heap(&mut self, handle: ObjectHandle) {
        if let Some(record) = self.heap.remove(handle) {
            record.clear_handle();
            self.release(record);
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushStats {
    pub allocation_samples_count: usize,
    pub heap_samples_count: usize,
    pub dropped_samples_nolock: u64,
    pub dropped_samples_allocation_bufsize: u64,
    pub dropped_samples_heap_bufsize: u64,
}

#[derive(Clone, Debug)]
pub struct FlushResult {
    /// gzip-compressed `perftools.profiles.Profile`
    pub pprof_bytes: Vec<u8>,
    pub stats: FlushStats,
}

impl Collector {
    pub fn new(host: Arc<dyn Host>, configuration: Configuration) -> Result<Arc<Self>, ConfigurationError> {
        Self::with_fork_registry(host, configuration, ForkRegistry::global())
    }

    pub fn with_fork_registry(
        host: Arc<dyn Host>,
        configuration: Configuration,
        registry: &'static ForkRegistry,
    ) -> Result<Arc<Self>, ConfigurationError> {
        let sample_rate = Rate::new("sample_rate", configuration.sample_rate)?;
        let allocation_retain_rate = Rate::new("allocation_retain_rate", configuration.allocation_retain_rate)?;

        let lock = Arc::new(CollectorLock::new());
        let fork_registration = registry.register(&lock);
        Ok(Arc::new(Collector {
            lock,
            state: RefCell::new(CollectorState {
                running: false,
                allocation_retain_rate,
                backtrace_method: configuration.backtrace_method,
                pending_size_count: 0,
                strings: StringTable::new(),
                locations: LocationTable::new(),
                ledger: Ledger::new(configuration.max_allocation_samples),
                heap: HeapIndex::new(configuration.max_heap_samples),
            }),
            host,
            sample_rate: AtomicU32::new(sample_rate.to_bits()),
            dropped_samples_nolock: AtomicU64::new(0),
            dropped_samples_allocation_bufsize: AtomicU64::new(0),
            dropped_samples_heap_bufsize: AtomicU64::new(0),
            capture_depth: AtomicUsize::new(0),
            _fork_registration: fork_registration,
            #[cfg(test)]
            fail_next_serialization: AtomicBool::new(false),
        }))
    }

    fn state_mut<'a>(&'a self, _guard: &CollectorLockGuard<'a>) -> RefMut<'a, CollectorState> {
        match self.state.try_borrow_mut() {
            Ok(state) => state,
            Err(_) => fatal!("collector state re-entered while being modified"),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut CollectorState) -> R) -> R {
        let guard = self.lock.lock();
        let mut state = self.state_mut(&guard);
        f(&mut state)
    }

    /// Clears all accumulated samples and starts receiving events.
    pub fn start(self: &Arc<Self>) -> Result<(), HostError> {
        let guard = self.lock.lock();
        {
            let mut state = self.state_mut(&guard);
            if state.running {
                return Ok(());
            }
            let ledger = state.ledger.detach();
            let heap = state.heap.drain();
            state.release_all(ledger);
            state.release_all(heap);
            state.pending_size_count = 0;
        }
        self.dropped_samples_nolock.store(0, Ordering::SeqCst);
        self.dropped_samples_allocation_bufsize.store(0, Ordering::SeqCst);
        self.dropped_samples_heap_bufsize.store(0, Ordering::SeqCst);

        self.host.register_hooks(self)?;
        self.state_mut(&guard).running = true;
        log::debug!("collector started");
        Ok(())
    }

    /// Stops receiving events. Collected samples stay available to `flush`.
    pub fn stop(&self) -> Result<(), HostError> {
        let guard = self.lock.lock();
        if !self.state_mut(&guard).running {
            return Ok(());
        }
        self.host.unregister_hooks()?;
        self.state_mut(&guard).running = false;
        log::debug!("collector stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.with_state(|state| state.running)
    }

    /// Runs `f` with the collector started and returns what it sampled.
    pub fn profile(self: &Arc<Self>, f: impl FnOnce()) -> Result<FlushResult, CollectorError> {
        self.start()?;
        f();
        let result = self.flush();
        self.stop()?;
        Ok(result?)
    }

    /// Applies every setting at once, or none of them.
    pub fn configure(&self, configuration: &Configuration) -> Result<(), ConfigurationError> {
        let sample_rate = Rate::new("sample_rate", configuration.sample_rate)?;
        let allocation_retain_rate = Rate::new("allocation_retain_rate", configuration.allocation_retain_rate)?;

        self.with_state(|state| {
            self.sample_rate.store(sample_rate.to_bits(), Ordering::SeqCst);
            state.allocation_retain_rate = allocation_retain_rate;
            state.ledger.set_capacity(configuration.max_allocation_samples);
            state.heap.set_capacity(configuration.max_heap_samples);
            state.backtrace_method = configuration.backtrace_method;
        });
        log::debug!("collector configured: {:?}", configuration);
        Ok(())
    }

    pub fn configuration(&self) -> Configuration {
        let sample_rate = self.sample_rate();
        self.with_state(|state| Configuration {
            sample_rate,
            allocation_retain_rate: state.allocation_retain_rate.as_f64(),
            max_allocation_samples: state.ledger.capacity(),
            max_heap_samples: state.heap.capacity(),
            backtrace_method: state.backtrace_method,
        })
    }

    pub fn sample_rate(&self) -> f64 {
        Rate::from_bits(self.sample_rate.load(Ordering::SeqCst)).as_f64()
    }

    pub fn set_sample_rate(&self, value: f64) -> Result<(), ConfigurationError> {
        let rate = Rate::new("sample_rate", value)?;
        self.sample_rate.store(rate.to_bits(), Ordering::SeqCst);
        Ok(())
    }

    pub fn allocation_retain_rate(&self) -> f64 {
        self.with_state(|state| state.allocation_retain_rate.as_f64())
    }

    pub fn set_allocation_retain_rate(&self, value: f64) -> Result<(), ConfigurationError> {
        let rate = Rate::new("allocation_retain_rate", value)?;
        self.with_state(|state| state.allocation_retain_rate = rate);
        Ok(())
    }

    pub fn max_allocation_samples(&self) -> usize {
        self.with_state(|state| state.ledger.capacity())
    }

    pub fn set_max_allocation_samples(&self, value: usize) {
        self.with_state(|state| state.ledger.set_capacity(value));
    }

    pub fn max_heap_samples(&self) -> usize {
        self.with_state(|state| state.heap.capacity())
    }

    pub fn set_max_heap_samples(&self, value: usize) {
        self.with_state(|state| state.heap.set_capacity(value));
    }

    pub fn backtrace_method(&self) -> BacktraceMethod {
        self.with_state(|state| state.backtrace_method)
    }

    pub fn set_backtrace_method(&self, value: BacktraceMethod) {
        self.with_state(|state| state.backtrace_method = value);
    }

    pub fn live_heap_samples_count(&self) -> usize {
        self.with_state(|state| state.heap.len())
    }

    pub fn allocation_samples_count(&self) -> usize {
        self.with_state(|state| state.ledger.len())
    }

    pub fn pending_size_count(&self) -> usize {
        self.with_state(|state| state.pending_size_count)
    }

    /// Approximate heap footprint of everything the collector holds.
    pub fn memsize(&self) -> usize {
        self.with_state(|state| {
            std::mem::size_of::<Self>()
                + state.strings.memsize()
                + state.locations.memsize()
                + state.ledger.iter().map(|record| record.memsize()).sum::<usize>()
                + state.heap.len() * std::mem::size_of::<(ObjectHandle, Arc<SampleRecord>)>()
        })
    }

    /// Allocation event. `size_hint` is used until the object's real size can
    /// be measured on the next call-return event.
    pub fn on_alloc(&self, handle: ObjectHandle, size_hint: usize) -> Result<(), HostError> {
        let _guard = self.lock.lock();

        let backtrace_method = {
            let Ok(mut state) = self.state.try_borrow_mut() else {
                self.drop_nolock();
                return Ok(());
            };

            // The host may reuse a slot without reporting the free; whatever
            // we knew about `handle` is stale now.
            state.evict_from_heap(handle);

            let sample_rate = Rate::from_bits(self.sample_rate.load(Ordering::SeqCst));
            if !sample_rate.admits(rand::random()) {
                return Ok(());
            }
            if self.capture_depth.load(Ordering::SeqCst) >= MAX_CAPTURE_DEPTH {
                self.drop_nolock();
                return Ok(());
            }
            if !self.has_room(&state) {
                return Ok(());
            }
            state.backtrace_method
        };

        // May allocate and recurse into on_alloc on this thread.
        self.capture_depth.fetch_add(1, Ordering::SeqCst);
        let captured = self.host.capture_backtrace(backtrace_method);
        self.capture_depth.fetch_sub(1, Ordering::SeqCst);
        let frames = captured?;

        let Ok(mut state) = self.state.try_borrow_mut() else {
            self.drop_nolock();
            return Ok(());
        };
        // Nested allocations during the capture may have filled the buffers.
        if !self.has_room(&state) {
            return Ok(());
        }

        let state = &mut *state;
        let backtrace = state.locations.intern_backtrace(&mut state.strings, &frames);
        let record = Arc::new(SampleRecord::new(backtrace, handle, size_hint));
        if state.ledger.push(Arc::clone(&record)).is_err() {
            fatal!("allocation ledger full after capacity check");
        }
        if let Some(previous) = state.heap.insert(handle, record) {
            previous.clear_handle();
            state.release(previous);
        }
        state.pending_size_count += 1;
        Ok(())
    }

    fn has_room(&self, state: &CollectorState) -> bool {
        if state.ledger.is_full() {
            self.dropped_samples_allocation_bufsize.fetch_add(1, Ordering::SeqCst);
            log::trace!("allocation sample dropped: ledger full");
            return false;
        }
        if state.heap.is_full() {
            self.dropped_samples_heap_bufsize.fetch_add(1, Ordering::SeqCst);
            log::trace!("allocation sample dropped: heap index full");
            return false;
        }
        true
    }

    fn drop_nolock(&self) {
        self.dropped_samples_nolock.fetch_add(1, Ordering::SeqCst);
        log::trace!("allocation sample dropped: collector busy");
    }

    /// Free event. Never calls into the host and never fails.
    pub fn on_free(&self, handle: ObjectHandle) {
        let guard = self.lock.lock();
        self.state_mut(&guard).evict_from_heap(handle);
    }

    /// Call-return event. Measures the objects allocated since the last call
    /// and thins the ledger down to the retain rate. Skipped on contention.
    pub fn on_return(&self) {
        let Some(guard) = self.lock.try_lock() else {
            return;
        };

        let (pending, retain_rate) = {
            let Ok(state) = self.state.try_borrow() else {
                return;
            };
            if state.pending_size_count == 0 {
                return;
            }
            if state.pending_size_count > state.ledger.len() {
                fatal!(
                    "{} records pending size resolution but only {} in the ledger",
                    state.pending_size_count,
                    state.ledger.len()
                );
            }
            let pending: Vec<Arc<SampleRecord>> = state
                .ledger
                .iter()
                .take(state.pending_size_count)
                .cloned()
                .collect();
            (pending, state.allocation_retain_rate)
        };

        // None: the object is already gone
        let sizes: Vec<Option<usize>> = pending
            .iter()
            .map(|record| match record.handle() {
                Some(handle) if self.host.is_still_live(handle) => Some(self.host.size_of(handle)),
                _ => None,
            })
            .collect();

        let mut state = self.state_mut(&guard);
        let processed = pending.len();
        for (record, size) in pending.into_iter().zip(sizes) {
            match size {
                Some(size) => record.resolve_size(size),
                None => {
                    if let Some(handle) = record.handle() {
                        if let Some(entry) = state.heap.remove_if_same(handle, &record) {
                            state.release(entry);
                        }
                        record.clear_handle();
                    }
                }
            }

            if !retain_rate.admits(rand::random()) {
                if let Some(unlinked) = state.ledger.unlink(&record) {
                    state.release(unlinked);
                }
            }
            state.release(record);
        }
        state.pending_size_count = state.pending_size_count.saturating_sub(processed);
    }

    /// Called by the host after it moved objects in memory.
    pub fn on_handles_relocated(&self, remap: &mut dyn FnMut(ObjectHandle) -> ObjectHandle) {
        self.with_state(|state| {
            for displaced in state.heap.relocate(remap) {
                displaced.clear_handle();
                state.release(displaced);
            }
        });
    }

    pub fn report_strong_references(&self, visitor: &mut dyn FnMut(ObjectHandle)) {
        self.host.report_strong_references(visitor);
    }

    /// Exports every allocation sampled since the last flush plus the current
    /// heap samples. The allocation ledger starts over; the heap index does
    /// not.
    pub fn flush(&self) -> Result<FlushResult, SerializationError> {
        let (detached, heap_snapshot) = {
            let guard = self.lock.lock();
            let mut state = self.state_mut(&guard);
            state.pending_size_count = 0;
            let heap_snapshot: Vec<(ObjectHandle, Arc<SampleRecord>)> = state
                .heap
                .iter()
                .map(|(handle, record)| (handle, Arc::clone(record)))
                .collect();
            let detached = state.ledger.detach();
            (detached, heap_snapshot)
        };
        let mut stats = FlushStats {
            allocation_samples_count: detached.len(),
            dropped_samples_nolock: self.dropped_samples_nolock.swap(0, Ordering::SeqCst),
            dropped_samples_allocation_bufsize: self.dropped_samples_allocation_bufsize.swap(0, Ordering::SeqCst),
            dropped_samples_heap_bufsize: self.dropped_samples_heap_bufsize.swap(0, Ordering::SeqCst),
            ..Default::default()
        };

        let sizes: Vec<Option<usize>> = heap_snapshot
            .iter()
            .map(|(handle, _)| self.host.is_still_live(*handle).then(|| self.host.size_of(*handle)))
            .collect();

        let (heap_records, strings, vocabulary) = {
            let guard = self.lock.lock();
            let mut state = self.state_mut(&guard);
            for ((handle, record), size) in heap_snapshot.into_iter().zip(sizes) {
                match size {
                    Some(size) => record.set_current_size(size),
                    None => {
                        if let Some(entry) = state.heap.remove_if_same(handle, &record) {
                            entry.clear_handle();
                            state.release(entry);
                        }
                    }
                }
                state.release(record);
            }
            let heap_records: Vec<Arc<SampleRecord>> = state.heap.iter().map(|(_, record)| Arc::clone(record)).collect();
            let strings = state.strings.snapshot_index();
            (heap_records, strings, state.strings.vocabulary().clone())
        };
        stats.heap_samples_count = heap_records.len();

        let serialized = serialize(strings, vocabulary, &detached, &heap_records);
        #[cfg(test)]
        let serialized = if self.fail_next_serialization.swap(false, Ordering::SeqCst) {
            Err(SerializationError::Compress(std::io::Error::other("gzip stream broke")))
        } else {
            serialized
        };

        {
            let guard = self.lock.lock();
            let mut state = self.state_mut(&guard);
            state.release_all(detached);
            state.release_all(heap_records);
        }

        let pprof_bytes = serialized?;
        log::debug!(
            "flushed {} bytes of pprof: {}",
            pprof_bytes.len(),
            serde_json::to_string(&stats).unwrap_or_default()
        );
        Ok(FlushResult { pprof_bytes, stats })
    }
}

fn serialize(
    strings: StringIndex,
    vocabulary: Vocabulary,
    allocations: &[Arc<SampleRecord>],
    heap: &[Arc<SampleRecord>],
) -> Result<Vec<u8>, SerializationError> {
    let mut ctx = SerializationContext::new(strings, vocabulary)?;
    for record in allocations {
        ctx.add_sample(record, SampleKind::Allocation)?;
    }
    for record in heap {
        ctx.add_sample(record, SampleKind::Heap)?;
    }
    Ok(ctx.serialize()?.to_vec())
}

//! An in-memory host for driving the collector in tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::collector::configuration::BacktraceMethod;
use crate::collector::Collector;
use crate::error::HostError;
use crate::host::{CapturedFrame, Host, ObjectHandle};

pub(crate) struct FakeHost {
    // live object -> size
    objects: Mutex<HashMap<ObjectHandle, usize>>,
    frames: Mutex<Vec<CapturedFrame>>,
    nested_allocation: Mutex<Option<(Weak<Collector>, ObjectHandle)>>,
    // Every capture allocates a fresh object, like a stack walk building strings.
    allocating_captures: Mutex<Option<Weak<Collector>>>,
    next_capture_handle: AtomicU64,
    hook_handles: Mutex<Vec<ObjectHandle>>,
    marked: Mutex<Vec<ObjectHandle>>,
    fail_capture: AtomicBool,
    fail_register: AtomicBool,
    hooks_registered: AtomicBool,
    captures: AtomicUsize,
}

impl FakeHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            objects: Mutex::new(HashMap::new()),
            frames: Mutex::new(vec![
                CapturedFrame::new("<main>", "main.rb", 1, 1),
                CapturedFrame::new("Object#work", "main.rb", 5, 7),
            ]),
            nested_allocation: Mutex::new(None),
            allocating_captures: Mutex::new(None),
            next_capture_handle: AtomicU64::new(1_000_000),
            hook_handles: Mutex::new(Vec::new()),
            marked: Mutex::new(Vec::new()),
            fail_capture: AtomicBool::new(false),
            fail_register: AtomicBool::new(false),
            hooks_registered: AtomicBool::new(false),
            captures: AtomicUsize::new(0),
        })
    }

    /// Creates `handle` and reports the allocation.
    pub fn allocate(&self, collector: &Collector, handle: ObjectHandle, size: usize) -> Result<(), HostError> {
        self.objects.lock().insert(handle, size);
        collector.on_alloc(handle, size)
    }

    /// Destroys `handle` and reports the free.
    pub fn free(&self, collector: &Collector, handle: ObjectHandle) {
        self.objects.lock().remove(&handle);
        collector.on_free(handle);
    }

    /// Destroys `handle` without telling the collector.
    pub fn kill(&self, handle: ObjectHandle) {
        self.objects.lock().remove(&handle);
    }

    pub fn set_size(&self, handle: ObjectHandle, size: usize) {
        self.objects.lock().insert(handle, size);
    }

    pub fn set_frames(&self, frames: Vec<CapturedFrame>) {
        *self.frames.lock() = frames;
    }

    pub fn fail_next_capture(&self) {
        self.fail_capture.store(true, Ordering::SeqCst);
    }

    pub fn fail_register(&self) {
        self.fail_register.store(true, Ordering::SeqCst);
    }

    /// The next backtrace capture allocates `handle` before returning.
    pub fn allocate_during_next_capture(&self, collector: &Arc<Collector>, handle: ObjectHandle) {
        *self.nested_allocation.lock() = Some((Arc::downgrade(collector), handle));
    }

    pub fn allocate_during_every_capture(&self, collector: &Arc<Collector>) {
        *self.allocating_captures.lock() = Some(Arc::downgrade(collector));
    }

    /// Handles reported while the hooks were being created.
    pub fn marked(&self) -> Vec<ObjectHandle> {
        self.marked.lock().clone()
    }

    pub fn hooks_registered(&self) -> bool {
        self.hooks_registered.load(Ordering::SeqCst)
    }

    pub fn captures(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }
}

impl Host for FakeHost {
    fn register_hooks(&self, collector: &Arc<Collector>) -> Result<(), HostError> {
        if self.fail_register.load(Ordering::SeqCst) {
            return Err(HostError::new("tracepoint unavailable"));
        }
        // Enabling hooks may allocate and run a GC, which marks the collector.
        collector.report_strong_references(&mut |handle| self.marked.lock().push(handle));
        let mut hooks = self.hook_handles.lock();
        if hooks.is_empty() {
            *hooks = vec![ObjectHandle(0xf001), ObjectHandle(0xf002), ObjectHandle(0xf003)];
        }
        self.hooks_registered.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn unregister_hooks(&self) -> Result<(), HostError> {
        self.hooks_registered.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn capture_backtrace(&self, _method: BacktraceMethod) -> Result<Vec<CapturedFrame>, HostError> {
        self.captures.fetch_add(1, Ordering::SeqCst);

        let nested = self.nested_allocation.lock().take();
        if let Some((collector, handle)) = nested {
            if let Some(collector) = collector.upgrade() {
                self.allocate(&collector, handle, 40)?;
            }
        }

        let allocating = self.allocating_captures.lock().clone();
        if let Some(collector) = allocating.and_then(|collector| collector.upgrade()) {
            let handle = ObjectHandle(self.next_capture_handle.fetch_add(1, Ordering::SeqCst));
            self.allocate(&collector, handle, 40)?;
        }

        if self.fail_capture.swap(false, Ordering::SeqCst) {
            return Err(HostError::new("stack walk failed"));
        }
        Ok(self.frames.lock().clone())
    }

    fn size_of(&self, handle: ObjectHandle) -> usize {
        self.objects.lock().get(&handle).copied().unwrap_or(0)
    }

    fn is_still_live(&self, handle: ObjectHandle) -> bool {
        self.objects.lock().contains_key(&handle)
    }

    fn report_strong_references(&self, visitor: &mut dyn FnMut(ObjectHandle)) {
        for handle in self.hook_handles.lock().iter() {
            visitor(*handle);
        }
    }
}

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once};

use parking_lot::Mutex;

use crate::lock::CollectorLock;

/// Every live collector's lock, so that a fork can never happen while one of
/// them is mid-critical-section.
///
/// - prepare: take the registry lock, then every collector lock
/// - parent: release them all normally
/// - child: re-create every collector lock (the threads that might have owned
///   them do not exist in the child), then release the registry lock
pub struct ForkRegistry {
    entries: Mutex<Vec<Entry>>,
    next_id: AtomicU64,
}

struct Entry {
    id: u64,
    lock: Arc<CollectorLock>,
}

/// Keeps a lock registered until dropped.
#[derive(Debug)]
pub struct Registration {
    registry: &'static ForkRegistry,
    id: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
    }
}

static GLOBAL_REGISTRY: ForkRegistry = ForkRegistry::new();
static INSTALL_ATFORK: Once = Once::new();

impl std::fmt::Debug for ForkRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForkRegistry").finish_non_exhaustive()
    }
}

impl ForkRegistry {
    pub const fn new() -> Self {
        Self {
            entries: parking_lot::const_mutex(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn global() -> &'static ForkRegistry {
        INSTALL_ATFORK.call_once(install_atfork_handlers);
        &GLOBAL_REGISTRY
    }

    pub fn register(&'static self, lock: &Arc<CollectorLock>) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().push(Entry {
            id,
            lock: Arc::clone(lock),
        });
        Registration { registry: self, id }
    }

    fn unregister(&self, id: u64) {
        self.entries.lock().retain(|entry| entry.id != id);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn prepare(&self) {
        let entries = self.entries.lock();
        for entry in entries.iter() {
            entry.lock.lock_for_fork();
        }
        // Held until release_parent / release_child
        std::mem::forget(entries);
    }

    pub fn release_parent(&self) {
        // Reclaims the guard forgotten in prepare(); dropping it unlocks.
        let entries = unsafe { self.entries.make_guard_unchecked() };
        for entry in entries.iter() {
            unsafe { entry.lock.unlock_after_fork() };
        }
    }

    pub fn release_child(&self) {
        let entries = unsafe { self.entries.make_guard_unchecked() };
        for entry in entries.iter() {
            unsafe { entry.lock.reinitialize() };
        }
    }
}

#[cfg(unix)]
fn install_atfork_handlers() {
    unsafe extern "C" fn prepare() {
        GLOBAL_REGISTRY.prepare();
    }
    unsafe extern "C" fn release_parent() {
        GLOBAL_REGISTRY.release_parent();
    }
    unsafe extern "C" fn release_child() {
        GLOBAL_REGISTRY.release_child();
    }

    let err = unsafe { libc::pthread_atfork(Some(prepare), Some(release_parent), Some(release_child)) };
    if err != 0 {
        crate::util::fatal!("pthread_atfork failed: {}", err);
    }
    log::debug!("atfork handlers installed");
}

#[cfg(not(unix))]
fn install_atfork_handlers() {}

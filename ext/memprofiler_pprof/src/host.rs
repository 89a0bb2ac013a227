use std::fmt;
use std::sync::Arc;

use crate::collector::configuration::BacktraceMethod;
use crate::collector::Collector;
use crate::error::HostError;

/// Opaque identity of a host runtime object (a `VALUE` for Ruby).
///
/// `ObjectHandle(0)` never names a live object; the collector uses it to mark
/// records whose object is known to be gone.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectHandle(pub u64);

impl ObjectHandle {
    pub const NONE: ObjectHandle = ObjectHandle(0);

    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}

impl fmt::Debug for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectHandle({:#x})", self.0)
    }
}

/// One frame of a stack captured by the host, before interning.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CapturedFrame {
    /// Stable identity of the function; 0 lets the location table derive one
    /// from the name, file and start line.
    pub function_id: u64,
    pub function_name: String,
    pub file_name: String,
    pub function_line: i64,
    /// The line that was executing.
    pub line: i64,
}

impl CapturedFrame {
    pub fn new(
        function_name: impl Into<String>,
        file_name: impl Into<String>,
        function_line: i64,
        line: i64,
    ) -> Self {
        Self {
            function_id: 0,
            function_name: function_name.into(),
            file_name: file_name.into(),
            function_line,
            line,
        }
    }
}

/// Everything the collector needs from the runtime it is profiling.
///
/// Contract for implementors:
/// - `capture_backtrace` may allocate and thereby re-enter
///   [`Collector::on_alloc`] / [`Collector::on_free`] on the same thread.
/// - `size_of`, `is_still_live` and `report_strong_references` must not
///   re-enter the collector.
/// - Frames are returned most recent call LAST.
pub trait Host: Send + Sync {
    /// Starts delivering allocation, free and call-return events to
    /// `collector`.
    fn register_hooks(&self, collector: &Arc<Collector>) -> Result<(), HostError>;

    fn unregister_hooks(&self) -> Result<(), HostError>;

    fn capture_backtrace(&self, method: BacktraceMethod) -> Result<Vec<CapturedFrame>, HostError>;

    /// Memory footprint of a live object. Only valid once
    /// [`Host::is_still_live`] returned true for `handle`.
    fn size_of(&self, handle: ObjectHandle) -> usize;

    /// Cheap check that `handle` still refers to an allocated object.
    fn is_still_live(&self, handle: ObjectHandle) -> bool;

    /// Reports every strong reference the host side of the collector holds
    /// (e.g. its hook objects) to the runtime's reachability tracer.
    fn report_strong_references(&self, _visitor: &mut dyn FnMut(ObjectHandle)) {}
}

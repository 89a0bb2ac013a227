use std::ffi::{c_int, c_void, CStr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rb_sys::*;

use crate::collector::configuration::BacktraceMethod;
use crate::collector::Collector;
use crate::error::HostError;
use crate::host::{CapturedFrame, Host, ObjectHandle};
use crate::string_table::UNKNOWN_LITERAL;
use crate::util::*;

const MAX_STACK_DEPTH: usize = 500;

// Size of one object slot, reported for objects until they can be measured.
static SLOT_SIZE: AtomicUsize = AtomicUsize::new(40);

/// Reads the VM's object slot size from `GC::INTERNAL_CONSTANTS`.
pub fn detect_slot_size() {
    unsafe {
        let constants = rb_const_get(rb_mGC, rb_intern(cstr!("INTERNAL_CONSTANTS")));
        for key in [cstr!("RVALUE_SIZE"), cstr!("BASE_SLOT_SIZE")] {
            let value = rb_hash_aref(constants, rb_id2sym(rb_intern(key)));
            if RTEST(value) {
                let size = rb_num2long(value);
                if let Ok(size) = usize::try_from(size) {
                    SLOT_SIZE.store(size, Ordering::Relaxed);
                    log::debug!("object slot size: {}", size);
                    return;
                }
            }
        }
    }
}

/// Host backed by the Ruby VM: tracepoints deliver events, and stacks come
/// from `rb_profile_frames` or `Kernel#caller_locations`.
pub struct RubyHost {
    tracepoints: Mutex<Option<Tracepoints>>,
}

#[derive(Clone, Copy)]
struct Tracepoints {
    newobj: VALUE,
    freeobj: VALUE,
    creturn: VALUE,
}

impl RubyHost {
    pub fn new() -> Self {
        Self {
            tracepoints: Mutex::new(None),
        }
    }

    // `tracepoints` is never held across a call into the VM: creating a
    // tracepoint allocates, and the GC that may trigger marks the collector
    // through `report_strong_references`.
    fn tracepoints(&self, collector: &Arc<Collector>) -> Tracepoints {
        let existing = *self.tracepoints.lock();
        if let Some(tp) = existing {
            return tp;
        }

        // The collector owns this host, so it outlives the tracepoints.
        let data = Arc::as_ptr(collector) as *mut c_void;
        // Not yet reachable from the collector; the conservative stack scan
        // keeps them alive until they are stored.
        let created = unsafe {
            Tracepoints {
                newobj: rb_tracepoint_new(0, RUBY_INTERNAL_EVENT_NEWOBJ, Some(on_newobj), data),
                freeobj: rb_tracepoint_new(0, RUBY_INTERNAL_EVENT_FREEOBJ, Some(on_freeobj), data),
                creturn: rb_tracepoint_new(0, RUBY_EVENT_C_RETURN, Some(on_creturn), data),
            }
        };
        *self.tracepoints.lock().get_or_insert(created)
    }
}

impl Host for RubyHost {
    fn register_hooks(&self, collector: &Arc<Collector>) -> Result<(), HostError> {
        let tp = self.tracepoints(collector);
        unsafe {
            rb_tracepoint_enable(tp.newobj);
            rb_tracepoint_enable(tp.freeobj);
            rb_tracepoint_enable(tp.creturn);
        }
        Ok(())
    }

    fn unregister_hooks(&self) -> Result<(), HostError> {
        let tracepoints = *self.tracepoints.lock();
        if let Some(tp) = tracepoints {
            unsafe {
                rb_tracepoint_disable(tp.newobj);
                rb_tracepoint_disable(tp.freeobj);
                rb_tracepoint_disable(tp.creturn);
            }
        }
        Ok(())
    }

    fn capture_backtrace(&self, method: BacktraceMethod) -> Result<Vec<CapturedFrame>, HostError> {
        let capture: unsafe extern "C" fn(VALUE) -> VALUE = match method {
            BacktraceMethod::Fast => capture_profile_frames,
            BacktraceMethod::Slow => capture_caller_locations,
        };

        let mut frames: Vec<CapturedFrame> = Vec::with_capacity(64);
        let mut state: c_int = 0;
        unsafe {
            let errinfo = rb_errinfo();
            rb_protect(Some(capture), &mut frames as *mut Vec<CapturedFrame> as VALUE, &mut state);
            if state != 0 {
                rb_set_errinfo(errinfo);
                return Err(HostError::new(format!(
                    "{} backtrace capture raised (tag {})",
                    method, state
                )));
            }
        }
        // Ruby hands out the innermost frame first
        frames.reverse();
        Ok(frames)
    }

    fn size_of(&self, handle: ObjectHandle) -> usize {
        unsafe { mpp_obj_memsize_of(handle.0 as VALUE) }
    }

    fn is_still_live(&self, handle: ObjectHandle) -> bool {
        unsafe { mpp_is_value_still_validish(handle.0 as VALUE) }
    }

    fn report_strong_references(&self, visitor: &mut dyn FnMut(ObjectHandle)) {
        let tracepoints = *self.tracepoints.lock();
        if let Some(tp) = tracepoints {
            for value in [tp.newobj, tp.freeobj, tp.creturn] {
                visitor(ObjectHandle(value as u64));
            }
        }
    }
}

unsafe fn collector_from(data: *mut c_void) -> &'static Collector {
    unsafe { &*(data as *const Collector) }
}

unsafe fn traced_object(tpval: VALUE) -> ObjectHandle {
    unsafe { ObjectHandle(rb_tracearg_object(rb_tracearg_from_tracepoint(tpval)) as u64) }
}

unsafe extern "C" fn on_newobj(tpval: VALUE, data: *mut c_void) {
    let collector = unsafe { collector_from(data) };
    let handle = unsafe { traced_object(tpval) };
    // The exception was already swallowed; the allocation itself must go on.
    if let Err(e) = collector.on_alloc(handle, SLOT_SIZE.load(Ordering::Relaxed)) {
        log::debug!("allocation not sampled: {}", e);
    }
}

// Must not allocate.
unsafe extern "C" fn on_freeobj(tpval: VALUE, data: *mut c_void) {
    let collector = unsafe { collector_from(data) };
    collector.on_free(unsafe { traced_object(tpval) });
}

unsafe extern "C" fn on_creturn(_tpval: VALUE, data: *mut c_void) {
    unsafe { collector_from(data) }.on_return();
}

unsafe fn value_to_string(mut value: VALUE) -> Option<String> {
    if !RTEST(value) {
        return None;
    }
    unsafe {
        Some(
            CStr::from_ptr(rb_string_value_cstr(&mut value))
                .to_string_lossy()
                .into_owned(),
        )
    }
}

unsafe fn value_to_line(value: VALUE) -> i64 {
    if RTEST(value) {
        unsafe { rb_num2long(value) as i64 }
    } else {
        0
    }
}

unsafe extern "C" fn capture_profile_frames(out: VALUE) -> VALUE {
    let out = unsafe { &mut *(out as *mut Vec<CapturedFrame>) };
    let mut buffer: [VALUE; MAX_STACK_DEPTH] = [0; MAX_STACK_DEPTH];
    let mut lines: [c_int; MAX_STACK_DEPTH] = [0; MAX_STACK_DEPTH];

    unsafe {
        let depth = rb_profile_frames(
            0,
            MAX_STACK_DEPTH as c_int,
            buffer.as_mut_ptr(),
            lines.as_mut_ptr(),
        );
        for i in 0..depth.max(0) as usize {
            let frame = buffer[i];
            out.push(CapturedFrame::new(
                value_to_string(rb_profile_frame_full_label(frame)).unwrap_or_else(|| UNKNOWN_LITERAL.to_owned()),
                value_to_string(rb_profile_frame_path(frame)).unwrap_or_else(|| UNKNOWN_LITERAL.to_owned()),
                value_to_line(rb_profile_frame_first_lineno(frame)),
                lines[i] as i64,
            ));
        }
    }
    Qnil.into()
}

unsafe extern "C" fn capture_caller_locations(out: VALUE) -> VALUE {
    let out = unsafe { &mut *(out as *mut Vec<CapturedFrame>) };

    unsafe {
        let locations = rb_funcall(rb_mKernel, rb_intern(cstr!("caller_locations")), 0);
        if !RTEST(locations) {
            return Qnil.into();
        }
        let label = rb_intern(cstr!("label"));
        let path = rb_intern(cstr!("path"));
        let lineno = rb_intern(cstr!("lineno"));
        for i in 0..RARRAY_LEN(locations) {
            let location = rb_ary_entry(locations, i);
            out.push(CapturedFrame::new(
                value_to_string(rb_funcall(location, label, 0)).unwrap_or_else(|| UNKNOWN_LITERAL.to_owned()),
                value_to_string(rb_funcall(location, path, 0)).unwrap_or_else(|| UNKNOWN_LITERAL.to_owned()),
                0,
                value_to_line(rb_funcall(location, lineno, 0)),
            ));
        }
    }
    Qnil.into()
}

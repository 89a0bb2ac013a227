use std::ffi::{c_char, c_int, c_long, c_void, CStr};
use std::mem::ManuallyDrop;
use std::ptr::{addr_of, null, null_mut};
use std::str::FromStr as _;
use std::sync::Arc;

use rb_sys::*;

use super::configuration::{self, BacktraceMethod, Configuration};
use super::{Collector, FlushResult};
use crate::host::ObjectHandle;
use crate::ruby_host::RubyHost;
use crate::util::*;

pub struct CollectorRubyObject {
    collector: Option<Arc<Collector>>,
}

unsafe fn raise(class: VALUE, message: String) -> ! {
    unsafe {
        let exception = rb_exc_new(class, message.as_ptr() as *const c_char, message.len() as c_long);
        drop(message);
        rb_exc_raise(exception)
    }
}

unsafe fn symbol(name: *const c_char) -> VALUE {
    unsafe { rb_id2sym(rb_intern(name)) }
}

impl CollectorRubyObject {
    pub unsafe extern "C" fn rb_initialize(argc: c_int, argv: *const VALUE, rbself: VALUE) -> VALUE {
        // Parse arguments
        let mut kwargs: VALUE = Qnil.into();
        unsafe {
            rb_scan_args(argc, argv, cstr!(":"), &mut kwargs as *mut VALUE);
        };
        let mut kwargs_values: [VALUE; 5] = [Qnil.into(); 5];
        unsafe {
            rb_get_kwargs(
                kwargs,
                [
                    rb_intern(cstr!("sample_rate")),
                    rb_intern(cstr!("max_allocation_samples")),
                    rb_intern(cstr!("max_heap_samples")),
                    rb_intern(cstr!("bt_method")),
                    rb_intern(cstr!("allocation_retain_rate")),
                ]
                .as_mut_ptr(),
                0,
                5,
                kwargs_values.as_mut_ptr(),
            );
        };

        let configuration = unsafe {
            Configuration {
                sample_rate: Self::parse_option_rate(kwargs_values[0], configuration::DEFAULT_SAMPLE_RATE),
                max_allocation_samples: Self::parse_option_count(
                    kwargs_values[1],
                    configuration::DEFAULT_MAX_ALLOCATION_SAMPLES,
                ),
                max_heap_samples: Self::parse_option_count(kwargs_values[2], configuration::DEFAULT_MAX_HEAP_SAMPLES),
                backtrace_method: Self::parse_option_bt_method(kwargs_values[3]),
                allocation_retain_rate: Self::parse_option_rate(
                    kwargs_values[4],
                    configuration::DEFAULT_ALLOCATION_RETAIN_RATE,
                ),
            }
        };

        let collector = match Collector::new(Arc::new(RubyHost::new()), configuration) {
            Ok(collector) => collector,
            Err(e) => unsafe { raise(rb_eArgError, e.to_string()) },
        };
        let mut obj = unsafe { Self::get_struct_from(rbself) };
        obj.collector = Some(collector);
        Qnil.into()
    }

    unsafe fn parse_option_rate(value: VALUE, default: f64) -> f64 {
        if value == Qundef as VALUE {
            return default;
        }
        unsafe { rb_num2dbl(value) }
    }

    unsafe fn parse_option_count(value: VALUE, default: usize) -> usize {
        if value == Qundef as VALUE {
            return default;
        }
        let count = unsafe { rb_num2long(value) };
        usize::try_from(count).unwrap_or_else(|_| unsafe {
            raise(rb_eArgError, format!("sample count must not be negative (got {})", count))
        })
    }

    unsafe fn parse_option_bt_method(value: VALUE) -> BacktraceMethod {
        if value == Qundef as VALUE {
            return configuration::DEFAULT_BACKTRACE_METHOD;
        }
        let specified = unsafe {
            let mut str = rb_funcall(value, rb_intern(cstr!("to_s")), 0);
            let ptr = rb_string_value_cstr(&mut str);
            CStr::from_ptr(ptr).to_string_lossy().into_owned()
        };
        BacktraceMethod::from_str(&specified).unwrap_or_else(|e| unsafe { raise(rb_eArgError, e.to_string()) })
    }

    unsafe fn collector_of(rbself: VALUE) -> Arc<Collector> {
        let obj = unsafe { Self::get_struct_from(rbself) };
        match &obj.collector {
            Some(collector) => Arc::clone(collector),
            None => unsafe { rb_raise(rb_eRuntimeError, cstr!("Collector is not initialized")) },
        }
    }

    pub unsafe extern "C" fn rb_start(rbself: VALUE) -> VALUE {
        let collector = unsafe { Self::collector_of(rbself) };
        if let Err(e) = collector.start() {
            drop(collector);
            unsafe { raise(rb_eRuntimeError, e.to_string()) }
        }
        Qnil.into()
    }

    pub unsafe extern "C" fn rb_stop(rbself: VALUE) -> VALUE {
        let collector = unsafe { Self::collector_of(rbself) };
        if let Err(e) = collector.stop() {
            drop(collector);
            unsafe { raise(rb_eRuntimeError, e.to_string()) }
        }
        Qnil.into()
    }

    pub unsafe extern "C" fn rb_is_running(rbself: VALUE) -> VALUE {
        if unsafe { Self::collector_of(rbself) }.is_running() {
            Qtrue.into()
        } else {
            Qfalse.into()
        }
    }

    pub unsafe extern "C" fn rb_flush(rbself: VALUE) -> VALUE {
        let result = unsafe { Self::collector_of(rbself) }.flush();
        match result {
            Ok(result) => unsafe { Self::flush_result_to_profile_data(result) },
            Err(e) => unsafe {
                raise(
                    rb_eRuntimeError,
                    format!("memprofiler_pprof failed serializing pprof protobuf: {}", e),
                )
            },
        }
    }

    pub unsafe extern "C" fn rb_profile(rbself: VALUE) -> VALUE {
        if unsafe { rb_block_given_p() } == 0 {
            unsafe { rb_raise(rb_eArgError, cstr!("profile requires a block")) }
        }
        unsafe extern "C" fn yield_block(_: VALUE) -> VALUE {
            unsafe { rb_yield(Qnil.into()) }
        }

        let collector = unsafe { Self::collector_of(rbself) };
        let mut jump_tag: c_int = 0;
        let result = collector.profile(|| unsafe {
            rb_protect(Some(yield_block), Qnil.into(), &mut jump_tag);
        });
        drop(collector);

        if jump_tag != 0 {
            unsafe { rb_jump_tag(jump_tag) }
        }
        match result {
            Ok(result) => unsafe { Self::flush_result_to_profile_data(result) },
            Err(e) => unsafe { raise(rb_eRuntimeError, e.to_string()) },
        }
    }

    unsafe fn flush_result_to_profile_data(result: FlushResult) -> VALUE {
        unsafe {
            let bytes = rb_str_new(
                result.pprof_bytes.as_ptr() as *const c_char,
                result.pprof_bytes.len() as c_long,
            );
            let stats = result.stats;
            let profile_data = rb_class_new_instance(0, null(), rb_path2class(cstr!("MemprofilerPprof::ProfileData")));
            let attributes: [(*const c_char, VALUE); 6] = [
                (cstr!("@pprof_data"), bytes),
                (cstr!("@allocation_samples_count"), rb_uint2inum(stats.allocation_samples_count)),
                (cstr!("@heap_samples_count"), rb_uint2inum(stats.heap_samples_count)),
                (cstr!("@dropped_samples_nolock"), rb_ull2inum(stats.dropped_samples_nolock)),
                (
                    cstr!("@dropped_samples_allocation_bufsize"),
                    rb_ull2inum(stats.dropped_samples_allocation_bufsize),
                ),
                (cstr!("@dropped_samples_heap_bufsize"), rb_ull2inum(stats.dropped_samples_heap_bufsize)),
            ];
            for (name, value) in attributes {
                rb_ivar_set(profile_data, rb_intern(name), value);
            }
            profile_data
        }
    }

    pub unsafe extern "C" fn rb_live_heap_samples_count(rbself: VALUE) -> VALUE {
        let count = unsafe { Self::collector_of(rbself) }.live_heap_samples_count();
        unsafe { rb_uint2inum(count) }
    }

    pub unsafe extern "C" fn rb_get_sample_rate(rbself: VALUE) -> VALUE {
        let rate = unsafe { Self::collector_of(rbself) }.sample_rate();
        unsafe { rb_float_new(rate) }
    }

    pub unsafe extern "C" fn rb_set_sample_rate(rbself: VALUE, value: VALUE) -> VALUE {
        let rate = unsafe { rb_num2dbl(value) };
        let result = unsafe { Self::collector_of(rbself) }.set_sample_rate(rate);
        if let Err(e) = result {
            unsafe { raise(rb_eArgError, e.to_string()) }
        }
        value
    }

    pub unsafe extern "C" fn rb_get_allocation_retain_rate(rbself: VALUE) -> VALUE {
        let rate = unsafe { Self::collector_of(rbself) }.allocation_retain_rate();
        unsafe { rb_float_new(rate) }
    }

    pub unsafe extern "C" fn rb_set_allocation_retain_rate(rbself: VALUE, value: VALUE) -> VALUE {
        let rate = unsafe { rb_num2dbl(value) };
        let result = unsafe { Self::collector_of(rbself) }.set_allocation_retain_rate(rate);
        if let Err(e) = result {
            unsafe { raise(rb_eArgError, e.to_string()) }
        }
        value
    }

    pub unsafe extern "C" fn rb_get_max_allocation_samples(rbself: VALUE) -> VALUE {
        let count = unsafe { Self::collector_of(rbself) }.max_allocation_samples();
        unsafe { rb_uint2inum(count) }
    }

    pub unsafe extern "C" fn rb_set_max_allocation_samples(rbself: VALUE, value: VALUE) -> VALUE {
        let count = unsafe { Self::parse_option_count(value, 0) };
        unsafe { Self::collector_of(rbself) }.set_max_allocation_samples(count);
        value
    }

    pub unsafe extern "C" fn rb_get_max_heap_samples(rbself: VALUE) -> VALUE {
        let count = unsafe { Self::collector_of(rbself) }.max_heap_samples();
        unsafe { rb_uint2inum(count) }
    }

    pub unsafe extern "C" fn rb_set_max_heap_samples(rbself: VALUE, value: VALUE) -> VALUE {
        let count = unsafe { Self::parse_option_count(value, 0) };
        unsafe { Self::collector_of(rbself) }.set_max_heap_samples(count);
        value
    }

    pub unsafe extern "C" fn rb_get_bt_method(rbself: VALUE) -> VALUE {
        let method = unsafe { Self::collector_of(rbself) }.backtrace_method();
        unsafe {
            match method {
                BacktraceMethod::Fast => symbol(cstr!("fast")),
                BacktraceMethod::Slow => symbol(cstr!("slow")),
            }
        }
    }

    pub unsafe extern "C" fn rb_set_bt_method(rbself: VALUE, value: VALUE) -> VALUE {
        let method = unsafe { Self::parse_option_bt_method(value) };
        unsafe { Self::collector_of(rbself) }.set_backtrace_method(method);
        value
    }

    // Extract the CollectorRubyObject struct from a Ruby object
    unsafe fn get_struct_from(obj: VALUE) -> ManuallyDrop<Box<Self>> {
        unsafe {
            let ptr = rb_check_typeddata(obj, addr_of!(RBDATA));
            ManuallyDrop::new(Box::from_raw(ptr as *mut CollectorRubyObject))
        }
    }

    #[allow(non_snake_case)]
    pub unsafe extern "C" fn rb_alloc(_rbself: VALUE) -> VALUE {
        let obj = Box::new(CollectorRubyObject { collector: None });

        unsafe {
            let rb_mMemprofilerPprof: VALUE = rb_define_module(cstr!("MemprofilerPprof"));
            let rb_cCollector = rb_define_class_under(rb_mMemprofilerPprof, cstr!("Collector"), rb_cObject);
            // Wrap the struct into a Ruby object
            rb_data_typed_object_wrap(rb_cCollector, Box::into_raw(obj) as *mut c_void, addr_of!(RBDATA))
        }
    }

    unsafe extern "C" fn dmark(ptr: *mut c_void) {
        let obj = unsafe { ManuallyDrop::new(Box::from_raw(ptr as *mut CollectorRubyObject)) };
        if let Some(collector) = &obj.collector {
            collector.report_strong_references(&mut |handle| unsafe { rb_gc_mark(handle.0 as VALUE) });
        }
    }

    unsafe extern "C" fn dfree(ptr: *mut c_void) {
        let obj = unsafe { Box::from_raw(ptr as *mut CollectorRubyObject) };
        if let Some(collector) = &obj.collector {
            // Tracepoints point at the collector; they must be gone first.
            if let Err(e) = collector.stop() {
                log::error!("failed to stop collector being freed: {}", e);
            }
        }
        drop(obj);
    }

    unsafe extern "C" fn dsize(ptr: *const c_void) -> size_t {
        let obj = unsafe { ManuallyDrop::new(Box::from_raw(ptr as *mut CollectorRubyObject)) };
        let size = match &obj.collector {
            Some(collector) => collector.memsize(),
            None => std::mem::size_of::<CollectorRubyObject>(),
        };
        size as size_t
    }

    unsafe extern "C" fn dcompact(ptr: *mut c_void) {
        let obj = unsafe { ManuallyDrop::new(Box::from_raw(ptr as *mut CollectorRubyObject)) };
        if let Some(collector) = &obj.collector {
            collector.on_handles_relocated(&mut |handle| unsafe {
                ObjectHandle(rb_gc_location(handle.0 as VALUE) as u64)
            });
        }
    }
}

static mut RBDATA: rb_data_type_t = rb_data_type_t {
    wrap_struct_name: cstr!("CollectorRubyObject"),
    function: rb_data_type_struct__bindgen_ty_1 {
        dmark: Some(CollectorRubyObject::dmark),
        dfree: Some(CollectorRubyObject::dfree),
        dsize: Some(CollectorRubyObject::dsize),
        dcompact: Some(CollectorRubyObject::dcompact),
        reserved: [null_mut(); 1],
    },
    parent: null_mut(),
    data: null_mut(),
    flags: 0,
};

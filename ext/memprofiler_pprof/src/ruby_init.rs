#![deny(unsafe_op_in_unsafe_fn)]

use rb_sys::*;

use crate::collector::ruby_object::CollectorRubyObject;
use crate::ruby_host;
use crate::util::*;

#[allow(non_snake_case)]
#[no_mangle]
extern "C" fn Init_memprofiler_pprof() {
    #[cfg(feature = "debug")]
    {
        env_logger::builder()
            .format_timestamp(None)
            .format_module_path(false)
            .init();
    }

    ruby_host::detect_slot_size();

    unsafe {
        let rb_mMemprofilerPprof: VALUE = rb_define_module(cstr!("MemprofilerPprof"));

        let rb_cProfileData = rb_define_class_under(rb_mMemprofilerPprof, cstr!("ProfileData"), rb_cObject);
        for attribute in [
            cstr!("pprof_data"),
            cstr!("allocation_samples_count"),
            cstr!("heap_samples_count"),
            cstr!("dropped_samples_nolock"),
            cstr!("dropped_samples_allocation_bufsize"),
            cstr!("dropped_samples_heap_bufsize"),
        ] {
            rb_define_attr(rb_cProfileData, attribute, 1, 1);
        }

        let rb_cCollector = rb_define_class_under(rb_mMemprofilerPprof, cstr!("Collector"), rb_cObject);
        rb_define_alloc_func(rb_cCollector, Some(CollectorRubyObject::rb_alloc));
        rb_define_method(
            rb_cCollector,
            cstr!("initialize"),
            Some(to_ruby_cfunc_with_args(CollectorRubyObject::rb_initialize)),
            -1,
        );

        let no_args: [(*const std::ffi::c_char, unsafe extern "C" fn(VALUE) -> VALUE); 11] = [
            (cstr!("start!"), CollectorRubyObject::rb_start),
            (cstr!("stop!"), CollectorRubyObject::rb_stop),
            (cstr!("running?"), CollectorRubyObject::rb_is_running),
            (cstr!("flush"), CollectorRubyObject::rb_flush),
            (cstr!("profile"), CollectorRubyObject::rb_profile),
            (cstr!("live_heap_samples_count"), CollectorRubyObject::rb_live_heap_samples_count),
            (cstr!("sample_rate"), CollectorRubyObject::rb_get_sample_rate),
            (cstr!("allocation_retain_rate"), CollectorRubyObject::rb_get_allocation_retain_rate),
            (cstr!("max_allocation_samples"), CollectorRubyObject::rb_get_max_allocation_samples),
            (cstr!("max_heap_samples"), CollectorRubyObject::rb_get_max_heap_samples),
            (cstr!("bt_method"), CollectorRubyObject::rb_get_bt_method),
        ];
        for (name, func) in no_args {
            rb_define_method(rb_cCollector, name, Some(to_ruby_cfunc_with_no_args(func)), 0);
        }

        let setters: [(*const std::ffi::c_char, unsafe extern "C" fn(VALUE, VALUE) -> VALUE); 5] = [
            (cstr!("sample_rate="), CollectorRubyObject::rb_set_sample_rate),
            (cstr!("allocation_retain_rate="), CollectorRubyObject::rb_set_allocation_retain_rate),
            (cstr!("max_allocation_samples="), CollectorRubyObject::rb_set_max_allocation_samples),
            (cstr!("max_heap_samples="), CollectorRubyObject::rb_set_max_heap_samples),
            (cstr!("bt_method="), CollectorRubyObject::rb_set_bt_method),
        ];
        for (name, func) in setters {
            rb_define_method(rb_cCollector, name, Some(to_ruby_cfunc_with_one_arg(func)), 1);
        }
    }
}

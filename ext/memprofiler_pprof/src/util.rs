// Abort the process on unrecoverable state corruption.
// Used from paths that must never fail (free hooks, fork handlers), where
// unwinding into the host runtime is not an option.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        log::error!($($arg)*);
        eprintln!("[memprofiler_pprof FATAL] {}", format_args!($($arg)*));
        std::process::abort()
    }};
}
pub(crate) use fatal;

#[cfg(feature = "ruby")]
pub use self::ruby::*;

#[cfg(feature = "ruby")]
mod ruby {
    use core::mem::transmute;
    use rb_sys::*;

    // Convert str literal to C string literal
    macro_rules! cstr {
        ($s:expr) => {
            concat!($s, "\0").as_ptr() as *const std::ffi::c_char
        };
    }
    pub(crate) use cstr;

    pub type RubyCFunc = unsafe extern "C" fn() -> VALUE;

    pub fn to_ruby_cfunc_with_no_args<T>(f: unsafe extern "C" fn(T) -> VALUE) -> RubyCFunc {
        unsafe { transmute::<unsafe extern "C" fn(T) -> VALUE, RubyCFunc>(f) }
    }
    pub fn to_ruby_cfunc_with_one_arg<T, U>(f: unsafe extern "C" fn(T, U) -> VALUE) -> RubyCFunc {
        unsafe { transmute::<unsafe extern "C" fn(T, U) -> VALUE, RubyCFunc>(f) }
    }
    pub fn to_ruby_cfunc_with_args<T, U, V>(
        f: unsafe extern "C" fn(T, U, V) -> VALUE,
    ) -> RubyCFunc {
        unsafe { transmute::<unsafe extern "C" fn(T, U, V) -> VALUE, RubyCFunc>(f) }
    }

    #[allow(non_snake_case)]
    pub fn RTEST(v: VALUE) -> bool {
        v != Qfalse as VALUE && v != Qnil as VALUE
    }

    extern "C" {
        // ruby_c_api_helper.c
        pub fn mpp_is_value_still_validish(obj: VALUE) -> bool;
        pub fn mpp_obj_memsize_of(obj: VALUE) -> usize;
    }
}

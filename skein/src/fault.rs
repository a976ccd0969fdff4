//! Fatal faults: internal-consistency violations that are never recovered.
//!
//! A fault is logged with its source location, then either unwinds (the
//! default) or aborts the process when the raising transport was configured
//! with `abort_on_throw`. Every fault site passes that setting in, so
//! transports with different configurations in one process keep their own.

#[doc(hidden)]
#[cold]
#[inline(never)]
pub fn raise(
    abort: bool,
    location: &'static str,
    module: &'static str,
    msg: std::fmt::Arguments<'_>,
) -> ! {
    tracing::error!(location, module, abort, "{msg}");
    if abort {
        std::process::abort();
    }
    panic!("{location}: {msg}");
}

/// Log and raise an unrecoverable fault; `$abort` selects abort over unwind.
macro_rules! fatal {
    ($abort:expr, $($arg:tt)*) => {
        $crate::fault::raise(
            $abort,
            concat!(file!(), ":", line!()),
            module_path!(),
            format_args!($($arg)*),
        )
    };
}

/// Raise a fault unless `cond` holds.
macro_rules! ensure_or_fatal {
    ($abort:expr, $cond:expr, $($arg:tt)*) => {
        if !$cond {
            fatal!($abort, $($arg)*);
        }
    };
}

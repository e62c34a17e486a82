use lazy_static::lazy_static;
use std::env;

lazy_static! {
    static ref FLAGS: Flags = init_flags();
}

/// Runtime knobs read once from the environment; everything that
/// changes per invocation belongs on the command line instead.
#[derive(Clone)]
pub struct Flags {
    /// Any internal error reported by the kernel program aborts the
    /// trace instead of being logged as a warning.
    pub fatal_errors_and_warnings: bool,
    /// Ring-buffer poll interval in milliseconds.
    pub poll_timeout_ms: u16,
}

impl Flags {
    pub fn get() -> &'static Flags {
        &*FLAGS
    }
}

fn init_flags() -> Flags {
    Flags {
        fatal_errors_and_warnings: env::var_os("DEPSNOOP_FATAL_ERRORS").is_some(),
        poll_timeout_ms: env::var("DEPSNOOP_POLL_MS")
            .ok()
            .and_then(|ms| ms.parse().ok())
            .unwrap_or(100),
    }
}

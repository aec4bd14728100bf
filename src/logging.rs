//! Optional tracing bootstrap for binaries and tests.
//!
//! The engine itself only emits `tracing` events; embedding applications
//! install whatever subscriber they want. `init()` is a convenience that
//! wires the standard env-filtered formatter (`RUST_LOG` controls levels)
//! and is safe to call more than once.

use tracing_subscriber::{fmt, EnvFilter};

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt().with_env_filter(filter).try_init();
}

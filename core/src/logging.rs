// Tracing bootstrap for binaries and tests
//
// Library code only emits through the `tracing` macros; whoever hosts the
// engine decides where that goes. This initializer is a convenience for
// test harnesses and example binaries.

use tracing_subscriber::{fmt, EnvFilter};

/// Install a fmt subscriber honoring `RUST_LOG`, defaulting to `filter`.
/// Safe to call more than once; later calls are no-ops.
pub fn init(filter: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));
    let _ = fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init("debug");
        init("info");
    }
}

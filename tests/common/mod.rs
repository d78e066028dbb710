//! Common test utilities for integration tests.

use std::sync::Once;

static INIT: Once = Once::new();

/// Initializes logging once per test binary. `RUST_LOG=debug cargo test`
/// shows which rules and fusions fired.
pub fn setup() {
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

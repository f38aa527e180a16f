#![forbid(unsafe_code)]

//! Test logging.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

/// Environment variable holding the filter directive for test output.
pub const LOG_ENV: &str = "SIGHTLINE_LOG";

const DEFAULT_FILTER: &str = "warn";

/// Install a test-writer `fmt` subscriber once per process.
///
/// The filter comes from `SIGHTLINE_LOG` (for example
/// `SIGHTLINE_LOG=sightline_core=trace`) and defaults to `warn`. Losing the
/// race to another global subscriber is not an error.
pub fn init_test_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env(LOG_ENV)
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

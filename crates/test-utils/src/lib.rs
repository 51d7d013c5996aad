//! Shared fixtures for the `dagsched` integration tests: graph and manifest
//! builders, a scripted executor, and tracing/timeout helpers.

pub mod builders;
pub mod fake_executor;

use std::future::Future;
use std::sync::Once;
use std::time::Duration;

use tracing_subscriber::{EnvFilter, fmt};

static INIT: Once = Once::new();

/// How long a scheduler test may wait for tasks to settle.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Route scheduler logs into the test harness output.
///
/// Output shows up only for failing tests. Dispatch and cascade events are
/// logged at debug, e.g. `RUST_LOG=dagsched=debug`.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

        fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .init();
    });
}

/// Await `f`, failing the test if it takes longer than [`TEST_TIMEOUT`].
///
/// A scheduler that never settles (a task stuck `Pending`, a lost wakeup)
/// shows up as this panic instead of a hung test run.
pub async fn with_timeout<F, T>(f: F) -> T
where
    F: Future<Output = T>,
{
    tokio::time::timeout(TEST_TIMEOUT, f)
        .await
        .unwrap_or_else(|_| panic!("scheduler test did not finish within {TEST_TIMEOUT:?}"))
}

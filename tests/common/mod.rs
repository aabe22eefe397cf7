// Shared setup for tests that touch the process-wide pool. Tests in one
// binary run on parallel threads by default, but they all share the one
// pool singleton, so they take a guard that both serializes them and
// resets the allocator in between.

use std::sync::{Mutex, MutexGuard, Once, OnceLock};

use shmq::Pool;

static SETUP: Once = Once::new();

fn lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

/// Serializes the calling test over the pool and hands it a cleared
/// allocator. The first call in the process also drops whatever region a
/// previous test run left behind.
pub fn fresh_pool() -> MutexGuard<'static, ()> {
    SETUP.call_once(|| {
        Pool::unlink();

        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init()
            .ok();
    });

    let guard = lock().lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    Pool::get().clear();
    guard
}

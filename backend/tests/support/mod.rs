//! Environment isolation for tests that go through `LabConfig::from_env`
//! or `RepositoryType::from_env`.

use std::env;
use std::sync::{Mutex, MutexGuard};

/// Every variable the lab reads from the environment.
pub const LAB_VARS: [&str; 12] = [
    "REPOSITORY_TYPE",
    "DATABASE_URL",
    "PG_DATABASE_URL",
    "SCHEMA",
    "START_DATE",
    "END_DATE",
    "PARTITION_GRAIN",
    "DUMMY_INDEXES",
    "LOCK_TIMEOUT_MS",
    "MONITOR_EVERY",
    "KILL_BLOCKERS",
    "TERMINATION_STRATEGY",
];

static ENV_LOCK: Mutex<()> = Mutex::new(());

/// Runs `f` with every lab variable unset except those in `vars`.
///
/// The previous values come back when `f` returns or panics. Tests in one
/// binary share the process environment, so callers are serialized.
pub fn with_lab_env<R>(vars: &[(&str, &str)], f: impl FnOnce() -> R) -> R {
    let _env = LabEnv::isolate(vars);
    f()
}

/// Holds the lock and the values seen before isolation.
struct LabEnv {
    saved: Vec<(&'static str, Option<String>)>,
    _lock: MutexGuard<'static, ()>,
}

impl LabEnv {
    fn isolate(vars: &[(&str, &str)]) -> Self {
        // A test that panicked while holding the lock still restored the env.
        let lock = ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let saved = LAB_VARS
            .iter()
            .map(|key| (*key, env::var(key).ok()))
            .collect();

        for key in LAB_VARS {
            env::remove_var(key);
        }
        for (key, value) in vars {
            assert!(LAB_VARS.iter().any(|v| v == key), "{} is not a lab variable", key);
            env::set_var(key, value);
        }

        Self { saved, _lock: lock }
    }
}

impl Drop for LabEnv {
    fn drop(&mut self) {
        for (key, value) in &self.saved {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }
    }
}

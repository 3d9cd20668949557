//! Process-wide cache event counters and compile timing.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

use log::debug;

static CACHE_EVENTS: OnceLock<Mutex<HashMap<&'static str, u64>>> = OnceLock::new();

fn events() -> &'static Mutex<HashMap<&'static str, u64>> {
    CACHE_EVENTS.get_or_init(|| Mutex::new(HashMap::new()))
}

#[inline]
pub fn cache_event(name: &'static str) {
    // counters are best effort; a poisoned map keeps counting
    let mut guard = events().lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    *guard.entry(name).or_insert(0) += 1;
}

/// Number of times `name` has been recorded in this process.
pub fn cache_event_count(name: &str) -> u64 {
    let guard = events().lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    guard.get(name).copied().unwrap_or(0)
}

/// Logs the elapsed time of a scope when dropped.
#[must_use = "the scope ends when the guard is dropped"]
pub struct ScopeGuard {
    name: &'static str,
    started: Instant,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        debug!(
            "{} took {:.3} ms",
            self.name,
            self.started.elapsed().as_secs_f64() * 1e3
        );
    }
}

#[inline]
pub fn compile_scope(name: &'static str) -> ScopeGuard {
    ScopeGuard {
        name,
        started: Instant::now(),
    }
}

//! Resolve/execute timing and cache event counters.
//!
//! Every entry point compiles to a no-op unless the `profiler` feature is enabled. With it, scope
//! guards record total and self time (total minus nested scopes on the same thread) per
//! `(op kind, implementation)` site, and cache events are counted by name.

use serde::Serialize;

#[cfg_attr(not(feature = "profiler"), allow(dead_code))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Phase {
    Resolve,
    Execute,
    Cache,
}

#[cfg_attr(not(feature = "profiler"), allow(dead_code))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Site {
    phase: Phase,
    op: &'static str,
    implementation: &'static str,
}

impl Site {
    fn new(phase: Phase, op: &'static str, implementation: &'static str) -> Self {
        Self {
            phase,
            op,
            implementation,
        }
    }
}

#[cfg(feature = "profiler")]
mod recorder {
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    use once_cell::sync::Lazy;

    use super::Site;

    #[derive(Debug, Default, Clone, Copy)]
    pub(super) struct Totals {
        pub calls: u64,
        pub self_time: Duration,
        pub total_time: Duration,
    }

    static TOTALS: Lazy<Mutex<HashMap<Site, Totals>>> = Lazy::new(|| Mutex::new(HashMap::new()));

    thread_local! {
        // Time spent in already closed children of each open scope, innermost last.
        static OPEN_SCOPES: RefCell<Vec<Duration>> = const { RefCell::new(Vec::new()) };
    }

    pub(super) fn enter() -> Instant {
        OPEN_SCOPES.with(|open| open.borrow_mut().push(Duration::ZERO));
        Instant::now()
    }

    pub(super) fn leave(site: Site, started: Instant) {
        let total = started.elapsed();
        let children = OPEN_SCOPES.with(|open| {
            let mut open = open.borrow_mut();
            let children = open.pop().unwrap_or_default();
            if let Some(parent) = open.last_mut() {
                *parent += total;
            }
            children
        });
        record(site, total.saturating_sub(children), total);
    }

    pub(super) fn record(site: Site, self_time: Duration, total_time: Duration) {
        let mut totals = TOTALS.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = totals.entry(site).or_default();
        entry.calls = entry.calls.saturating_add(1);
        entry.self_time += self_time;
        entry.total_time += total_time;
    }

    pub(super) fn drain() -> HashMap<Site, Totals> {
        let mut totals = TOTALS.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::take(&mut *totals)
    }
}

/// Records the enclosing scope on drop.
#[must_use = "the scope is measured until the guard is dropped"]
pub struct ScopeGuard {
    #[cfg(feature = "profiler")]
    site: Site,
    #[cfg(feature = "profiler")]
    started: std::time::Instant,
}

impl ScopeGuard {
    #[inline(always)]
    fn open(site: Site) -> Self {
        #[cfg(feature = "profiler")]
        {
            Self {
                site,
                started: recorder::enter(),
            }
        }
        #[cfg(not(feature = "profiler"))]
        {
            let _ = site;
            Self {}
        }
    }
}

#[cfg(feature = "profiler")]
impl Drop for ScopeGuard {
    fn drop(&mut self) {
        recorder::leave(self.site, self.started);
    }
}

#[inline(always)]
pub fn resolve_scope(op: &'static str, implementation: &'static str) -> ScopeGuard {
    ScopeGuard::open(Site::new(Phase::Resolve, op, implementation))
}

#[inline(always)]
pub fn execute_scope(op: &'static str, implementation: &'static str) -> ScopeGuard {
    ScopeGuard::open(Site::new(Phase::Execute, op, implementation))
}

/// Counts one occurrence of the cache event `name`, e.g. `"primitive_cache.hit"`.
#[inline(always)]
pub fn cache_event(name: &'static str) {
    let site = Site::new(Phase::Cache, name, "");
    #[cfg(feature = "profiler")]
    recorder::record(site, std::time::Duration::ZERO, std::time::Duration::ZERO);
    #[cfg(not(feature = "profiler"))]
    let _ = site;
}

/// One aggregated site. Times are in milliseconds; `percent` is the site's share of the table's
/// self time, or of its calls for the untimed cache table.
#[derive(Debug, Clone, Serialize)]
pub struct TableRow {
    pub name: String,
    pub calls: u64,
    pub per_ms: f64,
    pub excl_ms: f64,
    pub incl_ms: f64,
    pub percent: f64,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct ProfilerTables {
    pub resolves: Vec<TableRow>,
    pub executions: Vec<TableRow>,
    pub caches: Vec<TableRow>,
}

#[cfg(feature = "profiler")]
fn rows(sites: Vec<(String, recorder::Totals)>) -> Vec<TableRow> {
    let self_total: f64 = sites.iter().map(|(_, t)| t.self_time.as_secs_f64()).sum();
    let calls_total: f64 = sites.iter().map(|(_, t)| t.calls as f64).sum();
    let mut rows: Vec<TableRow> = sites
        .into_iter()
        .map(|(name, totals)| {
            let excl_ms = totals.self_time.as_secs_f64() * 1e3;
            let share = if self_total > 0.0 {
                totals.self_time.as_secs_f64() / self_total
            } else if calls_total > 0.0 {
                totals.calls as f64 / calls_total
            } else {
                0.0
            };
            TableRow {
                name,
                calls: totals.calls,
                per_ms: excl_ms / totals.calls.max(1) as f64,
                excl_ms,
                incl_ms: totals.total_time.as_secs_f64() * 1e3,
                percent: share * 100.0,
            }
        })
        .collect();
    rows.sort_by(|a, b| b.percent.total_cmp(&a.percent).then_with(|| a.name.cmp(&b.name)));
    rows
}

/// Drains everything recorded so far. `None` when nothing was recorded or the `profiler`
/// feature is off.
pub fn take_tables() -> Option<ProfilerTables> {
    #[cfg(feature = "profiler")]
    {
        let totals = recorder::drain();
        if totals.is_empty() {
            return None;
        }
        let (mut resolves, mut executions, mut caches) = (Vec::new(), Vec::new(), Vec::new());
        for (site, totals) in totals {
            match site.phase {
                Phase::Resolve => resolves.push((format!("{} ({})", site.op, site.implementation), totals)),
                Phase::Execute => executions.push((format!("{} ({})", site.op, site.implementation), totals)),
                Phase::Cache => caches.push((site.op.to_string(), totals)),
            }
        }
        Some(ProfilerTables {
            resolves: rows(resolves),
            executions: rows(executions),
            caches: rows(caches),
        })
    }
    #[cfg(not(feature = "profiler"))]
    {
        None
    }
}

pub fn take_report_json() -> Option<String> {
    serde_json::to_string(&take_tables()?).ok()
}

/// Discards everything recorded so far.
pub fn reset() {
    #[cfg(feature = "profiler")]
    recorder::drain();
}

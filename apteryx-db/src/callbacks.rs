//! Callback entries and the per-kind registries.
//!
//! Entries are shared as `Arc<CbEntry>`: a dispatch that picked an entry up
//! under the registry read lock keeps using it after deregistration, and the
//! entry is freed when the last in-flight reference drops. Each entry keeps
//! invocation statistics and, for refreshers, the coalescing state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};

use crate::config::LocalCb;
use crate::pattern::{LevelHits, PatternSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CbKind {
    Watch,
    WatchTree,
    Validate,
    Refresh,
    Provide,
    Index,
    Proxy,
}

impl CbKind {
    pub const ALL: [CbKind; 7] = [
        CbKind::Watch,
        CbKind::WatchTree,
        CbKind::Validate,
        CbKind::Refresh,
        CbKind::Provide,
        CbKind::Index,
        CbKind::Proxy,
    ];

    /// The segment this kind registers under in the configuration subtree.
    pub fn config_segment(self) -> &'static str {
        match self {
            CbKind::Watch => "watchers",
            CbKind::WatchTree => "tree-watchers",
            CbKind::Validate => "validators",
            CbKind::Refresh => "refreshers",
            CbKind::Provide => "providers",
            CbKind::Index => "indexers",
            CbKind::Proxy => "proxies",
        }
    }

    fn table_index(self) -> usize {
        match self {
            CbKind::Watch => 0,
            CbKind::WatchTree => 1,
            CbKind::Validate => 2,
            CbKind::Refresh => 3,
            CbKind::Provide => 4,
            CbKind::Index => 5,
            CbKind::Proxy => 6,
        }
    }
}

/// Invocation latency statistics, all in microseconds.
#[derive(Default)]
pub struct CbStats {
    count: AtomicU64,
    total: AtomicU64,
    min: AtomicU64,
    max: AtomicU64,
}

impl CbStats {
    pub fn record(&self, us: u64) {
        if self.count.fetch_add(1, Ordering::Relaxed) == 0 {
            self.min.store(us, Ordering::Relaxed);
        } else {
            self.min.fetch_min(us, Ordering::Relaxed);
        }
        self.total.fetch_add(us, Ordering::Relaxed);
        self.max.fetch_max(us, Ordering::Relaxed);
    }

    /// `(count, min, avg, max)`.
    pub fn snapshot(&self) -> (u64, u64, u64, u64) {
        let count = self.count.load(Ordering::Relaxed);
        let total = self.total.load(Ordering::Relaxed);
        let avg = if count > 0 { total / count } else { 0 };
        (
            count,
            self.min.load(Ordering::Relaxed),
            avg,
            self.max.load(Ordering::Relaxed),
        )
    }
}

/// Refresher coalescing state, guarded by the entry's mutex.
#[derive(Default)]
pub struct RefreshState {
    /// Completion time of the last successful refresh, 0 if never run.
    pub last_us: u64,
    /// Validity interval the refresher returned.
    pub validity_us: u64,
    /// An invocation is in flight; waiters sleep on the condvar.
    pub busy: bool,
}

pub enum CbTarget {
    /// A handler inside a client process, reached over its callback socket.
    Remote { pid: u32, cb_ref: u64 },
    /// An engine-internal handler (configuration subtree, counters, ...).
    Local(LocalCb),
}

pub struct CbEntry {
    pub kind: CbKind,
    pub guid: String,
    pub pattern: String,
    pub target: CbTarget,
    /// Proxies only: the remote endpoint.
    pub uri: Option<String>,
    pub stats: CbStats,
    active: AtomicBool,
    pub(crate) refresh: Mutex<RefreshState>,
    pub(crate) refresh_done: Condvar,
}

impl CbEntry {
    pub fn new(
        kind: CbKind,
        guid: impl Into<String>,
        pattern: impl Into<String>,
        target: CbTarget,
        uri: Option<String>,
    ) -> Arc<Self> {
        Arc::new(CbEntry {
            kind,
            guid: guid.into(),
            pattern: pattern.into(),
            target,
            uri,
            stats: CbStats::default(),
            active: AtomicBool::new(true),
            refresh: Mutex::new(RefreshState::default()),
            refresh_done: Condvar::new(),
        })
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    /// Taken out of service; dispatch skips it, removal happens on the next
    /// registration churn for the kind.
    pub fn disable(&self) {
        self.active.store(false, Ordering::Relaxed);
    }
}

pub struct Registry {
    tables: [RwLock<PatternSet<Arc<CbEntry>>>; 7],
    by_guid: RwLock<HashMap<String, Arc<CbEntry>>>,
}

impl Default for Registry {
    fn default() -> Self {
        Registry {
            tables: std::array::from_fn(|_| RwLock::new(PatternSet::new())),
            by_guid: RwLock::new(HashMap::new()),
        }
    }
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    fn table(&self, kind: CbKind) -> &RwLock<PatternSet<Arc<CbEntry>>> {
        &self.tables[kind.table_index()]
    }

    /// Create (or replace) the entry named `guid`. Returns the new entry.
    pub fn register(
        &self,
        kind: CbKind,
        guid: &str,
        pattern: &str,
        target: CbTarget,
        uri: Option<String>,
    ) -> Arc<CbEntry> {
        if let Some(old) = self.deregister(guid) {
            log::debug!("callback {guid} already exists, replacing {}", old.pattern);
        }
        let entry = CbEntry::new(kind, guid, pattern, target, uri);
        {
            let mut table = self.table(kind).write().unwrap();
            table.insert(pattern, entry.clone());
            // Registration churn is where dead clients' entries get reaped.
            self.purge_inactive(kind, &mut table);
        }
        self.by_guid
            .write()
            .unwrap()
            .insert(guid.to_string(), entry.clone());
        entry
    }

    /// Remove and disable the entry named `guid`, if any. In-flight
    /// dispatches holding the Arc are unaffected.
    pub fn deregister(&self, guid: &str) -> Option<Arc<CbEntry>> {
        let entry = self.by_guid.write().unwrap().remove(guid)?;
        entry.disable();
        self.table(entry.kind)
            .write()
            .unwrap()
            .remove(&entry.pattern, |e| Arc::ptr_eq(e, &entry));
        Some(entry)
    }

    pub fn find(&self, guid: &str) -> Option<Arc<CbEntry>> {
        self.by_guid.read().unwrap().get(guid).cloned()
    }

    /// Active entries whose pattern covers `path`, most specific first.
    pub fn matching(&self, kind: CbKind, path: &str) -> Vec<Arc<CbEntry>> {
        let mut entries = self.table(kind).read().unwrap().matching(path);
        entries.retain(|e| e.is_active());
        entries
    }

    /// Active entries whose pattern covers `path` or an ancestor of it.
    pub fn covering(&self, kind: CbKind, path: &str) -> Vec<Arc<CbEntry>> {
        let mut entries = self.table(kind).read().unwrap().covering(path);
        entries.retain(|e| e.is_active());
        entries
    }

    /// Level hits for a search below `base`.
    pub fn level(&self, kind: CbKind, base: &str) -> LevelHits<Arc<CbEntry>> {
        let mut hits = self.table(kind).read().unwrap().level(base);
        hits.enumerators.retain(|e| e.is_active());
        hits
    }

    /// Could any active entry of `kind` apply at or below `path`?
    pub fn intersects(&self, kind: CbKind, path: &str) -> bool {
        self.table(kind).read().unwrap().intersects(path)
    }

    /// All active entries of one kind, for the statistics walk.
    pub fn for_each<F: FnMut(&Arc<CbEntry>)>(&self, kind: CbKind, mut f: F) {
        for entry in self.by_guid.read().unwrap().values() {
            if entry.kind == kind && entry.is_active() {
                f(entry);
            }
        }
    }

    fn purge_inactive(&self, kind: CbKind, table: &mut PatternSet<Arc<CbEntry>>) {
        let mut dead: Vec<Arc<CbEntry>> = Vec::new();
        self.by_guid.read().unwrap().values().for_each(|e| {
            if e.kind == kind && !e.is_active() {
                dead.push(e.clone());
            }
        });
        if dead.is_empty() {
            return;
        }
        let mut by_guid = self.by_guid.write().unwrap();
        for entry in dead {
            table.remove(&entry.pattern, |e| Arc::ptr_eq(e, &entry));
            by_guid.remove(&entry.guid);
        }
    }
}

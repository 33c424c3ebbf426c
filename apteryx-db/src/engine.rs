//! The engine: tree store, registries, clock and counters behind one
//! explicit object.
//!
//! Operations are synchronous and run on whatever thread calls them (the
//! daemon hands them to its worker pool). The store and each registry table
//! are behind reader/writer locks; no lock is ever held across an outbound
//! callback invocation, so callbacks are free to re-enter the engine.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use apteryx_common::error::AptError;
use apteryx_common::wire::{
    GetRequest, PruneRequest, SearchRequest, SetRequest, TimestampRequest, TraverseRequest,
    TreeMsg, WatchRequest, WatchTreeRequest, request, response,
};
use apteryx_common::path;
use bytes::Bytes;
use crossbeam::channel::{Sender, unbounded};

use crate::callbacks::{CbKind, CbTarget, Registry};
use crate::clock::Clock;
use crate::config;
use crate::counters::Counters;
use crate::db::Db;
use crate::dispatch::{Rpc, SocketManager, WatchJob, deliver_watch};

pub struct Engine {
    pub(crate) db: RwLock<Db>,
    pub(crate) registry: Registry,
    pub(crate) clock: Clock,
    pub counters: Counters,
    pub(crate) rpc: Arc<dyn Rpc>,
    pub(crate) rpc_id: AtomicU64,
    watch_tx: Sender<WatchJob>,
    pub(crate) sockets: RwLock<Option<Box<dyn SocketManager>>>,
    pub(crate) debug: AtomicBool,
}

impl Engine {
    pub fn new(rpc: Arc<dyn Rpc>) -> Engine {
        let (watch_tx, watch_rx) = unbounded::<WatchJob>();

        // One delivery thread serialises asynchronous watcher invocations,
        // which is what gives per-client commit-order delivery.
        let delivery_rpc = rpc.clone();
        std::thread::Builder::new()
            .name("apteryx-watch".into())
            .spawn(move || {
                let mut id = 0u64;
                for job in watch_rx.iter() {
                    deliver_watch(delivery_rpc.as_ref(), id, &job);
                    id += 1;
                }
            })
            .expect("spawning the watcher delivery thread");

        let engine = Engine {
            db: RwLock::new(Db::new()),
            registry: Registry::new(),
            clock: Clock::new(),
            counters: Counters::new(),
            rpc,
            rpc_id: AtomicU64::new(1),
            watch_tx,
            sockets: RwLock::new(None),
            debug: AtomicBool::new(false),
        };
        config::register_internal(&engine);
        engine
    }

    /// Install the daemon's socket binder; until then writes to
    /// `/apteryx/sockets/` are accepted but ignored.
    pub fn set_socket_manager(&self, manager: Box<dyn SocketManager>) {
        *self.sockets.write().unwrap() = Some(manager);
    }

    pub(crate) fn debug_enabled(&self) -> bool {
        self.debug.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // Write pipeline
    // ------------------------------------------------------------------

    /// Single-leaf write: set (value), delete (no value), optionally
    /// compare-and-swap (`expect_ts`) and/or synchronous watcher delivery
    /// (`wait`).
    pub fn set(
        &self,
        target: &str,
        value: Option<Bytes>,
        expect_ts: Option<u64>,
        wait: bool,
    ) -> Result<(), AptError> {
        Counters::bump(&self.counters.set);
        if let Err(e) = path::validate_key(target) {
            Counters::bump(&self.counters.set_invalid);
            return Err(e);
        }
        if self.debug_enabled() {
            log::debug!("SET {target} = {:?}", value.as_ref().map(|v| v.len()));
        }

        if let Some(hit) = self.find_proxy(target) {
            let action = request::Action::Set(SetRequest {
                path: hit.remote_path.clone(),
                value,
                expect_ts,
                wait,
            });
            let resp = self.proxy_call(&hit, action)?;
            return match AptError::from_code(resp.status) {
                None => Ok(()),
                Some(err) => Err(err),
            };
        }

        let leaves = [(target.to_string(), value)];
        self.call_validators(&leaves)?;

        let ts = self.clock.now_us();
        {
            let mut db = self.db.write().unwrap();
            if let Some(expected) = expect_ts
                && db.timestamp(target) != expected
            {
                return Err(AptError::Busy);
            }
            match &leaves[0].1 {
                Some(v) => db.add(target, v.clone(), ts),
                None => {
                    db.delete(target, ts);
                }
            }
        }

        let snapshot = TreeMsg {
            name: target.to_string(),
            value: leaves[0].1.clone(),
            children: Vec::new(),
        };
        self.fanout_watchers(&leaves, snapshot, wait);
        Ok(())
    }

    /// Atomic multi-leaf write. Validators run in lexicographic leaf order;
    /// if any refuses nothing is applied; all leaves commit under a single
    /// timestamp.
    pub fn set_tree(
        &self,
        root: &TreeMsg,
        expect_ts: Option<u64>,
        wait: bool,
    ) -> Result<(), AptError> {
        Counters::bump(&self.counters.set);
        let mut leaves: Vec<(String, Option<Bytes>)> = Vec::new();
        root.for_each_leaf(&mut |leaf, value| {
            leaves.push((leaf.to_string(), Some(value.clone())));
        });
        if leaves.is_empty() {
            return Ok(());
        }
        for (leaf, _) in &leaves {
            if let Err(e) = path::validate_key(leaf) {
                Counters::bump(&self.counters.set_invalid);
                return Err(e);
            }
        }
        leaves.sort_by(|a, b| a.0.cmp(&b.0));

        self.call_validators(&leaves)?;

        let ts = self.clock.now_us();
        {
            let mut db = self.db.write().unwrap();
            if let Some(expected) = expect_ts {
                let aggregate = leaves
                    .iter()
                    .map(|(leaf, _)| db.timestamp(leaf))
                    .max()
                    .unwrap_or(0);
                if aggregate != expected {
                    return Err(AptError::Busy);
                }
            }
            for (leaf, value) in &leaves {
                if let Some(v) = value {
                    db.add(leaf, v.clone(), ts);
                }
            }
        }

        self.fanout_watchers(&leaves, root.clone(), wait);
        Ok(())
    }

    /// Recursive delete. No validators; watchers fire with absent for every
    /// leaf that held a value.
    pub fn prune(&self, target: &str) -> Result<(), AptError> {
        Counters::bump(&self.counters.prune);
        path::validate_subtree(target)?;

        if let Some(hit) = self.find_proxy(target) {
            let action = request::Action::Prune(PruneRequest {
                path: hit.remote_path.clone(),
            });
            let resp = self.proxy_call(&hit, action)?;
            return match AptError::from_code(resp.status) {
                None => Ok(()),
                Some(err) => Err(err),
            };
        }

        let ts = self.clock.now_us();
        let removed = self.db.write().unwrap().prune(target, ts);
        if removed.is_empty() {
            return Ok(());
        }

        let changes: Vec<(String, Option<Bytes>)> =
            removed.iter().map(|leaf| (leaf.clone(), None)).collect();
        let snapshot = deleted_tree(target, &removed);
        self.fanout_watchers(&changes, snapshot, false);
        Ok(())
    }

    /// Watcher fan-out after a commit. Per-leaf watchers go out in leaf
    /// order; tree watchers matching any affected leaf or an ancestor of one
    /// receive the whole snapshot exactly once.
    fn fanout_watchers(
        &self,
        changes: &[(String, Option<Bytes>)],
        snapshot: TreeMsg,
        wait: bool,
    ) {
        for (leaf, value) in changes {
            for entry in self.registry.matching(CbKind::Watch, leaf) {
                Counters::bump(&self.counters.watched);
                match &entry.target {
                    CbTarget::Local(cb) => {
                        config::run_local_watch(self, *cb, leaf, value.as_ref());
                    }
                    CbTarget::Remote { cb_ref, .. } => {
                        let action = request::Action::Watch(WatchRequest {
                            r#ref: *cb_ref,
                            path: leaf.clone(),
                            value: value.clone(),
                        });
                        self.send_watch(WatchJob { entry, action }, wait);
                    }
                }
            }
        }

        let mut notified: HashSet<String> = HashSet::new();
        for (leaf, _) in changes {
            for entry in self.registry.covering(CbKind::WatchTree, leaf) {
                let CbTarget::Remote { cb_ref, .. } = &entry.target else {
                    continue;
                };
                let cb_ref = *cb_ref;
                if !notified.insert(entry.guid.clone()) {
                    continue;
                }
                Counters::bump(&self.counters.watched);
                let action = request::Action::WatchTree(WatchTreeRequest {
                    r#ref: cb_ref,
                    root: Some(snapshot.clone()),
                });
                self.send_watch(WatchJob { entry, action }, wait);
            }
        }
    }

    fn send_watch(&self, job: WatchJob, wait: bool) {
        if wait {
            deliver_watch(self.rpc.as_ref(), self.next_rpc_id(), &job);
        } else if self.watch_tx.send(job).is_err() {
            log::error!("watcher delivery thread is gone");
        }
    }

    // ------------------------------------------------------------------
    // Read pipeline
    // ------------------------------------------------------------------

    pub fn get(&self, target: &str) -> Result<Option<Bytes>, AptError> {
        Counters::bump(&self.counters.get);
        if let Err(e) = path::validate_key(target) {
            Counters::bump(&self.counters.get_invalid);
            return Err(e);
        }

        if let Some(hit) = self.find_proxy(target) {
            let action = request::Action::Get(GetRequest {
                path: hit.remote_path.clone(),
            });
            if let Ok(resp) = self.proxy_call(&hit, action)
                && resp.status == 0
                && let Some(response::Body::Value(value)) = resp.body
            {
                return Ok(Some(value));
            }
            // Remote absent or unreachable: fall through to the local store
            // with the original path.
        }

        self.refresh_path(target);
        Ok(self.resolve(target))
    }

    /// Stored value, else provider value, else absent. No refresh: callers
    /// sequence that themselves.
    pub(crate) fn resolve(&self, target: &str) -> Option<Bytes> {
        if let Some(value) = self.db.read().unwrap().get(target) {
            return Some(value.clone());
        }
        self.call_providers(target)
    }

    pub fn search(&self, search_path: &str) -> Result<Vec<String>, AptError> {
        Counters::bump(&self.counters.search);
        if let Err(e) = path::validate_search(search_path) {
            Counters::bump(&self.counters.search_invalid);
            return Err(e);
        }

        if let Some(hit) = self.find_proxy(search_path) {
            let action = request::Action::Search(SearchRequest {
                path: hit.remote_path.clone(),
            });
            if let Ok(resp) = self.proxy_call(&hit, action)
                && resp.status == 0
            {
                let mut paths = match resp.body {
                    Some(response::Body::Paths(list)) => list.paths,
                    _ => Vec::new(),
                };
                for remote in &mut paths {
                    *remote = format!("{}{}", hit.prefix, remote);
                }
                return Ok(paths);
            }
        }

        let base = path::search_base(search_path);
        Ok(self.children_of(base))
    }

    /// Children of `base` as full paths: stored children, indexed children
    /// and literal provider continuations, refreshed, sorted, deduplicated.
    pub(crate) fn children_of(&self, base: &str) -> Vec<String> {
        let search_path = if base == "/" {
            "/".to_string()
        } else {
            format!("{base}/")
        };
        self.refresh_level(&search_path, base);

        let mut out = self.db.read().unwrap().search(base);
        for indexed in self.call_indexers(&search_path, base) {
            // Indexers return full child paths; ignore anything outside the
            // level being enumerated.
            if let Some(rest) = indexed.strip_prefix(&search_path)
                && !rest.is_empty()
                && !rest.contains('/')
            {
                out.push(indexed);
            }
        }
        for segment in self.registry.level(CbKind::Provide, base).children {
            out.push(path::join(base, &segment));
        }
        out.sort();
        out.dedup();
        out
    }

    /// Materialise the subtree at `target`, providers and indexers included.
    /// `None` when neither the store nor any callback has anything there.
    pub fn traverse(&self, target: &str) -> Result<Option<TreeMsg>, AptError> {
        Counters::bump(&self.counters.traverse);
        path::validate_subtree(target)?;

        if let Some(hit) = self.find_proxy(target) {
            let action = request::Action::Traverse(TraverseRequest {
                path: hit.remote_path.clone(),
            });
            if let Ok(resp) = self.proxy_call(&hit, action)
                && resp.status == 0
            {
                return Ok(match resp.body {
                    Some(response::Body::Tree(mut tree)) => {
                        tree.name = target.to_string();
                        Some(tree)
                    }
                    _ => None,
                });
            }
        }

        // With no callback able to contribute inside this subtree the walk
        // is a plain store snapshot.
        let synthetic = self.registry.intersects(CbKind::Refresh, target)
            || self.registry.intersects(CbKind::Provide, target)
            || self.registry.intersects(CbKind::Index, target);
        if !synthetic {
            return Ok(self.db.read().unwrap().traverse(target));
        }

        Ok(self.assemble(target))
    }

    fn assemble(&self, at: &str) -> Option<TreeMsg> {
        self.refresh_path(at);
        let value = self.resolve(at);
        let children: Vec<TreeMsg> = self
            .children_of(at)
            .into_iter()
            .filter_map(|full| {
                let segment = full.rsplit('/').next().unwrap_or_default().to_string();
                self.assemble(&full).map(|mut node| {
                    node.name = segment;
                    node
                })
            })
            .collect();
        if value.is_none() && children.is_empty() {
            return None;
        }
        Some(TreeMsg {
            name: at.to_string(),
            value,
            children,
        })
    }

    /// Maximum timestamp over the subtree at `target`, 0 if absent.
    pub fn timestamp(&self, target: &str) -> Result<u64, AptError> {
        Counters::bump(&self.counters.timestamp);
        path::validate_subtree(target)?;

        if let Some(hit) = self.find_proxy(target) {
            let action = request::Action::Timestamp(TimestampRequest {
                path: hit.remote_path.clone(),
            });
            if let Ok(resp) = self.proxy_call(&hit, action)
                && resp.status == 0
                && let Some(response::Body::Timestamp(ts)) = resp.body
            {
                return Ok(ts);
            }
        }

        Ok(self.db.read().unwrap().timestamp(target))
    }

    /// Approximate byte cost of the subtree at `target`.
    pub fn memuse(&self, target: &str) -> Result<u64, AptError> {
        Counters::bump(&self.counters.memuse);
        path::validate_subtree(target)?;
        Ok(self.db.read().unwrap().memuse(target))
    }
}

/// Build the snapshot delivered to tree watchers for a prune: the removed
/// leaves, valueless.
fn deleted_tree(root: &str, removed: &[String]) -> TreeMsg {
    let mut tree = TreeMsg {
        name: root.to_string(),
        value: None,
        children: Vec::new(),
    };
    for leaf in removed {
        let rest = if root == "/" {
            leaf.as_str()
        } else {
            leaf.strip_prefix(root).unwrap_or(leaf)
        };
        let mut node = &mut tree;
        for segment in path::split(rest) {
            let pos = match node.children.iter().position(|c| c.name == segment) {
                Some(pos) => pos,
                None => {
                    node.children.push(TreeMsg {
                        name: segment.to_string(),
                        value: None,
                        children: Vec::new(),
                    });
                    node.children.len() - 1
                }
            };
            node = &mut node.children[pos];
        }
    }
    tree
}

//! Callback dispatch.
//!
//! Entries are gathered under the registry read lock and invoked after it is
//! released; the tree write lock is never held across an outbound call.
//! Remote invocations go through the [`Rpc`] trait so the engine stays
//! socket-free (the daemon plugs in a blocking implementation, tests plug in
//! a mock).

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use apteryx_common::error::AptError;
use apteryx_common::wire::{
    IndexRequest, ProvideRequest, RefreshRequest, Request, Response, ValidateRequest, request,
    response,
};
use apteryx_common::{path, uri};
use bytes::Bytes;

use crate::callbacks::{CbEntry, CbKind, CbTarget};
use crate::config;
use crate::counters::Counters;
use crate::engine::Engine;

/// Bound on any single outbound call, connect included.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(1);

/// Outbound unicast RPC. Implementations must bound the whole exchange by
/// [`RPC_TIMEOUT`], mapping an expired deadline to [`AptError::Timeout`] and
/// a dead peer to [`AptError::Connection`].
pub trait Rpc: Send + Sync {
    fn call(&self, uri: &str, request: Request) -> Result<Response, AptError>;
}

/// Runtime socket bindings, driven by writes to `/apteryx/sockets/`.
pub trait SocketManager: Send + Sync {
    fn bind(&self, guid: &str, uri: &str) -> bool;
    fn release(&self, guid: &str) -> bool;
}

/// One queued watcher invocation.
pub(crate) struct WatchJob {
    pub entry: Arc<CbEntry>,
    pub action: request::Action,
}

/// Deliver one watcher invocation. Failures never propagate: watchers are
/// notifications, not part of the write's success contract. A dead transport
/// disables the entry for lazy cleanup; a slow client is merely abandoned.
pub(crate) fn deliver_watch(rpc: &dyn Rpc, id: u64, job: &WatchJob) {
    let CbTarget::Remote { pid, .. } = &job.entry.target else {
        return;
    };
    let target = uri::client_uri(*pid);
    let started = Instant::now();
    let result = rpc.call(
        &target,
        Request {
            id,
            action: Some(job.action.clone()),
        },
    );
    job.entry.stats.record(started.elapsed().as_micros() as u64);
    match result {
        Ok(_) => {}
        Err(AptError::Connection(e)) => {
            log::warn!("watcher {} unreachable ({e}), disabling", job.entry.guid);
            job.entry.disable();
        }
        Err(e) => log::warn!("watcher {} failed: {e}", job.entry.guid),
    }
}

/// Where a request path crossed into proxied territory.
pub(crate) struct ProxyHit {
    pub entry: Arc<CbEntry>,
    /// The local prefix that was consumed.
    pub prefix: String,
    /// The path as the remote instance sees it.
    pub remote_path: String,
}

/// The pattern's literal lead-in: everything before the first wildcard.
fn proxy_prefix(pattern: &str) -> String {
    let mut prefix = String::new();
    for segment in path::split(pattern) {
        if path::is_wildcard(segment) {
            break;
        }
        prefix.push('/');
        prefix.push_str(segment);
    }
    prefix
}

impl Engine {
    pub(crate) fn next_rpc_id(&self) -> u64 {
        self.rpc_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Invoke one remote callback entry, recording latency and disabling the
    /// entry when its client is gone.
    pub(crate) fn invoke_remote(
        &self,
        entry: &Arc<CbEntry>,
        action: request::Action,
    ) -> Result<Response, AptError> {
        let CbTarget::Remote { pid, .. } = &entry.target else {
            return Err(AptError::Invalid);
        };
        let target = uri::client_uri(*pid);
        let started = Instant::now();
        let result = self.rpc.call(
            &target,
            Request {
                id: self.next_rpc_id(),
                action: Some(action),
            },
        );
        entry.stats.record(started.elapsed().as_micros() as u64);
        if let Err(AptError::Connection(e)) = &result {
            log::warn!("callback {} unreachable ({e}), disabling", entry.guid);
            entry.disable();
        }
        result
    }

    /// Consult validators for every affected leaf, in the caller's (already
    /// lexicographic) leaf order, most specific pattern first per leaf. The
    /// first refusal or timeout aborts the whole write.
    pub(crate) fn call_validators(
        &self,
        leaves: &[(String, Option<Bytes>)],
    ) -> Result<(), AptError> {
        for (leaf, value) in leaves {
            for entry in self.registry.matching(CbKind::Validate, leaf) {
                let CbTarget::Remote { cb_ref, .. } = &entry.target else {
                    continue;
                };
                Counters::bump(&self.counters.validated);
                let action = request::Action::Validate(ValidateRequest {
                    r#ref: *cb_ref,
                    path: leaf.clone(),
                    value: value.clone(),
                });
                match self.invoke_remote(&entry, action) {
                    Ok(resp) => {
                        if let Some(err) = AptError::from_code(resp.status) {
                            return Err(err);
                        }
                    }
                    // A validator that cannot answer blocks the write.
                    Err(AptError::Connection(_)) | Err(AptError::Timeout) => {
                        return Err(AptError::Timeout);
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    /// First provider (most specific first) that produces a value wins.
    pub(crate) fn call_providers(&self, target: &str) -> Option<Bytes> {
        for entry in self.registry.matching(CbKind::Provide, target) {
            Counters::bump(&self.counters.provided);
            match &entry.target {
                CbTarget::Local(cb) => {
                    if let Some(value) = config::run_local_provide(self, *cb, target) {
                        return Some(value);
                    }
                }
                CbTarget::Remote { cb_ref, .. } => {
                    let action = request::Action::Provide(ProvideRequest {
                        r#ref: *cb_ref,
                        path: target.to_string(),
                    });
                    if let Ok(resp) = self.invoke_remote(&entry, action)
                        && resp.status == 0
                        && let Some(response::Body::Value(value)) = resp.body
                    {
                        return Some(value);
                    }
                }
            }
        }
        None
    }

    /// Indexers that could enumerate the children of `base`; the first one
    /// returning a non-empty set wins. `search_path` is the slash-terminated
    /// form handed to the callback.
    pub(crate) fn call_indexers(&self, search_path: &str, base: &str) -> Vec<String> {
        let mut entries = self.registry.level(CbKind::Index, base).enumerators;
        for deeper in self.registry.matching(CbKind::Index, base) {
            if !entries.iter().any(|e| Arc::ptr_eq(e, &deeper)) {
                entries.push(deeper);
            }
        }
        for entry in entries {
            Counters::bump(&self.counters.indexed);
            match &entry.target {
                CbTarget::Local(cb) => {
                    let paths = config::run_local_index(self, *cb, search_path);
                    if !paths.is_empty() {
                        return paths;
                    }
                }
                CbTarget::Remote { cb_ref, .. } => {
                    let action = request::Action::Index(IndexRequest {
                        r#ref: *cb_ref,
                        path: search_path.to_string(),
                    });
                    if let Ok(resp) = self.invoke_remote(&entry, action)
                        && resp.status == 0
                        && let Some(response::Body::Paths(list)) = resp.body
                        && !list.paths.is_empty()
                    {
                        return list.paths;
                    }
                }
            }
        }
        Vec::new()
    }

    /// Run the refreshers matching a concrete read path.
    pub(crate) fn refresh_path(&self, target: &str) {
        for entry in self.registry.matching(CbKind::Refresh, target) {
            self.run_refresher(&entry, target);
        }
    }

    /// Run the refreshers that could populate the children of `base`.
    pub(crate) fn refresh_level(&self, search_path: &str, base: &str) {
        let mut entries = self.registry.level(CbKind::Refresh, base).enumerators;
        for deeper in self.registry.matching(CbKind::Refresh, base) {
            if !entries.iter().any(|e| Arc::ptr_eq(e, &deeper)) {
                entries.push(deeper);
            }
        }
        for entry in entries {
            self.run_refresher(&entry, search_path);
        }
    }

    /// Invoke one refresher unless its last result is still valid.
    /// Concurrent readers coalesce: one invocation runs, the rest wait for
    /// its completion and proceed with the refreshed state.
    fn run_refresher(&self, entry: &Arc<CbEntry>, target: &str) {
        let mut state = entry.refresh.lock().unwrap();
        loop {
            if state.busy {
                state = entry.refresh_done.wait(state).unwrap();
                continue;
            }
            let now = self.clock.now_us();
            if state.last_us != 0 && now < state.last_us.saturating_add(state.validity_us) {
                return;
            }
            break;
        }
        state.busy = true;
        drop(state);

        Counters::bump(&self.counters.refreshed);
        let validity = match &entry.target {
            CbTarget::Local(cb) => Some(config::run_local_refresh(self, *cb, target)),
            CbTarget::Remote { cb_ref, .. } => {
                let action = request::Action::Refresh(RefreshRequest {
                    r#ref: *cb_ref,
                    path: target.to_string(),
                });
                match self.invoke_remote(entry, action) {
                    Ok(resp) if resp.status == 0 => Some(match resp.body {
                        Some(response::Body::Validity(us)) => us,
                        _ => 0,
                    }),
                    _ => None,
                }
            }
        };

        let mut state = entry.refresh.lock().unwrap();
        state.busy = false;
        if let Some(validity_us) = validity {
            state.validity_us = validity_us;
            state.last_us = self.clock.now_us();
        }
        entry.refresh_done.notify_all();
    }

    /// Find the proxy responsible for `target`, if any. The configuration
    /// subtree is never proxied. Longest prefix wins when proxies nest.
    pub(crate) fn find_proxy(&self, target: &str) -> Option<ProxyHit> {
        if target.starts_with(config::ROOT) {
            return None;
        }
        let mut best: Option<ProxyHit> = None;
        self.registry.for_each(CbKind::Proxy, |entry| {
            let prefix = proxy_prefix(&entry.pattern);
            if prefix.is_empty() {
                return;
            }
            if let Some(rest) = target.strip_prefix(&prefix)
                && rest.starts_with('/')
                && best.as_ref().is_none_or(|b| prefix.len() > b.prefix.len())
            {
                best = Some(ProxyHit {
                    entry: entry.clone(),
                    prefix: prefix.clone(),
                    remote_path: rest.to_string(),
                });
            }
        });
        best
    }

    /// Forward one request to the proxied instance.
    pub(crate) fn proxy_call(
        &self,
        hit: &ProxyHit,
        action: request::Action,
    ) -> Result<Response, AptError> {
        let Some(remote) = hit.entry.uri.as_deref() else {
            return Err(AptError::Invalid);
        };
        Counters::bump(&self.counters.proxied);
        let started = Instant::now();
        let result = self.rpc.call(
            remote,
            Request {
                id: self.next_rpc_id(),
                action: Some(action),
            },
        );
        hit.entry
            .stats
            .record(started.elapsed().as_micros() as u64);
        result
    }
}

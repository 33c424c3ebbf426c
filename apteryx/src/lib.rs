//! # Apteryx client
//!
//! Async client for the Apteryx datastore: hierarchical shared state
//! addressed by filesystem-like paths, with reactive callbacks delivered
//! back into this process.
//!
//! ## Features
//!
//! - **Async/await** - request API built on tokio, UNIX or TCP transport
//! - **Flexible inputs** - keys as `&str`/`String`, values as anything
//!   `Into<Bytes>`
//! - **Reactive** - watch, validate, refresh, provide and index callbacks
//!   registered from closures
//! - **Typed helpers** - `get_int`/`set_int`, `get_string`, JSON via serde
//! - **Trees** - atomic `set_tree`, `get_tree` snapshots, template `query`
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use apteryx::Apteryx;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), apteryx::AptError> {
//!     let client = Apteryx::connect("unix:///tmp/apteryx").await?;
//!
//!     client.set("/interfaces/eth0/state", "up").await?;
//!     let state = client.get_string("/interfaces/eth0/state").await?;
//!     assert_eq!(state.as_deref(), Some("up"));
//!
//!     // React to writes made by anyone.
//!     client.watch("/interfaces/*/state", |path, value| {
//!         println!("{path} changed to {value:?}");
//!     }).await?;
//!
//!     client.clear("/interfaces/eth0/state").await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Callback delivery
//!
//! By default callbacks run on one dedicated thread, serialised in the
//! order the daemon committed the writes. Single-threaded applications can
//! use [`Apteryx::connect_manual`] instead and drain invocations
//! themselves: poll [`Apteryx::callback_fd`] for readability and call
//! [`Apteryx::process_one`] for each queued invocation.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use apteryx_common::wire::{
    FindRequest, FindTreeRequest, GetRequest, MemuseRequest, PruneRequest, QueryRequest, Request,
    Response, SearchRequest, SetRequest, SetTreeRequest, TimestampRequest, TraverseRequest,
    TreeMsg, request, response,
};
use apteryx_common::guid;
use bytes::Bytes;
use tokio::sync::Mutex;

mod callback;
mod conn;

pub use apteryx_common::error::AptError;
pub use apteryx_common::uri::DEFAULT_URI;
pub use apteryx_common::wire::TreeMsg as Tree;

use callback::{CallbackService, HandlerFn, Mode};
use conn::Conn;

/// A registered callback, used to deregister it again.
#[derive(Debug, Clone)]
pub struct Handle {
    kind: &'static str,
    guid: String,
    cb_ref: u64,
}

struct Inner {
    conn: Mutex<Conn>,
    next_id: AtomicU64,
    callbacks: Arc<CallbackService>,
}

/// Handle to one Apteryx daemon. Cheap to clone; all clones share one
/// request connection and one callback listener.
#[derive(Clone)]
pub struct Apteryx {
    inner: Arc<Inner>,
}

impl Apteryx {
    /// Connect with threaded callback delivery (the default).
    pub async fn connect(target: &str) -> Result<Apteryx, AptError> {
        Apteryx::with_mode(target, Mode::Threaded).await
    }

    /// Connect with application-drained callback delivery: see
    /// [`callback_fd`](Apteryx::callback_fd) and
    /// [`process_one`](Apteryx::process_one).
    pub async fn connect_manual(target: &str) -> Result<Apteryx, AptError> {
        Apteryx::with_mode(target, Mode::Manual).await
    }

    async fn with_mode(target: &str, mode: Mode) -> Result<Apteryx, AptError> {
        let conn = Conn::connect(target).await?;
        Ok(Apteryx {
            inner: Arc::new(Inner {
                conn: Mutex::new(conn),
                next_id: AtomicU64::new(1),
                callbacks: Arc::new(CallbackService::new(mode)?),
            }),
        })
    }

    async fn call(&self, action: request::Action) -> Result<Response, AptError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let request = Request {
            id,
            action: Some(action),
        };
        let mut conn = self.inner.conn.lock().await;
        conn.call(request).await
    }

    async fn call_ok(&self, action: request::Action) -> Result<(), AptError> {
        let response = self.call(action).await?;
        match AptError::from_code(response.status) {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    // ==================================================================
    // Values
    // ==================================================================

    /// Get the value at `path`, `Ok(None)` if absent.
    pub async fn get(&self, path: impl AsRef<str>) -> Result<Option<Bytes>, AptError> {
        let response = self
            .call(request::Action::Get(GetRequest {
                path: path.as_ref().to_string(),
            }))
            .await?;
        if let Some(err) = AptError::from_code(response.status) {
            return Err(err);
        }
        Ok(match response.body {
            Some(response::Body::Value(value)) => Some(value),
            _ => None,
        })
    }

    /// Set the value at `path`.
    pub async fn set(
        &self,
        path: impl AsRef<str>,
        value: impl Into<Bytes>,
    ) -> Result<(), AptError> {
        self.call_ok(request::Action::Set(SetRequest {
            path: path.as_ref().to_string(),
            value: Some(value.into()),
            expect_ts: None,
            wait: false,
        }))
        .await
    }

    /// Set and block until every matching watcher has been notified.
    pub async fn set_wait(
        &self,
        path: impl AsRef<str>,
        value: impl Into<Bytes>,
    ) -> Result<(), AptError> {
        self.call_ok(request::Action::Set(SetRequest {
            path: path.as_ref().to_string(),
            value: Some(value.into()),
            expect_ts: None,
            wait: true,
        }))
        .await
    }

    /// Remove the value at `path`.
    pub async fn clear(&self, path: impl AsRef<str>) -> Result<(), AptError> {
        self.call_ok(request::Action::Set(SetRequest {
            path: path.as_ref().to_string(),
            value: None,
            expect_ts: None,
            wait: false,
        }))
        .await
    }

    /// Compare-and-swap: apply only if the subtree timestamp still equals
    /// `ts` (0 for "must not exist yet"). Fails with [`AptError::Busy`].
    pub async fn cas(
        &self,
        path: impl AsRef<str>,
        value: impl Into<Bytes>,
        ts: u64,
    ) -> Result<(), AptError> {
        self.call_ok(request::Action::Set(SetRequest {
            path: path.as_ref().to_string(),
            value: Some(value.into()),
            expect_ts: Some(ts),
            wait: false,
        }))
        .await
    }

    // ==================================================================
    // Typed helpers
    // ==================================================================

    /// Get a value as UTF-8, lossily converted.
    pub async fn get_string(&self, path: impl AsRef<str>) -> Result<Option<String>, AptError> {
        Ok(self
            .get(path)
            .await?
            .map(|v| String::from_utf8_lossy(&v).into_owned()))
    }

    /// Get a value parsed as an integer. A present but unparsable value is
    /// [`AptError::Range`].
    pub async fn get_int(&self, path: impl AsRef<str>) -> Result<Option<i64>, AptError> {
        match self.get(path).await? {
            None => Ok(None),
            Some(raw) => std::str::from_utf8(&raw)
                .ok()
                .and_then(|s| s.trim_end_matches('\0').parse::<i64>().ok())
                .map(Some)
                .ok_or(AptError::Range),
        }
    }

    pub async fn set_int(&self, path: impl AsRef<str>, value: i64) -> Result<(), AptError> {
        self.set(path, value.to_string()).await
    }

    /// Get and deserialize a JSON value.
    pub async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: impl AsRef<str>,
    ) -> Result<Option<T>, AptError> {
        let Some(raw) = self.get(path).await? else {
            return Ok(None);
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| AptError::Protocol(e.to_string()))
    }

    /// Serialize and set a JSON value.
    pub async fn set_json<T: serde::Serialize>(
        &self,
        path: impl AsRef<str>,
        value: &T,
    ) -> Result<(), AptError> {
        let raw = serde_json::to_vec(value).map_err(|e| AptError::Protocol(e.to_string()))?;
        self.set(path, raw).await
    }

    // ==================================================================
    // Trees and enumeration
    // ==================================================================

    /// Immediate children of `path` (which must end in `/`).
    pub async fn search(&self, path: impl AsRef<str>) -> Result<Vec<String>, AptError> {
        let response = self
            .call(request::Action::Search(SearchRequest {
                path: path.as_ref().to_string(),
            }))
            .await?;
        paths_from(response)
    }

    /// Snapshot the subtree at `path`, synthetic values included.
    pub async fn get_tree(&self, path: impl AsRef<str>) -> Result<Option<TreeMsg>, AptError> {
        let response = self
            .call(request::Action::Traverse(TraverseRequest {
                path: path.as_ref().to_string(),
            }))
            .await?;
        tree_from(response)
    }

    /// Atomically apply every leaf of `tree`.
    pub async fn set_tree(&self, tree: TreeMsg) -> Result<(), AptError> {
        self.call_ok(request::Action::SetTree(SetTreeRequest {
            root: Some(tree),
            expect_ts: None,
            wait: false,
        }))
        .await
    }

    /// Atomic tree write guarded by the aggregate timestamp of its leaves.
    pub async fn cas_tree(&self, tree: TreeMsg, ts: u64) -> Result<(), AptError> {
        self.call_ok(request::Action::SetTree(SetTreeRequest {
            root: Some(tree),
            expect_ts: Some(ts),
            wait: false,
        }))
        .await
    }

    /// Project the store through a template: `*` segments expand, leaves
    /// select values.
    pub async fn query(&self, template: TreeMsg) -> Result<Option<TreeMsg>, AptError> {
        let response = self
            .call(request::Action::Query(QueryRequest {
                root: Some(template),
            }))
            .await?;
        tree_from(response)
    }

    /// Paths matching `pattern` whose value equals `value`.
    pub async fn find(
        &self,
        pattern: impl AsRef<str>,
        value: impl Into<Bytes>,
    ) -> Result<Vec<String>, AptError> {
        let response = self
            .call(request::Action::Find(FindRequest {
                path: pattern.as_ref().to_string(),
                value: value.into(),
            }))
            .await?;
        paths_from(response)
    }

    /// Roots whose subtree satisfies every leaf of `template`.
    pub async fn find_tree(&self, template: TreeMsg) -> Result<Vec<String>, AptError> {
        let response = self
            .call(request::Action::FindTree(FindTreeRequest {
                root: Some(template),
            }))
            .await?;
        paths_from(response)
    }

    /// Delete the whole subtree at `path`.
    pub async fn prune(&self, path: impl AsRef<str>) -> Result<(), AptError> {
        self.call_ok(request::Action::Prune(PruneRequest {
            path: path.as_ref().to_string(),
        }))
        .await
    }

    /// Maximum modification timestamp in the subtree, 0 if absent.
    pub async fn timestamp(&self, path: impl AsRef<str>) -> Result<u64, AptError> {
        let response = self
            .call(request::Action::Timestamp(TimestampRequest {
                path: path.as_ref().to_string(),
            }))
            .await?;
        u64_from(response)
    }

    /// Approximate byte cost of the subtree.
    pub async fn memuse(&self, path: impl AsRef<str>) -> Result<u64, AptError> {
        let response = self
            .call(request::Action::Memuse(MemuseRequest {
                path: path.as_ref().to_string(),
            }))
            .await?;
        u64_from(response)
    }

    // ==================================================================
    // Callbacks
    // ==================================================================

    /// Run `f` after every committed write matching `pattern`. The value is
    /// `None` for deletes.
    pub async fn watch(
        &self,
        pattern: impl AsRef<str>,
        f: impl Fn(&str, Option<&Bytes>) + Send + Sync + 'static,
    ) -> Result<Handle, AptError> {
        self.register("watchers", pattern.as_ref(), HandlerFn::Watch(Box::new(f)))
            .await
    }

    /// Run `f` once per committed write under `pattern`, with the whole
    /// written snapshot.
    pub async fn watch_tree(
        &self,
        pattern: impl AsRef<str>,
        f: impl Fn(&TreeMsg) + Send + Sync + 'static,
    ) -> Result<Handle, AptError> {
        self.register(
            "tree-watchers",
            pattern.as_ref(),
            HandlerFn::WatchTree(Box::new(f)),
        )
        .await
    }

    /// Consult `f` before any write matching `pattern` commits. Return 0 to
    /// allow, a negated errno (conventionally `-EPERM`) to refuse.
    pub async fn validate(
        &self,
        pattern: impl AsRef<str>,
        f: impl Fn(&str, Option<&Bytes>) -> i32 + Send + Sync + 'static,
    ) -> Result<Handle, AptError> {
        self.register(
            "validators",
            pattern.as_ref(),
            HandlerFn::Validate(Box::new(f)),
        )
        .await
    }

    /// Let `f` repopulate `pattern` on reads. It returns how long the
    /// refreshed state stays valid, in microseconds.
    pub async fn refresh(
        &self,
        pattern: impl AsRef<str>,
        f: impl Fn(&str) -> u64 + Send + Sync + 'static,
    ) -> Result<Handle, AptError> {
        self.register(
            "refreshers",
            pattern.as_ref(),
            HandlerFn::Refresh(Box::new(f)),
        )
        .await
    }

    /// Let `f` synthesise values for reads of `pattern` that have no stored
    /// value.
    pub async fn provide(
        &self,
        pattern: impl AsRef<str>,
        f: impl Fn(&str) -> Option<Bytes> + Send + Sync + 'static,
    ) -> Result<Handle, AptError> {
        self.register(
            "providers",
            pattern.as_ref(),
            HandlerFn::Provide(Box::new(f)),
        )
        .await
    }

    /// Let `f` enumerate synthetic children for searches under `pattern`.
    pub async fn index(
        &self,
        pattern: impl AsRef<str>,
        f: impl Fn(&str) -> Vec<String> + Send + Sync + 'static,
    ) -> Result<Handle, AptError> {
        self.register("indexers", pattern.as_ref(), HandlerFn::Index(Box::new(f)))
            .await
    }

    /// Deregister any callback previously registered from this client.
    pub async fn unregister(&self, handle: Handle) -> Result<(), AptError> {
        self.clear(format!("/apteryx/{}/{}", handle.kind, handle.guid))
            .await?;
        self.inner.callbacks.remove_handler(handle.cb_ref);
        Ok(())
    }

    async fn register(
        &self,
        kind: &'static str,
        pattern: &str,
        handler: HandlerFn,
    ) -> Result<Handle, AptError> {
        self.inner.callbacks.clone().ensure_listener().await?;
        let cb_ref = self.inner.callbacks.add_handler(handler);
        let cb_guid = guid::make(std::process::id(), cb_ref, pattern);
        self.set(format!("/apteryx/{kind}/{cb_guid}"), pattern.to_string())
            .await?;
        Ok(Handle {
            kind,
            guid: cb_guid,
            cb_ref,
        })
    }

    // ==================================================================
    // Proxies and socket bindings
    // ==================================================================

    /// Forward every request under `pattern` (ending `/*`) to the instance
    /// at `remote_uri`.
    pub async fn proxy(
        &self,
        pattern: impl AsRef<str>,
        remote_uri: impl AsRef<str>,
    ) -> Result<Handle, AptError> {
        let pattern = pattern.as_ref();
        let remote_uri = remote_uri.as_ref();
        let cb_ref = self.inner.callbacks.next_ref();
        let cb_guid = guid::make(std::process::id(), cb_ref, pattern);
        self.set(
            format!("/apteryx/proxies/{cb_guid}"),
            format!("{remote_uri}:{pattern}"),
        )
        .await?;
        Ok(Handle {
            kind: "proxies",
            guid: cb_guid,
            cb_ref,
        })
    }

    /// Ask the daemon to accept clients on another socket.
    pub async fn bind(&self, listen_uri: impl AsRef<str>) -> Result<(), AptError> {
        let listen_uri = listen_uri.as_ref();
        let cb_guid = guid::make(std::process::id(), 0, listen_uri);
        self.set(format!("/apteryx/sockets/{cb_guid}"), listen_uri.to_string())
            .await
    }

    /// Release a binding added with [`bind`](Apteryx::bind).
    pub async fn unbind(&self, listen_uri: impl AsRef<str>) -> Result<(), AptError> {
        let listen_uri = listen_uri.as_ref();
        let cb_guid = guid::make(std::process::id(), 0, listen_uri);
        self.clear(format!("/apteryx/sockets/{cb_guid}")).await
    }

    // ==================================================================
    // Manual callback delivery
    // ==================================================================

    /// The descriptor that becomes readable when a callback invocation is
    /// queued. `None` unless connected with
    /// [`connect_manual`](Apteryx::connect_manual).
    pub fn callback_fd(&self) -> Option<std::os::fd::RawFd> {
        self.inner.callbacks.callback_fd()
    }

    /// Dequeue and execute exactly one callback invocation. Returns false
    /// when the queue is empty (or in threaded mode).
    pub fn process_one(&self) -> bool {
        self.inner.callbacks.process_one()
    }
}

fn paths_from(response: Response) -> Result<Vec<String>, AptError> {
    if let Some(err) = AptError::from_code(response.status) {
        return Err(err);
    }
    Ok(match response.body {
        Some(response::Body::Paths(list)) => list.paths,
        _ => Vec::new(),
    })
}

fn tree_from(response: Response) -> Result<Option<TreeMsg>, AptError> {
    if let Some(err) = AptError::from_code(response.status) {
        return Err(err);
    }
    Ok(match response.body {
        Some(response::Body::Tree(tree)) => Some(tree),
        _ => None,
    })
}

fn u64_from(response: Response) -> Result<u64, AptError> {
    if let Some(err) = AptError::from_code(response.status) {
        return Err(err);
    }
    Ok(match response.body {
        Some(response::Body::Timestamp(value)) => value,
        _ => 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use apteryx_common::code;

    #[test]
    fn handles_are_deterministic_per_pattern() {
        let a = guid::make(std::process::id(), 1, "/a/*");
        let b = guid::make(std::process::id(), 1, "/a/*");
        let c = guid::make(std::process::id(), 2, "/a/*");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn status_mapping() {
        assert_eq!(AptError::from_code(code::EBUSY), Some(AptError::Busy));
        assert_eq!(
            paths_from(Response::error(1, code::EINVAL)),
            Err(AptError::Invalid)
        );
        assert_eq!(paths_from(Response::ok(1)), Ok(Vec::new()));
    }
}

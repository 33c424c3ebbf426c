//! The configuration subtree.
//!
//! `/apteryx` is the control plane: writing `/apteryx/<kind>/<guid>` with a
//! pattern as value registers a callback, writing it with no value
//! deregisters it. The handlers here are themselves callback entries with a
//! [`LocalCb`] target, registered at engine construction, so registration
//! churn rides the ordinary write pipeline and the registrations stay
//! readable in the store like any other state.
//!
//! The same mechanism exposes runtime observability: counters as provided
//! leaves under `/apteryx/counters/` and per-callback statistics rebuilt by
//! a refresher under `/apteryx/statistics/`.

use apteryx_common::{guid, path, uri};
use bytes::Bytes;

use crate::callbacks::{CbKind, CbTarget};
use crate::counters::Counters;
use crate::engine::Engine;

pub const ROOT: &str = "/apteryx";
pub const DEBUG_PATH: &str = "/apteryx/debug";
pub const SOCKETS_PATH: &str = "/apteryx/sockets";
pub const COUNTERS_PATH: &str = "/apteryx/counters";
pub const STATISTICS_PATH: &str = "/apteryx/statistics";

/// The registration path for one callback kind.
pub fn kind_path(kind: CbKind) -> String {
    format!("{ROOT}/{}", kind.config_segment())
}

/// Engine-internal callback handlers.
#[derive(Debug, Clone, Copy)]
pub enum LocalCb {
    /// Watches `/apteryx/<kind>/` and keeps the registry in step.
    Registration(CbKind),
    /// Watches `/apteryx/sockets/` and drives the daemon's listeners.
    Sockets,
    /// Watches `/apteryx/debug`.
    Debug,
    /// Enumerates `/apteryx/counters/`.
    CountersIndex,
    /// Provides the value of one counter leaf.
    CountersGet,
    /// Rebuilds `/apteryx/statistics/` on read.
    Statistics,
}

pub(crate) fn register_internal(engine: &Engine) {
    let registry = &engine.registry;
    for kind in CbKind::ALL {
        registry.register(
            CbKind::Watch,
            kind.config_segment(),
            &format!("{}/", kind_path(kind)),
            CbTarget::Local(LocalCb::Registration(kind)),
            None,
        );
    }
    registry.register(
        CbKind::Watch,
        "sockets",
        &format!("{SOCKETS_PATH}/"),
        CbTarget::Local(LocalCb::Sockets),
        None,
    );
    registry.register(
        CbKind::Watch,
        "debug",
        DEBUG_PATH,
        CbTarget::Local(LocalCb::Debug),
        None,
    );
    registry.register(
        CbKind::Index,
        "counters-index",
        &format!("{COUNTERS_PATH}/"),
        CbTarget::Local(LocalCb::CountersIndex),
        None,
    );
    registry.register(
        CbKind::Provide,
        "counters-get",
        &format!("{COUNTERS_PATH}/"),
        CbTarget::Local(LocalCb::CountersGet),
        None,
    );
    registry.register(
        CbKind::Refresh,
        "statistics",
        &format!("{STATISTICS_PATH}/*"),
        CbTarget::Local(LocalCb::Statistics),
        None,
    );
}

pub(crate) fn run_local_watch(engine: &Engine, cb: LocalCb, target: &str, value: Option<&Bytes>) {
    match cb {
        LocalCb::Registration(kind) => handle_registration(engine, kind, target, value),
        LocalCb::Sockets => handle_sockets(engine, target, value),
        LocalCb::Debug => {
            let enabled = value
                .and_then(|v| std::str::from_utf8(v).ok())
                .and_then(|s| s.parse::<i32>().ok())
                .unwrap_or(0)
                != 0;
            engine
                .debug
                .store(enabled, std::sync::atomic::Ordering::Relaxed);
            log::debug!("debug {}", if enabled { "enabled" } else { "disabled" });
        }
        _ => {}
    }
}

fn handle_registration(engine: &Engine, kind: CbKind, target: &str, value: Option<&Bytes>) {
    let cb_guid = target.rsplit('/').next().unwrap_or_default();
    let Some(value) = value else {
        if engine.registry.deregister(cb_guid).is_none() {
            log::debug!("removing unknown callback guid {cb_guid}");
        }
        return;
    };
    let Ok(text) = std::str::from_utf8(value) else {
        log::warn!("callback {cb_guid}: registration value is not UTF-8");
        return;
    };
    let Some((pid, cb_ref)) = guid::parse(cb_guid) else {
        log::warn!("invalid callback guid {cb_guid}");
        return;
    };
    let (pattern, remote_uri) = if kind == CbKind::Proxy {
        match uri::split_proxy_value(text) {
            Some((remote, pattern)) => (pattern, Some(remote.to_string())),
            None => {
                log::warn!("proxy {cb_guid}: bad registration value {text:?}");
                return;
            }
        }
    } else {
        (text, None)
    };
    if path::validate_pattern(pattern).is_err() {
        log::warn!("callback {cb_guid}: bad pattern {pattern:?}");
        return;
    }
    log::debug!("{}: {cb_guid} -> {pattern}", kind.config_segment());
    engine.registry.register(
        kind,
        cb_guid,
        pattern,
        CbTarget::Remote { pid, cb_ref },
        remote_uri,
    );
}

fn handle_sockets(engine: &Engine, target: &str, value: Option<&Bytes>) {
    let socket_guid = target.rsplit('/').next().unwrap_or_default();
    let sockets = engine.sockets.read().unwrap();
    let Some(manager) = sockets.as_ref() else {
        return;
    };
    match value.and_then(|v| std::str::from_utf8(v).ok()) {
        Some(listen_uri) => {
            if !manager.bind(socket_guid, listen_uri) {
                log::warn!("could not bind {listen_uri}");
            }
        }
        None => {
            manager.release(socket_guid);
        }
    }
}

pub(crate) fn run_local_provide(engine: &Engine, cb: LocalCb, target: &str) -> Option<Bytes> {
    match cb {
        LocalCb::CountersGet => {
            let name = target.rsplit('/').next()?;
            engine
                .counters
                .value(name)
                .map(|v| Bytes::from(v.to_string()))
        }
        _ => None,
    }
}

pub(crate) fn run_local_index(_engine: &Engine, cb: LocalCb, search_path: &str) -> Vec<String> {
    match cb {
        LocalCb::CountersIndex if search_path == "/apteryx/counters/" => Counters::NAMES
            .iter()
            .map(|name| format!("{COUNTERS_PATH}/{name}"))
            .collect(),
        _ => Vec::new(),
    }
}

pub(crate) fn run_local_refresh(engine: &Engine, cb: LocalCb, _target: &str) -> u64 {
    match cb {
        LocalCb::Statistics => refresh_statistics(engine),
        _ => 0,
    }
}

/// Rebuild `/apteryx/statistics/<kind>/<guid>` as `count,min,avg,max`
/// tuples (microseconds). Valid for one second.
fn refresh_statistics(engine: &Engine) -> u64 {
    let mut rows: Vec<(String, String)> = Vec::new();
    for kind in CbKind::ALL {
        engine.registry.for_each(kind, |entry| {
            let (count, min, avg, max) = entry.stats.snapshot();
            rows.push((
                format!("{STATISTICS_PATH}/{}/{}", kind.config_segment(), entry.guid),
                format!("{count},{min},{avg},{max}"),
            ));
        });
    }

    let ts = engine.clock.now_us();
    let mut db = engine.db.write().unwrap();
    db.prune(STATISTICS_PATH, ts);
    for (row_path, row_value) in rows {
        db.add(&row_path, Bytes::from(row_value), ts);
    }
    1_000_000
}

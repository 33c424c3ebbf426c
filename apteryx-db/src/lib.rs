//! # Apteryx core engine
//!
//! The in-memory hierarchical datastore behind the Apteryx daemon: a
//! path-keyed tree with timestamped nodes, reactive callbacks (watchers,
//! validators, refreshers, providers, indexers, proxies) and the dispatch
//! machinery that coordinates them during reads and writes.
//!
//! The engine is an explicit object with no process-wide state. It never
//! opens a socket itself: outbound callback invocations and proxy forwards
//! go through the [`Rpc`] trait, which the daemon implements with blocking
//! connections and tests implement in memory.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use apteryx_db::Engine;
//!
//! let engine = Engine::new(Arc::new(rpc));
//! engine.set("/interfaces/eth0/state", Some("up".into()), None, false)?;
//! assert_eq!(engine.get("/interfaces/eth0/state")?, Some("up".into()));
//! ```

pub mod callbacks;
pub mod clock;
pub mod config;
pub mod counters;
pub mod db;
pub mod dispatch;
pub mod engine;
pub mod pattern;
mod query;
pub mod service;

pub use apteryx_common::error::AptError;
pub use dispatch::{RPC_TIMEOUT, Rpc, SocketManager};
pub use engine::Engine;

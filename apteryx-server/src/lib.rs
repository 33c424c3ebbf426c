//! The Apteryx daemon as a library: [`Server::start`] wires an engine to a
//! set of listeners so the binary (and the integration tests) stay thin.

pub mod rpc;
mod server;

pub use server::Server;

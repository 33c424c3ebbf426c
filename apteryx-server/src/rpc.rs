//! Outbound RPC: blocking sockets with the protocol timeout.
//!
//! These calls are made from engine worker threads (callback invocations,
//! proxy forwards), never from the tokio reactor, so plain blocking IO with
//! socket timeouts is the simplest correct tool.

use std::io::{Read, Write};

use apteryx_common::error::AptError;
use apteryx_common::uri::Endpoint;
use apteryx_common::wire::{Request, Response};
use apteryx_common::{read_frame_blocking, write_frame_blocking};
use apteryx_db::{RPC_TIMEOUT, Rpc};

pub struct BlockingRpc;

enum Stream {
    Unix(std::os::unix::net::UnixStream),
    Tcp(std::net::TcpStream),
}

impl Stream {
    fn connect(endpoint: Endpoint) -> std::io::Result<Stream> {
        match endpoint {
            Endpoint::Unix(path) => {
                let stream = std::os::unix::net::UnixStream::connect(path)?;
                stream.set_read_timeout(Some(RPC_TIMEOUT))?;
                stream.set_write_timeout(Some(RPC_TIMEOUT))?;
                Ok(Stream::Unix(stream))
            }
            Endpoint::Tcp(addr) => {
                let stream = std::net::TcpStream::connect_timeout(&addr, RPC_TIMEOUT)?;
                stream.set_read_timeout(Some(RPC_TIMEOUT))?;
                stream.set_write_timeout(Some(RPC_TIMEOUT))?;
                Ok(Stream::Tcp(stream))
            }
        }
    }

    fn exchange(&mut self, request: &Request) -> std::io::Result<Response> {
        match self {
            Stream::Unix(s) => exchange(s, request),
            Stream::Tcp(s) => exchange(s, request),
        }
    }
}

fn exchange<S: Read + Write>(stream: &mut S, request: &Request) -> std::io::Result<Response> {
    write_frame_blocking(stream, request)?;
    read_frame_blocking(stream)
}

impl Rpc for BlockingRpc {
    fn call(&self, target: &str, request: Request) -> Result<Response, AptError> {
        let endpoint: Endpoint = target.parse()?;
        let mut stream = Stream::connect(endpoint)
            .map_err(|e| AptError::Connection(format!("{target}: {e}")))?;
        stream.exchange(&request).map_err(|e| match e.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => AptError::Timeout,
            _ => AptError::Connection(format!("{target}: {e}")),
        })
    }
}

//! Endpoint URIs: `unix://<path>` and `tcp://<addr>:<port>`.
//!
//! IPv6 addresses are bracketed (`tcp://[::1]:9999`). The daemon listens on
//! [`DEFAULT_URI`] unless told otherwise; a client's callback listener lives
//! at a per-process socket derived from its pid.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::AptError;

/// Default daemon socket.
pub const DEFAULT_URI: &str = "unix:///tmp/apteryx";

/// The socket a client binds for callback delivery.
pub fn client_uri(pid: u32) -> String {
    format!("unix:///tmp/apteryx.{pid}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

impl FromStr for Endpoint {
    type Err = AptError;

    fn from_str(uri: &str) -> Result<Self, Self::Err> {
        if let Some(path) = uri.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(AptError::Invalid);
            }
            return Ok(Endpoint::Unix(PathBuf::from(path)));
        }
        if let Some(addr) = uri.strip_prefix("tcp://") {
            let addr: SocketAddr = addr.parse().map_err(|_| AptError::Invalid)?;
            return Ok(Endpoint::Tcp(addr));
        }
        Err(AptError::Invalid)
    }
}

/// Split a proxy registration value of the form `<uri>:<pattern>` at the last
/// `:`. Proxy patterns therefore cannot contain `:`; paths elsewhere can.
pub fn split_proxy_value(value: &str) -> Option<(&str, &str)> {
    let idx = value.rfind(':')?;
    let (uri, pattern) = (&value[..idx], &value[idx + 1..]);
    if !pattern.starts_with('/') || uri.parse::<Endpoint>().is_err() {
        return None;
    }
    Some((uri, pattern))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_unix() {
        assert_eq!(
            "unix:///tmp/apteryx".parse::<Endpoint>().unwrap(),
            Endpoint::Unix(PathBuf::from("/tmp/apteryx"))
        );
    }

    #[test]
    fn parse_tcp() {
        assert_eq!(
            "tcp://127.0.0.1:9999".parse::<Endpoint>().unwrap(),
            Endpoint::Tcp("127.0.0.1:9999".parse().unwrap())
        );
    }

    #[test]
    fn parse_tcp6_bracketed() {
        assert_eq!(
            "tcp://[::1]:9999".parse::<Endpoint>().unwrap(),
            Endpoint::Tcp("[::1]:9999".parse().unwrap())
        );
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!("http://x".parse::<Endpoint>().is_err());
        assert!("unix://".parse::<Endpoint>().is_err());
    }

    #[test]
    fn proxy_value_splits_at_last_colon() {
        let (uri, pattern) =
            split_proxy_value("tcp://[::1]:9999:/test/remote/*").expect("valid value");
        assert_eq!(uri, "tcp://[::1]:9999");
        assert_eq!(pattern, "/test/remote/*");

        let (uri, pattern) =
            split_proxy_value("unix:///tmp/apteryx.test:/test/remote/*").expect("valid value");
        assert_eq!(uri, "unix:///tmp/apteryx.test");
        assert_eq!(pattern, "/test/remote/*");

        assert!(split_proxy_value("tcp://1.2.3.4:9999").is_none());
    }
}

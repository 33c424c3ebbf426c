//! The request connection to the daemon.

use apteryx_common::error::AptError;
use apteryx_common::uri::Endpoint;
use apteryx_common::wire::{Request, Response};
use apteryx_common::{read_frame, write_frame};
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};

enum Stream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

pub(crate) struct Conn {
    stream: Stream,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl Conn {
    pub(crate) async fn connect(target: &str) -> Result<Conn, AptError> {
        let endpoint: Endpoint = target.parse()?;
        let stream = match endpoint {
            Endpoint::Unix(path) => Stream::Unix(UnixStream::connect(path).await?),
            Endpoint::Tcp(addr) => Stream::Tcp(TcpStream::connect(addr).await?),
        };
        Ok(Conn {
            stream,
            read_buf: BytesMut::new(),
            write_buf: BytesMut::new(),
        })
    }

    /// One request, one response. The caller serialises access, so the next
    /// frame on the wire is always our answer; a mismatched id means the
    /// connection state is broken.
    pub(crate) async fn call(&mut self, request: Request) -> Result<Response, AptError> {
        let id = request.id;
        let response = match &mut self.stream {
            Stream::Unix(s) => exchange(s, &request, &mut self.read_buf, &mut self.write_buf).await,
            Stream::Tcp(s) => exchange(s, &request, &mut self.read_buf, &mut self.write_buf).await,
        }?;
        if response.id != id {
            return Err(AptError::Protocol(format!(
                "response id {} for request {id}",
                response.id
            )));
        }
        Ok(response)
    }
}

async fn exchange<S>(
    stream: &mut S,
    request: &Request,
    read_buf: &mut BytesMut,
    write_buf: &mut BytesMut,
) -> Result<Response, AptError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_frame(stream, request, write_buf).await?;
    Ok(read_frame(stream, read_buf).await?)
}

//! # Apteryx wire protocol
//!
//! Everything the daemon and the client library share: the protobuf request
//! and response messages, the length-prefixed framing used on every socket,
//! status codes, and path/URI syntax helpers.
//!
//! Frames are a 4-byte big-endian length followed by the encoded message.
//! The same framing is used in both directions, including for callback
//! invocations sent from the daemon to a client's listener socket.

use bytes::{Buf, BytesMut};
use prost::{EncodeError, Message};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub mod error;
pub mod guid;
pub mod path;
pub mod uri;
pub mod wire;

pub use error::{AptError, code};

/// Upper bound on a single frame, matching the largest value the original
/// implementation accepts.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024 * 100;

const HEADER_SIZE: usize = 4;

/// Length-prefix encoding into a reusable buffer.
///
/// The length is written as a placeholder first and patched once the message
/// size is known, so a single buffer can hold a batch of frames.
pub trait NetEncode {
    fn net_encode(&self, buffer: &mut BytesMut) -> Result<(), EncodeError>;
}

impl<T> NetEncode for T
where
    T: Message,
{
    fn net_encode(&self, buffer: &mut BytesMut) -> Result<(), EncodeError> {
        let start_idx = buffer.len();
        buffer.extend_from_slice(0u32.to_be_bytes().as_slice());
        self.encode(buffer)?;
        let msg_len_bytes = ((buffer.len() - start_idx - HEADER_SIZE) as u32).to_be_bytes();
        buffer[start_idx..start_idx + HEADER_SIZE].copy_from_slice(&msg_len_bytes);
        Ok(())
    }
}

fn frame_len(header: [u8; HEADER_SIZE]) -> std::io::Result<usize> {
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(std::io::Error::other(format!(
            "frame too large: {len} > {MAX_FRAME_SIZE}"
        )));
    }
    Ok(len)
}

fn decode_body<M: Message + Default>(body: &[u8]) -> std::io::Result<M> {
    M::decode(body).map_err(|e| std::io::Error::other(format!("proto: {e}")))
}

/// Read one frame from an async stream.
///
/// `buf` is reused between calls to avoid reallocation. EOF before the header
/// surfaces as `UnexpectedEof`.
pub async fn read_frame<M, R>(stream: &mut R, buf: &mut BytesMut) -> std::io::Result<M>
where
    M: Message + Default,
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_SIZE];
    stream.read_exact(&mut header).await?;
    let len = frame_len(header)?;

    buf.clear();
    buf.resize(len, 0);
    stream.read_exact(&mut buf[..]).await?;
    decode_body(&buf[..])
}

/// Encode and write one frame to an async stream.
pub async fn write_frame<M, W>(stream: &mut W, msg: &M, buf: &mut BytesMut) -> std::io::Result<()>
where
    M: Message,
    W: AsyncWrite + Unpin,
{
    buf.clear();
    msg.net_encode(buf)
        .map_err(|e| std::io::Error::other(format!("encode: {e}")))?;
    stream.write_all(buf).await?;
    stream.flush().await?;
    Ok(())
}

/// Blocking variant of [`read_frame`] for the dispatcher's worker threads.
pub fn read_frame_blocking<M, R>(stream: &mut R) -> std::io::Result<M>
where
    M: Message + Default,
    R: std::io::Read,
{
    let mut header = [0u8; HEADER_SIZE];
    stream.read_exact(&mut header)?;
    let len = frame_len(header)?;

    let mut body = vec![0u8; len];
    stream.read_exact(&mut body)?;
    decode_body(&body)
}

/// Blocking variant of [`write_frame`].
pub fn write_frame_blocking<M, W>(stream: &mut W, msg: &M) -> std::io::Result<()>
where
    M: Message,
    W: std::io::Write,
{
    let mut buf = BytesMut::new();
    msg.net_encode(&mut buf)
        .map_err(|e| std::io::Error::other(format!("encode: {e}")))?;
    stream.write_all(&buf)?;
    stream.flush()
}

/// Decode a frame already held in memory, consuming it from `buf`.
/// Returns `None` if the buffer does not yet hold a complete frame.
pub fn try_decode_frame<M: Message + Default>(buf: &mut BytesMut) -> std::io::Result<Option<M>> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }
    let mut header = [0u8; HEADER_SIZE];
    header.copy_from_slice(&buf[..HEADER_SIZE]);
    let len = frame_len(header)?;
    if buf.len() < HEADER_SIZE + len {
        return Ok(None);
    }
    buf.advance(HEADER_SIZE);
    let body = buf.split_to(len);
    decode_body(&body).map(Some)
}

#[cfg(test)]
mod test {
    use bytes::BytesMut;

    use crate::wire::{Request, request};
    use crate::{NetEncode, try_decode_frame};

    #[test]
    fn frame_roundtrip() {
        let request = Request {
            id: 7,
            action: Some(request::Action::Get(crate::wire::GetRequest {
                path: "/interfaces/eth0/state".into(),
            })),
        };
        let mut buffer = BytesMut::new();
        request.net_encode(&mut buffer).expect("encoding error");

        let decoded: Request = try_decode_frame(&mut buffer).unwrap().expect("whole frame");
        assert_eq!(decoded, request);
        assert!(buffer.is_empty());
    }

    #[test]
    fn partial_frame_is_not_decoded() {
        let request = Request {
            id: 1,
            action: Some(request::Action::Get(crate::wire::GetRequest {
                path: "/a".into(),
            })),
        };
        let mut buffer = BytesMut::new();
        request.net_encode(&mut buffer).expect("encoding error");
        let mut partial = buffer.split_to(buffer.len() - 1);
        assert!(try_decode_frame::<Request>(&mut partial).unwrap().is_none());
    }
}

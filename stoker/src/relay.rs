use crate::error::Error;
use crate::payload::Payload;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UnixStream};
use tokio_util::codec::{Decoder, Encoder, Framed};

/// Marks a frame as protocol control traffic (handshake, stop).
pub const FLAG_CONTROL: u8 = 0x01;
/// Marks the body as a child-reported job error.
pub const FLAG_ERROR: u8 = 0x02;

const HEADER_LEN: usize = 9;
// Per-segment cap; anything larger is a protocol violation, not a payload.
const MAX_SEGMENT: usize = 64 * 1024 * 1024;

/// One message on the wire: `[flags u8][context_len u32 LE][body_len u32 LE]`
/// followed by the context and body bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    pub flags: u8,
    pub context: Bytes,
    pub body: Bytes,
}

impl Frame {
    pub fn from_payload(payload: &Payload) -> Self {
        Self {
            flags: 0,
            context: payload.context.clone(),
            body: payload.body.clone(),
        }
    }

    pub fn control(body: impl Into<Bytes>) -> Self {
        Self {
            flags: FLAG_CONTROL,
            context: Bytes::new(),
            body: body.into(),
        }
    }

    pub fn job_error(message: impl Into<Bytes>) -> Self {
        Self {
            flags: FLAG_ERROR,
            context: Bytes::new(),
            body: message.into(),
        }
    }

    pub fn is_control(&self) -> bool {
        self.flags & FLAG_CONTROL != 0
    }

    pub fn is_job_error(&self) -> bool {
        self.flags & FLAG_ERROR != 0
    }

    pub fn into_payload(self) -> Payload {
        Payload {
            body: self.body,
            context: self.context,
        }
    }
}

pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let context_len = u32::from_le_bytes([src[1], src[2], src[3], src[4]]) as usize;
        let body_len = u32::from_le_bytes([src[5], src[6], src[7], src[8]]) as usize;
        if context_len > MAX_SEGMENT || body_len > MAX_SEGMENT {
            return Err(Error::InvalidFrame(format!(
                "segment too large: context {context_len}, body {body_len}"
            )));
        }

        let total = HEADER_LEN + context_len + body_len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let flags = src[0];
        src.advance(1);
        src.advance(8);
        let context = src.split_to(context_len).freeze();
        let body = src.split_to(body_len).freeze();

        Ok(Some(Frame {
            flags,
            context,
            body,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Error> {
        if frame.context.len() > MAX_SEGMENT || frame.body.len() > MAX_SEGMENT {
            return Err(Error::InvalidFrame(format!(
                "segment too large: context {}, body {}",
                frame.context.len(),
                frame.body.len()
            )));
        }

        dst.reserve(HEADER_LEN + frame.context.len() + frame.body.len());
        dst.put_u8(frame.flags);
        dst.put_u32_le(frame.context.len() as u32);
        dst.put_u32_le(frame.body.len() as u32);
        dst.extend_from_slice(&frame.context);
        dst.extend_from_slice(&frame.body);
        Ok(())
    }
}

/// The accepted duplex connection under a relay, either TCP or a local
/// stream socket.
#[derive(Debug)]
pub enum RelayStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl AsyncRead for RelayStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            RelayStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            RelayStream::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for RelayStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            RelayStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            RelayStream::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            RelayStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            RelayStream::Unix(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            RelayStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            RelayStream::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Framed request/response exchange over a duplex byte stream.
pub struct Relay {
    framed: Framed<RelayStream, FrameCodec>,
}

impl Relay {
    pub fn new(stream: RelayStream) -> Self {
        Self {
            framed: Framed::new(stream, FrameCodec),
        }
    }

    /// Connects the child side of a relay. Addresses are the ones the
    /// factory advertises: `tcp://host:port` or `unix://path`.
    pub async fn connect(address: &str) -> Result<Self, Error> {
        let stream = if let Some(addr) = address.strip_prefix("tcp://") {
            RelayStream::Tcp(TcpStream::connect(addr).await?)
        } else if let Some(path) = address.strip_prefix("unix://") {
            RelayStream::Unix(UnixStream::connect(path).await?)
        } else {
            return Err(Error::Transport(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported relay address: {address}"),
            )));
        };
        Ok(Relay::new(stream))
    }

    pub async fn send(&mut self, frame: Frame) -> Result<(), Error> {
        self.framed.send(frame).await
    }

    pub async fn receive(&mut self) -> Result<Frame, Error> {
        match self.framed.next().await {
            Some(result) => result,
            None => Err(Error::Transport(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "relay closed",
            ))),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PidHandshake {
    pid: u32,
}

/// Control frame carrying a process identity, exchanged right after the
/// child dials back.
pub fn pid_frame(pid: u32) -> Frame {
    let body = serde_json::to_vec(&PidHandshake { pid }).unwrap_or_default();
    Frame::control(body)
}

pub fn parse_pid_frame(frame: &Frame) -> Result<u32, Error> {
    if !frame.is_control() {
        return Err(Error::InvalidFrame(
            "expected a control frame during handshake".to_string(),
        ));
    }
    let handshake: PidHandshake = serde_json::from_slice(&frame.body)
        .map_err(|err| Error::InvalidFrame(format!("malformed pid handshake: {err}")))?;
    Ok(handshake.pid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    #[test]
    fn decode_waits_for_a_full_frame() {
        let mut codec = FrameCodec;
        let mut encoded = BytesMut::new();
        codec
            .encode(
                Frame::from_payload(&Payload::new("body-bytes", "ctx")),
                &mut encoded,
            )
            .unwrap();

        // feed the header and part of the context only
        let mut partial = BytesMut::from(&encoded[..HEADER_LEN + 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        let mut full = BytesMut::from(&encoded[..]);
        let frame = codec.decode(&mut full).unwrap().unwrap();
        assert_eq!(frame.context, Bytes::from("ctx"));
        assert_eq!(frame.body, Bytes::from("body-bytes"));
        assert!(full.is_empty());
    }

    #[test]
    fn oversized_segment_is_rejected() {
        let mut codec = FrameCodec;
        let mut src = BytesMut::new();
        src.put_u8(0);
        src.put_u32_le(u32::MAX);
        src.put_u32_le(0);
        let err = codec.decode(&mut src).unwrap_err();
        assert!(matches!(err, Error::InvalidFrame(_)));
    }

    #[test]
    fn pid_frame_round_trips() {
        let frame = pid_frame(4242);
        assert!(frame.is_control());
        assert_eq!(parse_pid_frame(&frame).unwrap(), 4242);
    }

    #[test]
    fn non_control_frame_fails_the_handshake() {
        let frame = Frame::from_payload(&Payload::from_body("{\"pid\":1}"));
        assert!(matches!(
            parse_pid_frame(&frame),
            Err(Error::InvalidFrame(_))
        ));
    }
}

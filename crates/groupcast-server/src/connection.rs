//! Transport-independent view of one physical connection.
//!
//! A [`Connection`] is a sink of [`Frame`]s plus a stream of inbound frames.
//! WebSocket connections are adapted with [`Connection::from_websocket`];
//! tests and embedders use [`Connection::loopback`] to drive the pump without
//! sockets.

use std::pin::Pin;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::channel::mpsc as fmpsc;
use futures::stream::BoxStream;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::errors::TransportError;

/// One protocol frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// Application payload.
    Message(Bytes),
    /// Keepalive request.
    Ping(Bytes),
    /// Keepalive answer.
    Pong(Bytes),
    /// Orderly shutdown.
    Close,
}

/// Outbound half of a connection.
pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = TransportError> + Send>>;

/// Inbound half of a connection.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, TransportError>> + Send>>;

/// A bidirectional frame channel owned by exactly one pump.
pub struct Connection {
    sink: FrameSink,
    stream: FrameStream,
}

impl Connection {
    /// Wrap an arbitrary sink and stream.
    pub fn new(sink: FrameSink, stream: FrameStream) -> Self {
        Self { sink, stream }
    }

    /// Adapt an upgraded axum WebSocket.
    ///
    /// Payloads that are valid UTF-8 go out as text frames, everything else as
    /// binary.
    pub fn from_websocket(socket: WebSocket) -> Self {
        let (sink, stream) = socket.split();
        let sink = sink
            .sink_map_err(TransportError::from)
            .with(|frame: Frame| futures::future::ready(Ok::<_, TransportError>(to_ws(frame))));
        let stream = stream.map(|msg| msg.map(from_ws).map_err(TransportError::from));
        Self::new(Box::pin(sink), Box::pin(stream))
    }

    /// In-memory connection with an unbounded outbound side.
    pub fn loopback() -> (Self, RemotePeer) {
        let (out_tx, out_rx) = fmpsc::unbounded::<Frame>();
        let sink = out_tx.sink_map_err(|_| TransportError::Closed);
        Self::loopback_with(Box::pin(sink), out_rx.boxed())
    }

    /// In-memory connection whose outbound side holds at most `buffer` frames
    /// until the peer reads them. A peer that never reads stalls writes.
    pub fn loopback_bounded(buffer: usize) -> (Self, RemotePeer) {
        let (out_tx, out_rx) = fmpsc::channel::<Frame>(buffer);
        let sink = out_tx.sink_map_err(|_| TransportError::Closed);
        Self::loopback_with(Box::pin(sink), out_rx.boxed())
    }

    fn loopback_with(sink: FrameSink, outbound: BoxStream<'static, Frame>) -> (Self, RemotePeer) {
        let (in_tx, in_rx) = fmpsc::unbounded::<Frame>();
        let conn = Self::new(sink, Box::pin(in_rx.map(Ok)));
        let peer = RemotePeer {
            inbound: Some(in_tx),
            outbound,
        };
        (conn, peer)
    }

    pub(crate) fn into_parts(self) -> (FrameSink, FrameStream) {
        (self.sink, self.stream)
    }
}

fn to_ws(frame: Frame) -> Message {
    match frame {
        Frame::Message(bytes) => match std::str::from_utf8(&bytes) {
            Ok(text) => Message::Text(text.to_owned().into()),
            Err(_) => Message::Binary(bytes),
        },
        Frame::Ping(bytes) => Message::Ping(bytes),
        Frame::Pong(bytes) => Message::Pong(bytes),
        Frame::Close => Message::Close(None),
    }
}

fn from_ws(msg: Message) -> Frame {
    match msg {
        Message::Text(text) => Frame::Message(Bytes::copy_from_slice(text.as_str().as_bytes())),
        Message::Binary(bytes) => Frame::Message(bytes),
        Message::Ping(bytes) => Frame::Ping(bytes),
        Message::Pong(bytes) => Frame::Pong(bytes),
        Message::Close(_) => Frame::Close,
    }
}

/// The far end of a loopback connection.
pub struct RemotePeer {
    inbound: Option<fmpsc::UnboundedSender<Frame>>,
    outbound: BoxStream<'static, Frame>,
}

impl RemotePeer {
    /// Deliver a frame to the pump. Returns `false` once the pump stopped
    /// reading or the peer hung up.
    pub fn send(&self, frame: Frame) -> bool {
        self.inbound
            .as_ref()
            .is_some_and(|tx| tx.unbounded_send(frame).is_ok())
    }

    /// Deliver an application message.
    pub fn send_message(&self, payload: impl Into<Bytes>) -> bool {
        self.send(Frame::Message(payload.into()))
    }

    /// Next frame written by the pump, or `None` once the pump closed its sink.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.outbound.next().await
    }

    /// Next application payload, skipping keepalive frames. `None` on close
    /// or end of stream.
    pub async fn recv_message(&mut self) -> Option<Bytes> {
        loop {
            match self.outbound.next().await? {
                Frame::Message(bytes) => return Some(bytes),
                Frame::Ping(_) | Frame::Pong(_) => {}
                Frame::Close => return None,
            }
        }
    }

    /// End the inbound stream, as if the socket dropped.
    pub fn hang_up(&mut self) {
        self.inbound = None;
    }
}

/// Non-blocking close request shared by a pump and whoever may evict it.
#[derive(Clone, Debug, Default)]
pub struct CloseHandle {
    token: CancellationToken,
}

impl CloseHandle {
    /// Create an open handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request the connection to close. Idempotent and never blocks.
    pub fn close(&self) {
        self.token.cancel();
    }

    /// Whether a close was requested.
    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once a close is requested.
    pub async fn closed(&self) {
        self.token.cancelled().await;
    }
}

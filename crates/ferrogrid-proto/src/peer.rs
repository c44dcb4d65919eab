//! Bidirectional request/response peer over a single connection
//!
//! Both the grid and the agent originate requests on the same connection: the
//! grid dispatches work to agents, agents register tokens and download files
//! from the grid. A [`Peer`] owns one reader task and one writer task; every
//! inbound request is served on its own task by a [`RequestHandler`], and
//! responses to outbound requests are correlated through the frame channel.

use crate::message::{ErrorCode, ErrorDetails};
use crate::{Frame, FrameCodec, Message, ProtocolError, Request, Response};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, error, info, warn};

/// Capacity of the outbound frame queue
const OUTBOUND_QUEUE: usize = 1024;

type PendingMap = HashMap<u32, oneshot::Sender<Result<Response, ProtocolError>>>;

/// Serves requests originated by the remote side
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Produce the response to `request`
    async fn handle(&self, request: Request) -> Response;
}

/// A frame already encoded for the wire
struct Outgoing {
    bytes: Bytes,
    goodbye: bool,
}

struct PeerInner {
    name: String,
    codec: FrameCodec,
    outbound: mpsc::Sender<Outgoing>,
    pending: Mutex<PendingMap>,
    next_channel: AtomicU32,
    closed_tx: watch::Sender<bool>,
}

impl PeerInner {
    /// Encode and queue `frame`. Encoding failures stay with the caller so a
    /// frame that cannot be sent never reaches the writer.
    async fn send(&self, frame: &Frame) -> Result<(), ProtocolError> {
        let bytes = self.codec.encode_frame(frame)?;
        let goodbye = frame.is_goodbye();
        self.outbound
            .send(Outgoing { bytes, goodbye })
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Queue the response to a request served on `channel`. A response that
    /// cannot be encoded is replaced by an error response for that request.
    async fn respond(&self, channel: u32, response: Response) -> Result<(), ProtocolError> {
        let request_id = response.request_id();
        let frame = Frame::message(channel, &Message::response(response))?;
        match self.send(&frame).await {
            Err(ProtocolError::ConnectionClosed) => Err(ProtocolError::ConnectionClosed),
            Err(e) => {
                error!(peer = %self.name, channel, id = %request_id, "Response cannot be sent: {}", e);
                let fallback = Response::error(request_id, ErrorDetails::from(e));
                match Frame::message(channel, &Message::response(fallback)) {
                    Ok(frame) => self.send(&frame).await,
                    Err(e) => self.send(&Frame::error(channel, e.to_string())).await,
                }
            }
            Ok(()) => Ok(()),
        }
    }

    async fn fail_pending(&self, channel: u32, error: ProtocolError) {
        if let Some(sender) = self.pending.lock().await.remove(&channel) {
            let _ = sender.send(Err(error));
        }
    }
}

/// Handle to a running connection; cheap to clone
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

impl Peer {
    /// Start serving `stream`. `name` only appears in logs.
    pub fn spawn<S, H>(name: impl Into<String>, stream: S, handler: Arc<H>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
        H: RequestHandler + ?Sized,
    {
        Self::spawn_with_codec(name, stream, handler, FrameCodec::new)
    }

    /// Like [`Peer::spawn`] with a custom frame size limit in both directions
    pub fn spawn_with_max_frame_size<S, H>(
        name: impl Into<String>,
        stream: S,
        handler: Arc<H>,
        max_frame_size: usize,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
        H: RequestHandler + ?Sized,
    {
        Self::spawn_with_codec(name, stream, handler, || FrameCodec::with_max_frame_size(max_frame_size))
    }

    fn spawn_with_codec<S, H>(
        name: impl Into<String>,
        stream: S,
        handler: Arc<H>,
        codec: impl Fn() -> FrameCodec,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
        H: RequestHandler + ?Sized,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (closed_tx, _) = watch::channel(false);

        let inner = Arc::new(PeerInner {
            name: name.into(),
            codec: codec(),
            outbound: outbound_tx,
            pending: Mutex::new(HashMap::new()),
            next_channel: AtomicU32::new(1),
            closed_tx,
        });

        tokio::spawn(write_loop(
            inner.name.clone(),
            writer,
            outbound_rx,
            inner.closed_tx.subscribe(),
        ));
        tokio::spawn(read_loop(inner.clone(), reader, codec(), handler));

        Self { inner }
    }

    /// Name given at spawn time
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Send a request and wait for its response.
    ///
    /// Error responses from the remote side are turned into
    /// [`ProtocolError::Remote`]. A request too large to send fails alone
    /// with [`ProtocolError::FrameTooLarge`].
    pub async fn call(&self, request: Request, timeout: Duration) -> Result<Response, ProtocolError> {
        if self.is_closed() {
            return Err(ProtocolError::ConnectionClosed);
        }

        let request_id = request.id();
        let channel = self.inner.next_channel.fetch_add(1, Ordering::Relaxed);
        let frame = Frame::message(channel, &Message::request(request))?;

        let (response_tx, response_rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(channel, response_tx);
        if self.is_closed() {
            self.inner.pending.lock().await.remove(&channel);
            return Err(ProtocolError::ConnectionClosed);
        }

        if let Err(e) = self.inner.send(&frame).await {
            self.inner.pending.lock().await.remove(&channel);
            return Err(e);
        }

        let response = match tokio::time::timeout(timeout, response_rx).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => return Err(ProtocolError::ConnectionClosed),
            Err(_) => {
                self.inner.pending.lock().await.remove(&channel);
                return Err(ProtocolError::Timeout {
                    request_id,
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        };

        match response {
            Response::Error { error, .. } => Err(ProtocolError::Remote(error)),
            other => Ok(other),
        }
    }

    /// Whether the connection has terminated
    pub fn is_closed(&self) -> bool {
        *self.inner.closed_tx.borrow()
    }

    /// Wait until the connection terminates
    pub async fn closed(&self) {
        wait_closed(&mut self.inner.closed_tx.subscribe()).await;
    }

    /// Say goodbye to the remote side. Pending calls fail once the
    /// connection is torn down.
    pub async fn close(&self) {
        if self.is_closed() {
            return;
        }
        debug!(peer = %self.inner.name, "Sending goodbye");
        let _ = self.inner.send(&Frame::goodbye()).await;
    }
}

async fn wait_closed(closed_rx: &mut watch::Receiver<bool>) {
    while !*closed_rx.borrow_and_update() {
        if closed_rx.changed().await.is_err() {
            return;
        }
    }
}

async fn write_loop<W>(
    name: String,
    mut writer: W,
    mut outbound: mpsc::Receiver<Outgoing>,
    mut closed_rx: watch::Receiver<bool>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let outgoing = tokio::select! {
            outgoing = outbound.recv() => match outgoing {
                Some(outgoing) => outgoing,
                None => break,
            },
            _ = wait_closed(&mut closed_rx) => break,
        };
        let written = async {
            writer.write_all(&outgoing.bytes).await?;
            writer.flush().await
        };
        if let Err(e) = written.await {
            error!(peer = %name, "Failed to write frame: {}", e);
            break;
        }
        if outgoing.goodbye {
            break;
        }
    }
    let _ = writer.shutdown().await;
    debug!(peer = %name, "Writer stopped");
}

async fn read_loop<R, H>(inner: Arc<PeerInner>, mut reader: R, mut codec: FrameCodec, handler: Arc<H>)
where
    R: AsyncRead + Unpin,
    H: RequestHandler + ?Sized,
{
    loop {
        let frame = match codec.read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!(peer = %inner.name, "Connection closed by remote");
                break;
            }
            Err(e) => {
                warn!(peer = %inner.name, "Failed to read frame: {}", e);
                break;
            }
        };

        if frame.is_goodbye() {
            info!(peer = %inner.name, "Remote said goodbye");
            break;
        }

        let channel = frame.channel;
        if frame.is_error() {
            let reason = String::from_utf8_lossy(&frame.payload).into_owned();
            if frame.is_response() {
                warn!(peer = %inner.name, channel, "Remote rejected request: {}", reason);
                let details = ErrorDetails::new(ErrorCode::InvalidRequest, reason);
                inner.fail_pending(channel, ProtocolError::Remote(details)).await;
            } else {
                // The remote could not read a response we sent; its call fails on its side.
                warn!(peer = %inner.name, channel, "Remote rejected response: {}", reason);
            }
            continue;
        }

        match (frame.is_response(), frame.decode_message()) {
            (false, Ok(Message::Request(request))) => {
                let inner = inner.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    debug!(peer = %inner.name, kind = request.kind(), id = %request.id(), "Serving request");
                    let response = handler.handle(request).await;
                    if inner.respond(channel, response).await.is_err() {
                        debug!(peer = %inner.name, "Connection closed before response was sent");
                    }
                });
            }
            (true, Ok(Message::Response(response))) => {
                match inner.pending.lock().await.remove(&channel) {
                    Some(sender) => {
                        let _ = sender.send(Ok(response));
                    }
                    None => {
                        warn!(peer = %inner.name, id = %response.request_id(), "Response for unknown or expired request");
                    }
                }
            }
            (true, decoded) => {
                let reason = match decoded {
                    Ok(_) => "request sent as a response".to_string(),
                    Err(e) => e.to_string(),
                };
                warn!(peer = %inner.name, channel, "Undecodable response: {}", reason);
                inner.fail_pending(channel, ProtocolError::Serialization(reason.clone())).await;
                let _ = inner.send(&Frame::response_error(channel, reason)).await;
            }
            (false, decoded) => {
                let reason = match decoded {
                    Ok(_) => "response sent as a request".to_string(),
                    Err(e) => e.to_string(),
                };
                warn!(peer = %inner.name, channel, "Undecodable request: {}", reason);
                let _ = inner.send(&Frame::error(channel, reason)).await;
            }
        }
    }

    inner.closed_tx.send_replace(true);
    // Dropping the senders fails every waiting call with ConnectionClosed.
    inner.pending.lock().await.clear();
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Multiplexing session over one ordered bidirectional message stream
//!
//! A [Session] owns the tunnel table for one transport. Both endpoints run
//! the same engine; the [SessionRole] only selects which parity of tunnel
//! IDs this end allocates, and the injected [TargetResolver] decides where
//! announced tunnels connect.
//!
//! Tunnels close per direction. A graceful close is an end-of-stream marker
//! for the sender's direction, and the table entry lives until both
//! directions have ended. A close carrying an error ends both directions at
//! once and resets the tunnel's buffer, which unwinds its handler.
use std::{
  collections::HashMap,
  pin::Pin,
  sync::{Arc, Mutex, MutexGuard, PoisonError},
  time::Duration,
};

use bytes::Bytes;
use futures::{
  future::{BoxFuture, FutureExt},
  Sink, SinkExt, Stream, StreamExt,
};
use tokio::{
  io::{AsyncRead, AsyncWrite},
  net::TcpListener,
  task::JoinHandle,
};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::{codec::Framed, sync::CancellationToken};
use tracing_futures::Instrument;

use super::protocol::{
  codec::MessageCodec,
  inbound::handle_inbound,
  message::TunnelMessage,
  outbound::handle_outbound,
  target::{Target, TargetResolver},
  tunnel::{
    ArcTunnel, Buffer, BufferError, CloseCode, Parity, ParityGenerator, PortId, TransportError,
    Tunnel, TunnelError, TunnelId,
  },
};
use crate::util::{cancellation::CancellationListener, tunnel_stream::TunnelStream};

const SINK_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Outgoing half of the transport
pub type MessageSink = Pin<Box<dyn Sink<TunnelMessage, Error = TransportError> + Send>>;

/// Which end of the transport a session runs as
///
/// The two ends of one transport must use opposite roles so that their
/// tunnel ID allocations never collide.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SessionRole {
  /// The end that dialed the transport; allocates odd tunnel IDs
  Client,
  /// The end that accepted the transport; allocates even tunnel IDs
  Server,
}

impl SessionRole {
  pub fn parity(self) -> Parity {
    match self {
      SessionRole::Client => Parity::Odd,
      SessionRole::Server => Parity::Even,
    }
  }
}

impl std::fmt::Display for SessionRole {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      SessionRole::Client => f.write_str("client"),
      SessionRole::Server => f.write_str("server"),
    }
  }
}

#[derive(Debug)]
struct TunnelEntry {
  buffer: Arc<Buffer>,
  /// This end sent its graceful close
  local_closed: bool,
  /// The peer sent its graceful close
  remote_closed: bool,
}

impl TunnelEntry {
  fn new(buffer: Arc<Buffer>) -> Self {
    Self {
      buffer,
      local_closed: false,
      remote_closed: false,
    }
  }
}

pub struct Session {
  role: SessionRole,
  resolver: Arc<dyn TargetResolver>,
  ids: ParityGenerator,
  tunnels: Mutex<HashMap<TunnelId, TunnelEntry>>,
  sink: tokio::sync::Mutex<MessageSink>,
  shutdown: CancellationToken,
}

impl std::fmt::Debug for Session {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Session")
      .field("role", &self.role)
      .field("active_tunnels", &self.active_tunnels())
      .field("closed", &self.shutdown.is_cancelled())
      .finish_non_exhaustive()
  }
}

impl Session {
  pub fn new(
    role: SessionRole,
    resolver: Arc<dyn TargetResolver>,
    sink: MessageSink,
  ) -> Arc<Self> {
    Arc::new(Self {
      role,
      resolver,
      ids: ParityGenerator::new(role.parity()),
      tunnels: Mutex::new(HashMap::new()),
      sink: tokio::sync::Mutex::new(sink),
      shutdown: CancellationToken::new(),
    })
  }

  /// Frame `io` with [MessageCodec] and start receiving on it
  ///
  /// The returned handle completes once the session has ended.
  pub fn over_io<IO>(
    role: SessionRole,
    resolver: Arc<dyn TargetResolver>,
    io: IO,
  ) -> (Arc<Self>, JoinHandle<()>)
  where
    IO: AsyncRead + AsyncWrite + Send + 'static,
  {
    let (sink, stream) = Framed::new(io, MessageCodec::new()).split();
    let sink = sink.sink_map_err(|e| Arc::new(e) as TransportError);
    let session = Self::new(role, resolver, Box::pin(sink));
    let receiver = tokio::spawn(Arc::clone(&session).run(stream));
    (session, receiver)
  }

  pub fn role(&self) -> SessionRole {
    self.role
  }

  /// Number of tunnels with at least one direction still open
  pub fn active_tunnels(&self) -> usize {
    self.lock_tunnels().len()
  }

  pub fn is_closed(&self) -> bool {
    self.shutdown.is_cancelled()
  }

  /// Fires once the session has been torn down
  pub fn closed(&self) -> CancellationListener {
    CancellationListener::from(&self.shutdown)
  }

  /// End the session, unwinding every tunnel and handler
  pub fn shutdown(&self) {
    if !self.shutdown.is_cancelled() {
      tracing::info!(role = %self.role, "Shutting down session");
    }
    self.teardown();
  }

  fn teardown(&self) {
    self.shutdown.cancel();
    let entries = std::mem::take(&mut *self.lock_tunnels());
    for (_, entry) in entries {
      entry.buffer.reset();
    }
  }

  fn lock_tunnels(&self) -> MutexGuard<'_, HashMap<TunnelId, TunnelEntry>> {
    self.tunnels.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Send one message; failure of the transport ends the session
  async fn send(&self, message: TunnelMessage) -> Result<(), TunnelError> {
    let mut sink = self.sink.lock().await;
    let sent = tokio::select! {
      biased;
      _ = self.shutdown.cancelled() => return Err(TunnelError::Closed),
      sent = sink.send(message) => sent,
    };
    drop(sink);
    sent.map_err(|e| {
      tracing::error!(role = %self.role, error = %e, "Transport send failed; ending session");
      self.teardown();
      TunnelError::Transport(e)
    })
  }

  /// Receive and demultiplex messages until the stream ends or the session shuts down
  pub async fn run<S, E>(self: Arc<Self>, mut incoming: S)
  where
    S: Stream<Item = Result<TunnelMessage, E>> + Send + Unpin,
    E: std::fmt::Display,
  {
    let span = tracing::info_span!("session", role = %self.role);
    async {
      tracing::debug!("Session receiving");
      loop {
        let next = tokio::select! {
          biased;
          _ = self.shutdown.cancelled() => break,
          next = incoming.next() => next,
        };
        match next {
          Some(Ok(message)) => self.dispatch(message).await,
          Some(Err(e)) => {
            tracing::error!(error = %e, "Transport receive failed");
            break;
          }
          None => {
            tracing::info!("Transport closed by peer");
            break;
          }
        }
      }
      self.teardown();
      // Let the peer observe the end of the transport even while handles remain
      let mut sink = self.sink.lock().await;
      match tokio::time::timeout(SINK_CLOSE_TIMEOUT, sink.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!(error = %e, "Transport close failed"),
        Err(_) => tracing::debug!("Transport close timed out"),
      }
      tracing::debug!("Session ended");
    }
    .instrument(span)
    .await
  }

  async fn dispatch(self: &Arc<Self>, message: TunnelMessage) {
    match message {
      TunnelMessage::NewTunnel { tunnel_id, port } => self.accept_tunnel(tunnel_id, port).await,
      TunnelMessage::Data { tunnel_id, data } => self.deliver(tunnel_id, data).await,
      TunnelMessage::Close {
        tunnel_id,
        code,
        message,
      } => self.remote_close(tunnel_id, code, message),
    }
  }

  async fn accept_tunnel(self: &Arc<Self>, tunnel_id: TunnelId, port: PortId) {
    let refusal = if tunnel_id.parity() == self.role.parity() {
      Some(TunnelError::InvalidTunnelId(tunnel_id))
    } else {
      let buffer = Arc::new(Buffer::new());
      let inserted = {
        let mut tunnels = self.lock_tunnels();
        if tunnels.contains_key(&tunnel_id) {
          false
        } else {
          tunnels.insert(tunnel_id, TunnelEntry::new(Arc::clone(&buffer)));
          true
        }
      };
      if inserted {
        tracing::debug!(tunnel_id = %tunnel_id, port, "Accepted tunnel");
        let tunnel: ArcTunnel = Arc::clone(self) as ArcTunnel;
        let cancel = self.shutdown.clone();
        tokio::spawn(
          async move { handle_outbound(tunnel, tunnel_id, port, buffer, &cancel).await }
            .in_current_span(),
        );
        None
      } else {
        Some(TunnelError::DuplicateTunnelId(tunnel_id))
      }
    };
    if let Some(e) = refusal {
      tracing::warn!(tunnel_id = %tunnel_id, port, error = %e, "Refusing announced tunnel");
      let _ = self.send(TunnelMessage::close(tunnel_id, Some(&e))).await;
    }
  }

  async fn deliver(&self, tunnel_id: TunnelId, data: Bytes) {
    let buffer = match self.lock_tunnels().get(&tunnel_id) {
      Some(entry) if !entry.remote_closed => Arc::clone(&entry.buffer),
      // Already ended in this direction
      _ => return,
    };
    match buffer.put(data, &self.shutdown).await {
      Ok(()) => {}
      Err(BufferError::DeadlineExceeded) => {
        tracing::warn!(tunnel_id = %tunnel_id, "Tunnel is not being drained; closing it");
        self
          .close(tunnel_id, Some(TunnelError::DeadlineExceeded))
          .await
      }
      Err(BufferError::Canceled) | Err(BufferError::Closed) | Err(BufferError::Reset) => {}
    }
  }

  fn remote_close(&self, tunnel_id: TunnelId, code: CloseCode, message: String) {
    let mut tunnels = self.lock_tunnels();
    let entry = match tunnels.get_mut(&tunnel_id) {
      Some(entry) => entry,
      None => return,
    };
    match TunnelError::from_status(code, message) {
      None => {
        tracing::debug!(tunnel_id = %tunnel_id, "Peer finished sending");
        entry.remote_closed = true;
        entry.buffer.close();
        if entry.local_closed {
          tunnels.remove(&tunnel_id);
        }
      }
      Some(e) => {
        tracing::warn!(tunnel_id = %tunnel_id, error = %e, "Tunnel closed by peer");
        if let Some(entry) = tunnels.remove(&tunnel_id) {
          entry.buffer.reset();
        }
      }
    }
  }

  /// Spawn an inbound handler for a connection accepted outside the session
  pub fn handle_inbound<S>(self: &Arc<Self>, connection: S, port: PortId) -> JoinHandle<()>
  where
    S: TunnelStream + 'static,
  {
    let tunnel: ArcTunnel = Arc::clone(self) as ArcTunnel;
    let cancel = self.shutdown.clone();
    tokio::spawn(async move {
      if let Err(e) = handle_inbound(tunnel, connection, port, &cancel).await {
        tracing::warn!(port, error = %e, "Failed to open tunnel for local connection");
      }
    })
  }

  /// Accept local connections on `listener` and tunnel each to `port` until the session ends
  pub async fn serve_listener(
    self: Arc<Self>,
    listener: TcpListener,
    port: PortId,
  ) -> Result<(), std::io::Error> {
    let local_addr = listener.local_addr()?;
    let span = tracing::info_span!("listener", addr = %local_addr, port);
    async {
      tracing::info!("Listening for local connections");
      let mut incoming = TcpListenerStream::new(listener);
      let closed = self.closed();
      while let Some(accepted) = closed.run_until_cancelled(incoming.next()).await {
        match accepted {
          Some(Ok(connection)) => {
            tracing::debug!(peer = ?connection.peer_addr().ok(), "Accepted local connection");
            self.handle_inbound(connection, port);
          }
          Some(Err(e)) => {
            tracing::error!(error = %e, "Listener failed");
            return Err(e);
          }
          None => break,
        }
      }
      tracing::info!("Listener stopped");
      Ok(())
    }
    .instrument(span)
    .await
  }
}

impl Tunnel for Session {
  fn write(&self, tunnel_id: TunnelId, data: Bytes) -> BoxFuture<'_, Result<(), TunnelError>> {
    async move {
      let writable = matches!(
        self.lock_tunnels().get(&tunnel_id),
        Some(entry) if !entry.local_closed
      );
      if !writable {
        return Err(TunnelError::Closed);
      }
      self.send(TunnelMessage::Data { tunnel_id, data }).await
    }
    .boxed()
  }

  fn close(&self, tunnel_id: TunnelId, error: Option<TunnelError>) -> BoxFuture<'_, ()> {
    async move {
      let announce = {
        let mut tunnels = self.lock_tunnels();
        match (tunnels.get_mut(&tunnel_id), &error) {
          (None, _) => false,
          (Some(entry), None) => {
            if entry.local_closed {
              false
            } else {
              entry.local_closed = true;
              if entry.remote_closed {
                tunnels.remove(&tunnel_id);
              }
              true
            }
          }
          (Some(_), Some(_)) => {
            if let Some(entry) = tunnels.remove(&tunnel_id) {
              entry.buffer.reset();
            }
            true
          }
        }
      };
      if !announce {
        return;
      }
      match &error {
        None => tracing::debug!(tunnel_id = %tunnel_id, "Finished sending"),
        Some(e) if e.is_canceled() => tracing::debug!(tunnel_id = %tunnel_id, "Tunnel canceled"),
        Some(e) => tracing::warn!(tunnel_id = %tunnel_id, error = %e, "Closing tunnel"),
      }
      if let Err(e) = self.send(TunnelMessage::close(tunnel_id, error.as_ref())).await {
        tracing::debug!(tunnel_id = %tunnel_id, error = %e, "Close was not delivered");
      }
    }
    .boxed()
  }

  fn target(&self, tunnel_id: TunnelId, port: PortId) -> Result<Target, TunnelError> {
    self
      .resolver
      .resolve(tunnel_id, port)
      .map_err(TunnelError::from)
  }

  fn new_tunnel_id(
    &self,
    port: PortId,
  ) -> BoxFuture<'_, Result<(TunnelId, Arc<Buffer>), TunnelError>> {
    async move {
      if self.is_closed() {
        return Err(TunnelError::Closed);
      }
      let tunnel_id = self.ids.next();
      let buffer = Arc::new(Buffer::new());
      self
        .lock_tunnels()
        .insert(tunnel_id, TunnelEntry::new(Arc::clone(&buffer)));
      if let Err(e) = self.send(TunnelMessage::NewTunnel { tunnel_id, port }).await {
        if let Some(entry) = self.lock_tunnels().remove(&tunnel_id) {
          entry.buffer.reset();
        }
        return Err(e);
      }
      tracing::debug!(tunnel_id = %tunnel_id, port, "Opened tunnel");
      Ok((tunnel_id, buffer))
    }
    .boxed()
  }
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! The tunnel capability shared by both session roles
//!
//! Handlers never touch wire messages directly; they speak to a [Tunnel],
//! which the session implements by translating each call into messages on
//! the multiplexed transport.

use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;

use super::target::{ResolveError, Target};

pub mod buffer;
pub mod id;

pub use self::buffer::{Buffer, BufferError};
pub use self::id::{Parity, ParityGenerator, TunnelId};

/// Application-level selector for the target an outbound tunnel connects to
pub type PortId = u32;

pub type ArcTunnel = Arc<dyn Tunnel + 'static>;

pub type TransportError = Arc<dyn std::error::Error + Send + Sync + 'static>;

pub mod prelude {
  pub use super::{ArcTunnel, Buffer, CloseCode, PortId, Tunnel, TunnelError, TunnelId};
}

/// Status codes carried by close messages
///
/// Numbering follows gRPC status codes so that close reasons read naturally
/// next to errors from the wrapping stream.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CloseCode {
  Ok = 0,
  Canceled = 1,
  Unknown = 2,
  InvalidArgument = 3,
  DeadlineExceeded = 4,
  NotFound = 5,
  AlreadyExists = 6,
  Aborted = 10,
  Unavailable = 14,
}

impl CloseCode {
  pub fn as_u32(self) -> u32 {
    self as u32
  }

  pub fn is_ok(self) -> bool {
    matches!(self, CloseCode::Ok)
  }
}

impl From<u32> for CloseCode {
  fn from(code: u32) -> Self {
    match code {
      0 => CloseCode::Ok,
      1 => CloseCode::Canceled,
      3 => CloseCode::InvalidArgument,
      4 => CloseCode::DeadlineExceeded,
      5 => CloseCode::NotFound,
      6 => CloseCode::AlreadyExists,
      10 => CloseCode::Aborted,
      14 => CloseCode::Unavailable,
      _ => CloseCode::Unknown,
    }
  }
}

impl From<CloseCode> for u32 {
  fn from(code: CloseCode) -> Self {
    code.as_u32()
  }
}

#[derive(thiserror::Error, Debug, Clone)]
pub enum TunnelError {
  #[error("No target is configured for port {0}")]
  NotFound(PortId),
  #[error("Peer is not draining tunnel data fast enough")]
  DeadlineExceeded,
  #[error("Tunnel operation canceled")]
  Canceled,
  #[error("Tunnel is closed")]
  Closed,
  #[error("Tunnel I/O failure: {0}")]
  Io(#[source] Arc<std::io::Error>),
  #[error("Transport failure: {0}")]
  Transport(#[source] TransportError),
  #[error("Tunnel closed by remote with {code:?}: {message}")]
  Remote { code: CloseCode, message: String },
  #[error("Tunnel ID {0} was announced with the receiver's own parity")]
  InvalidTunnelId(TunnelId),
  #[error("Tunnel ID {0} is already in use")]
  DuplicateTunnelId(TunnelId),
}

impl TunnelError {
  /// Translate into the code and message sent to the peer in a close message
  pub fn status(&self) -> (CloseCode, String) {
    let code = match self {
      TunnelError::NotFound(_) => CloseCode::NotFound,
      TunnelError::DeadlineExceeded => CloseCode::DeadlineExceeded,
      TunnelError::Canceled => CloseCode::Canceled,
      TunnelError::Closed => CloseCode::Aborted,
      TunnelError::Io(e) => match e.kind() {
        std::io::ErrorKind::TimedOut => CloseCode::DeadlineExceeded,
        std::io::ErrorKind::ConnectionRefused
        | std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::NotConnected
        | std::io::ErrorKind::AddrNotAvailable => CloseCode::Unavailable,
        _ => CloseCode::Unknown,
      },
      TunnelError::Transport(_) => CloseCode::Unavailable,
      TunnelError::Remote { code, .. } => *code,
      TunnelError::InvalidTunnelId(_) => CloseCode::InvalidArgument,
      TunnelError::DuplicateTunnelId(_) => CloseCode::AlreadyExists,
    };
    let message = match self {
      TunnelError::Remote { message, .. } => message.clone(),
      other => other.to_string(),
    };
    (code, message)
  }

  /// Interpret a close received from the peer; `None` is a graceful end of stream
  pub fn from_status(code: CloseCode, message: impl Into<String>) -> Option<Self> {
    if code.is_ok() {
      None
    } else {
      Some(TunnelError::Remote {
        code,
        message: message.into(),
      })
    }
  }

  pub fn is_canceled(&self) -> bool {
    matches!(self, TunnelError::Canceled)
  }
}

impl From<BufferError> for TunnelError {
  fn from(e: BufferError) -> Self {
    match e {
      BufferError::DeadlineExceeded => TunnelError::DeadlineExceeded,
      BufferError::Canceled => TunnelError::Canceled,
      BufferError::Closed | BufferError::Reset => TunnelError::Closed,
    }
  }
}

impl From<ResolveError> for TunnelError {
  fn from(e: ResolveError) -> Self {
    match e {
      ResolveError::NotFound(port) => TunnelError::NotFound(port),
    }
  }
}

impl From<std::io::Error> for TunnelError {
  fn from(e: std::io::Error) -> Self {
    TunnelError::Io(Arc::new(e))
  }
}

/// Capability contract implemented once per session role
pub trait Tunnel: Send + Sync {
  /// Send a data message for this tunnel over the transport
  fn write(&self, tunnel_id: TunnelId, data: Bytes) -> BoxFuture<'_, Result<(), TunnelError>>;

  /// Send a close message; `None` is a graceful end of stream
  ///
  /// Must tolerate repeated calls and unknown tunnel IDs.
  fn close(&self, tunnel_id: TunnelId, error: Option<TunnelError>) -> BoxFuture<'_, ()>;

  /// Resolve where the outbound connection for this tunnel should go
  fn target(&self, tunnel_id: TunnelId, port: PortId) -> Result<Target, TunnelError>;

  /// Allocate, register, and announce a new tunnel to the peer
  ///
  /// If the announcement cannot be sent the registration is rolled back.
  fn new_tunnel_id(
    &self,
    port: PortId,
  ) -> BoxFuture<'_, Result<(TunnelId, Arc<Buffer>), TunnelError>>;
}

#[cfg(test)]
mod tests {
  use super::{BufferError, CloseCode, TunnelError, TunnelId};

  #[test]
  fn close_codes_survive_numeric_conversion() {
    for code in [
      CloseCode::Ok,
      CloseCode::Canceled,
      CloseCode::InvalidArgument,
      CloseCode::DeadlineExceeded,
      CloseCode::NotFound,
      CloseCode::AlreadyExists,
      CloseCode::Aborted,
      CloseCode::Unavailable,
    ] {
      assert_eq!(CloseCode::from(code.as_u32()), code);
    }
    assert_eq!(CloseCode::from(99), CloseCode::Unknown);
  }

  #[test]
  fn taxonomy_maps_to_status_codes() {
    assert_eq!(TunnelError::NotFound(7).status().0, CloseCode::NotFound);
    assert_eq!(
      TunnelError::from(BufferError::DeadlineExceeded).status().0,
      CloseCode::DeadlineExceeded
    );
    assert_eq!(
      TunnelError::from(BufferError::Canceled).status().0,
      CloseCode::Canceled
    );
    let refused = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
    assert_eq!(TunnelError::from(refused).status().0, CloseCode::Unavailable);
    assert_eq!(
      TunnelError::InvalidTunnelId(TunnelId::new(3)).status().0,
      CloseCode::InvalidArgument
    );
  }

  #[test]
  fn remote_status_round_trips_message() {
    assert!(TunnelError::from_status(CloseCode::Ok, "").is_none());
    let remote = TunnelError::from_status(CloseCode::NotFound, "no such port").unwrap();
    assert_eq!(
      remote.status(),
      (CloseCode::NotFound, String::from("no such port"))
    );
  }
}

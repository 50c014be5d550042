// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Application-level messages carried on the multiplexed transport

use bytes::Bytes;

use super::tunnel::{CloseCode, PortId, TunnelError, TunnelId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelMessage {
  /// The peer must create a buffer for `tunnel_id` and connect it to `port`
  NewTunnel { tunnel_id: TunnelId, port: PortId },
  /// Payload for the buffer of `tunnel_id`
  Data { tunnel_id: TunnelId, data: Bytes },
  /// The sender is done with `tunnel_id`; a code of [CloseCode::Ok] is a graceful end of stream
  Close {
    tunnel_id: TunnelId,
    code: CloseCode,
    message: String,
  },
}

impl TunnelMessage {
  pub fn tunnel_id(&self) -> TunnelId {
    match self {
      TunnelMessage::NewTunnel { tunnel_id, .. }
      | TunnelMessage::Data { tunnel_id, .. }
      | TunnelMessage::Close { tunnel_id, .. } => *tunnel_id,
    }
  }

  pub fn close(tunnel_id: TunnelId, error: Option<&TunnelError>) -> Self {
    let (code, message) = match error {
      None => (CloseCode::Ok, String::new()),
      Some(e) => e.status(),
    };
    TunnelMessage::Close {
      tunnel_id,
      code,
      message,
    }
  }
}

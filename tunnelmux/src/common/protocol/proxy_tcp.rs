// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Raw TCP connections to outbound targets
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use super::tunnel::TunnelError;
use crate::util::tunnel_stream::WrappedStream;

/// Dial `host` (`host:port`), giving up as soon as `cancel` fires
pub async fn connect(host: &str, cancel: &CancellationToken) -> Result<WrappedStream, TunnelError> {
  let span = tracing::span!(tracing::Level::DEBUG, "proxy_tcp", host = %host);
  let fut = async move {
    tracing::debug!(target = "proxy_tcp_connecting", "Connecting to proxy destination");
    let connection = tokio::select! {
      biased;
      _ = cancel.cancelled() => return Err(TunnelError::Canceled),
      connection = TcpStream::connect(host) => connection?,
    };
    // Tunnel chunks are already coalesced; waiting on Nagle only adds latency
    if let Err(e) = connection.set_nodelay(true) {
      tracing::debug!(error = %e, "Failed to disable Nagle on proxy destination");
    }
    tracing::debug!(target = "proxy_tcp_streaming", peer = ?connection.peer_addr().ok(), "Connected");
    Ok(WrappedStream::Tcp(connection))
  };
  fut.instrument(span).await
}

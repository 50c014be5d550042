// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Remote tunnel to real target relay
use std::sync::Arc;

use tokio::io::{AsyncWriteExt, ReadHalf};
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use super::{
  proxy_http, proxy_tcp,
  tunnel::{ArcTunnel, Buffer, PortId, TunnelError, TunnelId},
};
use crate::util::{is_closed_pipe, read_chunk, tunnel_stream::WrappedStream};

/// Connect a newly announced tunnel to its target and relay until it ends
///
/// The tunnel is always closed on return, gracefully if the relay finished
/// cleanly and with the failure otherwise.
pub async fn handle_outbound(
  tunnel: ArcTunnel,
  tunnel_id: TunnelId,
  port: PortId,
  buffer: Arc<Buffer>,
  cancel: &CancellationToken,
) {
  let span = tracing::debug_span!("outbound", tunnel_id = %tunnel_id, port);
  async move {
    let local = cancel.child_token();
    // Stops the background reader on every exit path
    let _reader_guard = local.clone().drop_guard();
    let result = relay(&tunnel, tunnel_id, port, &buffer, &local).await;
    match &result {
      Ok(()) => tracing::debug!("Outbound tunnel finished"),
      Err(e) if e.is_canceled() => tracing::debug!("Outbound tunnel canceled"),
      Err(e) => tracing::warn!(error = %e, "Outbound tunnel failed"),
    }
    tunnel.close(tunnel_id, result.err()).await;
  }
  .instrument(span)
  .await
}

async fn relay(
  tunnel: &ArcTunnel,
  tunnel_id: TunnelId,
  port: PortId,
  buffer: &Buffer,
  local: &CancellationToken,
) -> Result<(), TunnelError> {
  let target = tunnel.target(tunnel_id, port)?;
  let connection = if target.options.tcp {
    buffer
      .interruptible(local, proxy_tcp::connect(&target.host, local))
      .await??
  } else {
    proxy_http::connect(&target, local)
  };
  tracing::debug!(host = %target.host, "Connected to target");

  let (reader, mut writer) = tokio::io::split(connection);
  let mut reader_task = tokio::spawn(
    read_target(Arc::clone(tunnel), tunnel_id, reader, local.clone()).in_current_span(),
  );

  // Every wait on the target also yields to cancellation and tunnel reset
  loop {
    match buffer.take(local).await? {
      Some(data) => buffer.interruptible(local, writer.write_all(&data)).await??,
      None => {
        // The peer is done sending; let the target finish its side
        if let Err(e) = buffer.interruptible(local, writer.shutdown()).await? {
          tracing::debug!(error = %e, "Target half-close failed");
        }
        let _ = buffer.interruptible(local, &mut reader_task).await?;
        return Ok(());
      }
    }
  }
}

/// Relay target output into the tunnel; end of output is sent as a graceful close
async fn read_target(
  tunnel: ArcTunnel,
  tunnel_id: TunnelId,
  mut reader: ReadHalf<WrappedStream>,
  local: CancellationToken,
) {
  loop {
    let chunk = tokio::select! {
      biased;
      _ = local.cancelled() => return,
      chunk = read_chunk(&mut reader) => chunk,
    };
    match chunk {
      Ok(Some(data)) => {
        if let Err(e) = tunnel.write(tunnel_id, data).await {
          tracing::debug!(error = %e, "Tunnel write failed");
          tunnel.close(tunnel_id, Some(e)).await;
          local.cancel();
          return;
        }
      }
      Ok(None) => {
        tunnel.close(tunnel_id, None).await;
        return;
      }
      Err(e) if is_closed_pipe(&e) => {
        tracing::debug!(error = %e, "Target closed its connection");
        tunnel.close(tunnel_id, None).await;
        return;
      }
      Err(e) => {
        tracing::warn!(error = %e, "Target read failed");
        tunnel.close(tunnel_id, Some(e.into())).await;
        local.cancel();
        return;
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use std::{sync::Arc, time::Duration};

  use bytes::Bytes;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio_util::sync::CancellationToken;

  use super::handle_outbound;
  use crate::common::protocol::{
    target::{StaticTargets, Target},
    testing::{drain, written, Recorded, RecordingTunnel},
    tunnel::{ArcTunnel, Buffer, CloseCode, TunnelId},
  };

  async fn echo_target() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let host = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
      let (mut stream, _) = listener.accept().await.unwrap();
      let (mut r, mut w) = stream.split();
      tokio::io::copy(&mut r, &mut w).await.unwrap();
      w.shutdown().await.unwrap();
    });
    host
  }

  #[tokio::test]
  async fn echoes_through_tcp_target() {
    let host = echo_target().await;
    let (tunnel, recorded) = RecordingTunnel::new(StaticTargets::new().with_target(3, Target::tcp(host)));
    let buffer = tunnel.buffer.clone();
    let cancel = CancellationToken::new();
    buffer.put(Bytes::from_static(b"ping"), &cancel).await.unwrap();
    buffer.close();
    let tunnel: ArcTunnel = tunnel;
    tokio::time::timeout(
      Duration::from_secs(5),
      handle_outbound(tunnel, TunnelId::new(2), 3, buffer, &cancel),
    )
    .await
    .expect("outbound handler must finish");
    let events = drain(recorded).await;
    assert_eq!(written(&events), b"ping");
    assert_eq!(events.last(), Some(&Recorded::Close(TunnelId::new(2), CloseCode::Ok)));
  }

  #[tokio::test]
  async fn unconfigured_port_closes_with_not_found() {
    let (tunnel, recorded) = RecordingTunnel::new(StaticTargets::new());
    let buffer = tunnel.buffer.clone();
    handle_outbound(tunnel, TunnelId::new(4), 99, buffer, &CancellationToken::new()).await;
    assert_eq!(
      drain(recorded).await,
      vec![Recorded::Close(TunnelId::new(4), CloseCode::NotFound)]
    );
  }

  #[tokio::test]
  async fn target_closing_first_is_a_half_close() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let host = listener.local_addr().unwrap().to_string();
    let target = tokio::spawn(async move {
      let (mut stream, _) = listener.accept().await.unwrap();
      stream.write_all(b"bye").await.unwrap();
      stream.shutdown().await.unwrap();
      let mut late = Vec::new();
      stream.read_to_end(&mut late).await.unwrap();
      late
    });
    let (tunnel, mut recorded) =
      RecordingTunnel::new(StaticTargets::new().with_target(1, Target::tcp(host)));
    let buffer = tunnel.buffer.clone();
    let cancel = CancellationToken::new();
    let handler = {
      let buffer = buffer.clone();
      let cancel = cancel.clone();
      tokio::spawn(async move {
        handle_outbound(tunnel, TunnelId::new(2), 1, buffer, &cancel).await
      })
    };

    let first = recorded.recv().await.unwrap();
    assert_eq!(first, Recorded::Write(TunnelId::new(2), Bytes::from_static(b"bye")));
    let fin = recorded.recv().await.unwrap();
    assert_eq!(fin, Recorded::Close(TunnelId::new(2), CloseCode::Ok));

    // Bytes still in flight toward the target are delivered after its FIN
    buffer.put(Bytes::from_static(b"late"), &cancel).await.unwrap();
    buffer.close();
    let late = tokio::time::timeout(Duration::from_secs(5), target)
      .await
      .expect("target must see EOF")
      .unwrap();
    assert_eq!(&late, b"late");
    tokio::time::timeout(Duration::from_secs(5), handler)
      .await
      .expect("outbound handler must finish")
      .unwrap();
  }

  /// Target that accepts one connection and never reads from it
  async fn stalled_target() -> (String, tokio::task::JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let host = listener.local_addr().unwrap().to_string();
    let holder = tokio::spawn(async move {
      let (_stream, _) = listener.accept().await.unwrap();
      tokio::time::sleep(Duration::from_secs(60)).await;
    });
    (host, holder)
  }

  /// Keep offering data until the handler stops draining the buffer
  fn flood(buffer: Arc<Buffer>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
      let chunk = Bytes::from(vec![5u8; 64 * 1024]);
      for _ in 0..1024 {
        if buffer.put(chunk.clone(), &cancel).await.is_err() {
          break;
        }
      }
    })
  }

  #[tokio::test]
  async fn cancellation_unwinds_write_to_stalled_target() {
    let (host, holder) = stalled_target().await;
    let (tunnel, _recorded) =
      RecordingTunnel::new(StaticTargets::new().with_target(1, Target::tcp(host)));
    let buffer = tunnel.buffer.clone();
    let cancel = CancellationToken::new();
    let feeder = flood(buffer.clone(), cancel.clone());
    let handler = {
      let (buffer, cancel) = (buffer.clone(), cancel.clone());
      tokio::spawn(async move { handle_outbound(tunnel, TunnelId::new(2), 1, buffer, &cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!handler.is_finished());
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), handler)
      .await
      .expect("blocked target write must observe cancellation")
      .unwrap();
    feeder.await.unwrap();
    holder.abort();
  }

  #[tokio::test]
  async fn reset_unwinds_write_to_stalled_target() {
    let (host, holder) = stalled_target().await;
    let (tunnel, recorded) =
      RecordingTunnel::new(StaticTargets::new().with_target(1, Target::tcp(host)));
    let buffer = tunnel.buffer.clone();
    let cancel = CancellationToken::new();
    let feeder = flood(buffer.clone(), cancel.clone());
    let handler = {
      let (buffer, cancel) = (buffer.clone(), cancel.clone());
      tokio::spawn(async move { handle_outbound(tunnel, TunnelId::new(2), 1, buffer, &cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!handler.is_finished());
    buffer.reset();
    tokio::time::timeout(Duration::from_secs(2), handler)
      .await
      .expect("blocked target write must observe the reset")
      .unwrap();
    feeder.await.unwrap();
    holder.abort();
    let events = drain(recorded).await;
    assert_eq!(
      events.last(),
      Some(&Recorded::Close(TunnelId::new(2), CloseCode::Aborted))
    );
  }
}

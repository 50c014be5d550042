// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Local connection to remote tunnel relay
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use super::tunnel::{ArcTunnel, BufferError, PortId, TunnelError, TunnelId};
use crate::util::{read_chunk, tunnel_stream::TunnelStream};

/// Open a tunnel for an accepted local connection and relay until both directions end
///
/// Fails only if the tunnel cannot be opened; the connection is dropped in
/// that case. Relay failures close the tunnel with the error instead.
pub async fn handle_inbound<S>(
  tunnel: ArcTunnel,
  connection: S,
  port: PortId,
  cancel: &CancellationToken,
) -> Result<TunnelId, TunnelError>
where
  S: TunnelStream + 'static,
{
  let (tunnel_id, buffer) = tunnel.new_tunnel_id(port).await?;
  let span = tracing::debug_span!("inbound", tunnel_id = %tunnel_id, port);
  let relay = async {
    tracing::debug!("Relaying local connection");
    // Either pump failing tears down its sibling
    let local = cancel.child_token();
    let (mut reader, mut writer) = tokio::io::split(connection);

    let downstream = async {
      loop {
        match buffer.take(&local).await {
          Ok(Some(data)) => {
            let written = buffer.interruptible(&local, writer.write_all(&data)).await;
            let failure = match written {
              Ok(Ok(())) => continue,
              Ok(Err(e)) => {
                tracing::debug!(error = %e, "Local write failed");
                TunnelError::from(e)
              }
              Err(e) => TunnelError::from(e),
            };
            tunnel.close(tunnel_id, Some(failure)).await;
            local.cancel();
            break;
          }
          Ok(None) => {
            // Remote finished sending; keep the local-to-remote direction open
            match buffer.interruptible(&local, writer.shutdown()).await {
              Ok(Ok(())) => {}
              Ok(Err(e)) => tracing::debug!(error = %e, "Local half-close failed"),
              Err(_) => local.cancel(),
            }
            break;
          }
          Err(e) => {
            if matches!(e, BufferError::Reset) {
              tracing::debug!("Tunnel reset; dropping local connection");
            }
            tunnel.close(tunnel_id, Some(e.into())).await;
            local.cancel();
            break;
          }
        }
      }
    };

    let upstream = async {
      loop {
        let chunk = match buffer.interruptible(&local, read_chunk(&mut reader)).await {
          Ok(chunk) => chunk,
          Err(_) => break,
        };
        match chunk {
          Ok(Some(data)) => {
            if let Err(e) = tunnel.write(tunnel_id, data).await {
              tracing::debug!(error = %e, "Tunnel write failed");
              tunnel.close(tunnel_id, Some(e)).await;
              local.cancel();
              break;
            }
          }
          Ok(None) => {
            tunnel.close(tunnel_id, None).await;
            break;
          }
          Err(e) => {
            tracing::debug!(error = %e, "Local read failed");
            tunnel.close(tunnel_id, Some(e.into())).await;
            local.cancel();
            break;
          }
        }
      }
    };

    futures::future::join(downstream, upstream).await;
    drop(reader);
    drop(writer);
    tunnel.close(tunnel_id, None).await;
    tracing::debug!("Local connection finished");
  };
  relay.instrument(span).await;
  Ok(tunnel_id)
}

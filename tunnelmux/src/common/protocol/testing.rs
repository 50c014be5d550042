// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! In-process [Tunnel] that records every call for handler tests
use std::{
  convert::Infallible,
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
  },
};

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use http_body_util::Full;
use hyper::{body::Incoming, server::conn::http1, service::service_fn, Request, Response};
use hyper_util::rt::TokioIo;
use tokio::sync::mpsc;

use super::{
  target::{StaticTargets, Target, TargetResolver},
  tunnel::{Buffer, CloseCode, PortId, Tunnel, TunnelError, TunnelId},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
  NewTunnel(PortId),
  Write(TunnelId, Bytes),
  Close(TunnelId, CloseCode),
}

pub struct RecordingTunnel {
  events: mpsc::UnboundedSender<Recorded>,
  pub buffer: Arc<Buffer>,
  targets: StaticTargets,
  next_id: TunnelId,
  pub refuse_new_tunnels: AtomicBool,
}

impl RecordingTunnel {
  pub fn new(targets: StaticTargets) -> (Arc<Self>, mpsc::UnboundedReceiver<Recorded>) {
    let (events, recorded) = mpsc::unbounded_channel();
    let tunnel = Arc::new(Self {
      events,
      buffer: Arc::new(Buffer::new()),
      targets,
      next_id: TunnelId::new(1),
      refuse_new_tunnels: AtomicBool::new(false),
    });
    (tunnel, recorded)
  }

  fn record(&self, event: Recorded) {
    let _ = self.events.send(event);
  }
}

impl Tunnel for RecordingTunnel {
  fn write(&self, tunnel_id: TunnelId, data: Bytes) -> BoxFuture<'_, Result<(), TunnelError>> {
    self.record(Recorded::Write(tunnel_id, data));
    futures::future::ready(Ok(())).boxed()
  }

  fn close(&self, tunnel_id: TunnelId, error: Option<TunnelError>) -> BoxFuture<'_, ()> {
    let code = error.map(|e| e.status().0).unwrap_or(CloseCode::Ok);
    self.record(Recorded::Close(tunnel_id, code));
    futures::future::ready(()).boxed()
  }

  fn target(&self, tunnel_id: TunnelId, port: PortId) -> Result<Target, TunnelError> {
    self
      .targets
      .resolve(tunnel_id, port)
      .map_err(TunnelError::from)
  }

  fn new_tunnel_id(
    &self,
    port: PortId,
  ) -> BoxFuture<'_, Result<(TunnelId, Arc<Buffer>), TunnelError>> {
    let result = if self.refuse_new_tunnels.load(Ordering::SeqCst) {
      Err(TunnelError::Closed)
    } else {
      self.record(Recorded::NewTunnel(port));
      Ok((self.next_id, Arc::clone(&self.buffer)))
    };
    futures::future::ready(result).boxed()
  }
}

/// Route test logs through the test harness; `RUST_LOG` selects the level
pub fn init_tracing() {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .with_test_writer()
    .try_init();
}

/// Collect recorded events until the channel closes
pub async fn drain(mut recorded: mpsc::UnboundedReceiver<Recorded>) -> Vec<Recorded> {
  let mut events = Vec::new();
  while let Some(event) = recorded.recv().await {
    events.push(event);
  }
  events
}

/// Concatenated payload of all writes
pub fn written(events: &[Recorded]) -> Vec<u8> {
  events
    .iter()
    .filter_map(|e| match e {
      Recorded::Write(_, data) => Some(data.as_ref()),
      _ => None,
    })
    .flatten()
    .copied()
    .collect()
}

/// Upstream that reports what it received as the response body
pub async fn start_upstream() -> String {
  let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
  let host = listener.local_addr().unwrap().to_string();
  tokio::spawn(async move {
    while let Ok((stream, _)) = listener.accept().await {
      tokio::spawn(async move {
        let service = service_fn(|request: Request<Incoming>| async move {
          let header = |name: &str| {
            request
              .headers()
              .get(name)
              .and_then(|v| v.to_str().ok())
              .unwrap_or("-")
              .to_string()
          };
          let body = format!(
            "host={} uri={} x-env={} x-drop={}",
            header("host"),
            request.uri(),
            header("x-env"),
            header("x-drop"),
          );
          Ok::<_, Infallible>(
            Response::builder()
              .header("x-upstream", "yes")
              .header("keep-alive", "timeout=5")
              .body(Full::new(Bytes::from(body)))
              .unwrap(),
          )
        });
        let _ = http1::Builder::new()
          .serve_connection(TokioIo::new(stream), service)
          .await;
      });
    }
  });
  host
}

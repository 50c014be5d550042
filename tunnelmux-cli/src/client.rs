// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::Result;
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tunnelmux::{Session, SessionRole};

use crate::{config::InterfaceConfig, dispatch};

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Eq, PartialEq, Clone, Debug)]
pub struct ClientArgs {
  pub transport_host: SocketAddr,
  pub config: PathBuf,
}

/// Exponential reconnect delay, reset once a transport connects
#[derive(Debug, Clone)]
struct Backoff {
  next: Duration,
}

impl Backoff {
  fn new() -> Self {
    Self {
      next: INITIAL_BACKOFF,
    }
  }

  fn next_delay(&mut self) -> Duration {
    let delay = self.next;
    self.next = std::cmp::min(self.next * 2, MAX_BACKOFF);
    delay
  }

  fn reset(&mut self) {
    self.next = INITIAL_BACKOFF;
  }
}

pub async fn client_main(args: ClientArgs, shutdown: CancellationToken) -> Result<()> {
  let config = InterfaceConfig::load(&args.config)?;
  let resolver = Arc::new(config.resolver());
  let slot = Arc::new(dispatch::SessionSlot::new());
  let listener_tasks = dispatch::bind_listeners(&config.listeners, Arc::clone(&slot), shutdown.clone()).await?;
  let mut backoff = Backoff::new();

  while !shutdown.is_cancelled() {
    let connected = tokio::select! {
      _ = shutdown.cancelled() => break,
      connected = TcpStream::connect(args.transport_host) => connected,
    };
    match connected {
      Ok(connection) => {
        backoff.reset();
        if let Err(e) = connection.set_nodelay(true) {
          tracing::debug!(error = %e, "Failed to disable Nagle on transport");
        }
        tracing::info!(transport = %args.transport_host, "Transport connected");
        let (session, mut receiver) =
          Session::over_io(SessionRole::Client, resolver.clone(), connection);
        slot.install(Arc::clone(&session));
        let disconnected = tokio::select! {
          _ = shutdown.cancelled() => false,
          _ = &mut receiver => true,
        };
        if disconnected {
          tracing::warn!(transport = %args.transport_host, "Transport disconnected");
        } else {
          session.shutdown();
          let _ = receiver.await;
        }
        slot.clear(&session);
      }
      Err(e) => {
        tracing::warn!(transport = %args.transport_host, error = %e, "Failed to connect transport");
      }
    }
    if shutdown.is_cancelled() {
      break;
    }
    let delay = backoff.next_delay();
    tracing::info!(delay_ms = delay.as_millis() as u64, "Reconnecting");
    tokio::select! {
      _ = shutdown.cancelled() => break,
      _ = tokio::time::sleep(delay) => {}
    }
  }

  for task in listener_tasks {
    let _ = task.await;
  }
  Ok(())
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context as AnyhowContext, Result};
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;
use tunnelmux::{Session, SessionRole};

use crate::{config::InterfaceConfig, dispatch};

#[derive(Eq, PartialEq, Clone, Debug)]
pub struct ServerArgs {
  pub transport_bind: SocketAddr,
  pub config: PathBuf,
}

pub async fn server_main(args: ServerArgs, shutdown: CancellationToken) -> Result<()> {
  let config = InterfaceConfig::load(&args.config)?;
  let resolver = Arc::new(config.resolver());
  let slot = Arc::new(dispatch::SessionSlot::new());
  let listener_tasks = dispatch::bind_listeners(&config.listeners, Arc::clone(&slot), shutdown.clone()).await?;

  let transport = TcpListener::bind(args.transport_bind)
    .await
    .with_context(|| format!("Failed binding transport listener on {}", args.transport_bind))?;
  tracing::info!(bind = %args.transport_bind, "Accepting transport connections");

  loop {
    let accepted = tokio::select! {
      _ = shutdown.cancelled() => break,
      accepted = transport.accept() => accepted,
    };
    let (connection, peer) = match accepted {
      Ok(accepted) => accepted,
      Err(e) => {
        tracing::warn!(error = %e, "Failed to accept transport connection");
        continue;
      }
    };
    if let Err(e) = connection.set_nodelay(true) {
      tracing::debug!(error = %e, "Failed to disable Nagle on transport");
    }
    let (session, receiver) = Session::over_io(SessionRole::Server, resolver.clone(), connection);
    tracing::info!(%peer, "Transport connected");
    // The newest transport receives locally accepted connections
    if let Some(previous) = slot.current() {
      tracing::info!("Replacing the previous session");
      previous.shutdown();
    }
    slot.install(Arc::clone(&session));
    let slot = Arc::clone(&slot);
    tokio::spawn(
      async move {
        let _ = receiver.await;
        slot.clear(&session);
        tracing::info!("Transport disconnected");
      }
      .instrument(tracing::info_span!("transport", %peer)),
    );
  }

  if let Some(session) = slot.current() {
    session.shutdown();
  }
  for task in listener_tasks {
    let _ = task.await;
  }
  Ok(())
}

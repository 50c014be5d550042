// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Local listeners outlive individual sessions; accepted connections go to whichever session is current
use std::sync::Arc;

use anyhow::{Context as AnyhowContext, Result};
use arc_swap::ArcSwapOption;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;
use tunnelmux::{PortId, Session};

use crate::config::ListenerConfig;

#[derive(Debug, Default)]
pub struct SessionSlot {
  current: ArcSwapOption<Session>,
}

impl SessionSlot {
  pub fn new() -> Self {
    Self::default()
  }

  /// Make `session` the target of newly accepted connections, replacing any previous one
  pub fn install(&self, session: Arc<Session>) {
    self.current.store(Some(session));
  }

  /// Vacate the slot if it still holds `session`
  pub fn clear(&self, session: &Arc<Session>) {
    let current = self.current.load();
    let holds = match &*current {
      Some(current) => Arc::ptr_eq(current, session),
      None => false,
    };
    if holds {
      self.current.store(None);
    }
  }

  /// The installed session, unless it has already ended
  pub fn current(&self) -> Option<Arc<Session>> {
    self
      .current
      .load_full()
      .filter(|session| !session.is_closed())
  }
}

async fn accept_loop(
  listener: TcpListener,
  port: PortId,
  slot: Arc<SessionSlot>,
  shutdown: CancellationToken,
) {
  loop {
    let accepted = tokio::select! {
      _ = shutdown.cancelled() => break,
      accepted = listener.accept() => accepted,
    };
    match accepted {
      Ok((connection, peer)) => match slot.current() {
        Some(session) => {
          tracing::debug!(%peer, "Tunneling local connection");
          session.handle_inbound(connection, port);
        }
        None => {
          tracing::warn!(%peer, "No session is active; dropping local connection");
          drop(connection);
        }
      },
      Err(e) => {
        tracing::warn!(error = %e, "Failed to accept local connection");
      }
    }
  }
}

/// Bind every configured listener, then dispatch accepted connections until `shutdown`
pub async fn bind_listeners(
  listeners: &[ListenerConfig],
  slot: Arc<SessionSlot>,
  shutdown: CancellationToken,
) -> Result<Vec<tokio::task::JoinHandle<()>>> {
  let mut tasks = Vec::with_capacity(listeners.len());
  for config in listeners {
    let listener = TcpListener::bind(config.bind)
      .await
      .with_context(|| format!("Failed binding listener on {}", config.bind))?;
    let span = tracing::info_span!("listener", bind = %config.bind, port = config.port);
    span.in_scope(|| tracing::info!("Listening for local connections"));
    tasks.push(tokio::spawn(
      accept_loop(listener, config.port, Arc::clone(&slot), shutdown.clone()).instrument(span),
    ));
  }
  Ok(tasks)
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use futures::future::Future;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// A [CancellationToken] that cannot be triggered by its recipient
///
/// Handed out by sessions so that observers can wait for teardown or derive
/// child tokens without being able to end the session themselves.
#[derive(Debug, Clone, Default)]
#[repr(transparent)]
pub struct CancellationListener {
  token: CancellationToken,
}

impl CancellationListener {
  pub fn child_token(&self) -> CancellationToken {
    self.token.child_token()
  }

  pub fn is_cancelled(&self) -> bool {
    self.token.is_cancelled()
  }

  pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
    self.token.cancelled()
  }

  /// Drive `fut` to completion unless cancellation fires first
  pub async fn run_until_cancelled<F: Future>(&self, fut: F) -> Option<F::Output> {
    tokio::select! {
      biased;
      _ = self.token.cancelled() => None,
      output = fut => Some(output),
    }
  }
}

impl From<CancellationToken> for CancellationListener {
  fn from(token: CancellationToken) -> Self {
    Self { token }
  }
}

impl From<&CancellationToken> for CancellationListener {
  fn from(token: &CancellationToken) -> Self {
    Self {
      token: token.clone(),
    }
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use tokio_util::sync::CancellationToken;

  use super::CancellationListener;

  #[tokio::test]
  async fn listener_observes_but_children_do_not_propagate_up() {
    let token = CancellationToken::new();
    let listener = CancellationListener::from(&token);
    let child = listener.child_token();
    child.cancel();
    assert!(!listener.is_cancelled());
    token.cancel();
    tokio::time::timeout(Duration::from_secs(1), listener.cancelled())
      .await
      .expect("listener must observe cancellation");
  }

  #[tokio::test]
  async fn run_until_cancelled_abandons_pending_work() {
    let token = CancellationToken::new();
    let listener = CancellationListener::from(token.clone());
    assert_eq!(listener.run_until_cancelled(async { 5 }).await, Some(5));
    token.cancel();
    let pending = futures::future::pending::<()>();
    assert_eq!(listener.run_until_cancelled(pending).await, None);
  }
}

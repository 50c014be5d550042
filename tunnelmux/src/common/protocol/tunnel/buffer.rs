// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Bounded per-tunnel segment queue
//!
//! A [Buffer] is filled by the session's receive loop and drained by the
//! handler writing into the real connection. It is the only source of
//! backpressure in a session: when the drain side stalls, [Buffer::put]
//! stalls the receive loop, which stops reading from the transport.
//!
//! Closing a buffer is an end of stream: queued segments are still handed
//! out. Resetting it discards them and wakes every waiter on the buffer,
//! including handlers blocked on the real connection through [Buffer::interruptible].
use std::{
  collections::VecDeque,
  future::Future,
  sync::{Mutex, MutexGuard, PoisonError},
  time::Duration,
};

use bytes::Bytes;
use tokio::{sync::Notify, time::Instant};
use tokio_util::sync::CancellationToken;

/// Bytes a buffer may hold before non-empty puts begin to wait
pub const BUFFER_CAPACITY: usize = 1024 * 1024;

/// How long a put may wait for room before the peer is considered stalled
pub const PUT_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(thiserror::Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum BufferError {
  #[error("Peer is not draining tunnel data fast enough")]
  DeadlineExceeded,
  #[error("Buffer operation was canceled")]
  Canceled,
  #[error("Buffer is closed")]
  Closed,
  #[error("Tunnel was reset")]
  Reset,
}

#[derive(Debug, Default)]
struct BufferState {
  segments: VecDeque<Bytes>,
  size: usize,
  closed: bool,
  reset: bool,
}

#[derive(Debug)]
pub struct Buffer {
  state: Mutex<BufferState>,
  /// Single-slot signal that a segment was queued or the buffer was closed
  available: Notify,
  /// Single-slot signal that a segment was taken or the buffer was closed
  drained: Notify,
  reset: CancellationToken,
  capacity: usize,
  put_timeout: Duration,
}

impl Default for Buffer {
  fn default() -> Self {
    Self::new()
  }
}

impl Buffer {
  pub fn new() -> Self {
    Self::with_limits(BUFFER_CAPACITY, PUT_TIMEOUT)
  }

  pub fn with_limits(capacity: usize, put_timeout: Duration) -> Self {
    Self {
      state: Mutex::new(BufferState::default()),
      available: Notify::new(),
      drained: Notify::new(),
      reset: CancellationToken::new(),
      capacity,
      put_timeout,
    }
  }

  // The state is plain data, so a panic while it was held cannot leave it torn
  fn lock(&self) -> MutexGuard<'_, BufferState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Queue a segment, waiting for room if the buffer is non-empty and full
  ///
  /// A segment offered to an empty buffer is always accepted, whatever its
  /// size. Otherwise the segment is refused until it fits under the
  /// capacity; if that does not happen within the put timeout the call
  /// fails with [BufferError::DeadlineExceeded] and nothing is queued.
  pub async fn put(&self, data: Bytes, cancel: &CancellationToken) -> Result<(), BufferError> {
    let deadline = Instant::now() + self.put_timeout;
    loop {
      if self.try_put(&data)? {
        self.available.notify_one();
        return Ok(());
      }
      tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(BufferError::Canceled),
        _ = self.drained.notified() => {}
        _ = tokio::time::sleep_until(deadline) => return Err(BufferError::DeadlineExceeded),
      }
    }
  }

  fn try_put(&self, data: &Bytes) -> Result<bool, BufferError> {
    let mut state = self.lock();
    if state.closed {
      return Err(BufferError::Closed);
    }
    if !state.segments.is_empty() && state.size + data.len() > self.capacity {
      return Ok(false);
    }
    state.size += data.len();
    state.segments.push_back(data.clone());
    Ok(true)
  }

  /// Remove the oldest segment, waiting while the buffer is open and empty
  ///
  /// Returns `Ok(None)` once the buffer is closed and fully drained; every
  /// later call returns `Ok(None)` as well. A reset buffer fails with
  /// [BufferError::Reset] instead.
  pub async fn take(&self, cancel: &CancellationToken) -> Result<Option<Bytes>, BufferError> {
    loop {
      match self.try_take()? {
        Some(outcome) => return Ok(outcome),
        None => {
          tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BufferError::Canceled),
            _ = self.available.notified() => {}
          }
        }
      }
    }
  }

  /// `Ok(None)` means "nothing yet"; `Ok(Some(None))` means end of stream
  fn try_take(&self) -> Result<Option<Option<Bytes>>, BufferError> {
    let mut state = self.lock();
    if state.reset {
      return Err(BufferError::Reset);
    }
    match state.segments.pop_front() {
      Some(segment) => {
        state.size -= segment.len();
        drop(state);
        self.drained.notify_one();
        Ok(Some(Some(segment)))
      }
      None if state.closed => Ok(Some(None)),
      None => Ok(None),
    }
  }

  /// Mark the buffer closed; queued segments remain available to [Buffer::take]
  pub fn close(&self) {
    self.lock().closed = true;
    self.available.notify_one();
    self.drained.notify_waiters();
    self.drained.notify_one();
  }

  /// Close the buffer and drop anything still queued
  pub fn reset(&self) {
    {
      let mut state = self.lock();
      state.closed = true;
      state.reset = true;
      state.segments.clear();
      state.size = 0;
    }
    self.reset.cancel();
    self.available.notify_one();
    self.drained.notify_waiters();
    self.drained.notify_one();
  }

  /// Drive `operation` until it completes, `cancel` fires, or the buffer is reset
  pub async fn interruptible<F>(
    &self,
    cancel: &CancellationToken,
    operation: F,
  ) -> Result<F::Output, BufferError>
  where
    F: Future,
  {
    tokio::select! {
      biased;
      _ = cancel.cancelled() => Err(BufferError::Canceled),
      _ = self.reset.cancelled() => Err(BufferError::Reset),
      output = operation => Ok(output),
    }
  }

  pub fn is_closed(&self) -> bool {
    self.lock().closed
  }

  pub fn is_reset(&self) -> bool {
    self.lock().reset
  }

  /// Total bytes currently queued
  pub fn len(&self) -> usize {
    self.lock().size
  }

  pub fn is_empty(&self) -> bool {
    self.lock().segments.is_empty()
  }
}

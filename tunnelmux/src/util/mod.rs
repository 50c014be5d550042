// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

pub mod cancellation;
pub mod tunnel_stream;
pub mod validators;

/// Largest chunk read from a real connection per data message
pub const PROXY_BUFFER_CAPACITY: usize = 1024 * 32;

/// Read the next chunk from `reader`; `None` signals EOF
pub async fn read_chunk<R: AsyncRead + Unpin + ?Sized>(
  reader: &mut R,
) -> Result<Option<Bytes>, std::io::Error> {
  let mut buffer = BytesMut::with_capacity(PROXY_BUFFER_CAPACITY);
  match reader.read_buf(&mut buffer).await? {
    0 => Ok(None),
    _ => Ok(Some(buffer.freeze())),
  }
}

/// Errors that mean the other side went away rather than that I/O failed
pub fn is_closed_pipe(error: &std::io::Error) -> bool {
  matches!(
    error.kind(),
    std::io::ErrorKind::BrokenPipe
      | std::io::ErrorKind::ConnectionReset
      | std::io::ErrorKind::ConnectionAborted
      | std::io::ErrorKind::NotConnected
      | std::io::ErrorKind::UnexpectedEof
  )
}

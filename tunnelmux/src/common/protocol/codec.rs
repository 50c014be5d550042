// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Length-prefixed framing of [TunnelMessage]s over a byte stream
//!
//! Frame layout: `u32` body length, then the body:
//! `u8` kind, `u64` tunnel ID, and a kind-specific tail.
//! - NewTunnel: `u32` port
//! - Data: the remaining bytes are payload
//! - Close: `u32` status code, the remaining bytes are a UTF-8 message

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::{
  message::TunnelMessage,
  tunnel::{CloseCode, TunnelId},
};

/// Largest accepted frame body
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

const LENGTH_SIZE: usize = std::mem::size_of::<u32>();
const HEADER_SIZE: usize = std::mem::size_of::<u8>() + std::mem::size_of::<u64>();

const KIND_NEW_TUNNEL: u8 = 1;
const KIND_DATA: u8 = 2;
const KIND_CLOSE: u8 = 3;

#[derive(thiserror::Error, Debug)]
pub enum CodecError {
  #[error("Frame length exceeded maximum of {maximum} bytes with {length}")]
  FrameTooLarge { maximum: usize, length: usize },
  #[error("Frame of {length} bytes is too short for a {kind} message")]
  Truncated { kind: &'static str, length: usize },
  #[error("Unknown message kind {0}")]
  UnknownKind(u8),
  #[error("Close message is not valid UTF-8: {0}")]
  InvalidMessage(#[from] std::string::FromUtf8Error),
  #[error("Frame I/O failure: {0}")]
  Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy)]
pub struct MessageCodec {
  max_frame_length: usize,
}

impl Default for MessageCodec {
  fn default() -> Self {
    Self::new()
  }
}

impl MessageCodec {
  pub fn new() -> Self {
    Self::with_max_frame_length(MAX_FRAME_LENGTH)
  }

  pub fn with_max_frame_length(max_frame_length: usize) -> Self {
    Self { max_frame_length }
  }

  fn body_length(message: &TunnelMessage) -> usize {
    HEADER_SIZE
      + match message {
        TunnelMessage::NewTunnel { .. } => std::mem::size_of::<u32>(),
        TunnelMessage::Data { data, .. } => data.len(),
        TunnelMessage::Close { message, .. } => std::mem::size_of::<u32>() + message.len(),
      }
  }
}

impl Encoder<TunnelMessage> for MessageCodec {
  type Error = CodecError;

  fn encode(&mut self, item: TunnelMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
    let length = Self::body_length(&item);
    // Refuse before writing anything, so the stream is never left mid-frame
    if length > self.max_frame_length {
      return Err(CodecError::FrameTooLarge {
        maximum: self.max_frame_length,
        length,
      });
    }
    dst.reserve(LENGTH_SIZE + length);
    dst.put_u32(length as u32);
    match item {
      TunnelMessage::NewTunnel { tunnel_id, port } => {
        dst.put_u8(KIND_NEW_TUNNEL);
        dst.put_u64(tunnel_id.inner());
        dst.put_u32(port);
      }
      TunnelMessage::Data { tunnel_id, data } => {
        dst.put_u8(KIND_DATA);
        dst.put_u64(tunnel_id.inner());
        dst.put_slice(&data);
      }
      TunnelMessage::Close {
        tunnel_id,
        code,
        message,
      } => {
        dst.put_u8(KIND_CLOSE);
        dst.put_u64(tunnel_id.inner());
        dst.put_u32(code.as_u32());
        dst.put_slice(message.as_bytes());
      }
    }
    Ok(())
  }
}

impl Decoder for MessageCodec {
  type Item = TunnelMessage;
  type Error = CodecError;

  fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
    if src.len() < LENGTH_SIZE {
      return Ok(None);
    }
    let mut length_bytes = [0u8; LENGTH_SIZE];
    length_bytes.copy_from_slice(&src[..LENGTH_SIZE]);
    let length = u32::from_be_bytes(length_bytes) as usize;
    if length > self.max_frame_length {
      return Err(CodecError::FrameTooLarge {
        maximum: self.max_frame_length,
        length,
      });
    }
    if src.len() < LENGTH_SIZE + length {
      src.reserve(LENGTH_SIZE + length - src.len());
      return Ok(None);
    }
    src.advance(LENGTH_SIZE);
    let mut body = src.split_to(length);
    if body.len() < HEADER_SIZE {
      return Err(CodecError::Truncated {
        kind: "tunnel",
        length,
      });
    }
    let kind = body.get_u8();
    let tunnel_id = TunnelId::new(body.get_u64());
    let message = match kind {
      KIND_NEW_TUNNEL => {
        if body.remaining() < std::mem::size_of::<u32>() {
          return Err(CodecError::Truncated {
            kind: "new tunnel",
            length,
          });
        }
        TunnelMessage::NewTunnel {
          tunnel_id,
          port: body.get_u32(),
        }
      }
      KIND_DATA => TunnelMessage::Data {
        tunnel_id,
        data: body.freeze(),
      },
      KIND_CLOSE => {
        if body.remaining() < std::mem::size_of::<u32>() {
          return Err(CodecError::Truncated {
            kind: "close",
            length,
          });
        }
        let code = CloseCode::from(body.get_u32());
        TunnelMessage::Close {
          tunnel_id,
          code,
          message: String::from_utf8(body.to_vec())?,
        }
      }
      unknown => return Err(CodecError::UnknownKind(unknown)),
    };
    Ok(Some(message))
  }
}

#[cfg(test)]
mod tests {
  use bytes::{BufMut, Bytes, BytesMut};
  use futures::{SinkExt, StreamExt};
  use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};

  use super::{CodecError, MessageCodec};
  use crate::common::protocol::{
    message::TunnelMessage,
    tunnel::{CloseCode, TunnelId},
  };

  #[tokio::test]
  async fn messages_cross_a_byte_stream_intact() {
    let (near, far) = tokio::io::duplex(64);
    let messages = vec![
      TunnelMessage::NewTunnel {
        tunnel_id: TunnelId::new(1),
        port: 8080,
      },
      TunnelMessage::Data {
        tunnel_id: TunnelId::new(1),
        data: Bytes::from(vec![9u8; 1000]),
      },
      TunnelMessage::Data {
        tunnel_id: TunnelId::new(2),
        data: Bytes::new(),
      },
      TunnelMessage::Close {
        tunnel_id: TunnelId::new(1),
        code: CloseCode::DeadlineExceeded,
        message: String::from("peer stalled"),
      },
    ];
    let writer = {
      let messages = messages.clone();
      tokio::spawn(async move {
        let mut sink = FramedWrite::new(near, MessageCodec::new());
        for message in messages {
          sink.send(message).await.unwrap();
        }
      })
    };
    let received = FramedRead::new(far, MessageCodec::new())
      .map(Result::unwrap)
      .collect::<Vec<_>>()
      .await;
    writer.await.unwrap();
    assert_eq!(received, messages);
  }

  #[test]
  fn partial_frames_wait_for_more_input() {
    let mut codec = MessageCodec::new();
    let mut encoded = BytesMut::new();
    codec
      .encode(
        TunnelMessage::NewTunnel {
          tunnel_id: TunnelId::new(4),
          port: 1,
        },
        &mut encoded,
      )
      .unwrap();
    let mut partial = BytesMut::from(&encoded[..encoded.len() - 1]);
    assert!(codec.decode(&mut partial).unwrap().is_none());
    partial.put_u8(encoded[encoded.len() - 1]);
    assert!(codec.decode(&mut partial).unwrap().is_some());
    assert!(partial.is_empty());
  }

  #[test]
  fn oversized_frames_are_refused_without_writing() {
    let mut codec = MessageCodec::with_max_frame_length(32);
    let mut dst = BytesMut::new();
    let result = codec.encode(
      TunnelMessage::Data {
        tunnel_id: TunnelId::new(1),
        data: Bytes::from(vec![0u8; 64]),
      },
      &mut dst,
    );
    assert!(matches!(result, Err(CodecError::FrameTooLarge { .. })));
    assert!(dst.is_empty());

    let mut incoming = BytesMut::new();
    incoming.put_u32(1024);
    assert!(matches!(
      codec.decode(&mut incoming),
      Err(CodecError::FrameTooLarge { .. })
    ));
  }

  #[test]
  fn unknown_kinds_are_rejected() {
    let mut codec = MessageCodec::new();
    let mut incoming = BytesMut::new();
    incoming.put_u32(9);
    incoming.put_u8(42);
    incoming.put_u64(1);
    assert!(matches!(
      codec.decode(&mut incoming),
      Err(CodecError::UnknownKind(42))
    ));
  }
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! HTTP reverse proxy exposed as an ordinary byte stream
//!
//! [connect] serves a reverse proxy over one end of an in-memory pipe and
//! returns the other end, so outbound tunnels pump bytes through it exactly
//! as they would through a TCP socket. Each pipe carries one HTTP/1
//! connection and keeps at most one upstream connection open for reuse.
use std::{convert::Infallible, sync::Arc};

use bytes::Bytes;
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Full};
use hyper::{
  body::Incoming,
  client::conn::http1 as client_http1,
  header::{self, HeaderMap, HeaderName, HeaderValue},
  server::conn::http1 as server_http1,
  service::service_fn,
  Request, Response, StatusCode, Uri,
};
use hyper_util::rt::TokioIo;
use tokio::{io::DuplexStream, net::TcpStream, sync::Mutex};
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use super::target::Target;
use crate::util::{tunnel_stream::WrappedStream, PROXY_BUFFER_CAPACITY};

type ProxyBody = UnsyncBoxBody<Bytes, hyper::Error>;

/// Headers that describe a single hop and are never forwarded
const HOP_BY_HOP_HEADERS: &[&str] = &[
  "connection",
  "keep-alive",
  "proxy-connection",
  "te",
  "trailer",
  "transfer-encoding",
  "upgrade",
  "proxy-authenticate",
  "proxy-authorization",
];

#[derive(thiserror::Error, Debug)]
enum ProxyError {
  #[error("Failed to connect to {host}: {source}")]
  Connect {
    host: String,
    #[source]
    source: std::io::Error,
  },
  #[error("Upstream HTTP failure: {0}")]
  Http(#[from] hyper::Error),
  #[error("Invalid upstream URI: {0}")]
  Uri(#[from] hyper::http::uri::InvalidUri),
}

struct HttpProxy {
  target: Target,
  /// Extra headers parsed once per pipe
  headers: HeaderMap,
  cors_allow_origin: Option<HeaderValue>,
  upstream: Mutex<Option<client_http1::SendRequest<Incoming>>>,
}

impl HttpProxy {
  fn new(target: Target) -> Self {
    let mut headers = HeaderMap::new();
    for (name, value) in target.options.headers.iter() {
      match (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
      ) {
        (Ok(name), Ok(value)) => {
          headers.insert(name, value);
        }
        _ => tracing::warn!(header = %name, "Ignoring invalid configured header"),
      }
    }
    let cors_allow_origin = target
      .options
      .cors_allow_origin
      .as_deref()
      .and_then(|origin| match HeaderValue::from_str(origin) {
        Ok(value) => Some(value),
        Err(_) => {
          tracing::warn!(origin = %origin, "Ignoring invalid CORS allow-origin");
          None
        }
      });
    Self {
      target,
      headers,
      cors_allow_origin,
      upstream: Mutex::new(None),
    }
  }

  /// Reuse the upstream connection if it is still usable, otherwise dial a new one
  async fn sender(&self) -> Result<client_http1::SendRequest<Incoming>, ProxyError> {
    let cached = self.upstream.lock().await.take();
    if let Some(mut sender) = cached {
      if sender.ready().await.is_ok() {
        tracing::trace!("Reusing upstream connection");
        return Ok(sender);
      }
      tracing::debug!("Discarding closed upstream connection");
    }
    let host = &self.target.host;
    let stream = TcpStream::connect(host)
      .await
      .map_err(|source| ProxyError::Connect {
        host: host.clone(),
        source,
      })?;
    let (sender, connection) = client_http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(
      async move {
        if let Err(e) = connection.await {
          tracing::debug!(error = %e, "Upstream connection closed");
        }
      }
      .in_current_span(),
    );
    Ok(sender)
  }

  async fn forward(&self, request: Request<Incoming>) -> Result<Response<ProxyBody>, ProxyError> {
    let (mut parts, body) = request.into_parts();
    let path_and_query = parts
      .uri
      .path_and_query()
      .map(|p| p.as_str())
      .unwrap_or("/")
      .to_string();
    // Origin-form on the wire; the connection itself already goes to the target
    parts.uri = path_and_query.parse::<Uri>()?;
    strip_hop_by_hop(&mut parts.headers);
    if self.target.options.change_origin || !parts.headers.contains_key(header::HOST) {
      match HeaderValue::from_str(&self.target.host) {
        Ok(host) => {
          parts.headers.insert(header::HOST, host);
        }
        Err(_) => tracing::warn!(host = %self.target.host, "Target host is not a valid header"),
      }
    }
    for (name, value) in self.headers.iter() {
      parts.headers.insert(name.clone(), value.clone());
    }
    tracing::debug!(method = %parts.method, path = %path_and_query, "Proxying request");

    let mut sender = self.sender().await?;
    let response = sender.send_request(Request::from_parts(parts, body)).await?;
    *self.upstream.lock().await = Some(sender);

    let (mut parts, body) = response.into_parts();
    strip_hop_by_hop(&mut parts.headers);
    if let Some(origin) = &self.cors_allow_origin {
      parts
        .headers
        .insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
    }
    tracing::debug!(status = %parts.status, "Proxied response");
    Ok(Response::from_parts(parts, body.boxed_unsync()))
  }

  async fn handle(self: Arc<Self>, request: Request<Incoming>) -> Response<ProxyBody> {
    match self.forward(request).await {
      Ok(response) => response,
      Err(e) => {
        tracing::warn!(error = %e, host = %self.target.host, "Upstream request failed");
        bad_gateway(&e)
      }
    }
  }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
  // Headers listed in `Connection` are hop-by-hop for this message too
  let listed = headers
    .get_all(header::CONNECTION)
    .iter()
    .filter_map(|value| value.to_str().ok())
    .flat_map(|value| value.split(','))
    .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
    .collect::<Vec<_>>();
  for name in listed {
    headers.remove(name);
  }
  for name in HOP_BY_HOP_HEADERS {
    headers.remove(*name);
  }
}

fn bad_gateway(error: &ProxyError) -> Response<ProxyBody> {
  let body = Full::new(Bytes::from(format!("Bad Gateway: {}\n", error)))
    .map_err(|never| match never {})
    .boxed_unsync();
  let mut response = Response::new(body);
  *response.status_mut() = StatusCode::BAD_GATEWAY;
  response.headers_mut().insert(
    header::CONTENT_TYPE,
    HeaderValue::from_static("text/plain; charset=utf-8"),
  );
  response
}

async fn serve(proxy: Arc<HttpProxy>, pipe: DuplexStream, cancel: CancellationToken) {
  let service = service_fn(move |request| {
    let proxy = Arc::clone(&proxy);
    async move { Ok::<_, Infallible>(proxy.handle(request).await) }
  });
  let mut builder = server_http1::Builder::new();
  // The tunnel's FIN must not abort a response that is still being written
  builder.half_close(true);
  let connection = builder.serve_connection(TokioIo::new(pipe), service);
  tokio::select! {
    _ = cancel.cancelled() => tracing::debug!("HTTP proxy canceled"),
    result = connection => match result {
      Ok(()) => tracing::debug!("HTTP proxy connection finished"),
      Err(e) => tracing::debug!(error = %e, "HTTP proxy connection failed"),
    },
  }
}

/// Start a reverse proxy to `target` and return the connection end of its pipe
///
/// The proxy stops when the returned stream is dropped or `cancel` fires.
pub fn connect(target: &Target, cancel: &CancellationToken) -> WrappedStream {
  let (near, far) = tokio::io::duplex(PROXY_BUFFER_CAPACITY * 2);
  let span = tracing::span!(tracing::Level::DEBUG, "proxy_http", host = %target.host);
  let proxy = Arc::new(HttpProxy::new(target.clone()));
  tokio::spawn(serve(proxy, far, cancel.child_token()).instrument(span));
  WrappedStream::DuplexStream(near)
}

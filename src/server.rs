//! HTTP listener that routes every request through fetch interception.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Router;
use color_eyre::{eyre::eyre, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::cache::{
  header_entry, is_hop_by_hop, CacheRequest, CacheStorage, CachedResponse, OfflineWorker,
  RequestKey,
};
use crate::network::Network;

/// Upper bound on request bodies forwarded to the network.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

pub fn router<S, N>(worker: Arc<OfflineWorker<S, N>>) -> Router
where
  S: CacheStorage + 'static,
  N: Network + 'static,
{
  Router::new()
    .fallback(intercept::<S, N>)
    .with_state(worker)
}

/// Bind `addr` and serve until Ctrl-C.
pub async fn run_server<S, N>(worker: Arc<OfflineWorker<S, N>>, addr: SocketAddr) -> Result<()>
where
  S: CacheStorage + 'static,
  N: Network + 'static,
{
  let listener = TcpListener::bind(addr)
    .await
    .map_err(|e| eyre!("Failed to bind {}: {}", addr, e))?;

  info!(%addr, cache = %worker.cache_name(), "Intercepting requests");

  axum::serve(listener, router(worker))
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|e| eyre!("Server error: {}", e))?;

  Ok(())
}

async fn shutdown_signal() {
  if let Err(e) = tokio::signal::ctrl_c().await {
    warn!(error = %e, "Failed to listen for Ctrl-C");
    std::future::pending::<()>().await;
  }
  info!("Shutting down");
}

async fn intercept<S, N>(
  State(worker): State<Arc<OfflineWorker<S, N>>>,
  request: Request,
) -> Response
where
  S: CacheStorage + 'static,
  N: Network + 'static,
{
  let request = match to_cache_request(request).await {
    Ok(request) => request,
    Err(e) => {
      warn!(error = %e, "Rejected request");
      return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
    }
  };

  match worker.handle_fetch(&request).await {
    Ok(outcome) => {
      debug!(
        key = %request.key,
        source = ?outcome.source,
        status = outcome.response.status,
        "Served"
      );
      to_http_response(outcome.response)
    }
    Err(e) => {
      warn!(key = %request.key, error = %e, "Fetch failed");
      (StatusCode::BAD_GATEWAY, format!("Fetch failed: {}", e)).into_response()
    }
  }
}

async fn to_cache_request(request: Request) -> Result<CacheRequest> {
  let (parts, body) = request.into_parts();

  let url = parts
    .uri
    .path_and_query()
    .map(|pq| pq.as_str())
    .unwrap_or("/");
  let key = RequestKey::new(parts.method.as_str(), url);

  let headers = parts
    .headers
    .iter()
    .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
    .filter_map(|(name, value)| header_entry(name.as_str(), value.as_bytes()))
    .collect();

  let body = axum::body::to_bytes(body, MAX_BODY_BYTES)
    .await
    .map_err(|e| eyre!("Failed to read request body: {}", e))?;

  Ok(
    CacheRequest::new(key)
      .with_headers(headers)
      .with_body(body.to_vec()),
  )
}

fn to_http_response(response: CachedResponse) -> Response {
  let status = match StatusCode::from_u16(response.status) {
    Ok(status) => status,
    Err(_) => {
      warn!(status = response.status, "Invalid upstream status");
      return StatusCode::BAD_GATEWAY.into_response();
    }
  };

  let mut builder = axum::http::Response::builder().status(status);
  for (name, value) in &response.headers {
    // Length is recomputed from the body
    if is_hop_by_hop(name) || name.eq_ignore_ascii_case("content-length") {
      continue;
    }
    builder = builder.header(name.as_str(), value.as_str());
  }

  match builder.body(Body::from(response.body)) {
    Ok(response) => response,
    Err(e) => {
      warn!(error = %e, "Invalid upstream response");
      StatusCode::BAD_GATEWAY.into_response()
    }
  }
}

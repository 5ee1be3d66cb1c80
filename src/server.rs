//! Health and metrics HTTP endpoints.
//!
//! Two plain HTTP/1 listeners: `/healthz`, `/livez` and `/readyz` on the
//! health address, `/metrics` on the metrics address. Both stop accepting
//! connections when the shared cancellation token fires.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::domain::events::DomainEvent;
use crate::domain::ports::{ContentStore, EventPublisher, FastCache};
use crate::error::{Error, Result};
use crate::metrics;

type HttpResponse = std::result::Result<Response<Full<Bytes>>, Infallible>;

/// Dependency probe behind `/readyz`.
pub struct Readiness {
    cache: Arc<dyn FastCache>,
    store: Arc<dyn ContentStore>,
    events: Arc<dyn EventPublisher>,
    last: AtomicBool,
}

impl Readiness {
    pub fn new(
        cache: Arc<dyn FastCache>,
        store: Arc<dyn ContentStore>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            cache,
            store,
            events,
            last: AtomicBool::new(true),
        }
    }

    /// Probe both stores. Emits `HealthChanged` when the answer flips.
    pub async fn check(&self) -> bool {
        let cache_ok = self.cache.health_check().await.unwrap_or(false);
        let store_ok = self.store.health_check().await.unwrap_or(false);
        let ready = cache_ok && store_ok;

        if self.last.swap(ready, Ordering::SeqCst) != ready {
            let reason = (!ready).then(|| format!("fast_cache={} primary_store={}", cache_ok, store_ok));
            let _ = self
                .events
                .publish(DomainEvent::health_changed("dependencies", ready, reason))
                .await;
        }
        ready
    }
}

/// Parse and bind a listen address.
pub async fn bind(addr: &str) -> Result<TcpListener> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Config(format!("Invalid listen address '{}': {}", addr, e)))?;
    let listener = TcpListener::bind(addr).await?;
    Ok(listener)
}

fn respond(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

async fn health_routes(req: Request<Incoming>, readiness: Arc<Readiness>) -> HttpResponse {
    let response = match req.uri().path() {
        "/healthz" | "/livez" => respond(StatusCode::OK, "ok"),
        "/readyz" => {
            if readiness.check().await {
                respond(StatusCode::OK, "ok")
            } else {
                respond(StatusCode::SERVICE_UNAVAILABLE, "not ready")
            }
        }
        _ => respond(StatusCode::NOT_FOUND, "not found"),
    };
    Ok(response)
}

async fn metrics_routes(req: Request<Incoming>) -> HttpResponse {
    if req.uri().path() != "/metrics" {
        return Ok(respond(StatusCode::NOT_FOUND, "not found"));
    }

    let response = match metrics::encode_text() {
        Ok((content_type, body)) => {
            let mut response = respond(StatusCode::OK, body);
            if let Ok(value) = HeaderValue::from_str(&content_type) {
                response.headers_mut().insert(CONTENT_TYPE, value);
            }
            response
        }
        Err(e) => {
            error!("Metrics encoding failed: {}", e);
            respond(StatusCode::INTERNAL_SERVER_ERROR, "metrics unavailable")
        }
    };
    Ok(response)
}

async fn serve<H, F>(
    name: &'static str,
    listener: TcpListener,
    cancel: CancellationToken,
    handler: H,
) -> Result<()>
where
    H: Fn(Request<Incoming>) -> F + Clone + Send + Sync + 'static,
    F: Future<Output = HttpResponse> + Send + 'static,
{
    info!("{} server listening on {}", name, listener.local_addr()?);

    loop {
        let (stream, _) = tokio::select! {
            _ = cancel.cancelled() => {
                info!("{} server stopped", name);
                return Ok(());
            }
            accepted = listener.accept() => accepted?,
        };

        let io = TokioIo::new(stream);
        let handler = handler.clone();
        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handler))
                .await
            {
                debug!("{} server connection error: {}", name, e);
            }
        });
    }
}

pub async fn run_health_server(
    listener: TcpListener,
    readiness: Arc<Readiness>,
    cancel: CancellationToken,
) -> Result<()> {
    serve("Health", listener, cancel, move |req| {
        health_routes(req, readiness.clone())
    })
    .await
}

pub async fn run_metrics_server(listener: TcpListener, cancel: CancellationToken) -> Result<()> {
    metrics::register_all();
    serve("Metrics", listener, cancel, metrics_routes).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::event_publisher::InMemoryEventCollector;
    use crate::adapters::memory::{InMemoryContentStore, InMemoryFastCache};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            path
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_readiness_flips_and_reports() {
        let cache = Arc::new(InMemoryFastCache::new());
        let store = Arc::new(InMemoryContentStore::new());
        let events = Arc::new(InMemoryEventCollector::new());
        let readiness = Readiness::new(cache.clone(), store.clone(), events.clone());

        assert!(readiness.check().await);
        assert!(events.is_empty());

        store.set_available(false);
        assert!(!readiness.check().await);
        assert!(!readiness.check().await);
        assert_eq!(events.events_of_type("HealthChanged").len(), 1);

        store.set_available(true);
        assert!(readiness.check().await);
        assert_eq!(events.events_of_type("HealthChanged").len(), 2);
    }

    #[tokio::test]
    async fn test_health_endpoints_and_shutdown() {
        let cache = Arc::new(InMemoryFastCache::new());
        let readiness = Arc::new(Readiness::new(
            cache.clone(),
            Arc::new(InMemoryContentStore::new()),
            Arc::new(InMemoryEventCollector::new()),
        ));

        let listener = bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let server = tokio::spawn(run_health_server(listener, readiness, cancel.clone()));

        assert!(get(addr, "/healthz").await.starts_with("HTTP/1.1 200"));
        assert!(get(addr, "/readyz").await.starts_with("HTTP/1.1 200"));
        assert!(get(addr, "/nope").await.starts_with("HTTP/1.1 404"));

        cache.set_available(false);
        assert!(get(addr, "/readyz").await.starts_with("HTTP/1.1 503"));

        cancel.cancel();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let listener = bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let server = tokio::spawn(run_metrics_server(listener, cancel.clone()));

        let response = get(addr, "/metrics").await;
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("qbank_"));

        cancel.cancel();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bind_rejects_bad_address() {
        assert!(matches!(bind("not-an-address").await, Err(Error::Config(_))));
    }
}

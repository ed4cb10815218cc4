// ────────────────────────────────
// src/proxy/proxy.rs
// One request/response exchange against a pooled backend
// ────────────────────────────────

use bytes::Bytes;
use hyper::header::{HeaderValue, CONNECTION};
use hyper::{Request, Response, StatusCode};
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

use super::{Backend, BackendPool, TcpConnector};
use crate::codec::{self, CodecError, Limits};
use crate::config::{Config, ProxyConfig};
use crate::metrics::MetricsCollector;
use crate::stats::StatsAggregator;

/// Response header carrying the cumulative byte count for the request path.
pub const X_BYTES: &str = "x-bytes";

pub struct Proxy {
    pool: Arc<BackendPool>,
    stats: Arc<StatsAggregator>,
    metrics: Arc<MetricsCollector>,
    limits: Limits,
    exchange_timeout: Option<Duration>,
}

impl Proxy {
    pub fn new(
        config: &ProxyConfig,
        pool: Arc<BackendPool>,
        stats: Arc<StatsAggregator>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            pool,
            stats,
            metrics,
            limits: config.limits(),
            exchange_timeout: config.exchange_timeout(),
        }
    }

    /// Wires a TCP pool and a fresh aggregator from configuration.
    pub fn from_config(config: &Config, metrics: Arc<MetricsCollector>) -> Self {
        let connector = Arc::new(TcpConnector::new(
            config.upstream.clone(),
            config.proxy.connect_timeout(),
        ));
        let pool = Arc::new(BackendPool::new(&config.pool, connector, metrics.clone()));
        Self::new(&config.proxy, pool, Arc::new(StatsAggregator::new()), metrics)
    }

    pub fn pool(&self) -> &Arc<BackendPool> {
        &self.pool
    }

    pub fn stats(&self) -> &Arc<StatsAggregator> {
        &self.stats
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Forwards `request` over a pooled backend and returns the annotated
    /// response together with the backend, which the caller releases once
    /// the response has been delivered.
    ///
    /// A backend that fails mid-exchange is closed here and never pooled.
    pub async fn forward(
        &self,
        request: &Request<Bytes>,
    ) -> Result<(Response<Bytes>, Backend), ProxyError> {
        let mut backend = self.pool.acquire().await?;
        let started = Instant::now();

        let result = match self.exchange_timeout {
            Some(limit) => tokio::time::timeout(limit, self.round_trip(&mut backend, request))
                .await
                .unwrap_or(Err(ProxyError::Timeout(limit))),
            None => self.round_trip(&mut backend, request).await,
        };
        self.metrics.record_exchange(result.is_ok(), started.elapsed());

        match result {
            Ok(mut response) => {
                self.annotate(request, &mut response);
                Ok((response, backend))
            }
            Err(e) => {
                warn!(backend = backend.id(), error = %e, "abandoning backend");
                self.pool.discard(backend, "exchange_failed").await;
                Err(e)
            }
        }
    }

    async fn round_trip(
        &self,
        backend: &mut Backend,
        request: &Request<Bytes>,
    ) -> Result<Response<Bytes>, ProxyError> {
        backend
            .write_request(request)
            .await
            .map_err(ProxyError::BackendWrite)?;
        backend
            .read_response(request.method(), &self.limits)
            .await
            .map_err(ProxyError::BackendRead)
    }

    /// Adds the response's length to the path total, stamps the new total
    /// as `X-Bytes` and marks the response as closing the exchange.
    pub fn annotate(&self, request: &Request<Bytes>, response: &mut Response<Bytes>) -> u64 {
        let length = counted_length(response);
        let total = self.stats.update(request.uri().path(), length);

        let headers = response.headers_mut();
        headers.insert(X_BYTES, HeaderValue::from(total));
        headers.insert(CONNECTION, HeaderValue::from_static("close"));

        self.metrics
            .record_request(request.method().as_str(), response.status().as_u16(), length);
        total
    }
}

/// Bytes a response adds to its path total.
///
/// 1xx, 204 and 304 responses count 0 whatever they declare. Otherwise the
/// declared `Content-Length` counts, which keeps HEAD responses at the length
/// a GET would have returned, and a body passed through with chunked
/// framing counts its buffered length.
fn counted_length(response: &Response<Bytes>) -> u64 {
    let status = response.status();
    if status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return 0;
    }
    match codec::content_length(response.headers()) {
        Ok(Some(length)) => length,
        _ => response.body().len() as u64,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("failed to read request from client: {0}")]
    ClientRead(#[source] CodecError),

    #[error("failed to dial upstream {upstream}: {source}")]
    Dial {
        upstream: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to forward request to backend: {0}")]
    BackendWrite(#[source] CodecError),

    #[error("failed to read response from backend: {0}")]
    BackendRead(#[source] CodecError),

    #[error("backend exchange timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to write response to client: {0}")]
    ClientWrite(#[source] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::metrics::MetricsRegistry;
    use hyper::header::CONTENT_LENGTH;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn proxy_for(upstream: &str, config: ProxyConfig) -> Proxy {
        let metrics = MetricsRegistry::new().unwrap().collector();
        let pool = Arc::new(BackendPool::new(
            &PoolConfig::default(),
            Arc::new(TcpConnector::new(upstream, None)),
            metrics.clone(),
        ));
        Proxy::new(&config, pool, Arc::new(StatsAggregator::new()), metrics)
    }

    fn get(path: &str) -> Request<Bytes> {
        let mut request = Request::new(Bytes::new());
        *request.uri_mut() = path.parse().unwrap();
        request
    }

    fn response_with_length(len: u64) -> Response<Bytes> {
        let mut response = Response::new(Bytes::new());
        response
            .headers_mut()
            .insert(CONTENT_LENGTH, HeaderValue::from(len));
        response
    }

    #[test]
    fn annotate_accumulates_per_path() {
        let proxy = proxy_for("127.0.0.1:1", ProxyConfig::default());

        let mut first = response_with_length(100);
        assert_eq!(proxy.annotate(&get("/foo"), &mut first), 100);
        assert_eq!(first.headers()[X_BYTES], "100");
        assert_eq!(first.headers()[CONNECTION], "close");

        let mut second = response_with_length(50);
        proxy.annotate(&get("/foo?page=2"), &mut second);
        assert_eq!(second.headers()[X_BYTES], "150");

        let mut other = response_with_length(7);
        proxy.annotate(&get("/bar"), &mut other);
        assert_eq!(other.headers()[X_BYTES], "7");
    }

    #[test]
    fn missing_length_counts_as_zero() {
        let proxy = proxy_for("127.0.0.1:1", ProxyConfig::default());
        let mut response = Response::new(Bytes::new());
        *response.status_mut() = StatusCode::NO_CONTENT;
        assert_eq!(proxy.annotate(&get("/empty"), &mut response), 0);
        assert_eq!(response.headers()[X_BYTES], "0");
    }

    #[test]
    fn bodyless_statuses_count_zero_despite_declared_length() {
        let proxy = proxy_for("127.0.0.1:1", ProxyConfig::default());

        let mut not_modified = response_with_length(5000);
        *not_modified.status_mut() = StatusCode::NOT_MODIFIED;
        assert_eq!(proxy.annotate(&get("/cached"), &mut not_modified), 0);
        assert_eq!(not_modified.headers()[X_BYTES], "0");

        let mut no_content = response_with_length(12);
        *no_content.status_mut() = StatusCode::NO_CONTENT;
        assert_eq!(proxy.annotate(&get("/cached"), &mut no_content), 0);

        // HEAD keeps the declared length.
        let mut head = response_with_length(30);
        let mut request = get("/cached");
        *request.method_mut() = hyper::Method::HEAD;
        assert_eq!(proxy.annotate(&request, &mut head), 30);
    }

    #[test]
    fn unframed_body_counts_its_length() {
        let proxy = proxy_for("127.0.0.1:1", ProxyConfig::default());
        let mut response = Response::new(Bytes::from_static(b"\x1f\x8b\x08"));
        assert_eq!(proxy.annotate(&get("/gz"), &mut response), 3);
    }

    #[tokio::test]
    async fn silent_upstream_hits_exchange_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut sink = [0u8; 1024];
            while stream.read(&mut sink).await.map(|n| n > 0).unwrap_or(false) {}
        });

        let config = ProxyConfig {
            exchange_timeout_ms: Some(100),
            ..ProxyConfig::default()
        };
        let proxy = proxy_for(&addr.to_string(), config);

        let err = proxy.forward(&get("/slow")).await.unwrap_err();
        assert!(matches!(err, ProxyError::Timeout(_)));
        assert_eq!(proxy.pool().idle_count().await, 0);
        assert!(proxy.stats().is_empty());
    }

    #[tokio::test]
    async fn truncated_response_abandons_backend() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            let _ = stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc")
                .await;
        });

        let proxy = proxy_for(&addr.to_string(), ProxyConfig::default());
        let err = proxy.forward(&get("/cut")).await.unwrap_err();
        assert!(matches!(
            err,
            ProxyError::BackendRead(CodecError::UnexpectedEof)
        ));
        assert_eq!(proxy.pool().idle_count().await, 0);
    }
}

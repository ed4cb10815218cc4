// src/proxy/pool.rs
use super::backend::Backend;
use super::connector::Connector;
use super::ProxyError;
use crate::config::PoolConfig;
use crate::metrics::MetricsCollector;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::timeout;
use tracing::{debug, error};

/// Bounded pool of idle upstream connections.
///
/// `available` holds one permit per idle backend and `vacant` one permit per
/// free slot, so the idle queue can never grow past `capacity` and an
/// acquirer holding an `available` permit always finds a backend to pop.
pub struct BackendPool {
    connector: Arc<dyn Connector>,
    idle: Mutex<VecDeque<Backend>>,
    available: Semaphore,
    vacant: Semaphore,
    capacity: usize,
    acquire_timeout: Duration,
    release_timeout: Duration,
    dials: AtomicU64,
    metrics: Arc<MetricsCollector>,
}

impl BackendPool {
    pub fn new(
        config: &PoolConfig,
        connector: Arc<dyn Connector>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            connector,
            idle: Mutex::new(VecDeque::with_capacity(config.capacity)),
            available: Semaphore::new(0),
            vacant: Semaphore::new(config.capacity),
            capacity: config.capacity,
            acquire_timeout: config.acquire_timeout(),
            release_timeout: config.release_timeout(),
            dials: AtomicU64::new(0),
            metrics,
        }
    }

    /// Takes an idle backend, or dials a new one if none frees up within
    /// the acquire timeout.
    pub async fn acquire(&self) -> Result<Backend, ProxyError> {
        if let Ok(Ok(permit)) = timeout(self.acquire_timeout, self.available.acquire()).await {
            permit.forget();
            let backend = {
                let mut idle = self.idle.lock().await;
                let backend = idle.pop_front();
                self.metrics.pool_idle.set(idle.len() as i64);
                backend
            };
            self.vacant.add_permits(1);

            if let Some(backend) = backend {
                debug!(backend = backend.id(), "reusing pooled backend");
                self.metrics.backend_reused_total.inc();
                return Ok(backend);
            }
        }

        self.dial().await
    }

    async fn dial(&self) -> Result<Backend, ProxyError> {
        let upstream = self.connector.upstream();
        debug!(%upstream, "dialing new backend");

        let result = match self.connector.connect().await {
            Ok(stream) => Backend::new(stream),
            Err(e) => Err(e),
        };
        self.metrics.record_dial(result.is_ok());

        match result {
            Ok(backend) => {
                self.dials.fetch_add(1, Ordering::Relaxed);
                debug!(backend = backend.id(), %upstream, "dialed backend");
                Ok(backend)
            }
            Err(source) => {
                error!(%upstream, %source, "failed to dial upstream");
                Err(ProxyError::Dial {
                    upstream: upstream.to_string(),
                    source,
                })
            }
        }
    }

    /// Returns a backend to the idle pool.
    ///
    /// Waits at most the release timeout for a free slot; if the pool stays
    /// full, or the backend cannot carry another exchange, it is closed.
    pub async fn release(&self, backend: Backend) {
        if !backend.is_reusable() {
            self.discard(backend, "not_reusable").await;
            return;
        }

        match timeout(self.release_timeout, self.vacant.acquire()).await {
            Ok(Ok(permit)) => {
                permit.forget();
                let id = backend.id();
                {
                    let mut idle = self.idle.lock().await;
                    idle.push_back(backend);
                    self.metrics.pool_idle.set(idle.len() as i64);
                }
                self.available.add_permits(1);
                self.metrics.backend_released_total.inc();
                debug!(backend = id, "backend returned to pool");
            }
            _ => self.discard(backend, "pool_full").await,
        }
    }

    /// Releases the backend from a detached task so the caller never waits
    /// on pool admission.
    pub fn release_detached(self: &Arc<Self>, backend: Backend) {
        let pool = self.clone();
        tokio::spawn(async move {
            pool.release(backend).await;
        });
    }

    /// Closes a backend that will not be pooled.
    pub async fn discard(&self, backend: Backend, reason: &'static str) {
        debug!(backend = backend.id(), reason, "closing backend");
        self.metrics.record_discard(reason);
        backend.close().await;
    }

    /// Closes every idle backend.
    pub async fn close_idle(&self) -> usize {
        let mut drained = Vec::new();
        while let Ok(permit) = self.available.try_acquire() {
            permit.forget();
            let backend = self.idle.lock().await.pop_front();
            self.vacant.add_permits(1);
            drained.extend(backend);
        }
        self.metrics.pool_idle.set(0);

        let count = drained.len();
        futures::future::join_all(drained.into_iter().map(|backend| backend.close())).await;
        count
    }

    pub async fn idle_count(&self) -> usize {
        self.idle.lock().await.len()
    }

    /// Number of upstream connections this pool has successfully dialed.
    pub fn dial_count(&self) -> u64 {
        self.dials.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsRegistry;
    use crate::proxy::TcpConnector;
    use std::net::SocketAddr;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;

    /// Upstream that accepts and holds every connection open.
    async fn holding_upstream() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        addr
    }

    /// Upstream that hands every accepted connection to the test.
    async fn recording_upstream() -> (SocketAddr, mpsc::UnboundedReceiver<TcpStream>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                if tx.send(stream).is_err() {
                    break;
                }
            }
        });
        (addr, rx)
    }

    /// Whether the peer closed `stream`, judged by reading EOF promptly.
    async fn peer_closed(stream: &mut TcpStream) -> bool {
        let mut buf = [0u8; 16];
        matches!(
            tokio::time::timeout(Duration::from_millis(100), stream.read(&mut buf)).await,
            Ok(Ok(0)) | Ok(Err(_))
        )
    }

    fn pool(addr: &str, capacity: usize, release_timeout_ms: u64) -> Arc<BackendPool> {
        let config = PoolConfig {
            capacity,
            acquire_timeout_ms: 20,
            release_timeout_ms,
        };
        let metrics = MetricsRegistry::new().unwrap().collector();
        Arc::new(BackendPool::new(
            &config,
            Arc::new(TcpConnector::new(addr, None)),
            metrics,
        ))
    }

    #[tokio::test]
    async fn acquire_on_empty_pool_dials() {
        let addr = holding_upstream().await;
        let pool = pool(&addr.to_string(), 10, 50);

        let backend = pool.acquire().await.unwrap();
        assert_eq!(backend.peer(), addr);
        assert_eq!(pool.dial_count(), 1);
        assert_eq!(pool.idle_count().await, 0);
    }

    #[tokio::test]
    async fn released_backend_is_reused_without_dialing() {
        let addr = holding_upstream().await;
        let pool = pool(&addr.to_string(), 10, 50);

        let backend = pool.acquire().await.unwrap();
        let id = backend.id();
        pool.release(backend).await;
        assert_eq!(pool.idle_count().await, 1);

        let again = pool.acquire().await.unwrap();
        assert_eq!(again.id(), id);
        assert_eq!(pool.dial_count(), 1);
        assert_eq!(pool.idle_count().await, 0);
    }

    #[tokio::test]
    async fn waiting_acquirer_gets_a_backend_released_meanwhile() {
        let addr = holding_upstream().await;
        let config = PoolConfig {
            capacity: 10,
            acquire_timeout_ms: 2_000,
            release_timeout_ms: 50,
        };
        let metrics = MetricsRegistry::new().unwrap().collector();
        let pool = Arc::new(BackendPool::new(
            &config,
            Arc::new(TcpConnector::new(addr.to_string(), None)),
            metrics,
        ));

        let backend = pool.dial().await.unwrap();
        let id = backend.id();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.unwrap().id() })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.release_detached(backend);

        assert_eq!(waiter.await.unwrap(), id);
        assert_eq!(pool.dial_count(), 1);
    }

    #[tokio::test]
    async fn full_pool_closes_excess_backends() {
        let (addr, mut accepted) = recording_upstream().await;
        let pool = pool(&addr.to_string(), 10, 50);

        let mut backends = Vec::new();
        for _ in 0..11 {
            backends.push(pool.acquire().await.unwrap());
        }
        for backend in backends {
            pool.release(backend).await;
        }

        assert_eq!(pool.idle_count().await, pool.capacity());
        assert_eq!(pool.dial_count(), 11);
        assert_eq!(
            pool.metrics
                .backend_discarded_total
                .with_label_values(&["pool_full"])
                .get(),
            1
        );

        // Exactly one upstream socket sees its connection closed.
        let mut closed = 0;
        for _ in 0..11 {
            let mut stream = accepted.recv().await.unwrap();
            if peer_closed(&mut stream).await {
                closed += 1;
            }
        }
        assert_eq!(closed, 1);
    }

    #[tokio::test]
    async fn concurrent_acquires_each_get_a_distinct_backend() {
        let addr = holding_upstream().await;
        let pool = pool(&addr.to_string(), 10, 50);

        for _ in 0..3 {
            let backend = pool.acquire().await.unwrap();
            pool.release(backend).await;
        }
        // Three releases of the same backend leave exactly one idle entry.
        assert_eq!(pool.idle_count().await, 1);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.acquire().await.unwrap() })
            })
            .collect();
        let backends: Vec<Backend> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        let mut ids: Vec<u64> = backends.iter().map(Backend::id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 8);
        assert_eq!(pool.dial_count(), 8);

        for backend in backends {
            pool.release(backend).await;
        }
        assert_eq!(pool.idle_count().await, 8);
    }

    #[tokio::test]
    async fn dial_failure_is_an_error_and_leaves_pool_empty() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let pool = pool(&addr.to_string(), 10, 50);

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, ProxyError::Dial { .. }));
        assert_eq!(pool.idle_count().await, 0);
        assert_eq!(pool.dial_count(), 0);
    }

    #[tokio::test]
    async fn close_idle_drains_the_pool() {
        let addr = holding_upstream().await;
        let pool = pool(&addr.to_string(), 10, 50);

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        pool.release(a).await;
        pool.release(b).await;

        assert_eq!(pool.close_idle().await, 2);
        assert_eq!(pool.idle_count().await, 0);

        // Slots are free again after draining.
        let c = pool.acquire().await.unwrap();
        pool.release(c).await;
        assert_eq!(pool.idle_count().await, 1);
    }
}

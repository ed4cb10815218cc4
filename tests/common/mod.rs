//! Shared helpers for integration tests: a hyper mock upstream, a proxy
//! bound to an ephemeral port and a raw keep-alive client.
#![allow(dead_code)]

use bytes::Bytes;
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

use xbytes_proxy::codec::{self, Limits};
use xbytes_proxy::config::Config;
use xbytes_proxy::metrics::MetricsRegistry;
use xbytes_proxy::proxy::Proxy;
use xbytes_proxy::server::ServerBuilder;

pub struct Upstream {
    pub addr: SocketAddr,
    /// TCP connections the upstream has accepted.
    pub connections: Arc<AtomicUsize>,
}

impl Upstream {
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

/// Upstream answering `GET <path>?len=N` with an N-byte body.
pub async fn start_upstream() -> Upstream {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));

    let counter = connections.clone();
    let make_service = make_service_fn(move |_conn: &AddrStream| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Ok::<_, Infallible>(service_fn(handle)) }
    });

    let server = Server::from_tcp(listener).unwrap().serve(make_service);
    tokio::spawn(server);

    Upstream { addr, connections }
}

async fn handle(req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let len = req
        .uri()
        .query()
        .and_then(|q| q.strip_prefix("len="))
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);
    Ok(Response::new(Body::from(vec![b'x'; len])))
}

/// An address nothing listens on.
pub async fn refusing_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

pub async fn start_proxy(upstream: SocketAddr) -> (SocketAddr, Arc<Proxy>) {
    let mut config = Config::default();
    config.upstream = upstream.to_string();
    config.listen = "127.0.0.1:0".parse().unwrap();

    let metrics = MetricsRegistry::new().unwrap().collector();
    let proxy = Arc::new(Proxy::from_config(&config, metrics));

    let server = ServerBuilder::new(config.listen)
        .with_proxy(proxy.clone())
        .bind()
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.serve());

    (addr, proxy)
}

/// Waits until the pool holds `expected` idle backends.
pub async fn wait_for_idle(proxy: &Proxy, expected: usize) {
    for _ in 0..100 {
        if proxy.pool().idle_count().await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "pool never reached {} idle backends (has {})",
        expected,
        proxy.pool().idle_count().await
    );
}

pub struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    pub async fn connect(addr: SocketAddr) -> Self {
        let (read_half, writer) = TcpStream::connect(addr).await.unwrap().into_split();
        Self {
            reader: BufReader::new(read_half),
            writer,
        }
    }

    pub async fn send_raw(&mut self, raw: &str) {
        self.writer.write_all(raw.as_bytes()).await.unwrap();
    }

    pub async fn request(&mut self, method: Method, target: &str) -> Response<Bytes> {
        self.send_raw(&format!("{} {} HTTP/1.1\r\nHost: test\r\n\r\n", method, target))
            .await;
        self.read_response(&method).await
    }

    pub async fn get(&mut self, target: &str) -> Response<Bytes> {
        self.request(Method::GET, target).await
    }

    pub async fn read_response(&mut self, method: &Method) -> Response<Bytes> {
        let (response, _) = codec::read_response(&mut self.reader, method, &Limits::default())
            .await
            .unwrap();
        response
    }

    /// Everything the proxy sends until it closes the connection.
    pub async fn read_to_end(mut self) -> Vec<u8> {
        let mut rest = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), self.reader.read_to_end(&mut rest))
            .await
            .expect("proxy did not close the connection")
            .unwrap();
        rest
    }
}

pub fn x_bytes(response: &Response<Bytes>) -> u64 {
    response.headers()[xbytes_proxy::proxy::X_BYTES]
        .to_str()
        .unwrap()
        .parse()
        .unwrap()
}

// src/proxy/connector.rs
use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;

/// Opens new connections to the upstream server.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> io::Result<TcpStream>;

    /// Upstream address, for logs and errors.
    fn upstream(&self) -> &str;
}

pub struct TcpConnector {
    addr: String,
    timeout: Option<Duration>,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>, timeout: Option<Duration>) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> io::Result<TcpStream> {
        let stream = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, TcpStream::connect(&self.addr))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??,
            None => TcpStream::connect(&self.addr).await?,
        };
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn upstream(&self) -> &str {
        &self.addr
    }
}

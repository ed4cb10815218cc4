// ────────────────────────────────
// src/server/builder.rs
// ────────────────────────────────
use crate::proxy::Proxy;
use crate::server::handler::ForwardingLoop;
use crate::server::listener::bind_tcp;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Builder pattern so `main.rs` can inject its Proxy.
pub struct ServerBuilder {
    addr: SocketAddr,
    proxy: Option<Arc<Proxy>>,
}

impl ServerBuilder {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr, proxy: None }
    }

    pub fn with_proxy(mut self, proxy: Arc<Proxy>) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Binds the listener without accepting yet, so callers can learn the
    /// actual address when binding port 0.
    pub async fn bind(self) -> Result<BoundServer> {
        let proxy = self
            .proxy
            .context("proxy must be set via with_proxy()")?;
        let listener = bind_tcp(self.addr).await?;
        Ok(BoundServer { listener, proxy })
    }

    /// Consume the builder, boot the TCP listener, spawn one loop per client.
    pub async fn serve(self) -> Result<()> {
        self.bind().await?.serve().await
    }
}

pub struct BoundServer {
    listener: TcpListener,
    proxy: Arc<Proxy>,
}

impl BoundServer {
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts forever, spawning one forwarding loop per connection.
    pub async fn serve(self) -> Result<()> {
        tracing::info!("HTTP proxy listening on {}", self.local_addr()?);

        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    tracing::warn!(%err, "failed to accept connection");
                    continue;
                }
            };
            let handler = ForwardingLoop::new(self.proxy.clone());

            tokio::spawn(handler.run(stream, peer));
        }
    }
}

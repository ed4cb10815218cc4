// src/server/handler.rs
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::codec;
use crate::proxy::{Proxy, ProxyError};

/// What the loop does after an exchange completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// Serves one client connection: reads a request, forwards it over a pooled
/// backend, writes the annotated response, and repeats until the client
/// goes away or anything fails.
#[derive(Clone)]
pub struct ForwardingLoop {
    proxy: Arc<Proxy>,
}

impl ForwardingLoop {
    pub fn new(proxy: Arc<Proxy>) -> Self {
        Self { proxy }
    }

    /// Runs the loop to completion. The client stream is shut down on every
    /// exit path.
    pub async fn run<S>(self, stream: S, peer: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let span = tracing::info_span!("connection", %peer, id = %Uuid::new_v4());
        async move {
            info!("got connection");
            let metrics = self.proxy.metrics().clone();
            metrics.increment_active_connections();

            let (read_half, write_half) = tokio::io::split(stream);
            let mut reader = BufReader::new(read_half);
            let mut writer = BufWriter::new(write_half);

            loop {
                match self.serve_one(&mut reader, &mut writer).await {
                    Ok(Flow::Continue) => continue,
                    Ok(Flow::Close) => break,
                    Err(e) => {
                        warn!(error = %e, "closing client connection");
                        break;
                    }
                }
            }

            if let Err(e) = writer.shutdown().await {
                debug!(%e, "error while closing client connection");
            }
            metrics.decrement_active_connections();
        }
        .instrument(span)
        .await
    }

    /// Handles a single request/response exchange.
    pub async fn serve_one<R, W>(&self, reader: &mut R, writer: &mut W) -> Result<Flow, ProxyError>
    where
        R: tokio::io::AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let request = match codec::read_request(reader, self.proxy.limits()).await {
            Ok(Some(request)) => request,
            Ok(None) => {
                debug!("client closed connection");
                return Ok(Flow::Close);
            }
            Err(e) => return Err(ProxyError::ClientRead(e)),
        };
        debug!(method = %request.method(), uri = %request.uri(), "read request");

        let (response, backend) = self.proxy.forward(&request).await?;

        if let Err(e) = codec::write_response(writer, &response).await {
            // The backend side of the exchange completed.
            self.proxy.pool().release_detached(backend);
            return Err(ProxyError::ClientWrite(e));
        }
        info!(
            path = request.uri().path(),
            status = response.status().as_u16(),
            x_bytes = ?response.headers().get(crate::proxy::X_BYTES),
            "proxied request"
        );

        self.proxy.pool().release_detached(backend);

        if codec::wants_close(request.version(), request.headers()) {
            Ok(Flow::Close)
        } else {
            Ok(Flow::Continue)
        }
    }
}

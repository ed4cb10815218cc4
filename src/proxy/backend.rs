// src/proxy/backend.rs
use bytes::Bytes;
use hyper::{Method, Request, Response};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::codec::{self, CodecError, Limits};

static BACKEND_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// One persistent connection to the upstream server.
///
/// A backend is either idle inside the [`BackendPool`](super::BackendPool)
/// or owned by exactly one forwarding loop. It only exposes what an
/// exchange needs: write a request, read the matching response, close.
pub struct Backend {
    id: u64,
    peer: SocketAddr,
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
    reusable: bool,
    exchanges: u64,
}

impl Backend {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        let peer = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();

        Ok(Self {
            id: BACKEND_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            peer,
            reader: BufReader::new(read_half),
            writer: BufWriter::new(write_half),
            reusable: true,
            exchanges: 0,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Number of completed request/response exchanges on this connection.
    pub fn exchanges(&self) -> u64 {
        self.exchanges
    }

    /// Whether the connection can go back to the pool.
    ///
    /// Cleared by any failed exchange, and by responses that end the
    /// connection (close-delimited bodies, `Connection: close`).
    pub fn is_reusable(&self) -> bool {
        self.reusable
    }

    pub async fn write_request(&mut self, request: &Request<Bytes>) -> Result<(), CodecError> {
        if codec::wants_close(request.version(), request.headers()) {
            self.reusable = false;
        }
        codec::write_request(&mut self.writer, request)
            .await
            .map_err(|e| {
                self.reusable = false;
                CodecError::Io(e)
            })
    }

    pub async fn read_response(
        &mut self,
        method: &Method,
        limits: &Limits,
    ) -> Result<Response<Bytes>, CodecError> {
        match codec::read_response(&mut self.reader, method, limits).await {
            Ok((response, reusable)) => {
                self.reusable &= reusable;
                self.exchanges += 1;
                Ok(response)
            }
            Err(e) => {
                self.reusable = false;
                Err(e)
            }
        }
    }

    /// Shuts down the write side and drops the connection.
    pub async fn close(mut self) {
        if let Err(e) = self.writer.shutdown().await {
            tracing::debug!(backend = self.id, %e, "error while closing backend");
        }
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("reusable", &self.reusable)
            .field("exchanges", &self.exchanges)
            .finish()
    }
}

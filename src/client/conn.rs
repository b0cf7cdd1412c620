//! Pooled Node Connection
//!
//! One persistent TCP connection per storage node. The protocol is
//! one framed request, one framed response, so a tokio mutex
//! serializes callers and keeps the stream in lockstep. A call that
//! fails or is cancelled mid-exchange leaves the stream desynced;
//! the connection is then poisoned and the next call dials fresh.

use crate::protocol::{self, Request, Response};
use bytes::BytesMut;
use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use super::ClientError;

struct Wire {
    stream: BufWriter<TcpStream>,
    buf: BytesMut,
}

/// A node entry's transport half.
pub struct NodeConn {
    addr: String,
    wire: Mutex<Option<Wire>>,
}

impl NodeConn {
    /// Dials `addr` eagerly so pool membership implies a live route.
    pub async fn connect(addr: &str) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self {
            addr: addr.to_string(),
            wire: Mutex::new(Some(Wire {
                stream: BufWriter::new(stream),
                buf: BytesMut::with_capacity(4096),
            })),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Sends one request and reads its response. Reconnects first if
    /// a previous exchange poisoned the stream.
    pub async fn call(&self, request: &Request) -> Result<Response, ClientError> {
        let mut guard = self.wire.lock().await;

        if guard.is_none() {
            debug!(addr = %self.addr, "redialing poisoned connection");
            let stream = TcpStream::connect(&self.addr)
                .await
                .map_err(|e| self.transport(e))?;
            *guard = Some(Wire {
                stream: BufWriter::new(stream),
                buf: BytesMut::with_capacity(4096),
            });
        }
        let Some(wire) = guard.as_mut() else {
            return Err(self.transport(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection unavailable",
            )));
        };

        match self.exchange(wire, request).await {
            Ok(response) => Ok(response),
            Err(e) => {
                // The stream may hold half a frame now; drop it.
                *guard = None;
                Err(e)
            }
        }
    }

    /// Drops the underlying stream so the next call redials. Used
    /// after a deadline fires while an exchange was in flight.
    pub async fn poison(&self) {
        *self.wire.lock().await = None;
    }

    async fn exchange(&self, wire: &mut Wire, request: &Request) -> Result<Response, ClientError> {
        let bytes = protocol::encode_to_vec(request)?;
        wire.stream
            .write_all(&bytes)
            .await
            .map_err(|e| self.transport(e))?;
        wire.stream.flush().await.map_err(|e| self.transport(e))?;

        loop {
            if let Some((response, consumed)) = protocol::decode::<Response>(&wire.buf)? {
                let _ = wire.buf.split_to(consumed);
                return Ok(response);
            }
            let n = wire
                .stream
                .get_mut()
                .read_buf(&mut wire.buf)
                .await
                .map_err(|e| self.transport(e))?;
            if n == 0 {
                return Err(self.transport(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "node closed the connection",
                )));
            }
        }
    }

    fn transport(&self, source: io::Error) -> ClientError {
        ClientError::Transport {
            addr: self.addr.clone(),
            source,
        }
    }
}

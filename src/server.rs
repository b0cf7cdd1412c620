//! TCP Server
//!
//! Accepts connections and runs one handler task per client. Each
//! handler owns a read buffer, decodes framed requests, executes them
//! against the shared [`KvNode`], and writes framed responses back.
//! Bad input gets a typed error response or a dropped connection;
//! nothing on this path panics.

use crate::node::{KvNode, NodeError};
use crate::protocol::{self, FrameError, Request, Response, HEADER_BYTES, MAX_FRAME_BYTES};
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// A read buffer never needs to exceed one maximum frame.
const MAX_BUFFER_SIZE: usize = MAX_FRAME_BYTES + HEADER_BYTES;

const INITIAL_BUFFER_SIZE: usize = 4096;

/// Counters shared across all connection handlers.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_accepted: AtomicU64,
    pub active_connections: AtomicU64,
    pub requests_handled: AtomicU64,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("client disconnected")]
    ClientDisconnected,

    #[error("unexpected end of stream")]
    UnexpectedEof,

    #[error("read buffer limit exceeded")]
    BufferFull,
}

/// Accept loop. Runs until the listener task is aborted.
pub async fn serve(listener: TcpListener, node: Arc<KvNode>, stats: Arc<ServerStats>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let node = Arc::clone(&node);
                let stats = Arc::clone(&stats);
                tokio::spawn(async move {
                    handle_connection(stream, addr, node, stats).await;
                });
            }
            Err(e) => {
                error!(error = %e, "accept failed");
            }
        }
    }
}

/// Runs one client connection to completion, translating expected
/// disconnects into debug-level logs.
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    node: Arc<KvNode>,
    stats: Arc<ServerStats>,
) {
    stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
    stats.active_connections.fetch_add(1, Ordering::Relaxed);
    debug!(client = %addr, "client connected");

    let handler = ConnectionHandler {
        stream: BufWriter::new(stream),
        addr,
        buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
        node,
        stats: Arc::clone(&stats),
    };

    match handler.run().await {
        Ok(()) | Err(ConnectionError::ClientDisconnected) => {
            debug!(client = %addr, "client disconnected")
        }
        Err(ConnectionError::Io(ref e))
            if e.kind() == std::io::ErrorKind::ConnectionReset =>
        {
            debug!(client = %addr, "connection reset by client")
        }
        Err(e) => warn!(client = %addr, error = %e, "connection ended with error"),
    }

    stats.active_connections.fetch_sub(1, Ordering::Relaxed);
}

struct ConnectionHandler {
    stream: BufWriter<TcpStream>,
    addr: SocketAddr,
    buffer: BytesMut,
    node: Arc<KvNode>,
    stats: Arc<ServerStats>,
}

impl ConnectionHandler {
    async fn run(mut self) -> Result<(), ConnectionError> {
        loop {
            while let Some(request) = self.try_parse_request()? {
                let response = execute(&self.node, request).await;
                self.stats.requests_handled.fetch_add(1, Ordering::Relaxed);
                self.send_response(&response).await?;
            }
            self.read_more_data().await?;
        }
    }

    fn try_parse_request(&mut self) -> Result<Option<Request>, ConnectionError> {
        match protocol::decode::<Request>(&self.buffer)? {
            Some((request, consumed)) => {
                let _ = self.buffer.split_to(consumed);
                Ok(Some(request))
            }
            None => Ok(None),
        }
    }

    async fn read_more_data(&mut self) -> Result<(), ConnectionError> {
        if self.buffer.len() >= MAX_BUFFER_SIZE {
            warn!(client = %self.addr, size = self.buffer.len(), "read buffer limit");
            return Err(ConnectionError::BufferFull);
        }
        if self.buffer.capacity() - self.buffer.len() < 1024 {
            self.buffer.reserve(4096);
        }

        let n = self.stream.get_mut().read_buf(&mut self.buffer).await?;
        if n == 0 {
            return if self.buffer.is_empty() {
                Err(ConnectionError::ClientDisconnected)
            } else {
                // The peer hung up mid-frame.
                Err(ConnectionError::UnexpectedEof)
            };
        }
        Ok(())
    }

    async fn send_response(&mut self, response: &Response) -> Result<(), ConnectionError> {
        let bytes = protocol::encode_to_vec(response)?;
        self.stream.write_all(&bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

/// Executes one request. Every fault becomes a typed response.
async fn execute(node: &KvNode, request: Request) -> Response {
    if request.key().is_empty() {
        return Response::error("key must not be empty");
    }

    match request {
        Request::Set { key, value } => match node.set(key, value, None).await {
            Ok(()) => Response::Set { success: true },
            Err(NodeError::Durability(e)) => Response::error(format!("durability: {e}")),
        },
        Request::Get { key } => match node.get(&key) {
            Some(value) => Response::Get {
                value: String::from_utf8_lossy(&value).into_owned(),
                found: true,
            },
            None => Response::not_found(),
        },
        Request::Del { key } => match node.del(key).await {
            Ok(()) => Response::Del { success: true },
            Err(NodeError::Durability(e)) => Response::error(format!("durability: {e}")),
        },
    }
}

/// Binds the listener and logs the bound address.
pub async fn bind(addr: &str) -> std::io::Result<TcpListener> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "listening");
    Ok(listener)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ShardedStore;

    async fn start_test_server() -> (SocketAddr, Arc<ServerStats>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let node = Arc::new(KvNode::new(Arc::new(ShardedStore::new()), None, None));
        let stats = Arc::new(ServerStats::new());

        tokio::spawn(serve(listener, node, Arc::clone(&stats)));
        (addr, stats)
    }

    async fn call(stream: &mut TcpStream, request: &Request) -> Response {
        let bytes = protocol::encode_to_vec(request).unwrap();
        stream.write_all(&bytes).await.unwrap();

        let mut buf = BytesMut::with_capacity(1024);
        loop {
            if let Some((response, consumed)) = protocol::decode(&buf).unwrap() {
                let _ = buf.split_to(consumed);
                return response;
            }
            let n = stream.read_buf(&mut buf).await.unwrap();
            assert!(n > 0, "server closed the connection");
        }
    }

    #[tokio::test]
    async fn set_get_del_over_the_wire() {
        let (addr, _) = start_test_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        let resp = call(
            &mut client,
            &Request::Set {
                key: "a".into(),
                value: "1".into(),
            },
        )
        .await;
        assert_eq!(resp, Response::Set { success: true });

        let resp = call(&mut client, &Request::Get { key: "a".into() }).await;
        assert_eq!(
            resp,
            Response::Get {
                value: "1".into(),
                found: true
            }
        );

        let resp = call(&mut client, &Request::Del { key: "a".into() }).await;
        assert_eq!(resp, Response::Del { success: true });

        let resp = call(&mut client, &Request::Get { key: "a".into() }).await;
        assert_eq!(resp, Response::not_found());
    }

    #[tokio::test]
    async fn get_miss_is_not_an_error() {
        let (addr, _) = start_test_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        let resp = call(&mut client, &Request::Get { key: "ghost".into() }).await;
        assert_eq!(
            resp,
            Response::Get {
                value: String::new(),
                found: false
            }
        );
    }

    #[tokio::test]
    async fn empty_key_gets_a_typed_error() {
        let (addr, _) = start_test_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        let resp = call(
            &mut client,
            &Request::Set {
                key: String::new(),
                value: "v".into(),
            },
        )
        .await;
        assert!(matches!(resp, Response::Error { .. }));
    }

    #[tokio::test]
    async fn pipelined_requests_answer_in_order() {
        let (addr, _) = start_test_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        // Two requests in one write.
        let mut bytes = Vec::new();
        protocol::encode(
            &Request::Set {
                key: "k1".into(),
                value: "v1".into(),
            },
            &mut bytes,
        )
        .unwrap();
        protocol::encode(&Request::Get { key: "k1".into() }, &mut bytes).unwrap();
        client.write_all(&bytes).await.unwrap();

        let mut buf = BytesMut::new();
        let mut responses = Vec::new();
        while responses.len() < 2 {
            if let Some((resp, consumed)) = protocol::decode::<Response>(&buf).unwrap() {
                let _ = buf.split_to(consumed);
                responses.push(resp);
                continue;
            }
            client.read_buf(&mut buf).await.unwrap();
        }

        assert_eq!(responses[0], Response::Set { success: true });
        assert_eq!(
            responses[1],
            Response::Get {
                value: "v1".into(),
                found: true
            }
        );
    }

    #[tokio::test]
    async fn garbage_frame_drops_the_connection() {
        let (addr, _) = start_test_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        let mut bad = 4u32.to_be_bytes().to_vec();
        bad.extend_from_slice(b"!!!!");
        client.write_all(&bad).await.unwrap();

        let mut buf = [0u8; 16];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(n, 0, "server should close on protocol garbage");
    }

    #[tokio::test]
    async fn stats_track_connections_and_requests() {
        let (addr, stats) = start_test_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        call(&mut client, &Request::Get { key: "x".into() }).await;
        assert_eq!(stats.connections_accepted.load(Ordering::Relaxed), 1);
        assert!(stats.requests_handled.load(Ordering::Relaxed) >= 1);

        drop(client);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 0);
    }
}

//! TCP transport implementation using `tokio::net`.
//!
//! # Feature gate
//!
//! This module is only available when the `transport-tcp` feature is enabled
//! (it is enabled by default).
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), bncs_client::BncsError> {
//! use bytes::BytesMut;
//! use bncs_client::{TcpTransport, Transport};
//!
//! let mut transport = TcpTransport::connect("useast.example.net", 6112).await?;
//! transport.send(&[0x01]).await?;
//!
//! let mut payload = BytesMut::new();
//! if let Some(Ok(id)) = transport.recv(&mut payload).await {
//!     println!("received 0x{id:02X} with {} bytes", payload.len());
//! }
//!
//! transport.close().await?;
//! # Ok(())
//! # }
//! ```

use std::net::{IpAddr, Ipv4Addr};

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::BncsError;
use crate::packet::{FRAME_MARKER, HEADER_LEN};
use crate::transport::Transport;

const READ_CHUNK: usize = 4096;

/// A [`Transport`] over a plain TCP connection.
///
/// # Cancel Safety
///
/// [`recv`](Transport::recv) keeps partially received frames in an internal
/// buffer, so cancelling it never loses bytes.
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
    read_buf: BytesMut,
    closed: bool,
}

impl TcpTransport {
    /// Open a connection to `host:port`.
    ///
    /// # Errors
    ///
    /// Returns [`BncsError::Io`] if the connection cannot be established.
    pub async fn connect(host: &str, port: u16) -> Result<Self, BncsError> {
        tracing::debug!(host = %host, port, "connecting to BNCS server");
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        tracing::info!(host = %host, port, "TCP connection established");
        Ok(Self::from_stream(stream))
    }

    /// Wrap an already-connected stream.
    pub fn from_stream(stream: TcpStream) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            closed: false,
        }
    }

    /// Like [`connect`](Self::connect), failing with [`BncsError::Timeout`] if
    /// the connection is not established within `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`BncsError::Timeout`] if the deadline elapses, or any error
    /// that [`connect`](Self::connect) may return.
    pub async fn connect_with_timeout(
        host: &str,
        port: u16,
        timeout: std::time::Duration,
    ) -> Result<Self, BncsError> {
        tokio::time::timeout(timeout, Self::connect(host, port))
            .await
            .map_err(|_| BncsError::Timeout)?
    }

    /// Split one complete frame off the read buffer, if there is one.
    fn take_frame(&mut self, payload: &mut BytesMut) -> Result<Option<u8>, BncsError> {
        let Some(&[marker, id, lo, hi]) = self.read_buf.get(..HEADER_LEN) else {
            return Ok(None);
        };
        if marker != FRAME_MARKER {
            return Err(BncsError::MalformedPacket {
                id,
                reason: "bad frame marker",
            });
        }
        let len = usize::from(u16::from_le_bytes([lo, hi]));
        if len < HEADER_LEN {
            return Err(BncsError::MalformedPacket {
                id,
                reason: "length shorter than header",
            });
        }
        if self.read_buf.len() < len {
            return Ok(None);
        }
        let mut frame = self.read_buf.split_to(len);
        frame.advance(HEADER_LEN);
        payload.extend_from_slice(&frame);
        Ok(Some(id))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&mut self, bytes: &[u8]) -> Result<(), BncsError> {
        if self.closed {
            return Err(BncsError::TransportClosed);
        }
        self.stream
            .write_all(bytes)
            .await
            .map_err(|e| BncsError::TransportSend(e.to_string()))
    }

    async fn recv(&mut self, payload: &mut BytesMut) -> Option<Result<u8, BncsError>> {
        loop {
            match self.take_frame(payload) {
                Ok(Some(id)) => return Some(Ok(id)),
                Ok(None) => {}
                Err(e) => return Some(Err(e)),
            }
            if self.closed {
                return None;
            }
            self.read_buf.reserve(READ_CHUNK);
            match self.stream.read_buf(&mut self.read_buf).await {
                Ok(0) => {
                    if !self.read_buf.is_empty() {
                        tracing::debug!(
                            leftover = self.read_buf.len(),
                            "connection closed mid-frame"
                        );
                    }
                    return None;
                }
                Ok(_) => {}
                Err(e) => return Some(Err(BncsError::TransportReceive(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) -> Result<(), BncsError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.stream
            .shutdown()
            .await
            .map_err(|e| BncsError::TransportSend(e.to_string()))
    }

    fn local_ipv4(&self) -> Option<Ipv4Addr> {
        match self.stream.local_addr().ok()?.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(ip) => ip.to_ipv4_mapped(),
        }
    }
}

#[cfg(test)]
#[cfg(feature = "transport-tcp")]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn tcp_transport_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<TcpTransport>();
    }

    // ── Mock-server helpers ──────────────────────────────────────────────

    /// Start a local server that runs `handler` on the accepted connection
    /// and returns the port to connect to.
    async fn start_mock_server<F, Fut>(handler: F) -> u16
    where
        F: FnOnce(TcpStream) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            handler(tcp).await;
        });
        port
    }

    // ── Mock-server tests ────────────────────────────────────────────────

    #[tokio::test]
    async fn reports_local_ipv4() {
        let port = start_mock_server(|_tcp| async move {}).await;
        let transport = TcpTransport::connect("127.0.0.1", port).await.unwrap();
        assert_eq!(transport.local_ipv4(), Some(Ipv4Addr::LOCALHOST));
    }

    #[tokio::test]
    async fn recv_reassembles_split_frames() {
        let port = start_mock_server(|mut tcp| async move {
            // One ping frame split across two writes, then a second frame.
            tcp.write_all(&[0xFF, 0x25, 0x08]).await.unwrap();
            tcp.flush().await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            tcp.write_all(&[0x00, 1, 2, 3, 4, 0xFF, 0x00, 0x04, 0x00])
                .await
                .unwrap();
            tcp.shutdown().await.unwrap();
        })
        .await;

        let mut transport = TcpTransport::connect("127.0.0.1", port).await.unwrap();
        let mut payload = BytesMut::new();
        assert_eq!(transport.recv(&mut payload).await.unwrap().unwrap(), 0x25);
        assert_eq!(&payload[..], &[1, 2, 3, 4]);

        payload.clear();
        assert_eq!(transport.recv(&mut payload).await.unwrap().unwrap(), 0x00);
        assert!(payload.is_empty());

        assert!(transport.recv(&mut payload).await.is_none());
    }

    #[tokio::test]
    async fn recv_rejects_bad_marker() {
        let port = start_mock_server(|mut tcp| async move {
            tcp.write_all(&[0xAB, 0x25, 0x04, 0x00]).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        })
        .await;

        let mut transport = TcpTransport::connect("127.0.0.1", port).await.unwrap();
        let mut payload = BytesMut::new();
        let err = transport.recv(&mut payload).await.unwrap().unwrap_err();
        assert!(matches!(err, BncsError::MalformedPacket { id: 0x25, .. }));
    }

    #[tokio::test]
    async fn send_reaches_server() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let port = start_mock_server(|mut tcp| async move {
            let mut buf = [0u8; 3];
            tcp.read_exact(&mut buf).await.unwrap();
            tx.send(buf).unwrap();
        })
        .await;

        let mut transport = TcpTransport::connect("127.0.0.1", port).await.unwrap();
        transport.send(&[0x01, 0xFF, 0x50]).await.unwrap();
        assert_eq!(rx.await.unwrap(), [0x01, 0xFF, 0x50]);
    }

    #[tokio::test]
    async fn send_after_close_returns_transport_closed() {
        let port = start_mock_server(|mut tcp| async move {
            let mut sink = Vec::new();
            let _ = tcp.read_to_end(&mut sink).await;
        })
        .await;

        let mut transport = TcpTransport::connect("127.0.0.1", port).await.unwrap();
        transport.close().await.unwrap();
        transport.close().await.unwrap();
        let err = transport.send(&[0x01]).await.unwrap_err();
        assert!(matches!(err, BncsError::TransportClosed));
    }

    #[tokio::test]
    async fn connect_fails_with_unreachable_port() {
        let err = TcpTransport::connect("127.0.0.1", 1).await.unwrap_err();
        assert!(matches!(err, BncsError::Io(_)));
    }
}

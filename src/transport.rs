//! Transport abstraction for the BNCS protocol.
//!
//! The [`Transport`] trait moves raw bytes out and whole frames in. Outgoing
//! data is already framed by the session (plus the one unframed protocol
//! selector byte at the start), so [`send`](Transport::send) just writes it.
//! Incoming bytes are split into frames by the transport, which hands back
//! each frame's id and copies its payload into a caller-supplied buffer.
//!
//! # Connection Setup
//!
//! Connection setup is NOT part of this trait. Construct a connected
//! transport externally and pass it to `BncsClient::connect_with`, or let
//! `BncsClient::connect` open a [`TcpTransport`](crate::TcpTransport).
//!
//! # Implementing a Custom Transport
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use bytes::BytesMut;
//! use bncs_client::error::BncsError;
//! use bncs_client::transport::Transport;
//!
//! struct MyTransport { /* ... */ }
//!
//! #[async_trait]
//! impl Transport for MyTransport {
//!     async fn send(&mut self, bytes: &[u8]) -> Result<(), BncsError> {
//!         // Write the bytes as-is
//!         unimplemented!()
//!     }
//!
//!     async fn recv(&mut self, payload: &mut BytesMut) -> Option<Result<u8, BncsError>> {
//!         // Read one frame, append its payload, return its id
//!         unimplemented!()
//!     }
//!
//!     async fn close(&mut self) -> Result<(), BncsError> {
//!         unimplemented!()
//!     }
//! }
//! ```

use std::net::Ipv4Addr;

use async_trait::async_trait;
use bytes::BytesMut;

use crate::error::BncsError;

/// A bidirectional byte transport carrying BNCS frames.
///
/// # Cancel Safety
///
/// The [`recv`](Transport::recv) method **MUST** be cancel-safe because it is
/// used inside `tokio::select!`. If `recv` is cancelled before completion,
/// calling it again must not lose data, and `payload` must only be written
/// once a whole frame is available.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Write `bytes` to the server.
    ///
    /// # Errors
    ///
    /// Returns [`BncsError::TransportSend`] if the bytes could not be written.
    async fn send(&mut self, bytes: &[u8]) -> Result<(), BncsError>;

    /// Receive the next frame.
    ///
    /// Returns:
    /// - `Some(Ok(id))`: a frame arrived; its payload (header stripped) was
    ///   appended to `payload`
    /// - `Some(Err(e))`: a transport or framing error occurred
    /// - `None`: the server closed the connection
    async fn recv(&mut self, payload: &mut BytesMut) -> Option<Result<u8, BncsError>>;

    /// Close the connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the shutdown fails. Implementations should still
    /// release resources in that case.
    async fn close(&mut self) -> Result<(), BncsError>;

    /// Local IPv4 address of the connection, reported in the handshake.
    /// Transports without one report `None`, sent as zero.
    fn local_ipv4(&self) -> Option<Ipv4Addr> {
        None
    }
}

//! Transport implementations for the BNCS protocol.
//!
//! | Feature          | Transport          |
//! |------------------|--------------------|
//! | `transport-tcp`  | [`TcpTransport`]   |

#[cfg(feature = "transport-tcp")]
pub mod tcp;

#[cfg(feature = "transport-tcp")]
pub use tcp::TcpTransport;

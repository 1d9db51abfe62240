//! # BNCS Client
//!
//! Session engine for the legacy BNCS binary chat/game protocol.
//!
//! The crate drives one connection per [`BncsClient`] through the protocol
//! handshake, the version/key check, login or account creation and into
//! chat, and reports everything that happens as prioritized notifications.
//!
//! ## Features
//!
//! - **Prioritized notifications**: each of the fixed notification kinds has
//!   its own [`Notification`] facade. High-priority subscribers run before
//!   `raise` returns; Normal and Low subscribers run on a shared dispatch
//!   pool. A failing subscriber never affects the others.
//! - **Host-driven authentication**: a failed client check or login does not
//!   disconnect. Subscribers decide whether to retry
//!   ([`BncsClient::continue_login`]) or give up ([`BncsClient::close`]).
//! - **Pluggable collaborators**: password hashing, CD key decoding and the
//!   revision check are supplied through [`Collaborators`].
//! - **Transport-agnostic**: implement [`Transport`] for any byte stream, or
//!   use the default `transport-tcp` feature's [`TcpTransport`].
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use bncs_client::{BncsClient, ClientSettings, Collaborators, Priority, Product};
//!
//! let settings = ClientSettings::from_json(&std::fs::read_to_string("bot.json")?)?;
//! let client = BncsClient::new(settings, Collaborators::new(hasher, keys, revision))?;
//!
//! client
//!     .notifications()
//!     .joined_channel
//!     .subscribe_fn(|_, joined| {
//!         println!("now in {}", joined.channel);
//!         Ok(())
//!     });
//!
//! client.connect().await?;
//! ```

pub mod buffer;
pub mod client;
pub mod credentials;
pub mod dispatch;
pub mod error;
pub mod event;
pub(crate) mod incoming;
pub mod outgoing;
pub mod packet;
pub mod product;
pub mod session;
pub mod settings;
pub mod transport;
pub mod transports;

// Re-export primary types for ergonomic imports.
pub use client::BncsClient;
pub use credentials::{
    CdKeyDecoder, Collaborators, CredentialProvider, KeyBlock, Revision, RevisionCheck,
    RevisionRequest,
};
pub use dispatch::{
    ClientId, DispatchPool, FaultContext, Handler, HandlerError, HandlerId, HandlerResult,
    Notification, Priority,
};
pub use error::BncsError;
pub use event::{NotificationKind, Notifications};
pub use outgoing::OutgoingQueue;
pub use product::Product;
pub use session::{JoinMethod, SessionState};
pub use settings::{ClientSettings, PingMethod, ValidationErrors};
pub use transport::Transport;

#[cfg(feature = "transport-tcp")]
pub use transports::TcpTransport;

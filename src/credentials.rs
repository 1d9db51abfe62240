//! Cryptographic collaborators supplied by the host.
//!
//! The session never hashes passwords, decodes CD keys or runs the revision
//! check itself. It calls into these traits at the points the handshake needs
//! them and writes whatever they return onto the wire.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::outgoing::{OutgoingQueue, UnpacedQueue};
use crate::packet::PacketWriter;
use crate::product::Product;

/// Password proofs for both credential families.
pub trait CredentialProvider: Send + Sync {
    /// Token-seeded password hash sent in `SID_LOGONRESPONSE2`.
    fn legacy_hash(&self, password: &str, client_token: u32, server_token: u32) -> Vec<u8>;

    /// Plain password hash sent in `SID_CREATEACCOUNT2`.
    fn legacy_account_hash(&self, password: &str) -> Vec<u8>;

    /// Append the first zero-knowledge logon message (`SID_AUTH_ACCOUNTLOGON`)
    /// to `frame`.
    fn zero_knowledge_login(&self, username: &str, password: &str, frame: &mut PacketWriter);

    /// Append the logon proof (`SID_AUTH_ACCOUNTLOGONPROOF`) answering the
    /// server's `salt` and `server_key`.
    fn zero_knowledge_proof(
        &self,
        username: &str,
        password: &str,
        salt: &[u8],
        server_key: &[u8],
        frame: &mut PacketWriter,
    );

    /// Append the verifier for `SID_AUTH_ACCOUNTCREATE`.
    fn zero_knowledge_create_account(&self, username: &str, password: &str, frame: &mut PacketWriter);
}

/// One decoded CD key, ready for `SID_AUTH_CHECK`.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyBlock {
    pub key_length: u32,
    pub product_value: u32,
    pub public_value: u32,
    /// Hash of the key's private part, seeded with both tokens.
    pub hash: Vec<u8>,
}

impl fmt::Debug for KeyBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyBlock")
            .field("key_length", &self.key_length)
            .field("product_value", &self.product_value)
            .field("public_value", &self.public_value)
            .finish_non_exhaustive()
    }
}

/// CD key decoding.
pub trait CdKeyDecoder: Send + Sync {
    /// Whether `key` decodes at all. Used by settings validation.
    fn is_structurally_valid(&self, key: &str) -> bool;

    /// Decode `key` and hash it for the given tokens. `None` if it does not
    /// decode.
    fn key_block(&self, key: &str, client_token: u32, server_token: u32) -> Option<KeyBlock>;
}

/// Everything the revision check needs, taken from `SID_AUTH_INFO` and the
/// settings.
#[derive(Debug, Clone)]
pub struct RevisionRequest {
    pub product: Product,
    /// Name of the check archive the server selected.
    pub archive: String,
    /// The value string the archive is evaluated with.
    pub formula: String,
    /// Archive timestamp, as a Windows `FILETIME`.
    pub archive_filetime: u64,
    pub game_files: [PathBuf; 3],
    pub lockdown_image: Option<PathBuf>,
}

/// Result of a successful revision check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revision {
    pub version: u32,
    pub checksum: u32,
    /// Executable information string.
    pub exe_info: String,
}

/// The version/revision check over the local game files.
pub trait RevisionCheck: Send + Sync {
    /// Run the check. The error string is surfaced to the host as-is.
    fn check(&self, request: &RevisionRequest) -> Result<Revision, String>;
}

/// The host-supplied services a client runs with.
#[derive(Clone)]
pub struct Collaborators {
    pub credentials: Arc<dyn CredentialProvider>,
    pub cd_keys: Arc<dyn CdKeyDecoder>,
    pub revision: Arc<dyn RevisionCheck>,
    pub outgoing: Arc<dyn OutgoingQueue>,
}

impl Collaborators {
    /// Bundle the three cryptographic services with an [`UnpacedQueue`].
    pub fn new(
        credentials: Arc<dyn CredentialProvider>,
        cd_keys: Arc<dyn CdKeyDecoder>,
        revision: Arc<dyn RevisionCheck>,
    ) -> Self {
        Self {
            credentials,
            cd_keys,
            revision,
            outgoing: Arc::new(UnpacedQueue::default()),
        }
    }

    /// Use `queue` for chat text instead of the unpaced default.
    #[must_use]
    pub fn with_outgoing_queue(mut self, queue: Arc<dyn OutgoingQueue>) -> Self {
        self.outgoing = queue;
        self
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

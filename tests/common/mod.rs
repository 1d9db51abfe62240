#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing,
    dead_code
)]
//! Shared test utilities for BNCS client integration tests.
//!
//! Provides a channel-driven [`MockTransport`] with its [`MockServer`] end,
//! fake cryptographic collaborators, and builders for server frame payloads.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::sync::mpsc;

use bncs_client::outgoing::ReadySink;
use bncs_client::packet::{sid, PacketWriter};
use bncs_client::{
    BncsClient, BncsError, CdKeyDecoder, ClientSettings, Collaborators, CredentialProvider,
    DispatchPool, KeyBlock, Notification, OutgoingQueue, Priority, Product, Revision,
    RevisionCheck, RevisionRequest, Transport,
};

/// How long any single expectation waits before failing the test.
pub const WAIT: Duration = Duration::from_secs(2);

/// Window used to assert that something does *not* happen.
pub const QUIET: Duration = Duration::from_millis(150);

/// Local address every [`MockTransport`] reports.
pub const LOCAL_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 20);

/// Route library logs to the test harness. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

// ── MockTransport ───────────────────────────────────────────────────

type Scripted = Option<Result<(u8, Vec<u8>), BncsError>>;

/// A channel-based mock transport for integration testing.
///
/// Server frames are pushed through the paired [`MockServer`] while the
/// client runs, so a test can answer each client frame as it arrives.
/// Waiting on a channel is cancel-safe, as the transport loop requires.
pub struct MockTransport {
    incoming: mpsc::UnboundedReceiver<Scripted>,
    sent: mpsc::UnboundedSender<Vec<u8>>,
    closed: Arc<AtomicBool>,
}

/// The test's end of a [`MockTransport`].
pub struct MockServer {
    to_client: mpsc::UnboundedSender<Scripted>,
    from_client: mpsc::UnboundedReceiver<Vec<u8>>,
    /// Whether `close()` has been called on the transport.
    pub closed: Arc<AtomicBool>,
}

/// Create a connected transport/server pair.
pub fn mock_pair() -> (MockTransport, MockServer) {
    let (to_client, incoming) = mpsc::unbounded_channel();
    let (sent, from_client) = mpsc::unbounded_channel();
    let closed = Arc::new(AtomicBool::new(false));
    let transport = MockTransport {
        incoming,
        sent,
        closed: Arc::clone(&closed),
    };
    let server = MockServer {
        to_client,
        from_client,
        closed,
    };
    (transport, server)
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, bytes: &[u8]) -> Result<(), BncsError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BncsError::TransportClosed);
        }
        let _ = self.sent.send(bytes.to_vec());
        Ok(())
    }

    async fn recv(&mut self, payload: &mut BytesMut) -> Option<Result<u8, BncsError>> {
        match self.incoming.recv().await {
            Some(Some(Ok((id, data)))) => {
                payload.extend_from_slice(&data);
                Some(Ok(id))
            }
            Some(Some(Err(e))) => Some(Err(e)),
            Some(None) | None => None,
        }
    }

    async fn close(&mut self) -> Result<(), BncsError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn local_ipv4(&self) -> Option<Ipv4Addr> {
        Some(LOCAL_IP)
    }
}

impl MockServer {
    /// Deliver one frame to the client.
    pub fn push(&self, id: u8, payload: Vec<u8>) {
        let _ = self.to_client.send(Some(Ok((id, payload))));
    }

    /// Make the client's next `recv` fail with `error`.
    pub fn fail(&self, error: BncsError) {
        let _ = self.to_client.send(Some(Err(error)));
    }

    /// Close the connection from the server side.
    pub fn hang_up(&self) {
        let _ = self.to_client.send(None);
    }

    /// The next chunk of bytes the client wrote.
    pub async fn next_sent(&mut self) -> Vec<u8> {
        tokio::time::timeout(WAIT, self.from_client.recv())
            .await
            .expect("timed out waiting for the client to send")
            .expect("client transport dropped")
    }

    /// The next frame the client wrote; asserts its id and returns the
    /// payload.
    pub async fn expect_frame(&mut self, id: u8) -> Vec<u8> {
        let bytes = self.next_sent().await;
        let (actual, payload) = split_frame(&bytes);
        assert_eq!(
            actual, id,
            "expected packet 0x{id:02X}, client sent 0x{actual:02X}"
        );
        payload
    }

    /// Assert the client writes nothing for a short while.
    pub async fn assert_quiet(&mut self) {
        if let Ok(Some(bytes)) = tokio::time::timeout(QUIET, self.from_client.recv()).await {
            panic!("client unexpectedly sent {bytes:02X?}");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Split one complete frame into its id and payload, checking the header.
pub fn split_frame(bytes: &[u8]) -> (u8, Vec<u8>) {
    assert!(bytes.len() >= 4, "frame shorter than header: {bytes:02X?}");
    assert_eq!(bytes[0], 0xFF, "bad frame marker");
    let len = usize::from(u16::from_le_bytes([bytes[2], bytes[3]]));
    assert_eq!(len, bytes.len(), "length field does not match frame size");
    (bytes[1], bytes[4..].to_vec())
}

// ── Fake collaborators ──────────────────────────────────────────────

/// Password "hashes" are the password bytes zero-padded to 20, so tests can
/// see which password was used.
pub struct FakeCredentials;

fn padded(password: &str, len: usize) -> Vec<u8> {
    password
        .bytes()
        .chain(std::iter::repeat(0))
        .take(len)
        .collect()
}

impl CredentialProvider for FakeCredentials {
    fn legacy_hash(&self, password: &str, _client_token: u32, _server_token: u32) -> Vec<u8> {
        padded(password, 20)
    }

    fn legacy_account_hash(&self, password: &str) -> Vec<u8> {
        padded(password, 20)
    }

    fn zero_knowledge_login(&self, username: &str, _password: &str, frame: &mut PacketWriter) {
        frame.insert_bytes(&[0xAA; 32]).insert_cstring(username);
    }

    fn zero_knowledge_proof(
        &self,
        _username: &str,
        password: &str,
        _salt: &[u8],
        _server_key: &[u8],
        frame: &mut PacketWriter,
    ) {
        frame.insert_bytes(&padded(password, 20));
    }

    fn zero_knowledge_create_account(
        &self,
        username: &str,
        _password: &str,
        frame: &mut PacketWriter,
    ) {
        frame
            .insert_bytes(&[0xCC; 32])
            .insert_bytes(&[0xDD; 32])
            .insert_cstring(username);
    }
}

/// Accepts alphanumeric keys of 13, 16 or 26 characters.
pub struct FakeKeys;

impl CdKeyDecoder for FakeKeys {
    fn is_structurally_valid(&self, key: &str) -> bool {
        matches!(key.len(), 13 | 16 | 26) && key.chars().all(|c| c.is_ascii_alphanumeric())
    }

    fn key_block(&self, key: &str, _client_token: u32, _server_token: u32) -> Option<KeyBlock> {
        self.is_structurally_valid(key).then(|| KeyBlock {
            key_length: u32::try_from(key.len()).unwrap_or(0),
            product_value: 0x04,
            public_value: 0x0012_3456,
            hash: vec![0x5A; 20],
        })
    }
}

/// Returns a fixed revision, or a fixed failure.
pub struct FakeRevision {
    failure: Option<String>,
    pub calls: AtomicUsize,
}

pub const REVISION_VERSION: u32 = 0x0100_0D01;
pub const REVISION_CHECKSUM: u32 = 0xCAFE_BABE;
pub const EXE_INFO: &str = "game.exe 01/01/20 00:00:00 1048576";

impl FakeRevision {
    pub fn ok() -> Self {
        Self {
            failure: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(reason: &str) -> Self {
        Self {
            failure: Some(reason.to_string()),
            calls: AtomicUsize::new(0),
        }
    }
}

impl RevisionCheck for FakeRevision {
    fn check(&self, _request: &RevisionRequest) -> Result<Revision, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.failure {
            Some(reason) => Err(reason.clone()),
            None => Ok(Revision {
                version: REVISION_VERSION,
                checksum: REVISION_CHECKSUM,
                exe_info: EXE_INFO.to_string(),
            }),
        }
    }
}

pub fn collaborators() -> Collaborators {
    Collaborators::new(
        Arc::new(FakeCredentials),
        Arc::new(FakeKeys),
        Arc::new(FakeRevision::ok()),
    )
}

// ── RecordingQueue ──────────────────────────────────────────────────

/// An outgoing queue that holds text until the test releases it.
#[derive(Default)]
pub struct RecordingQueue {
    ready: StdMutex<Option<ReadySink>>,
    held: StdMutex<Vec<(String, Priority)>>,
    pub clears: AtomicUsize,
}

impl RecordingQueue {
    /// Hand every held text to the session, if one is attached.
    pub fn release_all(&self) {
        let sink = self.ready.lock().unwrap().clone();
        let held: Vec<_> = self.held.lock().unwrap().drain(..).collect();
        if let Some(sink) = sink {
            for (text, _) in held {
                sink(text);
            }
        }
    }

    pub fn is_attached(&self) -> bool {
        self.ready.lock().unwrap().is_some()
    }

    pub fn held(&self) -> Vec<(String, Priority)> {
        self.held.lock().unwrap().clone()
    }
}

impl OutgoingQueue for RecordingQueue {
    fn attach(&self, ready: ReadySink) {
        *self.ready.lock().unwrap() = Some(ready);
    }

    fn detach(&self) {
        self.ready.lock().unwrap().take();
    }

    fn enqueue(&self, text: String, priority: Priority) {
        self.held.lock().unwrap().push((text, priority));
    }

    fn clear(&self) {
        self.held.lock().unwrap().clear();
        self.clears.fetch_add(1, Ordering::SeqCst);
    }

    fn pending(&self) -> usize {
        self.held.lock().unwrap().len()
    }
}

// ── Settings & clients ──────────────────────────────────────────────

/// Create an empty file with a unique name in the temp directory.
pub fn temp_file(tag: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("bncs-it-{tag}-{}", uuid::Uuid::new_v4()));
    std::fs::write(&path, b"test").unwrap();
    path
}

pub const USERNAME: &str = "Arthas";
pub const PASSWORD: &str = "frostmourne";
pub const CD_KEY: &str = "AAAABBBBCCCCDDDD";
pub const EXPANSION_KEY: &str = "EEEEFFFFGGGGHHHH";

/// Settings that pass validation for `product`.
pub fn settings(product: Product) -> ClientSettings {
    let caps = product.capabilities();
    let mut settings = ClientSettings::new(USERNAME, PASSWORD, product, "127.0.0.1")
        .with_game_files(temp_file("exe"), temp_file("file2"), temp_file("file3"))
        .with_cd_key(CD_KEY);
    if caps.cd_keys_required >= 2 {
        settings = settings.with_expansion_cd_key(EXPANSION_KEY);
    }
    if caps.requires_lockdown {
        settings = settings.with_lockdown_image(temp_file("lockdown"));
    }
    settings
}

/// A client on its own small dispatch pool.
pub fn new_client(settings: ClientSettings) -> BncsClient {
    new_client_with(settings, collaborators())
}

pub fn new_client_with(settings: ClientSettings, collaborators: Collaborators) -> BncsClient {
    init_tracing();
    let pool = Arc::new(DispatchPool::with_workers(2).unwrap());
    BncsClient::with_pool(settings, collaborators, pool).unwrap()
}

// ── Notification collection ─────────────────────────────────────────

/// Receives a copy of every payload raised on one notification.
pub struct Collector<P> {
    rx: mpsc::UnboundedReceiver<P>,
}

/// Subscribe a Normal-priority handler that forwards payloads to a
/// [`Collector`].
pub fn collect<P>(notification: &Notification<P>) -> Collector<P>
where
    P: Clone + std::fmt::Debug + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    notification.subscribe_fn(move |_, payload: &P| {
        let _ = tx.send(payload.clone());
        Ok(())
    });
    Collector { rx }
}

impl<P: std::fmt::Debug> Collector<P> {
    pub async fn next(&mut self) -> P {
        tokio::time::timeout(WAIT, self.rx.recv())
            .await
            .expect("timed out waiting for notification")
            .expect("collector closed")
    }

    pub async fn assert_none(&mut self) {
        if let Ok(Some(payload)) = tokio::time::timeout(QUIET, self.rx.recv()).await {
            panic!("unexpected notification: {payload:?}");
        }
    }
}

/// Poll until `check` holds or the wait expires.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ── Server frame payloads ───────────────────────────────────────────

/// Payload bytes of a server frame built with the client's own writer.
pub fn payload(id: u8, build: impl FnOnce(&mut PacketWriter)) -> Vec<u8> {
    let mut writer = PacketWriter::standalone(id);
    build(&mut writer);
    writer.payload().to_vec()
}

pub const SERVER_TOKEN: u32 = 0x1357_9BDF;

/// `SID_AUTH_INFO` from the server.
pub fn auth_info_payload() -> Vec<u8> {
    payload(sid::AUTH_INFO, |w| {
        w.insert_u32(0)
            .insert_u32(SERVER_TOKEN)
            .insert_u32(0x4D2)
            .insert_u64(0x01C5_0B25_3F2C_1E00)
            .insert_cstring("ver-IX86-1.mpq")
            .insert_cstring("A=3845581634 B=880823580 C=1363937103 4 A=A-S B=B-C C=C-A A=A-B");
    })
}

/// `SID_AUTH_CHECK` with `result` and the additional-information string.
pub fn auth_check_payload(result: u32, info: &str) -> Vec<u8> {
    payload(sid::AUTH_CHECK, |w| {
        w.insert_u32(result).insert_cstring(info);
    })
}

/// A bare status dword, as `SID_LOGONRESPONSE2` and friends carry.
pub fn status_payload(status: u32) -> Vec<u8> {
    payload(sid::NULL, |w| {
        w.insert_u32(status);
    })
}

/// Status plus trailing message string.
pub fn status_message_payload(status: u32, message: &str) -> Vec<u8> {
    payload(sid::NULL, |w| {
        w.insert_u32(status).insert_cstring(message);
    })
}

/// Accepted `SID_AUTH_ACCOUNTLOGON` challenge.
pub fn logon_challenge_payload() -> Vec<u8> {
    payload(sid::AUTH_ACCOUNTLOGON, |w| {
        w.insert_u32(0)
            .insert_bytes(&[0x11; 32])
            .insert_bytes(&[0x22; 32]);
    })
}

/// `SID_AUTH_ACCOUNTLOGONPROOF` with `status`.
pub fn logon_proof_payload(status: u32) -> Vec<u8> {
    payload(sid::AUTH_ACCOUNTLOGONPROOF, |w| {
        w.insert_u32(status).insert_bytes(&[0x33; 20]).insert_cstring("");
    })
}

/// `SID_ENTERCHAT` naming the client `unique_username`.
pub fn enter_chat_payload(unique_username: &str) -> Vec<u8> {
    payload(sid::ENTERCHAT, |w| {
        w.insert_cstring(unique_username)
            .insert_cstring("PX2DUSEast,Arthas")
            .insert_cstring(USERNAME);
    })
}

/// `SID_CHATEVENT` with the fixed header and two strings.
pub fn chat_event_payload(event_id: u32, flags: u32, username: &str, text: &str) -> Vec<u8> {
    payload(sid::CHATEVENT, |w| {
        w.insert_u32(event_id)
            .insert_u32(flags)
            .insert_u32(42)
            .insert_u32(0)
            .insert_u32(0xBAAD_F00D)
            .insert_u32(0xBAAD_F00D)
            .insert_cstring(username)
            .insert_cstring(text);
    })
}

pub fn ping_payload(cookie: u32) -> Vec<u8> {
    status_payload(cookie)
}

// ── Session drivers ─────────────────────────────────────────────────

/// Connect `client` over a mock transport and consume the handshake.
pub async fn connect(client: &BncsClient) -> MockServer {
    let (transport, mut server) = mock_pair();
    client.connect_with(transport).await.unwrap();
    assert_eq!(server.next_sent().await, vec![0x01], "protocol selector first");
    server.expect_frame(sid::AUTH_INFO).await;
    server
}

/// Answer the version challenge and accept the client check.
pub async fn pass_client_check(server: &mut MockServer) {
    server.push(sid::AUTH_INFO, auth_info_payload());
    server.expect_frame(sid::AUTH_CHECK).await;
    server.push(sid::AUTH_CHECK, auth_check_payload(0, ""));
}

/// From a sent legacy login to entered chat as `unique_username`.
pub async fn accept_legacy_login(server: &mut MockServer, unique_username: &str) {
    server.expect_frame(sid::LOGONRESPONSE2).await;
    server.push(sid::LOGONRESPONSE2, status_payload(0));
    server.expect_frame(sid::GETCHANNELLIST).await;
    server.expect_frame(sid::ENTERCHAT).await;
    server.push(sid::ENTERCHAT, enter_chat_payload(unique_username));
}

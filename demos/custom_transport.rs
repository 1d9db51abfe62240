//! # Custom Transport Example
//!
//! Shows how to implement the [`Transport`] trait over in-process channels
//! and drive a [`BncsClient`] from handshake to chat against a scripted
//! server. Useful for:
//!
//! - **Testing** bot logic without a real gateway
//! - **Custom backends** such as proxies or recorded sessions
//!
//! The collaborators here are toys. Real hosts plug in working password
//! hashing, CD key decoding and revision checks.
//!
//! ## Running
//!
//! ```sh
//! cargo run --example custom_transport
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use bncs_client::packet::{sid, PacketWriter};
use bncs_client::{
    BncsClient, BncsError, CdKeyDecoder, ClientSettings, Collaborators, CredentialProvider,
    KeyBlock, Product, Revision, RevisionCheck, RevisionRequest, Transport,
};
use bytes::BytesMut;
use tokio::sync::mpsc;

// ─────────────────────────────────────────────────────────────────────
// Step 1: A channel-based loopback transport
// ─────────────────────────────────────────────────────────────────────

/// The client half. Bytes the client writes go out on `tx`; whole frames
/// from the scripted server arrive on `rx`.
pub struct LoopbackTransport {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: mpsc::UnboundedReceiver<(u8, Vec<u8>)>,
}

/// The scripted server half.
pub struct LoopbackServer {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    tx: mpsc::UnboundedSender<(u8, Vec<u8>)>,
}

fn loopback_pair() -> (LoopbackTransport, LoopbackServer) {
    let (client_tx, server_rx) = mpsc::unbounded_channel();
    let (server_tx, client_rx) = mpsc::unbounded_channel();
    (
        LoopbackTransport {
            tx: client_tx,
            rx: client_rx,
        },
        LoopbackServer {
            rx: server_rx,
            tx: server_tx,
        },
    )
}

// ─────────────────────────────────────────────────────────────────────
// Step 2: Implement the Transport trait
// ─────────────────────────────────────────────────────────────────────

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&mut self, bytes: &[u8]) -> Result<(), BncsError> {
        self.tx
            .send(bytes.to_vec())
            .map_err(|e| BncsError::TransportSend(e.to_string()))
    }

    /// Cancel-safe because `UnboundedReceiver::recv` is.
    async fn recv(&mut self, payload: &mut BytesMut) -> Option<Result<u8, BncsError>> {
        let (id, data) = self.rx.recv().await?;
        payload.extend_from_slice(&data);
        Some(Ok(id))
    }

    async fn close(&mut self) -> Result<(), BncsError> {
        Ok(())
    }
}

impl LoopbackServer {
    /// Wait for the client to write frame `id`.
    async fn expect(&mut self, id: u8) -> Result<(), Box<dyn std::error::Error>> {
        let bytes = self.rx.recv().await.ok_or("client hung up")?;
        match bytes.get(1) {
            Some(&actual) if actual == id => {
                tracing::info!("server received 0x{id:02X} ({} bytes)", bytes.len());
                Ok(())
            }
            other => Err(format!("expected 0x{id:02X}, got {other:02X?}").into()),
        }
    }

    fn reply(&self, id: u8, build: impl FnOnce(&mut PacketWriter)) {
        let mut writer = PacketWriter::standalone(id);
        build(&mut writer);
        let _ = self.tx.send((id, writer.payload().to_vec()));
    }
}

// ─────────────────────────────────────────────────────────────────────
// Step 3: Toy collaborators
// ─────────────────────────────────────────────────────────────────────

struct ToyCrypto;

impl CredentialProvider for ToyCrypto {
    fn legacy_hash(&self, _password: &str, _client_token: u32, _server_token: u32) -> Vec<u8> {
        vec![0; 20]
    }

    fn legacy_account_hash(&self, _password: &str) -> Vec<u8> {
        vec![0; 20]
    }

    fn zero_knowledge_login(&self, username: &str, _password: &str, frame: &mut PacketWriter) {
        frame.insert_bytes(&[0; 32]).insert_cstring(username);
    }

    fn zero_knowledge_proof(
        &self,
        _username: &str,
        _password: &str,
        _salt: &[u8],
        _server_key: &[u8],
        frame: &mut PacketWriter,
    ) {
        frame.insert_bytes(&[0; 52]);
    }

    fn zero_knowledge_create_account(
        &self,
        username: &str,
        _password: &str,
        frame: &mut PacketWriter,
    ) {
        frame.insert_bytes(&[0; 64]).insert_cstring(username);
    }
}

impl CdKeyDecoder for ToyCrypto {
    fn is_structurally_valid(&self, key: &str) -> bool {
        key.len() == 16
    }

    fn key_block(&self, key: &str, _client_token: u32, _server_token: u32) -> Option<KeyBlock> {
        Some(KeyBlock {
            key_length: u32::try_from(key.len()).ok()?,
            product_value: 0,
            public_value: 0,
            hash: vec![0; 20],
        })
    }
}

impl RevisionCheck for ToyCrypto {
    fn check(&self, request: &RevisionRequest) -> Result<Revision, String> {
        tracing::info!(archive = %request.archive, "pretending to check game files");
        Ok(Revision {
            version: 0x0100_0D01,
            checksum: 0,
            exe_info: "Game.exe 01/01/01 00:00:00 0".to_string(),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────
// Step 4: Wire together the client and the scripted server
// ─────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Validation wants the game files to exist; any existing file will do.
    let exe = std::env::current_exe()?;
    let settings = ClientSettings::new("Arthas", "secret", Product::Diablo2, "loopback")
        .with_cd_key("AAAABBBBCCCCDDDD")
        .with_game_files(&exe, &exe, &exe);
    let toy = Arc::new(ToyCrypto);
    let client = BncsClient::new(
        settings,
        Collaborators::new(toy.clone(), toy.clone(), toy),
    )?;

    let (entered_tx, mut entered_rx) = mpsc::unbounded_channel();
    client.notifications().entered_chat.subscribe_fn(move |_, entered| {
        let _ = entered_tx.send(entered.unique_username.clone());
        Ok(())
    });
    client.notifications().disconnected.subscribe_fn(|_, event| {
        tracing::info!(
            "disconnected: {}",
            event.reason.as_deref().unwrap_or("clean")
        );
        Ok(())
    });

    let (transport, mut server) = loopback_pair();
    client.connect_with(transport).await?;

    // ── Scripted server ─────────────────────────────────────────────
    let selector = server.rx.recv().await.ok_or("client hung up")?;
    tracing::info!("server received protocol selector {selector:02X?}");
    server.expect(sid::AUTH_INFO).await?;
    server.reply(sid::AUTH_INFO, |w| {
        w.insert_u32(0)
            .insert_u32(0x1234_5678)
            .insert_u32(0)
            .insert_u64(0)
            .insert_cstring("ver-IX86-1.mpq")
            .insert_cstring("A=1 B=2 C=3 4 A=A+S B=B-C C=C^A A=A+B");
    });

    server.expect(sid::AUTH_CHECK).await?;
    server.reply(sid::AUTH_CHECK, |w| {
        w.insert_u32(0).insert_cstring("");
    });

    // Login starts on its own once the check passes.
    server.expect(sid::LOGONRESPONSE2).await?;
    server.reply(sid::LOGONRESPONSE2, |w| {
        w.insert_u32(0);
    });

    server.expect(sid::GETCHANNELLIST).await?;
    server.expect(sid::ENTERCHAT).await?;
    server.reply(sid::ENTERCHAT, |w| {
        w.insert_cstring("Arthas").insert_cstring("PX2D").insert_cstring("Arthas");
    });

    let name = entered_rx.recv().await.ok_or("client dropped")?;
    tracing::info!("entered chat as {name}");

    // ── Clean shutdown ──────────────────────────────────────────────
    client.shutdown().await;
    tracing::info!("state after shutdown: {}", client.state());
    Ok(())
}

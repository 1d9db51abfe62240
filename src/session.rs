//! Per-client session state and outgoing packet construction.
//!
//! [`Session`] is shared between the public [`BncsClient`](crate::BncsClient)
//! handle and the background transport loop. The handle builds frames and
//! queues them as [`Command`]s; the loop writes them and feeds incoming frames
//! to [`incoming`](crate::incoming).

use std::fmt;
use std::net::Ipv4Addr;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::buffer::{BufferPool, PooledBuffer};
use crate::credentials::{CdKeyDecoder, Collaborators, CredentialProvider, RevisionCheck};
use crate::dispatch::{ClientId, DispatchPool, Priority};
use crate::error::{BncsError, Result};
use crate::event::{DisconnectedEvent, Notifications, OutgoingText};
use crate::outgoing::OutgoingQueue;
use crate::packet::{sid, PacketWriter};
use crate::product::{CredentialFamily, Product};
use crate::settings::{validate, ClientSettings, ValidationErrors};

/// Platform tag reported in `SID_AUTH_INFO`.
const PLATFORM: &str = "IX86";

/// Connection lifecycle of one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Disconnected,
    /// Opening the transport.
    Connecting,
    /// Identification sent, read loop not yet running.
    HandshakeSent,
    /// Waiting for the outcome of the version/key check.
    AwaitingClientCheck,
    /// Check resolved; login or account creation may be attempted.
    AwaitingLogin,
    /// Logged on, not in a channel.
    EnteredChat,
    InChannel,
    Disconnecting,
}

impl SessionState {
    /// Whether chat text may be sent.
    pub fn can_chat(self) -> bool {
        matches!(self, Self::EnteredChat | Self::InChannel)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// How `SID_JOINCHANNEL` should treat the requested channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum JoinMethod {
    /// Join only if the channel already exists.
    NoCreate,
    /// The first join after entering chat.
    #[default]
    First,
    /// Create the channel if needed.
    Forced,
    /// First join for Diablo II characters.
    Diablo2First,
}

impl JoinMethod {
    /// The wire value.
    pub fn code(self) -> u32 {
        match self {
            Self::NoCreate => 0x00,
            Self::First => 0x01,
            Self::Forced => 0x02,
            Self::Diablo2First => 0x05,
        }
    }
}

/// Work queued for the transport loop.
pub(crate) enum Command {
    /// A finished frame to write.
    Frame(PooledBuffer),
    /// Chat text released by the outgoing queue.
    Chat(String),
}

/// The handle's end of a running transport loop.
pub(crate) struct Link {
    pub(crate) commands: mpsc::UnboundedSender<Command>,
    pub(crate) shutdown: Option<oneshot::Sender<()>>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Tokens {
    client: u32,
    server: u32,
}

#[derive(Debug, Default)]
struct Presence {
    unique_username: Option<String>,
    channel: Option<String>,
}

pub(crate) struct Session {
    pub(crate) id: ClientId,
    pub(crate) notifications: Notifications,
    pub(crate) settings: RwLock<ClientSettings>,
    pub(crate) buffers: Arc<BufferPool>,
    pub(crate) credentials: Arc<dyn CredentialProvider>,
    pub(crate) cd_keys: Arc<dyn CdKeyDecoder>,
    pub(crate) revision: Arc<dyn RevisionCheck>,
    outgoing: RwLock<Arc<dyn OutgoingQueue>>,
    state: Mutex<SessionState>,
    closing: AtomicBool,
    link: Mutex<Option<Link>>,
    tokens: Mutex<Tokens>,
    presence: Mutex<Presence>,
}

impl Session {
    pub(crate) fn new(
        settings: ClientSettings,
        collaborators: Collaborators,
        pool: Arc<DispatchPool>,
    ) -> Self {
        let id = ClientId::new();
        let fault_limit = settings.handler_fault_limit.and_then(NonZeroU32::new);
        Self {
            id,
            notifications: Notifications::new(id, pool, fault_limit),
            settings: RwLock::new(settings),
            buffers: Arc::new(BufferPool::default()),
            credentials: collaborators.credentials,
            cd_keys: collaborators.cd_keys,
            revision: collaborators.revision,
            outgoing: RwLock::new(collaborators.outgoing),
            state: Mutex::new(SessionState::Disconnected),
            closing: AtomicBool::new(false),
            link: Mutex::new(None),
            tokens: Mutex::new(Tokens::default()),
            presence: Mutex::new(Presence::default()),
        }
    }

    // ── State ───────────────────────────────────────────────────────────

    pub(crate) fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, next: SessionState) {
        let prev = std::mem::replace(&mut *self.state.lock(), next);
        if prev != next {
            debug!(client = %self.id, from = %prev, to = %next, "session state changed");
        }
    }

    /// Move to `next` only if the current state is `from`.
    pub(crate) fn transition(&self, from: SessionState, next: SessionState) -> bool {
        let mut state = self.state.lock();
        if *state != from {
            return false;
        }
        *state = next;
        drop(state);
        debug!(client = %self.id, from = %from, to = %next, "session state changed");
        true
    }

    fn require(&self, operation: &'static str, allowed: &[SessionState]) -> Result<SessionState> {
        let state = self.state();
        if allowed.contains(&state) {
            Ok(state)
        } else {
            Err(BncsError::InvalidState { operation, state })
        }
    }

    /// Disconnected → Connecting, after validating (and normalizing) the
    /// settings as they are now.
    pub(crate) fn begin_connect(&self) -> Result<()> {
        if self.state() != SessionState::Disconnected {
            return Err(BncsError::AlreadyConnected);
        }
        let errors = validate(&mut self.settings.write(), self.cd_keys.as_ref());
        if !errors.is_empty() {
            warn!(client = %self.id, %errors, "connect refused: invalid settings");
            return Err(BncsError::InvalidSettings(errors));
        }

        let mut state = self.state.lock();
        if *state != SessionState::Disconnected {
            return Err(BncsError::AlreadyConnected);
        }
        *state = SessionState::Connecting;
        drop(state);
        *self.presence.lock() = Presence::default();
        debug!(client = %self.id, "session state changed to Connecting");
        Ok(())
    }

    /// Back to Disconnected after a connect attempt failed before the
    /// `Connected` notification.
    pub(crate) fn abort_connect(&self) {
        self.link.lock().take();
        self.set_state(SessionState::Disconnected);
        self.closing.store(false, Ordering::Release);
    }

    // ── Collaborators ───────────────────────────────────────────────────

    pub(crate) fn outgoing_queue(&self) -> Arc<dyn OutgoingQueue> {
        Arc::clone(&*self.outgoing.read())
    }

    pub(crate) fn set_outgoing_queue(&self, queue: Arc<dyn OutgoingQueue>) -> Result<()> {
        // Held across the swap so a concurrent connect cannot attach the old queue.
        let state = self.state.lock();
        if *state != SessionState::Disconnected {
            return Err(BncsError::InvalidState {
                operation: "replace the outgoing queue",
                state: *state,
            });
        }
        *self.outgoing.write() = queue;
        Ok(())
    }

    /// The configured product, read fresh on every call.
    pub(crate) fn product(&self) -> Result<Product> {
        self.settings
            .read()
            .product()
            .ok_or(BncsError::InvalidSettings(ValidationErrors::UNKNOWN_PRODUCT))
    }

    // ── Link to the transport loop ──────────────────────────────────────

    pub(crate) fn install_link(&self, link: Link) {
        *self.link.lock() = Some(link);
    }

    pub(crate) fn writer(&self, id: u8) -> PacketWriter {
        PacketWriter::new(id, self.buffers.acquire())
    }

    /// Finish `writer` and queue the frame for the transport loop.
    pub(crate) fn transmit(&self, writer: PacketWriter) -> Result<()> {
        let id = writer.id();
        let frame = writer.finish()?;
        let link = self.link.lock();
        let Some(link) = link.as_ref() else {
            return Err(BncsError::NotConnected);
        };
        link.commands
            .send(Command::Frame(frame))
            .map_err(|_| BncsError::NotConnected)?;
        debug!(client = %self.id, packet = id, "queued frame");
        Ok(())
    }

    /// Queue released chat text for the transport loop.
    pub(crate) fn transmit_chat(&self, text: String) {
        let link = self.link.lock();
        match link.as_ref() {
            Some(link) => {
                if link.commands.send(Command::Chat(text)).is_err() {
                    debug!(client = %self.id, "transport loop gone; dropping chat text");
                }
            }
            None => debug!(client = %self.id, "not connected; dropping chat text"),
        }
    }

    // ── Tokens ──────────────────────────────────────────────────────────

    /// Draw a fresh client token for a new connection.
    pub(crate) fn reset_tokens(&self) -> u32 {
        let client = Uuid::new_v4().as_fields().0;
        *self.tokens.lock() = Tokens { client, server: 0 };
        client
    }

    pub(crate) fn set_server_token(&self, server: u32) {
        self.tokens.lock().server = server;
    }

    /// `(client, server)` tokens of the current connection.
    pub(crate) fn tokens(&self) -> (u32, u32) {
        let tokens = *self.tokens.lock();
        (tokens.client, tokens.server)
    }

    // ── Presence ────────────────────────────────────────────────────────

    pub(crate) fn set_unique_username(&self, name: String) {
        self.presence.lock().unique_username = Some(name);
    }

    pub(crate) fn unique_username(&self) -> Option<String> {
        self.presence.lock().unique_username.clone()
    }

    pub(crate) fn set_channel(&self, channel: String) {
        self.presence.lock().channel = Some(channel);
    }

    pub(crate) fn current_channel(&self) -> Option<String> {
        self.presence.lock().channel.clone()
    }

    // ── Outgoing packets ────────────────────────────────────────────────

    /// `SID_AUTH_INFO`, built from the current settings. The local address
    /// goes out in network byte order.
    pub(crate) fn auth_info_frame(&self, local_ip: Option<Ipv4Addr>) -> Result<PooledBuffer> {
        let product = self.product()?;
        let settings = self.settings.read();
        let locale = &settings.locale;
        let mut writer = self.writer(sid::AUTH_INFO);
        writer
            .insert_u32(0)
            .insert_dword_code(PLATFORM)
            .insert_u32(product.dword())
            .insert_u32(settings.version_byte)
            .insert_dword_code(&locale.product_language)
            .insert_bytes(&local_ip.unwrap_or(Ipv4Addr::UNSPECIFIED).octets())
            .insert_i32(locale.timezone_bias)
            .insert_u32(locale.locale_id)
            .insert_u32(locale.language_id)
            .insert_cstring(&locale.country_abbreviation)
            .insert_cstring(&locale.country);
        writer.finish()
    }

    pub(crate) fn ping_frame(&self, cookie: u32) -> Result<PooledBuffer> {
        let mut writer = self.writer(sid::PING);
        writer.insert_u32(cookie);
        writer.finish()
    }

    /// Send the login packet for the product's credential family.
    ///
    /// The family is looked up on every call so a product change between
    /// attempts takes effect.
    pub(crate) fn begin_login(&self, retry: bool) -> Result<()> {
        let operation = if retry { "retry login" } else { "log in" };
        self.require(operation, &[SessionState::AwaitingLogin])?;
        let product = self.product()?;
        let (username, password) = {
            let settings = self.settings.read();
            (settings.username.clone(), settings.password.clone())
        };

        let writer = match product.capabilities().credential_family {
            CredentialFamily::LegacyHash => {
                let (client_token, server_token) = self.tokens();
                let hash = self
                    .credentials
                    .legacy_hash(&password, client_token, server_token);
                let mut writer = self.writer(sid::LOGONRESPONSE2);
                writer
                    .insert_u32(client_token)
                    .insert_u32(server_token)
                    .insert_bytes(&hash)
                    .insert_cstring(&username);
                writer
            }
            CredentialFamily::ZeroKnowledge => {
                let mut writer = self.writer(sid::AUTH_ACCOUNTLOGON);
                self.credentials
                    .zero_knowledge_login(&username, &password, &mut writer);
                writer
            }
        };
        info!(client = %self.id, %username, %product, retry, "sending login");
        self.transmit(writer)
    }

    /// Answer the server's zero-knowledge challenge.
    pub(crate) fn send_login_proof(&self, salt: &[u8], server_key: &[u8]) -> Result<()> {
        let (username, password) = {
            let settings = self.settings.read();
            (settings.username.clone(), settings.password.clone())
        };
        let mut writer = self.writer(sid::AUTH_ACCOUNTLOGONPROOF);
        self.credentials
            .zero_knowledge_proof(&username, &password, salt, server_key, &mut writer);
        self.transmit(writer)
    }

    /// Send the account-creation packet for the product's credential family.
    pub(crate) fn begin_account_creation(&self) -> Result<()> {
        self.require("create an account", &[SessionState::AwaitingLogin])?;
        let product = self.product()?;
        let (username, password) = {
            let settings = self.settings.read();
            (settings.username.clone(), settings.password.clone())
        };

        let writer = match product.capabilities().credential_family {
            CredentialFamily::LegacyHash => {
                let hash = self.credentials.legacy_account_hash(&password);
                let mut writer = self.writer(sid::CREATEACCOUNT2);
                writer.insert_bytes(&hash).insert_cstring(&username);
                writer
            }
            CredentialFamily::ZeroKnowledge => {
                let mut writer = self.writer(sid::AUTH_ACCOUNTCREATE);
                self.credentials
                    .zero_knowledge_create_account(&username, &password, &mut writer);
                writer
            }
        };
        info!(client = %self.id, %username, %product, "sending account creation");
        self.transmit(writer)
    }

    /// `SID_GETCHANNELLIST` then `SID_ENTERCHAT`, after a successful login.
    pub(crate) fn request_chat_entry(&self) -> Result<()> {
        let product = self.product()?;
        let username = self.settings.read().username.clone();

        let mut list = self.writer(sid::GETCHANNELLIST);
        list.insert_u32(product.dword());
        self.transmit(list)?;

        let mut enter = self.writer(sid::ENTERCHAT);
        enter.insert_cstring(&username).insert_cstring("");
        self.transmit(enter)
    }

    pub(crate) fn join_channel(&self, channel: &str, method: JoinMethod) -> Result<()> {
        self.require(
            "join a channel",
            &[SessionState::EnteredChat, SessionState::InChannel],
        )?;
        let mut writer = self.writer(sid::JOINCHANNEL);
        writer.insert_u32(method.code()).insert_cstring(channel);
        debug!(client = %self.id, %channel, ?method, "joining channel");
        self.transmit(writer)
    }

    pub(crate) fn provide_email(&self, address: &str) -> Result<()> {
        self.require(
            "register an email address",
            &[
                SessionState::AwaitingLogin,
                SessionState::EnteredChat,
                SessionState::InChannel,
            ],
        )?;
        let mut writer = self.writer(sid::SETEMAIL);
        writer.insert_cstring(address);
        self.transmit(writer)
    }

    /// Hand `text` to the outgoing queue.
    pub(crate) fn send_text(&self, text: String, priority: Priority) -> Result<()> {
        self.require("send chat text", &[SessionState::EnteredChat, SessionState::InChannel])?;
        self.outgoing_queue().enqueue(text, priority);
        Ok(())
    }

    /// `SID_CHATCOMMAND` for released text.
    pub(crate) fn chat_frame(&self, text: &str) -> Result<PooledBuffer> {
        let mut writer = self.writer(sid::CHATCOMMAND);
        writer.insert_cstring(text);
        writer.finish()
    }

    /// Raise `CommandSent` or `MessageSent` for text that went out.
    pub(crate) fn announce_sent(&self, text: String) {
        let notification = if text.starts_with('/') {
            &self.notifications.command_sent
        } else {
            &self.notifications.message_sent
        };
        notification.raise(OutgoingText { text });
    }

    // ── Teardown ────────────────────────────────────────────────────────

    /// Begin closing. Re-entrant and repeated calls are absorbed.
    pub(crate) fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            debug!(client = %self.id, "close already in progress");
            return;
        }
        {
            let mut state = self.state.lock();
            if matches!(*state, SessionState::Disconnected | SessionState::Disconnecting) {
                drop(state);
                self.closing.store(false, Ordering::Release);
                return;
            }
            *state = SessionState::Disconnecting;
        }
        info!(client = %self.id, "closing session");

        self.outgoing_queue().clear();
        let shutdown = self.link.lock().as_mut().and_then(|link| link.shutdown.take());
        if let Some(shutdown) = shutdown {
            // The loop may already be exiting on its own; it raises
            // Disconnected either way.
            let _ = shutdown.send(());
        }
    }

    /// Final step of every connection: called once when the transport loop
    /// (or an interrupted connect) is done.
    pub(crate) fn finish_close(&self, reason: Option<String>) {
        drop(self.link.lock().take());
        let queue = self.outgoing_queue();
        queue.detach();
        queue.clear();
        self.set_state(SessionState::Disconnected);
        self.closing.store(false, Ordering::Release);

        match &reason {
            Some(reason) => warn!(client = %self.id, %reason, "disconnected"),
            None => info!(client = %self.id, "disconnected"),
        }
        self.notifications
            .disconnected
            .raise(DisconnectedEvent { reason });
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

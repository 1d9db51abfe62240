//! Async client for the BNCS protocol.
//!
//! [`BncsClient`] is a cloneable handle over one session. Connecting spawns a
//! background transport loop that writes queued frames, reads server frames
//! and turns them into notifications. Everything the server tells the client
//! arrives through [`Notifications`]; the handle's methods only queue work
//! and return.
//!
//! # Example
//!
//! ```rust,ignore
//! let settings = ClientSettings::new("Arthas", "secret", Product::BroodWar, "useast.example.net")
//!     .with_cd_key(key)
//!     .with_game_files(exe, storm, battle)
//!     .with_lockdown_image(lockdown)
//!     .with_home_channel("Op Arthas");
//! let client = BncsClient::new(settings, collaborators)?;
//!
//! let retry = client.clone();
//! client.notifications().login_failed.subscribe_fn(move |_, failure| {
//!     retry.update_settings(|s| s.password = prompt_password(&failure.username));
//!     retry.continue_login()?;
//!     Ok(())
//! });
//! client.notifications().user_spoke.subscribe_fn(|_, msg| {
//!     println!("<{}> {}", msg.username, msg.text);
//!     Ok(())
//! });
//!
//! client.connect().await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::credentials::Collaborators;
use crate::dispatch::{ClientId, DispatchPool, Priority};
use crate::error::{BncsError, Result};
use crate::event::{ClientNotice, ConnectedEvent, Notifications};
use crate::incoming;
use crate::outgoing::OutgoingQueue;
use crate::packet::PROTOCOL_SELECTOR;
use crate::session::{Command, JoinMethod, Link, Session, SessionState};
use crate::settings::{validate, ClientSettings, PingMethod};
use crate::transport::Transport;

/// Deadline for opening the TCP connection in [`BncsClient::connect`].
#[cfg(feature = "transport-tcp")]
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Time [`BncsClient::shutdown`] gives the transport loop to exit.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Async client handle for the BNCS protocol.
///
/// Clones share the session. Closing through any clone closes it for all.
#[derive(Clone)]
pub struct BncsClient {
    inner: Arc<Inner>,
}

struct Inner {
    session: Arc<Session>,
    /// Handle to the current transport loop task.
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl BncsClient {
    /// Create a client on the process-wide dispatch pool.
    ///
    /// Settings are validated (and normalized) first.
    ///
    /// # Errors
    ///
    /// Returns [`BncsError::InvalidSettings`] carrying every violated rule,
    /// or [`BncsError::Io`] if the dispatch pool cannot start.
    pub fn new(settings: ClientSettings, collaborators: Collaborators) -> Result<Self> {
        Self::with_pool(settings, collaborators, DispatchPool::shared()?)
    }

    /// Create a client that defers notifications onto `pool`.
    ///
    /// # Errors
    ///
    /// Returns [`BncsError::InvalidSettings`] carrying every violated rule.
    pub fn with_pool(
        mut settings: ClientSettings,
        collaborators: Collaborators,
        pool: Arc<DispatchPool>,
    ) -> Result<Self> {
        let errors = validate(&mut settings, collaborators.cd_keys.as_ref());
        if !errors.is_empty() {
            return Err(BncsError::InvalidSettings(errors));
        }
        let session = Arc::new(Session::new(settings, collaborators, pool));
        debug!(client = %session.id, "client created");
        Ok(Self {
            inner: Arc::new(Inner {
                session,
                task: Mutex::new(None),
            }),
        })
    }

    fn session(&self) -> &Arc<Session> {
        &self.inner.session
    }

    // ── Connection ──────────────────────────────────────────────────

    /// Open a TCP connection to the configured gateway and start the
    /// handshake.
    ///
    /// # Errors
    ///
    /// Returns [`BncsError::AlreadyConnected`] unless disconnected,
    /// [`BncsError::InvalidSettings`] if the current settings no longer
    /// validate, or the error that stopped the connection from opening.
    #[cfg(feature = "transport-tcp")]
    pub async fn connect(&self) -> Result<()> {
        let session = self.session();
        session.begin_connect()?;
        let gateway = session.settings.read().gateway.clone();
        let transport = match crate::transports::TcpTransport::connect_with_timeout(
            &gateway.host,
            gateway.port,
            CONNECT_TIMEOUT,
        )
        .await
        {
            Ok(transport) => transport,
            Err(e) => {
                error!(client = %session.id, %gateway, error = %e, "connection failed");
                session.abort_connect();
                session.notifications.client_error.raise(ClientNotice {
                    message: format!("could not connect to {gateway}: {e}"),
                });
                return Err(e);
            }
        };
        self.establish(transport).await
    }

    /// Start the handshake over an already-open `transport`.
    ///
    /// # Errors
    ///
    /// Returns [`BncsError::AlreadyConnected`] unless disconnected,
    /// [`BncsError::InvalidSettings`] if the current settings no longer
    /// validate, or the error that interrupted the handshake.
    pub async fn connect_with(&self, transport: impl Transport) -> Result<()> {
        self.session().begin_connect()?;
        self.establish(transport).await
    }

    async fn establish(&self, mut transport: impl Transport) -> Result<()> {
        let session = self.session();
        if let Err(e) = handshake(session, &mut transport).await {
            warn!(client = %session.id, error = %e, "handshake could not be sent");
            let _ = transport.close().await;
            session.abort_connect();
            return Err(e);
        }

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<Command>();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        session.install_link(Link {
            commands: cmd_tx,
            shutdown: Some(shutdown_tx),
        });
        let weak = Arc::downgrade(session);
        session.outgoing_queue().attach(Arc::new(move |text| {
            if let Some(session) = weak.upgrade() {
                session.transmit_chat(text);
            }
        }));

        let gateway = session.settings.read().gateway.clone();
        info!(client = %session.id, %gateway, "connected");
        session.notifications.connected.raise(ConnectedEvent {
            host: gateway.host,
            port: gateway.port,
        });

        if !session.transition(SessionState::Connecting, SessionState::HandshakeSent) {
            debug!(client = %session.id, "closed while connecting");
            let _ = transport.close().await;
            session.finish_close(None);
            return Ok(());
        }

        let task = tokio::spawn(transport_loop(
            transport,
            Arc::clone(session),
            cmd_rx,
            shutdown_rx,
        ));
        *self.inner.task.lock() = Some(task);
        Ok(())
    }

    /// Close the session.
    ///
    /// Pending chat text is dropped, the transport loop stops and
    /// `Disconnected` is raised once the loop has exited. Calling this again
    /// while a close is in progress, or when already disconnected, does
    /// nothing.
    pub fn close(&self) {
        self.session().close();
    }

    /// Close the session and wait for the transport loop to exit.
    ///
    /// If the loop does not exit within one second it is aborted.
    pub async fn shutdown(&self) {
        self.close();
        let task = self.inner.task.lock().take();
        let Some(mut task) = task else {
            return;
        };
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(join_err)) => {
                warn!("transport loop terminated with join error: {join_err}");
            }
            Err(_) => {
                warn!("transport loop did not exit within timeout; aborting task");
                task.abort();
                if let Err(join_err) = task.await {
                    debug!("transport loop aborted: {join_err}");
                }
                if self.state() != SessionState::Disconnected {
                    self.session()
                        .finish_close(Some("transport loop aborted".to_string()));
                }
            }
        }
    }

    // ── Account ─────────────────────────────────────────────────────

    /// Log in with the current settings.
    ///
    /// # Errors
    ///
    /// Returns [`BncsError::InvalidState`] unless the client check has
    /// resolved and no login has succeeded yet.
    pub fn login(&self) -> Result<()> {
        self.session().begin_login(false)
    }

    /// Retry the login after `LoginFailed`, using whatever credentials the
    /// settings hold now. The handshake is not repeated.
    ///
    /// # Errors
    ///
    /// Same as [`login`](Self::login).
    pub fn continue_login(&self) -> Result<()> {
        self.session().begin_login(true)
    }

    /// Create the account named in the settings.
    ///
    /// # Errors
    ///
    /// Same as [`login`](Self::login).
    pub fn create_account(&self) -> Result<()> {
        self.session().begin_account_creation()
    }

    /// Answer `SetMailRequest` with `address`.
    ///
    /// # Errors
    ///
    /// Returns [`BncsError::InvalidState`] before the client check resolves.
    pub fn provide_email(&self, address: &str) -> Result<()> {
        self.session().provide_email(address)
    }

    // ── Chat ────────────────────────────────────────────────────────

    /// Ask to join `channel`.
    ///
    /// # Errors
    ///
    /// Returns [`BncsError::InvalidState`] before entering chat.
    pub fn join_channel(&self, channel: &str, method: JoinMethod) -> Result<()> {
        self.session().join_channel(channel, method)
    }

    /// Queue chat text on the outgoing queue.
    ///
    /// Text beginning with `/` is a command and raises `CommandSent` once it
    /// is transmitted; anything else raises `MessageSent`.
    ///
    /// # Errors
    ///
    /// Returns [`BncsError::InvalidState`] unless in chat or in a channel.
    pub fn send(&self, text: impl Into<String>, priority: Priority) -> Result<()> {
        self.session().send_text(text.into(), priority)
    }

    /// Replace the outgoing queue.
    ///
    /// # Errors
    ///
    /// Returns [`BncsError::InvalidState`] unless disconnected.
    pub fn set_outgoing_queue(&self, queue: Arc<dyn OutgoingQueue>) -> Result<()> {
        self.session().set_outgoing_queue(queue)
    }

    // ── State accessors ─────────────────────────────────────────────

    pub fn state(&self) -> SessionState {
        self.session().state()
    }

    /// The identity notifications are raised with.
    pub fn id(&self) -> ClientId {
        self.session().id
    }

    pub fn notifications(&self) -> &Notifications {
        &self.session().notifications
    }

    /// The name the server assigned on entering chat.
    pub fn unique_username(&self) -> Option<String> {
        self.session().unique_username()
    }

    pub fn current_channel(&self) -> Option<String> {
        self.session().current_channel()
    }

    /// A copy of the current settings.
    pub fn settings(&self) -> ClientSettings {
        self.session().settings.read().clone()
    }

    /// Change settings in place. Later logins, account creations and
    /// connects read the new values; the next connect validates them again.
    pub fn update_settings(&self, change: impl FnOnce(&mut ClientSettings)) {
        change(&mut *self.session().settings.write());
    }
}

impl std::fmt::Debug for BncsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BncsClient")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("has_task", &self.inner.task.lock().is_some())
            .finish()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Last handle gone. Drop cannot await a graceful close, so the loop
        // is aborted outright.
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

// ── Handshake ───────────────────────────────────────────────────────

/// Protocol selector, `SID_AUTH_INFO`, and the zero ping if configured.
async fn handshake(session: &Session, transport: &mut impl Transport) -> Result<()> {
    session.reset_tokens();
    let auth_info = session.auth_info_frame(transport.local_ipv4())?;
    let zero_latency = session.settings.read().ping_method() == Some(PingMethod::ZeroLatency);

    transport.send(&[PROTOCOL_SELECTOR]).await?;
    transport.send(&auth_info).await?;
    drop(auth_info);
    if zero_latency {
        let ping = session.ping_frame(0)?;
        transport.send(&ping).await?;
    }
    Ok(())
}

// ── Transport loop ──────────────────────────────────────────────────

/// Background loop multiplexing queued frames, shutdown and server frames
/// via `tokio::select!`.
///
/// Exits when:
/// - `close` signals shutdown
/// - The transport returns `None` (server closed connection)
/// - A transport error occurs
///
/// Every exit path ends in [`Session::finish_close`], which raises
/// `Disconnected`.
async fn transport_loop(
    mut transport: impl Transport,
    session: Arc<Session>,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    debug!(client = %session.id, "transport loop started");
    session.transition(SessionState::HandshakeSent, SessionState::AwaitingClientCheck);

    let reason = loop {
        let mut inbound = session.buffers.acquire();
        tokio::select! {
            // Branch 1: outgoing work from the client handle
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(Command::Frame(frame)) => {
                        if let Err(e) = transport.send(&frame).await {
                            error!(client = %session.id, "transport send error: {e}");
                            break Some(format!("transport send error: {e}"));
                        }
                    }
                    Some(Command::Chat(text)) => match session.chat_frame(&text) {
                        Ok(frame) => {
                            if let Err(e) = transport.send(&frame).await {
                                error!(client = %session.id, "transport send error: {e}");
                                break Some(format!("transport send error: {e}"));
                            }
                            session.announce_sent(text);
                        }
                        Err(e) => warn!(client = %session.id, error = %e, "dropping chat text"),
                    },
                    // Link dropped without a shutdown signal.
                    None => {
                        debug!(client = %session.id, "command channel closed");
                        break Some("client shut down".to_string());
                    }
                }
            }

            // Branch 2: shutdown signal
            _ = &mut shutdown_rx => {
                debug!(client = %session.id, "shutdown signal received");
                break None;
            }

            // Branch 3: frame from the server
            received = transport.recv(&mut inbound) => {
                match received {
                    Some(Ok(id)) => incoming::handle_frame(&session, id, inbound),
                    Some(Err(e)) => {
                        error!(client = %session.id, "transport receive error: {e}");
                        break Some(format!("transport receive error: {e}"));
                    }
                    None => {
                        debug!(client = %session.id, "transport closed by server");
                        break Some("connection closed by server".to_string());
                    }
                }
            }
        }
    };

    if let Err(e) = transport.close().await {
        debug!(client = %session.id, "transport close error: {e}");
    }
    session.finish_close(reason);
    debug!(client = %session.id, "transport loop exited");
}

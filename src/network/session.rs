//! Peer session: one logical connection to a named peer.
//!
//! A session is carried by two TCP connections, one per direction. The side that
//! connects dials the peer's listener and announces its own listen address in a
//! `ConnectionRequest`; the peer dials back and answers with a
//! `ConnectionConfirmation` on that second socket. Each side therefore writes on
//! the socket it dialed and reads on the socket its listener accepted.

use crate::network::inbox::{Confirmations, Inbox, ReceivedMessage};
use crate::network::message::{MessageArgs, MessageId, MessageType, WireMessage};
use crate::network::message_handler::{Flow, MessageHandler};
use crate::network::session_state::SessionState;
use crate::network::wire::{self, FrameError};
use crate::timer::{Timer, TimerHandle};
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub type SharedWriter = Arc<tokio::sync::Mutex<BufWriter<OwnedWriteHalf>>>;
pub type FrameReader = BufReader<OwnedReadHalf>;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session {peer} is not connected (state: {state})")]
    NotConnected { peer: String, state: SessionState },

    #[error("Session {0} is already connected")]
    AlreadyConnected(String),

    #[error("Session {0} has a handshake in progress")]
    HandshakeInProgress(String),

    #[error("Session {peer} is in error state: {reason}")]
    Faulted { peer: String, reason: String },

    #[error("No local listener; the peer would have no address to dial back")]
    NotListening,

    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out during {stage} with {peer}")]
    Timeout { peer: String, stage: &'static str },

    #[error("Session {0} was closed")]
    Cancelled(String),

    #[error("Unexpected handshake message for {peer} in state {state}")]
    UnexpectedHandshake { peer: String, state: SessionState },

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub local_name: String,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Upper bound for the best-effort termination notice on local close.
    pub termination_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            local_name: "local".to_string(),
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            termination_timeout: Duration::from_secs(2),
        }
    }
}

/// Address and port this node's listener is reachable on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEndpoint {
    pub address: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged { peer: String, state: SessionState },
    MessageQueued { peer: String, id: MessageId },
    /// A signed message arrived that could not be checked; see `PeerSession::unverified`.
    MessageHeld { peer: String, id: MessageId },
}

/// State shared by every session of one registry.
pub struct SessionContext {
    pub config: SessionConfig,
    endpoint: RwLock<Option<LocalEndpoint>>,
    handler: Arc<MessageHandler>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionContext {
    pub fn new(config: SessionConfig, handler: Arc<MessageHandler>) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            config,
            endpoint: RwLock::new(None),
            handler,
            events,
        }
    }

    pub fn endpoint(&self) -> Option<LocalEndpoint> {
        self.endpoint.read().clone()
    }

    pub fn set_endpoint(&self, endpoint: LocalEndpoint) {
        *self.endpoint.write() = Some(endpoint);
    }

    pub fn clear_endpoint(&self) {
        *self.endpoint.write() = None;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

/// Socket ownership follows the state: only `Connecting` and `Connected` hold any.
enum Link {
    Closed,
    Waiting {
        generation: u64,
        timer: Option<TimerHandle>,
    },
    Connecting {
        generation: u64,
        writer: Option<SharedWriter>,
        cancel: CancellationToken,
        confirm: Option<oneshot::Sender<FrameReader>>,
    },
    Connected {
        generation: u64,
        writer: SharedWriter,
        cancel: CancellationToken,
    },
    Error {
        reason: String,
    },
}

impl Link {
    fn state(&self) -> SessionState {
        match self {
            Link::Closed => SessionState::Closed,
            Link::Waiting { .. } => SessionState::WaitingForConnection,
            Link::Connecting { .. } => SessionState::Connecting,
            Link::Connected { .. } => SessionState::Connected,
            Link::Error { .. } => SessionState::Error,
        }
    }

    fn generation(&self) -> Option<u64> {
        match self {
            Link::Waiting { generation, .. }
            | Link::Connecting { generation, .. }
            | Link::Connected { generation, .. } => Some(*generation),
            _ => None,
        }
    }

    /// Drop everything the link owns: stop timers and wake a blocked reader.
    fn release(self) -> Option<SharedWriter> {
        match self {
            Link::Waiting { timer, .. } => {
                if let Some(timer) = timer {
                    timer.cancel();
                }
                None
            }
            Link::Connecting { cancel, writer, .. } => {
                cancel.cancel();
                writer
            }
            Link::Connected { cancel, writer, .. } => {
                cancel.cancel();
                Some(writer)
            }
            Link::Closed | Link::Error { .. } => None,
        }
    }
}

struct Inner {
    link: Link,
    generation: u64,
    remote_address: Option<String>,
    remote_port: Option<u16>,
}

/// Snapshot of a session for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: String,
    pub state: SessionState,
    pub local_address: Option<String>,
    pub local_port: Option<u16>,
    pub remote_address: Option<String>,
    pub remote_port: Option<u16>,
    pub queued: usize,
    pub pending_confirmations: usize,
}

pub struct PeerSession {
    id: String,
    ctx: Arc<SessionContext>,
    inner: Mutex<Inner>,
    inbox: Mutex<Inbox>,
    inbox_notify: Notify,
    confirmations: Mutex<Confirmations>,
    confirm_notify: Notify,
}

impl PeerSession {
    pub fn new(id: &str, ctx: Arc<SessionContext>) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            ctx,
            inner: Mutex::new(Inner {
                link: Link::Closed,
                generation: 0,
                remote_address: None,
                remote_port: None,
            }),
            inbox: Mutex::new(Inbox::default()),
            inbox_notify: Notify::new(),
            confirmations: Mutex::new(Confirmations::default()),
            confirm_notify: Notify::new(),
        })
    }

    /// Peer name.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn local_name(&self) -> &str {
        &self.ctx.config.local_name
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().link.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn info(&self) -> SessionInfo {
        let endpoint = self.ctx.endpoint();
        let inner = self.inner.lock();
        SessionInfo {
            id: self.id.clone(),
            state: inner.link.state(),
            local_address: endpoint.as_ref().map(|e| e.address.clone()),
            local_port: endpoint.map(|e| e.port),
            remote_address: inner.remote_address.clone(),
            remote_port: inner.remote_port,
            queued: self.inbox.lock().len(),
            pending_confirmations: self.confirmations.lock().pending(),
        }
    }

    /// Replace the link, logging the transition. Caller holds the lock.
    fn set_link(&self, inner: &mut Inner, link: Link) -> Option<SharedWriter> {
        let from = inner.link.state();
        let to = link.state();
        if !from.can_transition(to) {
            error!(
                "❌ Invalid state transition for {}: {} -> {}",
                self.id, from, to
            );
        }
        let old = std::mem::replace(&mut inner.link, link);
        if from != to {
            debug!("✅ State transition for {}: {} -> {}", self.id, from, to);
            self.ctx.emit(SessionEvent::StateChanged {
                peer: self.id.clone(),
                state: to,
            });
        }
        old.release()
    }

    fn not_connected(&self, state: SessionState) -> SessionError {
        SessionError::NotConnected {
            peer: self.id.clone(),
            state,
        }
    }

    fn wake_waiters(&self) {
        self.inbox_notify.notify_waiters();
        self.confirm_notify.notify_waiters();
    }

    /// Passively wait for the peer to connect through the listener.
    ///
    /// No-op when already connected. With a timeout, falls back to `Closed` if
    /// nobody connects in time.
    pub fn wait_for_connection(
        self: &Arc<Self>,
        wait: Option<Duration>,
    ) -> Result<(), SessionError> {
        let mut inner = self.inner.lock();
        match &inner.link {
            Link::Connected { .. } => return Ok(()),
            Link::Connecting { .. } => {
                return Err(SessionError::HandshakeInProgress(self.id.clone()))
            }
            Link::Error { reason } => {
                return Err(SessionError::Faulted {
                    peer: self.id.clone(),
                    reason: reason.clone(),
                })
            }
            Link::Closed | Link::Waiting { .. } => {}
        }

        inner.generation += 1;
        let generation = inner.generation;
        let timer = wait.map(|wait| {
            let session = Arc::downgrade(self);
            Timer::schedule(wait, move || {
                if let Some(session) = session.upgrade() {
                    session.expire_wait(generation);
                }
            })
        });
        self.set_link(&mut inner, Link::Waiting { generation, timer });
        info!("👂 Waiting for {} to connect", self.id);
        Ok(())
    }

    fn expire_wait(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if matches!(inner.link, Link::Waiting { generation: g, .. } if g == generation) {
            info!("⏰ Nobody connected as {}, no longer waiting", self.id);
            self.set_link(&mut inner, Link::Closed);
        }
    }

    /// Enter `Connecting` from `Closed` or `WaitingForConnection`.
    fn begin_connecting(
        &self,
        confirm: Option<oneshot::Sender<FrameReader>>,
    ) -> Result<(u64, CancellationToken), SessionError> {
        let mut inner = self.inner.lock();
        match &inner.link {
            Link::Connected { .. } => return Err(SessionError::AlreadyConnected(self.id.clone())),
            Link::Connecting { .. } => {
                return Err(SessionError::HandshakeInProgress(self.id.clone()))
            }
            Link::Error { reason } => {
                return Err(SessionError::Faulted {
                    peer: self.id.clone(),
                    reason: reason.clone(),
                })
            }
            Link::Closed | Link::Waiting { .. } => {}
        }

        inner.generation += 1;
        let generation = inner.generation;
        let cancel = CancellationToken::new();
        self.set_link(
            &mut inner,
            Link::Connecting {
                generation,
                writer: None,
                cancel: cancel.clone(),
                confirm,
            },
        );
        Ok((generation, cancel))
    }

    /// Leave a failed handshake, but only if no one else has moved the session on.
    fn abort_connecting(&self, generation: u64, reason: &SessionError) {
        let mut inner = self.inner.lock();
        if matches!(inner.link, Link::Connecting { generation: g, .. } if g == generation) {
            warn!("❌ Handshake with {} failed: {}", self.id, reason);
            self.set_link(&mut inner, Link::Closed);
        }
    }

    async fn dial(
        &self,
        generation: u64,
        cancel: &CancellationToken,
        address: &str,
        port: u16,
    ) -> Result<SharedWriter, SessionError> {
        let addr = format!("{}:{}", address, port);
        debug!("🔗 [OUTBOUND] Dialing {} for {}", addr, self.id);

        let stream = tokio::select! {
            _ = cancel.cancelled() => return Err(SessionError::Cancelled(self.id.clone())),
            result = timeout(self.ctx.config.connect_timeout, TcpStream::connect(&addr)) => {
                match result {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(source)) => return Err(SessionError::Connect { addr, source }),
                    Err(_) => {
                        return Err(SessionError::Timeout {
                            peer: self.id.clone(),
                            stage: "connect",
                        })
                    }
                }
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY for {}: {}", addr, e);
        }

        // Outbound socket is write-only; the peer's dial-back carries the other direction
        let (_, write_half) = stream.into_split();
        let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(BufWriter::new(write_half)));

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        match &mut inner.link {
            Link::Connecting {
                generation: g,
                writer: slot,
                ..
            } if *g == generation => {
                *slot = Some(writer.clone());
                inner.remote_address = Some(address.to_string());
                inner.remote_port = Some(port);
                Ok(writer)
            }
            _ => Err(SessionError::Cancelled(self.id.clone())),
        }
    }

    /// Actively connect to the peer's listener and complete the handshake.
    ///
    /// On any failure the session is back in `Closed` when this returns.
    pub async fn connect(
        self: &Arc<Self>,
        remote_address: &str,
        remote_port: u16,
    ) -> Result<(), SessionError> {
        let endpoint = self.ctx.endpoint().ok_or(SessionError::NotListening)?;
        let (confirm_tx, confirm_rx) = oneshot::channel();
        let (generation, cancel) = self.begin_connecting(Some(confirm_tx))?;
        info!(
            "🔗 Connecting to {} at {}:{}",
            self.id, remote_address, remote_port
        );

        let result = async {
            let writer = self
                .dial(generation, &cancel, remote_address, remote_port)
                .await?;

            let request = WireMessage::new(MessageType::ConnectionRequest).with_args(MessageArgs {
                username: Some(self.local_name().to_string()),
                address: Some(endpoint.address.clone()),
                port: Some(endpoint.port),
                ..Default::default()
            });
            self.send_on(&writer, &request, &cancel).await?;

            tokio::select! {
                _ = cancel.cancelled() => Err(SessionError::Cancelled(self.id.clone())),
                result = timeout(self.ctx.config.handshake_timeout, confirm_rx) => match result {
                    Ok(Ok(reader)) => Ok(reader),
                    Ok(Err(_)) => Err(SessionError::Cancelled(self.id.clone())),
                    Err(_) => Err(SessionError::Timeout {
                        peer: self.id.clone(),
                        stage: "handshake",
                    }),
                },
            }
        }
        .await;

        match result {
            Ok(reader) => self.finish_connecting(generation, reader),
            Err(e) => {
                self.abort_connecting(generation, &e);
                Err(e)
            }
        }
    }

    /// Accept a `ConnectionRequest` read by the listener on `reader`: dial the
    /// peer back at its advertised address and confirm.
    ///
    /// A session that is already connected or mid-handshake rejects the request
    /// and keeps its current sockets.
    pub async fn accept_inbound(
        self: &Arc<Self>,
        reader: FrameReader,
        dial_address: &str,
        dial_port: u16,
    ) -> Result<(), SessionError> {
        let (generation, cancel) = self.begin_connecting(None)?;
        info!(
            "🔗 [Inbound] {} requested a connection, dialing back {}:{}",
            self.id, dial_address, dial_port
        );

        let result = async {
            let writer = self.dial(generation, &cancel, dial_address, dial_port).await?;
            let confirmation =
                WireMessage::new(MessageType::ConnectionConfirmation).with_args(MessageArgs {
                    username: Some(self.local_name().to_string()),
                    ..Default::default()
                });
            self.send_on(&writer, &confirmation, &cancel).await
        }
        .await;

        match result {
            Ok(()) => self.finish_connecting(generation, reader),
            Err(e) => {
                self.abort_connecting(generation, &e);
                Err(e)
            }
        }
    }

    /// Hand the dial-back socket carrying a `ConnectionConfirmation` to the
    /// pending `connect` call.
    pub fn complete_handshake(&self, reader: FrameReader) -> Result<(), SessionError> {
        let mut inner = self.inner.lock();
        let state = inner.link.state();
        if let Link::Connecting { confirm, .. } = &mut inner.link {
            if let Some(tx) = confirm.take() {
                return tx
                    .send(reader)
                    .map_err(|_| SessionError::Cancelled(self.id.clone()));
            }
        }
        Err(SessionError::UnexpectedHandshake {
            peer: self.id.clone(),
            state,
        })
    }

    fn finish_connecting(
        self: &Arc<Self>,
        generation: u64,
        reader: FrameReader,
    ) -> Result<(), SessionError> {
        let cancel = {
            let mut inner = self.inner.lock();
            let (writer, cancel) = match &inner.link {
                Link::Connecting {
                    generation: g,
                    writer: Some(writer),
                    cancel,
                    ..
                } if *g == generation => (writer.clone(), cancel.clone()),
                _ => return Err(SessionError::Cancelled(self.id.clone())),
            };
            self.set_link(
                &mut inner,
                Link::Connected {
                    generation,
                    writer,
                    cancel: cancel.clone(),
                },
            );
            cancel
        };

        info!("✅ Connected to {}", self.id);
        self.spawn_receive_loop(reader, generation, cancel);
        Ok(())
    }

    fn spawn_receive_loop(
        self: &Arc<Self>,
        reader: FrameReader,
        generation: u64,
        cancel: CancellationToken,
    ) {
        let task = tokio::spawn(self.clone().run_receive_loop(reader, generation, cancel));
        self.watch_receive_loop(task, generation);
    }

    /// Fault the connection `generation` if its receive loop panics.
    fn watch_receive_loop(self: &Arc<Self>, task: JoinHandle<()>, generation: u64) {
        let session: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            if let Err(e) = task.await {
                if e.is_panic() {
                    if let Some(session) = session.upgrade() {
                        session.fail(generation, "receive loop panicked".to_string());
                    }
                }
            }
        });
    }

    async fn run_receive_loop(
        self: Arc<Self>,
        mut reader: FrameReader,
        generation: u64,
        cancel: CancellationToken,
    ) {
        debug!("🔄 Starting receive loop for {}", self.id);
        let handler = self.ctx.handler.clone();

        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Receive loop for {} cancelled", self.id);
                    return;
                }
                frame = wire::read_message(&mut reader) => frame,
            };

            match frame {
                Ok(Some(message)) => {
                    debug!("📥 {} <- {}", self.id, message.summary());
                    // Replies from the handler write to the peer and may block
                    let handled = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            debug!("Receive loop for {} cancelled mid-dispatch", self.id);
                            return;
                        }
                        handled = handler.handle(&self, message) => handled,
                    };
                    match handled {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Terminate) => {
                            info!("👋 {} closed the connection", self.id);
                            self.close_remote(generation);
                            return;
                        }
                        Err(e) => warn!("⚠️ Dropped message from {}: {}", self.id, e),
                    }
                }
                Ok(None) => {
                    info!("🔌 {} disconnected (EOF)", self.id);
                    self.close_remote(generation);
                    return;
                }
                Err(e) if e.is_recoverable() => {
                    warn!("⚠️ Dropped malformed frame from {}: {}", self.id, e);
                }
                Err(e) => {
                    warn!("❌ Connection to {} failed: {}", self.id, e);
                    self.close_remote(generation);
                    return;
                }
            }
        }
    }

    /// Tear down after the peer terminated or the transport failed. The peer is not notified.
    fn close_remote(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.link.generation() == Some(generation) && inner.link.state().holds_sockets() {
            self.set_link(&mut inner, Link::Closed);
            drop(inner);
            self.wake_waiters();
        }
    }

    /// Move to `Error` after an unrecoverable fault in the connection identified by `generation`.
    fn fail(&self, generation: u64, reason: String) {
        let mut inner = self.inner.lock();
        if inner.link.generation() == Some(generation) {
            error!("💥 Session {} failed: {}", self.id, reason);
            self.set_link(&mut inner, Link::Error { reason });
            drop(inner);
            self.wake_waiters();
        }
    }

    /// Close from any state. A connected peer is told first, best-effort.
    pub async fn close(&self) {
        let (writer, notify_peer) = {
            let mut inner = self.inner.lock();
            // A write holding the lock is cut off mid-frame; anything after it would be garbage
            let notify_peer = match &inner.link {
                Link::Connected { writer, .. } => writer.try_lock().is_ok(),
                _ => false,
            };
            (self.set_link(&mut inner, Link::Closed), notify_peer)
        };
        self.wake_waiters();

        let Some(writer) = writer else {
            return;
        };
        info!("🔌 Closing session {}", self.id);

        if notify_peer {
            let termination =
                WireMessage::new(MessageType::ConnectionTermination).with_args(MessageArgs {
                    username: Some(self.local_name().to_string()),
                    ..Default::default()
                });
            let notice = async {
                let mut writer = writer.lock().await;
                wire::write_message(&mut *writer, &termination).await?;
                writer.shutdown().await?;
                Ok::<(), FrameError>(())
            };
            match timeout(self.ctx.config.termination_timeout, notice).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("Termination notice to {} failed: {}", self.id, e),
                Err(_) => debug!("Termination notice to {} timed out", self.id),
            }
        }
    }

    fn connected_writer(&self) -> Result<(SharedWriter, u64, CancellationToken), SessionError> {
        let inner = self.inner.lock();
        match &inner.link {
            Link::Connected {
                writer,
                generation,
                cancel,
            } => Ok((writer.clone(), *generation, cancel.clone())),
            other => Err(self.not_connected(other.state())),
        }
    }

    pub fn ensure_connected(&self) -> Result<(), SessionError> {
        self.connected_writer().map(|_| ())
    }

    /// Send a message on the established connection. Fails fast unless connected.
    ///
    /// A send blocked on a peer that stopped reading gives up with `Cancelled`
    /// as soon as the session is closed.
    pub async fn push_message(&self, message: &WireMessage) -> Result<(), SessionError> {
        let (writer, generation, cancel) = self.connected_writer()?;
        match self.send_on(&writer, message, &cancel).await {
            Ok(()) => {
                debug!("📤 {} -> {}", self.id, message.summary());
                Ok(())
            }
            Err(e @ SessionError::Cancelled(_)) => {
                debug!("Send to {} interrupted by close", self.id);
                Err(e)
            }
            Err(e) => {
                warn!("❌ Send to {} failed: {}", self.id, e);
                self.close_remote(generation);
                Err(e)
            }
        }
    }

    /// Write one frame unless `cancel` fires first. Cancellation drops the lock
    /// guard, so the connection's write half is released with the session.
    async fn send_on(
        &self,
        writer: &SharedWriter,
        message: &WireMessage,
        cancel: &CancellationToken,
    ) -> Result<(), SessionError> {
        let write = async {
            let mut writer = writer.lock().await;
            wire::write_message(&mut *writer, message).await
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SessionError::Cancelled(self.id.clone())),
            result = write => Ok(result?),
        }
    }

    // Inbound queue

    pub(crate) fn enqueue(&self, message: ReceivedMessage) {
        let id = message.id;
        self.inbox.lock().push(message);
        self.inbox_notify.notify_waiters();
        self.ctx.emit(SessionEvent::MessageQueued {
            peer: self.id.clone(),
            id,
        });
    }

    pub(crate) fn hold(&self, message: ReceivedMessage) {
        let id = message.id;
        let evicted = self.inbox.lock().hold(message);
        if let Some(evicted) = evicted {
            warn!(
                "🗑️ Too many unverified messages from {}, dropped {}",
                self.id, evicted.id
            );
        }
        self.ctx.emit(SessionEvent::MessageHeld {
            peer: self.id.clone(),
            id,
        });
    }

    pub fn read_next(&self) -> Option<ReceivedMessage> {
        self.inbox.lock().pop()
    }

    pub fn peek_next(&self) -> Option<ReceivedMessage> {
        self.inbox.lock().peek().cloned()
    }

    pub fn pending_count(&self) -> usize {
        self.inbox.lock().len()
    }

    /// Wait up to `wait` for the next message.
    pub async fn next_message(&self, wait: Duration) -> Option<ReceivedMessage> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.inbox_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(message) = self.read_next() {
                return Some(message);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.read_next();
            }
        }
    }

    pub fn unverified(&self) -> Vec<ReceivedMessage> {
        self.inbox.lock().held()
    }

    /// Deliver a held message as if it had been trusted.
    pub fn accept_unverified(&self, id: MessageId) -> bool {
        let released = self.inbox.lock().release(id);
        if released {
            self.inbox_notify.notify_waiters();
            self.ctx.emit(SessionEvent::MessageQueued {
                peer: self.id.clone(),
                id,
            });
        }
        released
    }

    pub fn discard_unverified(&self, id: MessageId) -> bool {
        self.inbox.lock().discard(id)
    }

    // Confirmations

    /// Reserve `id` for a confirmed send. False if it is already pending.
    pub fn register_confirmation(&self, id: MessageId) -> bool {
        self.confirmations.lock().register(id)
    }

    pub(crate) fn record_confirmation(&self, id: MessageId) -> bool {
        let recorded = self.confirmations.lock().record(id);
        if recorded {
            self.confirm_notify.notify_waiters();
        } else {
            debug!("Ignoring unsolicited confirmation {} from {}", id, self.id);
        }
        recorded
    }

    pub fn forget_confirmation(&self, id: MessageId) {
        self.confirmations.lock().forget(id);
    }

    pub fn pending_confirmations(&self) -> usize {
        self.confirmations.lock().pending()
    }

    /// Wait until the peer acknowledges `id`, the timeout elapses, or the session closes.
    /// The id is released either way.
    pub async fn wait_for_confirmation(&self, id: MessageId, wait: Duration) -> bool {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.confirm_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.confirmations.lock().take(id) {
                return true;
            }
            if !self.is_connected() {
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }
        let mut confirmations = self.confirmations.lock();
        let arrived = confirmations.take(id);
        confirmations.forget(id);
        arrived
    }
}

//! Named peer sessions and the listener that feeds them.

use crate::contacts::ContactDirectory;
use crate::network::listener::Listener;
use crate::network::message_handler::MessageHandler;
use crate::network::session::{
    LocalEndpoint, PeerSession, SessionConfig, SessionContext, SessionError, SessionEvent,
    SessionInfo,
};
use crate::network::session_state::SessionState;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("A session named {0} already exists")]
    NameInUse(String),

    #[error("No session named {0}")]
    UnknownPeer(String),

    #[error("{0} is this node's own name")]
    OwnName(String),

    #[error("Already listening on port {0}")]
    AlreadyListening(u16),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("No contact named {0}")]
    UnknownContact(String),

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Owns every session of this node, keyed by peer name.
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<PeerSession>>,
    ctx: Arc<SessionContext>,
    contacts: Arc<dyn ContactDirectory>,
    listener: Mutex<Option<Listener>>,
}

impl SessionRegistry {
    pub fn new(
        config: SessionConfig,
        handler: Arc<MessageHandler>,
        contacts: Arc<dyn ContactDirectory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            ctx: Arc::new(SessionContext::new(config, handler)),
            contacts,
            listener: Mutex::new(None),
        })
    }

    pub fn local_name(&self) -> &str {
        &self.ctx.config.local_name
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.ctx.subscribe()
    }

    pub fn endpoint(&self) -> Option<LocalEndpoint> {
        self.ctx.endpoint()
    }

    fn check_name(&self, name: &str) -> Result<(), RegistryError> {
        if name == self.local_name() {
            return Err(RegistryError::OwnName(name.to_string()));
        }
        Ok(())
    }

    /// Create a closed session for `name`. Fails if the name is taken.
    pub fn create(&self, name: &str) -> Result<Arc<PeerSession>, RegistryError> {
        use dashmap::mapref::entry::Entry;

        self.check_name(name)?;
        match self.sessions.entry(name.to_string()) {
            Entry::Occupied(_) => Err(RegistryError::NameInUse(name.to_string())),
            Entry::Vacant(slot) => {
                let session = PeerSession::new(name, self.ctx.clone());
                slot.insert(session.clone());
                debug!("Created session {}", name);
                Ok(session)
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<PeerSession>> {
        self.sessions.get(name).map(|s| s.value().clone())
    }

    pub fn require(&self, name: &str) -> Result<Arc<PeerSession>, RegistryError> {
        self.get(name)
            .ok_or_else(|| RegistryError::UnknownPeer(name.to_string()))
    }

    pub fn get_or_create(&self, name: &str) -> Result<Arc<PeerSession>, RegistryError> {
        self.get_or_create_tracked(name).map(|(session, _)| session)
    }

    /// Like `get_or_create`, also reporting whether this call made the session.
    pub(crate) fn get_or_create_tracked(
        &self,
        name: &str,
    ) -> Result<(Arc<PeerSession>, bool), RegistryError> {
        use dashmap::mapref::entry::Entry;

        self.check_name(name)?;
        match self.sessions.entry(name.to_string()) {
            Entry::Occupied(slot) => Ok((slot.get().clone(), false)),
            Entry::Vacant(slot) => {
                let session = PeerSession::new(name, self.ctx.clone());
                slot.insert(session.clone());
                debug!("Created session {}", name);
                Ok((session, true))
            }
        }
    }

    /// Drop a session made for an inbound request whose handshake failed. Leaves
    /// it alone if it was replaced or something has since put it to use.
    pub(crate) fn discard_unused(&self, session: &Arc<PeerSession>) {
        let removed = self.sessions.remove_if(session.id(), |_, current| {
            Arc::ptr_eq(current, session)
                && current.state() == SessionState::Closed
                && current.pending_count() == 0
        });
        if removed.is_some() {
            debug!("Discarded unused session {}", session.id());
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sessions.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sessions.iter().map(|s| s.key().clone()).collect();
        names.sort();
        names
    }

    pub fn info(&self) -> Vec<SessionInfo> {
        let sessions: Vec<Arc<PeerSession>> =
            self.sessions.iter().map(|s| s.value().clone()).collect();
        let mut info: Vec<SessionInfo> = sessions.iter().map(|s| s.info()).collect();
        info.sort_by(|a, b| a.id.cmp(&b.id));
        info
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Connect to `name` at an explicit address, creating the session if needed.
    pub async fn connect(
        &self,
        name: &str,
        address: &str,
        port: u16,
    ) -> Result<Arc<PeerSession>, RegistryError> {
        let session = self.get_or_create(name)?;
        session.connect(address, port).await?;
        Ok(session)
    }

    /// Connect to a peer at the address its contact entry lists.
    pub async fn connect_contact(&self, name: &str) -> Result<Arc<PeerSession>, RegistryError> {
        let contact = self
            .contacts
            .lookup(name)
            .ok_or_else(|| RegistryError::UnknownContact(name.to_string()))?;
        self.connect(name, &contact.address, contact.port).await
    }

    /// Wait passively for `name` to connect through the listener.
    pub fn listen(
        &self,
        name: &str,
        wait: Option<Duration>,
    ) -> Result<Arc<PeerSession>, RegistryError> {
        let session = self.get_or_create(name)?;
        session.wait_for_connection(wait)?;
        Ok(session)
    }

    pub async fn close(&self, name: &str) -> Result<(), RegistryError> {
        self.require(name)?.close().await;
        Ok(())
    }

    /// Close the session and forget it. Queued messages are discarded.
    pub async fn destroy(&self, name: &str) -> Result<(), RegistryError> {
        let (_, session) = self
            .sessions
            .remove(name)
            .ok_or_else(|| RegistryError::UnknownPeer(name.to_string()))?;
        session.close().await;
        info!("🗑️ Destroyed session {}", name);
        Ok(())
    }

    /// Start accepting handshakes on `bind_address:port` and advertise
    /// `advertise_address` with the bound port to peers we connect to.
    ///
    /// Port 0 binds an ephemeral port; the returned address has the real one.
    pub async fn start_listener(
        self: &Arc<Self>,
        bind_address: &str,
        port: u16,
        advertise_address: &str,
    ) -> Result<SocketAddr, RegistryError> {
        if let Some(existing) = self.listener.lock().as_ref() {
            return Err(RegistryError::AlreadyListening(existing.local_addr().port()));
        }

        let addr = format!("{}:{}", bind_address, port);
        let listener = Listener::bind(
            &addr,
            Arc::downgrade(self),
            self.ctx.config.handshake_timeout,
        )
        .await
        .map_err(|source| RegistryError::Bind { addr, source })?;
        let local_addr = listener.local_addr();

        // Lost a race with a concurrent start
        let raced = {
            let mut slot = self.listener.lock();
            match slot.as_ref() {
                Some(existing) => Some((listener, existing.local_addr().port())),
                None => {
                    *slot = Some(listener);
                    None
                }
            }
        };
        if let Some((listener, port)) = raced {
            listener.stop().await;
            return Err(RegistryError::AlreadyListening(port));
        }

        self.ctx.set_endpoint(LocalEndpoint {
            address: advertise_address.to_string(),
            port: local_addr.port(),
        });
        Ok(local_addr)
    }

    pub fn listening_on(&self) -> Option<SocketAddr> {
        self.listener.lock().as_ref().map(|l| l.local_addr())
    }

    /// Stop the listener. Established sessions stay up; new `connect` calls fail.
    pub async fn stop_listener(&self) -> bool {
        let listener = self.listener.lock().take();
        match listener {
            Some(listener) => {
                self.ctx.clear_endpoint();
                listener.stop().await;
                true
            }
            None => false,
        }
    }

    /// Stop listening and close every session.
    pub async fn shutdown(&self) {
        self.stop_listener().await;
        let sessions: Vec<Arc<PeerSession>> =
            self.sessions.iter().map(|s| s.value().clone()).collect();
        for session in sessions {
            session.close().await;
        }
        info!("🛑 Closed {} session(s)", self.sessions.len());
    }
}

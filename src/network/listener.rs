//! Accept loop for inbound handshake connections.
//!
//! The first frame on an accepted socket decides what it is for. A
//! `ConnectionRequest` starts the accepting side of a handshake, a
//! `ConnectionConfirmation` is the dial-back for a handshake this node started.
//! After that frame the socket only carries data from the peer to us.

use crate::network::message::{MessageType, WireMessage};
use crate::network::registry::SessionRegistry;
use crate::network::session::FrameReader;
use crate::network::wire;
use std::net::{IpAddr, SocketAddr};
use std::sync::Weak;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct Listener {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Listener {
    /// Bind `bind_addr` and start accepting in a background task.
    pub(crate) async fn bind(
        bind_addr: &str,
        registry: Weak<SessionRegistry>,
        handshake_timeout: Duration,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(accept_loop(
            listener,
            registry,
            handshake_timeout,
            cancel.clone(),
        ));
        info!("👂 Listening for peers on {}", local_addr);
        Ok(Self {
            local_addr,
            cancel,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting. Sessions already handed off are unaffected.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            if e.is_panic() {
                error!("💥 Accept loop on {} panicked", self.local_addr);
            }
        }
        info!("🛑 Stopped listening on {}", self.local_addr);
    }
}

async fn accept_loop(
    listener: TcpListener,
    registry: Weak<SessionRegistry>,
    handshake_timeout: Duration,
    cancel: CancellationToken,
) {
    loop {
        let (stream, addr) = tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    // Usually fd exhaustion; back off instead of spinning
                    warn!("⚠️ Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            },
        };
        debug!("🔌 [INBOUND] Connection from {}", addr);

        let registry = registry.clone();
        tokio::spawn(async move {
            handle_inbound(stream, addr, registry, handshake_timeout).await;
        });
    }
}

async fn handle_inbound(
    stream: TcpStream,
    addr: SocketAddr,
    registry: Weak<SessionRegistry>,
    handshake_timeout: Duration,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Could not set TCP_NODELAY for {}: {}", addr, e);
    }
    // Accepted sockets are read-only; replies go out on the socket we dial
    let (read_half, _) = stream.into_split();
    let mut reader: FrameReader = BufReader::new(read_half);

    let first = match tokio::time::timeout(handshake_timeout, wire::read_message(&mut reader)).await
    {
        Ok(Ok(Some(message))) => message,
        Ok(Ok(None)) => {
            debug!("🔌 {} closed before handshake", addr);
            return;
        }
        Ok(Err(e)) => {
            warn!("⚠️ Bad handshake frame from {}: {}", addr, e);
            return;
        }
        Err(_) => {
            warn!("⏰ No handshake from {} within {:?}", addr, handshake_timeout);
            return;
        }
    };

    let Some(registry) = registry.upgrade() else {
        return;
    };

    match first.message_type() {
        MessageType::ConnectionRequest => on_request(&registry, first, reader, addr).await,
        MessageType::ConnectionConfirmation => on_confirmation(&registry, &first, reader, addr),
        other => warn!(
            "⚠️ Expected handshake from {}, got {:?}; dropping connection",
            addr, other
        ),
    }
}

async fn on_request(
    registry: &SessionRegistry,
    request: WireMessage,
    reader: FrameReader,
    addr: SocketAddr,
) {
    let args = request.args();
    let (Some(peer), Some(port)) = (args.username.clone(), args.port) else {
        warn!("⚠️ Connection request from {} lacks username or port", addr);
        return;
    };
    let dial_address = dial_back_address(args.address.as_deref(), addr.ip());

    let (session, created) = match registry.get_or_create_tracked(&peer) {
        Ok(tracked) => tracked,
        Err(e) => {
            warn!("❌ Rejected connection request from {} ({}): {}", peer, addr, e);
            return;
        }
    };
    if let Err(e) = session.accept_inbound(reader, &dial_address, port).await {
        warn!("❌ Rejected connection request from {} ({}): {}", peer, addr, e);
        if created {
            registry.discard_unused(&session);
        }
    }
}

fn on_confirmation(
    registry: &SessionRegistry,
    confirmation: &WireMessage,
    reader: FrameReader,
    addr: SocketAddr,
) {
    let Some(peer) = confirmation.sender() else {
        warn!("⚠️ Connection confirmation from {} lacks username", addr);
        return;
    };
    match registry.get(peer) {
        Some(session) => {
            if let Err(e) = session.complete_handshake(reader) {
                warn!("⚠️ Dropped confirmation from {} ({}): {}", peer, addr, e);
            }
        }
        None => warn!("⚠️ Confirmation from unknown peer {} ({})", peer, addr),
    }
}

/// Where to dial back: the advertised address, or the source IP when the peer
/// advertised none or a wildcard.
fn dial_back_address(advertised: Option<&str>, source: IpAddr) -> String {
    match advertised {
        Some(address) if !address.is_empty() => match address.parse::<IpAddr>() {
            Ok(ip) if ip.is_unspecified() => source.to_string(),
            _ => address.to_string(),
        },
        _ => source.to_string(),
    }
}

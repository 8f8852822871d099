pub mod inbox;
pub mod listener;
pub mod message;
pub mod message_handler;
pub mod registry;
pub mod session;
pub mod session_state;
pub mod wire;

pub use inbox::{Authenticity, ContentKind, ReceivedMessage};
pub use message::{MessageArgs, MessageId, MessageType, WireMessage};
pub use message_handler::{DispatchError, Flow, MessageHandler};
pub use registry::{RegistryError, SessionRegistry};
pub use session::{PeerSession, SessionConfig, SessionError, SessionEvent, SessionInfo};
pub use session_state::SessionState;

//! Install sessions: state machine, registry and listeners.

mod event;
mod registry;
mod state;

pub use event::{ChannelListener, SessionListener};
pub use registry::SessionRegistry;
pub use state::{session_id_for, ConfirmationHandle, InstallSession, SessionState, SessionStatus};

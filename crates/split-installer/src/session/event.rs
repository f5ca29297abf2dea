//! Delivery of session-state snapshots to interested parties.

use tokio::sync::mpsc;

use super::SessionState;

/// Receives every broadcast session-state change.
pub trait SessionListener: Send + Sync {
    fn on_state_update(&self, state: &SessionState);
}

impl<F> SessionListener for F
where
    F: Fn(&SessionState) + Send + Sync,
{
    fn on_state_update(&self, state: &SessionState) {
        self(state)
    }
}

/// Forwards snapshots into an unbounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<SessionState>,
}

impl ChannelListener {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SessionState>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl SessionListener for ChannelListener {
    fn on_state_update(&self, state: &SessionState) {
        if self.tx.send(state.clone()).is_err() {
            log::debug!("Dropping update for session {}: receiver gone", state.session_id);
        }
    }
}

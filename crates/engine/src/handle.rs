//! Shareable handles onto a running connection
//!
//! The worker and outside callers share the session behind a mutex. It is
//! only ever held for synchronous work, never across an await.

use mps_protocol::ControlMessage;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::channel::{ChannelEvent, ChannelState, ChannelTarget};
use crate::error::EngineError;
use crate::handshake::Binding;
use crate::registry::ConnectionKind;
use crate::session::Session;

/// Handle to one physical connection
#[derive(Clone)]
pub struct ConnectionHandle {
    id: u64,
    session: Arc<Mutex<Session>>,
}

impl ConnectionHandle {
    pub fn new(session: Session) -> Self {
        Self {
            id: session.id(),
            session: Arc::new(Mutex::new(session)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> ConnectionKind {
        self.session.lock().kind()
    }

    pub fn binding(&self) -> Option<Binding> {
        self.session.lock().binding().cloned()
    }

    pub fn bound_ports(&self) -> Vec<u32> {
        self.session.lock().bound_ports().to_vec()
    }

    pub fn is_closed(&self) -> bool {
        self.session.lock().is_closed()
    }

    /// Open a channel to the device; events arrive on the returned receiver
    pub fn open_channel(
        &self,
        target: ChannelTarget,
    ) -> Result<(ChannelHandle, UnboundedReceiver<ChannelEvent>), EngineError> {
        let (id, events) = self.session.lock().open_channel(target)?;
        let handle = ChannelHandle {
            id,
            session: Arc::clone(&self.session),
        };
        Ok((handle, events))
    }

    pub fn send_control(&self, message: &ControlMessage) -> Result<(), EngineError> {
        self.session.lock().send_control(message)
    }

    pub(crate) fn with_session<R>(&self, f: impl FnOnce(&mut Session) -> R) -> R {
        f(&mut *self.session.lock())
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle").field("id", &self.id).finish()
    }
}

/// Handle to one virtual channel
#[derive(Clone)]
pub struct ChannelHandle {
    id: u32,
    session: Arc<Mutex<Session>>,
}

impl ChannelHandle {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Queue or send `data`. `Ok(false)` means wait for `ChannelEvent::Flushed`.
    pub fn write(&self, data: &[u8]) -> Result<bool, EngineError> {
        self.session.lock().write_channel(self.id, data)
    }

    pub fn close(&self) {
        self.session.lock().close_channel(self.id)
    }

    /// Current state; `Closed` once the channel is gone
    pub fn state(&self) -> ChannelState {
        self.session
            .lock()
            .channel(self.id)
            .map(|channel| channel.state())
            .unwrap_or(ChannelState::Closed)
    }
}

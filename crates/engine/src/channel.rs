//! Virtual channel state and credit accounting
//!
//! A `Channel` only does bookkeeping: it decides how many bytes may go out
//! and what has to wait. The session turns the results into frames.

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

/// Channel lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum ChannelState {
    Closed = 0,
    Opening = 1,
    Open = 2,
}

/// Notifications delivered to whoever opened the channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Payload received from the device
    Data(Bytes),
    /// The channel changed state
    State(ChannelState),
    /// A backlog blocked on credit has been fully transmitted
    Flushed,
}

/// Where a server-initiated channel should lead on the device side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelTarget {
    pub target_address: String,
    pub target_port: u32,
    pub source_address: String,
    pub source_port: u32,
}

impl ChannelTarget {
    /// Target a port on the device itself
    pub fn local_port(port: u32) -> Self {
        Self {
            target_address: "127.0.0.1".to_string(),
            target_port: port,
            source_address: "127.0.0.1".to_string(),
            source_port: 0,
        }
    }
}

/// A virtual channel inside one connection
#[derive(Debug)]
pub struct Channel {
    pub(crate) local_id: u32,
    pub(crate) remote_id: Option<u32>,
    pub(crate) state: ChannelState,
    /// Bytes we may still send before the peer adjusts the window
    pub(crate) send_credit: u32,
    /// Receive window we advertised
    pub(crate) recv_window: u32,
    /// Bytes received since the last WINDOW_ADJUST we sent
    pub(crate) unacked: u32,
    /// Data waiting for confirmation or credit, in write order
    pub(crate) pending: BytesMut,
    /// Closed by the owner before confirmation arrived. The entry stays in
    /// the channel map until the peer confirms or refuses the open, or the
    /// connection is torn down.
    pub(crate) close_pending: bool,
    events: UnboundedSender<ChannelEvent>,
}

impl Channel {
    pub(crate) fn new(local_id: u32, recv_window: u32, events: UnboundedSender<ChannelEvent>) -> Self {
        Self {
            local_id,
            remote_id: None,
            state: ChannelState::Opening,
            send_credit: 0,
            recv_window,
            unacked: 0,
            pending: BytesMut::new(),
            close_pending: false,
            events,
        }
    }

    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    pub fn remote_id(&self) -> Option<u32> {
        self.remote_id
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn send_credit(&self) -> u32 {
        self.send_credit
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn notify(&self, event: ChannelEvent) {
        // The owner may have dropped its receiver
        let _ = self.events.send(event);
    }

    pub(crate) fn set_state(&mut self, state: ChannelState) {
        if self.state != state {
            self.state = state;
            self.notify(ChannelEvent::State(state));
        }
    }

    /// Peer accepted the open and granted `window` bytes of credit
    pub(crate) fn confirm(&mut self, remote_id: u32, window: u32) {
        self.remote_id = Some(remote_id);
        self.send_credit = window;
        self.set_state(ChannelState::Open);
    }

    pub(crate) fn add_credit(&mut self, bytes: u32) {
        self.send_credit = self.send_credit.saturating_add(bytes);
    }

    /// Accept data from the owner.
    ///
    /// Returns the prefix that may be transmitted now, and whether all of
    /// `data` went out. Nothing bypasses an existing backlog.
    pub(crate) fn write(&mut self, data: &[u8]) -> (Option<Bytes>, bool) {
        if self.state != ChannelState::Open || self.send_credit == 0 || !self.pending.is_empty() {
            self.pending.extend_from_slice(data);
            return (None, false);
        }

        let allowed = data.len().min(self.send_credit as usize);
        self.send_credit -= allowed as u32;
        if allowed < data.len() {
            self.pending.extend_from_slice(&data[allowed..]);
            self.send_credit = 0;
        }

        let sent = (allowed > 0).then(|| Bytes::copy_from_slice(&data[..allowed]));
        (sent, allowed == data.len())
    }

    /// Release as much of the backlog as credit allows.
    ///
    /// Emits `Flushed` when the whole backlog leaves.
    pub(crate) fn drain(&mut self) -> Option<Bytes> {
        if self.pending.is_empty() || self.send_credit == 0 {
            return None;
        }

        let len = self.pending.len();
        if len <= self.send_credit as usize {
            self.send_credit -= len as u32;
            let all = self.pending.split().freeze();
            self.notify(ChannelEvent::Flushed);
            Some(all)
        } else {
            let prefix = self.pending.split_to(self.send_credit as usize).freeze();
            self.send_credit = 0;
            Some(prefix)
        }
    }

    /// Account for received payload. Returns the amount to acknowledge once
    /// more than half the advertised window is outstanding.
    pub(crate) fn received(&mut self, len: usize) -> Option<u32> {
        self.unacked = self.unacked.saturating_add(len.min(u32::MAX as usize) as u32);
        if self.unacked > self.recv_window / 2 {
            let ack = self.unacked;
            self.unacked = 0;
            Some(ack)
        } else {
            None
        }
    }
}

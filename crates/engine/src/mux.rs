//! Virtual channel multiplexor
//!
//! Channels are keyed by the id we assign. The peer's id is learned from
//! CHANNEL_OPEN_CONFIRMATION and used as recipient on everything we send.
//! Frames naming a channel we do not know are logged and dropped, since
//! the peer may have data in flight for a channel we just closed.

use bytes::Bytes;
use mps_protocol::{
    CHANNEL_FORWARDED_TCPIP, ChannelOpen, Frame, MAX_DATA_LEN, OPEN_UNKNOWN_CHANNEL_TYPE,
};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{debug, warn};

use crate::channel::{Channel, ChannelEvent, ChannelState, ChannelTarget};
use crate::error::EngineError;
use crate::metrics::METRICS;
use crate::session::Session;

impl Session {
    /// Open a channel towards the device.
    ///
    /// Writes made before the device confirms are queued.
    pub fn open_channel(
        &mut self,
        target: ChannelTarget,
    ) -> Result<(u32, UnboundedReceiver<ChannelEvent>), EngineError> {
        if self.is_closed() {
            return Err(EngineError::ConnectionClosed);
        }
        if !self.is_authenticated() {
            return Err(EngineError::NotAuthenticated);
        }

        let id = self.allocate_channel_id();
        let window = self.config.window_size;
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels.insert(id, Channel::new(id, window, tx));
        METRICS.open_channels.inc();

        debug!(
            conn = self.id,
            "Opening channel {} to {}:{}", id, target.target_address, target.target_port
        );
        self.send(Frame::ChannelOpen(ChannelOpen {
            channel_type: CHANNEL_FORWARDED_TCPIP.to_string(),
            sender_channel: id,
            window,
            max_packet: MAX_DATA_LEN as u32,
            target_address: target.target_address,
            target_port: target.target_port,
            source_address: target.source_address,
            source_port: target.source_port,
        }));

        Ok((id, rx))
    }

    fn allocate_channel_id(&mut self) -> u32 {
        loop {
            let id = self.next_channel_id;
            self.next_channel_id = self.next_channel_id.wrapping_add(1).max(1);
            if !self.channels.contains_key(&id) {
                return id;
            }
        }
    }

    /// Send data on a channel. Returns `true` when all of it was transmitted;
    /// `false` means some of it waits for credit and the caller should hold
    /// off until `ChannelEvent::Flushed`.
    pub fn write_channel(&mut self, local_id: u32, data: &[u8]) -> Result<bool, EngineError> {
        let channel = self
            .channels
            .get_mut(&local_id)
            .ok_or(EngineError::UnknownChannel(local_id))?;
        if channel.state == ChannelState::Closed {
            return Err(EngineError::ChannelClosed(local_id));
        }

        let (sent, flushed) = channel.write(data);
        if let (Some(bytes), Some(remote)) = (sent, channel.remote_id) {
            self.send_data(remote, bytes);
        }
        Ok(flushed)
    }

    /// Close a channel.
    ///
    /// An unconfirmed channel is closed once the device confirms it.
    pub fn close_channel(&mut self, local_id: u32) {
        let Some(channel) = self.channels.get_mut(&local_id) else {
            return;
        };

        match channel.state {
            // Kept until the peer answers so its confirmation can be closed
            ChannelState::Opening => {
                channel.close_pending = true;
                channel.pending.clear();
                channel.set_state(ChannelState::Closed);
            }
            ChannelState::Open => {
                let remote = channel.remote_id;
                channel.set_state(ChannelState::Closed);
                self.remove_channel(local_id);
                if let Some(recipient) = remote {
                    self.send(Frame::ChannelClose { recipient });
                }
            }
            ChannelState::Closed => {}
        }
    }

    fn remove_channel(&mut self, local_id: u32) -> Option<Channel> {
        let channel = self.channels.remove(&local_id)?;
        METRICS.open_channels.dec();
        Some(channel)
    }

    /// CHANNEL_DATA carries at most `MAX_DATA_LEN` bytes
    fn send_data(&mut self, recipient: u32, mut data: Bytes) {
        while !data.is_empty() {
            let chunk = data.split_to(data.len().min(MAX_DATA_LEN));
            self.send(Frame::ChannelData {
                recipient,
                data: chunk,
            });
        }
    }

    fn flush_channel(&mut self, local_id: u32) {
        let Some(channel) = self.channels.get_mut(&local_id) else {
            return;
        };
        let Some(remote) = channel.remote_id else {
            return;
        };
        if let Some(bytes) = channel.drain() {
            self.send_data(remote, bytes);
        }
    }

    pub(crate) fn on_channel_open(&mut self, open: ChannelOpen) {
        debug!(
            conn = self.id,
            "Refusing {} channel to {}:{}", open.channel_type, open.target_address, open.target_port
        );
        self.send(Frame::ChannelOpenFailure {
            recipient: open.sender_channel,
            reason: OPEN_UNKNOWN_CHANNEL_TYPE,
        });
    }

    pub(crate) fn on_open_confirmation(&mut self, recipient: u32, sender: u32, window: u32) {
        let Some(channel) = self.channels.get_mut(&recipient) else {
            warn!(conn = self.id, "Confirmation for unknown channel {}", recipient);
            return;
        };

        if channel.close_pending {
            self.remove_channel(recipient);
            self.send(Frame::ChannelClose { recipient: sender });
            return;
        }
        if channel.state != ChannelState::Opening {
            warn!(conn = self.id, "Duplicate confirmation for channel {}", recipient);
            return;
        }

        channel.confirm(sender, window);
        debug!(
            conn = self.id,
            "Channel {} open, peer channel {}, window {}", recipient, sender, window
        );
        self.flush_channel(recipient);
    }

    pub(crate) fn on_open_failure(&mut self, recipient: u32, reason: u32) {
        match self.remove_channel(recipient) {
            Some(mut channel) => {
                debug!(conn = self.id, "Channel {} refused, reason {}", recipient, reason);
                channel.set_state(ChannelState::Closed);
            }
            None => warn!(conn = self.id, "Open failure for unknown channel {}", recipient),
        }
    }

    pub(crate) fn on_window_adjust(&mut self, recipient: u32, bytes_to_add: u32) {
        let Some(channel) = self.channels.get_mut(&recipient) else {
            warn!(conn = self.id, "Window adjust for unknown channel {}", recipient);
            return;
        };
        channel.add_credit(bytes_to_add);
        self.flush_channel(recipient);
    }

    pub(crate) fn on_channel_data(&mut self, recipient: u32, data: Bytes) {
        let Some(channel) = self.channels.get_mut(&recipient) else {
            warn!(conn = self.id, "Data for unknown channel {}", recipient);
            return;
        };
        if channel.state != ChannelState::Open {
            debug!(conn = self.id, "Discarding data for channel {} in state {:?}", recipient, channel.state);
            return;
        }

        let len = data.len();
        channel.notify(ChannelEvent::Data(data));
        let ack = channel.received(len);
        if let (Some(bytes_to_add), Some(remote)) = (ack, channel.remote_id) {
            self.send(Frame::ChannelWindowAdjust {
                recipient: remote,
                bytes_to_add,
            });
        }
    }

    pub(crate) fn on_channel_close(&mut self, recipient: u32) {
        match self.remove_channel(recipient) {
            Some(mut channel) => {
                debug!(conn = self.id, "Channel {} closed by peer", recipient);
                channel.set_state(ChannelState::Closed);
            }
            None => warn!(conn = self.id, "Close for unknown channel {}", recipient),
        }
    }
}

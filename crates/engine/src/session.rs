//! Per-connection protocol state
//!
//! `Session` is the frame accumulator and command dispatcher for one
//! physical connection. It owns the receive buffer, the handshake phase,
//! the channel map and the bound-port list. All of it is driven
//! synchronously; the only asynchronous step, the identity lookup, is
//! handed back to the caller as `Progress::Authenticate` and resumed with
//! `complete_auth`.

use bytes::{Buf, Bytes, BytesMut};
use mps_protocol::{
    AUTH_METHOD_PASSWORD, Command, ControlMessage, Frame, ProtocolVersion, SERVICE_AUTH,
    SERVICE_PORT_FORWARD, UserauthRequest,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::channel::Channel;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::handshake::{AuthOutcome, AuthRejection, Binding};
use crate::metrics::METRICS;
use crate::registry::ConnectionKind;

/// Version we announce when echoing PROTOCOLVERSION
const SERVER_VERSION: (u32, u32) = (1, 0);

/// Handshake progress of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AwaitingVersion,
    AwaitingService,
    AwaitingAuth,
    /// Identity lookup `generation` is outstanding; dispatch is paused
    Authenticating { generation: u64 },
    Authenticated,
    Closed,
}

/// Credentials handed to the identity binder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthAttempt {
    pub generation: u64,
    pub username: String,
    pub method: String,
    pub password: Option<String>,
    /// From PROTOCOLVERSION, if it was received
    pub system_id: Option<Uuid>,
}

/// Why a connection ends
#[derive(Debug)]
pub enum CloseReason {
    TransportClosed,
    IdleTimeout,
    PeerDisconnect(u32),
    Fatal(EngineError),
    AuthenticationFailed(AuthRejection),
    QuotaExceeded,
    Shutdown,
}

/// What the connection worker must do next
#[derive(Debug)]
pub enum Progress {
    /// Wait for more bytes
    Continue,
    /// Run the identity lookup and call `complete_auth`
    Authenticate(AuthAttempt),
    /// Terminate the connection
    Close(CloseReason),
}

/// Result of one dispatcher step
enum Dispatch {
    NeedMore,
    Consumed(usize, Progress),
    Fatal(EngineError),
}

/// Protocol state for one physical connection
pub struct Session {
    pub(crate) id: u64,
    buffer: BytesMut,
    phase: Phase,
    generation: u64,
    version: Option<ProtocolVersion>,
    binding: Option<Binding>,
    pub(crate) kind: ConnectionKind,
    pub(crate) next_channel_id: u32,
    pub(crate) channels: HashMap<u32, Channel>,
    pub(crate) bound_ports: Vec<u32>,
    pub(crate) config: Arc<EngineConfig>,
    outbound: Option<UnboundedSender<Bytes>>,
}

impl Session {
    /// Create a session writing encoded frames to `outbound`
    pub fn new(id: u64, config: Arc<EngineConfig>, outbound: UnboundedSender<Bytes>) -> Self {
        Self {
            id,
            buffer: BytesMut::new(),
            phase: Phase::AwaitingVersion,
            generation: 0,
            version: None,
            binding: None,
            kind: ConnectionKind::Direct,
            next_channel_id: 1,
            channels: HashMap::new(),
            bound_ports: Vec::new(),
            config,
            outbound: Some(outbound),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_closed(&self) -> bool {
        self.phase == Phase::Closed
    }

    pub fn is_authenticated(&self) -> bool {
        self.phase == Phase::Authenticated
    }

    pub fn version(&self) -> Option<&ProtocolVersion> {
        self.version.as_ref()
    }

    pub fn system_id(&self) -> Option<Uuid> {
        self.version.map(|v| v.system_id)
    }

    pub fn binding(&self) -> Option<&Binding> {
        self.binding.as_ref()
    }

    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    pub fn bound_ports(&self) -> &[u32] {
        &self.bound_ports
    }

    pub fn channel(&self, local_id: u32) -> Option<&Channel> {
        self.channels.get(&local_id)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Bytes received but not yet dispatched
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Append received bytes and dispatch every complete frame
    pub fn feed(&mut self, data: &[u8]) -> Progress {
        if self.is_closed() {
            return Progress::Close(CloseReason::Shutdown);
        }
        self.buffer.extend_from_slice(data);
        self.process()
    }

    /// Dispatch buffered frames until more bytes are needed, a lookup must
    /// run, or the connection has to close.
    pub(crate) fn process(&mut self) -> Progress {
        loop {
            if matches!(self.phase, Phase::Authenticating { .. }) {
                return Progress::Continue;
            }

            match self.try_consume_one() {
                Dispatch::NeedMore => return Progress::Continue,
                Dispatch::Consumed(len, progress) => {
                    self.buffer.advance(len);
                    if !matches!(progress, Progress::Continue) {
                        return progress;
                    }
                }
                Dispatch::Fatal(e) => {
                    METRICS.decode_errors.inc();
                    warn!(conn = self.id, "Terminating connection: {}", e);
                    self.buffer.clear();
                    return Progress::Close(CloseReason::Fatal(e));
                }
            }
        }
    }

    fn try_consume_one(&mut self) -> Dispatch {
        let (frame, len) = match Frame::decode(&self.buffer) {
            Ok(Some(decoded)) => decoded,
            Ok(None) => return Dispatch::NeedMore,
            Err(e) => return Dispatch::Fatal(e.into()),
        };

        METRICS.frames_received.inc();
        trace!(conn = self.id, "Received {} ({} bytes)", frame.command(), len);

        match self.dispatch(frame) {
            Ok(progress) => Dispatch::Consumed(len, progress),
            Err(e) => Dispatch::Fatal(e),
        }
    }

    fn dispatch(&mut self, frame: Frame) -> Result<Progress, EngineError> {
        let cmd = frame.command();
        if requires_auth(cmd) && !self.is_authenticated() {
            return Err(EngineError::Unauthenticated(cmd));
        }

        match frame {
            Frame::ProtocolVersion(version) => self.on_protocol_version(version),
            Frame::ServiceRequest { service } => self.on_service_request(&service),
            Frame::UserauthRequest(request) => return Ok(self.on_userauth_request(request)),
            Frame::GlobalRequest {
                want_reply,
                request,
            } => self.on_global_request(want_reply, request),
            Frame::ChannelOpen(open) => self.on_channel_open(open),
            Frame::ChannelOpenConfirmation {
                recipient,
                sender,
                window,
            } => self.on_open_confirmation(recipient, sender, window),
            Frame::ChannelOpenFailure { recipient, reason } => {
                self.on_open_failure(recipient, reason)
            }
            Frame::ChannelWindowAdjust {
                recipient,
                bytes_to_add,
            } => self.on_window_adjust(recipient, bytes_to_add),
            Frame::ChannelData { recipient, data } => self.on_channel_data(recipient, data),
            Frame::ChannelClose { recipient } => self.on_channel_close(recipient),
            Frame::KeepaliveRequest { cookie } => self.send(Frame::KeepaliveReply { cookie }),
            Frame::KeepaliveReply { cookie } => trace!(conn = self.id, "Keepalive reply {}", cookie),
            Frame::KeepaliveOptionsReply { interval, timeout } => debug!(
                conn = self.id,
                "Keepalive options accepted: interval {}s, timeout {}s", interval, timeout
            ),
            Frame::JsonControl { json } => self.on_json_control(&json),
            Frame::Disconnect { reason } => {
                info!(conn = self.id, "Peer disconnected, reason {}", reason);
                return Ok(Progress::Close(CloseReason::PeerDisconnect(reason)));
            }
            other => debug!(conn = self.id, "Ignoring unexpected {}", other.command()),
        }
        Ok(Progress::Continue)
    }

    fn on_protocol_version(&mut self, version: ProtocolVersion) {
        info!(
            conn = self.id,
            "Protocol version {}.{}, system id {}", version.major, version.minor, version.system_id
        );
        self.version = Some(version);
        if self.phase == Phase::AwaitingVersion {
            self.phase = Phase::AwaitingService;
        }

        if self.config.echo_version {
            self.send(Frame::ProtocolVersion(ProtocolVersion {
                major: SERVER_VERSION.0,
                minor: SERVER_VERSION.1,
                system_id: version.system_id,
            }));
        }
    }

    fn on_service_request(&mut self, service: &str) {
        if service != SERVICE_AUTH && service != SERVICE_PORT_FORWARD {
            debug!(conn = self.id, "Ignoring request for service {}", service);
            return;
        }

        debug!(conn = self.id, "Service accepted: {}", service);
        self.send(Frame::ServiceAccept {
            service: service.to_string(),
        });
        if matches!(self.phase, Phase::AwaitingVersion | Phase::AwaitingService) {
            self.phase = Phase::AwaitingAuth;
        }
    }

    fn on_userauth_request(&mut self, request: UserauthRequest) -> Progress {
        if self.is_authenticated() {
            warn!(conn = self.id, "Ignoring USERAUTH_REQUEST on an authenticated connection");
            return Progress::Continue;
        }

        self.generation += 1;
        self.phase = Phase::Authenticating {
            generation: self.generation,
        };
        debug!(
            conn = self.id,
            "Authenticating user {} (method {})", request.username, request.method
        );

        Progress::Authenticate(AuthAttempt {
            generation: self.generation,
            username: request.username,
            method: request.method,
            password: request.password,
            system_id: self.system_id(),
        })
    }

    /// Resume after the identity lookup for `generation` finished.
    ///
    /// Returns `None` when the continuation is stale: the connection closed
    /// or a different lookup is outstanding.
    pub fn complete_auth(&mut self, generation: u64, outcome: AuthOutcome) -> Option<Progress> {
        if self.phase != (Phase::Authenticating { generation }) {
            debug!(conn = self.id, "Discarding stale identity lookup {}", generation);
            return None;
        }

        match outcome {
            AuthOutcome::Bound(binding) => {
                METRICS.auth_successes.inc();
                info!(
                    conn = self.id,
                    "Device {} bound to group {}", binding.device_key, binding.group_key
                );
                self.binding = Some(binding);
                self.phase = Phase::Authenticated;
                self.send(Frame::UserauthSuccess);
                if let Some(keepalive) = self.config.keepalive {
                    self.send(Frame::KeepaliveOptionsRequest {
                        interval: keepalive.interval,
                        timeout: keepalive.timeout,
                    });
                }
                Some(self.process())
            }
            AuthOutcome::Rejected(reason) => {
                METRICS.auth_failures.inc();
                warn!(conn = self.id, "Authentication failed: {}", reason);
                self.phase = Phase::AwaitingAuth;
                self.send(Frame::UserauthFailure {
                    methods: AUTH_METHOD_PASSWORD.to_string(),
                    partial: false,
                });
                Some(Progress::Close(CloseReason::AuthenticationFailed(reason)))
            }
            AuthOutcome::OverQuota => {
                METRICS.quota_rejections.inc();
                warn!(conn = self.id, "Device quota exceeded, dropping connection");
                self.phase = Phase::AwaitingAuth;
                Some(Progress::Close(CloseReason::QuotaExceeded))
            }
        }
    }

    fn on_json_control(&mut self, json: &str) {
        match ControlMessage::parse(json) {
            Ok(ControlMessage::ConnType { value }) => match ConnectionKind::from_code(value) {
                Some(kind) if self.kind == ConnectionKind::Direct && self.binding.is_none() => {
                    debug!(conn = self.id, "Connection kind set to {:?}", kind);
                    self.kind = kind;
                }
                Some(kind) => warn!(
                    conn = self.id,
                    "Ignoring connection kind {:?}, already {:?}", kind, self.kind
                ),
                None => warn!(conn = self.id, "Invalid connection kind {}", value),
            },
            Ok(ControlMessage::MeiState { value }) => {
                info!(conn = self.id, "Management engine state: {}", value)
            }
            Ok(ControlMessage::Unknown) => debug!(conn = self.id, "Ignoring control message"),
            Err(e) => warn!(conn = self.id, "Invalid control message: {}", e),
        }
    }

    /// Send a JSON_CONTROL message to the peer
    pub fn send_control(&mut self, message: &ControlMessage) -> Result<(), EngineError> {
        if self.is_closed() {
            return Err(EngineError::ConnectionClosed);
        }
        let json = message.to_json()?;
        self.send(Frame::JsonControl { json });
        Ok(())
    }

    /// Queue a frame for the transport
    pub(crate) fn send(&mut self, frame: Frame) {
        let Some(tx) = &self.outbound else {
            debug!(conn = self.id, "Dropping {} on closed connection", frame.command());
            return;
        };
        trace!(conn = self.id, "Sending {}", frame.command());
        if tx.send(frame.to_bytes()).is_ok() {
            METRICS.frames_sent.inc();
        }
    }

    /// Tear down: every channel reports `Closed` and the outbound queue is
    /// released so the writer can flush and stop.
    pub fn shutdown(&mut self) {
        if self.is_closed() {
            return;
        }
        self.phase = Phase::Closed;
        for (_, mut channel) in self.channels.drain() {
            channel.set_state(crate::channel::ChannelState::Closed);
            METRICS.open_channels.dec();
        }
        self.outbound = None;
        self.buffer.clear();
    }
}

fn requires_auth(cmd: Command) -> bool {
    matches!(
        cmd,
        Command::GlobalRequest
            | Command::ChannelOpen
            | Command::ChannelOpenConfirmation
            | Command::ChannelOpenFailure
            | Command::ChannelWindowAdjust
            | Command::ChannelData
            | Command::ChannelClose
    )
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use bytes::Bytes;
    use tokio::sync::mpsc;

    pub const SYSTEM_ID: Uuid = Uuid::from_u128(0x0011_2233_4455_6677_8899_aabb_ccdd_eeff);

    pub fn new_session() -> (Session, mpsc::UnboundedReceiver<Bytes>) {
        new_session_with(EngineConfig::default())
    }

    pub fn new_session_with(config: EngineConfig) -> (Session, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Session::new(1, Arc::new(config), tx), rx)
    }

    pub fn binding() -> Binding {
        Binding {
            device_key: "node//device".to_string(),
            group_key: "mesh//group".to_string(),
            domain: String::new(),
            system_id: SYSTEM_ID,
        }
    }

    pub fn handshake_bytes() -> BytesMut {
        let mut buf = BytesMut::new();
        Frame::ProtocolVersion(ProtocolVersion {
            major: 1,
            minor: 0,
            system_id: SYSTEM_ID,
        })
        .encode(&mut buf);
        Frame::ServiceRequest {
            service: SERVICE_AUTH.to_string(),
        }
        .encode(&mut buf);
        Frame::UserauthRequest(UserauthRequest {
            username: "abcdefghijklmnop".to_string(),
            service: SERVICE_PORT_FORWARD.to_string(),
            method: AUTH_METHOD_PASSWORD.to_string(),
            password: Some("secret".to_string()),
        })
        .encode(&mut buf);
        buf
    }

    /// Session that completed the handshake; its outbound queue is drained
    pub fn authenticated_session() -> (Session, mpsc::UnboundedReceiver<Bytes>) {
        let (mut session, mut rx) = new_session();
        let attempt = match session.feed(&handshake_bytes()) {
            Progress::Authenticate(attempt) => attempt,
            other => panic!("expected authentication, got {:?}", other),
        };
        let progress = session
            .complete_auth(attempt.generation, AuthOutcome::Bound(binding()))
            .unwrap();
        assert!(matches!(progress, Progress::Continue));
        sent_frames(&mut rx);
        (session, rx)
    }

    pub fn sent_frames(rx: &mut mpsc::UnboundedReceiver<Bytes>) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(bytes) = rx.try_recv() {
            let frame = match Frame::decode(&bytes).unwrap().unwrap() {
                // Our REQUEST_SUCCESS carries a port the decoder does not read
                (Frame::RequestSuccess { .. }, 1) if bytes.len() == 5 => Frame::RequestSuccess {
                    port: Some(u32::from_be_bytes(bytes[1..5].try_into().unwrap())),
                },
                (frame, used) => {
                    assert_eq!(used, bytes.len());
                    frame
                }
            };
            frames.push(frame);
        }
        frames
    }
}

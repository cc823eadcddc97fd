//! GLOBAL_REQUEST handling
//!
//! Port forwarding requests only maintain the bound-port list used for
//! routing. No listener is opened.

use mps_protocol::{Frame, GlobalRequest};
use tracing::{debug, info, trace};

use crate::session::Session;

impl Session {
    pub(crate) fn on_global_request(&mut self, want_reply: bool, request: GlobalRequest) {
        match request {
            GlobalRequest::TcpipForward { address, port } => {
                if !self.bound_ports.contains(&port) {
                    self.bound_ports.push(port);
                }
                info!(conn = self.id, "Device forwards {}:{}", address, port);
                self.send(Frame::RequestSuccess { port: Some(port) });
            }
            GlobalRequest::CancelTcpipForward { address, port } => {
                self.bound_ports.retain(|p| *p != port);
                info!(conn = self.id, "Device cancelled forward {}:{}", address, port);
                self.send(Frame::RequestSuccess { port: Some(port) });
            }
            GlobalRequest::UdpSendTo {
                address, port, data, ..
            } => {
                trace!(
                    conn = self.id,
                    "Discarding {} byte datagram for {}:{}", data.len(), address, port
                );
            }
            GlobalRequest::Other { name } => {
                debug!(conn = self.id, "Unsupported global request {}", name);
                if want_reply {
                    self.send(Frame::RequestFailure);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::session::test_support::{authenticated_session, sent_frames};
    use crate::session::{CloseReason, Progress};
    use crate::error::EngineError;
    use mps_protocol::{Command, Frame, GlobalRequest};

    fn forward(port: u32) -> Frame {
        Frame::GlobalRequest {
            want_reply: true,
            request: GlobalRequest::TcpipForward {
                address: "0.0.0.0".to_string(),
                port,
            },
        }
    }

    fn cancel(port: u32) -> Frame {
        Frame::GlobalRequest {
            want_reply: true,
            request: GlobalRequest::CancelTcpipForward {
                address: "0.0.0.0".to_string(),
                port,
            },
        }
    }

    #[test]
    fn test_forward_is_idempotent() {
        let (mut session, mut rx) = authenticated_session();
        session.feed(&forward(16992).to_bytes());
        session.feed(&forward(16992).to_bytes());
        session.feed(&forward(16993).to_bytes());

        assert_eq!(session.bound_ports(), &[16992, 16993]);
        assert_eq!(
            sent_frames(&mut rx),
            vec![
                Frame::RequestSuccess { port: Some(16992) },
                Frame::RequestSuccess { port: Some(16992) },
                Frame::RequestSuccess { port: Some(16993) },
            ]
        );
    }

    #[test]
    fn test_cancel_unbound_port_still_succeeds() {
        let (mut session, mut rx) = authenticated_session();
        session.feed(&forward(16992).to_bytes());
        session.feed(&cancel(16992).to_bytes());
        session.feed(&cancel(16992).to_bytes());

        assert!(session.bound_ports().is_empty());
        let frames = sent_frames(&mut rx);
        assert_eq!(frames.len(), 3);
        assert!(
            frames
                .iter()
                .all(|f| *f == Frame::RequestSuccess { port: Some(16992) })
        );
    }

    #[test]
    fn test_unknown_request_keeps_parser_in_sync() {
        let (mut session, mut rx) = authenticated_session();
        let mut bytes = Frame::GlobalRequest {
            want_reply: true,
            request: GlobalRequest::Other {
                name: "future-request@example".to_string(),
            },
        }
        .to_bytes()
        .to_vec();
        bytes.extend_from_slice(&forward(623).to_bytes());

        assert!(matches!(session.feed(&bytes), Progress::Continue));
        assert_eq!(
            sent_frames(&mut rx),
            vec![
                Frame::RequestFailure,
                Frame::RequestSuccess { port: Some(623) }
            ]
        );
    }

    #[test]
    fn test_unknown_request_without_reply() {
        let (mut session, mut rx) = authenticated_session();
        let frame = Frame::GlobalRequest {
            want_reply: false,
            request: GlobalRequest::Other {
                name: "future-request@example".to_string(),
            },
        };
        session.feed(&frame.to_bytes());
        assert!(sent_frames(&mut rx).is_empty());
    }

    #[test]
    fn test_udp_send_to_discarded() {
        let (mut session, mut rx) = authenticated_session();
        let frame = Frame::GlobalRequest {
            want_reply: false,
            request: GlobalRequest::UdpSendTo {
                address: "10.0.0.1".to_string(),
                port: 53,
                orig_address: "127.0.0.1".to_string(),
                orig_port: 5353,
                data: bytes::Bytes::from_static(b"query"),
            },
        };
        assert!(matches!(session.feed(&frame.to_bytes()), Progress::Continue));
        assert!(sent_frames(&mut rx).is_empty());
    }

    #[test]
    fn test_forward_before_auth_is_fatal() {
        let (mut session, _rx) = crate::session::test_support::new_session();
        assert!(matches!(
            session.feed(&forward(16992).to_bytes()),
            Progress::Close(CloseReason::Fatal(EngineError::Unauthenticated(
                Command::GlobalRequest
            )))
        ));
    }
}

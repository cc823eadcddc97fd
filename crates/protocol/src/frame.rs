//! Frame - typed APF frames and their wire codec
//!
//! All integers are big-endian. Variable fields are a 4-byte length followed
//! by that many bytes. Decoding is incremental: a buffer holding a partial
//! frame yields `Ok(None)` and nothing is consumed.

use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::command::*;
use crate::validation::{
    DecodeError, MAX_CONTROL_FIELD_LEN, MAX_DATA_LEN, MAX_JSON_LEN, check_field_len,
};

/// Trailing reserved bytes of PROTOCOLVERSION after the system identifier
const VERSION_TRAILER_LEN: usize = 64;

/// A decoded APF frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Disconnect { reason: u32 },
    ServiceRequest { service: String },
    ServiceAccept { service: String },
    UserauthRequest(UserauthRequest),
    UserauthFailure { methods: String, partial: bool },
    UserauthSuccess,
    GlobalRequest { want_reply: bool, request: GlobalRequest },
    /// The port is only ever sent by the server; decoding never expects it.
    RequestSuccess { port: Option<u32> },
    RequestFailure,
    ChannelOpen(ChannelOpen),
    ChannelOpenConfirmation { recipient: u32, sender: u32, window: u32 },
    ChannelOpenFailure { recipient: u32, reason: u32 },
    ChannelWindowAdjust { recipient: u32, bytes_to_add: u32 },
    ChannelData { recipient: u32, data: Bytes },
    ChannelClose { recipient: u32 },
    ProtocolVersion(ProtocolVersion),
    KeepaliveRequest { cookie: u32 },
    KeepaliveReply { cookie: u32 },
    KeepaliveOptionsRequest { interval: u32, timeout: u32 },
    KeepaliveOptionsReply { interval: u32, timeout: u32 },
    JsonControl { json: String },
}

/// USERAUTH_REQUEST body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserauthRequest {
    /// Invalid UTF-8 bytes are decoded as `?`, keeping the byte length
    pub username: String,
    pub service: String,
    pub method: String,
    /// Present only when `method` is `password`
    pub password: Option<String>,
}

/// GLOBAL_REQUEST payloads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GlobalRequest {
    TcpipForward { address: String, port: u32 },
    CancelTcpipForward { address: String, port: u32 },
    UdpSendTo {
        address: String,
        port: u32,
        orig_address: String,
        orig_port: u32,
        data: Bytes,
    },
    /// Unrecognised request; only the name is consumed
    Other { name: String },
}

impl GlobalRequest {
    pub fn name(&self) -> &str {
        match self {
            Self::TcpipForward { .. } => REQUEST_TCPIP_FORWARD,
            Self::CancelTcpipForward { .. } => REQUEST_CANCEL_TCPIP_FORWARD,
            Self::UdpSendTo { .. } => REQUEST_UDP_SEND_TO,
            Self::Other { name } => name,
        }
    }
}

/// CHANNEL_OPEN body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpen {
    pub channel_type: String,
    pub sender_channel: u32,
    pub window: u32,
    pub max_packet: u32,
    pub target_address: String,
    pub target_port: u32,
    pub source_address: String,
    pub source_port: u32,
}

/// PROTOCOLVERSION body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
    /// Hardware identity. On the wire the first three GUID groups are little-endian.
    pub system_id: Uuid,
}

enum Short {
    Incomplete,
    Malformed(DecodeError),
}

impl From<DecodeError> for Short {
    fn from(e: DecodeError) -> Self {
        Short::Malformed(e)
    }
}

type Step<T> = Result<T, Short>;

/// Bounds-checked cursor over a receive buffer
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Starts after the command byte
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 1 }
    }

    fn take(&mut self, n: usize) -> Step<&'a [u8]> {
        if self.buf.len() - self.pos < n {
            return Err(Short::Incomplete);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Step<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Step<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Step<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Length-prefixed field. The declared length is checked against `max`
    /// before availability, so an oversized claim is fatal even when the
    /// bytes behind it never arrive.
    fn field(&mut self, max: usize) -> Step<&'a [u8]> {
        let len = self.u32()? as usize;
        check_field_len(len, max)?;
        self.take(len)
    }

    fn string(&mut self) -> Step<String> {
        let raw = self.field(MAX_CONTROL_FIELD_LEN)?;
        Ok(String::from_utf8_lossy(raw).into_owned())
    }

    /// Like `string`, but each invalid byte becomes `?` so the decoded
    /// length in bytes equals the length on the wire
    fn key_string(&mut self) -> Step<String> {
        let raw = self.field(MAX_CONTROL_FIELD_LEN)?;
        let mut out = String::with_capacity(raw.len());
        for chunk in raw.utf8_chunks() {
            out.push_str(chunk.valid());
            out.extend(std::iter::repeat_n('?', chunk.invalid().len()));
        }
        Ok(out)
    }
}

impl Frame {
    /// Try to decode one frame from the front of `buf`.
    ///
    /// Returns `Ok(Some((frame, consumed)))` for a complete frame, `Ok(None)`
    /// when more bytes are needed, or `Err` when the stream can no longer be
    /// trusted.
    pub fn decode(buf: &[u8]) -> Result<Option<(Frame, usize)>, DecodeError> {
        let Some(&code) = buf.first() else {
            return Ok(None);
        };
        let cmd = Command::from_code(code).ok_or(DecodeError::UnknownCommand(code))?;
        if buf.len() < cmd.min_len() {
            return Ok(None);
        }

        let mut r = Reader::new(buf);
        match decode_body(cmd, &mut r) {
            Ok(frame) => Ok(Some((frame, r.pos))),
            Err(Short::Incomplete) => Ok(None),
            Err(Short::Malformed(e)) => Err(e),
        }
    }

    /// Command code of this frame
    pub fn command(&self) -> Command {
        match self {
            Self::Disconnect { .. } => Command::Disconnect,
            Self::ServiceRequest { .. } => Command::ServiceRequest,
            Self::ServiceAccept { .. } => Command::ServiceAccept,
            Self::UserauthRequest(_) => Command::UserauthRequest,
            Self::UserauthFailure { .. } => Command::UserauthFailure,
            Self::UserauthSuccess => Command::UserauthSuccess,
            Self::GlobalRequest { .. } => Command::GlobalRequest,
            Self::RequestSuccess { .. } => Command::RequestSuccess,
            Self::RequestFailure => Command::RequestFailure,
            Self::ChannelOpen(_) => Command::ChannelOpen,
            Self::ChannelOpenConfirmation { .. } => Command::ChannelOpenConfirmation,
            Self::ChannelOpenFailure { .. } => Command::ChannelOpenFailure,
            Self::ChannelWindowAdjust { .. } => Command::ChannelWindowAdjust,
            Self::ChannelData { .. } => Command::ChannelData,
            Self::ChannelClose { .. } => Command::ChannelClose,
            Self::ProtocolVersion(_) => Command::ProtocolVersion,
            Self::KeepaliveRequest { .. } => Command::KeepaliveRequest,
            Self::KeepaliveReply { .. } => Command::KeepaliveReply,
            Self::KeepaliveOptionsRequest { .. } => Command::KeepaliveOptionsRequest,
            Self::KeepaliveOptionsReply { .. } => Command::KeepaliveOptionsReply,
            Self::JsonControl { .. } => Command::JsonControl,
        }
    }

    /// Append the wire encoding of this frame to `dst`
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u8(self.command().code());
        match self {
            Self::Disconnect { reason } => {
                dst.put_u32(*reason);
                dst.put_u16(0);
            }
            Self::ServiceRequest { service } | Self::ServiceAccept { service } => {
                put_field(dst, service.as_bytes());
            }
            Self::UserauthRequest(req) => {
                put_field(dst, req.username.as_bytes());
                put_field(dst, req.service.as_bytes());
                put_field(dst, req.method.as_bytes());
                if req.method == AUTH_METHOD_PASSWORD {
                    dst.put_u8(0);
                    put_field(dst, req.password.as_deref().unwrap_or("").as_bytes());
                }
            }
            Self::UserauthFailure { methods, partial } => {
                put_field(dst, methods.as_bytes());
                dst.put_u16(u16::from(*partial));
            }
            Self::UserauthSuccess | Self::RequestFailure => {}
            Self::GlobalRequest { want_reply, request } => {
                put_field(dst, request.name().as_bytes());
                dst.put_u8(u8::from(*want_reply));
                match request {
                    GlobalRequest::TcpipForward { address, port }
                    | GlobalRequest::CancelTcpipForward { address, port } => {
                        put_field(dst, address.as_bytes());
                        dst.put_u32(*port);
                    }
                    GlobalRequest::UdpSendTo {
                        address,
                        port,
                        orig_address,
                        orig_port,
                        data,
                    } => {
                        put_field(dst, address.as_bytes());
                        dst.put_u32(*port);
                        put_field(dst, orig_address.as_bytes());
                        dst.put_u32(*orig_port);
                        put_field(dst, data);
                    }
                    GlobalRequest::Other { .. } => {}
                }
            }
            Self::RequestSuccess { port } => {
                if let Some(port) = port {
                    dst.put_u32(*port);
                }
            }
            Self::ChannelOpen(open) => {
                put_field(dst, open.channel_type.as_bytes());
                dst.put_u32(open.sender_channel);
                dst.put_u32(open.window);
                dst.put_u32(open.max_packet);
                put_field(dst, open.target_address.as_bytes());
                dst.put_u32(open.target_port);
                put_field(dst, open.source_address.as_bytes());
                dst.put_u32(open.source_port);
            }
            Self::ChannelOpenConfirmation {
                recipient,
                sender,
                window,
            } => {
                dst.put_u32(*recipient);
                dst.put_u32(*sender);
                dst.put_u32(*window);
                dst.put_u32(0);
            }
            Self::ChannelOpenFailure { recipient, reason } => {
                dst.put_u32(*recipient);
                dst.put_u32(*reason);
                dst.put_u32(0);
                dst.put_u32(0);
            }
            Self::ChannelWindowAdjust {
                recipient,
                bytes_to_add,
            } => {
                dst.put_u32(*recipient);
                dst.put_u32(*bytes_to_add);
            }
            Self::ChannelData { recipient, data } => {
                dst.put_u32(*recipient);
                put_field(dst, data);
            }
            Self::ChannelClose { recipient } => dst.put_u32(*recipient),
            Self::ProtocolVersion(version) => {
                dst.put_u32(version.major);
                dst.put_u32(version.minor);
                dst.put_u32(0);
                dst.put_slice(&version.system_id.to_bytes_le());
                dst.put_bytes(0, VERSION_TRAILER_LEN);
            }
            Self::KeepaliveRequest { cookie } | Self::KeepaliveReply { cookie } => {
                dst.put_u32(*cookie);
            }
            Self::KeepaliveOptionsRequest { interval, timeout }
            | Self::KeepaliveOptionsReply { interval, timeout } => {
                dst.put_u32(*interval);
                dst.put_u32(*timeout);
            }
            Self::JsonControl { json } => put_field(dst, json.as_bytes()),
        }
    }

    /// Encode into a standalone buffer
    pub fn to_bytes(&self) -> Bytes {
        let mut dst = BytesMut::new();
        self.encode(&mut dst);
        dst.freeze()
    }
}

fn put_field(dst: &mut BytesMut, value: &[u8]) {
    dst.put_u32(value.len() as u32);
    dst.put_slice(value);
}

fn decode_body(cmd: Command, r: &mut Reader<'_>) -> Step<Frame> {
    let frame = match cmd {
        Command::Disconnect => {
            let reason = r.u32()?;
            r.u16()?;
            Frame::Disconnect { reason }
        }
        Command::ServiceRequest => Frame::ServiceRequest {
            service: r.string()?,
        },
        Command::ServiceAccept => Frame::ServiceAccept {
            service: r.string()?,
        },
        Command::UserauthRequest => {
            let username = r.key_string()?;
            let service = r.string()?;
            let method = r.string()?;
            let password = if method == AUTH_METHOD_PASSWORD {
                r.u8()?;
                Some(r.string()?)
            } else {
                None
            };
            Frame::UserauthRequest(UserauthRequest {
                username,
                service,
                method,
                password,
            })
        }
        Command::UserauthFailure => {
            let methods = r.string()?;
            let partial = r.u16()? != 0;
            Frame::UserauthFailure { methods, partial }
        }
        Command::UserauthSuccess => Frame::UserauthSuccess,
        Command::GlobalRequest => {
            let name = r.string()?;
            let want_reply = r.u8()? != 0;
            let request = match name.as_str() {
                REQUEST_TCPIP_FORWARD => GlobalRequest::TcpipForward {
                    address: r.string()?,
                    port: r.u32()?,
                },
                REQUEST_CANCEL_TCPIP_FORWARD => GlobalRequest::CancelTcpipForward {
                    address: r.string()?,
                    port: r.u32()?,
                },
                REQUEST_UDP_SEND_TO => {
                    let address = r.string()?;
                    let port = r.u32()?;
                    let orig_address = r.string()?;
                    let orig_port = r.u32()?;
                    let data = Bytes::copy_from_slice(r.field(MAX_DATA_LEN)?);
                    GlobalRequest::UdpSendTo {
                        address,
                        port,
                        orig_address,
                        orig_port,
                        data,
                    }
                }
                _ => GlobalRequest::Other { name },
            };
            Frame::GlobalRequest {
                want_reply,
                request,
            }
        }
        Command::RequestSuccess => Frame::RequestSuccess { port: None },
        Command::RequestFailure => Frame::RequestFailure,
        Command::ChannelOpen => Frame::ChannelOpen(ChannelOpen {
            channel_type: r.string()?,
            sender_channel: r.u32()?,
            window: r.u32()?,
            max_packet: r.u32()?,
            target_address: r.string()?,
            target_port: r.u32()?,
            source_address: r.string()?,
            source_port: r.u32()?,
        }),
        Command::ChannelOpenConfirmation => {
            let recipient = r.u32()?;
            let sender = r.u32()?;
            let window = r.u32()?;
            r.u32()?;
            Frame::ChannelOpenConfirmation {
                recipient,
                sender,
                window,
            }
        }
        Command::ChannelOpenFailure => {
            let recipient = r.u32()?;
            let reason = r.u32()?;
            r.u32()?;
            r.u32()?;
            Frame::ChannelOpenFailure { recipient, reason }
        }
        Command::ChannelWindowAdjust => Frame::ChannelWindowAdjust {
            recipient: r.u32()?,
            bytes_to_add: r.u32()?,
        },
        Command::ChannelData => {
            let recipient = r.u32()?;
            let data = Bytes::copy_from_slice(r.field(MAX_DATA_LEN)?);
            Frame::ChannelData { recipient, data }
        }
        Command::ChannelClose => Frame::ChannelClose {
            recipient: r.u32()?,
        },
        Command::ProtocolVersion => {
            let major = r.u32()?;
            let minor = r.u32()?;
            r.u32()?;
            let raw: [u8; 16] = r
                .take(16)?
                .try_into()
                .map_err(|_| DecodeError::Invalid("system identifier"))?;
            r.take(VERSION_TRAILER_LEN)?;
            Frame::ProtocolVersion(ProtocolVersion {
                major,
                minor,
                system_id: Uuid::from_bytes_le(raw),
            })
        }
        Command::KeepaliveRequest => Frame::KeepaliveRequest { cookie: r.u32()? },
        Command::KeepaliveReply => Frame::KeepaliveReply { cookie: r.u32()? },
        Command::KeepaliveOptionsRequest => Frame::KeepaliveOptionsRequest {
            interval: r.u32()?,
            timeout: r.u32()?,
        },
        Command::KeepaliveOptionsReply => Frame::KeepaliveOptionsReply {
            interval: r.u32()?,
            timeout: r.u32()?,
        },
        Command::JsonControl => {
            let raw = r.field(MAX_JSON_LEN)?;
            Frame::JsonControl {
                json: String::from_utf8_lossy(raw).into_owned(),
            }
        }
    };
    Ok(frame)
}

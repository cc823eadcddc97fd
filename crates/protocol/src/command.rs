//! APF command codes

/// Service names a device may request after the version exchange
pub const SERVICE_PORT_FORWARD: &str = "pfwd@amt.intel.com";
pub const SERVICE_AUTH: &str = "auth@amt.intel.com";

/// Global request names
pub const REQUEST_TCPIP_FORWARD: &str = "tcpip-forward";
pub const REQUEST_CANCEL_TCPIP_FORWARD: &str = "cancel-tcpip-forward";
pub const REQUEST_UDP_SEND_TO: &str = "udp-send-to@amt.intel.com";

/// Channel types
pub const CHANNEL_FORWARDED_TCPIP: &str = "forwarded-tcpip";
pub const CHANNEL_DIRECT_TCPIP: &str = "direct-tcpip";

/// Authentication method carrying a password
pub const AUTH_METHOD_PASSWORD: &str = "password";

/// CHANNEL_OPEN_FAILURE reason codes
pub const OPEN_ADMINISTRATIVELY_PROHIBITED: u32 = 1;
pub const OPEN_CONNECT_FAILED: u32 = 2;
pub const OPEN_UNKNOWN_CHANNEL_TYPE: u32 = 3;
pub const OPEN_RESOURCE_SHORTAGE: u32 = 4;

/// DISCONNECT reason codes
pub const DISCONNECT_PROTOCOL_ERROR: u32 = 2;
pub const DISCONNECT_BY_APPLICATION: u32 = 11;

/// One-byte APF command code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    Disconnect = 1,
    ServiceRequest = 5,
    ServiceAccept = 6,
    UserauthRequest = 50,
    UserauthFailure = 51,
    UserauthSuccess = 52,
    GlobalRequest = 80,
    RequestSuccess = 81,
    RequestFailure = 82,
    ChannelOpen = 90,
    ChannelOpenConfirmation = 91,
    ChannelOpenFailure = 92,
    ChannelWindowAdjust = 93,
    ChannelData = 94,
    ChannelClose = 97,
    ProtocolVersion = 192,
    KeepaliveRequest = 208,
    KeepaliveReply = 209,
    KeepaliveOptionsRequest = 210,
    KeepaliveOptionsReply = 211,
    JsonControl = 250,
}

impl Command {
    /// Map a wire code to a command
    pub fn from_code(code: u8) -> Option<Self> {
        let cmd = match code {
            1 => Self::Disconnect,
            5 => Self::ServiceRequest,
            6 => Self::ServiceAccept,
            50 => Self::UserauthRequest,
            51 => Self::UserauthFailure,
            52 => Self::UserauthSuccess,
            80 => Self::GlobalRequest,
            81 => Self::RequestSuccess,
            82 => Self::RequestFailure,
            90 => Self::ChannelOpen,
            91 => Self::ChannelOpenConfirmation,
            92 => Self::ChannelOpenFailure,
            93 => Self::ChannelWindowAdjust,
            94 => Self::ChannelData,
            97 => Self::ChannelClose,
            192 => Self::ProtocolVersion,
            208 => Self::KeepaliveRequest,
            209 => Self::KeepaliveReply,
            210 => Self::KeepaliveOptionsRequest,
            211 => Self::KeepaliveOptionsReply,
            250 => Self::JsonControl,
            _ => return None,
        };
        Some(cmd)
    }

    /// Wire code
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Smallest possible frame for this command, code byte included.
    ///
    /// Nothing past the code byte is interpreted until this many bytes are buffered.
    pub fn min_len(self) -> usize {
        match self {
            Self::Disconnect => 7,
            Self::ServiceRequest | Self::ServiceAccept => 5,
            Self::UserauthRequest => 13,
            Self::UserauthFailure => 7,
            Self::UserauthSuccess => 1,
            Self::GlobalRequest => 6,
            Self::RequestSuccess | Self::RequestFailure => 1,
            Self::ChannelOpen => 33,
            Self::ChannelOpenConfirmation | Self::ChannelOpenFailure => 17,
            Self::ChannelWindowAdjust => 9,
            Self::ChannelData => 9,
            Self::ChannelClose => 5,
            Self::ProtocolVersion => 93,
            Self::KeepaliveRequest | Self::KeepaliveReply => 5,
            Self::KeepaliveOptionsRequest | Self::KeepaliveOptionsReply => 9,
            Self::JsonControl => 5,
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({})", self, self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_mapping() {
        for code in 0..=u8::MAX {
            if let Some(cmd) = Command::from_code(code) {
                assert_eq!(cmd.code(), code);
            }
        }
        assert_eq!(Command::from_code(94), Some(Command::ChannelData));
        assert_eq!(Command::from_code(2), None);
    }

    #[test]
    fn test_min_lengths() {
        assert_eq!(Command::ProtocolVersion.min_len(), 93);
        assert_eq!(Command::ChannelClose.min_len(), 5);
        assert_eq!(Command::ChannelOpen.min_len(), 33);
    }
}

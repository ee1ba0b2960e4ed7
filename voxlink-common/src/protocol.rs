//! Control-channel protocol definitions
//!
//! The control channel is a TLS stream of length-prefixed frames:
//! a 2-byte big-endian message type, a 4-byte big-endian payload length,
//! then the payload (a serialized Protocol Buffers message). The type
//! integers are fixed by the Mumble 1.3 protocol and must not change.

/// Size of the control frame header: 2-byte type + 4-byte length
pub const CONTROL_HEADER_LEN: usize = 6;

/// Maximum accepted control payload length (8 MiB, matching the reference
/// server limit). Larger frames indicate a corrupt or hostile stream.
pub const MAX_CONTROL_PAYLOAD: u32 = 8 * 1024 * 1024;

/// Control message types
///
/// The numeric values are the wire representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    Version = 0,
    UdpTunnel = 1,
    Authenticate = 2,
    Ping = 3,
    Reject = 4,
    ServerSync = 5,
    ChannelRemove = 6,
    ChannelState = 7,
    UserRemove = 8,
    UserState = 9,
    BanList = 10,
    TextMessage = 11,
    PermissionDenied = 12,
    Acl = 13,
    QueryUsers = 14,
    CryptSetup = 15,
    ContextActionModify = 16,
    ContextAction = 17,
    UserList = 18,
    VoiceTarget = 19,
    PermissionQuery = 20,
    CodecVersion = 21,
    UserStats = 22,
    RequestBlob = 23,
    ServerConfig = 24,
    SuggestConfig = 25,
}

impl MessageType {
    /// Convert from the wire value
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(MessageType::Version),
            1 => Some(MessageType::UdpTunnel),
            2 => Some(MessageType::Authenticate),
            3 => Some(MessageType::Ping),
            4 => Some(MessageType::Reject),
            5 => Some(MessageType::ServerSync),
            6 => Some(MessageType::ChannelRemove),
            7 => Some(MessageType::ChannelState),
            8 => Some(MessageType::UserRemove),
            9 => Some(MessageType::UserState),
            10 => Some(MessageType::BanList),
            11 => Some(MessageType::TextMessage),
            12 => Some(MessageType::PermissionDenied),
            13 => Some(MessageType::Acl),
            14 => Some(MessageType::QueryUsers),
            15 => Some(MessageType::CryptSetup),
            16 => Some(MessageType::ContextActionModify),
            17 => Some(MessageType::ContextAction),
            18 => Some(MessageType::UserList),
            19 => Some(MessageType::VoiceTarget),
            20 => Some(MessageType::PermissionQuery),
            21 => Some(MessageType::CodecVersion),
            22 => Some(MessageType::UserStats),
            23 => Some(MessageType::RequestBlob),
            24 => Some(MessageType::ServerConfig),
            25 => Some(MessageType::SuggestConfig),
            _ => None,
        }
    }

    /// Convert to the wire value
    pub fn to_u16(self) -> u16 {
        self as u16
    }
}

/// Build the 6-byte control frame header for a payload
pub fn encode_header(msg_type: MessageType, payload_len: u32) -> [u8; CONTROL_HEADER_LEN] {
    let ty = msg_type.to_u16().to_be_bytes();
    let len = payload_len.to_be_bytes();
    [ty[0], ty[1], len[0], len[1], len[2], len[3]]
}

/// Split a 6-byte control frame header into (raw type, payload length)
pub fn decode_header(header: &[u8; CONTROL_HEADER_LEN]) -> (u16, u32) {
    let ty = u16::from_be_bytes([header[0], header[1]]);
    let len = u32::from_be_bytes([header[2], header[3], header[4], header[5]]);
    (ty, len)
}

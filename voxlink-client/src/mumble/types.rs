//! Protocol data model and events

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Connection lifecycle states
///
/// `Failed` is absorbing: once a live connection dies, only
/// `disconnect()` moves the machine on (to `Disconnected`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Synchronizing,
    Synchronized,
    Disconnecting,
    Failed,
}

/// Server rejection codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    None,
    WrongVersion,
    InvalidUsername,
    WrongPassword,
    UsernameInUse,
    ServerFull,
    NoCertificate,
    AuthenticatorFail,
}

impl RejectReason {
    /// Map the server's numeric code
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => RejectReason::WrongVersion,
            2 => RejectReason::InvalidUsername,
            3 => RejectReason::WrongPassword,
            4 => RejectReason::UsernameInUse,
            5 => RejectReason::ServerFull,
            6 => RejectReason::NoCertificate,
            7 => RejectReason::AuthenticatorFail,
            _ => RejectReason::None,
        }
    }
}

/// A channel in the server's tree
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Channel {
    pub id: u32,
    /// Parent channel id; 0 for the root (and for the root itself)
    pub parent_id: u32,
    pub name: String,
    pub description: String,
    pub position: i32,
    pub temporary: bool,
    pub linked: BTreeSet<u32>,
}

/// A connected user
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct User {
    pub session: u32,
    pub channel_id: u32,
    pub name: String,
    pub comment: String,
    pub mute: bool,
    pub deaf: bool,
    pub self_mute: bool,
    pub self_deaf: bool,
    pub suppress: bool,
    pub recording: bool,
    pub priority: i32,
}

/// Server-provided configuration and welcome data
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerInfo {
    pub welcome_message: String,
    pub max_bandwidth: u32,
    pub max_users: u32,
    pub allow_html: bool,
    pub server_version: String,
}

/// Events emitted by the protocol engine
#[derive(Debug, Clone, PartialEq)]
pub enum MumbleEvent {
    /// The connection state machine moved
    StateChanged(ConnectionState),
    /// SHA-256 fingerprint of the server certificate, for pinning
    CertificateFingerprint(String),
    /// The server refused the connection; state is `Failed`
    Rejected {
        reason: RejectReason,
        message: String,
    },
    ChannelAdded(Channel),
    ChannelUpdated(Channel),
    /// Carries the last snapshot of the removed channel
    ChannelRemoved(Channel),
    UserAdded(User),
    UserUpdated(User),
    /// Carries the last snapshot of the removed user
    UserRemoved(User),
    ServerInfoUpdated(ServerInfo),
    /// UDP reachability changed or was re-measured
    UdpAvailability { available: bool, latency_ms: f32 },
    /// A voice packet failed authentication; a fresh CryptSetup has been
    /// requested from the server
    CryptoResyncRequested,
}

/// One decoded frame of speaker audio leaving the protocol engine
///
/// This is the engine's one-way hand-off to the audio side: 16-bit PCM
/// at 48 kHz mono plus the identifiers playback needs. The audio side
/// never calls back into the protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceFrame {
    pub session: u32,
    pub sequence: i64,
    pub samples: Vec<i16>,
    /// Frame synthesized by packet loss concealment
    pub is_plc: bool,
    /// Last frame of the speaker's transmission
    pub end_of_transmission: bool,
}

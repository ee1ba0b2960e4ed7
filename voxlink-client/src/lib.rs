//! Voxlink Client Library
//!
//! The core voice engine of a Mumble-1.3-compatible client:
//!
//! - A TLS control connection with the protocol state machine, roster,
//!   and keepalive ([`mumble::client::MumbleClient`])
//! - OCB-AES128 sealing for UDP voice datagrams ([`crypto::CryptState`])
//! - A UDP pinger that picks the voice transport (encrypted datagrams
//!   or the TCP tunnel)
//! - Per-speaker jitter-absorbing playback buffers with crossfade,
//!   mixed to 16-bit PCM ([`audio::playback::PlaybackEngine`])
//! - A capture pipeline with voice-activity gating, optional denoise
//!   and AGC, and Opus encoding ([`audio::capture::CapturePipeline`])
//!
//! Platform audio I/O stays outside: the embedding application pushes
//! capture frames in and pulls render frames out from its own device
//! callbacks. A typical session:
//!
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use voxlink_client::config::ClientConfig;
//! use voxlink_client::engine::VoiceEngine;
//! use voxlink_client::mumble::client::MumbleClient;
//!
//! let config = ClientConfig::new("voice.example.com", "alice");
//! let (client, mut events, voice) = MumbleClient::connect(config).await?;
//!
//! let engine = VoiceEngine::for_client(
//!     Default::default(),
//!     Default::default(),
//!     Some(Default::default()),
//!     Default::default(),
//!     client.voice_sender(),
//! )?;
//! engine.attach_voice_stream(voice);
//!
//! // device capture callback: engine.push_capture_frames(samples)
//! // device render callback:  engine.render(buffer)
//! while let Some(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

pub mod audio;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod mumble;
pub mod network;

pub use config::ClientConfig;
pub use engine::VoiceEngine;
pub use error::ClientError;
pub use mumble::client::{ClientStats, MumbleClient, VoiceSender};
pub use mumble::types::{
    Channel, ConnectionState, MumbleEvent, RejectReason, ServerInfo, User, VoiceFrame,
};

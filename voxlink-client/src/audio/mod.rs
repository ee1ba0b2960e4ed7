//! Audio subsystem
//!
//! Everything between the codec and the platform audio device:
//! - Per-speaker playback buffers with crossfade
//! - Float mixing down to 16-bit device buffers
//! - Voice activity detection for the send path
//! - The capture pipeline that gates and encodes microphone audio
//! - A legacy single-stream jitter buffer for callback-style decoding
//!
//! The platform device itself is external: the playback engine is pulled
//! from the device's render callback and the capture pipeline is pushed
//! from its capture callback.

pub mod buffer;
pub mod capture;
pub mod jitter;
pub mod mixer;
pub mod playback;
pub mod processor;
pub mod vad;

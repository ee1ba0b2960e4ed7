//! Client and component configuration

use serde::{Deserialize, Serialize};

use voxlink_common::DEFAULT_PORT;
use voxlink_common::voice::{FRAME_SIZE, SAMPLE_RATE};

/// Client certificate presented during the TLS handshake (PEM files)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientCertificate {
    /// Path to the PEM-encoded certificate chain
    pub cert_path: String,
    /// Path to the PEM-encoded private key
    pub key_path: String,
}

/// Connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server hostname or IP address
    pub host: String,
    /// Server port (TCP control and UDP voice)
    pub port: u16,
    /// Username presented in Authenticate
    pub username: String,
    /// Optional server password
    pub password: Option<String>,
    /// Optional client certificate
    pub certificate: Option<ClientCertificate>,
    /// Verify the server certificate against the system roots.
    /// Off by default: Mumble servers overwhelmingly use self-signed certs.
    pub validate_server_certificate: bool,
}

impl ClientConfig {
    /// Create a config with defaults for everything but host and username
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            username: username.into(),
            password: None,
            certificate: None,
            validate_server_certificate: false,
        }
    }
}

/// Opus encoder configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecConfig {
    /// Target bitrate in bits per second
    pub bitrate: i32,
    /// Encoder complexity, 0-10
    pub complexity: i32,
    /// Variable bitrate
    pub vbr: bool,
    /// Discontinuous transmission
    pub dtx: bool,
    /// In-band forward error correction
    pub fec: bool,
    /// Expected packet loss percentage, drives FEC aggressiveness
    pub packet_loss_perc: i32,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            bitrate: 64_000,
            complexity: 5,
            vbr: true,
            dtx: true,
            fec: true,
            packet_loss_perc: 10,
        }
    }
}

/// Voice activity detector configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VadConfig {
    /// Smoothed-energy threshold, 0.0 - 1.0
    pub threshold: f32,
    /// Time above threshold before voice is confirmed
    pub attack_ms: u32,
    /// Time voice stays on after the signal drops
    pub hold_ms: u32,
    /// Absolute floor below which nothing counts as signal
    pub min_signal_level: f32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: 0.01,
            attack_ms: 10,
            hold_ms: 300,
            min_signal_level: 0.001,
        }
    }
}

/// Per-user playback buffer configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Buffered audio required before playback starts
    pub min_buffer_ms: u32,
    /// Buffered audio above which the oldest samples are evicted
    pub max_buffer_ms: u32,
}

impl BufferConfig {
    /// Minimum buffer size in samples
    pub fn min_buffer_samples(&self) -> usize {
        (self.min_buffer_ms as usize * SAMPLE_RATE as usize) / 1000
    }

    /// Maximum buffer size in samples
    pub fn max_buffer_samples(&self) -> usize {
        (self.max_buffer_ms as usize * SAMPLE_RATE as usize) / 1000
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            min_buffer_ms: 60,
            max_buffer_ms: 200,
        }
    }
}

/// Legacy single-stream jitter buffer configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JitterConfig {
    /// Fixed target delay (kept for stats; never adapted)
    pub target_delay_ms: u32,
    /// Minimum buffered audio before frames are released
    pub min_delay_ms: u32,
}

impl JitterConfig {
    /// Packets needed to cover `min_delay_ms` at the codec frame size
    pub fn min_packets(&self) -> usize {
        (self.min_delay_ms as usize * SAMPLE_RATE as usize) / (FRAME_SIZE * 1000)
    }
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self {
            target_delay_ms: 100,
            min_delay_ms: 40,
        }
    }
}

/// Capture preprocessor configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PreprocessorConfig {
    /// RNNoise denoising
    pub denoise: bool,
    /// Automatic gain control
    pub agc: bool,
    /// AGC target level as a fraction of full scale
    pub agc_target: f32,
    /// Maximum AGC gain factor
    pub agc_max_gain: f32,
}

impl Default for PreprocessorConfig {
    fn default() -> Self {
        Self {
            denoise: true,
            agc: true,
            agc_target: 0.125,
            agc_max_gain: 16.0,
        }
    }
}

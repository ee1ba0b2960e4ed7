//! Opus codec adapter
//!
//! Wraps the Opus encoder and decoder for the fixed voice format
//! (48 kHz mono, 480-sample frames). Decoders are pooled per speaker
//! session so each stream keeps private codec state, which is what makes
//! packet loss concealment work.

use std::collections::HashMap;

use opus::{Application, Channels, Decoder, Encoder};

use voxlink_common::voice::{FRAME_SIZE, SAMPLE_RATE};

use crate::config::CodecConfig;

/// Maximum encoded frame size in bytes. A 10 ms Opus frame tops out far
/// below this even at high bitrates; the headroom covers FEC data.
const MAX_ENCODED_FRAME_SIZE: usize = 512;

// =============================================================================
// Voice Encoder
// =============================================================================

/// Opus encoder for outgoing voice audio
pub struct VoiceEncoder {
    encoder: Encoder,
    config: CodecConfig,
}

impl VoiceEncoder {
    /// Create an encoder with the given configuration
    pub fn new(config: CodecConfig) -> Result<Self, String> {
        let mut encoder = Encoder::new(SAMPLE_RATE, Channels::Mono, Application::Voip)
            .map_err(|e| format!("Failed to create Opus encoder: {}", e))?;

        encoder
            .set_bitrate(opus::Bitrate::Bits(config.bitrate))
            .map_err(|e| format!("Failed to set bitrate: {}", e))?;
        encoder
            .set_complexity(config.complexity)
            .map_err(|e| format!("Failed to set complexity: {}", e))?;
        encoder
            .set_vbr(config.vbr)
            .map_err(|e| format!("Failed to set VBR: {}", e))?;
        encoder
            .set_dtx(config.dtx)
            .map_err(|e| format!("Failed to set DTX: {}", e))?;
        encoder
            .set_inband_fec(config.fec)
            .map_err(|e| format!("Failed to set FEC: {}", e))?;
        if config.fec {
            encoder
                .set_packet_loss_perc(config.packet_loss_perc)
                .map_err(|e| format!("Failed to set packet loss: {}", e))?;
        }

        Ok(Self { encoder, config })
    }

    /// Update the bitrate without recreating the encoder
    pub fn set_bitrate(&mut self, bitrate: i32) -> Result<(), String> {
        self.encoder
            .set_bitrate(opus::Bitrate::Bits(bitrate))
            .map_err(|e| format!("Failed to set bitrate: {}", e))?;
        self.config.bitrate = bitrate;
        Ok(())
    }

    /// Encode one frame of PCM samples
    ///
    /// `samples` must be exactly [`FRAME_SIZE`] values.
    pub fn encode(&mut self, samples: &[i16]) -> Result<Vec<u8>, String> {
        if samples.len() != FRAME_SIZE {
            return Err(format!(
                "Expected {} samples, got {}",
                FRAME_SIZE,
                samples.len()
            ));
        }

        let mut output = vec![0u8; MAX_ENCODED_FRAME_SIZE];
        let len = self
            .encoder
            .encode(samples, &mut output)
            .map_err(|e| format!("Opus encode error: {}", e))?;

        output.truncate(len);
        Ok(output)
    }

    /// Current configuration
    pub fn config(&self) -> CodecConfig {
        self.config
    }
}

// =============================================================================
// Voice Decoder
// =============================================================================

/// Opus decoder for a single incoming voice stream
pub struct VoiceDecoder {
    decoder: Decoder,
}

impl VoiceDecoder {
    pub fn new() -> Result<Self, String> {
        let decoder = Decoder::new(SAMPLE_RATE, Channels::Mono)
            .map_err(|e| format!("Failed to create Opus decoder: {}", e))?;
        Ok(Self { decoder })
    }

    /// Decode an Opus frame to PCM
    pub fn decode(&mut self, data: &[u8]) -> Result<Vec<i16>, String> {
        let mut output = vec![0i16; FRAME_SIZE];
        let len = self
            .decoder
            .decode(data, &mut output, false)
            .map_err(|e| format!("Opus decode error: {}", e))?;

        output.truncate(len);
        Ok(output)
    }

    /// Generate one concealment frame for a lost packet
    ///
    /// Uses the decoder's internal state to interpolate over the gap.
    pub fn decode_plc(&mut self) -> Result<Vec<i16>, String> {
        let mut output = vec![0i16; FRAME_SIZE];
        let len = self
            .decoder
            .decode(&[], &mut output, false)
            .map_err(|e| format!("Opus PLC error: {}", e))?;

        output.truncate(len);
        Ok(output)
    }
}

// =============================================================================
// Decoder Pool
// =============================================================================

/// One decoder per speaker session
///
/// Decoders are created on first use and dropped when the user leaves.
pub struct DecoderPool {
    decoders: HashMap<u32, VoiceDecoder>,
}

impl DecoderPool {
    pub fn new() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Decode a frame from a specific session
    pub fn decode(&mut self, session: u32, data: &[u8]) -> Result<Vec<i16>, String> {
        if !self.decoders.contains_key(&session) {
            self.decoders.insert(session, VoiceDecoder::new()?);
        }
        self.decoders
            .get_mut(&session)
            .expect("decoder exists after insert")
            .decode(data)
    }

    /// Generate a concealment frame from a session's decoder state
    pub fn decode_plc(&mut self, session: u32) -> Result<Vec<i16>, String> {
        let decoder = self
            .decoders
            .get_mut(&session)
            .ok_or_else(|| format!("No decoder for session {}", session))?;
        decoder.decode_plc()
    }

    /// Drop a session's decoder
    pub fn remove(&mut self, session: u32) {
        self.decoders.remove(&session);
    }

    /// Number of live decoders
    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    /// Whether the pool is empty
    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }
}

impl Default for DecoderPool {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sine_frame(amplitude: f32) -> Vec<i16> {
        (0..FRAME_SIZE)
            .map(|i| {
                let t = i as f32 / SAMPLE_RATE as f32;
                (f32::sin(2.0 * std::f32::consts::PI * 440.0 * t) * amplitude * 32767.0) as i16
            })
            .collect()
    }

    #[test]
    fn test_encoder_creation() {
        assert!(VoiceEncoder::new(CodecConfig::default()).is_ok());
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut encoder = VoiceEncoder::new(CodecConfig::default()).unwrap();
        let mut decoder = VoiceDecoder::new().unwrap();

        let samples = sine_frame(0.5);
        let encoded = encoder.encode(&samples).unwrap();
        assert!(!encoded.is_empty());
        assert!(encoded.len() < FRAME_SIZE * 2);

        let decoded = decoder.decode(&encoded).unwrap();
        assert_eq!(decoded.len(), FRAME_SIZE);

        // Lossy codec: just check we got signal back, not silence
        let peak = decoded.iter().map(|&s| s.unsigned_abs()).max().unwrap();
        assert!(peak > 3000, "decoded audio is implausibly quiet: {}", peak);
    }

    #[test]
    fn test_encoder_rejects_wrong_frame_size() {
        let mut encoder = VoiceEncoder::new(CodecConfig::default()).unwrap();
        assert!(encoder.encode(&vec![0i16; 100]).is_err());
        assert!(encoder.encode(&vec![0i16; FRAME_SIZE * 2]).is_err());
    }

    #[test]
    fn test_encoder_set_bitrate() {
        let mut encoder = VoiceEncoder::new(CodecConfig::default()).unwrap();
        encoder.set_bitrate(32_000).unwrap();
        assert_eq!(encoder.config().bitrate, 32_000);
        assert!(encoder.encode(&sine_frame(0.2)).is_ok());
    }

    #[test]
    fn test_decoder_plc_after_real_frame() {
        let mut encoder = VoiceEncoder::new(CodecConfig::default()).unwrap();
        let mut decoder = VoiceDecoder::new().unwrap();

        let encoded = encoder.encode(&sine_frame(0.5)).unwrap();
        decoder.decode(&encoded).unwrap();

        let concealed = decoder.decode_plc().unwrap();
        assert_eq!(concealed.len(), FRAME_SIZE);
    }

    #[test]
    fn test_decoder_pool_per_session_state() {
        let mut pool = DecoderPool::new();
        let mut encoder = VoiceEncoder::new(CodecConfig::default()).unwrap();
        let encoded = encoder.encode(&sine_frame(0.3)).unwrap();

        assert!(pool.is_empty());
        pool.decode(42, &encoded).unwrap();
        pool.decode(43, &encoded).unwrap();
        assert_eq!(pool.len(), 2);

        // Same session reuses its decoder
        pool.decode(42, &encoded).unwrap();
        assert_eq!(pool.len(), 2);

        // PLC requires existing decoder state
        assert!(pool.decode_plc(42).is_ok());
        assert!(pool.decode_plc(99).is_err());

        pool.remove(42);
        assert_eq!(pool.len(), 1);
    }
}

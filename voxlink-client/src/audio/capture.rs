//! Capture pipeline
//!
//! Sits between the platform capture callback and the voice sender. The
//! device delivers frames of whatever size it likes; the pipeline
//! accumulates them into codec-sized frames, runs the preprocessor and
//! the VAD gate, encodes what passes, and hands each encoded frame to
//! the sink callback. When the gate closes after speech, one final frame
//! is emitted flagged as the end of the transmission so the receiver can
//! fade out cleanly.

use std::collections::VecDeque;

use voxlink_common::voice::FRAME_SIZE;

use crate::audio::processor::Preprocessor;
use crate::audio::vad::{VoiceActivityDetector, calculate_rms};
use crate::codec::VoiceEncoder;
use crate::config::{CodecConfig, PreprocessorConfig, VadConfig};

/// Accumulator cap in codec frames; device bursts beyond this drop the
/// oldest audio rather than growing without bound
const MAX_ACCUMULATOR_FRAMES: usize = 10;

/// Headroom multiplier for the input level meter
const LEVEL_DISPLAY_SCALE: f32 = 2.0;

/// One encoded frame leaving the pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    /// Opus payload
    pub payload: Vec<u8>,
    /// Last frame of this talk spurt
    pub end_of_transmission: bool,
}

/// Capture pipeline statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub frames_encoded: u64,
    pub frames_gated: u64,
    pub encode_errors: u64,
    pub accumulator_overflows: u64,
}

/// Microphone-to-encoder pipeline
pub struct CapturePipeline {
    accumulator: VecDeque<i16>,
    vad: VoiceActivityDetector,
    vad_enabled: bool,
    preprocessor: Option<Preprocessor>,
    encoder: VoiceEncoder,

    push_to_talk: bool,
    transmitting: bool,
    input_level: f32,

    stats: CaptureStats,
    sink: Box<dyn FnMut(EncodedFrame) + Send>,
}

impl CapturePipeline {
    /// Create a pipeline delivering encoded frames to `sink`
    pub fn new(
        codec_config: CodecConfig,
        vad_config: VadConfig,
        preprocessor_config: Option<PreprocessorConfig>,
        sink: Box<dyn FnMut(EncodedFrame) + Send>,
    ) -> Result<Self, String> {
        Ok(Self {
            accumulator: VecDeque::with_capacity(FRAME_SIZE * MAX_ACCUMULATOR_FRAMES),
            vad: VoiceActivityDetector::new(vad_config),
            vad_enabled: true,
            preprocessor: preprocessor_config.map(Preprocessor::new),
            encoder: VoiceEncoder::new(codec_config)?,
            push_to_talk: false,
            transmitting: false,
            input_level: 0.0,
            stats: CaptureStats::default(),
            sink,
        })
    }

    /// Feed device samples; encodes every complete codec frame
    pub fn push_frames(&mut self, samples: &[i16]) {
        self.accumulator.extend(samples);

        let cap = FRAME_SIZE * MAX_ACCUMULATOR_FRAMES;
        if self.accumulator.len() > cap {
            let excess = self.accumulator.len() - cap;
            self.accumulator.drain(..excess);
            self.stats.accumulator_overflows += 1;
        }

        let mut frame = [0i16; FRAME_SIZE];
        while self.accumulator.len() >= FRAME_SIZE {
            for slot in frame.iter_mut() {
                *slot = self.accumulator.pop_front().expect("length checked");
            }
            self.process_frame(&mut frame);
        }
    }

    fn process_frame(&mut self, frame: &mut [i16; FRAME_SIZE]) {
        if let Some(preprocessor) = self.preprocessor.as_mut() {
            // A preprocessor failure leaves the frame unprocessed, not lost
            let _ = preprocessor.process(frame);
        }

        self.input_level = (calculate_rms(frame) * LEVEL_DISPLAY_SCALE).min(1.0);

        let vad_voice = self.vad.process(frame);
        let open = self.push_to_talk || !self.vad_enabled || vad_voice;

        if open {
            self.encode_and_emit(frame, false);
            self.transmitting = true;
        } else if self.transmitting {
            // Gate just closed: flush this frame with the terminator set
            // so the far side fades out instead of clicking.
            self.encode_and_emit(frame, true);
            self.transmitting = false;
        } else {
            self.stats.frames_gated += 1;
        }
    }

    fn encode_and_emit(&mut self, frame: &[i16; FRAME_SIZE], end_of_transmission: bool) {
        match self.encoder.encode(frame) {
            Ok(payload) => {
                self.stats.frames_encoded += 1;
                (self.sink)(EncodedFrame {
                    payload,
                    end_of_transmission,
                });
            }
            Err(_) => {
                self.stats.encode_errors += 1;
            }
        }
    }

    /// Assert or release push-to-talk (bypasses the VAD gate)
    pub fn set_push_to_talk(&mut self, active: bool) {
        self.push_to_talk = active;
    }

    /// Enable or disable VAD gating; disabled means always transmit
    pub fn set_vad_enabled(&mut self, enabled: bool) {
        self.vad_enabled = enabled;
    }

    /// Update the VAD threshold
    pub fn set_vad_threshold(&mut self, threshold: f32) {
        self.vad.set_threshold(threshold);
    }

    /// Whether the VAD currently detects voice
    pub fn is_voice_detected(&self) -> bool {
        self.vad.is_voice_detected()
    }

    /// Input level of the most recent frame, 0.0 - 1.0
    pub fn input_level(&self) -> f32 {
        self.input_level
    }

    /// Update the encoder bitrate
    pub fn set_bitrate(&mut self, bitrate: i32) -> Result<(), String> {
        self.encoder.set_bitrate(bitrate)
    }

    /// Update the preprocessor configuration (no-op if none was built)
    pub fn set_preprocessor_config(&mut self, config: PreprocessorConfig) {
        if let Some(preprocessor) = self.preprocessor.as_mut() {
            preprocessor.update_config(config);
        }
    }

    /// Snapshot of pipeline statistics
    pub fn stats(&self) -> CaptureStats {
        self.stats
    }
}

//! Voice activity detection
//!
//! Energy-based detector gating the encode/send path. The RMS of each
//! frame feeds a smoothed level; the level must stay above threshold for
//! the attack time before voice is confirmed, and voice is held for the
//! hold time after the level drops so word endings are not clipped.

use voxlink_common::voice::SAMPLE_RATE;

use crate::config::VadConfig;

/// Smoothing factor for the signal level (level = 0.9*level + 0.1*rms)
const SMOOTHING_FACTOR: f32 = 0.1;

/// Energy-based voice activity detector
pub struct VoiceActivityDetector {
    config: VadConfig,

    voice_detected: bool,
    smoothed_level: f32,

    attack_samples: i32,
    hold_samples: i32,
    attack_counter: i32,
    hold_counter: i32,
}

impl VoiceActivityDetector {
    pub fn new(config: VadConfig) -> Self {
        Self {
            config,
            voice_detected: false,
            smoothed_level: 0.0,
            attack_samples: ((config.attack_ms * SAMPLE_RATE) / 1000) as i32,
            hold_samples: ((config.hold_ms * SAMPLE_RATE) / 1000) as i32,
            attack_counter: 0,
            hold_counter: 0,
        }
    }

    /// Feed a frame of samples; returns the current voice decision
    pub fn process(&mut self, samples: &[i16]) -> bool {
        let rms = calculate_rms(samples);

        self.smoothed_level = self.smoothed_level * (1.0 - SMOOTHING_FACTOR) + rms * SMOOTHING_FACTOR;

        let above = self.smoothed_level > self.config.threshold
            && self.smoothed_level > self.config.min_signal_level;

        if above {
            self.attack_counter += samples.len() as i32;
            if self.attack_counter >= self.attack_samples {
                self.voice_detected = true;
                self.hold_counter = self.hold_samples;
            }
        } else {
            self.attack_counter = 0;
            if self.hold_counter > 0 {
                self.hold_counter -= samples.len() as i32;
                if self.hold_counter <= 0 {
                    self.voice_detected = false;
                    self.hold_counter = 0;
                }
            }
        }

        self.voice_detected
    }

    /// Current voice decision, including hold time
    pub fn is_voice_detected(&self) -> bool {
        self.voice_detected
    }

    /// Smoothed signal level, 0.0 - 1.0
    pub fn signal_level(&self) -> f32 {
        self.smoothed_level
    }

    /// Update the detection threshold, clamped to [0, 1]
    pub fn set_threshold(&mut self, threshold: f32) {
        self.config.threshold = threshold.clamp(0.0, 1.0);
    }

    pub fn threshold(&self) -> f32 {
        self.config.threshold
    }

    /// Clear all detector state
    pub fn reset(&mut self) {
        self.voice_detected = false;
        self.smoothed_level = 0.0;
        self.attack_counter = 0;
        self.hold_counter = 0;
    }
}

/// RMS energy of a frame, normalized to 0.0 - 1.0
pub fn calculate_rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum: f64 = samples
        .iter()
        .map(|&s| {
            let normalized = s as f64 / 32768.0;
            normalized * normalized
        })
        .sum();

    (sum / samples.len() as f64).sqrt() as f32
}

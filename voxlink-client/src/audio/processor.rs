//! Capture preprocessor
//!
//! Optional enhancement stage run on microphone frames before the VAD
//! and encoder: RNNoise denoising and a simple automatic gain control.
//! Both stages are toggleable at runtime. Echo cancellation is out of
//! scope for this engine.

use nnnoiseless::DenoiseState;

use voxlink_common::voice::FRAME_SIZE;

use crate::config::PreprocessorConfig;

/// How quickly the AGC gain tracks its target (per frame)
const AGC_ADAPT_RATE: f32 = 0.1;

/// Signal floor below which the AGC holds its gain instead of pumping
/// noise up to the target level
const AGC_SIGNAL_FLOOR: f32 = 0.001;

/// Denoise + AGC stage for capture frames
pub struct Preprocessor {
    config: PreprocessorConfig,
    denoiser: Box<DenoiseState<'static>>,
    /// Scratch buffers in the f32 sample domain the denoiser works in
    scratch_in: [f32; FRAME_SIZE],
    scratch_out: [f32; FRAME_SIZE],
    speech_probability: f32,
    agc_gain: f32,
}

impl Preprocessor {
    pub fn new(config: PreprocessorConfig) -> Self {
        Self {
            config,
            denoiser: DenoiseState::new(),
            scratch_in: [0.0; FRAME_SIZE],
            scratch_out: [0.0; FRAME_SIZE],
            speech_probability: 0.0,
            agc_gain: 1.0,
        }
    }

    /// Process one frame in place
    ///
    /// `samples` must be exactly [`FRAME_SIZE`] values.
    pub fn process(&mut self, samples: &mut [i16]) -> Result<(), String> {
        if samples.len() != FRAME_SIZE {
            return Err(format!(
                "Expected {} samples, got {}",
                FRAME_SIZE,
                samples.len()
            ));
        }

        if self.config.denoise {
            // RNNoise works on f32 samples at int16 scale
            for (dst, &src) in self.scratch_in.iter_mut().zip(samples.iter()) {
                *dst = src as f32;
            }
            self.speech_probability = self
                .denoiser
                .process_frame(&mut self.scratch_out, &self.scratch_in);
            for (dst, &src) in samples.iter_mut().zip(self.scratch_out.iter()) {
                *dst = src.clamp(-32768.0, 32767.0) as i16;
            }
        }

        if self.config.agc {
            self.apply_agc(samples);
        }

        Ok(())
    }

    fn apply_agc(&mut self, samples: &mut [i16]) {
        let rms = super::vad::calculate_rms(samples);

        if rms > AGC_SIGNAL_FLOOR {
            let desired = (self.config.agc_target / rms).min(self.config.agc_max_gain);
            self.agc_gain += (desired - self.agc_gain) * AGC_ADAPT_RATE;
        }

        for sample in samples.iter_mut() {
            let scaled = *sample as f32 * self.agc_gain;
            *sample = scaled.clamp(-32768.0, 32767.0) as i16;
        }
    }

    /// Speech probability from the last denoised frame, 0.0 - 1.0
    pub fn speech_probability(&self) -> f32 {
        self.speech_probability
    }

    /// Current AGC gain factor
    pub fn agc_gain(&self) -> f32 {
        self.agc_gain
    }

    /// Replace the configuration; denoiser state is kept
    pub fn update_config(&mut self, config: PreprocessorConfig) {
        self.config = config;
    }

    pub fn config(&self) -> PreprocessorConfig {
        self.config
    }

    /// Reset gain and denoiser state
    pub fn reset(&mut self) {
        self.denoiser = DenoiseState::new();
        self.speech_probability = 0.0;
        self.agc_gain = 1.0;
    }
}

//! Float mixing down to 16-bit PCM
//!
//! A fixed-size float accumulator: each speaker's frame is summed in,
//! then the mix is clamped to [-1, +1] and scaled to int16 for the
//! device. Hard clamping keeps simultaneous loud speakers from wrapping.

/// Fixed-size float accumulator for one output frame
pub struct FloatMixer {
    mix: Vec<f32>,
}

impl FloatMixer {
    /// Create a mixer for `frame_size` samples
    pub fn new(frame_size: usize) -> Self {
        Self {
            mix: vec![0.0; frame_size],
        }
    }

    /// Frame size in samples
    pub fn frame_size(&self) -> usize {
        self.mix.len()
    }

    /// Zero the accumulator
    pub fn clear(&mut self) {
        self.mix.fill(0.0);
    }

    /// Sum a speaker's samples into the accumulator
    ///
    /// Input longer than the frame is truncated; shorter input
    /// contributes only its prefix.
    pub fn add(&mut self, samples: &[f32]) {
        for (slot, &sample) in self.mix.iter_mut().zip(samples) {
            *slot += sample;
        }
    }

    /// Clamp and scale the mix into a 16-bit output buffer
    pub fn get_mixed(&self, output: &mut [i16]) {
        for (out, &sample) in output.iter_mut().zip(&self.mix) {
            let clamped = sample.clamp(-1.0, 1.0);
            *out = (clamped * 32767.0).round() as i16;
        }
    }

    /// Read access to the float accumulator
    pub fn float_buffer(&self) -> &[f32] {
        &self.mix
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mix_sums_sources() {
        let mut mixer = FloatMixer::new(4);
        mixer.add(&[0.1, 0.2, 0.3, 0.4]);
        mixer.add(&[0.1, 0.1, 0.1, 0.1]);

        let mut out = [0i16; 4];
        mixer.get_mixed(&mut out);
        assert_eq!(out[0], (0.2f32 * 32767.0).round() as i16);
        assert_eq!(out[3], (0.5f32 * 32767.0).round() as i16);
    }

    #[test]
    fn test_clipping_is_saturating() {
        let mut mixer = FloatMixer::new(8);
        mixer.add(&[1.0; 8]);
        mixer.add(&[1.0; 8]);

        let mut out = [0i16; 8];
        mixer.get_mixed(&mut out);
        assert!(out.iter().all(|&s| s == 32767));

        mixer.clear();
        mixer.add(&[-1.0; 8]);
        mixer.add(&[-1.0; 8]);
        mixer.get_mixed(&mut out);
        assert!(out.iter().all(|&s| s == -32767));
    }

    #[test]
    fn test_clear_resets() {
        let mut mixer = FloatMixer::new(4);
        mixer.add(&[0.5; 4]);
        mixer.clear();

        let mut out = [1i16; 4];
        mixer.get_mixed(&mut out);
        assert_eq!(out, [0i16; 4]);
        assert!(mixer.float_buffer().iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_short_input_only_touches_prefix() {
        let mut mixer = FloatMixer::new(4);
        mixer.add(&[0.5, 0.5]);

        let mut out = [0i16; 4];
        mixer.get_mixed(&mut out);
        assert_ne!(out[0], 0);
        assert_eq!(out[2], 0);
        assert_eq!(out[3], 0);
    }
}

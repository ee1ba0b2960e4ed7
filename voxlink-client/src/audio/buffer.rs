//! Per-speaker playback buffer with crossfade
//!
//! Each speaker gets a float ring buffer fed by decoded packets and
//! drained by the playback mixer. Playback starts once a minimum amount
//! of audio is buffered (absorbing network jitter) and a sine fade-in is
//! applied at every (re)start; a fade-out is applied on the last read of
//! a talk spurt so stream edges never click.

use std::collections::VecDeque;

use voxlink_common::voice::FRAME_SIZE;

use crate::config::BufferConfig;

// =============================================================================
// Crossfade
// =============================================================================

/// Precomputed sine fade windows for one frame size
pub struct Crossfade {
    fade_in: Vec<f32>,
    fade_out: Vec<f32>,
}

impl Crossfade {
    /// Build fade tables for `fade_len` samples
    pub fn new(fade_len: usize) -> Self {
        let mul = std::f32::consts::PI / (2.0 * fade_len as f32);
        let fade_in = (0..fade_len).map(|i| (i as f32 * mul).sin()).collect();
        let fade_out = (0..fade_len)
            .map(|i| ((fade_len - i - 1) as f32 * mul).sin())
            .collect();
        Self { fade_in, fade_out }
    }

    /// Fade length in samples
    pub fn len(&self) -> usize {
        self.fade_in.len()
    }

    /// Ramp the start of `samples` up from silence
    pub fn apply_fade_in(&self, samples: &mut [f32]) {
        let n = samples.len().min(self.fade_in.len());
        for i in 0..n {
            samples[i] *= self.fade_in[i];
        }
    }

    /// Ramp the end of `samples` down to silence
    pub fn apply_fade_out(&self, samples: &mut [f32]) {
        let fade_len = self.fade_out.len();
        let n = samples.len().min(fade_len);
        let start = samples.len() - n;
        for i in 0..n {
            samples[start + i] *= self.fade_out[fade_len - n + i];
        }
    }
}

// =============================================================================
// User Audio Buffer
// =============================================================================

/// Playback statistics for one speaker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub packets_received: u64,
    pub packets_decoded: u64,
    pub plc_frames: u64,
    pub sequence_gaps: u64,
    pub buffer_overruns: u64,
    pub buffer_underruns: u64,
    pub fade_ins: u64,
    pub fade_outs: u64,
    pub current_buffer_size: usize,
    pub last_sequence: i64,
}

/// Reorder/jitter buffer over decoded float samples for one speaker
pub struct UserAudioBuffer {
    user_id: u32,
    crossfade: Crossfade,

    buffer: VecDeque<f32>,
    min_buffer_samples: usize,
    max_buffer_samples: usize,

    last_sequence: i64,
    sequence_increment: i64,

    started: bool,
    needs_fade_in: bool,
    needs_fade_out: bool,

    stats: BufferStats,
}

impl UserAudioBuffer {
    /// Create a buffer for one speaker session
    pub fn new(user_id: u32, config: BufferConfig) -> Self {
        Self {
            user_id,
            crossfade: Crossfade::new(FRAME_SIZE),
            buffer: VecDeque::new(),
            min_buffer_samples: config.min_buffer_samples(),
            max_buffer_samples: config.max_buffer_samples(),
            last_sequence: -1,
            sequence_increment: 1,
            started: false,
            needs_fade_in: true,
            needs_fade_out: false,
            stats: BufferStats {
                last_sequence: -1,
                ..BufferStats::default()
            },
        }
    }

    /// Speaker session id this buffer belongs to
    pub fn user_id(&self) -> u32 {
        self.user_id
    }

    /// Append decoded samples for a packet
    ///
    /// Converts int16 to float, tracks sequence gaps (adapting the
    /// expected increment to the sender's packet framing), and evicts the
    /// oldest audio when the buffer exceeds its cap.
    pub fn add_samples(&mut self, samples: &[i16], sequence: i64, is_plc: bool) {
        self.detect_sequence_gap(sequence);

        self.stats.packets_received += 1;
        if is_plc {
            self.stats.plc_frames += 1;
        } else {
            self.stats.packets_decoded += 1;
        }
        self.stats.last_sequence = sequence;
        self.last_sequence = sequence;

        for &sample in samples {
            self.buffer.push_back(sample as f32 / 32768.0);
        }

        if self.buffer.len() > self.max_buffer_samples {
            let excess = self.buffer.len() - self.max_buffer_samples;
            self.buffer.drain(..excess);
            self.stats.buffer_overruns += 1;
        }

        self.stats.current_buffer_size = self.buffer.len();
    }

    fn detect_sequence_gap(&mut self, sequence: i64) {
        if self.last_sequence < 0 {
            return;
        }

        let expected = self.last_sequence + self.sequence_increment;
        if sequence != expected {
            let gap = sequence - self.last_sequence;
            if gap > self.sequence_increment {
                self.stats.sequence_gaps += 1;
            }
            // Senders may pack more than one codec frame per packet;
            // adopt the observed stride as the new expectation.
            if gap > 0 && gap < 100 {
                self.sequence_increment = gap;
            }
        }
    }

    /// Pull up to `frames` samples into `output`, zero-padding the tail
    ///
    /// Returns the number of samples actually read. Returns 0 while the
    /// buffer is still filling toward its minimum, and 0 with a state
    /// reset on underrun.
    pub fn read_float(&mut self, output: &mut [f32]) -> usize {
        let frames = output.len();

        if !self.started {
            if self.buffer.len() >= self.min_buffer_samples {
                self.started = true;
                self.needs_fade_in = true;
            } else {
                output.fill(0.0);
                return 0;
            }
        }

        if self.buffer.is_empty() {
            self.started = false;
            self.needs_fade_in = true;
            self.stats.buffer_underruns += 1;
            output.fill(0.0);
            return 0;
        }

        let read = frames.min(self.buffer.len());
        for slot in output.iter_mut().take(read) {
            *slot = self.buffer.pop_front().expect("length checked above");
        }
        output[read..].fill(0.0);

        if self.needs_fade_in {
            self.crossfade.apply_fade_in(&mut output[..read]);
            self.needs_fade_in = false;
            self.stats.fade_ins += 1;
        }

        if self.needs_fade_out && self.buffer.is_empty() {
            self.crossfade.apply_fade_out(&mut output[..read]);
            self.needs_fade_out = false;
            self.stats.fade_outs += 1;
        }

        self.stats.current_buffer_size = self.buffer.len();
        read
    }

    /// Request a fade-out on the final read of the current talk spurt
    pub fn notify_talking_ended(&mut self) {
        self.needs_fade_out = true;
    }

    /// Whether enough audio is buffered to start playback
    pub fn is_ready(&self) -> bool {
        self.buffer.len() >= self.min_buffer_samples
    }

    /// Whether the buffer holds audio or is mid-playback
    pub fn is_active(&self) -> bool {
        !self.buffer.is_empty() || self.started
    }

    /// Snapshot of playback statistics
    pub fn stats(&self) -> BufferStats {
        self.stats
    }

    /// Drop all buffered audio and restart the state machine
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.last_sequence = -1;
        self.sequence_increment = 1;
        self.started = false;
        self.needs_fade_in = true;
        self.needs_fade_out = false;
        self.stats = BufferStats {
            last_sequence: -1,
            ..BufferStats::default()
        };
    }
}

// =============================================================================
// Tests
// =============================================================================

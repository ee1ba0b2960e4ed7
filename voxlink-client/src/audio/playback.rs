//! Playback engine
//!
//! Owns the per-speaker buffer table and mixes one frame from every
//! active speaker into each device output buffer. Designed to be called
//! from the device's render callback: the table lock is taken briefly to
//! snapshot the active buffers, then each buffer's own lock is taken
//! briefly while its frame is pulled. Decoded audio arrives from the
//! network side through [`PlaybackEngine::add_user_audio`]; the two
//! sides share nothing but the session id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use voxlink_common::voice::FRAME_SIZE;

use crate::audio::buffer::{BufferStats, UserAudioBuffer};
use crate::audio::mixer::FloatMixer;
use crate::config::BufferConfig;

/// Multi-speaker mixing playback engine
pub struct PlaybackEngine {
    buffers: Mutex<HashMap<u32, Arc<Mutex<UserAudioBuffer>>>>,
    buffer_config: BufferConfig,
    /// Mixer and scratch frame, used only by the render path
    render_state: Mutex<RenderState>,
    /// Incremented once per render; a stalled device stops incrementing
    callback_count: AtomicU64,
    deafened: std::sync::atomic::AtomicBool,
}

struct RenderState {
    mixer: FloatMixer,
    scratch: Vec<f32>,
}

impl PlaybackEngine {
    pub fn new(buffer_config: BufferConfig) -> Self {
        Self {
            buffers: Mutex::new(HashMap::new()),
            buffer_config,
            render_state: Mutex::new(RenderState {
                mixer: FloatMixer::new(FRAME_SIZE),
                scratch: vec![0.0; FRAME_SIZE],
            }),
            callback_count: AtomicU64::new(0),
            deafened: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Queue decoded samples for a speaker, creating its buffer on demand
    pub fn add_user_audio(&self, session: u32, samples: &[i16], sequence: i64, is_plc: bool) {
        let buffer = {
            let mut table = self.buffers.lock().expect("buffer table poisoned");
            table
                .entry(session)
                .or_insert_with(|| {
                    Arc::new(Mutex::new(UserAudioBuffer::new(session, self.buffer_config)))
                })
                .clone()
        };

        buffer
            .lock()
            .expect("user buffer poisoned")
            .add_samples(samples, sequence, is_plc);
    }

    /// Mix one frame from every active speaker into `output`
    ///
    /// `output` is normally [`FRAME_SIZE`] samples; shorter buffers mix a
    /// prefix. Returns the number of speakers that contributed audio.
    pub fn render(&self, output: &mut [i16]) -> usize {
        // Snapshot the active set; the table lock is not held during the mix
        let snapshot: Vec<Arc<Mutex<UserAudioBuffer>>> = {
            let table = self.buffers.lock().expect("buffer table poisoned");
            table.values().cloned().collect()
        };

        let mut state = self.render_state.lock().expect("render state poisoned");
        let state = &mut *state;
        state.mixer.clear();

        let mut contributors = 0;
        if !self.deafened.load(Ordering::Relaxed) {
            for buffer in snapshot {
                let read = buffer
                    .lock()
                    .expect("user buffer poisoned")
                    .read_float(&mut state.scratch[..output.len().min(FRAME_SIZE)]);
                if read > 0 {
                    state.mixer.add(&state.scratch[..read]);
                    contributors += 1;
                }
            }
        }

        state.mixer.get_mixed(output);
        self.callback_count.fetch_add(1, Ordering::Relaxed);
        contributors
    }

    /// Request a fade-out on the speaker's next read
    pub fn notify_talking_ended(&self, session: u32) {
        let table = self.buffers.lock().expect("buffer table poisoned");
        if let Some(buffer) = table.get(&session) {
            buffer
                .lock()
                .expect("user buffer poisoned")
                .notify_talking_ended();
        }
    }

    /// Evict a speaker's buffer (fade-out first if it is mid-stream)
    pub fn remove_user(&self, session: u32) {
        let removed = {
            let mut table = self.buffers.lock().expect("buffer table poisoned");
            table.remove(&session)
        };
        if let Some(buffer) = removed {
            buffer
                .lock()
                .expect("user buffer poisoned")
                .notify_talking_ended();
        }
    }

    /// Drop all speaker buffers
    pub fn clear(&self) {
        self.buffers.lock().expect("buffer table poisoned").clear();
    }

    /// Mute or unmute all incoming audio
    pub fn set_deafened(&self, deafened: bool) {
        self.deafened.store(deafened, Ordering::Relaxed);
    }

    /// Number of render callbacks so far
    ///
    /// The embedding layer samples this to detect a device whose render
    /// callback has silently stopped firing.
    pub fn callback_count(&self) -> u64 {
        self.callback_count.load(Ordering::Relaxed)
    }

    /// Stats snapshot for one speaker, if present
    pub fn user_stats(&self, session: u32) -> Option<BufferStats> {
        let table = self.buffers.lock().expect("buffer table poisoned");
        table
            .get(&session)
            .map(|buffer| buffer.lock().expect("user buffer poisoned").stats())
    }

    /// Sessions with a live buffer
    pub fn active_sessions(&self) -> Vec<u32> {
        let table = self.buffers.lock().expect("buffer table poisoned");
        table.keys().copied().collect()
    }
}

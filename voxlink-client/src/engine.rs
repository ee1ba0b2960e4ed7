//! Voice engine glue
//!
//! Ties the audio components into one object the embedding application
//! drives from its device callbacks: the capture callback pushes raw
//! samples in, the render callback pulls mixed frames out, and a small
//! forwarder task moves decoded frames from the protocol client into
//! the playback buffers. The protocol side stays unaware of the audio
//! side; they meet only here.

use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

use crate::audio::capture::{CaptureStats, CapturePipeline, EncodedFrame};
use crate::audio::playback::PlaybackEngine;
use crate::config::{BufferConfig, CodecConfig, PreprocessorConfig, VadConfig};
use crate::mumble::client::VoiceSender;
use crate::mumble::types::VoiceFrame;

/// Capture, playback, and the wiring between them and a connection
pub struct VoiceEngine {
    playback: Arc<PlaybackEngine>,
    capture: StdMutex<CapturePipeline>,
    forwarder: StdMutex<Option<JoinHandle<()>>>,
}

impl VoiceEngine {
    /// Build an engine that hands encoded frames to `sink`
    pub fn new(
        codec_config: CodecConfig,
        vad_config: VadConfig,
        preprocessor_config: Option<PreprocessorConfig>,
        buffer_config: BufferConfig,
        sink: Box<dyn FnMut(EncodedFrame) + Send>,
    ) -> Result<Self, String> {
        Ok(Self {
            playback: Arc::new(PlaybackEngine::new(buffer_config)),
            capture: StdMutex::new(CapturePipeline::new(
                codec_config,
                vad_config,
                preprocessor_config,
                sink,
            )?),
            forwarder: StdMutex::new(None),
        })
    }

    /// Build an engine wired to a connection's voice sender
    pub fn for_client(
        codec_config: CodecConfig,
        vad_config: VadConfig,
        preprocessor_config: Option<PreprocessorConfig>,
        buffer_config: BufferConfig,
        sender: VoiceSender,
    ) -> Result<Self, String> {
        Self::new(
            codec_config,
            vad_config,
            preprocessor_config,
            buffer_config,
            Box::new(move |frame| sender.send_frame(&frame.payload, frame.end_of_transmission)),
        )
    }

    /// Start forwarding a connection's decoded frames into playback
    ///
    /// Replaces any previous stream. Talk-spurt ends propagate to the
    /// speaker's buffer so it fades out instead of clicking.
    pub fn attach_voice_stream(&self, mut voice_rx: UnboundedReceiver<VoiceFrame>) {
        let playback = self.playback.clone();
        let handle = tokio::spawn(async move {
            while let Some(frame) = voice_rx.recv().await {
                playback.add_user_audio(
                    frame.session,
                    &frame.samples,
                    frame.sequence,
                    frame.is_plc,
                );
                if frame.end_of_transmission {
                    playback.notify_talking_ended(frame.session);
                }
            }
        });

        let mut forwarder = self.forwarder.lock().expect("forwarder lock poisoned");
        if let Some(previous) = forwarder.replace(handle) {
            previous.abort();
        }
    }

    /// Device capture callback entry point
    pub fn push_capture_frames(&self, samples: &[i16]) {
        self.capture
            .lock()
            .expect("capture lock poisoned")
            .push_frames(samples);
    }

    /// Device render callback entry point
    pub fn render(&self, output: &mut [i16]) -> usize {
        self.playback.render(output)
    }

    /// The playback side, for roster-driven eviction and stats
    pub fn playback(&self) -> &PlaybackEngine {
        &self.playback
    }

    pub fn set_push_to_talk(&self, active: bool) {
        self.capture
            .lock()
            .expect("capture lock poisoned")
            .set_push_to_talk(active);
    }

    pub fn set_vad_enabled(&self, enabled: bool) {
        self.capture
            .lock()
            .expect("capture lock poisoned")
            .set_vad_enabled(enabled);
    }

    pub fn set_vad_threshold(&self, threshold: f32) {
        self.capture
            .lock()
            .expect("capture lock poisoned")
            .set_vad_threshold(threshold);
    }

    /// Microphone level of the most recent frame, 0.0 - 1.0
    pub fn input_level(&self) -> f32 {
        self.capture
            .lock()
            .expect("capture lock poisoned")
            .input_level()
    }

    pub fn capture_stats(&self) -> CaptureStats {
        self.capture.lock().expect("capture lock poisoned").stats()
    }
}

impl Drop for VoiceEngine {
    fn drop(&mut self) {
        if let Some(handle) = self
            .forwarder
            .lock()
            .expect("forwarder lock poisoned")
            .take()
        {
            handle.abort();
        }
    }
}

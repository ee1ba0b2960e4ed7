//! Single-stream jitter buffer
//!
//! A sequence-keyed reorder window over decoded PCM packets, used for
//! callback-style decoding where one stream drives one output. The
//! multi-speaker playback path uses per-user float buffers instead; this
//! buffer remains for single-stream consumers and diagnostics.
//!
//! The delay target is fixed; there is no adaptive resizing.

use std::collections::BTreeMap;

use crate::config::JitterConfig;

/// Maximum packets held before the oldest are evicted
const MAX_PACKETS: usize = 100;

/// Jitter buffer statistics
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct JitterStats {
    pub current_delay_ms: u32,
    pub packets_received: u32,
    pub packets_lost: u32,
    pub packets_late: u32,
    pub packets_reordered: u32,
    /// Lost packets as a fraction of received
    pub loss_rate: f32,
}

struct Packet {
    data: Vec<i16>,
}

/// Fixed-delay reorder buffer for one voice stream
pub struct JitterBuffer {
    config: JitterConfig,
    packets: BTreeMap<u32, Packet>,

    next_play_sequence: u32,
    initialized: bool,

    packets_received: u32,
    packets_lost: u32,
    packets_late: u32,
    packets_reordered: u32,
}

impl JitterBuffer {
    pub fn new(config: JitterConfig) -> Self {
        Self {
            config,
            packets: BTreeMap::new(),
            next_play_sequence: 0,
            initialized: false,
            packets_received: 0,
            packets_lost: 0,
            packets_late: 0,
            packets_reordered: 0,
        }
    }

    /// Insert a decoded packet
    ///
    /// The first packet fixes the playout origin. Packets older than the
    /// playout position are dropped as late; arrivals below the current
    /// maximum count as reordered.
    pub fn put(&mut self, data: &[i16], sequence: u32) {
        self.packets_received += 1;

        if !self.initialized {
            self.next_play_sequence = sequence;
            self.initialized = true;
        }

        if sequence < self.next_play_sequence {
            self.packets_late += 1;
            return;
        }

        if let Some((&max_seq, _)) = self.packets.last_key_value() {
            if sequence < max_seq {
                self.packets_reordered += 1;
            }
        }

        self.packets.insert(
            sequence,
            Packet {
                data: data.to_vec(),
            },
        );

        while self.packets.len() > MAX_PACKETS {
            self.packets.pop_first();
        }
    }

    /// Pull the next frame into `output`, zero-padding the tail
    ///
    /// Returns the number of samples copied; 0 means silence was written
    /// (buffer still filling, or nothing available).
    pub fn get(&mut self, output: &mut [i16]) -> usize {
        if !self.initialized || self.packets.is_empty() {
            output.fill(0);
            return 0;
        }

        // Hold playback until the fixed minimum delay is buffered
        if self.packets.len() < self.config.min_packets() {
            output.fill(0);
            return 0;
        }

        if let Some(packet) = self.packets.remove(&self.next_play_sequence) {
            let copied = copy_packet(&packet, output);
            self.next_play_sequence = self.next_play_sequence.wrapping_add(1);
            return copied;
        }

        // Expected packet missing: it is lost, skip to the next available
        self.packets_lost += 1;

        if let Some((&seq, _)) = self.packets.first_key_value() {
            if self.next_play_sequence < seq {
                let skipped = seq - self.next_play_sequence;
                // One loss already counted above
                self.packets_lost += skipped - 1;
                self.next_play_sequence = seq;
            }

            let packet = self
                .packets
                .remove(&seq)
                .expect("first key exists");
            let copied = copy_packet(&packet, output);
            self.next_play_sequence = self.next_play_sequence.wrapping_add(1);
            return copied;
        }

        output.fill(0);
        0
    }

    /// Whether any packets are buffered
    pub fn has_data(&self) -> bool {
        !self.packets.is_empty()
    }

    /// Snapshot of buffer statistics
    pub fn stats(&self) -> JitterStats {
        JitterStats {
            current_delay_ms: self.config.target_delay_ms,
            packets_received: self.packets_received,
            packets_lost: self.packets_lost,
            packets_late: self.packets_late,
            packets_reordered: self.packets_reordered,
            loss_rate: if self.packets_received > 0 {
                self.packets_lost as f32 / self.packets_received as f32
            } else {
                0.0
            },
        }
    }

    /// Drop everything and forget the playout origin
    pub fn reset(&mut self) {
        self.packets.clear();
        self.next_play_sequence = 0;
        self.initialized = false;
        self.packets_received = 0;
        self.packets_lost = 0;
        self.packets_late = 0;
        self.packets_reordered = 0;
    }
}

fn copy_packet(packet: &Packet, output: &mut [i16]) -> usize {
    let copied = packet.data.len().min(output.len());
    output[..copied].copy_from_slice(&packet.data[..copied]);
    output[copied..].fill(0);
    copied
}

#[cfg(test)]
mod tests {
    use voxlink_common::voice::FRAME_SIZE;

    use super::*;

    /// Config that releases frames as soon as one packet is buffered
    fn immediate_config() -> JitterConfig {
        JitterConfig {
            target_delay_ms: 100,
            min_delay_ms: 10,
        }
    }

    fn frame_of(value: i16) -> Vec<i16> {
        vec![value; FRAME_SIZE]
    }

    #[test]
    fn test_empty_buffer_outputs_silence() {
        let mut buffer = JitterBuffer::new(immediate_config());
        let mut out = vec![1i16; FRAME_SIZE];
        assert_eq!(buffer.get(&mut out), 0);
        assert!(out.iter().all(|&s| s == 0));
        assert!(!buffer.has_data());
    }

    #[test]
    fn test_in_order_playback() {
        let mut buffer = JitterBuffer::new(immediate_config());
        for seq in 0..3 {
            buffer.put(&frame_of(seq as i16 + 1), seq);
        }

        let mut out = vec![0i16; FRAME_SIZE];
        for expected in 1..=3 {
            assert_eq!(buffer.get(&mut out), FRAME_SIZE);
            assert_eq!(out[0], expected);
        }
        assert_eq!(buffer.stats().packets_lost, 0);
    }

    #[test]
    fn test_loss_counted_and_skipped() {
        // Sequences {0, 1, 3}: draining three frames plays 0, 1, 3 in
        // order and counts exactly one loss.
        let mut buffer = JitterBuffer::new(immediate_config());
        buffer.put(&frame_of(10), 0);
        buffer.put(&frame_of(11), 1);
        buffer.put(&frame_of(13), 3);

        let mut out = vec![0i16; FRAME_SIZE];
        assert_eq!(buffer.get(&mut out), FRAME_SIZE);
        assert_eq!(out[0], 10);
        assert_eq!(buffer.get(&mut out), FRAME_SIZE);
        assert_eq!(out[0], 11);
        assert_eq!(buffer.get(&mut out), FRAME_SIZE);
        assert_eq!(out[0], 13);

        let stats = buffer.stats();
        assert_eq!(stats.packets_lost, 1);
        assert!((stats.loss_rate - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_reorder_recovered() {
        let mut buffer = JitterBuffer::new(immediate_config());
        buffer.put(&frame_of(1), 0);
        buffer.put(&frame_of(3), 2);
        buffer.put(&frame_of(2), 1);
        buffer.put(&frame_of(4), 3);

        let mut out = vec![0i16; FRAME_SIZE];
        for expected in 1..=4 {
            buffer.get(&mut out);
            assert_eq!(out[0], expected);
        }

        let stats = buffer.stats();
        assert_eq!(stats.packets_reordered, 1);
        assert_eq!(stats.packets_lost, 0);
    }

    #[test]
    fn test_late_packet_dropped() {
        let mut buffer = JitterBuffer::new(immediate_config());
        for seq in 0..3 {
            buffer.put(&frame_of(0), seq);
        }

        let mut out = vec![0i16; FRAME_SIZE];
        buffer.get(&mut out);
        buffer.get(&mut out);

        // Sequence 0 was already played
        buffer.put(&frame_of(0), 0);
        assert_eq!(buffer.stats().packets_late, 1);
    }

    #[test]
    fn test_min_delay_gates_playback() {
        // 40ms minimum means four 10ms packets before anything plays
        let config = JitterConfig {
            target_delay_ms: 100,
            min_delay_ms: 40,
        };
        let mut buffer = JitterBuffer::new(config);

        let mut out = vec![0i16; FRAME_SIZE];
        for seq in 0..3 {
            buffer.put(&frame_of(7), seq);
            assert_eq!(buffer.get(&mut out), 0, "played before min delay");
        }

        buffer.put(&frame_of(7), 3);
        assert_eq!(buffer.get(&mut out), FRAME_SIZE);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut buffer = JitterBuffer::new(immediate_config());
        for seq in 0..(MAX_PACKETS as u32 + 20) {
            buffer.put(&frame_of(0), seq);
        }

        let mut out = vec![0i16; FRAME_SIZE];
        buffer.get(&mut out);
        // The first 20 sequences were evicted; playback resumes at 20
        // after counting them lost.
        assert_eq!(buffer.stats().packets_lost, 20);
    }

    #[test]
    fn test_reset() {
        let mut buffer = JitterBuffer::new(immediate_config());
        buffer.put(&frame_of(1), 5);
        buffer.reset();

        assert!(!buffer.has_data());
        assert_eq!(buffer.stats().packets_received, 0);

        // A fresh first packet re-initializes the origin
        buffer.put(&frame_of(1), 100);
        let mut out = vec![0i16; FRAME_SIZE];
        assert_eq!(buffer.get(&mut out), FRAME_SIZE);
    }
}

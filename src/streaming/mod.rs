//! Real-time audio output
//!
//! Wires the player's live ring buffer to the system audio device through
//! rodio. Opt-in via the `streaming` feature; everything else in the crate
//! works without an audio backend.

pub mod audio_device;

pub use audio_device::AudioDevice;

use serde::{Deserialize, Serialize};

use crate::playback::SAMPLE_RATE;

/// Configuration for streaming playback
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Ring buffer size in samples; larger means more latency, fewer
    /// underruns
    pub ring_buffer_size: usize,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of audio channels
    pub channels: u16,
}

impl StreamConfig {
    /// Low-latency configuration (about 31 ms of stereo at the mix rate)
    pub fn low_latency(sample_rate: u32) -> Self {
        StreamConfig {
            ring_buffer_size: 4096,
            sample_rate,
            channels: 2,
        }
    }

    /// Stability-first configuration (about 125 ms of stereo)
    pub fn stable(sample_rate: u32) -> Self {
        StreamConfig {
            ring_buffer_size: 16384,
            sample_rate,
            channels: 2,
        }
    }

    /// Buffer latency in milliseconds
    pub fn latency_ms(&self) -> f32 {
        (self.ring_buffer_size as f32 / self.channels.max(1) as f32)
            / (self.sample_rate as f32)
            * 1000.0
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self::stable(SAMPLE_RATE)
    }
}

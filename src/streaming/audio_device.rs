//! Audio device integration using rodio
//!
//! Plays the mixer's live ring buffer on the system audio device. The
//! rodio source pulls batches out of the shared buffer and feeds silence on
//! underrun so the stream stays alive while the player is paused.

use rodio::{OutputStream, Sink, Source};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::playback::RingBuffer;
use crate::{Result, SseqError};

/// Audio source that reads from the shared ring buffer
struct RingBufferSource {
    ring_buffer: Arc<RingBuffer>,
    sample_rate: u32,
    channels: u16,
    finished: Arc<AtomicBool>,
    /// Batch buffer to keep lock traffic off the per-sample path
    buffer: Vec<f32>,
    buffer_pos: usize,
    buffer_len: usize,
}

impl RingBufferSource {
    fn new(
        ring_buffer: Arc<RingBuffer>,
        sample_rate: u32,
        channels: u16,
        finished: Arc<AtomicBool>,
    ) -> Self {
        RingBufferSource {
            ring_buffer,
            sample_rate,
            channels,
            finished,
            buffer: vec![0.0; 4096],
            buffer_pos: 4096,
            buffer_len: 4096,
        }
    }
}

impl Source for RingBufferSource {
    fn current_frame_len(&self) -> Option<usize> {
        let available = self.ring_buffer.available_read();
        if available > 0 {
            Some(available)
        } else {
            Some(4096)
        }
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn total_duration(&self) -> Option<Duration> {
        None
    }
}

impl Iterator for RingBufferSource {
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        if self.finished.load(Ordering::Relaxed) {
            return None;
        }

        if self.buffer_pos >= self.buffer_len {
            let read = self.ring_buffer.read(&mut self.buffer);
            if read > 0 {
                self.buffer_pos = 0;
                self.buffer_len = read;
            } else {
                // Underrun: keep the stream alive with silence.
                self.buffer.fill(0.0);
                self.buffer_pos = 0;
                self.buffer_len = self.buffer.len();
            }
        }

        let sample = self.buffer[self.buffer_pos];
        self.buffer_pos += 1;
        Some(sample)
    }
}

/// Audio playback device using rodio
pub struct AudioDevice {
    _stream: OutputStream,
    sink: Sink,
    finished: Arc<AtomicBool>,
}

impl AudioDevice {
    /// Open the default output device and start draining `ring_buffer`
    ///
    /// `sample_rate`/`channels` describe the frames the mixer produces
    /// (65456 Hz stereo by default).
    pub fn new(sample_rate: u32, channels: u16, ring_buffer: Arc<RingBuffer>) -> Result<Self> {
        let (stream, stream_handle) = OutputStream::try_default()
            .map_err(|e| SseqError::AudioDevice(format!("failed to create audio stream: {}", e)))?;
        let sink = Sink::try_new(&stream_handle)
            .map_err(|e| SseqError::AudioDevice(format!("failed to create audio sink: {}", e)))?;

        let finished = Arc::new(AtomicBool::new(false));
        let source = RingBufferSource::new(ring_buffer, sample_rate, channels, Arc::clone(&finished));
        sink.append(source);

        Ok(AudioDevice {
            _stream: stream,
            sink,
            finished,
        })
    }

    /// Pause output
    pub fn pause(&self) {
        self.sink.pause();
    }

    /// Resume output
    pub fn play(&self) {
        self.sink.play();
    }

    /// Signal that no more samples will be produced, letting the stream end
    /// instead of playing silence forever
    pub fn finish(&self) {
        self.finished.store(true, Ordering::Relaxed);
    }
}

impl Drop for AudioDevice {
    fn drop(&mut self) {
        self.pause();
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_reports_format() {
        let rb = Arc::new(RingBuffer::new(4096).unwrap());
        let source = RingBufferSource::new(rb, 65456, 2, Arc::new(AtomicBool::new(false)));
        assert_eq!(source.sample_rate(), 65456);
        assert_eq!(source.channels(), 2);
        assert!(source.current_frame_len().is_some());
    }

    #[test]
    fn test_source_silence_on_underrun() {
        let rb = Arc::new(RingBuffer::new(4096).unwrap());
        let mut source = RingBufferSource::new(rb, 65456, 2, Arc::new(AtomicBool::new(false)));
        assert_eq!(source.next(), Some(0.0), "underrun yields silence, not None");
    }

    #[test]
    fn test_source_stops_after_finish() {
        let rb = Arc::new(RingBuffer::new(4096).unwrap());
        let finished = Arc::new(AtomicBool::new(false));
        let mut source = RingBufferSource::new(rb, 65456, 2, Arc::clone(&finished));
        assert!(source.next().is_some());
        finished.store(true, Ordering::Relaxed);
        assert_eq!(source.next(), None);
    }

    #[test]
    fn test_device_creation_if_backend_available() {
        let rb = Arc::new(RingBuffer::new(4096).unwrap());
        match AudioDevice::new(65456, 2, rb) {
            Ok(device) => {
                device.pause();
                device.play();
                device.finish();
            }
            Err(e) => eprintln!("skipping audio device test (backend unavailable): {}", e),
        }
    }
}

//! Audio sinks and the live-output ring buffer
//!
//! The mixer emits interleaved 16-bit stereo frames and fans them out to
//! any attached [`AudioSink`]. The built-in live sink converts to f32 and
//! writes into a shared [`RingBuffer`] that an output device (see the
//! `streaming` feature) drains concurrently.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::{Result, SseqError};

/// Consumer of interleaved 16-bit stereo frames at the mix rate
pub trait AudioSink: Send {
    /// Push interleaved left/right samples
    ///
    /// Sinks absorb their own write failures; the mix loop never stalls on
    /// a sink. Persistent failures surface when the sink is finalized.
    fn push_frames(&mut self, interleaved: &[i16]);
}

/// Ring buffer for streaming audio samples
///
/// One producer (the mix loop) and one consumer (the output device) operate
/// concurrently; positions are tracked with atomics for visibility and the
/// storage is guarded by a `parking_lot` mutex.
#[derive(Debug)]
pub struct RingBuffer {
    buffer: Mutex<Vec<f32>>,
    write_pos: AtomicUsize,
    read_pos: AtomicUsize,
    capacity: usize,
    mask: usize,
}

impl RingBuffer {
    /// Create a ring buffer; capacity is rounded up to a power of two
    pub fn new(requested_capacity: usize) -> Result<Self> {
        if requested_capacity == 0 {
            return Err(SseqError::Config(
                "ring buffer capacity must be greater than 0".into(),
            ));
        }
        let capacity = requested_capacity.next_power_of_two();

        // 512 MB worth of f32 samples is already absurd; refuse beyond it.
        const MAX_CAPACITY: usize = 512 * 1024 * 1024 / std::mem::size_of::<f32>();
        if capacity > MAX_CAPACITY {
            return Err(SseqError::Config(format!(
                "ring buffer capacity {capacity} exceeds maximum safe size {MAX_CAPACITY}"
            )));
        }

        Ok(RingBuffer {
            buffer: Mutex::new(vec![0.0; capacity]),
            write_pos: AtomicUsize::new(0),
            read_pos: AtomicUsize::new(0),
            mask: capacity - 1,
            capacity,
        })
    }

    /// Number of samples available to read without blocking
    pub fn available_read(&self) -> usize {
        let write = self.write_pos.load(Ordering::Acquire);
        let read = self.read_pos.load(Ordering::Acquire);
        if write >= read {
            write - read
        } else {
            self.capacity - (read - write)
        }
    }

    /// Write samples; returns how many fit (0 when full)
    pub fn write(&self, samples: &[f32]) -> usize {
        let mut buf = self.buffer.lock();

        let write_pos = self.write_pos.load(Ordering::Acquire);
        let read_pos = self.read_pos.load(Ordering::Acquire);
        let available = if write_pos >= read_pos {
            self.capacity - (write_pos - read_pos) - 1
        } else {
            (read_pos - write_pos) - 1
        };

        let to_write = samples.len().min(available);
        if to_write == 0 {
            return 0;
        }

        let write_idx = write_pos & self.mask;
        if write_idx + to_write <= self.capacity {
            buf[write_idx..write_idx + to_write].copy_from_slice(&samples[..to_write]);
        } else {
            let first_part = self.capacity - write_idx;
            buf[write_idx..].copy_from_slice(&samples[..first_part]);
            buf[..to_write - first_part].copy_from_slice(&samples[first_part..to_write]);
        }
        drop(buf);

        self.write_pos.store(write_pos + to_write, Ordering::Release);
        to_write
    }

    /// Read samples; returns how many were available
    pub fn read(&self, dest: &mut [f32]) -> usize {
        let buf = self.buffer.lock();

        let write_pos = self.write_pos.load(Ordering::Acquire);
        let read_pos = self.read_pos.load(Ordering::Acquire);
        let available = if write_pos >= read_pos {
            write_pos - read_pos
        } else {
            self.capacity - (read_pos - write_pos)
        };

        let to_read = dest.len().min(available);
        if to_read == 0 {
            return 0;
        }

        let read_idx = read_pos & self.mask;
        if read_idx + to_read <= self.capacity {
            dest[..to_read].copy_from_slice(&buf[read_idx..read_idx + to_read]);
        } else {
            let first_part = self.capacity - read_idx;
            dest[..first_part].copy_from_slice(&buf[read_idx..]);
            dest[first_part..to_read].copy_from_slice(&buf[..to_read - first_part]);
        }
        drop(buf);

        self.read_pos.store(read_pos + to_read, Ordering::Release);
        to_read
    }

    /// Drain and discard all buffered samples
    pub fn flush(&self) {
        let write_pos = self.write_pos.load(Ordering::Acquire);
        self.read_pos.store(write_pos, Ordering::Release);
    }

    /// Fill level, 0.0 to 1.0
    pub fn fill_percentage(&self) -> f32 {
        (self.available_read() as f32) / (self.capacity as f32)
    }
}

/// Live sink feeding a shared ring buffer
///
/// Frames that do not fit are dropped (the device under-ran or nobody is
/// draining); real-time playback prefers a glitch over a stall.
pub struct RingBufferSink {
    buffer: Arc<RingBuffer>,
    scratch: Vec<f32>,
    dropped: usize,
}

impl RingBufferSink {
    /// Create a sink over a shared ring buffer
    pub fn new(buffer: Arc<RingBuffer>) -> Self {
        RingBufferSink {
            buffer,
            scratch: Vec::new(),
            dropped: 0,
        }
    }

    /// The shared buffer, for handing to an output device
    pub fn buffer(&self) -> Arc<RingBuffer> {
        Arc::clone(&self.buffer)
    }

    /// Samples dropped because the buffer was full
    pub fn dropped_samples(&self) -> usize {
        self.dropped
    }
}

impl AudioSink for RingBufferSink {
    fn push_frames(&mut self, interleaved: &[i16]) {
        self.scratch.clear();
        self.scratch
            .extend(interleaved.iter().map(|&s| s as f32 / 32768.0));
        let written = self.buffer.write(&self.scratch);
        self.dropped += self.scratch.len() - written;
    }
}

//! WAV capture sink
//!
//! Writes the mixer's interleaved 16-bit stereo frames straight to a WAV
//! file. Write errors are absorbed during the mix (the real-time loop must
//! not stall on disk) and surfaced when the capture is finalized.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use crate::playback::AudioSink;
use crate::{Result, SseqError};

/// File-capture sink with the live sink's frame contract
pub struct WavCapture {
    writer: Option<hound::WavWriter<BufWriter<File>>>,
    error: Option<String>,
    frames_written: u64,
}

impl WavCapture {
    /// Create a capture writing 16-bit stereo at `sample_rate`
    pub fn create<P: AsRef<Path>>(path: P, sample_rate: u32) -> Result<Self> {
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let writer = hound::WavWriter::create(path, spec)
            .map_err(|e| SseqError::AudioDevice(format!("failed to create WAV file: {}", e)))?;
        Ok(WavCapture {
            writer: Some(writer),
            error: None,
            frames_written: 0,
        })
    }

    /// Stereo frames written so far
    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Flush and close the file, reporting any write error that occurred
    /// during capture
    pub fn finalize(mut self) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            writer
                .finalize()
                .map_err(|e| SseqError::AudioDevice(format!("failed to finalize WAV file: {}", e)))?;
        }
        match self.error.take() {
            Some(msg) => Err(SseqError::AudioDevice(msg)),
            None => Ok(()),
        }
    }
}

impl AudioSink for WavCapture {
    fn push_frames(&mut self, interleaved: &[i16]) {
        if self.error.is_some() {
            return;
        }
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        for &sample in interleaved {
            if let Err(e) = writer.write_sample(sample) {
                self.error = Some(format!("failed to write sample: {}", e));
                return;
            }
        }
        self.frames_written += interleaved.len() as u64 / 2;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_writes_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.wav");
        let mut capture = WavCapture::create(&path, 65456).unwrap();
        capture.push_frames(&[0, 0, 100, -100, i16::MAX, i16::MIN]);
        assert_eq!(capture.frames_written(), 3);
        capture.finalize().unwrap();

        let mut reader = hound::WavReader::open(&path).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.channels, 2);
        assert_eq!(spec.sample_rate, 65456);
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![0, 0, 100, -100, i16::MAX, i16::MIN]);
    }
}

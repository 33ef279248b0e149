//! Audio export
//!
//! File-capture sinks sharing the mixer's interleaved 16-bit stereo frame
//! contract. A capture can run alongside the live output sink.

pub mod wav;

pub use wav::WavCapture;

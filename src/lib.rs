//! Sequence decoder and player for Nitro/Revolution console sound drivers
//!
//! Decodes, interprets and renders the compact event-based music sequence
//! format shared by two console sound-driver generations: the little-endian
//! Nitro dialect and the big-endian Revolution dialect with its extended
//! opcode page. The crate covers the full path from wire bytes to stereo
//! audio:
//!
//! - A binary codec over a ~100-kind tagged command set with nested
//!   parameter modifiers (random ranges, variable substitution, conditional
//!   gating, time offsets)
//! - A 16-track bytecode interpreter with call/loop stacks, a shared
//!   variable pool and a tempo-accumulator scheduler
//! - A 16-voice software synthesizer (sampled PCM, pulse, LFSR noise) with
//!   table-driven ADSR envelopes, pitch sweeps and LFO modulation, mixed to
//!   interleaved 16-bit stereo
//!
//! # Crate feature flags
//! - `streaming` (opt-in): real-time audio output (enables optional `rodio`
//!   dep)
//!
//! # Quick start
//! ## Decode a sequence stream
//! ```no_run
//! use sseq::sequence::{Nitro, Program};
//! let data = std::fs::read("song.sseq").unwrap();
//! let program = Program::decode(&data, &Nitro).unwrap();
//! println!("{} commands", program.commands.len());
//! ```
//!
//! ## Play it back
//! ```no_run
//! # use std::sync::Arc;
//! use sseq::playback::{Player, PlayerConfig};
//! use sseq::sequence::{Nitro, Program};
//! # fn banks() -> Vec<Arc<dyn sseq::playback::PlayableBank>> { Vec::new() }
//! # fn waves() -> Vec<Vec<Arc<sseq::playback::WaveAsset>>> { Vec::new() }
//! let data = std::fs::read("song.sseq").unwrap();
//! let program = Program::decode(&data, &Nitro).unwrap();
//! let mut player = Player::new(PlayerConfig::default());
//! player.prepare(banks(), waves());
//! player.load(program, 0).unwrap();
//! player.play().unwrap();
//! ```

#![warn(missing_docs)]

pub mod export; // WAV capture sink
pub mod playback; // Playback engine (interpreter + synthesizer)
pub mod sequence; // Command model and binary codec
#[cfg(feature = "streaming")]
pub mod streaming; // Audio output & streaming

/// Error types for sequence decoding and playback operations
#[derive(thiserror::Error, Debug)]
pub enum SseqError {
    /// A lead byte did not map to any command in the dialect's opcode table
    #[error("unknown opcode 0x{opcode:02X} at offset 0x{offset:X}")]
    UnknownOpcode {
        /// The offending wire byte
        opcode: u8,
        /// Byte offset of the opcode in the stream
        offset: usize,
    },

    /// An extended-page byte did not map to any command
    #[error("unknown extended opcode 0x{opcode:02X} at offset 0x{offset:X}")]
    UnknownExtendedOpcode {
        /// The offending wire byte
        opcode: u8,
        /// Byte offset of the opcode in the stream
        offset: usize,
    },

    /// The stream ended in the middle of an instruction
    #[error("truncated sequence data at offset 0x{offset:X}")]
    Truncated {
        /// Byte offset at which more data was required
        offset: usize,
    },

    /// A jump/call/open-track offset does not land on a command boundary
    #[error("reference to offset 0x{offset:X} does not resolve to a command")]
    UnresolvedReference {
        /// The unresolvable byte offset
        offset: u32,
    },

    /// A jump/call/open-track index points outside the program
    #[error("reference to command {index} is outside the program ({len} commands)")]
    ReferenceOutOfBounds {
        /// The out-of-range command index
        index: usize,
        /// Number of commands in the program
        len: usize,
    },

    /// IO error from filesystem or device
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Audio device or sink error
    #[error("audio device error: {0}")]
    AudioDevice(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<String> for SseqError {
    fn from(msg: String) -> Self {
        SseqError::Other(msg)
    }
}

impl From<&str> for SseqError {
    fn from(msg: &str) -> Self {
        SseqError::Other(msg.to_string())
    }
}

/// Result type for sequence operations
pub type Result<T> = std::result::Result<T, SseqError>;

// Public API exports
pub use playback::{Player, PlayerConfig, PlayerState};
pub use sequence::{CommandKind, Nitro, Program, Revolution, SequenceCommand, SequencePlatform};
#[cfg(feature = "streaming")]
pub use streaming::{AudioDevice, StreamConfig};

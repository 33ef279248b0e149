//! Command model and binary codec
//!
//! The sequence wire format is a stream of variable-length instructions.
//! A lead byte below 0x80 is a note-on event carrying the pitch itself;
//! anything else selects a command through the dialect's opcode table
//! (optionally indirecting through an extended-opcode page). Commands can be
//! wrapped by parameter modifiers - random ranges, variable substitution,
//! conditional gating and time offsets - which nest around an inner command.
//!
//! Two dialects are supplied: [`Nitro`] (little-endian) and [`Revolution`]
//! (big-endian with an extended page). Others can be added by implementing
//! [`SequencePlatform`] without touching the codec.

pub mod command;
pub mod platform;
pub mod program;
pub mod varlen;
pub mod wire;

pub use command::{CommandKind, ParamShape, ParameterMode, SequenceCommand, SequenceRef};
pub use platform::{Nitro, Revolution, SequencePlatform};
pub use program::Program;
pub use varlen::{read_varlen, varlen_size, write_varlen};
pub use wire::{ByteOrder, WireReader, WireWriter};

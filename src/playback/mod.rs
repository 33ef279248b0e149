//! Playback engine
//!
//! The bytecode interpreter and software synthesizer: sixteen tracks of
//! interpreter state advance under a shared tempo clock, allocating voices
//! out of a sixteen-voice pool that is mixed into interleaved 16-bit stereo
//! at a fixed rate. A dedicated worker thread paces the fetch/tick/mix loop
//! in real time; the caller drives it through lifecycle calls on
//! [`Player`].

pub mod bank;
pub mod channel;
pub mod mixer;
pub mod output;
pub mod player;
pub mod scan;
pub mod tables;
pub mod timing;
pub mod track;

pub use bank::{InstrumentKind, NotePlaybackInfo, PlayableBank, WaveAsset, WaveData};
pub use channel::{Channel, EnvelopeState};
pub use mixer::Mixer;
pub use output::{AudioSink, RingBuffer, RingBufferSink};
pub use player::{NoteEvent, Player, PlayerConfig, PlayerState};
pub use scan::TickScan;
pub use track::{LfoKind, Track};

/// Number of interpreter tracks
pub const NUM_TRACKS: usize = 16;

/// Number of synthesis voices
pub const NUM_VOICES: usize = 16;

/// Scheduler rate in microframes per second
pub const TICK_RATE: u32 = 192;

/// Tempo accumulator threshold: one musical tick per `240` accumulated BPM
pub const TEMPO_THRESHOLD: i32 = 240;

/// Mix output sample rate in Hz
pub const SAMPLE_RATE: u32 = 65456;

/// Stereo frames mixed per microframe
pub const SAMPLES_PER_BUFFER: usize = 341;

/// Sample-timer reference clock in Hz
pub const CLOCK_SPEED: u32 = 16_756_991;

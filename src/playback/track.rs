//! Per-track interpreter state
//!
//! A track owns a playback cursor, a snapshot of musical controller state
//! read by the synthesizer every tick, a 3-level call/loop stack and 16
//! private variables extending the player's 32 globals. Sixteen tracks
//! exist for the player's lifetime; track 0 is the conductor and the only
//! one allowed to allocate and open the others.

use super::tables::{sine, SUSTAIN_TABLE};

/// Target parameter of the track LFO
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LfoKind {
    /// Vibrato
    Pitch,
    /// Tremolo
    Volume,
    /// Auto-pan
    Pan,
    /// Out-of-range selector: LFO modulates nothing
    None,
}

impl LfoKind {
    /// Map a `ModType` argument to a target
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => LfoKind::Pitch,
            1 => LfoKind::Volume,
            2 => LfoKind::Pan,
            _ => LfoKind::None,
        }
    }
}

/// Call/loop stack depth limit (hardware behavior, not a validation bound)
pub const CALL_STACK_DEPTH: usize = 3;

/// Number of private variable slots per track
pub const TRACK_VARS: usize = 16;

/// One of the sixteen playback tracks
#[derive(Debug, Clone)]
pub struct Track {
    /// Track index (0 = conductor)
    pub index: u8,

    /// Eligible for `OpenTrack` (set by `AllocateTrack` from track 0)
    pub allocated: bool,
    /// Executing commands this song
    pub enabled: bool,
    /// Hit `Fin`
    pub stopped: bool,
    /// Tie mode: notes retarget the newest ringing voice
    pub tie: bool,
    /// Note-wait mode: a note blocks the track for its duration
    pub note_wait: bool,
    /// Portamento switch
    pub portamento: bool,
    /// Parked until the ringing note releases (zero-duration note-wait note)
    pub awaiting_note_end: bool,
    /// A note is currently held (for note-off observers)
    pub note_down: bool,

    /// Selected instrument program
    pub program: i32,
    /// Bank number
    pub bank: usize,
    /// Voice-stealing priority
    pub priority: u8,
    /// Track volume (0-127)
    pub volume: u8,
    /// Expression volume (0-127)
    pub expression: u8,
    /// Pitch-bend range in semitones
    pub pitch_bend_range: u8,
    /// Pitch bend (-128..=127 over the range)
    pub pitch_bend: i8,
    /// Pan (-64..=63)
    pub panpot: i8,
    /// Key transpose in semitones
    pub transpose: i8,

    /// LFO depth
    pub lfo_depth: u8,
    /// LFO speed
    pub lfo_speed: u8,
    /// LFO range multiplier
    pub lfo_range: u8,
    /// Ticks before the LFO starts
    pub lfo_delay: u16,
    /// LFO phase accumulator
    pub lfo_phase: u16,
    /// Ticks waited so far before the LFO starts
    pub lfo_delay_count: u16,
    /// LFO target parameter
    pub lfo_kind: LfoKind,

    /// ADSR overrides; 0xFF means "use the bank's value"
    pub attack: u8,
    /// Decay override
    pub decay: u8,
    /// Sustain override
    pub sustain: u8,
    /// Hold override
    pub hold: u8,
    /// Release override
    pub release: u8,

    /// Portamento source key
    pub portamento_key: u8,
    /// Portamento time (0 = full note duration)
    pub portamento_time: u8,
    /// Pitch sweep in 1/64 semitones
    pub sweep_pitch: i16,

    /// Remaining rest ticks
    pub rest: i32,
    /// Return addresses / loop-start cursors
    pub call_stack: [usize; CALL_STACK_DEPTH],
    /// Remaining loop counts (paired with `call_stack`)
    pub call_loops: [u8; CALL_STACK_DEPTH],
    /// Occupied stack depth
    pub call_depth: u8,
    /// Instruction cursor (program index)
    pub cur_event: usize,
    /// Result of the last comparison op, consumed by `If`
    pub variable_flag: bool,

    /// Private variable slots (player slots 32..=47)
    pub vars: [i16; TRACK_VARS],
    /// Indices of voices owned by this track, oldest first
    pub channels: Vec<u8>,
}

impl Track {
    /// Create a track; state is meaningful only after [`Self::init`]
    pub fn new(index: u8) -> Self {
        let mut t = Track {
            index,
            allocated: false,
            enabled: false,
            stopped: false,
            tie: false,
            note_wait: true,
            portamento: false,
            awaiting_note_end: false,
            note_down: false,
            program: 0,
            bank: 0,
            priority: 0x40,
            volume: 0x7F,
            expression: 0x7F,
            pitch_bend_range: 2,
            pitch_bend: 0,
            panpot: 0,
            transpose: 0,
            lfo_depth: 0,
            lfo_speed: 0x10,
            lfo_range: 1,
            lfo_delay: 0,
            lfo_phase: 0,
            lfo_delay_count: 0,
            lfo_kind: LfoKind::Pitch,
            attack: 0xFF,
            decay: 0xFF,
            sustain: 0xFF,
            hold: 0xFF,
            release: 0xFF,
            portamento_key: 60,
            portamento_time: 0,
            sweep_pitch: 0,
            rest: 0,
            call_stack: [0; CALL_STACK_DEPTH],
            call_loops: [0; CALL_STACK_DEPTH],
            call_depth: 0,
            cur_event: 0,
            variable_flag: true,
            vars: [-1; TRACK_VARS],
            channels: Vec::with_capacity(16),
        };
        t.init();
        t
    }

    /// Reset to the documented power-on defaults for a new song
    pub fn init(&mut self) {
        self.stopped = false;
        self.tie = false;
        self.awaiting_note_end = false;
        self.portamento = false;
        self.note_down = false;
        self.allocated = self.index == 0;
        self.enabled = self.index == 0;
        self.cur_event = 0;
        self.note_wait = true;
        self.variable_flag = true;
        self.call_depth = 0;
        self.program = 0;
        self.bank = 0;
        self.lfo_depth = 0;
        self.pitch_bend = 0;
        self.panpot = 0;
        self.transpose = 0;
        self.lfo_phase = 0;
        self.lfo_delay = 0;
        self.lfo_delay_count = 0;
        self.lfo_range = 1;
        self.lfo_speed = 0x10;
        self.priority = 0x40;
        self.volume = 0x7F;
        self.expression = 0x7F;
        self.attack = 0xFF;
        self.decay = 0xFF;
        self.sustain = 0xFF;
        self.hold = 0xFF;
        self.release = 0xFF;
        self.pitch_bend_range = 2;
        self.portamento_key = 60;
        self.portamento_time = 0;
        self.sweep_pitch = 0;
        self.lfo_kind = LfoKind::Pitch;
        self.rest = 0;
        self.vars = [-1; TRACK_VARS];
        self.channels.clear();
    }

    /// Per-musical-tick bookkeeping: rest countdown and LFO phase
    ///
    /// `has_channels` reflects whether any voice still belongs to the track;
    /// with none ringing the LFO rewinds and a parked track unparks.
    pub fn tick(&mut self, has_channels: bool) {
        if self.rest > 0 {
            self.rest -= 1;
        }
        if has_channels {
            if self.lfo_delay_count > self.lfo_delay {
                let speed = (self.lfo_speed as u32) << 6;
                let mut counter = ((self.lfo_phase as u32) + speed) >> 8;
                while counter >= 0x80 {
                    counter -= 0x80;
                }
                self.lfo_phase = self.lfo_phase.wrapping_add(speed as u16);
                self.lfo_phase &= 0xFF;
                self.lfo_phase |= (counter as u16) << 8;
            } else {
                self.lfo_delay_count += 1;
            }
        } else {
            self.awaiting_note_end = false;
            self.lfo_phase = 0;
            self.lfo_delay_count = self.lfo_delay;
        }
    }

    /// Effective pitch offset in 1/64 semitones (bend + vibrato)
    pub fn pitch(&self) -> i32 {
        let lfo = if self.lfo_kind == LfoKind::Pitch {
            self.lfo_value()
        } else {
            0
        };
        let lfo = (((lfo as i64) * 60) >> 14) as i32;
        (self.pitch_bend as i32) * (self.pitch_bend_range as i32) / 2 + lfo
    }

    /// Effective volume level (master + track + expression + tremolo)
    pub fn volume_level(&self, master_volume: u8) -> i32 {
        let lfo = if self.lfo_kind == LfoKind::Volume {
            fold_lfo(self.lfo_value())
        } else {
            0
        };
        SUSTAIN_TABLE[master_volume.min(127) as usize]
            + SUSTAIN_TABLE[self.volume.min(127) as usize]
            + SUSTAIN_TABLE[self.expression.min(127) as usize]
            + lfo
    }

    /// Effective pan (-64..=63, auto-pan included)
    pub fn pan(&self) -> i8 {
        let lfo = if self.lfo_kind == LfoKind::Pan {
            fold_lfo(self.lfo_value())
        } else {
            0
        };
        ((self.panpot as i32) + lfo).clamp(-0x40, 0x3F) as i8
    }

    /// Raw LFO product: range * sin(phase) * depth
    fn lfo_value(&self) -> i32 {
        (self.lfo_range as i32) * sine((self.lfo_phase >> 8) as u8) * (self.lfo_depth as i32)
    }
}

/// Fold a raw LFO product into the -0x40..0x40-ish modulation range
///
/// Bit-exact port of the driver's fixed-point fold: low 26 bits shifted down
/// with the sign re-seated at bit 6 and the top bits re-packed high.
fn fold_lfo(lfo: i32) -> i32 {
    let base = (lfo & 0x03FF_FFFF) >> 8;
    let sign = if lfo < 0 { -1i32 << 6 } else { 0 };
    let high = ((((lfo as u32) >> 26) << 18) & 0x7FFF_FFFF) as i32;
    base | sign | high
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_defaults() {
        let t = Track::new(0);
        assert!(t.enabled && t.allocated, "conductor starts enabled");
        assert!(t.note_wait, "note-wait defaults on");
        assert!(t.variable_flag, "comparison flag defaults true");
        assert_eq!(t.priority, 0x40);
        assert_eq!(t.volume, 0x7F);
        assert_eq!(t.attack, 0xFF);
        assert_eq!(t.pitch_bend_range, 2);
        assert_eq!(t.vars, [-1; TRACK_VARS]);

        let t = Track::new(5);
        assert!(!t.enabled && !t.allocated, "non-conductor starts idle");
    }

    #[test]
    fn test_rest_counts_down() {
        let mut t = Track::new(1);
        t.rest = 2;
        t.tick(false);
        assert_eq!(t.rest, 1);
        t.tick(false);
        assert_eq!(t.rest, 0);
        t.tick(false);
        assert_eq!(t.rest, 0);
    }

    #[test]
    fn test_lfo_waits_out_its_delay() {
        let mut t = Track::new(1);
        t.lfo_delay = 2;
        t.lfo_delay_count = 0;
        t.lfo_speed = 0x10;
        for _ in 0..3 {
            t.tick(true);
            assert_eq!(t.lfo_phase, 0, "phase must hold during the delay");
        }
        t.tick(true);
        assert_ne!(t.lfo_phase, 0, "phase advances once the delay elapses");
    }

    #[test]
    fn test_lfo_rewinds_without_channels() {
        let mut t = Track::new(1);
        t.lfo_delay_count = 1;
        t.tick(true);
        t.tick(true);
        assert_ne!(t.lfo_phase, 0);
        t.awaiting_note_end = true;
        t.tick(false);
        assert_eq!(t.lfo_phase, 0);
        assert!(!t.awaiting_note_end, "parked track unparks when silent");
    }

    #[test]
    fn test_pitch_bend_scaling() {
        let mut t = Track::new(1);
        t.pitch_bend = 127;
        t.pitch_bend_range = 2;
        assert_eq!(t.pitch(), 127);
        t.pitch_bend = -128;
        assert_eq!(t.pitch(), -128);
        t.pitch_bend_range = 12;
        assert_eq!(t.pitch(), -768);
    }

    #[test]
    fn test_volume_level_at_full() {
        let t = Track::new(1);
        assert_eq!(t.volume_level(127), 0, "all-full volumes add nothing");
    }

    #[test]
    fn test_pan_clamps() {
        let mut t = Track::new(1);
        t.panpot = 63;
        assert_eq!(t.pan(), 63);
        t.panpot = -64;
        assert_eq!(t.pan(), -64);
    }
}

//! Synthesis voices
//!
//! A [`Channel`] is one of sixteen hardware-like voices: an ADSR envelope
//! state machine driving one of three sample generators (PCM, PSG pulse,
//! LFSR noise). Amplitude lives in the fixed-point level scale where 0 is
//! full output and [`AMPLITUDE_FLOOR`] is silence; a voice starts at the
//! floor and the attack stage multiplies it toward zero.

use std::sync::Arc;

use super::bank::{InstrumentKind, WaveAsset};
use super::tables::{AMPLITUDE_FLOOR, ATTACK_TABLE, DECAY_TABLE, SUSTAIN_TABLE};

/// Base timer for the PSG and noise generators
const PSG_BASE_TIMER: u16 = 8006;

/// LFSR seed for the noise generator
const NOISE_SEED: u16 = 0x7FFF;

/// Envelope stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeState {
    /// Level multiplies toward full scale
    Attack,
    /// Level parks before decaying (reserved; see `step_envelope`)
    Hold,
    /// Level falls toward the sustain floor
    Decay,
    /// Level rests at the sustain floor
    Sustain,
    /// Level falls toward silence; the voice frees itself at the floor
    Release,
}

/// One synthesis voice
#[derive(Debug, Clone)]
pub struct Channel {
    /// Voice index in the pool
    pub index: u8,
    /// Owning track, if the voice is live
    pub owner: Option<u8>,
    /// Active generator algorithm
    pub kind: InstrumentKind,
    /// Envelope stage
    pub state: EnvelopeState,

    /// Sweep counter advances on its own each tick (portamento time set)
    pub auto_sweep: bool,
    /// Key the sample is pitched at
    pub base_key: u8,
    /// Sounding key
    pub key: u8,
    /// Note-on velocity
    pub note_velocity: u8,
    /// Pan offset from the instrument definition
    pub starting_pan: i8,
    /// Effective pan, refreshed every tick
    pub pan: i8,
    /// Sweep progress in ticks
    pub sweep_counter: i32,
    /// Sweep duration in ticks
    pub sweep_length: i32,
    /// Total sweep amount in 1/64 semitones
    pub sweep_pitch: i16,
    /// Envelope level: 0 is full scale, [`AMPLITUDE_FLOOR`] is silence
    pub envelope: i32,
    /// Linear amplitude (0-127), refreshed every tick
    pub volume: u8,
    /// Timer at the unmodified pitch
    pub base_timer: u16,
    /// Effective timer, refreshed every tick
    pub timer: u16,
    /// Remaining note ticks; negative means "ring until stopped"
    pub note_duration: i32,

    attack: u8,
    decay_rate: u16,
    sustain_level: i32,
    #[allow(dead_code)] // latched but unused until Hold is wired up
    hold_level: i32,
    release_rate: u16,

    // Phase accumulator and the last computed frame; kept because a mix
    // frame can span zero source samples.
    pos: i32,
    prev_left: i16,
    prev_right: i16,

    wave: Option<Arc<WaveAsset>>,
    wave_sample: usize,

    psg_duty: u8,
    psg_counter: i32,

    noise_counter: u16,
}

impl Channel {
    /// Create an idle voice
    pub fn new(index: u8) -> Self {
        Channel {
            index,
            owner: None,
            kind: InstrumentKind::Pcm,
            state: EnvelopeState::Release,
            auto_sweep: false,
            base_key: 60,
            key: 60,
            note_velocity: 0,
            starting_pan: 0,
            pan: 0,
            sweep_counter: 0,
            sweep_length: 0,
            sweep_pitch: 0,
            envelope: AMPLITUDE_FLOOR,
            volume: 0,
            base_timer: PSG_BASE_TIMER,
            timer: 0,
            note_duration: 0,
            attack: 0,
            decay_rate: 0,
            sustain_level: 0,
            hold_level: 0,
            release_rate: 0,
            pos: 0,
            prev_left: 0,
            prev_right: 0,
            wave: None,
            wave_sample: 0,
            psg_duty: 0,
            psg_counter: 0,
            noise_counter: 0,
        }
    }

    /// Start sampled playback of `wave`
    pub fn start_pcm(&mut self, wave: Arc<WaveAsset>, note_duration: i32, clock_speed: u32) {
        self.kind = InstrumentKind::Pcm;
        self.wave_sample = 0;
        self.base_timer = (clock_speed / wave.sample_rate.max(1)) as u16;
        self.wave = Some(wave);
        self.start(note_duration);
    }

    /// Start the pulse generator with the given duty cycle
    pub fn start_psg(&mut self, duty: u8, note_duration: i32) {
        self.kind = InstrumentKind::Psg;
        self.psg_counter = 0;
        self.psg_duty = duty;
        self.base_timer = PSG_BASE_TIMER;
        self.start(note_duration);
    }

    /// Start the noise generator
    pub fn start_noise(&mut self, note_duration: i32) {
        self.kind = InstrumentKind::Noise;
        self.noise_counter = NOISE_SEED;
        self.base_timer = PSG_BASE_TIMER;
        self.start(note_duration);
    }

    fn start(&mut self, note_duration: i32) {
        self.state = EnvelopeState::Attack;
        self.envelope = AMPLITUDE_FLOOR;
        self.pos = 0;
        self.prev_left = 0;
        self.prev_right = 0;
        self.note_duration = note_duration;
    }

    /// Free the voice immediately
    pub fn cut(&mut self) {
        self.owner = None;
        self.volume = 0;
    }

    /// Whether a track currently owns this voice
    pub fn is_live(&self) -> bool {
        self.owner.is_some()
    }

    /// Current sweep contribution in 1/64 semitones, advancing the counter
    /// when the sweep is automatic
    pub fn sweep_value(&mut self) -> i32 {
        if self.sweep_pitch != 0 && self.sweep_counter < self.sweep_length {
            let sweep = ((self.sweep_pitch as i64)
                * ((self.sweep_length - self.sweep_counter) as i64)
                / (self.sweep_length as i64)) as i32;
            if self.auto_sweep {
                self.sweep_counter += 1;
            }
            sweep
        } else {
            0
        }
    }

    /// Set the attack stage from an 0-127 parameter
    pub fn set_attack(&mut self, a: u8) {
        self.attack = ATTACK_TABLE[(a & 0x7F) as usize];
    }

    /// Set the decay stage from an 0-127 parameter
    pub fn set_decay(&mut self, d: u8) {
        self.decay_rate = DECAY_TABLE[(d & 0x7F) as usize];
    }

    /// Set the sustain floor from an 0-127 parameter
    pub fn set_sustain(&mut self, s: u8) {
        self.sustain_level = SUSTAIN_TABLE[(s & 0x7F) as usize];
    }

    /// Set the hold level from an 0-127 parameter
    pub fn set_hold(&mut self, h: u8) {
        self.hold_level = SUSTAIN_TABLE[(h & 0x7F) as usize];
    }

    /// Set the release stage from an 0-127 parameter
    pub fn set_release(&mut self, r: u8) {
        self.release_rate = DECAY_TABLE[(r & 0x7F) as usize];
    }

    /// Advance the envelope by one musical tick
    // TODO: enter Hold between Attack and Decay once the hold timing of the
    // original hardware is verified; hold_level is latched but unused.
    pub fn step_envelope(&mut self) {
        match self.state {
            EnvelopeState::Attack => {
                self.envelope = (self.attack as i32) * self.envelope / 0xFF;
                if self.envelope == 0 {
                    self.state = EnvelopeState::Decay;
                }
            }
            EnvelopeState::Decay => {
                self.envelope -= self.decay_rate as i32;
                if self.envelope <= self.sustain_level {
                    self.state = EnvelopeState::Sustain;
                    self.envelope = self.sustain_level;
                }
            }
            EnvelopeState::Release => {
                self.envelope -= self.release_rate as i32;
                if self.envelope < AMPLITUDE_FLOOR {
                    self.envelope = AMPLITUDE_FLOOR;
                }
            }
            EnvelopeState::Hold | EnvelopeState::Sustain => {}
        }
    }

    /// Generate one output frame at the mix rate
    ///
    /// Returns the last computed stereo pair; the phase accumulator decides
    /// how many source samples (possibly zero) advance underneath it. A PCM
    /// voice that runs off the end of a non-looping wave frees itself.
    pub fn process(&mut self) -> (i16, i16) {
        if self.timer != 0 {
            let num_samples = (self.pos + 0x100) / self.timer as i32;
            self.pos = (self.pos + 0x100) % self.timer as i32;
            for _ in 0..num_samples {
                let mut samp: i16;
                let mut l_sample: i16 = 1;
                let mut r_sample: i16 = 1;
                match self.kind {
                    InstrumentKind::Pcm => {
                        samp = 0;
                        if let Some(wave) = self.wave.clone() {
                            samp = 1;
                            if self.wave_sample >= wave.num_samples() {
                                if wave.loops {
                                    self.wave_sample = wave.loop_start as usize;
                                } else {
                                    self.prev_left = 0;
                                    self.prev_right = 0;
                                    self.cut();
                                    return (0, 0);
                                }
                            }
                            let (l, r) = wave.sample_at(self.wave_sample);
                            self.wave_sample += 1;
                            if wave.is_stereo() {
                                l_sample = l;
                                r_sample = r;
                            } else {
                                samp = l;
                            }
                        }
                    }
                    InstrumentKind::Psg => {
                        samp = if self.psg_counter <= self.psg_duty as i32 {
                            i16::MIN
                        } else {
                            i16::MAX
                        };
                        self.psg_counter += 1;
                        if self.psg_counter >= 8 {
                            self.psg_counter = 0;
                        }
                    }
                    InstrumentKind::Noise => {
                        if (self.noise_counter & 1) != 0 {
                            self.noise_counter = (self.noise_counter >> 1) ^ 0x6000;
                            samp = -0x7FFF;
                        } else {
                            self.noise_counter >>= 1;
                            samp = 0x7FFF;
                        }
                    }
                }
                let l = (samp as i32).wrapping_mul(l_sample as i32) as i16;
                let r = (samp as i32).wrapping_mul(r_sample as i32) as i16;
                let l = ((l as i32) * (self.volume as i32) / 0x7F) as i16;
                let r = ((r as i32) * (self.volume as i32) / 0x7F) as i16;
                self.prev_left = ((l as i32) * (-(self.pan as i32) + 0x40) / 0x80) as i16;
                self.prev_right = ((r as i32) * ((self.pan as i32) + 0x40) / 0x80) as i16;
            }
        }
        (self.prev_left, self.prev_right)
    }

    /// Advance the phase accumulator without producing audio (seek path)
    pub fn emulate_process(&mut self) {
        if self.timer != 0 {
            let num_samples = (self.pos + 0x100) / self.timer as i32;
            self.pos = (self.pos + 0x100) % self.timer as i32;
            for _ in 0..num_samples {
                if self.kind == InstrumentKind::Pcm {
                    let loops = self.wave.as_ref().map(|w| w.loops).unwrap_or(false);
                    let len = self.wave.as_ref().map(|w| w.num_samples()).unwrap_or(0);
                    if !loops {
                        if self.wave_sample >= len {
                            self.cut();
                        } else {
                            self.wave_sample += 1;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::bank::WaveData;

    fn started_psg() -> Channel {
        let mut c = Channel::new(0);
        c.owner = Some(0);
        c.start_psg(3, 10);
        c
    }

    #[test]
    fn test_attack_moves_toward_zero_without_overshoot() {
        let mut c = started_psg();
        c.set_attack(100);
        let mut last = c.envelope;
        assert_eq!(last, AMPLITUDE_FLOOR);
        for _ in 0..2000 {
            c.step_envelope();
            assert!(c.envelope >= last, "attack must move toward 0");
            assert!(c.envelope <= 0, "attack must not overshoot past 0");
            last = c.envelope;
            if c.state != EnvelopeState::Attack {
                break;
            }
        }
        assert_eq!(c.state, EnvelopeState::Decay, "attack must terminate");
        assert_eq!(c.envelope, 0);
    }

    #[test]
    fn test_instant_attack() {
        let mut c = started_psg();
        c.set_attack(127);
        c.step_envelope();
        assert_eq!(c.envelope, 0);
        assert_eq!(c.state, EnvelopeState::Decay);
    }

    #[test]
    fn test_decay_settles_at_sustain() {
        let mut c = started_psg();
        c.set_attack(127);
        c.set_decay(64);
        c.set_sustain(64);
        c.step_envelope();
        for _ in 0..20000 {
            c.step_envelope();
            if c.state == EnvelopeState::Sustain {
                break;
            }
        }
        assert_eq!(c.state, EnvelopeState::Sustain);
        assert_eq!(c.envelope, SUSTAIN_TABLE[64]);
        let level = c.envelope;
        c.step_envelope();
        assert_eq!(c.envelope, level, "sustain holds");
    }

    #[test]
    fn test_release_never_rises_and_floors() {
        let mut c = started_psg();
        c.set_release(80);
        c.state = EnvelopeState::Release;
        c.envelope = 0;
        let mut last = c.envelope;
        for _ in 0..20000 {
            c.step_envelope();
            assert!(c.envelope <= last, "release must not rise");
            last = c.envelope;
        }
        assert_eq!(c.envelope, AMPLITUDE_FLOOR);
    }

    #[test]
    fn test_pan_law_hard_right() {
        let mut c = started_psg();
        c.psg_duty = 7; // comparator below duty for the whole period: constant low
        c.volume = 127;
        c.pan = 0x3F;
        c.timer = 0x100; // one source sample per frame
        let (l, r) = c.process();
        // left keeps 1/128 of the sample, right 127/128.
        assert_eq!(l, i16::MIN as i32 as i16 / 128);
        assert_eq!(r, ((i16::MIN as i32) * 0x7F / 0x80) as i16);
        assert!(l.unsigned_abs() <= (i16::MAX as u16) / 100, "left is near silent");
    }

    #[test]
    fn test_psg_duty_cycle() {
        let mut c = started_psg();
        c.psg_duty = 3;
        c.volume = 127;
        c.pan = 0;
        c.timer = 0x100;
        let mut lows = 0;
        let mut highs = 0;
        for _ in 0..8 {
            let (l, _) = c.process();
            if l < 0 {
                lows += 1;
            } else {
                highs += 1;
            }
        }
        assert_eq!(lows, 4, "duty 3 holds low for counter values 0..=3");
        assert_eq!(highs, 4);
    }

    #[test]
    fn test_noise_reseeds_and_varies() {
        let mut c = Channel::new(14);
        c.owner = Some(0);
        c.start_noise(10);
        assert_eq!(c.noise_counter, NOISE_SEED);
        c.volume = 127;
        c.timer = 0x100;
        let mut seen_low = false;
        let mut seen_high = false;
        for _ in 0..64 {
            let (l, _) = c.process();
            if l < 0 {
                seen_low = true;
            } else if l > 0 {
                seen_high = true;
            }
        }
        assert!(seen_low && seen_high, "LFSR output must toggle");
    }

    #[test]
    fn test_pcm_end_of_data_frees_voice() {
        let wave = Arc::new(WaveAsset {
            sample_rate: 32768,
            loops: false,
            loop_start: 0,
            data: WaveData::Mono16(vec![1000; 4]),
        });
        let mut c = Channel::new(0);
        c.owner = Some(2);
        c.start_pcm(wave, 100, 16_756_991);
        c.volume = 127;
        c.timer = 0x100;
        for _ in 0..16 {
            c.process();
            if !c.is_live() {
                break;
            }
        }
        assert!(!c.is_live(), "voice frees itself at end of data");
    }

    #[test]
    fn test_pcm_looping_wraps() {
        let wave = Arc::new(WaveAsset {
            sample_rate: 32768,
            loops: true,
            loop_start: 2,
            data: WaveData::Mono16(vec![10, 20, 30, 40]),
        });
        let mut c = Channel::new(0);
        c.owner = Some(2);
        c.start_pcm(wave, -1, 16_756_991);
        c.volume = 127;
        c.pan = 0;
        c.timer = 0x100;
        for _ in 0..64 {
            c.process();
        }
        assert!(c.is_live(), "looping voice never frees itself");
    }
}

//! Voice pool and stereo mixer
//!
//! Owns the sixteen voices, hands them out by category and priority,
//! refreshes each live voice's amplitude/pan/timer once per musical tick,
//! and mixes everything into interleaved 16-bit stereo microframe buffers
//! with a master fade ramp.

use bitflags::bitflags;

use super::bank::InstrumentKind;
use super::channel::{Channel, EnvelopeState};
use super::output::{AudioSink, RingBufferSink};
use super::tables::{amplitude_for, timer_for, AMPLITUDE_FLOOR, SUSTAIN_TABLE};
use super::track::Track;
use super::{NUM_TRACKS, NUM_VOICES, SAMPLES_PER_BUFFER, TICK_RATE};
use crate::export::WavCapture;

/// Master fade ramp length in milliseconds
const FADE_MILLIS: u64 = 1920;

/// Power-curve exponent of the fade ramp
const FADE_CURVE: f32 = 10.0 / 6.0;

bitflags! {
    /// Hardware-valid voice subsets per instrument category
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VoiceMask: u16 {
        /// PCM may use every voice
        const PCM = 0xFFFF;
        /// PSG pulse is wired to voices 8-13
        const PSG = 0b0011_1111_0000_0000;
        /// Noise is wired to voices 14-15
        const NOISE = 0b1100_0000_0000_0000;
    }
}

impl VoiceMask {
    /// Candidate voices for an instrument category
    pub fn for_kind(kind: InstrumentKind) -> VoiceMask {
        match kind {
            InstrumentKind::Pcm => VoiceMask::PCM,
            InstrumentKind::Psg => VoiceMask::PSG,
            InstrumentKind::Noise => VoiceMask::NOISE,
        }
    }
}

/// The voice pool and output stage
pub struct Mixer {
    /// The sixteen voices
    pub channels: Vec<Channel>,
    /// Per-track mute switches
    pub mutes: [bool; NUM_TRACKS],
    /// Master level before fading (1.0 = unity)
    pub volume: f32,

    samples_per_buffer: usize,
    samples_reciprocal: f32,

    fading: bool,
    fade_frames_left: u64,
    fade_pos: f32,
    fade_step: f32,

    live: Option<RingBufferSink>,
    capture: Option<WavCapture>,
    scratch: Vec<i16>,
}

impl Mixer {
    /// Create a mixer with all voices idle and no sinks attached
    pub fn new() -> Self {
        let channels = (0..NUM_VOICES as u8).map(Channel::new).collect();
        Mixer {
            channels,
            mutes: [false; NUM_TRACKS],
            volume: 1.0,
            samples_per_buffer: SAMPLES_PER_BUFFER,
            samples_reciprocal: 1.0 / SAMPLES_PER_BUFFER as f32,
            fading: false,
            fade_frames_left: 0,
            fade_pos: 0.0,
            fade_step: 0.0,
            live: None,
            capture: None,
            scratch: Vec::with_capacity(SAMPLES_PER_BUFFER * 2),
        }
    }

    /// Attach the live ring-buffer sink
    pub fn attach_live(&mut self, sink: RingBufferSink) {
        self.live = Some(sink);
    }

    /// Detach the live sink
    pub fn detach_live(&mut self) -> Option<RingBufferSink> {
        self.live.take()
    }

    /// Attach a WAV capture sink; it receives every mixed frame until
    /// detached, alongside any live sink
    pub fn attach_capture(&mut self, capture: WavCapture) {
        self.capture = Some(capture);
    }

    /// Detach the capture sink for finalization
    pub fn detach_capture(&mut self) -> Option<WavCapture> {
        self.capture.take()
    }

    /// Pick a voice for `kind` on behalf of a track, or `None` to drop the
    /// note
    ///
    /// Free voices win over releasing voices, which win over stealing by
    /// owner priority (ties prefer the quieter voice). The requester only
    /// gets the pick if its own priority is at least the pick's score.
    pub fn allocate(
        &self,
        kind: InstrumentKind,
        requester_priority: u8,
        tracks: &[Track],
    ) -> Option<usize> {
        let mask = VoiceMask::for_kind(kind).bits();

        let score = |c: &Channel| -> i32 {
            match c.owner {
                None => -2,
                Some(_) if c.state == EnvelopeState::Release => -1,
                Some(t) => tracks[t as usize].priority as i32,
            }
        };

        let mut best: Option<usize> = None;
        for i in 0..NUM_VOICES {
            if mask & (1 << i) == 0 {
                continue;
            }
            match best {
                None => best = Some(i),
                Some(b) => {
                    let b_score = score(&self.channels[b]);
                    let c_score = score(&self.channels[i]);
                    if c_score <= b_score
                        && (c_score < b_score || self.channels[i].volume <= self.channels[b].volume)
                    {
                        best = Some(i);
                    }
                }
            }
        }

        best.filter(|&b| requester_priority as i32 >= score(&self.channels[b]))
    }

    /// Refresh every live voice once per musical tick: envelope step,
    /// release trigger, amplitude/timer/pan recomputation, and voice
    /// reclamation at silence
    pub fn channel_tick(&mut self, tracks: &[Track], master_volume: u8) {
        for ch in &mut self.channels {
            let Some(owner) = ch.owner else { continue };
            let track = &tracks[owner as usize];

            ch.step_envelope();
            if ch.note_duration == 0 && !track.awaiting_note_end {
                ch.state = EnvelopeState::Release;
            }

            let vol = SUSTAIN_TABLE[ch.note_velocity.min(127) as usize]
                + ch.envelope
                + track.volume_level(master_volume);
            let pitch =
                (((ch.key as i32) - (ch.base_key as i32)) << 6) + ch.sweep_value() + track.pitch();

            if ch.state == EnvelopeState::Release && vol <= AMPLITUDE_FLOOR {
                ch.cut();
            } else {
                ch.volume = amplitude_for(vol);
                ch.timer = timer_for(ch.base_timer, pitch);
                let p = ((ch.starting_pan as i32) + (track.pan() as i32)).clamp(-0x40, 0x3F);
                ch.pan = p as i8;
            }
        }
    }

    /// Begin a master fade from silence to unity
    pub fn begin_fade_in(&mut self) {
        self.fade_pos = 0.0;
        self.fade_frames_left = FADE_MILLIS * TICK_RATE as u64 / 1000;
        self.fade_step = 1.0 / self.fade_frames_left as f32;
        self.fading = true;
    }

    /// Begin a master fade from unity to silence
    pub fn begin_fade_out(&mut self) {
        self.fade_pos = 1.0;
        self.fade_frames_left = FADE_MILLIS * TICK_RATE as u64 / 1000;
        self.fade_step = -1.0 / self.fade_frames_left as f32;
        self.fading = true;
    }

    /// Whether a fade ramp is armed
    pub fn is_fading(&self) -> bool {
        self.fading
    }

    /// Whether an armed fade has fully ramped
    pub fn is_fade_done(&self) -> bool {
        self.fading && self.fade_frames_left == 0
    }

    /// Disarm fading
    pub fn reset_fade(&mut self) {
        self.fading = false;
        self.fade_frames_left = 0;
    }

    /// Mix one microframe buffer and fan it out to the attached sinks
    ///
    /// `output` gates the live sink; the capture sink receives every frame
    /// while attached (recording, or capturing during live playback).
    pub fn process(&mut self, output: bool, recording: bool) {
        let mut master_level: f32;
        let master_step: f32;
        if self.fading && self.fade_frames_left == 0 {
            master_step = 0.0;
            master_level = 0.0;
        } else {
            let mut from = self.volume;
            let mut to = self.volume;
            if self.fade_frames_left > 0 {
                from *= if self.fade_pos < 0.0 {
                    0.0
                } else {
                    self.fade_pos.powf(FADE_CURVE)
                };
                self.fade_pos += self.fade_step;
                to *= if self.fade_pos < 0.0 {
                    0.0
                } else {
                    self.fade_pos.powf(FADE_CURVE)
                };
                self.fade_frames_left -= 1;
            }
            master_step = (to - from) * self.samples_reciprocal;
            master_level = from;
        }

        self.scratch.clear();
        for _ in 0..self.samples_per_buffer {
            let mut left = 0i32;
            let mut right = 0i32;
            for ch in &mut self.channels {
                if let Some(owner) = ch.owner {
                    // Mute is read first: processing can free the voice.
                    let muted = self.mutes[owner as usize];
                    let (l, r) = ch.process();
                    if !muted {
                        left += l as i32;
                        right += r as i32;
                    }
                }
            }
            let l = ((left as f32) * master_level)
                .clamp(i16::MIN as f32, i16::MAX as f32) as i16;
            let r = ((right as f32) * master_level)
                .clamp(i16::MIN as f32, i16::MAX as f32) as i16;
            self.scratch.push(l);
            self.scratch.push(r);
            master_level += master_step;
        }

        if output {
            if let Some(sink) = &mut self.live {
                sink.push_frames(&self.scratch);
            }
        }
        if output || recording {
            if let Some(capture) = &mut self.capture {
                capture.push_frames(&self.scratch);
            }
        }
    }

    /// Advance every live voice's sample cursor without producing audio
    pub fn emulate_process(&mut self) {
        for _ in 0..self.samples_per_buffer {
            for ch in &mut self.channels {
                if ch.is_live() {
                    ch.emulate_process();
                }
            }
        }
    }
}

impl Default for Mixer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::NUM_TRACKS;

    fn tracks() -> Vec<Track> {
        (0..NUM_TRACKS as u8).map(Track::new).collect()
    }

    #[test]
    fn test_category_masks() {
        assert_eq!(VoiceMask::for_kind(InstrumentKind::Pcm).bits(), 0xFFFF);
        assert_eq!(VoiceMask::for_kind(InstrumentKind::Psg).bits(), 0x3F00);
        assert_eq!(VoiceMask::for_kind(InstrumentKind::Noise).bits(), 0xC000);
    }

    #[test]
    fn test_allocate_respects_category() {
        let mixer = Mixer::new();
        let tracks = tracks();
        let v = mixer.allocate(InstrumentKind::Noise, 0x40, &tracks).unwrap();
        assert!(v == 14 || v == 15, "noise only fits the top two voices");
        let v = mixer.allocate(InstrumentKind::Psg, 0x40, &tracks).unwrap();
        assert!((8..=13).contains(&v), "pulse fits the middle voices");
    }

    #[test]
    fn test_allocate_prefers_free_then_releasing() {
        let mut mixer = Mixer::new();
        let tracks = tracks();
        // Voice 14 is live and held, 15 is releasing: the releasing one wins.
        mixer.channels[14].owner = Some(1);
        mixer.channels[14].state = EnvelopeState::Sustain;
        mixer.channels[15].owner = Some(2);
        mixer.channels[15].state = EnvelopeState::Release;
        assert_eq!(mixer.allocate(InstrumentKind::Noise, 0x40, &tracks), Some(15));
    }

    #[test]
    fn test_allocate_denied_below_owner_priority() {
        let mut mixer = Mixer::new();
        let mut tracks = tracks();
        for v in 14..16 {
            mixer.channels[v].owner = Some(1);
            mixer.channels[v].state = EnvelopeState::Sustain;
        }
        tracks[1].priority = 0x60;
        assert_eq!(
            mixer.allocate(InstrumentKind::Noise, 0x40, &tracks),
            None,
            "a lower-priority track cannot steal"
        );
        assert!(
            mixer.allocate(InstrumentKind::Noise, 0x60, &tracks).is_some(),
            "an equal-priority track can"
        );
    }

    #[test]
    fn test_fade_out_reaches_silence() {
        let mut mixer = Mixer::new();
        mixer.begin_fade_out();
        assert!(mixer.is_fading());
        let mut frames = 0;
        while !mixer.is_fade_done() {
            mixer.process(false, false);
            frames += 1;
            assert!(frames <= 1000, "fade must complete inside its window");
        }
        // 1.92 s at 192 microframes/s.
        assert_eq!(frames, FADE_MILLIS * TICK_RATE as u64 / 1000);
    }

    #[test]
    fn test_release_to_silence_frees_voice() {
        let mut mixer = Mixer::new();
        let tracks = tracks();
        mixer.channels[0].owner = Some(0);
        mixer.channels[0].start_psg(4, 1);
        mixer.channels[0].set_release(127);
        mixer.channels[0].state = EnvelopeState::Release;
        mixer.channel_tick(&tracks, 127);
        assert!(
            !mixer.channels[0].is_live(),
            "max release rate silences and frees in one tick"
        );
    }
}

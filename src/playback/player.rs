//! Player and interpreter engine
//!
//! [`Player`] is the caller-facing handle; the actual virtual machine -
//! tracks, voices, variables, RNG, tempo clock - lives in an [`Engine`]
//! value that is moved into a worker thread while playing and handed back
//! on pause/stop. Only one thread ever mutates engine state; the caller and
//! worker share nothing but the state flag and an elapsed-tick counter.
//!
//! The tempo model: every microframe adds the current BPM to an
//! accumulator; each time it crosses the threshold (240) all enabled tracks
//! advance by one musical tick, executing instructions until they block on
//! a rest, a ringing note, or `Fin`.

use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::bank::{InstrumentKind, PlayableBank, WaveAsset};
use super::channel::EnvelopeState;
use super::mixer::Mixer;
use super::output::{RingBuffer, RingBufferSink};
use super::scan::TickScanner;
use super::timing::TimeBarrier;
use super::track::{LfoKind, Track, CALL_STACK_DEPTH};
use super::{CLOCK_SPEED, NUM_TRACKS, SAMPLE_RATE, TEMPO_THRESHOLD, TICK_RATE};
use crate::export::WavCapture;
use crate::sequence::{CommandKind, Program, SequenceCommand};
use crate::{Result, SseqError};

/// Number of global variable slots (player slots 0..=31)
pub const GLOBAL_VARS: usize = 32;

/// Default tempo in BPM
const DEFAULT_TEMPO: u16 = 120;

/// Playback state flag shared between the caller and the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    /// No worker running, cursor at rest
    Stopped,
    /// Worker running with real-time pacing
    Playing,
    /// Worker parked, engine state preserved
    Paused,
    /// Rendering to the capture sink without pacing
    Recording,
    /// Tearing down
    ShutDown,
}

/// Player construction parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerConfig {
    /// Sample-timer reference clock in Hz
    pub clock_speed: u32,
    /// Full loops to play before the fade-out arms
    pub num_loops: i64,
    /// Whether reaching the loop limit fades the song out
    pub fade_on_loop: bool,
    /// Live-output ring buffer capacity in samples (0 disables the live sink)
    pub ring_buffer_size: usize,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        PlayerConfig {
            clock_speed: CLOCK_SPEED,
            num_loops: 0,
            fade_on_loop: true,
            ring_buffer_size: 1 << 15,
        }
    }
}

/// A note-on or note-off observed by the interpreter
#[derive(Debug, Clone, Copy)]
pub struct NoteEvent {
    /// Track that played the note
    pub track: u8,
    /// Key (0 on note-off events)
    pub key: u8,
    /// True for note-on
    pub on: bool,
}

/// Observer for note events
pub type NoteCallback = Box<dyn FnMut(NoteEvent) + Send>;

/// Observer for the song ending on its own
pub type SongEndedCallback = Box<dyn FnMut() + Send>;

/// The interpreter virtual machine; owned by exactly one thread at a time
pub(crate) struct Engine {
    program: Option<Arc<Program>>,
    tracks: Vec<Track>,
    vars: [i16; GLOBAL_VARS],
    mixer: Mixer,
    banks: Vec<Arc<dyn PlayableBank>>,
    wave_archives: Vec<Vec<Arc<WaveAsset>>>,

    /// Master volume (0-127), set by `MainVolume`
    volume: u8,
    tempo: u16,
    tempo_stack: i32,
    elapsed_loops: i64,
    elapsed_ticks: i64,
    elapsed_shared: Arc<AtomicI64>,
    max_ticks: i64,
    longest_track: usize,

    rand_seed: u64,
    rng: StdRng,
    start_index: usize,
    clock_speed: u32,
    num_loops: i64,
    fade_on_loop: bool,
    scan_hit_ceiling: bool,

    note_callback: Option<NoteCallback>,
    song_ended: Option<SongEndedCallback>,
}

impl Engine {
    fn new(config: &PlayerConfig, elapsed_shared: Arc<AtomicI64>) -> Self {
        let tracks = (0..NUM_TRACKS as u8).map(Track::new).collect();
        Engine {
            program: None,
            tracks,
            vars: [-1; GLOBAL_VARS],
            mixer: Mixer::new(),
            banks: Vec::new(),
            wave_archives: Vec::new(),
            volume: 127,
            tempo: DEFAULT_TEMPO,
            tempo_stack: 0,
            elapsed_loops: 0,
            elapsed_ticks: 0,
            elapsed_shared,
            max_ticks: 0,
            longest_track: 0,
            rand_seed: 0,
            rng: StdRng::seed_from_u64(0),
            start_index: 0,
            clock_speed: config.clock_speed,
            num_loops: config.num_loops,
            fade_on_loop: config.fade_on_loop,
            scan_hit_ceiling: false,
            note_callback: None,
            song_ended: None,
        }
    }

    /// Reset to power-on defaults for a (re)start of the loaded song
    fn init_emulation(&mut self) {
        self.tempo = DEFAULT_TEMPO;
        self.tempo_stack = 0;
        self.elapsed_loops = 0;
        self.elapsed_ticks = 0;
        self.elapsed_shared.store(0, Ordering::Relaxed);
        self.volume = 127;
        self.mixer.reset_fade();
        self.rng = StdRng::seed_from_u64(self.rand_seed);
        for ch in &mut self.mixer.channels {
            ch.cut();
        }
        for track in &mut self.tracks {
            track.init();
        }
        self.vars = [-1; GLOBAL_VARS];
    }

    fn get_var(&self, slot: i32, track_num: usize) -> i16 {
        let slot = slot as usize;
        if slot < GLOBAL_VARS {
            self.vars[slot]
        } else {
            self.tracks[track_num]
                .vars
                .get(slot - GLOBAL_VARS)
                .copied()
                .unwrap_or(-1)
        }
    }

    fn set_var(&mut self, slot: i32, track_num: usize, value: i16) {
        let slot = slot as usize;
        if slot < GLOBAL_VARS {
            self.vars[slot] = value;
        } else if let Some(v) = self.tracks[track_num].vars.get_mut(slot - GLOBAL_VARS) {
            *v = value;
        }
    }

    /// One microframe: musical ticks while the accumulator allows, then one
    /// mixed buffer. Returns true when the song has fully ended.
    fn advance_microframe(&mut self, output: bool, recording: bool) -> bool {
        let Some(program) = self.program.clone() else {
            return true;
        };

        while self.tempo_stack >= TEMPO_THRESHOLD {
            self.tempo_stack -= TEMPO_THRESHOLD;
            let mut all_done = true;
            for i in 0..NUM_TRACKS {
                if !self.tracks[i].enabled {
                    continue;
                }
                self.tick_track(i);
                self.observe_note_release(i);
                while self.tracks[i].rest == 0
                    && !self.tracks[i].awaiting_note_end
                    && !self.tracks[i].stopped
                {
                    self.execute_next(i);
                }
                if i == self.longest_track {
                    if self.elapsed_ticks >= self.max_ticks {
                        if !self.tracks[i].stopped {
                            let annotated =
                                program.tick_at(self.tracks[i].cur_event, self.longest_track);
                            self.elapsed_ticks = annotated - self.tracks[i].rest as i64;
                            self.elapsed_loops += 1;
                            if self.fade_on_loop
                                && !self.mixer.is_fading()
                                && self.elapsed_loops > self.num_loops
                            {
                                self.mixer.begin_fade_out();
                            }
                        }
                    } else {
                        self.elapsed_ticks += 1;
                    }
                    self.elapsed_shared.store(self.elapsed_ticks, Ordering::Relaxed);
                }
                if !self.tracks[i].stopped || !self.tracks[i].channels.is_empty() {
                    all_done = false;
                }
            }
            if self.mixer.is_fade_done() {
                all_done = true;
            }
            if all_done {
                self.mixer_process(output, recording);
                return true;
            }
        }
        self.tempo_stack += self.tempo as i32;
        self.mixer_process(output, recording);
        false
    }

    fn mixer_process(&mut self, output: bool, recording: bool) {
        self.mixer.channel_tick(&self.tracks, self.volume);
        self.mixer.process(output, recording);
        self.prune_channels();
    }

    /// Drop voice indices whose voice no longer belongs to the track
    fn prune_channels(&mut self) {
        let mixer = &self.mixer;
        for (i, track) in self.tracks.iter_mut().enumerate() {
            track
                .channels
                .retain(|&c| mixer.channels[c as usize].owner == Some(i as u8));
        }
    }

    /// Per-musical-tick track bookkeeping: voice countdowns, then rest/LFO
    fn tick_track(&mut self, i: usize) {
        let (tracks, mixer) = (&mut self.tracks, &mut self.mixer);
        tracks[i]
            .channels
            .retain(|&c| mixer.channels[c as usize].owner == Some(i as u8));
        for &c in &tracks[i].channels {
            let ch = &mut mixer.channels[c as usize];
            if ch.note_duration > 0 {
                ch.note_duration -= 1;
            }
            if !ch.auto_sweep && ch.sweep_counter < ch.sweep_length {
                ch.sweep_counter += 1;
            }
        }
        let has_channels = !tracks[i].channels.is_empty();
        tracks[i].tick(has_channels);
    }

    /// Fire the note-off observer when the newest voice releases
    fn observe_note_release(&mut self, i: usize) {
        if !self.tracks[i].note_down {
            return;
        }
        let released = match self.tracks[i].channels.last() {
            None => true,
            Some(&c) => self.mixer.channels[c as usize].state == EnvelopeState::Release,
        };
        if released {
            self.tracks[i].note_down = false;
            if let Some(cb) = &mut self.note_callback {
                cb(NoteEvent {
                    track: i as u8,
                    key: 0,
                    on: false,
                });
            }
        }
    }

    fn execute_next(&mut self, i: usize) {
        let Some(program) = self.program.clone() else {
            self.tracks[i].stopped = true;
            return;
        };
        let idx = self.tracks[i].cur_event;
        match program.commands.get(idx) {
            Some(cmd) => self.execute_command(i, cmd),
            None => {
                // Running off the end of the stream stops the track.
                self.tracks[i].stopped = true;
            }
        }
    }

    fn execute_command(&mut self, i: usize, cmd: &SequenceCommand) {
        let mut increment = true;

        let num_args = cmd.num_arguments();
        let mut args: Vec<i32> = (0..num_args).map(|n| cmd.argument(n, &mut self.rng)).collect();

        // A variable wrapper's trailing argument is a slot number; fetch the
        // slot's current value.
        if matches!(cmd.kind(), CommandKind::Variable | CommandKind::TimeVariable) {
            if let Some(last) = args.last_mut() {
                *last = self.get_var(*last, i) as i32;
            }
        }

        let true_kind = cmd.effective_kind();

        if cmd.kind() != CommandKind::If || self.tracks[i].variable_flag {
            match true_kind {
                CommandKind::Note => {
                    let duration = args[2];
                    let key =
                        (args[0] + self.tracks[i].transpose as i32).clamp(0, 0x7F) as u8;
                    self.play_note(i, key, args[1] as u8, duration);
                    self.tracks[i].portamento_key = key;
                    if self.tracks[i].note_wait {
                        self.tracks[i].rest = duration;
                        if duration == 0 {
                            self.tracks[i].awaiting_note_end = true;
                        }
                    }
                }

                CommandKind::Wait => self.tracks[i].rest = args[0],

                CommandKind::ProgramChange => self.tracks[i].program = args[0],

                CommandKind::OpenTrack => {
                    if i == 0 {
                        let target = args[0] as usize;
                        if target < NUM_TRACKS {
                            let track = &mut self.tracks[target];
                            if track.allocated && !track.enabled {
                                track.enabled = true;
                                track.cur_event = args[1] as usize;
                            }
                        }
                    }
                }

                CommandKind::Jump => {
                    self.tracks[i].cur_event = args[0] as usize;
                    increment = false;
                }

                CommandKind::Call => {
                    let track = &mut self.tracks[i];
                    // Beyond depth 3 the call is silently dropped, like the
                    // hardware does.
                    if (track.call_depth as usize) < CALL_STACK_DEPTH {
                        track.call_stack[track.call_depth as usize] = track.cur_event + 1;
                        track.call_depth += 1;
                        track.cur_event = args[0] as usize;
                        increment = false;
                    }
                }

                CommandKind::Random
                | CommandKind::Variable
                | CommandKind::If
                | CommandKind::Time
                | CommandKind::TimeRandom
                | CommandKind::TimeVariable
                | CommandKind::Extended => {
                    // effective_kind strips these; reaching here is a bug.
                    log::error!("wrapper kind {:?} leaked into execution", true_kind);
                }

                CommandKind::EnvHold => self.tracks[i].hold = args[0] as u8,

                CommandKind::BankSelect => self.tracks[i].bank = args[0] as usize,

                CommandKind::Pan => self.tracks[i].panpot = (args[0] - 0x40) as i8,

                CommandKind::Volume => self.tracks[i].volume = args[0] as u8,

                CommandKind::MainVolume => self.volume = args[0] as u8,

                CommandKind::Transpose => self.tracks[i].transpose = args[0] as i8,

                CommandKind::PitchBend => self.tracks[i].pitch_bend = args[0] as i8,

                CommandKind::BendRange => self.tracks[i].pitch_bend_range = args[0] as u8,

                CommandKind::Prio => self.tracks[i].priority = args[0] as u8,

                CommandKind::NoteWait => self.tracks[i].note_wait = args[0] > 0,

                CommandKind::Tie => {
                    self.tracks[i].tie = args[0] > 0;
                    self.stop_all_channels(i);
                }

                CommandKind::Porta => {
                    let key =
                        (args[0] + self.tracks[i].transpose as i32).clamp(0, 0x7F) as u8;
                    self.tracks[i].portamento_key = key;
                    self.tracks[i].portamento = true;
                }

                CommandKind::ModDepth => self.tracks[i].lfo_depth = args[0] as u8,
                CommandKind::ModSpeed => self.tracks[i].lfo_speed = args[0] as u8,
                CommandKind::ModType => {
                    self.tracks[i].lfo_kind = LfoKind::from_u8(args[0] as u8)
                }
                CommandKind::ModRange => self.tracks[i].lfo_range = args[0] as u8,

                CommandKind::PortaSw => self.tracks[i].portamento = args[0] > 0,
                CommandKind::PortaTime => self.tracks[i].portamento_time = args[0] as u8,

                CommandKind::Attack => self.tracks[i].attack = args[0] as u8,
                CommandKind::Decay => self.tracks[i].decay = args[0] as u8,
                CommandKind::Sustain => self.tracks[i].sustain = args[0] as u8,
                CommandKind::Release => self.tracks[i].release = args[0] as u8,

                CommandKind::LoopStart => {
                    let track = &mut self.tracks[i];
                    // The frame stores the body start so LoopEnd re-enters
                    // the body, not the LoopStart itself.
                    if (track.call_depth as usize) < CALL_STACK_DEPTH {
                        track.call_stack[track.call_depth as usize] = track.cur_event + 1;
                        track.call_loops[track.call_depth as usize] = args[0] as u8;
                        track.call_depth += 1;
                    }
                }

                CommandKind::Volume2 => self.tracks[i].expression = args[0] as u8,

                CommandKind::PrintVar => {
                    log::info!("variable {} = {}", args[0], self.get_var(args[0], i));
                }

                CommandKind::ModDelay => self.tracks[i].lfo_delay = args[0] as u16,

                CommandKind::Tempo => self.tempo = args[0] as u16,

                CommandKind::SweepPitch => self.tracks[i].sweep_pitch = args[0] as i16,

                CommandKind::LoopEnd => {
                    let track = &mut self.tracks[i];
                    if track.call_depth != 0 {
                        let top = track.call_depth as usize - 1;
                        let mut count = track.call_loops[top];
                        let mut done = false;
                        if count != 0 {
                            count -= 1;
                            if count == 0 {
                                track.call_depth -= 1;
                                done = true;
                            }
                        }
                        if !done {
                            track.call_loops[top] = count;
                            track.cur_event = track.call_stack[top];
                            increment = false;
                        }
                    }
                }

                CommandKind::Return => {
                    let track = &mut self.tracks[i];
                    if track.call_depth != 0 {
                        track.call_depth -= 1;
                        track.cur_event = track.call_stack[track.call_depth as usize];
                        increment = false;
                    }
                }

                CommandKind::AllocateTrack => {
                    if i == 0 {
                        for t in 0..NUM_TRACKS {
                            if args[0] & (1 << t) != 0 {
                                self.tracks[t].allocated = true;
                            }
                        }
                    }
                }

                CommandKind::Fin => {
                    self.tracks[i].stopped = true;
                    increment = false;
                }

                CommandKind::SetVar => self.set_var(args[0], i, args[1] as i16),
                CommandKind::AddVar => {
                    let v = (self.get_var(args[0], i) as i32 + args[1]) as i16;
                    self.set_var(args[0], i, v);
                }
                CommandKind::SubVar => {
                    let v = (self.get_var(args[0], i) as i32 - args[1]) as i16;
                    self.set_var(args[0], i, v);
                }
                CommandKind::MulVar => {
                    let v = ((self.get_var(args[0], i) as i32).wrapping_mul(args[1])) as i16;
                    self.set_var(args[0], i, v);
                }
                CommandKind::DivVar => {
                    if args[1] == 0 {
                        log::warn!("division by zero in variable op; slot {} unchanged", args[0]);
                    } else {
                        let v = (self.get_var(args[0], i) as i32 / args[1]) as i16;
                        self.set_var(args[0], i, v);
                    }
                }
                CommandKind::ShiftVar => {
                    let cur = self.get_var(args[0], i) as i32;
                    let v = if args[1] < 0 {
                        cur >> ((-args[1]) as u32 & 31)
                    } else {
                        cur.wrapping_shl(args[1] as u32)
                    };
                    self.set_var(args[0], i, v as i16);
                }
                CommandKind::RandVar => {
                    let mut bound = args[1];
                    let negate = bound < 0;
                    if negate {
                        bound = -bound;
                    }
                    let mut val = self.rng.gen_range(0..=bound) as i16;
                    if negate {
                        val = -val;
                    }
                    self.set_var(args[0], i, val);
                }
                CommandKind::AndVar => {
                    let v = (self.get_var(args[0], i) as i32 & args[1]) as i16;
                    self.set_var(args[0], i, v);
                }
                CommandKind::OrVar => {
                    let v = (self.get_var(args[0], i) as i32 | args[1]) as i16;
                    self.set_var(args[0], i, v);
                }
                CommandKind::XorVar => {
                    let v = (self.get_var(args[0], i) as i32 ^ args[1]) as i16;
                    self.set_var(args[0], i, v);
                }
                CommandKind::NotVar => {
                    // Faithful to the driver, slot number and all.
                    let cur = self.get_var(args[0], i) as i32;
                    let v = (!(cur & args[1])) | (cur & !args[0]);
                    self.set_var(args[0], i, v as i16);
                }
                CommandKind::ModVar => {
                    if args[1] == 0 {
                        log::warn!("modulo by zero in variable op; slot {} unchanged", args[0]);
                    } else {
                        let v = (self.get_var(args[0], i) as i32 % args[1]) as i16;
                        self.set_var(args[0], i, v);
                    }
                }

                CommandKind::CmpEq => {
                    self.tracks[i].variable_flag = self.get_var(args[0], i) as i32 == args[1]
                }
                CommandKind::CmpGe => {
                    self.tracks[i].variable_flag = self.get_var(args[0], i) as i32 >= args[1]
                }
                CommandKind::CmpGt => {
                    self.tracks[i].variable_flag = self.get_var(args[0], i) as i32 > args[1]
                }
                CommandKind::CmpLe => {
                    self.tracks[i].variable_flag = self.get_var(args[0], i) as i32 <= args[1]
                }
                CommandKind::CmpLt => {
                    self.tracks[i].variable_flag = (self.get_var(args[0], i) as i32) < args[1]
                }
                CommandKind::CmpNe => {
                    self.tracks[i].variable_flag = self.get_var(args[0], i) as i32 != args[1]
                }

                CommandKind::UserCall => {}

                // Recognized but not implemented: decode fine, mutate nothing.
                CommandKind::Timebase
                | CommandKind::Monophonic
                | CommandKind::VelocityRange
                | CommandKind::BiquadType
                | CommandKind::BiquadValue
                | CommandKind::ModPhase
                | CommandKind::ModCurve
                | CommandKind::FrontBypass
                | CommandKind::SurroundPan
                | CommandKind::LpfCutoff
                | CommandKind::FxSendA
                | CommandKind::FxSendB
                | CommandKind::MainSend
                | CommandKind::InitPan
                | CommandKind::Mute
                | CommandKind::FxSendC
                | CommandKind::Damper
                | CommandKind::ModPeriod
                | CommandKind::EnvReset
                | CommandKind::Mod2Curve
                | CommandKind::Mod2Phase
                | CommandKind::Mod2Depth
                | CommandKind::Mod2Speed
                | CommandKind::Mod2Type
                | CommandKind::Mod2Range
                | CommandKind::Mod2Delay
                | CommandKind::Mod2Period
                | CommandKind::Mod3Curve
                | CommandKind::Mod3Phase
                | CommandKind::Mod3Depth
                | CommandKind::Mod3Speed
                | CommandKind::Mod3Type
                | CommandKind::Mod3Range
                | CommandKind::Mod3Delay
                | CommandKind::Mod3Period
                | CommandKind::Mod4Curve
                | CommandKind::Mod4Phase
                | CommandKind::Mod4Depth
                | CommandKind::Mod4Speed
                | CommandKind::Mod4Type
                | CommandKind::Mod4Range
                | CommandKind::Mod4Delay
                | CommandKind::Mod4Period => {
                    log::debug!("command {:?} not implemented", true_kind);
                }
            }
        }

        if increment {
            self.tracks[i].cur_event += 1;
        }
    }

    /// Start (or retarget, in tie mode) a note on a track
    fn play_note(&mut self, i: usize, key: u8, velocity: u8, mut duration: i32) {
        if let Some(cb) = &mut self.note_callback {
            cb(NoteEvent {
                track: i as u8,
                key,
                on: true,
            });
        }
        self.tracks[i].note_down = true;

        let mut channel: Option<usize> = None;

        if self.tracks[i].tie && !self.tracks[i].channels.is_empty() {
            if let Some(&c) = self.tracks[i].channels.last() {
                let ch = &mut self.mixer.channels[c as usize];
                ch.key = key;
                ch.note_velocity = velocity;
                channel = Some(c as usize);
            }
        } else {
            let Some(bank) = self.banks.get(self.tracks[i].bank).cloned() else {
                log::warn!("bank {} is not loaded; note dropped", self.tracks[i].bank);
                return;
            };
            let Some(param) =
                bank.note_playback_info(self.tracks[i].program.max(0) as u32, key, velocity)
            else {
                return;
            };

            let kind = param.kind;
            let Some(c) = self.mixer.allocate(kind, self.tracks[i].priority, &self.tracks) else {
                log::debug!("no voice available for track {}; note dropped", i);
                return;
            };

            if self.tracks[i].tie {
                duration = -1;
            }
            let mut release = param.release;
            if release == 0xFF {
                duration = -1;
                release = 0;
            }

            let started = match kind {
                InstrumentKind::Pcm => {
                    let wave = self
                        .wave_archives
                        .get(param.archive_id as usize)
                        .and_then(|archive| archive.get(param.wave_id as usize))
                        .cloned();
                    match wave {
                        Some(wave) => {
                            self.mixer.channels[c].start_pcm(wave, duration, self.clock_speed);
                            true
                        }
                        None => {
                            log::warn!(
                                "wave {}/{} specified by bank is missing",
                                param.archive_id,
                                param.wave_id
                            );
                            false
                        }
                    }
                }
                InstrumentKind::Psg => {
                    self.mixer.channels[c].start_psg(param.wave_id as u8, duration);
                    true
                }
                InstrumentKind::Noise => {
                    self.mixer.channels[c].start_noise(duration);
                    true
                }
            };

            // Detach the voice from its previous owner (steal case).
            if let Some(prev) = self.mixer.channels[c].owner {
                self.tracks[prev as usize].channels.retain(|&x| x as usize != c);
            }
            self.mixer.channels[c].cut();

            if started {
                let ch = &mut self.mixer.channels[c];
                ch.key = key;
                ch.base_key = if kind != InstrumentKind::Pcm && param.base_key == 0x7F {
                    60
                } else {
                    param.base_key
                };
                ch.note_velocity = velocity;
                ch.set_attack(param.attack);
                ch.set_decay(param.decay);
                ch.set_sustain(param.sustain);
                ch.set_hold(param.hold);
                ch.set_release(release);
                ch.starting_pan = (param.pan as i32 - 0x40) as i8;
                ch.owner = Some(i as u8);
                self.tracks[i].channels.push(c as u8);
                channel = Some(c);
            } else {
                return;
            }
        }

        if let Some(c) = channel {
            let track = &self.tracks[i];
            let overrides = (
                track.attack,
                track.decay,
                track.sustain,
                track.hold,
                track.release,
            );
            let sweep = track.sweep_pitch;
            let portamento = track.portamento;
            let portamento_key = track.portamento_key;
            let portamento_time = track.portamento_time;

            let ch = &mut self.mixer.channels[c];
            if overrides.0 != 0xFF {
                ch.set_attack(overrides.0);
            }
            if overrides.1 != 0xFF {
                ch.set_decay(overrides.1);
            }
            if overrides.2 != 0xFF {
                ch.set_sustain(overrides.2);
            }
            if overrides.3 != 0xFF {
                ch.set_hold(overrides.3);
            }
            if overrides.4 != 0xFF {
                ch.set_release(overrides.4);
            }
            ch.sweep_pitch = sweep;
            if portamento {
                ch.sweep_pitch = (ch.sweep_pitch as i32
                    + (((portamento_key as i32) - (key as i32)) << 6))
                    as i16;
            }
            if portamento_time != 0 {
                let t = portamento_time as i32;
                ch.sweep_length = (t * t * (ch.sweep_pitch as i32).abs()) >> 11;
                ch.auto_sweep = true;
            } else {
                ch.sweep_length = duration;
                ch.auto_sweep = false;
            }
            ch.sweep_counter = 0;
        }
    }

    /// Silence every voice a track owns, immediately
    fn stop_all_channels(&mut self, i: usize) {
        let (tracks, mixer) = (&mut self.tracks, &mut self.mixer);
        for &c in &tracks[i].channels {
            mixer.channels[c as usize].cut();
        }
        tracks[i].channels.clear();
    }

    /// Fast-forward to `target` ticks with pacing and audio output disabled
    fn run_to_tick(&mut self, target: i64) {
        while self.elapsed_ticks < target {
            while self.tempo_stack >= TEMPO_THRESHOLD {
                self.tempo_stack -= TEMPO_THRESHOLD;
                for i in 0..NUM_TRACKS {
                    if self.tracks[i].enabled && !self.tracks[i].stopped {
                        self.tick_track(i);
                        while self.tracks[i].rest == 0
                            && !self.tracks[i].awaiting_note_end
                            && !self.tracks[i].stopped
                        {
                            self.execute_next(i);
                        }
                    }
                }
                self.elapsed_ticks += 1;
                if self.elapsed_ticks >= target {
                    break;
                }
            }
            self.tempo_stack += self.tempo as i32;
            self.mixer.channel_tick(&self.tracks, self.volume);
            self.mixer.emulate_process();
            self.prune_channels();
        }
        self.elapsed_shared.store(self.elapsed_ticks, Ordering::Relaxed);
    }

    /// Whether any voice is still owned by a track
    fn any_ringing_voices(&self) -> bool {
        self.mixer.channels.iter().any(|c| c.is_live())
    }
}

/// The worker loop: run until the state flag leaves Playing/Recording or
/// the song ends, then hand the engine back
fn run_worker(mut engine: Engine, state: Arc<Mutex<PlayerState>>) -> Engine {
    let mut time = TimeBarrier::new(TICK_RATE);
    time.start();
    loop {
        let s = *state.lock();
        let playing = s == PlayerState::Playing;
        let recording = s == PlayerState::Recording;
        if !playing && !recording {
            break;
        }
        if engine.advance_microframe(playing, recording) {
            *state.lock() = PlayerState::Stopped;
            if let Some(cb) = &mut engine.song_ended {
                cb();
            }
            break;
        }
        if playing {
            time.wait();
        }
    }
    time.stop();
    engine
}

/// Sequence player: loads a linked [`Program`] and renders it in real time
/// on a worker thread, to a capture file, or both
pub struct Player {
    engine: Option<Engine>,
    state: Arc<Mutex<PlayerState>>,
    elapsed: Arc<AtomicI64>,
    handle: Option<JoinHandle<Engine>>,
    live_buffer: Option<Arc<RingBuffer>>,
}

impl Player {
    /// Create a player; the live sink is attached when the config asks for
    /// a ring buffer
    pub fn new(config: PlayerConfig) -> Self {
        let elapsed = Arc::new(AtomicI64::new(0));
        let mut engine = Engine::new(&config, Arc::clone(&elapsed));
        let live_buffer = if config.ring_buffer_size > 0 {
            match RingBuffer::new(config.ring_buffer_size) {
                Ok(buffer) => {
                    let buffer = Arc::new(buffer);
                    engine.mixer.attach_live(RingBufferSink::new(Arc::clone(&buffer)));
                    Some(buffer)
                }
                Err(e) => {
                    log::warn!("live sink disabled: {}", e);
                    None
                }
            }
        } else {
            None
        };
        Player {
            engine: Some(engine),
            state: Arc::new(Mutex::new(PlayerState::Stopped)),
            elapsed,
            handle: None,
            live_buffer,
        }
    }

    /// Supply the instrument banks and wave archives for the next songs
    pub fn prepare(
        &mut self,
        banks: Vec<Arc<dyn PlayableBank>>,
        wave_archives: Vec<Vec<Arc<WaveAsset>>>,
    ) {
        self.stop();
        if let Some(engine) = self.engine.as_mut() {
            engine.banks = banks;
            engine.wave_archives = wave_archives;
        }
    }

    /// Load a song: link-check, reset, pre-scan ticks, ready to play
    pub fn load(&mut self, mut program: Program, start_index: usize) -> Result<()> {
        self.stop();
        self.join_worker();
        let engine = self.engine.as_mut().ok_or_else(engine_lost)?;

        program.check_links()?;
        if start_index > program.commands.len() {
            return Err(SseqError::ReferenceOutOfBounds {
                index: start_index,
                len: program.commands.len(),
            });
        }

        engine.rand_seed = rand::thread_rng().gen();
        engine.start_index = start_index;
        engine.init_emulation();
        engine.tracks[0].cur_event = start_index;

        let scan = TickScanner::new(
            &mut program,
            &mut engine.rng,
            &engine.vars,
            &engine.tracks,
        )
        .scan(start_index);
        engine.max_ticks = scan.max_ticks;
        engine.longest_track = scan.longest_track;
        engine.scan_hit_ceiling = scan.hit_ceiling;
        engine.program = Some(Arc::new(program));
        Ok(())
    }

    /// Start playback from the loaded song's beginning
    pub fn play(&mut self) -> Result<()> {
        let s = self.state();
        if !matches!(
            s,
            PlayerState::Playing | PlayerState::Paused | PlayerState::Stopped
        ) {
            return Ok(());
        }
        self.stop();
        self.join_worker();
        let engine = self.engine.as_mut().ok_or_else(engine_lost)?;
        if engine.program.is_none() {
            return Err(SseqError::Config("no song loaded".into()));
        }
        engine.init_emulation();
        let start = engine.start_index;
        engine.tracks[0].cur_event = start;
        self.spawn_worker(PlayerState::Playing);
        Ok(())
    }

    /// Pause a playing song, or resume a paused/stopped one in place
    pub fn pause(&mut self) {
        match self.state() {
            PlayerState::Playing => {
                *self.state.lock() = PlayerState::Paused;
                self.join_worker();
            }
            PlayerState::Paused | PlayerState::Stopped => {
                self.join_worker();
                if self.engine.as_ref().map_or(false, |e| e.program.is_some()) {
                    self.spawn_worker(PlayerState::Playing);
                }
            }
            _ => {}
        }
    }

    /// Stop playback; the engine keeps the loaded song
    pub fn stop(&mut self) {
        if matches!(self.state(), PlayerState::Playing | PlayerState::Paused) {
            *self.state.lock() = PlayerState::Stopped;
        }
        self.join_worker();
    }

    /// Render the whole song to a WAV file, unpaced, on this thread
    ///
    /// The live sink (if any) stays silent; the capture sink receives every
    /// frame. Returns once the song has fully ended and the file is closed.
    pub fn record<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.stop();
        self.join_worker();
        let engine = self.engine.as_mut().ok_or_else(engine_lost)?;
        if engine.program.is_none() {
            return Err(SseqError::Config("no song loaded".into()));
        }

        engine.mixer.attach_capture(WavCapture::create(path, SAMPLE_RATE)?);
        engine.init_emulation();
        let start = engine.start_index;
        engine.tracks[0].cur_event = start;

        *self.state.lock() = PlayerState::Recording;
        loop {
            if engine.advance_microframe(false, true) {
                break;
            }
            if *self.state.lock() != PlayerState::Recording {
                break;
            }
        }
        *self.state.lock() = PlayerState::Stopped;

        match engine.mixer.detach_capture() {
            Some(capture) => capture.finalize(),
            None => Ok(()),
        }
    }

    /// Fast-forward to an absolute tick position and leave the player paused
    pub fn seek(&mut self, target_ticks: i64) {
        let s = self.state();
        if !matches!(
            s,
            PlayerState::Playing | PlayerState::Paused | PlayerState::Stopped
        ) {
            return;
        }
        if s == PlayerState::Playing {
            self.pause();
        }
        self.join_worker();
        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        if engine.program.is_none() {
            return;
        }
        engine.init_emulation();
        let start = engine.start_index;
        engine.tracks[0].cur_event = start;
        engine.run_to_tick(target_ticks);
        for i in 0..NUM_TRACKS {
            engine.stop_all_channels(i);
        }
        *self.state.lock() = PlayerState::Paused;
    }

    /// Current playback state
    pub fn state(&self) -> PlayerState {
        *self.state.lock()
    }

    /// Elapsed musical ticks of the current pass
    pub fn position(&self) -> i64 {
        self.elapsed.load(Ordering::Relaxed)
    }

    /// Pre-scanned length of the longest track in ticks
    pub fn max_ticks(&self) -> i64 {
        self.engine.as_ref().map(|e| e.max_ticks).unwrap_or(0)
    }

    /// Whether the load-time tick scan was abandoned at its ceiling
    pub fn scan_hit_ceiling(&self) -> bool {
        self.engine
            .as_ref()
            .map(|e| e.scan_hit_ceiling)
            .unwrap_or(false)
    }

    /// Whether any voice is still sounding (engine at rest only)
    pub fn any_ringing_voices(&self) -> bool {
        self.engine
            .as_ref()
            .map(|e| e.any_ringing_voices())
            .unwrap_or(false)
    }

    /// Read a sequence variable: slots 0..=31 are global, 32..=47 private
    /// to `track` (engine at rest only)
    pub fn variable(&self, slot: i32, track: usize) -> Option<i16> {
        if track >= NUM_TRACKS || slot < 0 {
            return None;
        }
        self.engine.as_ref().map(|e| e.get_var(slot, track))
    }

    /// Write a sequence variable (engine at rest only)
    pub fn set_variable(&mut self, slot: i32, track: usize, value: i16) {
        if track >= NUM_TRACKS || slot < 0 {
            return;
        }
        if let Some(engine) = self.engine.as_mut() {
            engine.set_var(slot, track, value);
        }
    }

    /// Mute or unmute a track (takes effect when the engine is at rest)
    pub fn set_track_mute(&mut self, track: usize, mute: bool) {
        if let Some(engine) = self.engine.as_mut() {
            if track < NUM_TRACKS {
                engine.mixer.mutes[track] = mute;
            }
        }
    }

    /// Master mixer level (1.0 = unity), applied before fades
    pub fn set_mixer_volume(&mut self, volume: f32) {
        if let Some(engine) = self.engine.as_mut() {
            engine.mixer.volume = volume;
        }
    }

    /// Observe note-on/note-off events (engine at rest only)
    pub fn set_note_callback(&mut self, callback: Option<NoteCallback>) {
        if let Some(engine) = self.engine.as_mut() {
            engine.note_callback = callback;
        }
    }

    /// Observe the song ending on its own (engine at rest only)
    pub fn set_song_ended_callback(&mut self, callback: Option<SongEndedCallback>) {
        if let Some(engine) = self.engine.as_mut() {
            engine.song_ended = callback;
        }
    }

    /// The live-output ring buffer, for wiring up an audio device
    pub fn live_buffer(&self) -> Option<Arc<RingBuffer>> {
        self.live_buffer.clone()
    }

    /// Attach a WAV capture that records alongside live playback
    pub fn capture_while_playing<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.stop();
        self.join_worker();
        let engine = self.engine.as_mut().ok_or_else(engine_lost)?;
        engine.mixer.attach_capture(WavCapture::create(path, SAMPLE_RATE)?);
        Ok(())
    }

    /// Detach and finalize a capture attached with
    /// [`Self::capture_while_playing`]
    pub fn finish_capture(&mut self) -> Result<()> {
        self.stop();
        self.join_worker();
        let engine = self.engine.as_mut().ok_or_else(engine_lost)?;
        match engine.mixer.detach_capture() {
            Some(capture) => capture.finalize(),
            None => Ok(()),
        }
    }

    fn spawn_worker(&mut self, state: PlayerState) {
        let Some(engine) = self.engine.take() else {
            return;
        };
        *self.state.lock() = state;
        let flag = Arc::clone(&self.state);
        self.handle = Some(std::thread::spawn(move || run_worker(engine, flag)));
    }

    fn join_worker(&mut self) {
        if let Some(handle) = self.handle.take() {
            match handle.join() {
                Ok(engine) => self.engine = Some(engine),
                Err(_) => log::error!("playback worker panicked; engine state lost"),
            }
        }
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        *self.state.lock() = PlayerState::ShutDown;
        self.join_worker();
    }
}

fn engine_lost() -> SseqError {
    SseqError::Other("engine state lost to a worker panic".into())
}

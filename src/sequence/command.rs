//! Sequence command model and per-instruction codec
//!
//! [`SequenceCommand`] is a tagged union over every logical command kind the
//! drivers know: each variant carries exactly the parameter shape its kind
//! dictates, so an ill-shaped command cannot be represented. The modifier
//! wrappers (`Random`, `Variable`, `If`, `Time`, `TimeRandom`,
//! `TimeVariable`) own a boxed inner command plus their own trailing fields.
//!
//! [`CommandKind`] is the fieldless mirror used as the key of the platform
//! opcode tables, and [`ParamShape`] is the single source of truth for how
//! many wire bytes a kind carries. Argument counts and the effective kind of
//! a wrapped command are derived recursively, never stored.

use rand::rngs::StdRng;
use rand::Rng;

use super::platform::SequencePlatform;
use super::varlen::{read_varlen, write_varlen};
use super::wire::{WireReader, WireWriter};
use crate::{Result, SseqError};

/// How a command's parameters are read or written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterMode {
    /// Full instruction: opcode plus all parameter bytes
    Normal,
    /// The opcode byte comes from the platform's extended page
    Extended,
    /// Inner command of a `Random`/`Variable` wrapper: the wrapper supplies
    /// the trailing numeric field, so only structural fields are present
    ParametersOmitted,
}

/// A 24-bit program-relative reference carried by `Jump`/`Call`/`OpenTrack`
///
/// On the wire this is an absolute byte offset into the sequence stream; at
/// link time it is resolved to an index into the program's command list,
/// which is what the interpreter consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SequenceRef {
    /// Absolute byte offset in the encoded stream
    pub offset: u32,
    /// Command index, valid once the program is linked
    pub index: usize,
}

impl SequenceRef {
    /// Reference by wire offset (index not yet resolved)
    pub fn from_offset(offset: u32) -> Self {
        SequenceRef { offset, index: 0 }
    }

    /// Reference by command index (offset recomputed on encode)
    pub fn to_index(index: usize) -> Self {
        SequenceRef { offset: 0, index }
    }
}

/// Logical command kinds, independent of any dialect's opcode numbering
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Note,
    Wait,
    ProgramChange,
    OpenTrack,
    Jump,
    Call,
    Random,
    Variable,
    If,
    Time,
    TimeRandom,
    TimeVariable,
    Timebase,
    EnvHold,
    Monophonic,
    VelocityRange,
    BiquadType,
    BiquadValue,
    BankSelect,
    ModPhase,
    ModCurve,
    FrontBypass,
    Pan,
    Volume,
    MainVolume,
    Transpose,
    PitchBend,
    BendRange,
    Prio,
    NoteWait,
    Tie,
    Porta,
    ModDepth,
    ModSpeed,
    ModType,
    ModRange,
    PortaSw,
    PortaTime,
    Attack,
    Decay,
    Sustain,
    Release,
    LoopStart,
    Volume2,
    PrintVar,
    SurroundPan,
    LpfCutoff,
    FxSendA,
    FxSendB,
    MainSend,
    InitPan,
    Mute,
    FxSendC,
    Damper,
    ModDelay,
    Tempo,
    SweepPitch,
    ModPeriod,
    Extended,
    EnvReset,
    LoopEnd,
    Return,
    AllocateTrack,
    Fin,
    SetVar,
    AddVar,
    SubVar,
    MulVar,
    DivVar,
    ShiftVar,
    RandVar,
    AndVar,
    OrVar,
    XorVar,
    NotVar,
    ModVar,
    CmpEq,
    CmpGe,
    CmpGt,
    CmpLe,
    CmpLt,
    CmpNe,
    Mod2Curve,
    Mod2Phase,
    Mod2Depth,
    Mod2Speed,
    Mod2Type,
    Mod2Range,
    Mod2Delay,
    Mod2Period,
    Mod3Curve,
    Mod3Phase,
    Mod3Depth,
    Mod3Speed,
    Mod3Type,
    Mod3Range,
    Mod3Delay,
    Mod3Period,
    Mod4Curve,
    Mod4Phase,
    Mod4Depth,
    Mod4Speed,
    Mod4Type,
    Mod4Range,
    Mod4Delay,
    Mod4Period,
    UserCall,
}

/// Declared parameter shape of a command kind
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamShape {
    None,
    Bool,
    U8,
    S8,
    U16,
    S16,
    VarLen,
    Note,
    OpenTrack,
    Reference,
    U8S16,
    Random,
    Variable,
    If,
    Time,
    TimeRandom,
    TimeVariable,
    Extended,
}

impl CommandKind {
    /// The parameter shape dictated by this kind
    pub fn shape(self) -> ParamShape {
        use CommandKind as K;
        match self {
            K::Note => ParamShape::Note,
            K::Wait | K::ProgramChange => ParamShape::VarLen,
            K::OpenTrack => ParamShape::OpenTrack,
            K::Jump | K::Call => ParamShape::Reference,
            K::Random => ParamShape::Random,
            K::Variable => ParamShape::Variable,
            K::If => ParamShape::If,
            K::Time => ParamShape::Time,
            K::TimeRandom => ParamShape::TimeRandom,
            K::TimeVariable => ParamShape::TimeVariable,
            K::Monophonic | K::FrontBypass | K::NoteWait | K::Tie | K::PortaSw | K::Damper => {
                ParamShape::Bool
            }
            K::Transpose | K::PitchBend => ParamShape::S8,
            K::AllocateTrack => ParamShape::U16,
            K::ModDelay
            | K::Tempo
            | K::SweepPitch
            | K::ModPeriod
            | K::Mod2Delay
            | K::Mod2Period
            | K::Mod3Delay
            | K::Mod3Period
            | K::Mod4Delay
            | K::Mod4Period
            | K::UserCall => ParamShape::S16,
            K::SetVar
            | K::AddVar
            | K::SubVar
            | K::MulVar
            | K::DivVar
            | K::ShiftVar
            | K::RandVar
            | K::AndVar
            | K::OrVar
            | K::XorVar
            | K::NotVar
            | K::ModVar
            | K::CmpEq
            | K::CmpGe
            | K::CmpGt
            | K::CmpLe
            | K::CmpLt
            | K::CmpNe => ParamShape::U8S16,
            K::Extended => ParamShape::Extended,
            K::EnvReset | K::LoopEnd | K::Return | K::Fin => ParamShape::None,
            // Everything else is a single unsigned byte controller.
            _ => ParamShape::U8,
        }
    }
}

/// One decoded sequence instruction, wrappers included
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub enum SequenceCommand {
    /// Note-on: the lead byte itself is the pitch (always < 0x80)
    Note { key: u8, velocity: u8, length: u32 },
    /// Rest the track for the given number of musical ticks
    Wait(u32),
    /// Select the instrument program
    ProgramChange(u32),
    /// Enable a pre-allocated track and point it at a command
    OpenTrack { track: u8, target: SequenceRef },
    /// Unconditional branch
    Jump(SequenceRef),
    /// Branch, pushing the return cursor on the call stack
    Call(SequenceRef),

    /// The wrapped command's last argument is drawn uniformly in `[min, max)`
    Random {
        inner: Box<SequenceCommand>,
        min: i16,
        max: i16,
    },
    /// The wrapped command's last argument is read from a variable slot
    Variable { inner: Box<SequenceCommand>, slot: u8 },
    /// The wrapped command executes only if the track's comparison flag is set
    If(Box<SequenceCommand>),
    /// Alternate duration field for the wrapped command
    Time {
        inner: Box<SequenceCommand>,
        offset: i16,
    },
    /// Alternate duration drawn uniformly in `[min, max)`
    TimeRandom {
        inner: Box<SequenceCommand>,
        min: i16,
        max: i16,
    },
    /// Alternate duration read from a variable slot
    TimeVariable { inner: Box<SequenceCommand>, slot: u8 },

    Timebase(u8),
    EnvHold(u8),
    Monophonic(bool),
    VelocityRange(u8),
    BiquadType(u8),
    BiquadValue(u8),
    BankSelect(u8),
    ModPhase(u8),
    ModCurve(u8),
    FrontBypass(bool),
    Pan(u8),
    Volume(u8),
    MainVolume(u8),
    Transpose(i8),
    PitchBend(i8),
    BendRange(u8),
    Prio(u8),
    NoteWait(bool),
    Tie(bool),
    Porta(u8),
    ModDepth(u8),
    ModSpeed(u8),
    ModType(u8),
    ModRange(u8),
    PortaSw(bool),
    PortaTime(u8),
    Attack(u8),
    Decay(u8),
    Sustain(u8),
    Release(u8),
    LoopStart(u8),
    Volume2(u8),
    PrintVar(u8),
    SurroundPan(u8),
    LpfCutoff(u8),
    FxSendA(u8),
    FxSendB(u8),
    MainSend(u8),
    InitPan(u8),
    Mute(u8),
    FxSendC(u8),
    Damper(bool),
    ModDelay(i16),
    Tempo(i16),
    SweepPitch(i16),
    ModPeriod(i16),
    EnvReset,
    LoopEnd,
    Return,
    /// Bitmask of tracks eligible for `OpenTrack`
    AllocateTrack(u16),
    Fin,

    SetVar { slot: u8, value: i16 },
    AddVar { slot: u8, value: i16 },
    SubVar { slot: u8, value: i16 },
    MulVar { slot: u8, value: i16 },
    DivVar { slot: u8, value: i16 },
    ShiftVar { slot: u8, value: i16 },
    RandVar { slot: u8, value: i16 },
    AndVar { slot: u8, value: i16 },
    OrVar { slot: u8, value: i16 },
    XorVar { slot: u8, value: i16 },
    NotVar { slot: u8, value: i16 },
    ModVar { slot: u8, value: i16 },
    CmpEq { slot: u8, value: i16 },
    CmpGe { slot: u8, value: i16 },
    CmpGt { slot: u8, value: i16 },
    CmpLe { slot: u8, value: i16 },
    CmpLt { slot: u8, value: i16 },
    CmpNe { slot: u8, value: i16 },

    Mod2Curve(u8),
    Mod2Phase(u8),
    Mod2Depth(u8),
    Mod2Speed(u8),
    Mod2Type(u8),
    Mod2Range(u8),
    Mod2Delay(i16),
    Mod2Period(i16),
    Mod3Curve(u8),
    Mod3Phase(u8),
    Mod3Depth(u8),
    Mod3Speed(u8),
    Mod3Type(u8),
    Mod3Range(u8),
    Mod3Delay(i16),
    Mod3Period(i16),
    Mod4Curve(u8),
    Mod4Phase(u8),
    Mod4Depth(u8),
    Mod4Speed(u8),
    Mod4Type(u8),
    Mod4Range(u8),
    Mod4Delay(i16),
    Mod4Period(i16),
    UserCall(i16),
}

impl SequenceCommand {
    /// The logical kind of this command (outermost wrapper included)
    pub fn kind(&self) -> CommandKind {
        use CommandKind as K;
        use SequenceCommand as C;
        match self {
            C::Note { .. } => K::Note,
            C::Wait(_) => K::Wait,
            C::ProgramChange(_) => K::ProgramChange,
            C::OpenTrack { .. } => K::OpenTrack,
            C::Jump(_) => K::Jump,
            C::Call(_) => K::Call,
            C::Random { .. } => K::Random,
            C::Variable { .. } => K::Variable,
            C::If(_) => K::If,
            C::Time { .. } => K::Time,
            C::TimeRandom { .. } => K::TimeRandom,
            C::TimeVariable { .. } => K::TimeVariable,
            C::Timebase(_) => K::Timebase,
            C::EnvHold(_) => K::EnvHold,
            C::Monophonic(_) => K::Monophonic,
            C::VelocityRange(_) => K::VelocityRange,
            C::BiquadType(_) => K::BiquadType,
            C::BiquadValue(_) => K::BiquadValue,
            C::BankSelect(_) => K::BankSelect,
            C::ModPhase(_) => K::ModPhase,
            C::ModCurve(_) => K::ModCurve,
            C::FrontBypass(_) => K::FrontBypass,
            C::Pan(_) => K::Pan,
            C::Volume(_) => K::Volume,
            C::MainVolume(_) => K::MainVolume,
            C::Transpose(_) => K::Transpose,
            C::PitchBend(_) => K::PitchBend,
            C::BendRange(_) => K::BendRange,
            C::Prio(_) => K::Prio,
            C::NoteWait(_) => K::NoteWait,
            C::Tie(_) => K::Tie,
            C::Porta(_) => K::Porta,
            C::ModDepth(_) => K::ModDepth,
            C::ModSpeed(_) => K::ModSpeed,
            C::ModType(_) => K::ModType,
            C::ModRange(_) => K::ModRange,
            C::PortaSw(_) => K::PortaSw,
            C::PortaTime(_) => K::PortaTime,
            C::Attack(_) => K::Attack,
            C::Decay(_) => K::Decay,
            C::Sustain(_) => K::Sustain,
            C::Release(_) => K::Release,
            C::LoopStart(_) => K::LoopStart,
            C::Volume2(_) => K::Volume2,
            C::PrintVar(_) => K::PrintVar,
            C::SurroundPan(_) => K::SurroundPan,
            C::LpfCutoff(_) => K::LpfCutoff,
            C::FxSendA(_) => K::FxSendA,
            C::FxSendB(_) => K::FxSendB,
            C::MainSend(_) => K::MainSend,
            C::InitPan(_) => K::InitPan,
            C::Mute(_) => K::Mute,
            C::FxSendC(_) => K::FxSendC,
            C::Damper(_) => K::Damper,
            C::ModDelay(_) => K::ModDelay,
            C::Tempo(_) => K::Tempo,
            C::SweepPitch(_) => K::SweepPitch,
            C::ModPeriod(_) => K::ModPeriod,
            C::EnvReset => K::EnvReset,
            C::LoopEnd => K::LoopEnd,
            C::Return => K::Return,
            C::AllocateTrack(_) => K::AllocateTrack,
            C::Fin => K::Fin,
            C::SetVar { .. } => K::SetVar,
            C::AddVar { .. } => K::AddVar,
            C::SubVar { .. } => K::SubVar,
            C::MulVar { .. } => K::MulVar,
            C::DivVar { .. } => K::DivVar,
            C::ShiftVar { .. } => K::ShiftVar,
            C::RandVar { .. } => K::RandVar,
            C::AndVar { .. } => K::AndVar,
            C::OrVar { .. } => K::OrVar,
            C::XorVar { .. } => K::XorVar,
            C::NotVar { .. } => K::NotVar,
            C::ModVar { .. } => K::ModVar,
            C::CmpEq { .. } => K::CmpEq,
            C::CmpGe { .. } => K::CmpGe,
            C::CmpGt { .. } => K::CmpGt,
            C::CmpLe { .. } => K::CmpLe,
            C::CmpLt { .. } => K::CmpLt,
            C::CmpNe { .. } => K::CmpNe,
            C::Mod2Curve(_) => K::Mod2Curve,
            C::Mod2Phase(_) => K::Mod2Phase,
            C::Mod2Depth(_) => K::Mod2Depth,
            C::Mod2Speed(_) => K::Mod2Speed,
            C::Mod2Type(_) => K::Mod2Type,
            C::Mod2Range(_) => K::Mod2Range,
            C::Mod2Delay(_) => K::Mod2Delay,
            C::Mod2Period(_) => K::Mod2Period,
            C::Mod3Curve(_) => K::Mod3Curve,
            C::Mod3Phase(_) => K::Mod3Phase,
            C::Mod3Depth(_) => K::Mod3Depth,
            C::Mod3Speed(_) => K::Mod3Speed,
            C::Mod3Type(_) => K::Mod3Type,
            C::Mod3Range(_) => K::Mod3Range,
            C::Mod3Delay(_) => K::Mod3Delay,
            C::Mod3Period(_) => K::Mod3Period,
            C::Mod4Curve(_) => K::Mod4Curve,
            C::Mod4Phase(_) => K::Mod4Phase,
            C::Mod4Depth(_) => K::Mod4Depth,
            C::Mod4Speed(_) => K::Mod4Speed,
            C::Mod4Type(_) => K::Mod4Type,
            C::Mod4Range(_) => K::Mod4Range,
            C::Mod4Delay(_) => K::Mod4Delay,
            C::Mod4Period(_) => K::Mod4Period,
            C::UserCall(_) => K::UserCall,
        }
    }

    /// The base kind after stripping all modifier wrappers
    pub fn effective_kind(&self) -> CommandKind {
        match self {
            SequenceCommand::Random { inner, .. }
            | SequenceCommand::TimeRandom { inner, .. }
            | SequenceCommand::Variable { inner, .. }
            | SequenceCommand::TimeVariable { inner, .. }
            | SequenceCommand::Time { inner, .. } => inner.effective_kind(),
            SequenceCommand::If(inner) => inner.effective_kind(),
            _ => self.kind(),
        }
    }

    /// Number of runtime arguments this command yields
    ///
    /// The base kind's fixed count, plus one for each `Time`-family wrapper;
    /// `Random`/`Variable` wrappers substitute the last argument rather than
    /// adding one.
    pub fn num_arguments(&self) -> usize {
        match self {
            SequenceCommand::Random { inner, .. } | SequenceCommand::Variable { inner, .. } => {
                inner.num_arguments()
            }
            SequenceCommand::Time { inner, .. }
            | SequenceCommand::TimeRandom { inner, .. }
            | SequenceCommand::TimeVariable { inner, .. } => inner.num_arguments() + 1,
            SequenceCommand::If(inner) => inner.num_arguments(),
            _ => match self.kind().shape() {
                ParamShape::None => 0,
                ParamShape::Note => 3,
                ParamShape::OpenTrack | ParamShape::U8S16 => 2,
                _ => 1,
            },
        }
    }

    /// Resolve runtime argument `n`, drawing random values as needed
    ///
    /// `Variable`/`TimeVariable` wrappers yield the slot number; converting
    /// the slot to its current value is the interpreter's job.
    pub fn argument(&self, n: usize, rng: &mut StdRng) -> i32 {
        use SequenceCommand as C;
        match self {
            C::Note {
                key,
                velocity,
                length,
            } => match n {
                0 => *key as i32,
                1 => *velocity as i32,
                _ => *length as i32,
            },
            C::Wait(v) | C::ProgramChange(v) => *v as i32,
            C::OpenTrack { track, target } => match n {
                0 => *track as i32,
                _ => target.index as i32,
            },
            C::Jump(target) | C::Call(target) => target.index as i32,
            C::Random { inner, min, max } | C::TimeRandom { inner, min, max } => {
                if n + 1 == self.num_arguments() {
                    draw_random(rng, *min, *max)
                } else {
                    inner.argument(n, rng)
                }
            }
            C::Variable { inner, slot } | C::TimeVariable { inner, slot } => {
                if n + 1 == self.num_arguments() {
                    *slot as i32
                } else {
                    inner.argument(n, rng)
                }
            }
            C::If(inner) => inner.argument(n, rng),
            C::Time { inner, offset } => {
                if n + 1 == self.num_arguments() {
                    *offset as i32
                } else {
                    inner.argument(n, rng)
                }
            }
            C::Monophonic(b)
            | C::FrontBypass(b)
            | C::NoteWait(b)
            | C::Tie(b)
            | C::PortaSw(b)
            | C::Damper(b) => *b as i32,
            C::Transpose(v) | C::PitchBend(v) => *v as i32,
            C::AllocateTrack(v) => *v as i32,
            C::ModDelay(v)
            | C::Tempo(v)
            | C::SweepPitch(v)
            | C::ModPeriod(v)
            | C::Mod2Delay(v)
            | C::Mod2Period(v)
            | C::Mod3Delay(v)
            | C::Mod3Period(v)
            | C::Mod4Delay(v)
            | C::Mod4Period(v)
            | C::UserCall(v) => *v as i32,
            C::SetVar { slot, value }
            | C::AddVar { slot, value }
            | C::SubVar { slot, value }
            | C::MulVar { slot, value }
            | C::DivVar { slot, value }
            | C::ShiftVar { slot, value }
            | C::RandVar { slot, value }
            | C::AndVar { slot, value }
            | C::OrVar { slot, value }
            | C::XorVar { slot, value }
            | C::NotVar { slot, value }
            | C::ModVar { slot, value }
            | C::CmpEq { slot, value }
            | C::CmpGe { slot, value }
            | C::CmpGt { slot, value }
            | C::CmpLe { slot, value }
            | C::CmpLt { slot, value }
            | C::CmpNe { slot, value } => match n {
                0 => *slot as i32,
                _ => *value as i32,
            },
            C::EnvReset | C::LoopEnd | C::Return | C::Fin => 0,
            C::Timebase(v)
            | C::EnvHold(v)
            | C::VelocityRange(v)
            | C::BiquadType(v)
            | C::BiquadValue(v)
            | C::BankSelect(v)
            | C::ModPhase(v)
            | C::ModCurve(v)
            | C::Pan(v)
            | C::Volume(v)
            | C::MainVolume(v)
            | C::BendRange(v)
            | C::Prio(v)
            | C::Porta(v)
            | C::ModDepth(v)
            | C::ModSpeed(v)
            | C::ModType(v)
            | C::ModRange(v)
            | C::PortaTime(v)
            | C::Attack(v)
            | C::Decay(v)
            | C::Sustain(v)
            | C::Release(v)
            | C::LoopStart(v)
            | C::Volume2(v)
            | C::PrintVar(v)
            | C::SurroundPan(v)
            | C::LpfCutoff(v)
            | C::FxSendA(v)
            | C::FxSendB(v)
            | C::MainSend(v)
            | C::InitPan(v)
            | C::Mute(v)
            | C::FxSendC(v)
            | C::Mod2Curve(v)
            | C::Mod2Phase(v)
            | C::Mod2Depth(v)
            | C::Mod2Speed(v)
            | C::Mod2Type(v)
            | C::Mod2Range(v)
            | C::Mod3Curve(v)
            | C::Mod3Phase(v)
            | C::Mod3Depth(v)
            | C::Mod3Speed(v)
            | C::Mod3Type(v)
            | C::Mod3Range(v)
            | C::Mod4Curve(v)
            | C::Mod4Phase(v)
            | C::Mod4Depth(v)
            | C::Mod4Speed(v)
            | C::Mod4Type(v)
            | C::Mod4Range(v) => *v as i32,
        }
    }

    /// Shared reference to the innermost jump/call/open-track target, if any
    pub fn reference(&self) -> Option<&SequenceRef> {
        use SequenceCommand as C;
        match self {
            C::Jump(r) | C::Call(r) => Some(r),
            C::OpenTrack { target, .. } => Some(target),
            C::Random { inner, .. }
            | C::TimeRandom { inner, .. }
            | C::Variable { inner, .. }
            | C::TimeVariable { inner, .. }
            | C::Time { inner, .. } => inner.reference(),
            C::If(inner) => inner.reference(),
            _ => None,
        }
    }

    /// Mutable reference to the innermost jump/call/open-track target, if any
    pub fn reference_mut(&mut self) -> Option<&mut SequenceRef> {
        use SequenceCommand as C;
        match self {
            C::Jump(r) | C::Call(r) => Some(r),
            C::OpenTrack { target, .. } => Some(target),
            C::Random { inner, .. }
            | C::TimeRandom { inner, .. }
            | C::Variable { inner, .. }
            | C::TimeVariable { inner, .. }
            | C::Time { inner, .. } => inner.reference_mut(),
            C::If(inner) => inner.reference_mut(),
            _ => None,
        }
    }

    /// Decode one instruction, wrappers included, advancing the reader past
    /// exactly the bytes that belong to it
    pub fn decode(
        r: &mut WireReader,
        platform: &dyn SequencePlatform,
        mode: ParameterMode,
    ) -> Result<SequenceCommand> {
        let opcode_offset = r.position();
        let ident = r.read_u8()?;

        let kind = if mode == ParameterMode::Extended {
            platform
                .extended_kind(ident)
                .ok_or(SseqError::UnknownExtendedOpcode {
                    opcode: ident,
                    offset: opcode_offset,
                })?
        } else if ident < 0x80 {
            CommandKind::Note
        } else {
            platform.primary_kind(ident).ok_or(SseqError::UnknownOpcode {
                opcode: ident,
                offset: opcode_offset,
            })?
        };

        let omitted = mode == ParameterMode::ParametersOmitted;

        let cmd = match kind.shape() {
            ParamShape::Note => {
                let velocity = r.read_u8()?;
                let length = if omitted { 0 } else { read_varlen(r)? };
                SequenceCommand::Note {
                    key: ident,
                    velocity,
                    length,
                }
            }
            ParamShape::OpenTrack => {
                let track = r.read_u8()?;
                let target = if omitted {
                    SequenceRef::default()
                } else {
                    SequenceRef::from_offset(r.read_u24()?)
                };
                SequenceCommand::OpenTrack { track, target }
            }
            ParamShape::VarLen => {
                let v = if omitted { 0 } else { read_varlen(r)? };
                from_varlen(kind, v)?
            }
            ParamShape::Reference => {
                let target = if omitted {
                    SequenceRef::default()
                } else {
                    SequenceRef::from_offset(r.read_u24()?)
                };
                match kind {
                    CommandKind::Jump => SequenceCommand::Jump(target),
                    _ => SequenceCommand::Call(target),
                }
            }
            ParamShape::Random => {
                let inner = Box::new(Self::decode(r, platform, ParameterMode::ParametersOmitted)?);
                let min = r.read_i16()?;
                let max = r.read_i16()?;
                SequenceCommand::Random { inner, min, max }
            }
            ParamShape::Variable => {
                let inner = Box::new(Self::decode(r, platform, ParameterMode::ParametersOmitted)?);
                let slot = r.read_u8()?;
                SequenceCommand::Variable { inner, slot }
            }
            ParamShape::If => {
                let inner = Box::new(Self::decode(r, platform, ParameterMode::Normal)?);
                SequenceCommand::If(inner)
            }
            ParamShape::Time => {
                let inner = Box::new(Self::decode(r, platform, ParameterMode::Normal)?);
                let offset = r.read_i16()?;
                SequenceCommand::Time { inner, offset }
            }
            ParamShape::TimeRandom => {
                let inner = Box::new(Self::decode(r, platform, ParameterMode::Normal)?);
                let min = r.read_i16()?;
                let max = r.read_i16()?;
                SequenceCommand::TimeRandom { inner, min, max }
            }
            ParamShape::TimeVariable => {
                let inner = Box::new(Self::decode(r, platform, ParameterMode::Normal)?);
                let slot = r.read_u8()?;
                SequenceCommand::TimeVariable { inner, slot }
            }
            ParamShape::U8 => {
                let v = if omitted { 0 } else { r.read_u8()? };
                from_u8(kind, v)?
            }
            ParamShape::S8 => {
                let v = if omitted { 0 } else { r.read_i8()? };
                from_s8(kind, v)?
            }
            ParamShape::Bool => {
                let v = if omitted { false } else { r.read_bool()? };
                from_bool(kind, v)?
            }
            ParamShape::U16 => {
                let v = if omitted { 0 } else { r.read_u16()? };
                SequenceCommand::AllocateTrack(v)
            }
            ParamShape::S16 => {
                let v = if omitted { 0 } else { r.read_i16()? };
                from_s16(kind, v)?
            }
            ParamShape::U8S16 => {
                let slot = r.read_u8()?;
                let value = if omitted { 0 } else { r.read_i16()? };
                from_u8s16(kind, slot, value)?
            }
            ParamShape::None => from_unit(kind)?,
            ParamShape::Extended => Self::decode(r, platform, ParameterMode::Extended)?,
        };

        Ok(cmd)
    }

    /// Encode one instruction, the exact inverse of [`Self::decode`]
    pub fn encode(
        &self,
        w: &mut WireWriter,
        platform: &dyn SequencePlatform,
        mode: ParameterMode,
    ) -> Result<()> {
        let kind = self.kind();

        // Opcode byte(s).
        if mode != ParameterMode::Extended {
            if let SequenceCommand::Note { key, .. } = self {
                w.write_u8(*key);
            } else if let Some(ext) = platform.extended_opcode(kind) {
                let escape = platform
                    .primary_opcode(CommandKind::Extended)
                    .ok_or_else(|| {
                        SseqError::Other(format!(
                            "platform maps {:?} as extended but has no extended escape opcode",
                            kind
                        ))
                    })?;
                w.write_u8(escape);
                w.write_u8(ext);
            } else {
                let opcode = platform.primary_opcode(kind).ok_or_else(|| {
                    SseqError::Other(format!("command {:?} is not encodable on this platform", kind))
                })?;
                w.write_u8(opcode);
            }
        } else {
            let ext = platform.extended_opcode(kind).ok_or_else(|| {
                SseqError::Other(format!("command {:?} has no extended opcode", kind))
            })?;
            w.write_u8(ext);
        }

        let omitted = mode == ParameterMode::ParametersOmitted;

        use SequenceCommand as C;
        match self {
            C::Note {
                velocity, length, ..
            } => {
                w.write_u8(*velocity);
                if !omitted {
                    write_varlen(w, *length);
                }
            }
            C::OpenTrack { track, target } => {
                w.write_u8(*track);
                if !omitted {
                    w.write_u24(target.offset);
                }
            }
            C::Wait(v) | C::ProgramChange(v) => {
                if !omitted {
                    write_varlen(w, *v);
                }
            }
            C::Jump(target) | C::Call(target) => {
                if !omitted {
                    w.write_u24(target.offset);
                }
            }
            C::Random { inner, min, max } => {
                inner.encode(w, platform, ParameterMode::ParametersOmitted)?;
                w.write_i16(*min);
                w.write_i16(*max);
            }
            C::Variable { inner, slot } => {
                inner.encode(w, platform, ParameterMode::ParametersOmitted)?;
                w.write_u8(*slot);
            }
            C::If(inner) => {
                inner.encode(w, platform, ParameterMode::Normal)?;
            }
            C::Time { inner, offset } => {
                inner.encode(w, platform, ParameterMode::Normal)?;
                w.write_i16(*offset);
            }
            C::TimeRandom { inner, min, max } => {
                inner.encode(w, platform, ParameterMode::Normal)?;
                w.write_i16(*min);
                w.write_i16(*max);
            }
            C::TimeVariable { inner, slot } => {
                inner.encode(w, platform, ParameterMode::Normal)?;
                w.write_u8(*slot);
            }
            C::Monophonic(b)
            | C::FrontBypass(b)
            | C::NoteWait(b)
            | C::Tie(b)
            | C::PortaSw(b)
            | C::Damper(b) => {
                if !omitted {
                    w.write_bool(*b);
                }
            }
            C::Transpose(v) | C::PitchBend(v) => {
                if !omitted {
                    w.write_i8(*v);
                }
            }
            C::AllocateTrack(v) => {
                if !omitted {
                    w.write_u16(*v);
                }
            }
            C::ModDelay(v)
            | C::Tempo(v)
            | C::SweepPitch(v)
            | C::ModPeriod(v)
            | C::Mod2Delay(v)
            | C::Mod2Period(v)
            | C::Mod3Delay(v)
            | C::Mod3Period(v)
            | C::Mod4Delay(v)
            | C::Mod4Period(v)
            | C::UserCall(v) => {
                if !omitted {
                    w.write_i16(*v);
                }
            }
            C::SetVar { slot, value }
            | C::AddVar { slot, value }
            | C::SubVar { slot, value }
            | C::MulVar { slot, value }
            | C::DivVar { slot, value }
            | C::ShiftVar { slot, value }
            | C::RandVar { slot, value }
            | C::AndVar { slot, value }
            | C::OrVar { slot, value }
            | C::XorVar { slot, value }
            | C::NotVar { slot, value }
            | C::ModVar { slot, value }
            | C::CmpEq { slot, value }
            | C::CmpGe { slot, value }
            | C::CmpGt { slot, value }
            | C::CmpLe { slot, value }
            | C::CmpLt { slot, value }
            | C::CmpNe { slot, value } => {
                w.write_u8(*slot);
                if !omitted {
                    w.write_i16(*value);
                }
            }
            C::EnvReset | C::LoopEnd | C::Return | C::Fin => {}
            C::Timebase(v)
            | C::EnvHold(v)
            | C::VelocityRange(v)
            | C::BiquadType(v)
            | C::BiquadValue(v)
            | C::BankSelect(v)
            | C::ModPhase(v)
            | C::ModCurve(v)
            | C::Pan(v)
            | C::Volume(v)
            | C::MainVolume(v)
            | C::BendRange(v)
            | C::Prio(v)
            | C::Porta(v)
            | C::ModDepth(v)
            | C::ModSpeed(v)
            | C::ModType(v)
            | C::ModRange(v)
            | C::PortaTime(v)
            | C::Attack(v)
            | C::Decay(v)
            | C::Sustain(v)
            | C::Release(v)
            | C::LoopStart(v)
            | C::Volume2(v)
            | C::PrintVar(v)
            | C::SurroundPan(v)
            | C::LpfCutoff(v)
            | C::FxSendA(v)
            | C::FxSendB(v)
            | C::MainSend(v)
            | C::InitPan(v)
            | C::Mute(v)
            | C::FxSendC(v)
            | C::Mod2Curve(v)
            | C::Mod2Phase(v)
            | C::Mod2Depth(v)
            | C::Mod2Speed(v)
            | C::Mod2Type(v)
            | C::Mod2Range(v)
            | C::Mod3Curve(v)
            | C::Mod3Phase(v)
            | C::Mod3Depth(v)
            | C::Mod3Speed(v)
            | C::Mod3Type(v)
            | C::Mod3Range(v)
            | C::Mod4Curve(v)
            | C::Mod4Phase(v)
            | C::Mod4Depth(v)
            | C::Mod4Speed(v)
            | C::Mod4Type(v)
            | C::Mod4Range(v) => {
                if !omitted {
                    w.write_u8(*v);
                }
            }
        }

        Ok(())
    }
}

/// Draw the value of a `Random` wrapper: uniform in `[min, max)`
fn draw_random(rng: &mut StdRng, min: i16, max: i16) -> i32 {
    if max > min {
        rng.gen_range(min..max) as i32
    } else {
        min as i32
    }
}

fn shape_mismatch(kind: CommandKind) -> SseqError {
    SseqError::Other(format!("parameter shape mismatch for {:?}", kind))
}

fn from_varlen(kind: CommandKind, v: u32) -> Result<SequenceCommand> {
    match kind {
        CommandKind::Wait => Ok(SequenceCommand::Wait(v)),
        CommandKind::ProgramChange => Ok(SequenceCommand::ProgramChange(v)),
        _ => Err(shape_mismatch(kind)),
    }
}

fn from_bool(kind: CommandKind, v: bool) -> Result<SequenceCommand> {
    use CommandKind as K;
    use SequenceCommand as C;
    Ok(match kind {
        K::Monophonic => C::Monophonic(v),
        K::FrontBypass => C::FrontBypass(v),
        K::NoteWait => C::NoteWait(v),
        K::Tie => C::Tie(v),
        K::PortaSw => C::PortaSw(v),
        K::Damper => C::Damper(v),
        _ => return Err(shape_mismatch(kind)),
    })
}

fn from_s8(kind: CommandKind, v: i8) -> Result<SequenceCommand> {
    match kind {
        CommandKind::Transpose => Ok(SequenceCommand::Transpose(v)),
        CommandKind::PitchBend => Ok(SequenceCommand::PitchBend(v)),
        _ => Err(shape_mismatch(kind)),
    }
}

fn from_s16(kind: CommandKind, v: i16) -> Result<SequenceCommand> {
    use CommandKind as K;
    use SequenceCommand as C;
    Ok(match kind {
        K::ModDelay => C::ModDelay(v),
        K::Tempo => C::Tempo(v),
        K::SweepPitch => C::SweepPitch(v),
        K::ModPeriod => C::ModPeriod(v),
        K::Mod2Delay => C::Mod2Delay(v),
        K::Mod2Period => C::Mod2Period(v),
        K::Mod3Delay => C::Mod3Delay(v),
        K::Mod3Period => C::Mod3Period(v),
        K::Mod4Delay => C::Mod4Delay(v),
        K::Mod4Period => C::Mod4Period(v),
        K::UserCall => C::UserCall(v),
        _ => return Err(shape_mismatch(kind)),
    })
}

fn from_u8s16(kind: CommandKind, slot: u8, value: i16) -> Result<SequenceCommand> {
    use CommandKind as K;
    use SequenceCommand as C;
    Ok(match kind {
        K::SetVar => C::SetVar { slot, value },
        K::AddVar => C::AddVar { slot, value },
        K::SubVar => C::SubVar { slot, value },
        K::MulVar => C::MulVar { slot, value },
        K::DivVar => C::DivVar { slot, value },
        K::ShiftVar => C::ShiftVar { slot, value },
        K::RandVar => C::RandVar { slot, value },
        K::AndVar => C::AndVar { slot, value },
        K::OrVar => C::OrVar { slot, value },
        K::XorVar => C::XorVar { slot, value },
        K::NotVar => C::NotVar { slot, value },
        K::ModVar => C::ModVar { slot, value },
        K::CmpEq => C::CmpEq { slot, value },
        K::CmpGe => C::CmpGe { slot, value },
        K::CmpGt => C::CmpGt { slot, value },
        K::CmpLe => C::CmpLe { slot, value },
        K::CmpLt => C::CmpLt { slot, value },
        K::CmpNe => C::CmpNe { slot, value },
        _ => return Err(shape_mismatch(kind)),
    })
}

fn from_unit(kind: CommandKind) -> Result<SequenceCommand> {
    use CommandKind as K;
    use SequenceCommand as C;
    Ok(match kind {
        K::EnvReset => C::EnvReset,
        K::LoopEnd => C::LoopEnd,
        K::Return => C::Return,
        K::Fin => C::Fin,
        _ => return Err(shape_mismatch(kind)),
    })
}

fn from_u8(kind: CommandKind, v: u8) -> Result<SequenceCommand> {
    use CommandKind as K;
    use SequenceCommand as C;
    Ok(match kind {
        K::Timebase => C::Timebase(v),
        K::EnvHold => C::EnvHold(v),
        K::VelocityRange => C::VelocityRange(v),
        K::BiquadType => C::BiquadType(v),
        K::BiquadValue => C::BiquadValue(v),
        K::BankSelect => C::BankSelect(v),
        K::ModPhase => C::ModPhase(v),
        K::ModCurve => C::ModCurve(v),
        K::Pan => C::Pan(v),
        K::Volume => C::Volume(v),
        K::MainVolume => C::MainVolume(v),
        K::BendRange => C::BendRange(v),
        K::Prio => C::Prio(v),
        K::Porta => C::Porta(v),
        K::ModDepth => C::ModDepth(v),
        K::ModSpeed => C::ModSpeed(v),
        K::ModType => C::ModType(v),
        K::ModRange => C::ModRange(v),
        K::PortaTime => C::PortaTime(v),
        K::Attack => C::Attack(v),
        K::Decay => C::Decay(v),
        K::Sustain => C::Sustain(v),
        K::Release => C::Release(v),
        K::LoopStart => C::LoopStart(v),
        K::Volume2 => C::Volume2(v),
        K::PrintVar => C::PrintVar(v),
        K::SurroundPan => C::SurroundPan(v),
        K::LpfCutoff => C::LpfCutoff(v),
        K::FxSendA => C::FxSendA(v),
        K::FxSendB => C::FxSendB(v),
        K::MainSend => C::MainSend(v),
        K::InitPan => C::InitPan(v),
        K::Mute => C::Mute(v),
        K::FxSendC => C::FxSendC(v),
        K::Mod2Curve => C::Mod2Curve(v),
        K::Mod2Phase => C::Mod2Phase(v),
        K::Mod2Depth => C::Mod2Depth(v),
        K::Mod2Speed => C::Mod2Speed(v),
        K::Mod2Type => C::Mod2Type(v),
        K::Mod2Range => C::Mod2Range(v),
        K::Mod3Curve => C::Mod3Curve(v),
        K::Mod3Phase => C::Mod3Phase(v),
        K::Mod3Depth => C::Mod3Depth(v),
        K::Mod3Speed => C::Mod3Speed(v),
        K::Mod3Type => C::Mod3Type(v),
        K::Mod3Range => C::Mod3Range(v),
        K::Mod4Curve => C::Mod4Curve(v),
        K::Mod4Phase => C::Mod4Phase(v),
        K::Mod4Depth => C::Mod4Depth(v),
        K::Mod4Speed => C::Mod4Speed(v),
        K::Mod4Type => C::Mod4Type(v),
        K::Mod4Range => C::Mod4Range(v),
        _ => return Err(shape_mismatch(kind)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::platform::{Nitro, Revolution};
    use crate::sequence::wire::ByteOrder;
    use rand::SeedableRng;

    fn round_trip(cmd: &SequenceCommand, platform: &dyn SequencePlatform) -> SequenceCommand {
        let mut w = WireWriter::new(platform.byte_order());
        cmd.encode(&mut w, platform, ParameterMode::Normal).unwrap();
        let bytes = w.into_bytes();
        let mut r = WireReader::new(&bytes, platform.byte_order());
        let decoded = SequenceCommand::decode(&mut r, platform, ParameterMode::Normal).unwrap();
        assert!(r.is_at_end(), "command left {} unread bytes", r.remaining());
        decoded
    }

    #[test]
    fn test_note_round_trip() {
        let cmd = SequenceCommand::Note {
            key: 60,
            velocity: 100,
            length: 300,
        };
        assert_eq!(round_trip(&cmd, &Nitro), cmd);
        assert_eq!(round_trip(&cmd, &Revolution), cmd);
    }

    #[test]
    fn test_wrapped_command_round_trip() {
        // volume_r 20, 80
        let cmd = SequenceCommand::Random {
            inner: Box::new(SequenceCommand::Volume(0)),
            min: 20,
            max: 80,
        };
        assert_eq!(round_trip(&cmd, &Nitro), cmd);

        // wait_v 35
        let cmd = SequenceCommand::Variable {
            inner: Box::new(SequenceCommand::Wait(0)),
            slot: 35,
        };
        assert_eq!(round_trip(&cmd, &Nitro), cmd);

        // pan_t_if 64, 12
        let cmd = SequenceCommand::If(Box::new(SequenceCommand::Time {
            inner: Box::new(SequenceCommand::Pan(64)),
            offset: 12,
        }));
        assert_eq!(round_trip(&cmd, &Revolution), cmd);
    }

    #[test]
    fn test_extended_opcode_round_trip() {
        // SetVar lives on the Revolution extended page.
        let cmd = SequenceCommand::SetVar { slot: 3, value: -5 };
        let mut w = WireWriter::new(ByteOrder::BigEndian);
        cmd.encode(&mut w, &Revolution, ParameterMode::Normal).unwrap();
        let bytes = w.into_bytes();
        assert_eq!(bytes[0], 0xF0);
        assert_eq!(bytes[1], 0x80);
        let mut r = WireReader::new(&bytes, ByteOrder::BigEndian);
        assert_eq!(
            SequenceCommand::decode(&mut r, &Revolution, ParameterMode::Normal).unwrap(),
            cmd
        );
    }

    #[test]
    fn test_effective_kind_strips_wrappers() {
        let cmd = SequenceCommand::If(Box::new(SequenceCommand::TimeRandom {
            inner: Box::new(SequenceCommand::Random {
                inner: Box::new(SequenceCommand::Note {
                    key: 64,
                    velocity: 90,
                    length: 0,
                }),
                min: 1,
                max: 10,
            }),
            min: 0,
            max: 4,
        }));
        assert_eq!(cmd.effective_kind(), CommandKind::Note);
        // Note contributes 3, the Time wrapper one more; Random substitutes.
        assert_eq!(cmd.num_arguments(), 4);
    }

    #[test]
    fn test_argument_resolution_with_wrappers() {
        let mut rng = StdRng::seed_from_u64(7);
        let cmd = SequenceCommand::Random {
            inner: Box::new(SequenceCommand::Volume(0)),
            min: 40,
            max: 41,
        };
        // Single-value range always draws the minimum.
        assert_eq!(cmd.argument(0, &mut rng), 40);

        let cmd = SequenceCommand::Time {
            inner: Box::new(SequenceCommand::Note {
                key: 60,
                velocity: 100,
                length: 48,
            }),
            offset: 96,
        };
        assert_eq!(cmd.argument(0, &mut rng), 60);
        assert_eq!(cmd.argument(2, &mut rng), 48);
        assert_eq!(cmd.argument(3, &mut rng), 96);
    }

    #[test]
    fn test_unknown_opcode_reports_byte_and_offset() {
        // 0xE2 is unused on Nitro.
        let bytes = [0xE2u8];
        let mut r = WireReader::new(&bytes, ByteOrder::LittleEndian);
        match SequenceCommand::decode(&mut r, &Nitro, ParameterMode::Normal) {
            Err(SseqError::UnknownOpcode { opcode, offset }) => {
                assert_eq!(opcode, 0xE2);
                assert_eq!(offset, 0);
            }
            other => panic!("expected unknown opcode, got {:?}", other),
        }
    }

    #[test]
    fn test_truncated_command_fails() {
        // Note opcode with velocity but a missing length.
        let bytes = [60u8, 100];
        let mut r = WireReader::new(&bytes, ByteOrder::LittleEndian);
        assert!(matches!(
            SequenceCommand::decode(&mut r, &Nitro, ParameterMode::Normal),
            Err(SseqError::Truncated { .. })
        ));
    }

    #[test]
    fn test_omitted_mode_keeps_structural_fields() {
        // Inner note of a random wrapper: pitch and velocity are present,
        // the length is supplied by the wrapper.
        let cmd = SequenceCommand::Random {
            inner: Box::new(SequenceCommand::Note {
                key: 0x40,
                velocity: 0x60,
                length: 0,
            }),
            min: 10,
            max: 20,
        };
        let mut w = WireWriter::new(ByteOrder::LittleEndian);
        cmd.encode(&mut w, &Nitro, ParameterMode::Normal).unwrap();
        let bytes = w.into_bytes();
        // random opcode, key, velocity, min (2), max (2)
        assert_eq!(bytes.len(), 7);
        assert_eq!(bytes[0], 0xA0);
        assert_eq!(bytes[1], 0x40);
        assert_eq!(bytes[2], 0x60);
    }

    #[test]
    fn test_byte_order_of_wire_fields() {
        let cmd = SequenceCommand::Tempo(0x0102);
        let mut w = WireWriter::new(ByteOrder::LittleEndian);
        cmd.encode(&mut w, &Nitro, ParameterMode::Normal).unwrap();
        assert_eq!(w.into_bytes(), vec![0xE1, 0x02, 0x01]);

        let mut w = WireWriter::new(ByteOrder::BigEndian);
        cmd.encode(&mut w, &Revolution, ParameterMode::Normal).unwrap();
        assert_eq!(w.into_bytes(), vec![0xE1, 0x01, 0x02]);
    }
}

//! Dialect opcode tables
//!
//! A [`SequencePlatform`] supplies the bidirectional command-kind <-> wire
//! byte mapping, the extended-opcode page (if the dialect has one) and the
//! byte order of multi-byte fields. The codec is written entirely against
//! this trait; adding a platform means writing two tables.

use super::command::CommandKind;
use super::wire::ByteOrder;

/// Per-dialect opcode tables and byte order
pub trait SequencePlatform {
    /// Primary opcode table: logical kind to wire byte
    fn command_map(&self) -> &'static [(CommandKind, u8)];

    /// Extended opcode page, selected by the `Extended` escape opcode
    fn extended_map(&self) -> &'static [(CommandKind, u8)] {
        &[]
    }

    /// Byte order of multi-byte wire fields
    fn byte_order(&self) -> ByteOrder;

    /// Wire byte for `kind` in the primary table
    fn primary_opcode(&self, kind: CommandKind) -> Option<u8> {
        self.command_map()
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, op)| *op)
    }

    /// Kind for a primary wire byte
    fn primary_kind(&self, opcode: u8) -> Option<CommandKind> {
        self.command_map()
            .iter()
            .find(|(_, op)| *op == opcode)
            .map(|(k, _)| *k)
    }

    /// Wire byte for `kind` in the extended page
    fn extended_opcode(&self, kind: CommandKind) -> Option<u8> {
        self.extended_map()
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, op)| *op)
    }

    /// Kind for an extended-page wire byte
    fn extended_kind(&self, opcode: u8) -> Option<CommandKind> {
        self.extended_map()
            .iter()
            .find(|(_, op)| *op == opcode)
            .map(|(k, _)| *k)
    }
}

/// The little-endian handheld dialect
#[derive(Debug, Clone, Copy, Default)]
pub struct Nitro;

impl SequencePlatform for Nitro {
    fn command_map(&self) -> &'static [(CommandKind, u8)] {
        use CommandKind as K;
        &[
            (K::Wait, 0x80),
            (K::ProgramChange, 0x81),
            (K::OpenTrack, 0x93),
            (K::Jump, 0x94),
            (K::Call, 0x95),
            (K::Random, 0xA0),
            (K::Variable, 0xA1),
            (K::If, 0xA2),
            (K::SetVar, 0xB0),
            (K::AddVar, 0xB1),
            (K::SubVar, 0xB2),
            (K::MulVar, 0xB3),
            (K::DivVar, 0xB4),
            (K::ShiftVar, 0xB5),
            (K::RandVar, 0xB6),
            (K::CmpEq, 0xB8),
            (K::CmpGe, 0xB9),
            (K::CmpGt, 0xBA),
            (K::CmpLe, 0xBB),
            (K::CmpLt, 0xBC),
            (K::CmpNe, 0xBD),
            (K::Pan, 0xC0),
            (K::Volume, 0xC1),
            (K::MainVolume, 0xC2),
            (K::Transpose, 0xC3),
            (K::PitchBend, 0xC4),
            (K::BendRange, 0xC5),
            (K::Prio, 0xC6),
            (K::NoteWait, 0xC7),
            (K::Tie, 0xC8),
            (K::Porta, 0xC9),
            (K::ModDepth, 0xCA),
            (K::ModSpeed, 0xCB),
            (K::ModType, 0xCC),
            (K::ModRange, 0xCD),
            (K::PortaSw, 0xCE),
            (K::PortaTime, 0xCF),
            (K::Attack, 0xD0),
            (K::Decay, 0xD1),
            (K::Sustain, 0xD2),
            (K::Release, 0xD3),
            (K::LoopStart, 0xD4),
            (K::Volume2, 0xD5),
            (K::PrintVar, 0xD6),
            (K::ModDelay, 0xE0),
            (K::Tempo, 0xE1),
            (K::SweepPitch, 0xE3),
            (K::LoopEnd, 0xFC),
            (K::Return, 0xFD),
            (K::AllocateTrack, 0xFE),
            (K::Fin, 0xFF),
        ]
    }

    fn byte_order(&self) -> ByteOrder {
        ByteOrder::LittleEndian
    }
}

/// The big-endian console dialect with an extended-opcode page
#[derive(Debug, Clone, Copy, Default)]
pub struct Revolution;

impl SequencePlatform for Revolution {
    fn command_map(&self) -> &'static [(CommandKind, u8)] {
        use CommandKind as K;
        &[
            (K::Wait, 0x80),
            (K::ProgramChange, 0x81),
            (K::OpenTrack, 0x88),
            (K::Jump, 0x89),
            (K::Call, 0x8A),
            (K::Random, 0xA0),
            (K::Variable, 0xA1),
            (K::If, 0xA2),
            (K::Time, 0xA3),
            (K::TimeRandom, 0xA4),
            (K::TimeVariable, 0xA5),
            (K::Timebase, 0xB0),
            (K::EnvHold, 0xB1),
            (K::Monophonic, 0xB2),
            (K::VelocityRange, 0xB3),
            (K::BiquadType, 0xB4),
            (K::BiquadValue, 0xB5),
            (K::Pan, 0xC0),
            (K::Volume, 0xC1),
            (K::MainVolume, 0xC2),
            (K::Transpose, 0xC3),
            (K::PitchBend, 0xC4),
            (K::BendRange, 0xC5),
            (K::Prio, 0xC6),
            (K::NoteWait, 0xC7),
            (K::Tie, 0xC8),
            (K::Porta, 0xC9),
            (K::ModDepth, 0xCA),
            (K::ModSpeed, 0xCB),
            (K::ModType, 0xCC),
            (K::ModRange, 0xCD),
            (K::PortaSw, 0xCE),
            (K::PortaTime, 0xCF),
            (K::Attack, 0xD0),
            (K::Decay, 0xD1),
            (K::Sustain, 0xD2),
            (K::Release, 0xD3),
            (K::LoopStart, 0xD4),
            (K::Volume2, 0xD5),
            (K::PrintVar, 0xD6),
            (K::SurroundPan, 0xD7),
            (K::LpfCutoff, 0xD8),
            (K::FxSendA, 0xD9),
            (K::FxSendB, 0xDA),
            (K::MainSend, 0xDB),
            (K::InitPan, 0xDC),
            (K::Mute, 0xDD),
            (K::FxSendC, 0xDE),
            (K::Damper, 0xDF),
            (K::ModDelay, 0xE0),
            (K::Tempo, 0xE1),
            (K::SweepPitch, 0xE3),
            (K::Extended, 0xF0),
            (K::EnvReset, 0xFB),
            (K::LoopEnd, 0xFC),
            (K::Return, 0xFD),
            (K::AllocateTrack, 0xFE),
            (K::Fin, 0xFF),
        ]
    }

    fn extended_map(&self) -> &'static [(CommandKind, u8)] {
        use CommandKind as K;
        &[
            (K::SetVar, 0x80),
            (K::AddVar, 0x81),
            (K::SubVar, 0x82),
            (K::MulVar, 0x83),
            (K::DivVar, 0x84),
            (K::ShiftVar, 0x85),
            (K::RandVar, 0x86),
            (K::AndVar, 0x87),
            (K::OrVar, 0x88),
            (K::XorVar, 0x89),
            (K::NotVar, 0x8A),
            (K::ModVar, 0x8B),
            (K::CmpEq, 0x90),
            (K::CmpGe, 0x91),
            (K::CmpGt, 0x92),
            (K::CmpLe, 0x93),
            (K::CmpLt, 0x94),
            (K::CmpNe, 0x95),
            (K::UserCall, 0xE0),
        ]
    }

    fn byte_order(&self) -> ByteOrder {
        ByteOrder::BigEndian
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tables_are_bijective() {
        fn check(name: &str, table: &[(CommandKind, u8)]) {
            for (i, (ka, oa)) in table.iter().enumerate() {
                for (kb, ob) in &table[i + 1..] {
                    assert_ne!(ka, kb, "{}: kind {:?} mapped twice", name, ka);
                    assert_ne!(oa, ob, "{}: opcode {:#04X} mapped twice", name, oa);
                }
            }
        }
        check("nitro", Nitro.command_map());
        check("revolution", Revolution.command_map());
        check("revolution-ext", Revolution.extended_map());
    }

    #[test]
    fn test_no_opcode_below_note_range() {
        for (_, op) in Nitro.command_map().iter().chain(Revolution.command_map()) {
            assert!(*op >= 0x80, "opcode {:#04X} collides with note range", op);
        }
    }

    #[test]
    fn test_lookup_round_trip() {
        for (kind, op) in Revolution.command_map() {
            assert_eq!(Revolution.primary_opcode(*kind), Some(*op));
            assert_eq!(Revolution.primary_kind(*op), Some(*kind));
        }
        for (kind, op) in Revolution.extended_map() {
            assert_eq!(Revolution.extended_opcode(*kind), Some(*op));
            assert_eq!(Revolution.extended_kind(*op), Some(*kind));
        }
    }

    #[test]
    fn test_dialects_differ_where_documented() {
        assert_eq!(Nitro.byte_order(), ByteOrder::LittleEndian);
        assert_eq!(Revolution.byte_order(), ByteOrder::BigEndian);
        // Variable ops are primary opcodes on Nitro, extended on Revolution.
        assert!(Nitro.primary_opcode(CommandKind::SetVar).is_some());
        assert!(Revolution.primary_opcode(CommandKind::SetVar).is_none());
        assert!(Revolution.extended_opcode(CommandKind::SetVar).is_some());
        assert!(Nitro.primary_opcode(CommandKind::Extended).is_none());
    }
}

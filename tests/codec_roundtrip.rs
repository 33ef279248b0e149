//! Wire-format round trips across both dialects
//!
//! Every encodable command kind must survive encode -> decode unchanged,
//! and every legal byte sequence must survive decode -> encode unchanged.

use sseq::sequence::{
    ByteOrder, Nitro, ParameterMode, Program, Revolution, SequenceCommand, SequencePlatform,
    SequenceRef, WireReader, WireWriter,
};

/// One sample command per encodable kind (wrappers get their own cases)
fn sample_commands() -> Vec<SequenceCommand> {
    use SequenceCommand as C;
    vec![
        C::Note {
            key: 0,
            velocity: 1,
            length: 0,
        },
        C::Note {
            key: 0x7F,
            velocity: 0x7F,
            length: 0x0FFF_FFFF,
        },
        C::Wait(0),
        C::Wait(16383),
        C::ProgramChange(5),
        C::OpenTrack {
            track: 3,
            target: SequenceRef::from_offset(0x123456),
        },
        C::Jump(SequenceRef::from_offset(0x000001)),
        C::Call(SequenceRef::from_offset(0xFFFFFF)),
        C::Timebase(48),
        C::EnvHold(9),
        C::Monophonic(true),
        C::VelocityRange(100),
        C::BiquadType(1),
        C::BiquadValue(2),
        C::Pan(0x40),
        C::Volume(0x7F),
        C::MainVolume(0x60),
        C::Transpose(-12),
        C::PitchBend(-128),
        C::BendRange(12),
        C::Prio(0x40),
        C::NoteWait(false),
        C::Tie(true),
        C::Porta(60),
        C::ModDepth(10),
        C::ModSpeed(0x10),
        C::ModType(1),
        C::ModRange(1),
        C::PortaSw(true),
        C::PortaTime(8),
        C::Attack(127),
        C::Decay(64),
        C::Sustain(90),
        C::Release(70),
        C::LoopStart(4),
        C::Volume2(0x7F),
        C::PrintVar(33),
        C::SurroundPan(0x40),
        C::LpfCutoff(0x30),
        C::FxSendA(1),
        C::FxSendB(2),
        C::MainSend(3),
        C::InitPan(0x40),
        C::Mute(1),
        C::FxSendC(4),
        C::Damper(false),
        C::ModDelay(-300),
        C::Tempo(150),
        C::SweepPitch(-0x300),
        C::EnvReset,
        C::LoopEnd,
        C::Return,
        C::AllocateTrack(0b1010_0101_0000_0011),
        C::Fin,
        C::SetVar { slot: 0, value: -1 },
        C::AddVar { slot: 31, value: 100 },
        C::SubVar { slot: 32, value: 2 },
        C::MulVar { slot: 5, value: -3 },
        C::DivVar { slot: 6, value: 4 },
        C::ShiftVar { slot: 7, value: -2 },
        C::RandVar { slot: 8, value: 50 },
        C::AndVar { slot: 9, value: 0x0F },
        C::OrVar { slot: 10, value: 0x10 },
        C::XorVar { slot: 11, value: 0x55 },
        C::NotVar { slot: 12, value: 0 },
        C::ModVar { slot: 13, value: 7 },
        C::CmpEq { slot: 14, value: 1 },
        C::CmpGe { slot: 15, value: 2 },
        C::CmpGt { slot: 16, value: 3 },
        C::CmpLe { slot: 17, value: 4 },
        C::CmpLt { slot: 18, value: 5 },
        C::CmpNe { slot: 19, value: 6 },
        C::UserCall(0x1234),
    ]
}

/// Wrapper compositions legal on both dialects
fn wrapped_common() -> Vec<SequenceCommand> {
    use SequenceCommand as C;
    vec![
        // volume_r
        C::Random {
            inner: Box::new(C::Volume(0)),
            min: -10,
            max: 90,
        },
        // note with random length
        C::Random {
            inner: Box::new(C::Note {
                key: 64,
                velocity: 100,
                length: 0,
            }),
            min: 12,
            max: 48,
        },
        // wait_v
        C::Variable {
            inner: Box::new(C::Wait(0)),
            slot: 35,
        },
        // pan_if
        C::If(Box::new(C::Pan(0x20))),
        // jump_if (conditional branch)
        C::If(Box::new(C::Jump(SequenceRef::from_offset(0x10)))),
    ]
}

/// Wrapper compositions using the Time family (Revolution only)
fn wrapped_revolution_only() -> Vec<SequenceCommand> {
    use SequenceCommand as C;
    vec![
        // tempo_t
        C::Time {
            inner: Box::new(C::Tempo(140)),
            offset: 24,
        },
        // transpose_tr_if
        C::If(Box::new(C::TimeRandom {
            inner: Box::new(C::Transpose(3)),
            min: 0,
            max: 8,
        })),
        // volume_tv
        C::TimeVariable {
            inner: Box::new(C::Volume(64)),
            slot: 40,
        },
    ]
}

fn encodable(cmd: &SequenceCommand, platform: &dyn SequencePlatform) -> bool {
    let kind = cmd.kind();
    kind == sseq::CommandKind::Note
        || platform.primary_opcode(kind).is_some()
        || platform.extended_opcode(kind).is_some()
}

fn assert_round_trip(cmd: &SequenceCommand, platform: &dyn SequencePlatform, order: ByteOrder) {
    let mut w = WireWriter::new(order);
    cmd.encode(&mut w, platform, ParameterMode::Normal)
        .unwrap_or_else(|e| panic!("encode of {:?} failed: {}", cmd, e));
    let bytes = w.into_bytes();

    let mut r = WireReader::new(&bytes, order);
    let decoded = SequenceCommand::decode(&mut r, platform, ParameterMode::Normal)
        .unwrap_or_else(|e| panic!("decode of {:?} failed: {}", cmd, e));
    assert!(
        r.is_at_end(),
        "{:?} left {} unread bytes",
        cmd,
        r.remaining()
    );
    assert_eq!(&decoded, cmd);

    // Bytes -> command -> bytes is the identity too.
    let mut w2 = WireWriter::new(order);
    decoded.encode(&mut w2, platform, ParameterMode::Normal).unwrap();
    assert_eq!(w2.into_bytes(), bytes, "re-encode of {:?} differs", cmd);
}

#[test]
fn every_kind_round_trips_on_nitro() {
    for cmd in sample_commands() {
        if encodable(&cmd, &Nitro) {
            assert_round_trip(&cmd, &Nitro, ByteOrder::LittleEndian);
        }
    }
}

#[test]
fn every_kind_round_trips_on_revolution() {
    for cmd in sample_commands() {
        if encodable(&cmd, &Revolution) {
            assert_round_trip(&cmd, &Revolution, ByteOrder::BigEndian);
        }
    }
}

#[test]
fn revolution_covers_the_variable_ops_via_extended_page() {
    // Every U8S16 op must be encodable on Revolution even though none of
    // them live in its primary table.
    let count = sample_commands()
        .iter()
        .filter(|c| {
            matches!(
                c.kind().shape(),
                sseq::sequence::ParamShape::U8S16
            )
        })
        .filter(|c| encodable(c, &Revolution))
        .count();
    assert_eq!(count, 18);
}

#[test]
fn wrapped_commands_round_trip() {
    for cmd in wrapped_common() {
        assert_round_trip(&cmd, &Nitro, ByteOrder::LittleEndian);
        assert_round_trip(&cmd, &Revolution, ByteOrder::BigEndian);
    }
    for cmd in wrapped_revolution_only() {
        assert_round_trip(&cmd, &Revolution, ByteOrder::BigEndian);
    }
}

#[test]
fn dialects_disagree_on_open_track_encoding() {
    let cmd = SequenceCommand::OpenTrack {
        track: 1,
        target: SequenceRef::from_offset(0x000102),
    };
    let mut w = WireWriter::new(ByteOrder::LittleEndian);
    cmd.encode(&mut w, &Nitro, ParameterMode::Normal).unwrap();
    assert_eq!(w.into_bytes(), vec![0x93, 0x01, 0x02, 0x01, 0x00]);

    let mut w = WireWriter::new(ByteOrder::BigEndian);
    cmd.encode(&mut w, &Revolution, ParameterMode::Normal).unwrap();
    assert_eq!(w.into_bytes(), vec![0x88, 0x01, 0x00, 0x01, 0x02]);
}

#[test]
fn whole_program_round_trips_through_bytes() {
    use SequenceCommand as C;
    let commands = vec![
        C::AllocateTrack(0b111),
        C::OpenTrack {
            track: 1,
            target: SequenceRef::to_index(7),
        },
        C::Tempo(140),
        C::LoopStart(2),
        C::Note {
            key: 60,
            velocity: 100,
            length: 24,
        },
        C::LoopEnd,
        C::Fin,
        C::Volume(100),
        C::Call(SequenceRef::to_index(10)),
        C::Fin,
        C::Note {
            key: 67,
            velocity: 90,
            length: 12,
        },
        C::Return,
    ];

    for (platform, _) in [
        (&Nitro as &dyn SequencePlatform, ()),
        (&Revolution as &dyn SequencePlatform, ()),
    ] {
        let mut program = Program::new(commands.clone());
        let bytes = program.encode(platform).unwrap();
        let decoded = Program::decode(&bytes, platform).unwrap();
        assert_eq!(decoded.commands, program.commands);
        let bytes2 = {
            let mut p = Program::new(decoded.commands.clone());
            p.encode(platform).unwrap()
        };
        assert_eq!(bytes2, bytes);
    }
}

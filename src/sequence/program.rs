//! Decoded sequence programs
//!
//! A [`Program`] is the fully decoded, linked command list for one song:
//! the unit the tick pre-scanner annotates and the interpreter executes.
//! Decoding is a one-pass streaming read that records the byte offset of
//! every command, followed by a link pass that converts the 24-bit wire
//! offsets carried by `Jump`/`Call`/`OpenTrack` into command indices.
//! Encoding is the inverse: a sizing pass recomputes each command's offset,
//! references are patched, then the stream is written for real.

use std::collections::{BTreeMap, HashMap};

use super::command::{CommandKind, ParameterMode, SequenceCommand};
use super::platform::SequencePlatform;
use super::wire::{WireReader, WireWriter};
use crate::{Result, SseqError};

/// Number of tick-annotation slots per command (one per openable track)
pub const TICK_SLOTS: usize = 16;

/// A decoded, linked sequence program
#[derive(Debug, Clone, Default)]
pub struct Program {
    /// The ordered command list, 0-indexed
    pub commands: Vec<SequenceCommand>,
    /// Named entry points (label name to command index)
    pub labels: BTreeMap<String, usize>,
    /// Per-command elapsed-tick annotations written by the pre-scanner.
    /// Not protocol data; never serialized.
    ticks: Vec<[i64; TICK_SLOTS]>,
}

impl Program {
    /// Build a program from an in-memory command list
    pub fn new(commands: Vec<SequenceCommand>) -> Self {
        let ticks = vec![[0; TICK_SLOTS]; commands.len()];
        Program {
            commands,
            labels: BTreeMap::new(),
            ticks,
        }
    }

    /// Decode a whole sequence stream in the given dialect
    pub fn decode(data: &[u8], platform: &dyn SequencePlatform) -> Result<Self> {
        Self::decode_labeled(data, platform, &BTreeMap::new())
    }

    /// Decode a stream and translate a `name -> byte offset` label table
    /// into `name -> command index`
    pub fn decode_labeled(
        data: &[u8],
        platform: &dyn SequencePlatform,
        labels: &BTreeMap<String, u32>,
    ) -> Result<Self> {
        let mut r = WireReader::new(data, platform.byte_order());
        let mut offset_map: HashMap<u32, usize> = HashMap::new();
        let mut commands: Vec<SequenceCommand> = Vec::new();

        while !r.is_at_end() {
            offset_map.insert(r.position() as u32, commands.len());

            // Some MIDI converters widen the 24-bit jump target to 32 bits;
            // a single zero byte directly after a jump is that padding.
            if r.remaining() > 1 && matches!(commands.last(), Some(SequenceCommand::Jump(_))) {
                let bak = r.position();
                if r.read_u8()? == 0 {
                    continue;
                }
                r.seek(bak);
            }

            commands.push(SequenceCommand::decode(&mut r, platform, ParameterMode::Normal)?);
        }

        // Link pass: map every collected offset to its command index.
        for cmd in &mut commands {
            if let Some(target) = cmd.reference_mut() {
                target.index = *offset_map
                    .get(&target.offset)
                    .ok_or(SseqError::UnresolvedReference {
                        offset: target.offset,
                    })?;
            }
        }

        let mut label_map = BTreeMap::new();
        for (name, offset) in labels {
            let index = *offset_map
                .get(offset)
                .ok_or(SseqError::UnresolvedReference { offset: *offset })?;
            label_map.insert(name.clone(), index);
        }

        let ticks = vec![[0; TICK_SLOTS]; commands.len()];
        Ok(Program {
            commands,
            labels: label_map,
            ticks,
        })
    }

    /// Encode the program back into its wire form
    ///
    /// Reference offsets are recomputed from command indices, so the program
    /// is mutated in place. Commands the dialect cannot express are skipped,
    /// matching the original writer.
    pub fn encode(&mut self, platform: &dyn SequencePlatform) -> Result<Vec<u8>> {
        // Sizing pass: find each command's byte offset.
        let mut offsets = Vec::with_capacity(self.commands.len());
        {
            let mut w = WireWriter::new(platform.byte_order());
            for cmd in &self.commands {
                offsets.push(w.position() as u32);
                if is_encodable(cmd, platform) {
                    cmd.encode(&mut w, platform, ParameterMode::Normal)?;
                }
            }
        }

        // Patch references with the freshly computed offsets.
        let len = self.commands.len();
        for cmd in &mut self.commands {
            if let Some(target) = cmd.reference_mut() {
                if target.index >= len {
                    return Err(SseqError::ReferenceOutOfBounds {
                        index: target.index,
                        len,
                    });
                }
                target.offset = offsets[target.index];
            }
        }

        // Write every command for real now.
        let mut w = WireWriter::new(platform.byte_order());
        for cmd in &self.commands {
            if is_encodable(cmd, platform) {
                cmd.encode(&mut w, platform, ParameterMode::Normal)?;
            }
        }
        Ok(w.into_bytes())
    }

    /// Verify that every reference lands inside the program
    pub fn check_links(&self) -> Result<()> {
        let len = self.commands.len();
        for cmd in &self.commands {
            if let Some(target) = cmd.reference() {
                if target.index >= len {
                    return Err(SseqError::ReferenceOutOfBounds {
                        index: target.index,
                        len,
                    });
                }
            }
        }
        Ok(())
    }

    /// Clear all tick annotations (and resize to the current command count)
    pub(crate) fn reset_ticks(&mut self) {
        self.ticks.clear();
        self.ticks.resize(self.commands.len(), [0; TICK_SLOTS]);
    }

    /// Record the elapsed-tick offset of a command for one track slot;
    /// the first visit wins
    pub(crate) fn set_tick_if_unset(&mut self, index: usize, track: usize, value: i64) {
        if let Some(slots) = self.ticks.get_mut(index) {
            if slots[track] == 0 {
                slots[track] = value;
            }
        }
    }

    /// Elapsed-tick annotation of a command for one track slot
    pub(crate) fn tick_at(&self, index: usize, track: usize) -> i64 {
        self.ticks
            .get(index)
            .map(|slots| slots[track])
            .unwrap_or(0)
    }
}

fn is_encodable(cmd: &SequenceCommand, platform: &dyn SequencePlatform) -> bool {
    let kind = cmd.kind();
    kind == CommandKind::Note
        || platform.primary_opcode(kind).is_some()
        || platform.extended_opcode(kind).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::command::SequenceRef;
    use crate::sequence::platform::{Nitro, Revolution};

    fn small_program() -> Program {
        Program::new(vec![
            SequenceCommand::AllocateTrack(0b11),
            SequenceCommand::OpenTrack {
                track: 1,
                target: SequenceRef::to_index(4),
            },
            SequenceCommand::Wait(4),
            SequenceCommand::Fin,
            SequenceCommand::Note {
                key: 60,
                velocity: 100,
                length: 4,
            },
            SequenceCommand::Fin,
        ])
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let mut program = small_program();
        let bytes = program.encode(&Nitro).unwrap();
        let decoded = Program::decode(&bytes, &Nitro).unwrap();
        assert_eq!(decoded.commands, program.commands);

        let reencoded = {
            let mut p = Program::new(decoded.commands.clone());
            p.encode(&Nitro).unwrap()
        };
        assert_eq!(reencoded, bytes);
    }

    #[test]
    fn test_reference_offsets_resolve_to_indices() {
        let mut program = small_program();
        let bytes = program.encode(&Revolution).unwrap();
        let decoded = Program::decode(&bytes, &Revolution).unwrap();
        match &decoded.commands[1] {
            SequenceCommand::OpenTrack { target, .. } => assert_eq!(target.index, 4),
            other => panic!("expected open-track, got {:?}", other),
        }
    }

    #[test]
    fn test_unresolved_reference_fails_decode() {
        // A jump into the middle of a note command.
        let mut program = Program::new(vec![
            SequenceCommand::Jump(SequenceRef::to_index(1)),
            SequenceCommand::Note {
                key: 60,
                velocity: 100,
                length: 4,
            },
        ]);
        let mut bytes = program.encode(&Nitro).unwrap();
        // Point the 24-bit target one byte past the note's start.
        bytes[1] = bytes[1].wrapping_add(1);
        assert!(matches!(
            Program::decode(&bytes, &Nitro),
            Err(SseqError::UnresolvedReference { .. })
        ));
    }

    #[test]
    fn test_out_of_bounds_index_fails_encode() {
        let mut program = Program::new(vec![SequenceCommand::Jump(SequenceRef::to_index(9))]);
        assert!(matches!(
            program.encode(&Nitro),
            Err(SseqError::ReferenceOutOfBounds { index: 9, len: 1 })
        ));
    }

    #[test]
    fn test_jump_padding_byte_is_consumed() {
        let mut program = Program::new(vec![
            SequenceCommand::Jump(SequenceRef::to_index(1)),
            SequenceCommand::Fin,
        ]);
        let mut bytes = program.encode(&Nitro).unwrap();
        // Widen the jump target with a zero pad byte, as some converters do.
        bytes.insert(4, 0x00);
        // Fix the jump target: index 1 now lives at offset 5.
        bytes[1] = 5;
        let decoded = Program::decode(&bytes, &Nitro).unwrap();
        assert_eq!(decoded.commands.len(), 2);
        assert_eq!(decoded.commands[1], SequenceCommand::Fin);
    }

    #[test]
    fn test_label_translation() {
        let mut program = small_program();
        let bytes = program.encode(&Nitro).unwrap();
        // Offset of command 4 (the note): alloctrack(3) + opentrack(5) +
        // wait(2) + fin(1) = 11.
        let mut labels = BTreeMap::new();
        labels.insert("sub_track".to_string(), 11u32);
        let decoded = Program::decode_labeled(&bytes, &Nitro, &labels).unwrap();
        assert_eq!(decoded.labels.get("sub_track"), Some(&4));
    }
}

//! Tick pre-scanner
//!
//! Before playback starts, the program is walked once per reachable track
//! to annotate every instruction with its elapsed tick count and to find
//! the longest-running track, which schedules end-of-loop fade-out. The
//! walk follows `Call`/`Return` through a depth-3 stack and recurses into
//! `OpenTrack` targets with the running tick base.
//!
//! Cycle handling is deliberately asymmetric: `Jump` targets are guarded by
//! a visited set, `Call`/`Return` are not (the driver never guarded them).
//! Rather than second-guess which call/return shapes can loop, every walk
//! carries a hard iteration ceiling; hitting it abandons the walk with a
//! logged warning instead of failing the load.

use rand::rngs::StdRng;

use super::track::{Track, CALL_STACK_DEPTH};
use super::NUM_TRACKS;
use crate::sequence::{CommandKind, Program};

/// Hard per-track fetch ceiling for the pre-scan walk
pub const SCAN_ITERATION_CEILING: usize = 1_000_000;

/// Result of a tick pre-scan
#[derive(Debug, Clone)]
pub struct TickScan {
    /// Total ticks per track (0 for tracks never opened)
    pub ticks_per_track: [i64; NUM_TRACKS],
    /// Track with the largest total (first wins on ties)
    pub longest_track: usize,
    /// The largest total
    pub max_ticks: i64,
    /// A walk was abandoned at the iteration ceiling
    pub hit_ceiling: bool,
}

/// One pre-scan over a program
pub(crate) struct TickScanner<'a> {
    program: &'a mut Program,
    rng: &'a mut StdRng,
    globals: &'a [i16; 32],
    tracks: &'a [Track],
    ceiling: usize,
}

impl<'a> TickScanner<'a> {
    pub(crate) fn new(
        program: &'a mut Program,
        rng: &'a mut StdRng,
        globals: &'a [i16; 32],
        tracks: &'a [Track],
    ) -> Self {
        TickScanner {
            program,
            rng,
            globals,
            tracks,
            ceiling: SCAN_ITERATION_CEILING,
        }
    }

    #[cfg(test)]
    fn with_ceiling(mut self, ceiling: usize) -> Self {
        self.ceiling = ceiling;
        self
    }

    /// Walk the program from track 0 at `start_index`
    pub(crate) fn scan(mut self, start_index: usize) -> TickScan {
        self.program.reset_ticks();

        let mut totals = [0i64; NUM_TRACKS];
        let mut hit_ceiling = false;
        self.walk(0, 0, start_index, &mut totals, &mut hit_ceiling);

        let mut longest_track = 0;
        let mut max_ticks = totals[0];
        for (i, &t) in totals.iter().enumerate().skip(1) {
            if t > max_ticks {
                max_ticks = t;
                longest_track = i;
            }
        }

        TickScan {
            ticks_per_track: totals,
            longest_track,
            max_ticks,
            hit_ceiling,
        }
    }

    fn walk(
        &mut self,
        track_num: usize,
        base: i64,
        start_event: usize,
        totals: &mut [i64; NUM_TRACKS],
        hit_ceiling: &mut bool,
    ) {
        let mut note_wait = true;
        let mut call_stack = [0usize; CALL_STACK_DEPTH];
        let mut call_depth = 0usize;
        let mut visited: Vec<usize> = Vec::new();
        let mut base_ticks = base;
        let mut cur_event = start_event;
        let mut iterations = 0usize;

        while cur_event < self.program.commands.len() {
            iterations += 1;
            if iterations > self.ceiling {
                *hit_ceiling = true;
                log::warn!(
                    "tick scan abandoned on track {}: iteration ceiling reached \
                     (possible call/return cycle)",
                    track_num
                );
                return;
            }

            self.program.set_tick_if_unset(cur_event, track_num, base_ticks);

            let cmd = self.program.commands[cur_event].clone();
            let num_args = cmd.num_arguments();
            let mut args: Vec<i32> = (0..num_args).map(|n| cmd.argument(n, self.rng)).collect();
            if matches!(cmd.kind(), CommandKind::Variable | CommandKind::TimeVariable) {
                if let Some(last) = args.last_mut() {
                    *last = self.get_var(*last, track_num) as i32;
                }
            }

            match cmd.effective_kind() {
                CommandKind::OpenTrack => {
                    let target_track = args[0] as usize;
                    if target_track < NUM_TRACKS {
                        self.walk(
                            target_track,
                            base_ticks,
                            args[1] as usize,
                            totals,
                            hit_ceiling,
                        );
                    }
                }
                CommandKind::NoteWait => note_wait = args[0] > 0,
                CommandKind::Note => {
                    if note_wait {
                        base_ticks += args[2] as i64;
                    }
                }
                CommandKind::Wait => base_ticks += args[0] as i64,
                CommandKind::Call => {
                    if call_depth < CALL_STACK_DEPTH {
                        call_stack[call_depth] = cur_event + 1;
                        call_depth += 1;
                        visited.push(cur_event);
                        cur_event = args[0] as usize;
                        continue;
                    }
                }
                CommandKind::Jump => {
                    let target = args[0] as usize;
                    if !visited.contains(&target) {
                        cur_event = target;
                        visited.push(cur_event);
                        continue;
                    }
                }
                CommandKind::Return => {
                    if call_depth != 0 {
                        call_depth -= 1;
                        visited.push(cur_event);
                        cur_event = call_stack[call_depth];
                        continue;
                    }
                }
                CommandKind::Fin => {
                    totals[track_num] = base_ticks;
                    return;
                }
                _ => {}
            }

            visited.push(cur_event);
            cur_event += 1;
        }
    }

    fn get_var(&self, slot: i32, track_num: usize) -> i16 {
        let slot = slot as usize;
        if slot < 0x20 {
            self.globals.get(slot).copied().unwrap_or(-1)
        } else {
            self.tracks[track_num]
                .vars
                .get(slot - 0x20)
                .copied()
                .unwrap_or(-1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::command::{SequenceCommand, SequenceRef};
    use rand::SeedableRng;

    fn scan_fixture(
        program: &mut Program,
        start: usize,
        ceiling: Option<usize>,
    ) -> TickScan {
        let mut rng = StdRng::seed_from_u64(1);
        let globals = [-1i16; 32];
        let tracks: Vec<Track> = (0..NUM_TRACKS as u8).map(Track::new).collect();
        let scanner = TickScanner::new(program, &mut rng, &globals, &tracks);
        match ceiling {
            Some(c) => scanner.with_ceiling(c).scan(start),
            None => scanner.scan(start),
        }
    }

    fn scan_program(program: &mut Program, start: usize) -> TickScan {
        scan_fixture(program, start, None)
    }

    #[test]
    fn test_two_track_totals() {
        let mut program = Program::new(vec![
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
                length: 6,
            },
            SequenceCommand::Fin,
        ]);
        let scan = scan_program(&mut program, 0);
        assert_eq!(scan.ticks_per_track[0], 4);
        assert_eq!(scan.ticks_per_track[1], 6, "note-wait counts note length");
        assert_eq!(scan.longest_track, 1);
        assert_eq!(scan.max_ticks, 6);
        assert!(!scan.hit_ceiling);
    }

    #[test]
    fn test_scan_is_deterministic() {
        let mut program = Program::new(vec![
            SequenceCommand::Random {
                inner: Box::new(SequenceCommand::Wait(0)),
                min: 1,
                max: 100,
            },
            SequenceCommand::Wait(10),
            SequenceCommand::Fin,
        ]);
        let a = scan_program(&mut program, 0);
        let mut program2 = program.clone();
        let b = scan_program(&mut program2, 0);
        assert_eq!(a.ticks_per_track, b.ticks_per_track);
        assert_eq!(a.max_ticks, b.max_ticks);
    }

    #[test]
    fn test_loop_jump_falls_through_on_revisit() {
        // The end-of-song loop jump targets already-walked code; the scan
        // measures a single pass instead of looping forever.
        let mut program = Program::new(vec![
            SequenceCommand::Wait(2),
            SequenceCommand::Jump(SequenceRef::to_index(0)),
            SequenceCommand::Fin,
        ]);
        let scan = scan_program(&mut program, 0);
        assert!(!scan.hit_ceiling);
        assert_eq!(scan.ticks_per_track[0], 2, "one pass through the loop body");
    }

    #[test]
    fn test_forward_jump_is_followed() {
        let mut program = Program::new(vec![
            SequenceCommand::Jump(SequenceRef::to_index(2)),
            SequenceCommand::Wait(50),
            SequenceCommand::Wait(7),
            SequenceCommand::Fin,
        ]);
        let scan = scan_program(&mut program, 0);
        assert_eq!(scan.ticks_per_track[0], 7, "the skipped wait must not count");
    }

    #[test]
    fn test_note_wait_off_skips_durations() {
        let mut program = Program::new(vec![
            SequenceCommand::NoteWait(false),
            SequenceCommand::Note {
                key: 60,
                velocity: 100,
                length: 100,
            },
            SequenceCommand::Wait(3),
            SequenceCommand::Fin,
        ]);
        let scan = scan_program(&mut program, 0);
        assert_eq!(scan.ticks_per_track[0], 3);
    }

    #[test]
    fn test_call_and_return_accumulate() {
        let mut program = Program::new(vec![
            SequenceCommand::Call(SequenceRef::to_index(3)),
            SequenceCommand::Wait(1),
            SequenceCommand::Fin,
            SequenceCommand::Wait(10),
            SequenceCommand::Return,
        ]);
        let scan = scan_program(&mut program, 0);
        assert_eq!(scan.ticks_per_track[0], 11);
    }

    #[test]
    fn test_iteration_ceiling_abandons_walk() {
        let mut program = Program::new(vec![SequenceCommand::Wait(1); 64]);
        let scan = scan_fixture(&mut program, 0, Some(16));
        assert!(scan.hit_ceiling, "walk longer than the ceiling must be abandoned");
    }

    #[test]
    fn test_first_visit_annotation_wins() {
        let mut program = Program::new(vec![
            SequenceCommand::Wait(5),
            SequenceCommand::Jump(SequenceRef::to_index(0)),
            SequenceCommand::Fin,
        ]);
        let _ = scan_program(&mut program, 0);
        // Command 1 was first reached after 5 ticks.
        assert_eq!(program.tick_at(1, 0), 5);
    }
}

//! Lazy walk over a run's files in the order the instrument writes them.
//!
//! Each step blocks until its files are stable (see [`Availability`]) and
//! then hands them out. The walk is finite once the run descriptor exists;
//! before that the cycle count is the sentinel and the cycle loop simply
//! keeps waiting.

use std::collections::VecDeque;
use std::path::PathBuf;

use tracing::debug;

use crate::availability::Availability;
use crate::error::Result;
use crate::layout::RunLayout;

const EARLY_CYCLES: u32 = 5;
/// Location files are final once this cycle starts.
const LOCATIONS_STABLE_CYCLE: u32 = 6;
/// Filter files appear after this cycle.
const FILTER_CYCLE: u32 = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    RunInfo,
    RunParameters,
    LaneIndex(u32),
    EarlyCycle(u32),
    Locations,
    Cycle(u32),
    Filter { lane: u32, resume_at: u32 },
    Finish,
    Done,
}

pub struct RunSequencer {
    layout: RunLayout,
    waits: Availability,
    phase: Phase,
    pending: VecDeque<PathBuf>,
}

impl RunSequencer {
    pub fn new(layout: RunLayout, waits: Availability) -> Self {
        Self {
            layout,
            waits,
            phase: Phase::RunInfo,
            pending: VecDeque::new(),
        }
    }

    fn push_cycle(&mut self, cycle: u32) {
        for lane in self.layout.lanes() {
            let set = self.layout.cycle_files(cycle, lane);
            self.pending.push_back(set.data);
            self.pending.push_back(set.index);
        }
    }

    /// Run the current phase: wait, queue its paths, pick the next phase.
    fn advance(&mut self) -> Result<()> {
        let lanes = self.layout.lane_count();
        self.phase = match self.phase {
            Phase::RunInfo => {
                let path = self.layout.run_info_xml();
                self.waits.await_file(&path)?;
                self.pending.push_back(path);
                Phase::RunParameters
            }
            Phase::RunParameters => {
                let path = self.layout.run_parameters_xml();
                self.waits.await_file(&path)?;
                self.pending.push_back(path);
                if lanes == 0 {
                    Phase::EarlyCycle(1)
                } else {
                    Phase::LaneIndex(1)
                }
            }
            Phase::LaneIndex(lane) => {
                let path = self.layout.lane_index_file(lane);
                self.waits.await_file(&path)?;
                self.pending.push_back(path);
                if lane < lanes {
                    Phase::LaneIndex(lane + 1)
                } else {
                    Phase::EarlyCycle(1)
                }
            }
            Phase::EarlyCycle(cycle) => {
                self.waits.await_cycle_default(&self.layout, cycle)?;
                self.push_cycle(cycle);
                if cycle < EARLY_CYCLES {
                    Phase::EarlyCycle(cycle + 1)
                } else {
                    Phase::Locations
                }
            }
            Phase::Locations => {
                let marker = self.layout.cycle_data_file(LOCATIONS_STABLE_CYCLE, 1);
                self.waits.await_file(&marker)?;
                self.pending.extend(self.layout.location_files());
                Phase::Cycle(LOCATIONS_STABLE_CYCLE)
            }
            Phase::Cycle(cycle) => {
                // Re-read every time: the descriptor may have appeared late.
                let cycle_count = self.layout.cycle_count()?;
                if cycle > cycle_count {
                    debug!(cycle_count, "all cycles yielded");
                    Phase::Finish
                } else {
                    self.waits.await_cycle_default(&self.layout, cycle)?;
                    self.push_cycle(cycle);
                    if cycle == FILTER_CYCLE && lanes > 0 {
                        Phase::Filter {
                            lane: 1,
                            resume_at: cycle + 1,
                        }
                    } else {
                        Phase::Cycle(cycle + 1)
                    }
                }
            }
            Phase::Filter { lane, resume_at } => {
                let path = self.layout.filter_file(lane);
                self.waits.await_file(&path)?;
                self.pending.push_back(path);
                if lane < lanes {
                    Phase::Filter {
                        lane: lane + 1,
                        resume_at,
                    }
                } else {
                    Phase::Cycle(resume_at)
                }
            }
            Phase::Finish => {
                let rta_complete = self.layout.rta_complete_marker();
                self.waits.await_file(&rta_complete)?;
                self.pending.push_back(self.layout.rta_configuration_xml());
                self.pending.push_back(self.layout.run_info_xml());
                self.pending.push_back(self.layout.run_parameters_xml());
                self.pending.push_back(rta_complete);
                self.pending.extend(self.layout.read_complete_markers()?);
                Phase::Done
            }
            Phase::Done => Phase::Done,
        };
        Ok(())
    }
}

impl Iterator for RunSequencer {
    type Item = Result<PathBuf>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(path) = self.pending.pop_front() {
                return Some(Ok(path));
            }
            if self.phase == Phase::Done {
                return None;
            }
            if let Err(e) = self.advance() {
                self.phase = Phase::Done;
                self.pending.clear();
                return Some(Err(e));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::run_info_xml_for;
    use crate::shutdown::ShutdownSignal;
    use crate::testutil::scratch_dir;
    use std::fs;
    use std::path::Path;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, b"x").expect("write");
    }

    fn populate(layout: &RunLayout, reads: &[u32], read_markers: usize) {
        let cycles: u32 = reads.iter().sum();
        fs::create_dir_all(layout.root()).expect("root");
        fs::write(layout.run_info_xml(), run_info_xml_for(reads)).expect("run info");
        touch(&layout.run_parameters_xml());
        touch(&layout.rta_configuration_xml());
        touch(&layout.rta_complete_marker());
        for idx in 1..=read_markers {
            touch(&layout.root().join(format!("RTARead{}Complete.txt", idx)));
        }
        for lane in layout.lanes() {
            touch(&layout.lane_index_file(lane));
            touch(&layout.location_file(lane));
            touch(&layout.filter_file(lane));
            for cycle in 1..=cycles.max(6) {
                let set = layout.cycle_files(cycle, lane);
                touch(&set.data);
                touch(&set.index);
            }
        }
    }

    fn fast_waits() -> Availability {
        Availability::new(
            Arc::new(ShutdownSignal::new()),
            Duration::from_millis(1),
            Duration::from_millis(1),
        )
    }

    /// The tail is four fixed files (RTAConfiguration, RunInfo,
    /// RunParameters, RTAComplete) followed by the read markers.
    fn expected_len(lanes: usize, cycles: usize, read_markers: usize) -> usize {
        let filters = if cycles >= 25 { lanes } else { 0 };
        2 + lanes + 5 * 2 * lanes + lanes + (cycles - 5) * 2 * lanes + filters + 4 + read_markers
    }

    #[test]
    fn yields_every_file_of_a_finished_run_in_write_order() {
        let root = scratch_dir("seq_order").join("200101_NB501234_0001_AHXXXXXX");
        let layout = RunLayout::new(&root, 4);
        populate(&layout, &[18, 18], 2);

        let paths: Vec<PathBuf> = RunSequencer::new(layout.clone(), fast_waits())
            .collect::<Result<_>>()
            .expect("sequence");
        assert_eq!(paths.len(), expected_len(4, 36, 2));

        assert_eq!(paths[0], layout.run_info_xml());
        assert_eq!(paths[1], layout.run_parameters_xml());
        assert_eq!(&paths[2..6], layout.lane_index_files().as_slice());
        assert_eq!(paths[6], layout.cycle_data_file(1, 1));
        assert_eq!(paths[7], layout.cycle_index_file(1, 1));
        assert_eq!(paths[8], layout.cycle_data_file(1, 2));
        let locs_at = 6 + 5 * 2 * 4;
        assert_eq!(&paths[locs_at..locs_at + 4], layout.location_files().as_slice());
        assert_eq!(paths[locs_at + 4], layout.cycle_data_file(6, 1));

        let filter_at = paths
            .iter()
            .position(|p| *p == layout.filter_file(1))
            .expect("filter files are yielded");
        assert_eq!(paths[filter_at - 1], layout.cycle_index_file(25, 4));
        assert_eq!(&paths[filter_at..filter_at + 4], layout.filter_files().as_slice());
        assert_eq!(paths[filter_at + 4], layout.cycle_data_file(26, 1));

        let tail = &paths[paths.len() - 6..];
        assert_eq!(tail[0], layout.rta_configuration_xml());
        assert_eq!(tail[1], layout.run_info_xml());
        assert_eq!(tail[2], layout.run_parameters_xml());
        assert_eq!(tail[3], layout.rta_complete_marker());
        assert_eq!(tail[4], root.join("RTARead1Complete.txt"));
        assert_eq!(tail[5], root.join("RTARead2Complete.txt"));
        let _ = fs::remove_dir_all(root.parent().expect("parent"));
    }

    #[test]
    fn short_runs_have_no_filter_files() {
        let root = scratch_dir("seq_short").join("200101_NB501234_0002_AHXXXXXX");
        let layout = RunLayout::new(&root, 2);
        populate(&layout, &[12], 1);
        let paths: Vec<PathBuf> = RunSequencer::new(layout.clone(), fast_waits())
            .collect::<Result<_>>()
            .expect("sequence");
        assert_eq!(paths.len(), expected_len(2, 12, 1));
        assert!(!paths.contains(&layout.filter_file(1)));
        let _ = fs::remove_dir_all(root.parent().expect("parent"));
    }

    #[test]
    fn follows_a_run_that_is_still_being_written() {
        let root = scratch_dir("seq_live").join("200101_NB501234_0003_AHXXXXXX");
        let layout = RunLayout::new(&root, 1);
        fs::create_dir_all(&root).expect("root");
        let writer_layout = layout.clone();
        let writer = thread::spawn(move || {
            let l = writer_layout;
            fs::write(l.run_info_xml(), run_info_xml_for(&[8])).expect("run info");
            touch(&l.run_parameters_xml());
            touch(&l.lane_index_file(1));
            for cycle in 1..=8 {
                if cycle == 6 {
                    touch(&l.location_file(1));
                }
                thread::sleep(Duration::from_millis(5));
                let set = l.cycle_files(cycle, 1);
                touch(&set.index);
                touch(&set.data);
            }
            touch(&l.rta_configuration_xml());
            touch(&l.root().join("RTARead1Complete.txt"));
            touch(&l.rta_complete_marker());
        });
        let paths: Vec<PathBuf> = RunSequencer::new(layout.clone(), fast_waits())
            .collect::<Result<_>>()
            .expect("sequence");
        writer.join().expect("join");
        assert_eq!(paths.len(), expected_len(1, 8, 1));
        assert_eq!(paths[paths.len() - 2], layout.rta_complete_marker());
        let _ = fs::remove_dir_all(root.parent().expect("parent"));
    }

    #[test]
    fn malformed_descriptor_ends_the_walk_with_an_error() {
        let root = scratch_dir("seq_malformed").join("200101_NB501234_0004_AHXXXXXX");
        let layout = RunLayout::new(&root, 1);
        populate(&layout, &[8], 0);
        fs::write(layout.run_info_xml(), "<RunInfo><Run>").expect("corrupt");
        let mut sequencer = RunSequencer::new(layout, fast_waits());
        let mut saw_error = false;
        for item in sequencer.by_ref() {
            if item.is_err() {
                saw_error = true;
                break;
            }
        }
        assert!(saw_error);
        assert!(sequencer.next().is_none());
        let _ = fs::remove_dir_all(root.parent().expect("parent"));
    }
}

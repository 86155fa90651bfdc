use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{CoreError, Result};

pub const DEFAULT_LANE_COUNT: u32 = 4;

/// Reported by [`RunLayout::cycle_count`] until the run descriptor exists, so
/// "current cycle <= cycle count" keeps waiting instead of concluding.
pub const CYCLE_COUNT_UNKNOWN: u32 = 9999;

const RUN_INFO: &str = "RunInfo.xml";
const RUN_PARAMETERS: &str = "RunParameters.xml";
const RTA_CONFIGURATION: &str = "RTAConfiguration.xml";
const RTA_COMPLETE: &str = "RTAComplete.txt";
const RUN_COMPLETION_STATUS: &str = "RunCompletionStatus.xml";
const READ_COMPLETE_PREFIX: &str = "RTARead";
const READ_COMPLETE_SUFFIX: &str = "Complete.txt";

/// Base-call data file and its index for one lane and cycle. They are always
/// checked and transferred as a pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleFileSet {
    pub data: PathBuf,
    pub index: PathBuf,
}

/// Path builders for one run directory as laid out by the instrument.
#[derive(Debug, Clone)]
pub struct RunLayout {
    root: PathBuf,
    lane_count: u32,
}

impl RunLayout {
    pub fn new(root: impl Into<PathBuf>, lane_count: u32) -> Self {
        Self {
            root: root.into(),
            lane_count,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn lane_count(&self) -> u32 {
        self.lane_count
    }

    /// Directory name of the run, which is also its identifier.
    pub fn run_id(&self) -> String {
        self.root
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    pub fn lanes(&self) -> impl Iterator<Item = u32> {
        1..=self.lane_count
    }

    pub fn config_dir(&self) -> PathBuf {
        self.root.join("Config")
    }

    pub fn recipe_dir(&self) -> PathBuf {
        self.root.join("Recipe")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join("Data")
    }

    pub fn intensities_dir(&self) -> PathBuf {
        self.data_dir().join("Intensities")
    }

    pub fn basecall_dir(&self) -> PathBuf {
        self.intensities_dir().join("BaseCalls")
    }

    pub fn interop_dir(&self) -> PathBuf {
        self.root.join("InterOp")
    }

    pub fn images_dir(&self) -> PathBuf {
        self.root.join("Images")
    }

    pub fn thumbnail_images_dir(&self) -> PathBuf {
        self.root.join("Thumbnail_Images")
    }

    pub fn rta_logs_dir(&self) -> PathBuf {
        self.root.join("RTALogs")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("Logs")
    }

    /// Directories appended to for the whole run; re-sent periodically.
    pub fn dynamic_dirs(&self) -> Vec<PathBuf> {
        vec![self.interop_dir()]
    }

    /// Best-effort directories, sent after the data files.
    pub fn non_critical_dirs(&self) -> Vec<PathBuf> {
        vec![
            self.images_dir(),
            self.thumbnail_images_dir(),
            self.rta_logs_dir(),
            self.logs_dir(),
        ]
    }

    pub fn static_dirs(&self) -> Vec<PathBuf> {
        vec![self.recipe_dir(), self.config_dir()]
    }

    fn lane_name(lane: u32) -> String {
        format!("L{:03}", lane)
    }

    pub fn basecall_lane_dir(&self, lane: u32) -> PathBuf {
        self.basecall_dir().join(Self::lane_name(lane))
    }

    pub fn cycle_data_file(&self, cycle: u32, lane: u32) -> PathBuf {
        self.basecall_lane_dir(lane)
            .join(format!("{:04}.bcl.bgzf", cycle))
    }

    pub fn cycle_index_file(&self, cycle: u32, lane: u32) -> PathBuf {
        self.basecall_lane_dir(lane)
            .join(format!("{:04}.bcl.bgzf.bci", cycle))
    }

    pub fn cycle_files(&self, cycle: u32, lane: u32) -> CycleFileSet {
        CycleFileSet {
            data: self.cycle_data_file(cycle, lane),
            index: self.cycle_index_file(cycle, lane),
        }
    }

    pub fn location_file(&self, lane: u32) -> PathBuf {
        self.intensities_dir()
            .join(Self::lane_name(lane))
            .join(format!("s_{}.locs", lane))
    }

    pub fn filter_file(&self, lane: u32) -> PathBuf {
        self.basecall_lane_dir(lane).join(format!("s_{}.filter", lane))
    }

    pub fn lane_index_file(&self, lane: u32) -> PathBuf {
        self.basecall_lane_dir(lane).join(format!("s_{}.bci", lane))
    }

    pub fn location_files(&self) -> Vec<PathBuf> {
        self.lanes().map(|lane| self.location_file(lane)).collect()
    }

    pub fn filter_files(&self) -> Vec<PathBuf> {
        self.lanes().map(|lane| self.filter_file(lane)).collect()
    }

    pub fn lane_index_files(&self) -> Vec<PathBuf> {
        self.lanes().map(|lane| self.lane_index_file(lane)).collect()
    }

    pub fn run_info_xml(&self) -> PathBuf {
        self.root.join(RUN_INFO)
    }

    pub fn run_parameters_xml(&self) -> PathBuf {
        self.root.join(RUN_PARAMETERS)
    }

    pub fn rta_configuration_xml(&self) -> PathBuf {
        self.root.join(RTA_CONFIGURATION)
    }

    pub fn rta_complete_marker(&self) -> PathBuf {
        self.root.join(RTA_COMPLETE)
    }

    pub fn run_completion_marker(&self) -> PathBuf {
        self.root.join(RUN_COMPLETION_STATUS)
    }

    /// `RTARead*Complete.txt` markers currently present, sorted by name.
    pub fn read_complete_markers(&self) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut markers = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if is_read_complete_marker(&name) {
                markers.push(entry.path());
            }
        }
        markers.sort();
        Ok(markers)
    }

    /// Total cycles over all reads in the run descriptor, or
    /// [`CYCLE_COUNT_UNKNOWN`] while the descriptor does not exist yet.
    pub fn cycle_count(&self) -> Result<u32> {
        let path = self.run_info_xml();
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(CYCLE_COUNT_UNKNOWN),
            Err(e) => return Err(e.into()),
        };
        parse_cycle_count(&raw).map_err(|reason| CoreError::MalformedDescriptor { path, reason })
    }
}

fn is_read_complete_marker(name: &str) -> bool {
    name.len() >= READ_COMPLETE_PREFIX.len() + READ_COMPLETE_SUFFIX.len()
        && name.starts_with(READ_COMPLETE_PREFIX)
        && name.ends_with(READ_COMPLETE_SUFFIX)
}

fn parse_cycle_count(raw: &str) -> std::result::Result<u32, String> {
    let doc = roxmltree::Document::parse(raw).map_err(|e| e.to_string())?;
    let mut count: u32 = 0;
    for run in doc.root_element().children().filter(|n| n.has_tag_name("Run")) {
        for reads in run.children().filter(|n| n.has_tag_name("Reads")) {
            for read in reads.children().filter(|n| n.has_tag_name("Read")) {
                let cycles = match read.attribute("NumCycles") {
                    Some(v) => v
                        .trim()
                        .parse::<u32>()
                        .map_err(|_| format!("invalid NumCycles value '{}'", v))?,
                    None => 0,
                };
                count = count
                    .checked_add(cycles)
                    .ok_or_else(|| "cycle count overflow".to_string())?;
            }
        }
    }
    Ok(count)
}

/// Run directories follow `<date>_<serial>_<position>_<flowcell>`.
pub fn is_valid_run_name(name: &str) -> bool {
    if name.contains('.') {
        return false;
    }
    let parts: Vec<&str> = name.split('_').collect();
    if parts.len() != 4 || parts.iter().any(|p| p.is_empty()) {
        return false;
    }
    parts[0].chars().all(|c| c.is_ascii_digit())
}

#[cfg(test)]
pub(crate) fn run_info_xml_for(read_cycles: &[u32]) -> String {
    let mut reads = String::new();
    for (idx, cycles) in read_cycles.iter().enumerate() {
        reads.push_str(&format!(
            "      <Read Number=\"{}\" NumCycles=\"{}\" IsIndexedRead=\"N\" />\n",
            idx + 1,
            cycles
        ));
    }
    format!(
        "<?xml version=\"1.0\"?>\n<RunInfo Version=\"2\">\n  <Run Id=\"200101_NB501234_0001_AHXXXXXX\" Number=\"1\">\n    <Reads>\n{}    </Reads>\n  </Run>\n</RunInfo>\n",
        reads
    )
}

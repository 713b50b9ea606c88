//! Parse FreeSurfer `aseg.stats` and `aparc.stats` reports into metrics.
//!
//! Two report families are handled:
//!
//! - `aseg.stats` — whole-brain segmentation: intracranial volume from a
//!   labeled line, subcortical structure volumes from the `ColHeaders`
//!   table, with a permissive whole-text scan as fallback for reports
//!   whose tabular layout deviates from the expected format.
//! - `{lh,rh}.aparc.stats` — cortical parcellation: three labeled-line
//!   scalars per hemisphere.
//!
//! Missing report files are never an error here: the affected metrics are
//! simply absent from the resulting record. Extraction per structure runs
//! an ordered strategy list (table lookup, then pattern scan); the first
//! strategy to produce a value wins, so fallback results never overwrite
//! table results.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::{Regex, RegexBuilder};
use thiserror::Error;
use tracing::{error, info, warn};

use nsp_core::MetricsRecord;

pub const CRATE_NAME: &str = "nsp-stats";

#[derive(Debug, Error)]
pub enum StatsError {
    #[error("reading {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hemisphere {
    Lh,
    Rh,
}

impl Hemisphere {
    pub const BOTH: [Hemisphere; 2] = [Hemisphere::Lh, Hemisphere::Rh];

    pub fn as_str(&self) -> &'static str {
        match self {
            Hemisphere::Lh => "lh",
            Hemisphere::Rh => "rh",
        }
    }
}

/// Subcortical volumes extracted from one `aseg.stats` report.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct VolumeMetrics {
    pub icv: Option<f64>,
    pub hippocampus_left: Option<f64>,
    pub hippocampus_right: Option<f64>,
    pub amygdala_left: Option<f64>,
    pub amygdala_right: Option<f64>,
}

impl VolumeMetrics {
    fn found_count(&self) -> usize {
        [
            self.icv,
            self.hippocampus_left,
            self.hippocampus_right,
            self.amygdala_left,
            self.amygdala_right,
        ]
        .iter()
        .filter(|m| m.is_some())
        .count()
    }
}

/// Cortical scalars extracted from one hemisphere's `aparc.stats` report.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ThicknessMetrics {
    pub mean_thickness: Option<f64>,
    pub total_area: Option<f64>,
    pub gray_volume: Option<f64>,
}

impl ThicknessMetrics {
    fn found_count(&self) -> usize {
        [self.mean_thickness, self.total_area, self.gray_volume]
            .iter()
            .filter(|m| m.is_some())
            .count()
    }
}

/// The four structures tracked from the segmentation table.
const STRUCTURES: [&str; 4] = [
    "Left-Hippocampus",
    "Right-Hippocampus",
    "Left-Amygdala",
    "Right-Amygdala",
];

/// One way of extracting a named structure's volume from the report text.
/// Strategies are tried in order; the first `Some` wins.
type StructureStrategy = fn(&str, &str) -> Option<f64>;

const STRUCTURE_STRATEGIES: [StructureStrategy; 2] = [table_lookup, pattern_scan];

fn extract_structure_volume(content: &str, structure: &str) -> Option<f64> {
    STRUCTURE_STRATEGIES
        .iter()
        .find_map(|strategy| strategy(content, structure))
}

/// Read the structure's volume from the tabular section: rows after a
/// header line containing both `ColHeaders` and `StructName`, skipping
/// comments and blanks, field index 3 = volume, field index 4 = name.
fn table_lookup(content: &str, structure: &str) -> Option<f64> {
    let mut in_table = false;
    for line in content.lines() {
        if line.contains("ColHeaders") && line.contains("StructName") {
            in_table = true;
            continue;
        }
        if !in_table {
            continue;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let parts: Vec<&str> = trimmed.split_whitespace().collect();
        if parts.len() < 5 {
            continue;
        }
        if !parts[4].contains(structure) {
            continue;
        }
        // Rows with an unparseable volume are skipped, not fatal.
        match parts[3].parse::<f64>() {
            Ok(volume) => return Some(volume),
            Err(_) => continue,
        }
    }
    None
}

/// Permissive whole-text scan: the structure name followed by the first
/// numeric token. Recovers data from reports whose table layout deviates
/// from the expected format.
fn pattern_scan(content: &str, structure: &str) -> Option<f64> {
    let pattern = format!(r"{}[^\d]*(\d+(?:\.\d+)?)", regex::escape(structure));
    let re = RegexBuilder::new(&pattern)
        .case_insensitive(true)
        .multi_line(true)
        .build()
        .ok()?;
    re.captures(content)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
}

fn icv_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        RegexBuilder::new(r"Intracranial Vol\s*=\s*([\d.]+)")
            .case_insensitive(true)
            .build()
            .expect("icv pattern compiles")
    })
}

fn labeled_value(re: &Regex, content: &str) -> Option<f64> {
    re.captures(content)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
}

/// Parse the text of an `aseg.stats` report.
///
/// Intracranial volume comes from the labeled `Intracranial Vol = ...`
/// line; the four tracked structures go through the ordered strategy
/// list. Any metric not found is simply absent.
pub fn parse_volume_report(content: &str) -> VolumeMetrics {
    let mut metrics = VolumeMetrics {
        icv: labeled_value(icv_regex(), content),
        ..VolumeMetrics::default()
    };

    for structure in STRUCTURES {
        let volume = extract_structure_volume(content, structure);
        match structure {
            "Left-Hippocampus" => metrics.hippocampus_left = volume,
            "Right-Hippocampus" => metrics.hippocampus_right = volume,
            "Left-Amygdala" => metrics.amygdala_left = volume,
            "Right-Amygdala" => metrics.amygdala_right = volume,
            _ => unreachable!(),
        }
    }

    metrics
}

fn thickness_regexes() -> &'static [Regex; 3] {
    static RES: OnceLock<[Regex; 3]> = OnceLock::new();
    RES.get_or_init(|| {
        let build = |pattern: &str| {
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .expect("aparc pattern compiles")
        };
        [
            build(r"mean thickness\s+=\s+([\d.]+)\s+mm"),
            build(r"total surface area\s+=\s+([\d.]+)\s+mm\^2"),
            build(r"total gray matter volume\s+=\s+([\d.]+)\s+mm\^3"),
        ]
    })
}

/// Parse the text of one hemisphere's `aparc.stats` report: three labeled
/// scalars, each independently optional.
pub fn parse_thickness_report(content: &str) -> ThicknessMetrics {
    let [thickness_re, area_re, grayvol_re] = thickness_regexes();
    ThicknessMetrics {
        mean_thickness: labeled_value(thickness_re, content),
        total_area: labeled_value(area_re, content),
        gray_volume: labeled_value(grayvol_re, content),
    }
}

/// Locates and parses stats reports under a FreeSurfer subjects directory.
#[derive(Debug, Clone)]
pub struct StatsParser {
    subjects_dir: PathBuf,
}

impl StatsParser {
    pub fn new(subjects_dir: impl Into<PathBuf>) -> Self {
        Self {
            subjects_dir: subjects_dir.into(),
        }
    }

    pub fn subjects_dir(&self) -> &Path {
        &self.subjects_dir
    }

    fn stats_dir(&self, subject_id: &str) -> PathBuf {
        self.subjects_dir.join(subject_id).join("stats")
    }

    fn read_report(&self, path: &Path) -> Result<String, StatsError> {
        std::fs::read_to_string(path).map_err(|source| StatsError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parse `aseg.stats` for subcortical volumes. A missing file yields
    /// empty metrics and a logged diagnostic, never an error.
    pub fn parse_aseg_stats(&self, subject_id: &str) -> Result<VolumeMetrics, StatsError> {
        let aseg_file = self.stats_dir(subject_id).join("aseg.stats");
        if !aseg_file.exists() {
            error!(path = %aseg_file.display(), "aseg.stats not found");
            return Ok(VolumeMetrics::default());
        }

        let content = self.read_report(&aseg_file)?;
        let metrics = parse_volume_report(&content);
        info!(
            subject_id,
            found = metrics.found_count(),
            "parsed aseg.stats"
        );
        Ok(metrics)
    }

    /// Parse one hemisphere's `aparc.stats` for cortical scalars. A
    /// missing file yields empty metrics and a logged diagnostic.
    pub fn parse_aparc_stats(
        &self,
        subject_id: &str,
        hemi: Hemisphere,
    ) -> Result<ThicknessMetrics, StatsError> {
        let aparc_file = self
            .stats_dir(subject_id)
            .join(format!("{}.aparc.stats", hemi.as_str()));
        if !aparc_file.exists() {
            warn!(path = %aparc_file.display(), "aparc.stats not found");
            return Ok(ThicknessMetrics::default());
        }

        let content = self.read_report(&aparc_file)?;
        let metrics = parse_thickness_report(&content);
        info!(
            subject_id,
            hemi = hemi.as_str(),
            found = metrics.found_count(),
            "parsed aparc.stats"
        );
        Ok(metrics)
    }

    /// Merge the volume report and both hemisphere thickness reports into
    /// one record tagged with the subject identifier. Always exactly one
    /// record, even when every source report is missing.
    pub fn extract_all_metrics(&self, subject_id: &str) -> Result<MetricsRecord, StatsError> {
        let volumes = self.parse_aseg_stats(subject_id)?;

        let mut record = MetricsRecord::new(subject_id);
        record.icv = volumes.icv;
        record.hippocampus_left = volumes.hippocampus_left;
        record.hippocampus_right = volumes.hippocampus_right;
        record.amygdala_left = volumes.amygdala_left;
        record.amygdala_right = volumes.amygdala_right;

        for hemi in Hemisphere::BOTH {
            let thickness = self.parse_aparc_stats(subject_id, hemi)?;
            match hemi {
                Hemisphere::Lh => {
                    record.mean_thickness_lh = thickness.mean_thickness;
                    record.total_area_lh = thickness.total_area;
                    record.gray_volume_lh = thickness.gray_volume;
                }
                Hemisphere::Rh => {
                    record.mean_thickness_rh = thickness.mean_thickness;
                    record.total_area_rh = thickness.total_area;
                    record.gray_volume_rh = thickness.gray_volume;
                }
            }
        }

        Ok(record)
    }
}

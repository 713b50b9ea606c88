//! Core domain model for the neuroimaging structural pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "nsp-core";

/// Terminal (or not-yet-started) state of one processing attempt.
///
/// Stored as the lowercase wire string in the `scans.processing_status`
/// column and in serialized pipeline results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Pending,
    Completed,
    Failed,
    Timeout,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Completed => "completed",
            ProcessingStatus::Failed => "failed",
            ProcessingStatus::Timeout => "timeout",
        }
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseStatusError(String);

impl fmt::Display for ParseStatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown processing status: {}", self.0)
    }
}

impl std::error::Error for ParseStatusError {}

impl FromStr for ProcessingStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ProcessingStatus::Pending),
            "completed" => Ok(ProcessingStatus::Completed),
            "failed" => Ok(ProcessingStatus::Failed),
            "timeout" => Ok(ProcessingStatus::Timeout),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

/// A study participant. Created lazily on first metrics load and never
/// mutated afterwards; `subject_id` is globally unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subject {
    pub id: i64,
    pub subject_id: String,
    pub created_at: DateTime<Utc>,
}

/// One imaging session plus its processing bookkeeping. `updated_at`
/// advances on every mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scan {
    pub id: i64,
    pub subject_id: String,
    pub scan_date: Option<DateTime<Utc>>,
    pub modality: String,
    pub nifti_path: Option<String>,
    pub processing_status: ProcessingStatus,
    pub processing_runtime_seconds: Option<f64>,
    pub freesurfer_output_dir: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only volumetric measurements row. Exactly one per completed
/// pipeline run; never updated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volumetric {
    pub id: i64,
    pub subject_id: String,
    pub scan_id: Option<i64>,
    pub icv: Option<f64>,
    pub hippocampus_left: Option<f64>,
    pub hippocampus_right: Option<f64>,
    pub amygdala_left: Option<f64>,
    pub amygdala_right: Option<f64>,
    pub mean_thickness_lh: Option<f64>,
    pub mean_thickness_rh: Option<f64>,
    pub total_area_lh: Option<f64>,
    pub total_area_rh: Option<f64>,
    pub gray_volume_lh: Option<f64>,
    pub gray_volume_rh: Option<f64>,
    pub created_at: DateTime<Utc>,
}

/// One extracted observation for one subject. Every metric is optional:
/// absent means "not measured / not found in the reports", which is not
/// an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub subject_id: String,
    pub icv: Option<f64>,
    pub hippocampus_left: Option<f64>,
    pub hippocampus_right: Option<f64>,
    pub amygdala_left: Option<f64>,
    pub amygdala_right: Option<f64>,
    pub mean_thickness_lh: Option<f64>,
    pub mean_thickness_rh: Option<f64>,
    pub total_area_lh: Option<f64>,
    pub total_area_rh: Option<f64>,
    pub gray_volume_lh: Option<f64>,
    pub gray_volume_rh: Option<f64>,
}

impl MetricsRecord {
    pub fn new(subject_id: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            icv: None,
            hippocampus_left: None,
            hippocampus_right: None,
            amygdala_left: None,
            amygdala_right: None,
            mean_thickness_lh: None,
            mean_thickness_rh: None,
            total_area_lh: None,
            total_area_rh: None,
            gray_volume_lh: None,
            gray_volume_rh: None,
        }
    }

    /// Number of metrics actually measured.
    pub fn measured_count(&self) -> usize {
        [
            self.icv,
            self.hippocampus_left,
            self.hippocampus_right,
            self.amygdala_left,
            self.amygdala_right,
            self.mean_thickness_lh,
            self.mean_thickness_rh,
            self.total_area_lh,
            self.total_area_rh,
            self.gray_volume_lh,
            self.gray_volume_rh,
        ]
        .iter()
        .filter(|m| m.is_some())
        .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            ProcessingStatus::Pending,
            ProcessingStatus::Completed,
            ProcessingStatus::Failed,
            ProcessingStatus::Timeout,
        ] {
            assert_eq!(status.as_str().parse::<ProcessingStatus>().unwrap(), status);
        }
        assert!("running".parse::<ProcessingStatus>().is_err());
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&ProcessingStatus::Timeout).unwrap();
        assert_eq!(json, "\"timeout\"");
    }

    #[test]
    fn empty_record_measures_nothing() {
        let record = MetricsRecord::new("sub-001");
        assert_eq!(record.subject_id, "sub-001");
        assert_eq!(record.measured_count(), 0);
    }

    #[test]
    fn measured_count_tracks_populated_fields() {
        let mut record = MetricsRecord::new("sub-001");
        record.icv = Some(1_500_000.0);
        record.mean_thickness_lh = Some(2.45);
        assert_eq!(record.measured_count(), 2);
    }
}

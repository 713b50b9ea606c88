//! DICOM ingestion: modality validation and NIfTI conversion.
//!
//! Validation samples DICOM file headers directly (preamble magic plus
//! the Modality element) rather than trusting file extensions alone.
//! Conversion shells out to `dcm2niix`; success requires both a zero exit
//! and the expected output file on disk afterwards, since the tool can
//! exit cleanly without producing the requested volume.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "nsp-ingest";

/// How many sampled files may be header-checked per directory.
const MODALITY_SAMPLE_LIMIT: usize = 10;

const DEFAULT_CONVERT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("no DICOM files found in {}", .0.display())]
    NoDicomFiles(PathBuf),
    #[error("expected MR modality, found: {found:?}")]
    WrongModality { found: Vec<String> },
    #[error("launching {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },
    #[error("dcm2niix failed: {stderr}")]
    ConverterFailed { stderr: String },
    #[error("dcm2niix completed but output file not found: {}", .0.display())]
    MissingOutput(PathBuf),
    #[error("dcm2niix conversion timed out after {}s", .0.as_secs())]
    ConverterTimeout(Duration),
    #[error("reading {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn collect_dicom_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), IngestError> {
    let entries = std::fs::read_dir(dir).map_err(|source| IngestError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_dicom_files(&path, out)?;
        } else if path.extension().is_some_and(|ext| ext == "dcm") {
            out.push(path);
        }
    }
    Ok(())
}

/// Pull the Modality value (tag 0008,0060) out of a DICOM file, if the
/// file carries the standard preamble and explicit-VR little-endian
/// encoding. Anything unreadable yields `None` rather than an error.
fn sniff_modality(bytes: &[u8]) -> Option<String> {
    if bytes.len() < 132 || &bytes[128..132] != b"DICM" {
        return None;
    }

    let mut offset = 132usize;
    while offset + 8 <= bytes.len() {
        let group = u16::from_le_bytes([bytes[offset], bytes[offset + 1]]);
        let element = u16::from_le_bytes([bytes[offset + 2], bytes[offset + 3]]);
        let vr = &bytes[offset + 4..offset + 6];
        if !vr.iter().all(u8::is_ascii_uppercase) {
            // Implicit-VR or corrupted stream; give up on this file.
            return None;
        }

        let (value_offset, value_len) = match vr {
            b"OB" | b"OW" | b"OF" | b"SQ" | b"UT" | b"UN" => {
                if offset + 12 > bytes.len() {
                    return None;
                }
                let len = u32::from_le_bytes([
                    bytes[offset + 8],
                    bytes[offset + 9],
                    bytes[offset + 10],
                    bytes[offset + 11],
                ]);
                (offset + 12, len as usize)
            }
            _ => {
                let len = u16::from_le_bytes([bytes[offset + 6], bytes[offset + 7]]);
                (offset + 8, len as usize)
            }
        };

        if value_offset + value_len > bytes.len() {
            return None;
        }

        if group == 0x0008 && element == 0x0060 {
            let raw = &bytes[value_offset..value_offset + value_len];
            let value = String::from_utf8_lossy(raw).trim().to_string();
            return if value.is_empty() { None } else { Some(value) };
        }
        // Elements are tag-ordered; Modality lives in group 0008.
        if group > 0x0008 {
            return None;
        }

        offset = value_offset + value_len;
    }

    None
}

/// Validate that a DICOM directory holds MR structural scans.
///
/// Samples the first few files' headers; files that cannot be read or
/// decoded are skipped with a warning. Fails when no `.dcm` files exist
/// at all, or when none of the sampled files reports the MR modality.
pub fn validate_modality(dicom_dir: &Path) -> Result<(), IngestError> {
    let mut dicom_files = Vec::new();
    collect_dicom_files(dicom_dir, &mut dicom_files)?;
    if dicom_files.is_empty() {
        return Err(IngestError::NoDicomFiles(dicom_dir.to_path_buf()));
    }

    let mut modalities = Vec::new();
    for file in dicom_files.iter().take(MODALITY_SAMPLE_LIMIT) {
        let bytes = match std::fs::read(file) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(path = %file.display(), error = %err, "error reading DICOM file");
                continue;
            }
        };
        if let Some(modality) = sniff_modality(&bytes) {
            if !modalities.contains(&modality) {
                modalities.push(modality);
            }
        }
    }

    if !modalities.iter().any(|m| m == "MR") {
        return Err(IngestError::WrongModality { found: modalities });
    }

    info!(
        files = dicom_files.len(),
        modalities = ?modalities,
        "validated DICOM directory"
    );
    Ok(())
}

/// Converts a DICOM directory into a compressed NIfTI volume.
#[async_trait]
pub trait NiftiConverter: Send + Sync {
    async fn convert(
        &self,
        dicom_dir: &Path,
        output_dir: &Path,
        subject_id: &str,
    ) -> Result<PathBuf, IngestError>;
}

/// `dcm2niix`-backed converter: gzip output plus BIDS sidecar JSON,
/// output named by subject and modality convention.
#[derive(Debug, Clone)]
pub struct Dcm2NiixConverter {
    tool_path: String,
    timeout: Duration,
}

impl Dcm2NiixConverter {
    pub fn new(tool_path: impl Into<String>) -> Self {
        Self {
            tool_path: tool_path.into(),
            timeout: DEFAULT_CONVERT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for Dcm2NiixConverter {
    fn default() -> Self {
        Self::new("dcm2niix")
    }
}

#[async_trait]
impl NiftiConverter for Dcm2NiixConverter {
    async fn convert(
        &self,
        dicom_dir: &Path,
        output_dir: &Path,
        subject_id: &str,
    ) -> Result<PathBuf, IngestError> {
        tokio::fs::create_dir_all(output_dir)
            .await
            .map_err(|source| IngestError::Io {
                path: output_dir.to_path_buf(),
                source,
            })?;

        let output_filename = format!("{subject_id}_T1w");
        let mut cmd = Command::new(&self.tool_path);
        cmd.arg("-o")
            .arg(output_dir)
            .arg("-f")
            .arg(&output_filename)
            .args(["-z", "y", "-b", "y"])
            .arg(dicom_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|source| IngestError::Spawn {
            tool: self.tool_path.clone(),
            source,
        })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                return Err(IngestError::Spawn {
                    tool: self.tool_path.clone(),
                    source,
                })
            }
            Err(_) => {
                error!(tool = %self.tool_path, "dcm2niix conversion timed out");
                return Err(IngestError::ConverterTimeout(self.timeout));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!(stderr = %stderr, "dcm2niix failed");
            return Err(IngestError::ConverterFailed { stderr });
        }

        let nifti_file = output_dir.join(format!("{output_filename}.nii.gz"));
        if !nifti_file.exists() {
            error!(path = %nifti_file.display(), "dcm2niix exited cleanly but produced no output");
            return Err(IngestError::MissingOutput(nifti_file));
        }

        info!(path = %nifti_file.display(), "converted DICOM to NIfTI");
        Ok(nifti_file)
    }
}

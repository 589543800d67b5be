//! Open Ephys acquisition files
//!
//! An Open Ephys recording node writes a `structure.oebin` JSON manifest
//! describing every continuous stream it captured. Only Neuropixels
//! streams matter here; other processors (ADCs, sync lines) are skipped.

use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use spikeline_core::{Error, Result};

const DIR_DATETIME_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// One Neuropixels continuous stream from the manifest
#[derive(Debug, Clone)]
pub struct OebinRecording {
    pub folder_name: String,
    pub probe_serial: String,
    pub sampling_rate: f64,
    pub channel_count: i64,
}

/// Parsed `structure.oebin` manifest
#[derive(Debug, Clone)]
pub struct OebinFile {
    pub path: PathBuf,
    pub recordings: Vec<OebinRecording>,
}

impl OebinFile {
    pub fn from_file(path: &Path) -> Result<OebinFile> {
        let text = std::fs::read_to_string(path)?;
        let value: serde_json::Value = serde_json::from_str(&text).map_err(|e| {
            Error::MissingData(format!("malformed oebin {}: {}", path.display(), e))
        })?;

        let continuous = value
            .get("continuous")
            .and_then(|v| v.as_array())
            .ok_or_else(|| {
                Error::MissingData(format!(
                    "{} has no 'continuous' section",
                    path.display()
                ))
            })?;

        let mut recordings = Vec::new();
        for entry in continuous {
            let folder_name = entry
                .get("folder_name")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .trim_end_matches('/')
                .to_string();
            let processor = entry
                .get("source_processor_name")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            if !folder_name.to_lowercase().contains("neuropix")
                && !processor.to_lowercase().contains("neuropix")
            {
                continue;
            }

            let probe_serial = match entry.get("probe_serial_number") {
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => {
                    return Err(Error::MissingData(format!(
                        "stream '{}' in {} names no probe serial number",
                        folder_name,
                        path.display()
                    )))
                }
            };
            let sampling_rate = entry
                .get("sample_rate")
                .and_then(|v| v.as_f64())
                .ok_or_else(|| {
                    Error::MissingData(format!(
                        "stream '{}' in {} has no sample rate",
                        folder_name,
                        path.display()
                    ))
                })?;
            let channel_count = entry
                .get("num_channels")
                .and_then(|v| v.as_i64())
                .ok_or_else(|| {
                    Error::MissingData(format!(
                        "stream '{}' in {} has no channel count",
                        folder_name,
                        path.display()
                    ))
                })?;

            recordings.push(OebinRecording {
                folder_name,
                probe_serial,
                sampling_rate,
                channel_count,
            });
        }

        Ok(OebinFile {
            path: path.to_path_buf(),
            recordings,
        })
    }
}

/// Recording start time from an Open Ephys session directory name such as
/// `2018-07-03_20-32-28`, searching the path's components innermost first
pub fn datetime_from_path(path: &Path) -> Option<NaiveDateTime> {
    path.components().rev().find_map(|component| {
        let name = component.as_os_str().to_string_lossy();
        NaiveDateTime::parse_from_str(&name, DIR_DATETIME_FORMAT).ok()
    })
}

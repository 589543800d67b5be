//! SpikeGLX acquisition files
//!
//! SpikeGLX writes one `.meta` sidecar per binary stream, a flat
//! `key=value` file. The action-potential stream (`.ap`) carries the probe
//! identity and clock; the low-frequency stream (`.lf`) carries the
//! downsampled trace used for LFP extraction.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use spikeline_core::{Error, Result};

const CREATE_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Parsed `.meta` sidecar
#[derive(Debug, Clone)]
pub struct SpikeGlxMeta {
    path: PathBuf,
    fields: BTreeMap<String, String>,
}

impl SpikeGlxMeta {
    pub fn from_file(path: &Path) -> Result<SpikeGlxMeta> {
        let text = std::fs::read_to_string(path)?;
        let mut fields = BTreeMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                // table-valued keys are prefixed with '~'
                let key = key.trim().trim_start_matches('~');
                fields.insert(key.to_string(), value.trim().to_string());
            }
        }
        Ok(SpikeGlxMeta {
            path: path.to_path_buf(),
            fields,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(|s| s.as_str())
    }

    fn required(&self, key: &str) -> Result<&str> {
        self.get(key).ok_or_else(|| {
            Error::MissingData(format!("{} is missing '{}'", self.path.display(), key))
        })
    }

    fn required_parsed<T: std::str::FromStr>(&self, key: &str) -> Result<T> {
        self.required(key)?.parse::<T>().map_err(|_| {
            Error::MissingData(format!(
                "{} has an unreadable '{}' value",
                self.path.display(),
                key
            ))
        })
    }

    /// Hardware serial number of the probe
    pub fn probe_serial(&self) -> Result<String> {
        // 3A systems write imProbeSN, later ones imDatPrb_sn
        if let Some(sn) = self.get("imDatPrb_sn").or_else(|| self.get("imProbeSN")) {
            return Ok(sn.to_string());
        }
        Err(Error::MissingData(format!(
            "{} names no probe serial number",
            self.path.display()
        )))
    }

    /// Probe model derived from the probe type code
    pub fn probe_model(&self) -> Result<String> {
        let model = match self.get("imDatPrb_type") {
            None => "neuropixels 1.0 - 3A",
            Some(code) => {
                let code: i64 = code.parse().map_err(|_| {
                    Error::MissingData(format!(
                        "{} has an unreadable 'imDatPrb_type' value",
                        self.path.display()
                    ))
                })?;
                match code {
                    0 | 1 => "neuropixels 1.0 - 3B",
                    1100 => "neuropixels UHD",
                    21 => "neuropixels 2.0 - SS",
                    24 => "neuropixels 2.0 - MS",
                    other => {
                        return Err(Error::Unsupported(format!(
                            "probe type code {} in {}",
                            other,
                            self.path.display()
                        )))
                    }
                }
            }
        };
        Ok(model.to_string())
    }

    pub fn sampling_rate(&self) -> Result<f64> {
        self.required_parsed("imSampRate")
    }

    pub fn channel_count(&self) -> Result<i64> {
        self.required_parsed("nSavedChans")
    }

    pub fn recording_datetime(&self) -> Result<NaiveDateTime> {
        let raw = self.required("fileCreateTime")?;
        NaiveDateTime::parse_from_str(raw, CREATE_TIME_FORMAT).map_err(|_| {
            Error::MissingData(format!(
                "{} has an unreadable 'fileCreateTime' value '{}'",
                self.path.display(),
                raw
            ))
        })
    }

    /// Samples per channel in the companion binary, from the declared
    /// file size
    pub fn sample_count(&self) -> Result<i64> {
        let bytes: i64 = self.required_parsed("fileSizeBytes")?;
        let channels = self.channel_count()?;
        if channels <= 0 {
            return Err(Error::MissingData(format!(
                "{} declares no saved channels",
                self.path.display()
            )));
        }
        Ok(bytes / (2 * channels))
    }

    /// The `.bin` this sidecar describes
    pub fn bin_path(&self) -> PathBuf {
        self.path.with_extension("bin")
    }
}

/// Probe insertion number from an `imec<N>` tag in the file or directory
/// name, e.g. `npx_g0_t0.imec1.ap.meta` or `..._imec1/`.
pub fn insertion_number_from_path(path: &Path) -> Option<i64> {
    let name = path.file_name()?.to_string_lossy();
    let start = name.rfind("imec")? + "imec".len();
    let digits: String = name[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Interleaved little-endian i16 samples from a SpikeGLX binary
pub fn read_i16_samples(path: &Path) -> Result<Vec<i16>> {
    let bytes = std::fs::read(path)?;
    if bytes.len() % 2 != 0 {
        return Err(Error::MissingData(format!(
            "{} has an odd byte count",
            path.display()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect())
}

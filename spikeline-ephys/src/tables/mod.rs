//! Make callbacks for the auto-populated entities, plus the task and
//! curation helpers that feed them.
//!
//! Every make reads upstream rows through the store and raw files through
//! the configured data roots, then hands the computed attributes back to
//! the scheduler. None of them write to the database themselves.

pub mod clustering;
pub mod curated;
pub mod curation;
pub mod lfp;
pub mod recording;
pub mod waveform;

use std::path::{Path, PathBuf};

use spikeline_core::{AttrMap, Error, Restriction, Result, Store};
use walkdir::WalkDir;

use crate::keys::{InsertionKey, SessionKey};
use crate::paths;
use crate::readers::spikeglx;
use crate::schema::{attr, entity};

/// Session directory as registered at ingest time (relative, forward
/// slashes).
pub(crate) async fn stored_session_dir(store: &Store, session: &SessionKey) -> Result<String> {
    let restriction = Restriction::from_key(&session.to_key());
    let rows = store
        .fetch_rows(entity::SESSION_DIRECTORY, &restriction)
        .await?;
    let row = rows.into_iter().next().ok_or_else(|| {
        Error::MissingData(format!("no session directory registered for {}", session))
    })?;
    text_field(&row, entity::SESSION_DIRECTORY, attr::SESSION_DIR)
}

/// Registered session directory resolved against the data roots.
pub(crate) async fn resolve_session_dir(
    store: &Store,
    roots: &[PathBuf],
    session: &SessionKey,
) -> Result<PathBuf> {
    let stored = stored_session_dir(store, session).await?;
    paths::find_full_path(roots, Path::new(&stored))
}

/// Serial number of the probe recorded for an insertion.
pub(crate) async fn probe_serial(store: &Store, insertion: &InsertionKey) -> Result<String> {
    let row = store
        .fetch_row(entity::PROBE_INSERTION, &insertion.to_key())
        .await?;
    text_field(&row, entity::PROBE_INSERTION, attr::PROBE)
}

/// SpikeGLX sidecar files under `dir` that belong to one insertion,
/// sorted by path. `suffix` selects the stream (".ap.meta" or
/// ".lf.meta"). Files without an imec tag count as insertion 0, which
/// covers 3A sessions with a single untagged probe.
pub(crate) fn find_stream_metas(
    dir: &Path,
    insertion_number: i64,
    suffix: &str,
) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if !name.ends_with(suffix) {
            continue;
        }
        let path = entry.path().to_path_buf();
        let number = spikeglx::insertion_number_from_path(&path)
            .or_else(|| path.parent().and_then(spikeglx::insertion_number_from_path))
            .unwrap_or(0);
        if number == insertion_number {
            found.push(path);
        }
    }
    found.sort();
    if found.is_empty() {
        return Err(Error::MissingData(format!(
            "no '{}' files for insertion {} under {}",
            suffix,
            insertion_number,
            dir.display()
        )));
    }
    Ok(found)
}

/// Spike sample indices rendered as seconds for storage.
pub(crate) fn seconds_json(samples: &[i64], sampling_rate: f64) -> serde_json::Value {
    let values: Vec<serde_json::Value> = samples
        .iter()
        .map(|s| serde_json::Value::from(*s as f64 / sampling_rate))
        .collect();
    serde_json::Value::Array(values)
}

/// Stored spike times back into a numeric vector.
pub(crate) fn seconds_from_json(value: &serde_json::Value) -> Result<Vec<f64>> {
    let array = value
        .as_array()
        .ok_or_else(|| Error::Internal("stored spike times are not an array".to_string()))?;
    array
        .iter()
        .map(|v| {
            v.as_f64()
                .ok_or_else(|| Error::Internal("stored spike time is not a number".to_string()))
        })
        .collect()
}

pub(crate) fn text_field(row: &AttrMap, entity: &str, name: &str) -> Result<String> {
    row.get(name)
        .and_then(|v| v.as_text())
        .map(str::to_string)
        .ok_or_else(|| missing_field(entity, name))
}

pub(crate) fn int_field(row: &AttrMap, entity: &str, name: &str) -> Result<i64> {
    row.get(name)
        .and_then(|v| v.as_int())
        .ok_or_else(|| missing_field(entity, name))
}

pub(crate) fn real_field(row: &AttrMap, entity: &str, name: &str) -> Result<f64> {
    row.get(name)
        .and_then(|v| v.as_real())
        .ok_or_else(|| missing_field(entity, name))
}

pub(crate) fn json_field<'a>(
    row: &'a AttrMap,
    entity: &str,
    name: &str,
) -> Result<&'a serde_json::Value> {
    row.get(name)
        .and_then(|v| v.as_json())
        .ok_or_else(|| missing_field(entity, name))
}

fn missing_field(entity: &str, name: &str) -> Error {
    Error::Internal(format!("{} row lacks attribute '{}'", entity, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seconds_json_roundtrip() {
        let json = seconds_json(&[30000, 45000, 60000], 30000.0);
        let times = seconds_from_json(&json).unwrap();
        assert_eq!(times, vec![1.0, 1.5, 2.0]);
    }

    #[test]
    fn test_seconds_from_json_rejects_non_array() {
        let err = seconds_from_json(&serde_json::json!({"a": 1})).unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[test]
    fn test_find_stream_metas_separates_insertions() {
        let dir = tempfile::tempdir().unwrap();
        let g0 = dir.path().join("run_g0_imec0");
        let g1 = dir.path().join("run_g0_imec1");
        std::fs::create_dir_all(&g0).unwrap();
        std::fs::create_dir_all(&g1).unwrap();
        std::fs::write(g0.join("run_g0_t0.imec0.ap.meta"), "a=b\n").unwrap();
        std::fs::write(g0.join("run_g0_t1.imec0.ap.meta"), "a=b\n").unwrap();
        std::fs::write(g0.join("run_g0_t0.imec0.lf.meta"), "a=b\n").unwrap();
        std::fs::write(g1.join("run_g0_t0.imec1.ap.meta"), "a=b\n").unwrap();

        let imec0 = find_stream_metas(dir.path(), 0, ".ap.meta").unwrap();
        assert_eq!(imec0.len(), 2);
        let imec1 = find_stream_metas(dir.path(), 1, ".ap.meta").unwrap();
        assert_eq!(imec1.len(), 1);
        let lf = find_stream_metas(dir.path(), 0, ".lf.meta").unwrap();
        assert_eq!(lf.len(), 1);

        let err = find_stream_metas(dir.path(), 2, ".ap.meta").unwrap_err();
        assert!(matches!(err, Error::MissingData(_)));
    }

    #[test]
    fn test_untagged_meta_counts_as_insertion_zero() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("phase3a_g0_t0.ap.meta"), "a=b\n").unwrap();
        let found = find_stream_metas(dir.path(), 0, ".ap.meta").unwrap();
        assert_eq!(found.len(), 1);
    }
}

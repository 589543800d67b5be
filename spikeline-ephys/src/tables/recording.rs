//! Import of acquisition metadata into `ephys_recording`.
//!
//! The make locates the raw files for one probe insertion, reads the
//! stream parameters from the SpikeGLX sidecar (or the Open Ephys
//! `structure.oebin`), and registers every metadata file it used as an
//! `ephys_file` part row. Recordings whose files are absent or whose
//! probe serial disagrees with the registered insertion fail with
//! `MissingData` and stay pending.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::NaiveDateTime;
use spikeline_core::{AttrMap, AttrValue, EntityKey, EntityMake, Error, MakeResult, Result, Store};
use tracing::debug;
use walkdir::WalkDir;

use crate::keys::InsertionKey;
use crate::paths;
use crate::readers::{openephys, spikeglx};
use crate::schema::{attr, entity};
use crate::tables::{find_stream_metas, probe_serial, resolve_session_dir};

pub const ACQ_SPIKEGLX: &str = "SpikeGLX";
pub const ACQ_OPENEPHYS: &str = "OpenEphys";

pub struct EphysRecordingMake {
    roots: Vec<PathBuf>,
}

impl EphysRecordingMake {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        EphysRecordingMake { roots }
    }

    fn from_spikeglx(
        &self,
        insertion: &InsertionKey,
        serial: &str,
        session_dir: &Path,
        meta_paths: &[PathBuf],
    ) -> Result<MakeResult> {
        let mut parsed = Vec::with_capacity(meta_paths.len());
        for path in meta_paths {
            let meta = spikeglx::SpikeGlxMeta::from_file(path)?;
            let meta_serial = meta.probe_serial()?;
            if meta_serial != serial {
                return Err(Error::MissingData(format!(
                    "probe serial {} in {} does not match serial {} registered for {}",
                    meta_serial,
                    path.display(),
                    serial,
                    insertion
                )));
            }
            parsed.push(meta);
        }
        let first = parsed.first().ok_or_else(|| {
            Error::MissingData(format!("no SpikeGLX metadata for {}", insertion))
        })?;

        let sampling_rate = first.sampling_rate()?;
        let channel_count = first.channel_count()?;
        let mut recording_datetime = first.recording_datetime()?;
        for meta in &parsed[1..] {
            let dt = meta.recording_datetime()?;
            if dt < recording_datetime {
                recording_datetime = dt;
            }
        }

        let mut files = Vec::new();
        for meta in &parsed {
            files.push(self.file_row(meta.path())?);
        }
        // LFP sidecars belong to the same recording when present
        if let Ok(lf_paths) =
            find_stream_metas(session_dir, insertion.insertion_number, ".lf.meta")
        {
            for path in &lf_paths {
                files.push(self.file_row(path)?);
            }
        }

        debug!(
            insertion = %insertion,
            files = files.len(),
            sampling_rate,
            "Read SpikeGLX recording metadata"
        );
        Ok(MakeResult::new()
            .with_master(master_row(
                ACQ_SPIKEGLX,
                sampling_rate,
                channel_count,
                recording_datetime,
            ))
            .with_part(entity::EPHYS_FILE, files))
    }

    fn from_openephys(
        &self,
        insertion: &InsertionKey,
        serial: &str,
        session_dir: &Path,
    ) -> Result<MakeResult> {
        let mut oebins: Vec<PathBuf> = WalkDir::new(session_dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file() && e.file_name() == "structure.oebin")
            .map(|e| e.into_path())
            .collect();
        oebins.sort();
        if oebins.is_empty() {
            return Err(Error::MissingData(format!(
                "no acquisition output for {} under {}",
                insertion,
                session_dir.display()
            )));
        }

        // Streams are numbered in discovery order, one insertion per
        // distinct probe serial, mirroring ingest.
        let mut seen: Vec<String> = Vec::new();
        for path in &oebins {
            let oebin = openephys::OebinFile::from_file(path)?;
            for stream in &oebin.recordings {
                let index = match seen.iter().position(|s| s == &stream.probe_serial) {
                    Some(i) => i as i64,
                    None => {
                        seen.push(stream.probe_serial.clone());
                        (seen.len() - 1) as i64
                    }
                };
                if index != insertion.insertion_number {
                    continue;
                }
                if stream.probe_serial != serial {
                    return Err(Error::MissingData(format!(
                        "probe serial {} in {} does not match serial {} registered for {}",
                        stream.probe_serial,
                        path.display(),
                        serial,
                        insertion
                    )));
                }
                let recording_datetime = openephys::datetime_from_path(path)
                    .unwrap_or(insertion.session.session_datetime);
                debug!(
                    insertion = %insertion,
                    stream = %stream.folder_name,
                    "Read Open Ephys recording metadata"
                );
                return Ok(MakeResult::new()
                    .with_master(master_row(
                        ACQ_OPENEPHYS,
                        stream.sampling_rate,
                        stream.channel_count,
                        recording_datetime,
                    ))
                    .with_part(entity::EPHYS_FILE, vec![self.file_row(path)?]));
            }
        }
        Err(Error::MissingData(format!(
            "no Open Ephys stream for {} under {}",
            insertion,
            session_dir.display()
        )))
    }

    fn file_row(&self, path: &Path) -> Result<AttrMap> {
        let relative = paths::relative_path(&self.roots, path)?;
        let mut row = AttrMap::new();
        row.insert(
            attr::FILE_PATH.to_string(),
            AttrValue::Text(paths::to_posix(&relative)),
        );
        Ok(row)
    }
}

fn master_row(
    acq_software: &str,
    sampling_rate: f64,
    channel_count: i64,
    recording_datetime: NaiveDateTime,
) -> AttrMap {
    let mut master = AttrMap::new();
    master.insert(
        attr::ACQ_SOFTWARE.to_string(),
        AttrValue::Text(acq_software.to_string()),
    );
    master.insert(
        attr::SAMPLING_RATE.to_string(),
        AttrValue::Real(sampling_rate),
    );
    master.insert("channel_count".to_string(), AttrValue::Int(channel_count));
    master.insert(
        "recording_datetime".to_string(),
        AttrValue::Timestamp(recording_datetime),
    );
    master
}

#[async_trait]
impl EntityMake for EphysRecordingMake {
    fn entity(&self) -> &str {
        entity::EPHYS_RECORDING
    }

    async fn make(&self, store: &Store, key: &EntityKey) -> Result<MakeResult> {
        let insertion = InsertionKey::from_key(key)?;
        let serial = probe_serial(store, &insertion).await?;
        let session_dir = resolve_session_dir(store, &self.roots, &insertion.session).await?;

        match find_stream_metas(&session_dir, insertion.insertion_number, ".ap.meta") {
            Ok(metas) => self.from_spikeglx(&insertion, &serial, &session_dir, &metas),
            Err(_) => self.from_openephys(&insertion, &serial, &session_dir),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spikeline_core::{OnConflict, Restriction, StoreConfig};

    use crate::schema::{build_registry, EphysMode};

    const AP_META: &str = "\
typeThis=imec\n\
imSampRate=30000.0\n\
nSavedChans=385\n\
fileSizeBytes=770000\n\
fileCreateTime=2018-07-03T20:32:28\n\
imDatPrb_sn=17131311651\n\
imDatPrb_type=0\n\
~imroTbl=(0,384)\n";

    async fn store_with_insertion(root: &Path) -> (Store, EntityKey) {
        let registry = build_registry(EphysMode::Curated).unwrap();
        let store = Store::open(registry, &StoreConfig::default()).await.unwrap();

        let datetime = chrono::NaiveDate::from_ymd_opt(2018, 7, 3)
            .unwrap()
            .and_hms_opt(20, 32, 28)
            .unwrap();
        let mut subject = AttrMap::new();
        subject.insert("subject".to_string(), AttrValue::Text("subject6".into()));
        store
            .insert(entity::SUBJECT, &subject, OnConflict::Error)
            .await
            .unwrap();

        let mut session = AttrMap::new();
        session.insert("subject".to_string(), AttrValue::Text("subject6".into()));
        session.insert(
            "session_datetime".to_string(),
            AttrValue::Timestamp(datetime),
        );
        store
            .insert(entity::SESSION, &session, OnConflict::Error)
            .await
            .unwrap();

        let mut dir_row = session.clone();
        dir_row.insert(
            "session_dir".to_string(),
            AttrValue::Text("subject6/session1".into()),
        );
        store
            .insert(entity::SESSION_DIRECTORY, &dir_row, OnConflict::Error)
            .await
            .unwrap();

        let mut probe = AttrMap::new();
        probe.insert("probe".to_string(), AttrValue::Text("17131311651".into()));
        probe.insert(
            "probe_type".to_string(),
            AttrValue::Text("neuropixels 1.0 - 3B".into()),
        );
        store
            .insert(entity::PROBE, &probe, OnConflict::Error)
            .await
            .unwrap();

        let mut insertion = session.clone();
        insertion.insert("insertion_number".to_string(), AttrValue::Int(0));
        insertion.insert("probe".to_string(), AttrValue::Text("17131311651".into()));
        store
            .insert(entity::PROBE_INSERTION, &insertion, OnConflict::Error)
            .await
            .unwrap();

        let stream = root.join("subject6/session1/run_g0_imec0");
        std::fs::create_dir_all(&stream).unwrap();
        std::fs::write(stream.join("run_g0_t0.imec0.ap.meta"), AP_META).unwrap();

        let key = EntityKey::new()
            .with("subject", "subject6")
            .with("session_datetime", datetime)
            .with("insertion_number", 0i64);
        (store, key)
    }

    #[tokio::test]
    async fn test_make_reads_spikeglx_stream() {
        let root = tempfile::tempdir().unwrap();
        let (store, key) = store_with_insertion(root.path()).await;
        let make = EphysRecordingMake::new(vec![root.path().to_path_buf()]);

        let result = make.make(&store, &key).await.unwrap();
        assert_eq!(
            result.master.get(attr::ACQ_SOFTWARE).and_then(|v| v.as_text()),
            Some(ACQ_SPIKEGLX)
        );
        assert_eq!(
            result.master.get(attr::SAMPLING_RATE).and_then(|v| v.as_real()),
            Some(30000.0)
        );
        assert_eq!(
            result.master.get("channel_count").and_then(|v| v.as_int()),
            Some(385)
        );

        assert_eq!(result.parts.len(), 1);
        assert_eq!(result.parts[0].entity, entity::EPHYS_FILE);
        let file = result.parts[0].rows[0]
            .get(attr::FILE_PATH)
            .and_then(|v| v.as_text())
            .unwrap();
        assert_eq!(
            file,
            "subject6/session1/run_g0_imec0/run_g0_t0.imec0.ap.meta"
        );
    }

    #[tokio::test]
    async fn test_serial_mismatch_is_missing_data() {
        let root = tempfile::tempdir().unwrap();
        let (store, key) = store_with_insertion(root.path()).await;

        let meta = root
            .path()
            .join("subject6/session1/run_g0_imec0/run_g0_t0.imec0.ap.meta");
        let swapped = AP_META.replace("17131311651", "99999999999");
        std::fs::write(&meta, swapped).unwrap();

        let make = EphysRecordingMake::new(vec![root.path().to_path_buf()]);
        let err = make.make(&store, &key).await.unwrap_err();
        assert!(matches!(err, Error::MissingData(_)), "{err}");
    }

    #[tokio::test]
    async fn test_missing_files_leave_key_pending() {
        let root = tempfile::tempdir().unwrap();
        let (store, key) = store_with_insertion(root.path()).await;
        std::fs::remove_file(
            root.path()
                .join("subject6/session1/run_g0_imec0/run_g0_t0.imec0.ap.meta"),
        )
        .unwrap();

        let make = EphysRecordingMake::new(vec![root.path().to_path_buf()]);
        let err = make.make(&store, &key).await.unwrap_err();
        assert!(matches!(err, Error::MissingData(_)), "{err}");
        // nothing was inserted, the key stays computable later
        assert_eq!(
            store
                .count(entity::EPHYS_RECORDING, &Restriction::all())
                .await
                .unwrap(),
            0
        );
    }
}

//! Manifest-driven ingest of subjects and sessions
//!
//! Operators describe their animals and recording sessions in two small
//! CSV files. Subjects are inserted verbatim; sessions are located under
//! the configured data roots and scanned for acquisition output, which
//! also yields the probes and probe insertions for each session.
//!
//! Ingest is idempotent: rows that already exist are left untouched, so
//! re-running after adding sessions to the manifest only picks up the new
//! ones.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, NaiveDateTime};
use spikeline_core::key::TIMESTAMP_FORMAT;
use spikeline_core::{AttrMap, AttrValue, Error, OnConflict, Result, Store};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::paths;
use crate::readers::{openephys, spikeglx};
use crate::schema::{attr, entity};

/// Outcome of a subject manifest ingest
#[derive(Debug, Default)]
pub struct SubjectIngest {
    pub rows_read: usize,
    pub inserted: u64,
}

/// Outcome of a session manifest ingest
#[derive(Debug, Default)]
pub struct SessionIngest {
    pub rows_read: usize,
    pub sessions_inserted: u64,
    pub probes_inserted: u64,
    pub directories_inserted: u64,
    pub insertions_inserted: u64,
    /// Session directories skipped with the reason, e.g. nothing recorded
    pub skipped: Vec<String>,
}

/// Insert subjects from a CSV manifest with columns `subject` and
/// optionally `sex`, `subject_birth_date`, `subject_description`.
pub async fn ingest_subjects(store: &Store, csv_path: &Path) -> Result<SubjectIngest> {
    let table = CsvTable::load(csv_path)?;
    let subject_col = table.column("subject")?;
    let sex_col = table.optional_column("sex");
    let birth_col = table.optional_column("subject_birth_date");
    let desc_col = table.optional_column("subject_description");

    let mut batch = Vec::with_capacity(table.rows.len());
    for (line, row) in table.rows.iter().enumerate() {
        let mut attrs = AttrMap::new();
        attrs.insert(
            attr::SUBJECT.to_string(),
            AttrValue::Text(table.cell(row, subject_col)),
        );
        if let Some(sex) = sex_col.and_then(|c| table.optional_cell(row, c)) {
            attrs.insert("sex".to_string(), AttrValue::Text(sex));
        }
        if let Some(raw) = birth_col.and_then(|c| table.optional_cell(row, c)) {
            let parsed = parse_manifest_datetime(&raw).ok_or_else(|| {
                Error::InvalidInput(format!(
                    "{} row {}: unreadable birth date '{}'",
                    csv_path.display(),
                    line + 2,
                    raw
                ))
            })?;
            attrs.insert(
                "subject_birth_date".to_string(),
                AttrValue::Timestamp(parsed),
            );
        }
        if let Some(desc) = desc_col.and_then(|c| table.optional_cell(row, c)) {
            attrs.insert("subject_description".to_string(), AttrValue::Text(desc));
        }
        batch.push(attrs);
    }

    let inserted = store
        .insert_many(entity::SUBJECT, &batch, OnConflict::Ignore)
        .await?;
    info!(
        rows = table.rows.len(),
        inserted,
        "Ingested subject manifest {}",
        csv_path.display()
    );
    Ok(SubjectIngest {
        rows_read: table.rows.len(),
        inserted,
    })
}

/// Insert sessions from a CSV manifest with columns `subject` and
/// `session_dir` (relative to a data root), plus optional `user` (or
/// `experimenter`) and `session_note`. Each directory is scanned for
/// acquisition output; directories with none are skipped with a warning.
pub async fn ingest_sessions(
    store: &Store,
    roots: &[PathBuf],
    csv_path: &Path,
) -> Result<SessionIngest> {
    let table = CsvTable::load(csv_path)?;
    let subject_col = table.column("subject")?;
    let dir_col = table.column("session_dir")?;
    let experimenter_col = table
        .optional_column("user")
        .or_else(|| table.optional_column("experimenter"));
    let note_col = table.optional_column("session_note");

    let mut report = SessionIngest {
        rows_read: table.rows.len(),
        ..SessionIngest::default()
    };

    // batches keyed up front so inserts can run in dependency order
    let mut probes: BTreeMap<String, String> = BTreeMap::new();
    let mut sessions: Vec<AttrMap> = Vec::new();
    let mut directories: Vec<AttrMap> = Vec::new();
    let mut insertions: Vec<AttrMap> = Vec::new();

    for row in &table.rows {
        let subject = table.cell(row, subject_col);
        let session_dir = table.cell(row, dir_col);

        let full_dir = match paths::find_full_path(roots, Path::new(&session_dir)) {
            Ok(dir) => dir,
            Err(err) => {
                warn!(subject, session_dir, %err, "Skipping session: directory not found");
                report.skipped.push(session_dir);
                continue;
            }
        };

        let discovered = match scan_session_dir(&full_dir)? {
            Some(found) => found,
            None => {
                warn!(subject, session_dir, "Skipping session: no acquisition output");
                report.skipped.push(session_dir);
                continue;
            }
        };
        debug!(
            subject,
            session_dir,
            acq_software = discovered.acq_software,
            insertions = discovered.insertions.len(),
            "Discovered session"
        );

        for (serial, model) in &discovered.probes {
            probes.entry(serial.clone()).or_insert_with(|| model.clone());
        }

        let mut session = AttrMap::new();
        session.insert(attr::SUBJECT.to_string(), AttrValue::Text(subject.clone()));
        session.insert(
            attr::SESSION_DATETIME.to_string(),
            AttrValue::Timestamp(discovered.session_datetime),
        );
        if let Some(experimenter) = experimenter_col.and_then(|c| table.optional_cell(row, c)) {
            session.insert("experimenter".to_string(), AttrValue::Text(experimenter));
        }
        if let Some(note) = note_col.and_then(|c| table.optional_cell(row, c)) {
            session.insert("session_note".to_string(), AttrValue::Text(note));
        }
        sessions.push(session.clone());

        let mut directory = AttrMap::new();
        directory.insert(attr::SUBJECT.to_string(), AttrValue::Text(subject.clone()));
        directory.insert(
            attr::SESSION_DATETIME.to_string(),
            AttrValue::Timestamp(discovered.session_datetime),
        );
        directory.insert(
            attr::SESSION_DIR.to_string(),
            AttrValue::Text(paths::to_posix(&paths::relative_path(roots, &full_dir)?)),
        );
        directories.push(directory);

        for (number, serial) in &discovered.insertions {
            let mut insertion = AttrMap::new();
            insertion.insert(attr::SUBJECT.to_string(), AttrValue::Text(subject.clone()));
            insertion.insert(
                attr::SESSION_DATETIME.to_string(),
                AttrValue::Timestamp(discovered.session_datetime),
            );
            insertion.insert(
                attr::INSERTION_NUMBER.to_string(),
                AttrValue::Int(*number),
            );
            insertion.insert(attr::PROBE.to_string(), AttrValue::Text(serial.clone()));
            insertions.push(insertion);
        }
    }

    let probe_batch: Vec<AttrMap> = probes
        .into_iter()
        .map(|(serial, model)| {
            let mut probe = AttrMap::new();
            probe.insert(attr::PROBE.to_string(), AttrValue::Text(serial));
            probe.insert("probe_type".to_string(), AttrValue::Text(model));
            probe
        })
        .collect();

    report.probes_inserted = store
        .insert_many(entity::PROBE, &probe_batch, OnConflict::Ignore)
        .await?;
    report.sessions_inserted = store
        .insert_many(entity::SESSION, &sessions, OnConflict::Ignore)
        .await?;
    report.directories_inserted = store
        .insert_many(entity::SESSION_DIRECTORY, &directories, OnConflict::Ignore)
        .await?;
    report.insertions_inserted = store
        .insert_many(entity::PROBE_INSERTION, &insertions, OnConflict::Ignore)
        .await?;

    info!(
        rows = report.rows_read,
        sessions = report.sessions_inserted,
        probes = report.probes_inserted,
        insertions = report.insertions_inserted,
        skipped = report.skipped.len(),
        "Ingested session manifest {}",
        csv_path.display()
    );
    Ok(report)
}

/// What one session directory turned out to contain
#[derive(Debug)]
pub struct DiscoveredSession {
    pub acq_software: &'static str,
    pub session_datetime: NaiveDateTime,
    /// serial -> probe model
    pub probes: Vec<(String, String)>,
    /// insertion number -> probe serial
    pub insertions: Vec<(i64, String)>,
}

/// Scan a session directory for acquisition output. SpikeGLX wins when
/// both systems left files behind.
pub fn scan_session_dir(dir: &Path) -> Result<Option<DiscoveredSession>> {
    let mut ap_metas: Vec<PathBuf> = Vec::new();
    let mut oebins: Vec<PathBuf> = Vec::new();
    for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if name.ends_with(".ap.meta") {
            ap_metas.push(entry.path().to_path_buf());
        } else if name == "structure.oebin" {
            oebins.push(entry.path().to_path_buf());
        }
    }
    ap_metas.sort();
    oebins.sort();

    if !ap_metas.is_empty() {
        if !oebins.is_empty() {
            warn!(
                dir = %dir.display(),
                "Both SpikeGLX and Open Ephys output present, using SpikeGLX"
            );
        }
        return Ok(Some(scan_spikeglx(&ap_metas)?));
    }
    if !oebins.is_empty() {
        return Ok(Some(scan_openephys(&oebins)?));
    }
    Ok(None)
}

fn scan_spikeglx(ap_metas: &[PathBuf]) -> Result<DiscoveredSession> {
    let mut session_datetime: Option<NaiveDateTime> = None;
    let mut probes: Vec<(String, String)> = Vec::new();
    let mut insertions: BTreeMap<i64, String> = BTreeMap::new();
    let mut next_fallback = 0i64;

    for path in ap_metas {
        let meta = spikeglx::SpikeGlxMeta::from_file(path)?;
        let serial = meta.probe_serial()?;
        let model = meta.probe_model()?;
        let datetime = meta.recording_datetime()?;
        session_datetime = Some(match session_datetime {
            Some(current) => current.min(datetime),
            None => datetime,
        });

        // multiple trigger files per probe repeat the same imec tag
        let number = spikeglx::insertion_number_from_path(path)
            .or_else(|| path.parent().and_then(spikeglx::insertion_number_from_path))
            .unwrap_or_else(|| {
                while insertions.contains_key(&next_fallback) {
                    next_fallback += 1;
                }
                next_fallback
            });
        match insertions.get(&number) {
            Some(existing) if existing != &serial => {
                return Err(Error::InvalidInput(format!(
                    "insertion {} maps to probes {} and {}",
                    number, existing, serial
                )));
            }
            Some(_) => {}
            None => {
                insertions.insert(number, serial.clone());
            }
        }
        if !probes.iter().any(|(s, _)| s == &serial) {
            probes.push((serial, model));
        }
    }

    let session_datetime = session_datetime.ok_or_else(|| {
        Error::MissingData("no usable SpikeGLX metadata".to_string())
    })?;
    Ok(DiscoveredSession {
        acq_software: "SpikeGLX",
        session_datetime,
        probes,
        insertions: insertions.into_iter().collect(),
    })
}

fn scan_openephys(oebins: &[PathBuf]) -> Result<DiscoveredSession> {
    let mut session_datetime: Option<NaiveDateTime> = None;
    let mut probes: Vec<(String, String)> = Vec::new();
    let mut insertions: Vec<(i64, String)> = Vec::new();

    for path in oebins {
        let oebin = openephys::OebinFile::from_file(path)?;
        if let Some(datetime) = openephys::datetime_from_path(path) {
            session_datetime = Some(match session_datetime {
                Some(current) => current.min(datetime),
                None => datetime,
            });
        }
        for recording in &oebin.recordings {
            let model = openephys_probe_model(&recording.folder_name);
            if !probes.iter().any(|(s, _)| s == &recording.probe_serial) {
                probes.push((recording.probe_serial.clone(), model.to_string()));
            }
            if !insertions.iter().any(|(_, s)| s == &recording.probe_serial) {
                insertions.push((insertions.len() as i64, recording.probe_serial.clone()));
            }
        }
    }

    let session_datetime = session_datetime.ok_or_else(|| {
        Error::MissingData(
            "cannot determine session datetime from Open Ephys directory names".to_string(),
        )
    })?;
    if insertions.is_empty() {
        return Err(Error::MissingData(
            "Open Ephys output contains no Neuropixels streams".to_string(),
        ));
    }
    Ok(DiscoveredSession {
        acq_software: "OpenEphys",
        session_datetime,
        probes,
        insertions,
    })
}

fn openephys_probe_model(folder_name: &str) -> &'static str {
    if folder_name.to_lowercase().contains("3a") {
        "neuropixels 1.0 - 3A"
    } else {
        "neuropixels 1.0 - 3B"
    }
}

fn parse_manifest_datetime(raw: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

/// Comma-separated manifest with a header row. Deliberately minimal: no
/// quoting, values are trimmed.
struct CsvTable {
    header: Vec<String>,
    rows: Vec<Vec<String>>,
    path: PathBuf,
}

impl CsvTable {
    fn load(path: &Path) -> Result<CsvTable> {
        let text = std::fs::read_to_string(path)?;
        let mut lines = text.lines().filter(|l| !l.trim().is_empty());
        let header = lines
            .next()
            .ok_or_else(|| Error::InvalidInput(format!("{} is empty", path.display())))?
            .split(',')
            .map(|c| c.trim().to_string())
            .collect();
        let rows = lines
            .map(|line| line.split(',').map(|c| c.trim().to_string()).collect())
            .collect();
        Ok(CsvTable {
            header,
            rows,
            path: path.to_path_buf(),
        })
    }

    fn column(&self, name: &str) -> Result<usize> {
        self.optional_column(name).ok_or_else(|| {
            Error::InvalidInput(format!(
                "{} has no '{}' column",
                self.path.display(),
                name
            ))
        })
    }

    fn optional_column(&self, name: &str) -> Option<usize> {
        self.header.iter().position(|h| h == name)
    }

    fn cell(&self, row: &[String], index: usize) -> String {
        row.get(index).cloned().unwrap_or_default()
    }

    /// Cell content, with blank cells treated as absent
    fn optional_cell(&self, row: &[String], index: usize) -> Option<String> {
        let value = self.cell(row, index);
        if value.is_empty() {
            None
        } else {
            Some(value)
        }
    }
}

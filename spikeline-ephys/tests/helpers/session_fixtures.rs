//! Synthetic SpikeGLX session fixtures
//!
//! Lays out one recorded session the way SpikeGLX leaves it on disk: a
//! run directory holding `.ap` and `.lf` meta/binary pairs. The streams
//! are tiny but carry known spikes and flat LFP levels, so downstream
//! assertions have exact expected values.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use spikeline_core::key::TIMESTAMP_FORMAT;
use spikeline_core::{Store, StoreConfig};
use spikeline_ephys::config::{DataConfig, WorkflowConfig};
use spikeline_ephys::schema::build_registry;
use spikeline_ephys::EphysMode;

pub const SUBJECT: &str = "subject6";
pub const SESSION_DIR: &str = "subject6/session1";
pub const PROBE_SERIAL: &str = "17131311651";

/// 18 probe channels plus the trailing sync line
pub const SAVED_CHANNELS: usize = 19;
pub const AP_SAMPLING_RATE: f64 = 30000.0;
pub const LF_SAMPLING_RATE: f64 = 2500.0;
pub const AP_FRAMES: usize = 3000;
pub const LF_FRAMES: usize = 100;

/// Spikes baked into the AP stream: the good unit fires on channel 2,
/// the multi-unit cluster on channel 11. All centers sit well inside the
/// stream so every waveform window is in bounds.
pub const GOOD_UNIT_CENTERS: [i64; 3] = [500, 1500, 2500];
pub const GOOD_UNIT_CHANNEL: usize = 2;
pub const GOOD_UNIT_AMPLITUDE: i16 = -120;
pub const MUA_UNIT_CENTERS: [i64; 2] = [1000, 2000];
pub const MUA_UNIT_CHANNEL: usize = 11;
pub const MUA_UNIT_AMPLITUDE: i16 = 90;

/// Flat LFP levels; the RMS of a flat trace is its absolute level
pub const LFP_LEVEL_CH0: i16 = 5;
pub const LFP_LEVEL_CH9: i16 = -12;

/// Matches the fileCreateTime written into the AP sidecar
pub fn session_datetime() -> NaiveDateTime {
    NaiveDateTime::parse_from_str("2018-07-03 20:32:28", TIMESTAMP_FORMAT).unwrap()
}

/// In-memory store with the ephys schema materialized
pub async fn open_store(mode: EphysMode) -> Store {
    let registry = build_registry(mode).unwrap();
    Store::open(registry, &StoreConfig::default()).await.unwrap()
}

/// Workflow config pointing at the fixture root
pub fn workflow_config(root: &Path, mode: EphysMode) -> WorkflowConfig {
    WorkflowConfig {
        data: DataConfig {
            root_dirs: vec![root.to_path_buf()],
        },
        mode,
        ..WorkflowConfig::default()
    }
}

/// Write the SpikeGLX run directory with both streams under `root`
pub fn write_acquisition(root: &Path) {
    let stream_dir = root.join(SESSION_DIR).join("towersTask_g0_imec0");
    fs::create_dir_all(&stream_dir).unwrap();

    let ap_meta = format!(
        "typeThis=imec\n\
         imSampRate={}\n\
         nSavedChans={}\n\
         fileSizeBytes={}\n\
         fileCreateTime=2018-07-03T20:32:28\n\
         imDatPrb_sn={}\n\
         imDatPrb_type=0\n\
         ~imroTbl=(0,384)\n",
        AP_SAMPLING_RATE,
        SAVED_CHANNELS,
        AP_FRAMES * SAVED_CHANNELS * 2,
        PROBE_SERIAL,
    );
    fs::write(stream_dir.join("towersTask_g0_t0.imec0.ap.meta"), ap_meta).unwrap();
    fs::write(
        stream_dir.join("towersTask_g0_t0.imec0.ap.bin"),
        ap_stream_bytes(),
    )
    .unwrap();

    let lf_meta = format!(
        "typeThis=imec\n\
         imSampRate={}\n\
         nSavedChans={}\n\
         fileSizeBytes={}\n\
         fileCreateTime=2018-07-03T20:32:28\n\
         imDatPrb_sn={}\n\
         imDatPrb_type=0\n",
        LF_SAMPLING_RATE,
        SAVED_CHANNELS,
        LF_FRAMES * SAVED_CHANNELS * 2,
        PROBE_SERIAL,
    );
    fs::write(stream_dir.join("towersTask_g0_t0.imec0.lf.meta"), lf_meta).unwrap();
    fs::write(
        stream_dir.join("towersTask_g0_t0.imec0.lf.bin"),
        lf_stream_bytes(),
    )
    .unwrap();
}

/// AP stream: zeros with spikes at the known centers and a hot sync line
fn ap_stream_bytes() -> Vec<u8> {
    let mut samples = vec![0i16; AP_FRAMES * SAVED_CHANNELS];
    for frame in 0..AP_FRAMES {
        samples[frame * SAVED_CHANNELS + SAVED_CHANNELS - 1] = 1000;
    }
    for center in GOOD_UNIT_CENTERS {
        samples[center as usize * SAVED_CHANNELS + GOOD_UNIT_CHANNEL] = GOOD_UNIT_AMPLITUDE;
    }
    for center in MUA_UNIT_CENTERS {
        samples[center as usize * SAVED_CHANNELS + MUA_UNIT_CHANNEL] = MUA_UNIT_AMPLITUDE;
    }
    to_le_bytes(&samples)
}

/// LF stream: flat levels on channels 0 and 9, sync pinned high
fn lf_stream_bytes() -> Vec<u8> {
    let mut samples = vec![0i16; LF_FRAMES * SAVED_CHANNELS];
    for frame in 0..LF_FRAMES {
        let base = frame * SAVED_CHANNELS;
        samples[base] = LFP_LEVEL_CH0;
        samples[base + 9] = LFP_LEVEL_CH9;
        samples[base + SAVED_CHANNELS - 1] = 32000;
    }
    to_le_bytes(&samples)
}

fn to_le_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

/// Subject and session manifests naming the fixture session. Returns
/// (subjects_csv, sessions_csv).
pub fn write_manifests(root: &Path) -> (PathBuf, PathBuf) {
    let subjects = root.join("subjects.csv");
    fs::write(&subjects, "subject,sex\nsubject6,F\n").unwrap();
    let sessions = root.join("sessions.csv");
    fs::write(
        &sessions,
        "subject,session_dir\nsubject6,subject6/session1\n",
    )
    .unwrap();
    (subjects, sessions)
}

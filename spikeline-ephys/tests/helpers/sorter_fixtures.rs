//! Canned Kilosort output
//!
//! Writes the minimal sorter artifacts the workflow reads back: spike
//! sample indices, cluster assignments, and curated labels for the two
//! units baked into the acquisition fixtures.

use std::fs;
use std::path::{Path, PathBuf};

use spikeline_ephys::readers::{kilosort, npy};

use super::session_fixtures::{GOOD_UNIT_CENTERS, MUA_UNIT_CENTERS, PROBE_SERIAL, SESSION_DIR};

/// Conventional clustering output directory for paramset 0 of the
/// fixture insertion
pub fn sorter_dir(root: &Path) -> PathBuf {
    root.join(SESSION_DIR)
        .join(format!("probe_{}", PROBE_SERIAL))
        .join("kilosort2_0")
}

/// Merged spike train in sample order with its cluster ids
pub fn spike_train() -> (Vec<i64>, Vec<i64>) {
    let mut spikes: Vec<(i64, i64)> = GOOD_UNIT_CENTERS.iter().map(|&t| (t, 0)).collect();
    spikes.extend(MUA_UNIT_CENTERS.iter().map(|&t| (t, 1)));
    spikes.sort_unstable();
    spikes.into_iter().unzip()
}

/// Lay down spike_times/spike_clusters plus curated labels: cluster 0 is
/// good, cluster 1 multi-unit. No params.py, so the sampling rate comes
/// from the recording.
pub fn write_sorter_output(root: &Path) -> PathBuf {
    let dir = sorter_dir(root);
    fs::create_dir_all(&dir).unwrap();
    let (times, clusters) = spike_train();
    npy::write_1d_i64(&dir.join(kilosort::SPIKE_TIMES_FILE), &times).unwrap();
    npy::write_1d_i64(&dir.join(kilosort::SPIKE_CLUSTERS_FILE), &clusters).unwrap();
    fs::write(
        dir.join(kilosort::CURATED_LABELS_FILE),
        "cluster_id\tgroup\n0\tgood\n1\tmua\n",
    )
    .unwrap();
    dir
}

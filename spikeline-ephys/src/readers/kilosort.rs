//! Kilosort / phy output directories
//!
//! A completed sort leaves `spike_times.npy` (sample index of every spike)
//! and `spike_clusters.npy` (cluster assignment of every spike) plus
//! optional extras such as `spike_depths.npy` and curation artifacts.
//! Cluster quality labels come from
//! `cluster_group.tsv` when the result was curated in phy, falling back to
//! the sorter's own `cluster_KSLabel.tsv`, falling back to "unsorted".

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{NaiveDateTime, Timelike};
use spikeline_core::{Error, Result};

use crate::readers::npy;

pub const SPIKE_TIMES_FILE: &str = "spike_times.npy";
pub const SPIKE_CLUSTERS_FILE: &str = "spike_clusters.npy";
pub const SPIKE_DEPTHS_FILE: &str = "spike_depths.npy";
pub const CURATED_LABELS_FILE: &str = "cluster_group.tsv";
pub const SORTER_LABELS_FILE: &str = "cluster_KSLabel.tsv";
pub const PARAMS_FILE: &str = "params.py";

pub const DEFAULT_LABEL: &str = "unsorted";

/// Fully loaded sorter output
#[derive(Debug, Clone)]
pub struct KilosortResult {
    /// Spike sample indices, in file order
    pub spike_times: Vec<i64>,
    /// Cluster id per spike, parallel to `spike_times`
    pub spike_clusters: Vec<i64>,
    /// Estimated depth per spike, parallel to `spike_times`, when the
    /// sorter wrote `spike_depths.npy`
    pub spike_depths: Option<Vec<f64>>,
    labels: BTreeMap<i64, String>,
    /// Sampling rate declared in params.py, when present
    pub sample_rate: Option<f64>,
    /// Modification time of the spike times array, used as the time the
    /// sort finished
    pub results_time: NaiveDateTime,
}

/// Cheap existence and shape check, without loading spike data
#[derive(Debug, Clone, Copy)]
pub struct KilosortSummary {
    pub spike_count: u64,
    pub results_time: NaiveDateTime,
}

pub fn validate(dir: &Path) -> Result<KilosortSummary> {
    let times_path = dir.join(SPIKE_TIMES_FILE);
    let clusters_path = dir.join(SPIKE_CLUSTERS_FILE);
    if !times_path.exists() || !clusters_path.exists() {
        return Err(Error::MissingData(format!(
            "{} holds no clustering results",
            dir.display()
        )));
    }

    let times_shape = npy::read_shape(&times_path)?;
    let clusters_shape = npy::read_shape(&clusters_path)?;
    let spike_count = times_shape.first().copied().unwrap_or(0);
    if spike_count == 0 {
        return Err(Error::MissingData(format!(
            "{} contains an empty spike train",
            dir.display()
        )));
    }
    if clusters_shape.first().copied() != Some(spike_count) {
        return Err(Error::MissingData(format!(
            "{} spike and cluster arrays disagree on length",
            dir.display()
        )));
    }

    Ok(KilosortSummary {
        spike_count,
        results_time: mtime(&times_path)?,
    })
}

impl KilosortResult {
    pub fn load(dir: &Path) -> Result<KilosortResult> {
        let summary = validate(dir)?;

        let spike_times = npy::read_1d_i64(&dir.join(SPIKE_TIMES_FILE))?;
        let spike_clusters = npy::read_1d_i64(&dir.join(SPIKE_CLUSTERS_FILE))?;
        if spike_times.len() != spike_clusters.len() {
            return Err(Error::MissingData(format!(
                "{} spike and cluster arrays disagree on length",
                dir.display()
            )));
        }

        let depths_path = dir.join(SPIKE_DEPTHS_FILE);
        let spike_depths = if depths_path.exists() {
            let depths = npy::read_1d_f64(&depths_path)?;
            if depths.len() != spike_times.len() {
                return Err(Error::MissingData(format!(
                    "{} spike and depth arrays disagree on length",
                    dir.display()
                )));
            }
            Some(depths)
        } else {
            None
        };

        let labels = load_labels(dir)?;
        let sample_rate = load_sample_rate(dir)?;

        Ok(KilosortResult {
            spike_times,
            spike_clusters,
            spike_depths,
            labels,
            sample_rate,
            results_time: summary.results_time,
        })
    }

    /// Quality label for a cluster; clusters never mentioned in a label
    /// file are "unsorted"
    pub fn label_for(&self, cluster: i64) -> &str {
        self.labels
            .get(&cluster)
            .map(|s| s.as_str())
            .unwrap_or(DEFAULT_LABEL)
    }

    /// Spike sample indices grouped by cluster, ascending within each
    pub fn spikes_by_cluster(&self) -> BTreeMap<i64, Vec<i64>> {
        let mut grouped: BTreeMap<i64, Vec<i64>> = BTreeMap::new();
        for (time, cluster) in self.spike_times.iter().zip(&self.spike_clusters) {
            grouped.entry(*cluster).or_default().push(*time);
        }
        for times in grouped.values_mut() {
            times.sort_unstable();
        }
        grouped
    }

    /// Spike depths grouped by cluster, parallel to the sorted times from
    /// [`Self::spikes_by_cluster`]; `None` when the sorter wrote no depths
    pub fn depths_by_cluster(&self) -> Option<BTreeMap<i64, Vec<f64>>> {
        let depths = self.spike_depths.as_ref()?;
        let mut grouped: BTreeMap<i64, Vec<(i64, f64)>> = BTreeMap::new();
        for ((time, cluster), depth) in
            self.spike_times.iter().zip(&self.spike_clusters).zip(depths)
        {
            grouped.entry(*cluster).or_default().push((*time, *depth));
        }
        Some(
            grouped
                .into_iter()
                .map(|(cluster, mut pairs)| {
                    pairs.sort_by_key(|&(time, _)| time);
                    (cluster, pairs.into_iter().map(|(_, depth)| depth).collect())
                })
                .collect(),
        )
    }
}

fn load_labels(dir: &Path) -> Result<BTreeMap<i64, String>> {
    for name in [CURATED_LABELS_FILE, SORTER_LABELS_FILE] {
        let path = dir.join(name);
        if path.exists() {
            return parse_label_tsv(&path);
        }
    }
    Ok(BTreeMap::new())
}

fn parse_label_tsv(path: &Path) -> Result<BTreeMap<i64, String>> {
    let text = std::fs::read_to_string(path)?;
    let mut labels = BTreeMap::new();
    for line in text.lines().skip(1) {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (id, label) = line.split_once('\t').ok_or_else(|| {
            Error::MissingData(format!("malformed label row in {}", path.display()))
        })?;
        let id: i64 = id.trim().parse().map_err(|_| {
            Error::MissingData(format!("malformed cluster id in {}", path.display()))
        })?;
        labels.insert(id, label.trim().to_string());
    }
    Ok(labels)
}

fn load_sample_rate(dir: &Path) -> Result<Option<f64>> {
    let path = dir.join(PARAMS_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(&path)?;
    for line in text.lines() {
        if let Some((key, value)) = line.split_once('=') {
            if key.trim() == "sample_rate" {
                return Ok(value.trim().parse::<f64>().ok());
            }
        }
    }
    Ok(None)
}

fn mtime(path: &Path) -> Result<NaiveDateTime> {
    let modified = std::fs::metadata(path)?.modified()?;
    let dt = chrono::DateTime::<chrono::Utc>::from(modified).naive_utc();
    Ok(dt.with_nanosecond(0).unwrap_or(dt))
}

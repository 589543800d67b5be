//! Loading curated sorter output into `curated_clustering` and its units.
//!
//! With a curation step in the schema, the make reads from the directory
//! the curation row points at; without one, it reads the task's sorter
//! output directly. Spike times are converted from sample indices to
//! seconds using the sorter's own declared rate when `params.py` carries
//! one, falling back to the recording's rate.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use spikeline_core::{AttrMap, AttrValue, EntityKey, EntityMake, Error, MakeResult, Result, Store};
use tracing::debug;

use crate::keys::CurationKey;
use crate::paths;
use crate::readers::kilosort::KilosortResult;
use crate::schema::{attr, entity};
use crate::tables::{real_field, seconds_json, text_field};

pub struct CuratedClusteringMake {
    roots: Vec<PathBuf>,
}

impl CuratedClusteringMake {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        CuratedClusteringMake { roots }
    }

    async fn curated_dir(&self, store: &Store, key: &EntityKey, curated: &CurationKey) -> Result<String> {
        match curated.curation_id {
            Some(_) => {
                let row = store.fetch_row(entity::CURATION, key).await?;
                text_field(&row, entity::CURATION, attr::CURATION_OUTPUT_DIR)
            }
            None => {
                let row = store
                    .fetch_row(entity::CLUSTERING_TASK, &curated.task.to_key())
                    .await?;
                text_field(&row, entity::CLUSTERING_TASK, attr::CLUSTERING_OUTPUT_DIR)
            }
        }
    }
}

#[async_trait]
impl EntityMake for CuratedClusteringMake {
    fn entity(&self) -> &str {
        entity::CURATED_CLUSTERING
    }

    async fn make(&self, store: &Store, key: &EntityKey) -> Result<MakeResult> {
        let curated = CurationKey::from_key(key)?;
        let output_dir = self.curated_dir(store, key, &curated).await?;
        let dir = paths::find_full_path(&self.roots, Path::new(&output_dir))?;
        let results = tokio::task::spawn_blocking(move || KilosortResult::load(&dir))
            .await
            .map_err(|e| Error::Internal(format!("result loading task failed: {}", e)))??;

        let recording = store
            .fetch_row(entity::EPHYS_RECORDING, &curated.task.insertion.to_key())
            .await?;
        let recording_rate = real_field(&recording, entity::EPHYS_RECORDING, attr::SAMPLING_RATE)?;
        let sampling_rate = results.sample_rate.unwrap_or(recording_rate);

        let grouped = results.spikes_by_cluster();
        let depths = results.depths_by_cluster();
        let mut units = Vec::with_capacity(grouped.len());
        for (cluster, samples) in &grouped {
            let mut unit = AttrMap::new();
            unit.insert(attr::UNIT.to_string(), AttrValue::Int(*cluster));
            unit.insert(
                "cluster_quality_label".to_string(),
                AttrValue::Text(results.label_for(*cluster).to_string()),
            );
            unit.insert(
                "spike_count".to_string(),
                AttrValue::Int(samples.len() as i64),
            );
            unit.insert(
                "spike_times".to_string(),
                AttrValue::Json(seconds_json(samples, sampling_rate)),
            );
            if let Some(unit_depths) = depths.as_ref().and_then(|d| d.get(cluster)) {
                unit.insert(
                    "spike_depths".to_string(),
                    AttrValue::Json(serde_json::Value::from(unit_depths.clone())),
                );
            }
            units.push(unit);
        }
        debug!(
            key = %key,
            units = units.len(),
            sampling_rate,
            "Loaded curated clustering results"
        );

        let mut master = AttrMap::new();
        master.insert("unit_count".to_string(), AttrValue::Int(units.len() as i64));
        Ok(MakeResult::new()
            .with_master(master)
            .with_part(entity::UNIT, units))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spikeline_core::{OnConflict, Restriction, StoreConfig};

    use crate::keys::{InsertionKey, SessionKey, TaskKey};
    use crate::readers::npy;
    use crate::schema::{build_registry, EphysMode, TaskMode};
    use crate::tables::clustering::{insert_tasks, ClusteringMake};
    use crate::tables::curation;

    const SORTER_DIR: &str = "subject6/session1/probe_17131311651/kilosort2_0";

    async fn seeded_store(mode: EphysMode, root: &Path) -> (Store, TaskKey) {
        let registry = build_registry(mode).unwrap();
        let store = Store::open(registry, &StoreConfig::default()).await.unwrap();

        let datetime = chrono::NaiveDate::from_ymd_opt(2018, 7, 3)
            .unwrap()
            .and_hms_opt(20, 32, 28)
            .unwrap();
        let task = TaskKey::new(
            InsertionKey::new(SessionKey::new("subject6", datetime), 0),
            0,
        );

        let mut subject = AttrMap::new();
        subject.insert("subject".to_string(), AttrValue::Text("subject6".into()));
        store
            .insert(entity::SUBJECT, &subject, OnConflict::Error)
            .await
            .unwrap();
        let session_row = task.insertion.session.to_key().to_attr_map();
        store
            .insert(entity::SESSION, &session_row, OnConflict::Error)
            .await
            .unwrap();
        let mut dir_row = session_row.clone();
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
        let mut insertion_row = task.insertion.to_key().to_attr_map();
        insertion_row.insert("probe".to_string(), AttrValue::Text("17131311651".into()));
        store
            .insert(entity::PROBE_INSERTION, &insertion_row, OnConflict::Error)
            .await
            .unwrap();

        let params = spikeline_core::params::ParamStore::new(
            store.clone(),
            crate::schema::paramset_spec(),
        )
        .unwrap();
        params
            .insert_new_params("kilosort2", 0, "defaults", &serde_json::json!({"Th": [10, 4]}))
            .await
            .unwrap();

        let mut recording = task.insertion.to_key().to_attr_map();
        recording.insert(
            "acq_software".to_string(),
            AttrValue::Text("SpikeGLX".into()),
        );
        recording.insert("sampling_rate".to_string(), AttrValue::Real(30000.0));
        recording.insert("channel_count".to_string(), AttrValue::Int(385));
        recording.insert(
            "recording_datetime".to_string(),
            AttrValue::Timestamp(datetime),
        );
        store
            .insert(entity::EPHYS_RECORDING, &recording, OnConflict::Error)
            .await
            .unwrap();

        let sorter_dir = root.join(SORTER_DIR);
        std::fs::create_dir_all(&sorter_dir).unwrap();
        npy::write_1d_i64(
            &sorter_dir.join("spike_times.npy"),
            &[15000, 30000, 45000, 60000],
        )
        .unwrap();
        npy::write_1d_i64(&sorter_dir.join("spike_clusters.npy"), &[0, 1, 0, 1]).unwrap();
        std::fs::write(
            sorter_dir.join("cluster_group.tsv"),
            "cluster_id\tgroup\n0\tgood\n1\tmua\n",
        )
        .unwrap();

        insert_tasks(&store, 0, &Restriction::all(), TaskMode::Load, None)
            .await
            .unwrap();
        let clustering_make = ClusteringMake::new(vec![root.to_path_buf()]);
        let result = clustering_make.make(&store, &task.to_key()).await.unwrap();
        let mut clustering_row = task.to_key().to_attr_map();
        for (name, value) in result.master {
            clustering_row.insert(name, value);
        }
        store
            .insert(entity::CLUSTERING, &clustering_row, OnConflict::Error)
            .await
            .unwrap();

        (store, task)
    }

    #[tokio::test]
    async fn test_units_are_grouped_and_labeled() {
        let root = tempfile::tempdir().unwrap();
        let (store, task) = seeded_store(EphysMode::Curated, root.path()).await;
        let roots = vec![root.path().to_path_buf()];
        let id = curation::create_from_task(&store, &roots, &task).await.unwrap();

        let make = CuratedClusteringMake::new(roots);
        let key = task.to_key().with(attr::CURATION_ID, id);
        let result = make.make(&store, &key).await.unwrap();

        assert_eq!(
            result.master.get("unit_count").and_then(|v| v.as_int()),
            Some(2)
        );
        assert_eq!(result.parts.len(), 1);
        let units = &result.parts[0].rows;
        assert_eq!(units.len(), 2);

        let unit0 = &units[0];
        assert_eq!(unit0.get(attr::UNIT).and_then(|v| v.as_int()), Some(0));
        assert_eq!(
            unit0.get("cluster_quality_label").and_then(|v| v.as_text()),
            Some("good")
        );
        assert_eq!(unit0.get("spike_count").and_then(|v| v.as_int()), Some(2));
        let times = unit0.get("spike_times").and_then(|v| v.as_json()).unwrap();
        assert_eq!(times, &serde_json::json!([0.5, 1.5]));
        // no spike_depths.npy in the fixture
        assert!(unit0.get("spike_depths").is_none());

        let unit1 = &units[1];
        assert_eq!(
            unit1.get("cluster_quality_label").and_then(|v| v.as_text()),
            Some("mua")
        );
    }

    #[tokio::test]
    async fn test_spike_depths_are_stored_when_present() {
        let root = tempfile::tempdir().unwrap();
        let (store, task) = seeded_store(EphysMode::Curated, root.path()).await;
        npy::write_1d_f64(
            &root.path().join(SORTER_DIR).join("spike_depths.npy"),
            &[10.0, 800.0, 20.0, 810.0],
        )
        .unwrap();
        let roots = vec![root.path().to_path_buf()];
        let id = curation::create_from_task(&store, &roots, &task).await.unwrap();

        let make = CuratedClusteringMake::new(roots);
        let key = task.to_key().with(attr::CURATION_ID, id);
        let result = make.make(&store, &key).await.unwrap();

        let units = &result.parts[0].rows;
        let depths0 = units[0].get("spike_depths").and_then(|v| v.as_json()).unwrap();
        assert_eq!(depths0, &serde_json::json!([10.0, 20.0]));
        let depths1 = units[1].get("spike_depths").and_then(|v| v.as_json()).unwrap();
        assert_eq!(depths1, &serde_json::json!([800.0, 810.0]));
    }

    #[tokio::test]
    async fn test_params_py_rate_wins_over_recording() {
        let root = tempfile::tempdir().unwrap();
        let (store, task) = seeded_store(EphysMode::Curated, root.path()).await;
        std::fs::write(
            root.path().join(SORTER_DIR).join("params.py"),
            "dat_path = 'run.bin'\nsample_rate = 15000.\n",
        )
        .unwrap();
        let roots = vec![root.path().to_path_buf()];
        let id = curation::create_from_task(&store, &roots, &task).await.unwrap();

        let make = CuratedClusteringMake::new(roots);
        let key = task.to_key().with(attr::CURATION_ID, id);
        let result = make.make(&store, &key).await.unwrap();

        let times = result.parts[0].rows[0]
            .get("spike_times")
            .and_then(|v| v.as_json())
            .unwrap();
        // 15000 and 45000 samples at 15 kHz
        assert_eq!(times, &serde_json::json!([1.0, 3.0]));
    }

    #[tokio::test]
    async fn test_no_curation_mode_reads_task_output() {
        let root = tempfile::tempdir().unwrap();
        let (store, task) = seeded_store(EphysMode::NoCuration, root.path()).await;

        let make = CuratedClusteringMake::new(vec![root.path().to_path_buf()]);
        let result = make.make(&store, &task.to_key()).await.unwrap();
        assert_eq!(
            result.master.get("unit_count").and_then(|v| v.as_int()),
            Some(2)
        );
    }
}

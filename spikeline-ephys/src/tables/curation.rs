//! Curation snapshots over sorter output.
//!
//! A curation row freezes one state of a clustering result: which
//! directory holds the (possibly hand-edited) files and when they were
//! produced. Ids are allocated per task and never reused, so a curation
//! key stays valid even after intermediate snapshots are deleted. The
//! first snapshot of a task usually points at the raw sorter output.

use std::path::{Path, PathBuf};

use spikeline_core::{AttrMap, AttrValue, EntityKey, Error, Result, Store};
use tracing::info;

use crate::keys::TaskKey;
use crate::paths;
use crate::readers::kilosort;
use crate::schema::{attr, entity};
use crate::tables::text_field;

/// How to stamp a new curation row.
#[derive(Debug, Clone, Default)]
pub struct CurationRequest {
    /// Directory holding the curated files, relative to a data root.
    /// Defaults to the task's clustering output directory.
    pub output_dir: Option<String>,
    pub quality_control: bool,
    pub manual_curation: bool,
    pub note: Option<String>,
}

/// Register a new curation for a finished clustering task.
///
/// The clustering entity must already be populated for the task, and the
/// curated directory must hold a loadable result set. Returns the
/// allocated curation id.
pub async fn create(
    store: &Store,
    roots: &[PathBuf],
    task: &TaskKey,
    request: &CurationRequest,
) -> Result<i64> {
    if store.registry().entity(entity::CURATION).is_none() {
        return Err(Error::Unsupported(
            "this schema was built without a curation step".to_string(),
        ));
    }

    let task_key: EntityKey = task.to_key();
    store.fetch_row(entity::CLUSTERING, &task_key).await?;

    let output_dir = match &request.output_dir {
        Some(dir) => dir.clone(),
        None => {
            let task_row = store.fetch_row(entity::CLUSTERING_TASK, &task_key).await?;
            text_field(&task_row, entity::CLUSTERING_TASK, attr::CLUSTERING_OUTPUT_DIR)?
        }
    };

    let dir = paths::find_full_path(roots, Path::new(&output_dir))?;
    let summary = tokio::task::spawn_blocking(move || kilosort::validate(&dir))
        .await
        .map_err(|e| Error::Internal(format!("curation validation task failed: {}", e)))??;

    let mut row = AttrMap::new();
    row.insert(
        "curation_time".to_string(),
        AttrValue::Timestamp(summary.results_time),
    );
    row.insert(
        attr::CURATION_OUTPUT_DIR.to_string(),
        AttrValue::Text(output_dir),
    );
    row.insert(
        "quality_control".to_string(),
        AttrValue::Int(i64::from(request.quality_control)),
    );
    row.insert(
        "manual_curation".to_string(),
        AttrValue::Int(i64::from(request.manual_curation)),
    );
    if let Some(note) = &request.note {
        row.insert(
            "curation_note".to_string(),
            AttrValue::Text(note.clone()),
        );
    }

    let curation_id = store
        .insert_with_sequence(entity::CURATION, &task_key, attr::CURATION_ID, &row)
        .await?;
    info!(task = %task, curation_id, "Registered curation");
    Ok(curation_id)
}

/// Snapshot the raw sorter output of a task as its next curation.
pub async fn create_from_task(store: &Store, roots: &[PathBuf], task: &TaskKey) -> Result<i64> {
    create(store, roots, task, &CurationRequest::default()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use spikeline_core::{EntityMake, OnConflict, Restriction, StoreConfig};

    use crate::keys::{InsertionKey, SessionKey};
    use crate::readers::npy;
    use crate::schema::{build_registry, EphysMode, TaskMode};
    use crate::tables::clustering::{insert_tasks, ClusteringMake};

    async fn seeded_store(mode: EphysMode, root: &Path) -> (Store, TaskKey) {
        let registry = build_registry(mode).unwrap();
        let store = Store::open(registry, &StoreConfig::default()).await.unwrap();

        let datetime = chrono::NaiveDate::from_ymd_opt(2018, 7, 3)
            .unwrap()
            .and_hms_opt(20, 32, 28)
            .unwrap();
        let session = SessionKey::new("subject6", datetime);
        let insertion = InsertionKey::new(session, 0);
        let task = TaskKey::new(insertion, 0);

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

        let sorter_dir = root.join("subject6/session1/probe_17131311651/kilosort2_0");
        std::fs::create_dir_all(&sorter_dir).unwrap();
        npy::write_1d_i64(&sorter_dir.join("spike_times.npy"), &[100, 200, 300]).unwrap();
        npy::write_1d_i64(&sorter_dir.join("spike_clusters.npy"), &[0, 1, 0]).unwrap();

        insert_tasks(&store, 0, &Restriction::all(), TaskMode::Load, None)
            .await
            .unwrap();

        (store, task)
    }

    async fn populate_clustering(store: &Store, task: &TaskKey, root: &Path) {
        let make = ClusteringMake::new(vec![root.to_path_buf()]);
        let result = make.make(store, &task.to_key()).await.unwrap();
        let mut row = task.to_key().to_attr_map();
        for (name, value) in result.master {
            row.insert(name, value);
        }
        store
            .insert(entity::CLUSTERING, &row, OnConflict::Error)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_curation_requires_populated_clustering() {
        let root = tempfile::tempdir().unwrap();
        let (store, task) = seeded_store(EphysMode::Curated, root.path()).await;

        let err = create_from_task(&store, &[root.path().to_path_buf()], &task)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)), "{err}");
    }

    #[tokio::test]
    async fn test_curation_ids_are_never_reused() {
        let root = tempfile::tempdir().unwrap();
        let (store, task) = seeded_store(EphysMode::Curated, root.path()).await;
        populate_clustering(&store, &task, root.path()).await;
        let roots = vec![root.path().to_path_buf()];

        let first = create_from_task(&store, &roots, &task).await.unwrap();
        assert_eq!(first, 1);
        let second = create_from_task(&store, &roots, &task).await.unwrap();
        assert_eq!(second, 2);

        // deleting the latest snapshot does not free its id
        let deleted = store
            .delete(
                entity::CURATION,
                &Restriction::from_key(&task.to_key().with(attr::CURATION_ID, second)),
            )
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        let third = create_from_task(&store, &roots, &task).await.unwrap();
        assert_eq!(third, 3);
    }

    #[tokio::test]
    async fn test_curation_row_defaults_to_sorter_output() {
        let root = tempfile::tempdir().unwrap();
        let (store, task) = seeded_store(EphysMode::Curated, root.path()).await;
        populate_clustering(&store, &task, root.path()).await;

        let id = create(
            &store,
            &[root.path().to_path_buf()],
            &task,
            &CurationRequest {
                note: Some("initial snapshot".to_string()),
                ..CurationRequest::default()
            },
        )
        .await
        .unwrap();

        let row = store
            .fetch_row(
                entity::CURATION,
                &task.to_key().with(attr::CURATION_ID, id),
            )
            .await
            .unwrap();
        assert_eq!(
            row.get(attr::CURATION_OUTPUT_DIR).and_then(|v| v.as_text()),
            Some("subject6/session1/probe_17131311651/kilosort2_0")
        );
        assert_eq!(
            row.get("quality_control").and_then(|v| v.as_int()),
            Some(0)
        );
        assert_eq!(
            row.get("curation_note").and_then(|v| v.as_text()),
            Some("initial snapshot")
        );
    }

    #[tokio::test]
    async fn test_curation_is_unsupported_without_curation_step() {
        let root = tempfile::tempdir().unwrap();
        let (store, task) = seeded_store(EphysMode::NoCuration, root.path()).await;
        populate_clustering(&store, &task, root.path()).await;

        let err = create_from_task(&store, &[root.path().to_path_buf()], &task)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)), "{err}");
    }
}

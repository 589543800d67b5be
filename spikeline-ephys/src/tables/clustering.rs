//! Clustering task registration and the `clustering` make.
//!
//! A task pairs one recording with one parameter set and points at the
//! directory where sorter output lives (or should land). The make for
//! `clustering` runs in load mode only: it checks that the directory
//! holds a complete result set and stamps the entity with the sorter's
//! finish time. Triggering the sorter itself is out of scope; tasks in
//! trigger mode fail until re-registered as load.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use spikeline_core::{
    AttrValue, EntityKey, EntityMake, Error, MakeResult, OnConflict, Restriction, Result, Store,
};
use tracing::{debug, info};

use crate::keys::{InsertionKey, TaskKey};
use crate::paths;
use crate::readers::kilosort;
use crate::schema::{attr, entity, TaskMode};
use crate::tables::{probe_serial, stored_session_dir, text_field};

/// Register one clustering task per recording matched by `restriction`.
///
/// Without an explicit output directory each task gets the conventional
/// location `{session_dir}/probe_{serial}/{method}_{paramset_idx}` under
/// the data roots. Existing tasks are left untouched; the return value
/// counts newly created rows.
pub async fn insert_tasks(
    store: &Store,
    paramset_idx: i64,
    restriction: &Restriction,
    mode: TaskMode,
    output_dir: Option<&str>,
) -> Result<u64> {
    let paramset_key = EntityKey::new().with(attr::PARAMSET_IDX, paramset_idx);
    let paramset = store
        .fetch_row(entity::CLUSTERING_PARAMSET, &paramset_key)
        .await?;
    let method = text_field(&paramset, entity::CLUSTERING_PARAMSET, attr::CLUSTERING_METHOD)?;

    let recordings = store.fetch_keys(entity::EPHYS_RECORDING, restriction).await?;
    if output_dir.is_some() && recordings.len() > 1 {
        return Err(Error::InvalidInput(format!(
            "an explicit output directory applies to exactly one recording, restriction matched {}",
            recordings.len()
        )));
    }

    let mut batch = Vec::with_capacity(recordings.len());
    for recording_key in &recordings {
        let insertion = InsertionKey::from_key(recording_key)?;
        let dir = match output_dir {
            Some(dir) => dir.to_string(),
            None => {
                let session_dir = stored_session_dir(store, &insertion.session).await?;
                let serial = probe_serial(store, &insertion).await?;
                format!("{}/probe_{}/{}_{}", session_dir, serial, method, paramset_idx)
            }
        };
        let mut row = recording_key.to_attr_map();
        row.insert(attr::PARAMSET_IDX.to_string(), AttrValue::Int(paramset_idx));
        row.insert(
            attr::CLUSTERING_OUTPUT_DIR.to_string(),
            AttrValue::Text(dir),
        );
        row.insert(
            attr::TASK_MODE.to_string(),
            AttrValue::Text(mode.as_str().to_string()),
        );
        batch.push(row);
    }

    let created = store
        .insert_many(entity::CLUSTERING_TASK, &batch, OnConflict::Ignore)
        .await?;
    info!(
        paramset_idx,
        candidates = batch.len(),
        created,
        "Registered clustering tasks"
    );
    Ok(created)
}

pub struct ClusteringMake {
    roots: Vec<PathBuf>,
}

impl ClusteringMake {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        ClusteringMake { roots }
    }
}

#[async_trait]
impl EntityMake for ClusteringMake {
    fn entity(&self) -> &str {
        entity::CLUSTERING
    }

    async fn make(&self, store: &Store, key: &EntityKey) -> Result<MakeResult> {
        let task = TaskKey::from_key(key)?;
        let row = store.fetch_row(entity::CLUSTERING_TASK, key).await?;
        let mode = TaskMode::parse(&text_field(&row, entity::CLUSTERING_TASK, attr::TASK_MODE)?)?;
        let output_dir = text_field(&row, entity::CLUSTERING_TASK, attr::CLUSTERING_OUTPUT_DIR)?;

        match mode {
            TaskMode::Trigger => Err(Error::Unsupported(format!(
                "task {} asks for triggered sorting; run the sorter externally and \
                 re-register the task in load mode",
                task
            ))),
            TaskMode::Load => {
                let dir = paths::find_full_path(&self.roots, Path::new(&output_dir))?;
                let summary = tokio::task::spawn_blocking(move || kilosort::validate(&dir))
                    .await
                    .map_err(|e| {
                        Error::Internal(format!("clustering validation task failed: {}", e))
                    })??;
                debug!(
                    task = %task,
                    spike_count = summary.spike_count,
                    "Validated sorter output"
                );
                let mut master = spikeline_core::AttrMap::new();
                master.insert(
                    "clustering_time".to_string(),
                    AttrValue::Timestamp(summary.results_time),
                );
                Ok(MakeResult::new().with_master(master))
            }
        }
    }
}

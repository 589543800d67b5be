//! Scheduler assembly and full workflow passes.

use std::sync::Arc;

use spikeline_core::{PopulateOptions, PopulateReport, Restriction, Result, Scheduler, Store};
use tracing::{info, warn};

use crate::config::WorkflowConfig;
use crate::tables::clustering::ClusteringMake;
use crate::tables::curated::CuratedClusteringMake;
use crate::tables::lfp::LfpMake;
use crate::tables::recording::EphysRecordingMake;
use crate::tables::waveform::WaveformSetMake;

/// A scheduler with every auto-populated entity's make attached.
pub fn build_scheduler(store: Store, config: &WorkflowConfig) -> Result<Scheduler> {
    let roots = config.data.root_dirs.clone();
    let mut scheduler = Scheduler::new(store);
    scheduler.register(Arc::new(EphysRecordingMake::new(roots.clone())))?;
    scheduler.register(Arc::new(ClusteringMake::new(roots.clone())))?;
    scheduler.register(Arc::new(CuratedClusteringMake::new(roots.clone())))?;
    scheduler.register(Arc::new(LfpMake::new(roots.clone())))?;
    scheduler.register(Arc::new(WaveformSetMake::new(roots)))?;
    Ok(scheduler)
}

/// One pass over every registered entity in dependency order, with a
/// per-entity summary log.
pub async fn run(
    scheduler: &Scheduler,
    restriction: &Restriction,
    options: &PopulateOptions,
) -> Result<Vec<PopulateReport>> {
    let reports = scheduler.populate_all(restriction, options).await?;
    for report in &reports {
        log_report(report);
    }
    Ok(reports)
}

pub fn log_report(report: &PopulateReport) {
    if report.failed.is_empty() {
        info!(
            entity = %report.entity,
            attempted = report.attempted,
            succeeded = report.succeeded,
            skipped = report.skipped,
            "Populate pass finished"
        );
    } else {
        warn!(
            entity = %report.entity,
            attempted = report.attempted,
            succeeded = report.succeeded,
            skipped = report.skipped,
            failed = report.failed_count(),
            "Populate pass finished with failures"
        );
        for failure in &report.failed {
            warn!(entity = %report.entity, key = %failure.key, error = %failure.error, "Key failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spikeline_core::StoreConfig;

    use crate::config::WorkflowConfig;
    use crate::schema::{build_registry, entity, EphysMode};

    #[tokio::test]
    async fn test_scheduler_covers_every_computed_entity() {
        let registry = build_registry(EphysMode::Curated).unwrap();
        let store = Store::open(registry, &StoreConfig::default()).await.unwrap();
        let scheduler = build_scheduler(store, &WorkflowConfig::default()).unwrap();

        let mut registered = scheduler.registered();
        registered.sort_unstable();
        assert_eq!(
            registered,
            vec![
                entity::CLUSTERING,
                entity::CURATED_CLUSTERING,
                entity::EPHYS_RECORDING,
                entity::LFP,
                entity::WAVEFORM_SET,
            ]
        );
    }

    #[tokio::test]
    async fn test_scheduler_builds_without_curation() {
        let registry = build_registry(EphysMode::NoCuration).unwrap();
        let store = Store::open(registry, &StoreConfig::default()).await.unwrap();
        let scheduler = build_scheduler(store, &WorkflowConfig::default()).unwrap();
        assert_eq!(scheduler.registered().len(), 5);
    }
}

//! Multi-worker populate coordination over a shared database file
//!
//! Two schedulers with independent connection pools stand in for two
//! worker processes. With job reservation on, every key must be computed
//! exactly once no matter how the workers interleave.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serial_test::serial;

use spikeline_core::{
    AttrMap, AttrType, AttrValue, EdgeKind, EntityDef, EntityKey, EntityMake, MakeResult,
    OnConflict, PopulateOptions, Registry, Restriction, Result, Scheduler, Store, StoreConfig,
};

fn worker_registry() -> Registry {
    Registry::builder()
        .entity(
            EntityDef::manual("session")
                .key_attr("subject", AttrType::Text)
                .attr("value", AttrType::Int),
        )
        .entity(
            EntityDef::computed("result")
                .parent("session", EdgeKind::Primary)
                .key_attr("subject", AttrType::Text)
                .attr("output", AttrType::Int),
        )
        .build()
        .unwrap()
}

fn worker_config(db: &Path) -> StoreConfig {
    StoreConfig {
        db_path: Some(db.to_path_buf()),
        ..StoreConfig::default()
    }
}

/// Slow enough that two workers genuinely overlap
struct SlowMake {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl EntityMake for SlowMake {
    fn entity(&self) -> &str {
        "result"
    }

    async fn make(&self, store: &Store, key: &EntityKey) -> Result<MakeResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let session = store.fetch_row("session", key).await?;
        let value = session["value"].as_int().unwrap_or(0);
        let mut master = AttrMap::new();
        master.insert("output".into(), AttrValue::Int(value * 10));
        Ok(MakeResult::new().with_master(master))
    }
}

async fn open_worker(db: &Path, calls: Arc<AtomicUsize>) -> Scheduler {
    let store = Store::open(worker_registry(), &worker_config(db))
        .await
        .unwrap();
    let mut scheduler = Scheduler::new(store);
    scheduler.register(Arc::new(SlowMake { calls })).unwrap();
    scheduler
}

async fn seed_sessions(store: &Store, count: i64) {
    for i in 0..count {
        let mut row = AttrMap::new();
        row.insert("subject".into(), AttrValue::Text(format!("subject{}", i)));
        row.insert("value".into(), AttrValue::Int(i));
        store
            .insert("session", &row, OnConflict::Ignore)
            .await
            .unwrap();
    }
}

#[tokio::test]
#[serial]
async fn test_two_workers_compute_each_key_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("pipeline.db");
    let calls = Arc::new(AtomicUsize::new(0));

    let worker_a = open_worker(&db, calls.clone()).await;
    let worker_b = open_worker(&db, calls.clone()).await;
    seed_sessions(worker_a.store(), 8).await;

    let options = PopulateOptions {
        reserve_jobs: true,
        suppress_errors: true,
        ..PopulateOptions::default()
    };
    let restriction_a = Restriction::all();
    let restriction_b = Restriction::all();
    let (report_a, report_b) = tokio::join!(
        worker_a.populate("result", &restriction_a, &options),
        worker_b.populate("result", &restriction_b, &options),
    );
    let report_a = report_a.unwrap();
    let report_b = report_b.unwrap();

    // every key computed exactly once, wherever it landed
    assert_eq!(calls.load(Ordering::SeqCst), 8);
    assert_eq!(report_a.succeeded + report_b.succeeded, 8);
    assert_eq!(report_a.failed_count() + report_b.failed_count(), 0);
    assert_eq!(
        worker_a
            .store()
            .count("result", &Restriction::all())
            .await
            .unwrap(),
        8
    );

    // all claims released
    assert!(worker_a.jobs().list(None).await.unwrap().is_empty());
}

#[tokio::test]
#[serial]
async fn test_rerun_after_partial_completion_fills_the_gap() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("pipeline.db");
    let calls = Arc::new(AtomicUsize::new(0));

    let worker = open_worker(&db, calls.clone()).await;
    seed_sessions(worker.store(), 4).await;

    let options = PopulateOptions {
        reserve_jobs: true,
        limit: Some(2),
        ..PopulateOptions::default()
    };
    let first = worker
        .populate("result", &Restriction::all(), &options)
        .await
        .unwrap();
    assert_eq!(first.succeeded, 2);

    let rest = worker
        .populate(
            "result",
            &Restriction::all(),
            &PopulateOptions {
                reserve_jobs: true,
                ..PopulateOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(rest.succeeded, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
#[serial]
async fn test_abandoned_reservation_blocks_then_reclaims() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("pipeline.db");
    let calls = Arc::new(AtomicUsize::new(0));

    let worker = open_worker(&db, calls.clone()).await;
    seed_sessions(worker.store(), 3).await;

    // a crashed worker left a reservation behind for subject1
    let orphan_key = EntityKey::new().with("subject", "subject1");
    assert!(worker.jobs().reserve("result", &orphan_key).await.unwrap());

    let options = PopulateOptions {
        reserve_jobs: true,
        ..PopulateOptions::default()
    };
    let report = worker
        .populate("result", &Restriction::all(), &options)
        .await
        .unwrap();
    assert_eq!(report.succeeded, 2);

    // age the orphan so it shows up as stale
    sqlx::query("UPDATE \"jobs\" SET reserved_at = '2020-01-01 00:00:00' WHERE status = 'reserved'")
        .execute(worker.store().pool())
        .await
        .unwrap();
    let stale = worker.jobs().stale(chrono::Duration::hours(1)).await.unwrap();
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].key["subject"], "subject1");

    // operator clears it; the next run picks the key up
    assert!(worker.jobs().clear("result", &orphan_key).await.unwrap());
    let report = worker
        .populate("result", &Restriction::all(), &options)
        .await
        .unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(
        worker
            .store()
            .count("result", &Restriction::all())
            .await
            .unwrap(),
        3
    );
}

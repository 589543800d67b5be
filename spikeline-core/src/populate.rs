//! Dependency-ordered, idempotent computation scheduling
//!
//! Auto-populated entities register an [`EntityMake`] callback. A populate
//! run enumerates the keys that should exist (join of the entity's primary
//! parents) minus the keys that already do, then computes each one and
//! writes the master row and its part rows in a single transaction.
//! Re-running populate after success is a no-op; crashing mid-run loses at
//! most the key being computed. With `reserve_jobs` enabled, concurrent
//! workers coordinate through the shared jobs table so each key is
//! computed at most once.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::hash::key_hash;
use crate::jobs::JobQueue;
use crate::key::{AttrMap, AttrValue, EntityKey, Restriction};
use crate::registry::EntityDef;
use crate::store::ddl::quote_ident;
use crate::store::{decode_key, fetch_all_with_binds, retry_on_lock, OnConflict, Store};

/// Rows destined for one part entity of the master being computed
#[derive(Debug, Clone, Default)]
pub struct PartRows {
    pub entity: String,
    pub rows: Vec<AttrMap>,
}

/// What one make call produced. The engine merges the computed key into
/// the master attributes and into every part row before inserting.
#[derive(Debug, Clone, Default)]
pub struct MakeResult {
    pub master: AttrMap,
    pub parts: Vec<PartRows>,
}

impl MakeResult {
    pub fn new() -> Self {
        MakeResult::default()
    }

    pub fn with_master(mut self, attrs: AttrMap) -> Self {
        self.master = attrs;
        self
    }

    pub fn with_part(mut self, entity: impl Into<String>, rows: Vec<AttrMap>) -> Self {
        self.parts.push(PartRows {
            entity: entity.into(),
            rows,
        });
        self
    }
}

/// Computation callback for one auto-populated entity.
///
/// `make` must derive its output from already-materialized upstream rows
/// and external files only; the engine owns all writes.
#[async_trait]
pub trait EntityMake: Send + Sync {
    /// Entity this callback fills
    fn entity(&self) -> &str;

    async fn make(&self, store: &Store, key: &EntityKey) -> Result<MakeResult>;
}

/// Knobs for one populate run
#[derive(Debug, Clone, Default)]
pub struct PopulateOptions {
    /// Log each key at info level as it lands
    pub display_progress: bool,
    /// Coordinate with other workers through the jobs table
    pub reserve_jobs: bool,
    /// Record per-key failures in the report instead of stopping the run
    pub suppress_errors: bool,
    /// Process at most this many keys
    pub limit: Option<usize>,
}

/// One key that failed during a suppressed-errors run
#[derive(Debug, Clone)]
pub struct KeyFailure {
    pub key: EntityKey,
    pub error: String,
}

/// Outcome counts for one entity's populate pass
#[derive(Debug, Clone)]
pub struct PopulateReport {
    pub entity: String,
    /// Keys handed to the make callback
    pub attempted: usize,
    pub succeeded: usize,
    /// Keys claimed elsewhere or materialized while the run was underway
    pub skipped: usize,
    pub failed: Vec<KeyFailure>,
}

impl PopulateReport {
    fn new(entity: &str) -> Self {
        PopulateReport {
            entity: entity.to_string(),
            attempted: 0,
            succeeded: 0,
            skipped: 0,
            failed: Vec::new(),
        }
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }
}

enum KeyOutcome {
    Done,
    Skipped,
    Failed(String),
}

/// Runs make callbacks over missing keys in dependency order
pub struct Scheduler {
    store: Store,
    jobs: JobQueue,
    makes: BTreeMap<String, Arc<dyn EntityMake>>,
}

impl Scheduler {
    pub fn new(store: Store) -> Self {
        let jobs = JobQueue::new(store.clone());
        Scheduler {
            store,
            jobs,
            makes: BTreeMap::new(),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn jobs(&self) -> &JobQueue {
        &self.jobs
    }

    /// Attach a make callback. The target must be an Imported or Computed
    /// entity and can be registered only once.
    pub fn register(&mut self, make: Arc<dyn EntityMake>) -> Result<()> {
        let entity = make.entity().to_string();
        let def = self.store.registry().expect_entity(&entity)?;
        if !def.kind().is_auto() {
            return Err(Error::InvalidInput(format!(
                "entity '{}' is {}, only imported/computed entities can be populated",
                entity,
                def.kind().as_str()
            )));
        }
        if self.makes.contains_key(&entity) {
            return Err(Error::InvalidInput(format!(
                "a make callback for '{}' is already registered",
                entity
            )));
        }
        self.makes.insert(entity, make);
        Ok(())
    }

    /// Entities with a registered make, in dependency order
    pub fn registered(&self) -> Vec<&str> {
        self.store
            .registry()
            .topological_order()
            .iter()
            .filter(|name| self.makes.contains_key(name.as_str()))
            .map(|name| name.as_str())
            .collect()
    }

    /// Keys the entity is missing: the join of its primary parents,
    /// restricted, minus already-materialized rows. Deterministic order.
    pub async fn pending_keys(
        &self,
        entity: &str,
        restriction: &Restriction,
    ) -> Result<Vec<EntityKey>> {
        let def = self.store.registry().expect_entity(entity)?;
        if !def.kind().is_auto() {
            return Err(Error::InvalidInput(format!(
                "entity '{}' is not auto-populated",
                entity
            )));
        }
        let (sql, binds) = self.key_source_sql(def, restriction)?;
        let rows = fetch_all_with_binds(self.store.pool(), &sql, &binds).await?;
        rows.iter().map(|row| decode_key(def, row)).collect()
    }

    /// Populate one entity. Fails fast on the first error unless
    /// `suppress_errors` is set.
    pub async fn populate(
        &self,
        entity: &str,
        restriction: &Restriction,
        options: &PopulateOptions,
    ) -> Result<PopulateReport> {
        let make = self
            .makes
            .get(entity)
            .cloned()
            .ok_or_else(|| {
                Error::InvalidInput(format!("no make callback registered for '{}'", entity))
            })?;
        let def = self.store.registry().expect_entity(entity)?;

        let mut keys = self.pending_keys(entity, restriction).await?;
        if options.reserve_jobs {
            let excluded = self.jobs.excluded_hashes(entity).await?;
            keys.retain(|key| !excluded.contains(&key_hash(entity, key)));
        }
        if let Some(limit) = options.limit {
            keys.truncate(limit);
        }

        let mut report = PopulateReport::new(entity);
        if options.display_progress {
            info!(entity, pending = keys.len(), "Populating");
        } else {
            debug!(entity, pending = keys.len(), "Populating");
        }

        for key in &keys {
            match self.run_one(def, make.as_ref(), key, options).await? {
                KeyOutcome::Done => {
                    report.attempted += 1;
                    report.succeeded += 1;
                }
                KeyOutcome::Skipped => {
                    report.skipped += 1;
                }
                KeyOutcome::Failed(message) => {
                    report.attempted += 1;
                    report.failed.push(KeyFailure {
                        key: key.clone(),
                        error: message,
                    });
                }
            }
        }

        if !report.failed.is_empty() {
            info!(
                entity,
                succeeded = report.succeeded,
                failed = report.failed.len(),
                "Populate finished with failures"
            );
        } else {
            debug!(entity, succeeded = report.succeeded, "Populate finished");
        }
        Ok(report)
    }

    /// Populate every registered entity in dependency order. The
    /// restriction is projected onto each entity's key attributes.
    pub async fn populate_all(
        &self,
        restriction: &Restriction,
        options: &PopulateOptions,
    ) -> Result<Vec<PopulateReport>> {
        // catch restriction typos before silently matching nothing
        for (name, _) in restriction.attrs() {
            let known = self.makes.keys().any(|entity| {
                self.store
                    .registry()
                    .entity(entity)
                    .map(|def| def.is_key_attr(name))
                    .unwrap_or(false)
            });
            if !known {
                return Err(Error::InvalidInput(format!(
                    "restriction attribute '{}' is not a key attribute of any populated entity",
                    name
                )));
            }
        }

        let mut reports = Vec::new();
        for entity in self.registered() {
            let def = self.store.registry().expect_entity(entity)?;
            let projected = restriction.project(&def.key_attr_names());
            let report = self.populate(entity, &projected, options).await?;
            reports.push(report);
        }
        Ok(reports)
    }

    async fn run_one(
        &self,
        def: &EntityDef,
        make: &dyn EntityMake,
        key: &EntityKey,
        options: &PopulateOptions,
    ) -> Result<KeyOutcome> {
        let entity = def.name();

        if options.reserve_jobs && !self.jobs.reserve(entity, key).await? {
            debug!(entity, key = %key, "Key already claimed, skipping");
            return Ok(KeyOutcome::Skipped);
        }

        // another worker may have materialized the key between enumeration
        // and our claim
        if self
            .store
            .exists(entity, &Restriction::from_key(key))
            .await?
        {
            if options.reserve_jobs {
                self.jobs.complete(entity, key).await?;
            }
            return Ok(KeyOutcome::Skipped);
        }

        let outcome = match make.make(&self.store, key).await {
            Ok(result) => self.insert_result(def, key, &result).await,
            Err(err) => Err(err),
        };

        match outcome {
            Ok(()) => {
                if options.reserve_jobs {
                    self.jobs.complete(entity, key).await?;
                }
                if options.display_progress {
                    info!(entity, key = %key, "Populated");
                }
                Ok(KeyOutcome::Done)
            }
            Err(err) => {
                error!(entity, key = %key, error = %err, "Populate failed for key");
                if options.reserve_jobs {
                    self.jobs.error(entity, key, &err.to_string()).await?;
                }
                if options.suppress_errors {
                    Ok(KeyOutcome::Failed(err.to_string()))
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Write the master row and all part rows in one transaction
    async fn insert_result(
        &self,
        def: &EntityDef,
        key: &EntityKey,
        result: &MakeResult,
    ) -> Result<()> {
        let entity = def.name();

        for (name, value) in &result.master {
            if let Some(expected) = key.get(name) {
                if expected != value {
                    return Err(Error::Internal(format!(
                        "make callback for '{}' returned key attribute '{}' with a different value",
                        entity, name
                    )));
                }
            }
        }
        for part in &result.parts {
            let part_def = self.store.registry().expect_entity(&part.entity)?;
            if part_def.master() != Some(entity) {
                return Err(Error::InvalidInput(format!(
                    "'{}' is not a part of '{}'",
                    part.entity, entity
                )));
            }
        }

        let master = key.merged_into(&result.master);
        retry_on_lock("populate insert", 5000, || async {
            let mut tx = self.store.pool().begin().await?;
            self.store
                .insert_tx(&mut tx, entity, &master, OnConflict::Error)
                .await?;
            for part in &result.parts {
                for row in &part.rows {
                    let full = key.merged_into(row);
                    self.store
                        .insert_tx(&mut tx, &part.entity, &full, OnConflict::Error)
                        .await?;
                }
            }
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    /// Candidate-key SQL: join the primary parents on their shared key
    /// attributes, drop keys the target already has, apply the restriction.
    fn key_source_sql(
        &self,
        def: &EntityDef,
        restriction: &Restriction,
    ) -> Result<(String, Vec<AttrValue>)> {
        let registry = self.store.registry();
        let parents: Vec<&EntityDef> = def
            .primary_parents()
            .map(|edge| registry.expect_entity(&edge.parent))
            .collect::<Result<Vec<_>>>()?;

        // first parent providing each key attribute
        let mut provider: HashMap<&str, usize> = HashMap::new();
        for (i, parent) in parents.iter().enumerate() {
            for attr in parent.key() {
                provider.entry(attr.name.as_str()).or_insert(i);
            }
        }

        let select_cols = def
            .key()
            .iter()
            .map(|attr| {
                let alias = provider[attr.name.as_str()];
                format!(
                    "p{}.{} AS {}",
                    alias,
                    quote_ident(&attr.name),
                    quote_ident(&attr.name)
                )
            })
            .collect::<Vec<_>>()
            .join(", ");

        let mut from = format!(
            "{} AS p0",
            quote_ident(&self.store.table_name(parents[0].name()))
        );
        let mut seen: HashSet<&str> = parents[0].key().iter().map(|a| a.name.as_str()).collect();
        for (i, parent) in parents.iter().enumerate().skip(1) {
            let shared: Vec<&str> = parent
                .key()
                .iter()
                .map(|a| a.name.as_str())
                .filter(|name| seen.contains(name))
                .collect();
            let table = quote_ident(&self.store.table_name(parent.name()));
            if shared.is_empty() {
                // unrelated parents combine as a cartesian product
                from.push_str(&format!(" CROSS JOIN {} AS p{}", table, i));
            } else {
                let on = shared
                    .iter()
                    .map(|name| {
                        format!(
                            "p{i}.{col} = p{j}.{col}",
                            i = i,
                            col = quote_ident(name),
                            j = provider[name]
                        )
                    })
                    .collect::<Vec<_>>()
                    .join(" AND ");
                from.push_str(&format!(" JOIN {} AS p{} ON {}", table, i, on));
            }
            for attr in parent.key() {
                seen.insert(attr.name.as_str());
            }
        }

        let target_match = def
            .key()
            .iter()
            .map(|attr| {
                format!(
                    "t.{col} = p{alias}.{col}",
                    col = quote_ident(&attr.name),
                    alias = provider[attr.name.as_str()]
                )
            })
            .collect::<Vec<_>>()
            .join(" AND ");

        let mut where_terms = vec![format!(
            "NOT EXISTS (SELECT 1 FROM {} AS t WHERE {})",
            quote_ident(&self.store.table_name(def.name())),
            target_match
        )];
        let mut binds = Vec::new();
        for (name, value) in restriction.attrs() {
            let attr = def.key().iter().find(|a| a.name == name).ok_or_else(|| {
                Error::InvalidInput(format!(
                    "restriction attribute '{}' is not a key attribute of '{}'",
                    name,
                    def.name()
                ))
            })?;
            if value.is_null() {
                return Err(Error::InvalidInput(format!(
                    "key attribute '{}' cannot be restricted to NULL",
                    name
                )));
            }
            if !value.matches(attr.ty) {
                return Err(Error::InvalidInput(format!(
                    "restriction on '{}' expects {}, got {}",
                    name,
                    attr.ty,
                    value.type_name()
                )));
            }
            where_terms.push(format!(
                "p{}.{} = ?",
                provider[name],
                quote_ident(name)
            ));
            binds.push(value.clone());
        }

        let order_cols = def
            .key()
            .iter()
            .map(|attr| quote_ident(&attr.name))
            .collect::<Vec<_>>()
            .join(", ");

        let sql = format!(
            "SELECT DISTINCT {} FROM {} WHERE {} ORDER BY {}",
            select_cols,
            from,
            where_terms.join(" AND "),
            order_cols
        );
        Ok((sql, binds))
    }
}

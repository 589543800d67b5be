//! SQLite-backed entity store
//!
//! Materializes a [`Registry`] as tables and provides typed row access on
//! top of sqlx. One store handles one schema; all tables share a common
//! name prefix so several pipelines can coexist in a database file.

pub(crate) mod ddl;
pub(crate) mod retry;
pub(crate) mod rows;

pub use retry::retry_on_lock;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::key::{AttrMap, AttrType, AttrValue, EntityKey, Restriction};
use crate::registry::{EntityDef, Registry};

/// Conflict handling for manual inserts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnConflict {
    /// Duplicate primary key is an error
    Error,
    /// Duplicate primary key leaves the existing row untouched
    Ignore,
}

/// Store location and tuning
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database file; `None` opens a private in-memory database
    pub db_path: Option<PathBuf>,
    /// Prepended to every table name, e.g. `"ephys_"`
    pub table_prefix: String,
    pub max_connections: u32,
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            db_path: None,
            table_prefix: String::new(),
            max_connections: 5,
            busy_timeout_ms: 5000,
        }
    }
}

/// Handle to the materialized schema. Cheap to clone; clones share the
/// connection pool.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    registry: Arc<Registry>,
    prefix: String,
}

impl Store {
    /// Open (creating if needed) the database and materialize every entity
    /// table plus the engine's bookkeeping tables.
    pub async fn open(registry: Registry, config: &StoreConfig) -> Result<Store> {
        let pool = match &config.db_path {
            Some(path) => {
                let newly_created = !path.exists();
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                // WAL allows concurrent readers alongside one writer, which
                // populate workers rely on
                let options = SqliteConnectOptions::new()
                    .filename(path)
                    .create_if_missing(true)
                    .journal_mode(SqliteJournalMode::Wal)
                    .foreign_keys(true)
                    .busy_timeout(Duration::from_millis(config.busy_timeout_ms));
                let pool = SqlitePoolOptions::new()
                    .max_connections(config.max_connections)
                    .connect_with(options)
                    .await?;
                if newly_created {
                    info!("Initialized new database: {}", path.display());
                } else {
                    info!("Opened existing database: {}", path.display());
                }
                pool
            }
            None => {
                // Every in-memory connection is its own database, so the
                // pool must stay at a single connection
                let options = SqliteConnectOptions::new()
                    .in_memory(true)
                    .foreign_keys(true)
                    .busy_timeout(Duration::from_millis(config.busy_timeout_ms));
                let pool = SqlitePoolOptions::new()
                    .max_connections(1)
                    .connect_with(options)
                    .await?;
                debug!("Opened in-memory database");
                pool
            }
        };

        let store = Store {
            pool,
            registry: Arc::new(registry),
            prefix: config.table_prefix.clone(),
        };
        store.create_tables().await?;
        info!(entities = store.registry.len(), "Entity store ready");
        Ok(store)
    }

    async fn create_tables(&self) -> Result<()> {
        for def in self.registry.entities_in_order() {
            let sql = ddl::create_table_sql(&self.registry, def, &self.prefix);
            sqlx::query(&sql).execute(&self.pool).await?;
        }
        sqlx::query(&ddl::create_jobs_table_sql(&self.prefix))
            .execute(&self.pool)
            .await?;
        sqlx::query(&ddl::create_sequences_table_sql(&self.prefix))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Physical table name for an entity
    pub fn table_name(&self, entity: &str) -> String {
        format!("{}{}", self.prefix, entity)
    }

    pub(crate) fn jobs_table(&self) -> String {
        format!("{}jobs", self.prefix)
    }

    pub(crate) fn sequences_table(&self) -> String {
        format!("{}sequences", self.prefix)
    }

    /// Insert one row. Returns whether a row was actually written (false
    /// only under [`OnConflict::Ignore`] when the key already existed).
    pub async fn insert(
        &self,
        entity: &str,
        row: &AttrMap,
        on_conflict: OnConflict,
    ) -> Result<bool> {
        let def = self.registry.expect_entity(entity)?;
        let columns = rows::validate_row(def, row)?;
        let sql = rows::insert_sql(
            &self.table_name(entity),
            &columns,
            on_conflict == OnConflict::Ignore,
        );
        let binds: Vec<AttrValue> = columns.into_iter().map(|(_, v)| v).collect();
        let result = execute_with_binds(&self.pool, &sql, &binds).await?;
        Ok(result.rows_affected() > 0)
    }

    /// Insert a batch in one transaction. Returns the number of rows
    /// actually written.
    pub async fn insert_many(
        &self,
        entity: &str,
        batch: &[AttrMap],
        on_conflict: OnConflict,
    ) -> Result<u64> {
        let def = self.registry.expect_entity(entity)?;
        let table = self.table_name(entity);

        let mut tx = self.pool.begin().await?;
        let mut written = 0u64;
        for row in batch {
            let columns = rows::validate_row(def, row)?;
            let sql = rows::insert_sql(&table, &columns, on_conflict == OnConflict::Ignore);
            let binds: Vec<AttrValue> = columns.into_iter().map(|(_, v)| v).collect();
            let result = execute_with_binds(&mut *tx, &sql, &binds).await?;
            written += result.rows_affected();
        }
        tx.commit().await?;
        Ok(written)
    }

    /// Insert inside a caller-managed transaction
    pub(crate) async fn insert_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        entity: &str,
        row: &AttrMap,
        on_conflict: OnConflict,
    ) -> Result<bool> {
        let def = self.registry.expect_entity(entity)?;
        let columns = rows::validate_row(def, row)?;
        let sql = rows::insert_sql(
            &self.table_name(entity),
            &columns,
            on_conflict == OnConflict::Ignore,
        );
        let binds: Vec<AttrValue> = columns.into_iter().map(|(_, v)| v).collect();
        let result = execute_with_binds(&mut **tx, &sql, &binds).await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn exists(&self, entity: &str, restriction: &Restriction) -> Result<bool> {
        Ok(self.count(entity, restriction).await? > 0)
    }

    pub async fn count(&self, entity: &str, restriction: &Restriction) -> Result<i64> {
        let def = self.registry.expect_entity(entity)?;
        let (where_sql, binds) = rows::where_clause(def, restriction)?;
        let sql = format!(
            "SELECT COUNT(*) FROM {}{}",
            ddl::quote_ident(&self.table_name(entity)),
            where_sql
        );
        let row = fetch_one_with_binds(&self.pool, &sql, &binds).await?;
        Ok(row.try_get::<i64, _>(0)?)
    }

    /// Primary keys of matching rows, ordered by key
    pub async fn fetch_keys(
        &self,
        entity: &str,
        restriction: &Restriction,
    ) -> Result<Vec<EntityKey>> {
        let def = self.registry.expect_entity(entity)?;
        let (where_sql, binds) = rows::where_clause(def, restriction)?;
        let cols = def
            .key()
            .iter()
            .map(|a| ddl::quote_ident(&a.name))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {} FROM {}{}{}",
            cols,
            ddl::quote_ident(&self.table_name(entity)),
            where_sql,
            rows::order_by_key(def)
        );
        let fetched = fetch_all_with_binds(&self.pool, &sql, &binds).await?;
        fetched
            .iter()
            .map(|row| decode_key(def, row))
            .collect::<Result<Vec<_>>>()
    }

    /// Full rows (declared attributes only), ordered by key
    pub async fn fetch_rows(
        &self,
        entity: &str,
        restriction: &Restriction,
    ) -> Result<Vec<AttrMap>> {
        let def = self.registry.expect_entity(entity)?;
        let (where_sql, binds) = rows::where_clause(def, restriction)?;
        let sql = format!(
            "SELECT * FROM {}{}{}",
            ddl::quote_ident(&self.table_name(entity)),
            where_sql,
            rows::order_by_key(def)
        );
        let fetched = fetch_all_with_binds(&self.pool, &sql, &binds).await?;
        fetched
            .iter()
            .map(|row| decode_row(def, row))
            .collect::<Result<Vec<_>>>()
    }

    /// The row addressed by a full primary key, if present
    pub async fn try_fetch_row(&self, entity: &str, key: &EntityKey) -> Result<Option<AttrMap>> {
        let def = self.registry.expect_entity(entity)?;
        validate_key(def, key)?;
        let matches = self
            .fetch_rows(entity, &Restriction::from_key(key))
            .await?;
        Ok(matches.into_iter().next())
    }

    /// The row addressed by a full primary key; NotFound if absent
    pub async fn fetch_row(&self, entity: &str, key: &EntityKey) -> Result<AttrMap> {
        self.try_fetch_row(entity, key).await?.ok_or_else(|| {
            Error::NotFound(format!("{} {}", entity, key))
        })
    }

    /// Delete matching rows; cascades follow primary edges. Returns the
    /// number of rows deleted from this entity alone.
    pub async fn delete(&self, entity: &str, restriction: &Restriction) -> Result<u64> {
        let def = self.registry.expect_entity(entity)?;
        let (where_sql, binds) = rows::where_clause(def, restriction)?;
        let sql = format!(
            "DELETE FROM {}{}",
            ddl::quote_ident(&self.table_name(entity)),
            where_sql
        );
        let result = execute_with_binds(&self.pool, &sql, &binds).await?;
        Ok(result.rows_affected())
    }

    /// MAX of an integer attribute over matching rows
    pub async fn max_int(
        &self,
        entity: &str,
        attr: &str,
        restriction: &Restriction,
    ) -> Result<Option<i64>> {
        let def = self.registry.expect_entity(entity)?;
        match def.attribute(attr) {
            Some(a) if a.ty == AttrType::Int => {}
            _ => {
                return Err(Error::InvalidInput(format!(
                    "entity '{}' has no integer attribute '{}'",
                    entity, attr
                )))
            }
        }
        let (where_sql, binds) = rows::where_clause(def, restriction)?;
        let sql = format!(
            "SELECT MAX({}) FROM {}{}",
            ddl::quote_ident(attr),
            ddl::quote_ident(&self.table_name(entity)),
            where_sql
        );
        let row = fetch_one_with_binds(&self.pool, &sql, &binds).await?;
        Ok(row.try_get::<Option<i64>, _>(0)?)
    }

    /// Insert a row whose integer key attribute `seq_attr` is allocated as
    /// the next value in `scope` (the remaining key attributes).
    ///
    /// Allocation is monotonic per scope and never reuses a value, even
    /// after rows are deleted: the high-water mark lives in the sequences
    /// table. Returns the allocated value.
    pub async fn insert_with_sequence(
        &self,
        entity: &str,
        scope: &EntityKey,
        seq_attr: &str,
        row: &AttrMap,
    ) -> Result<i64> {
        let def = self.registry.expect_entity(entity)?;
        match def.attribute(seq_attr) {
            Some(a) if a.ty == AttrType::Int && def.is_key_attr(seq_attr) => {}
            _ => {
                return Err(Error::InvalidInput(format!(
                    "'{}' is not an integer key attribute of '{}'",
                    seq_attr, entity
                )));
            }
        }
        for attr in def.key() {
            if attr.name != seq_attr && scope.get(&attr.name).is_none() {
                return Err(Error::InvalidKey(format!(
                    "sequence scope for '{}' is missing key attribute '{}'",
                    entity, attr.name
                )));
            }
        }
        if scope.len() != def.key().len() - 1 || scope.contains(seq_attr) {
            return Err(Error::InvalidKey(format!(
                "sequence scope for '{}' must be its key without '{}'",
                entity, seq_attr
            )));
        }

        let scope_hash = crate::hash::key_hash(entity, scope).to_string();

        // Optimistic allocation: competing writers collide on the entity's
        // primary key and retry with a fresh read of the high-water mark.
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .try_allocate(def, entity, scope, &scope_hash, seq_attr, row)
                .await
            {
                Ok(value) => return Ok(value),
                Err(err)
                    if attempt < 10
                        && (is_conflict(&err) || retry::is_lock_error(&err)) =>
                {
                    debug!(
                        entity,
                        attempt,
                        error = %err,
                        "Sequence allocation collided, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(5 * attempt)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn try_allocate(
        &self,
        def: &EntityDef,
        entity: &str,
        scope: &EntityKey,
        scope_hash: &str,
        seq_attr: &str,
        row: &AttrMap,
    ) -> Result<i64> {
        let mut tx = self.pool.begin().await?;

        let marker_sql = format!(
            "SELECT last_value FROM {} WHERE entity = ? AND scope_hash = ?",
            ddl::quote_ident(&self.sequences_table())
        );
        let marker: Option<i64> = sqlx::query_scalar(&marker_sql)
            .bind(entity)
            .bind(scope_hash)
            .fetch_optional(&mut *tx)
            .await?;

        let scope_restriction = Restriction::from_key(scope);
        let (where_sql, binds) = rows::where_clause(def, &scope_restriction)?;
        let live_sql = format!(
            "SELECT MAX({}) FROM {}{}",
            ddl::quote_ident(seq_attr),
            ddl::quote_ident(&self.table_name(entity)),
            where_sql
        );
        let live: Option<i64> = {
            let row = fetch_one_with_binds(&mut *tx, &live_sql, &binds).await?;
            row.try_get::<Option<i64>, _>(0)?
        };

        let next = marker.unwrap_or(0).max(live.unwrap_or(0)) + 1;

        let mut full = scope.merged_into(row);
        full.insert(seq_attr.to_string(), AttrValue::Int(next));
        let columns = rows::validate_row(def, &full)?;
        let insert = rows::insert_sql(&self.table_name(entity), &columns, false);
        let insert_binds: Vec<AttrValue> = columns.into_iter().map(|(_, v)| v).collect();
        execute_with_binds(&mut *tx, &insert, &insert_binds).await?;

        let upsert = format!(
            "INSERT INTO {} (entity, scope_hash, last_value) VALUES (?, ?, ?) \
             ON CONFLICT (entity, scope_hash) DO UPDATE SET last_value = excluded.last_value",
            ddl::quote_ident(&self.sequences_table())
        );
        sqlx::query(&upsert)
            .bind(entity)
            .bind(scope_hash)
            .bind(next)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(next)
    }
}

fn is_conflict(err: &Error) -> bool {
    match err {
        Error::Database(db_err) => retry::is_unique_violation(db_err),
        _ => false,
    }
}

fn validate_key(def: &EntityDef, key: &EntityKey) -> Result<()> {
    for attr in def.key() {
        match key.get(&attr.name) {
            Some(value) if !value.is_null() && value.matches(attr.ty) => {}
            _ => {
                return Err(Error::InvalidKey(format!(
                    "key for '{}' is missing or mistypes attribute '{}'",
                    def.name(),
                    attr.name
                )));
            }
        }
    }
    if key.len() != def.key().len() {
        return Err(Error::InvalidKey(format!(
            "key for '{}' carries attributes outside its primary key",
            def.name()
        )));
    }
    Ok(())
}

pub(crate) fn decode_key(def: &EntityDef, row: &SqliteRow) -> Result<EntityKey> {
    let mut key = EntityKey::new();
    for attr in def.key() {
        key.insert(attr.name.clone(), rows::decode_value(row, &attr.name, attr.ty)?);
    }
    Ok(key)
}

pub(crate) fn decode_row(def: &EntityDef, row: &SqliteRow) -> Result<AttrMap> {
    let mut map = AttrMap::new();
    for attr in def.all_attributes() {
        map.insert(attr.name.clone(), rows::decode_value(row, &attr.name, attr.ty)?);
    }
    Ok(map)
}

pub(crate) async fn execute_with_binds<'e, E>(
    executor: E,
    sql: &str,
    binds: &[AttrValue],
) -> Result<sqlx::sqlite::SqliteQueryResult>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let mut query = sqlx::query(sql);
    for value in binds {
        query = rows::bind_value(query, value);
    }
    Ok(query.execute(executor).await?)
}

pub(crate) async fn fetch_all_with_binds<'e, E>(
    executor: E,
    sql: &str,
    binds: &[AttrValue],
) -> Result<Vec<SqliteRow>>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let mut query = sqlx::query(sql);
    for value in binds {
        query = rows::bind_value(query, value);
    }
    Ok(query.fetch_all(executor).await?)
}

pub(crate) async fn fetch_one_with_binds<'e, E>(
    executor: E,
    sql: &str,
    binds: &[AttrValue],
) -> Result<SqliteRow>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let mut query = sqlx::query(sql);
    for value in binds {
        query = rows::bind_value(query, value);
    }
    Ok(query.fetch_one(executor).await?)
}

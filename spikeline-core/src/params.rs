//! Content-addressed parameter sets
//!
//! A parameter table binds a human-chosen integer index to a JSON payload
//! and its [`content_hash`](crate::hash::content_hash). Re-inserting the
//! same payload under the same index is a no-op; re-binding an index to a
//! different payload is refused, because downstream results already refer
//! to that index. The same payload under two different indices is allowed
//! but logged, since it usually means two people defined "their own" copy
//! of identical settings.

use sqlx::Row;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::hash::content_hash;
use crate::key::{AttrMap, AttrType, AttrValue};
use crate::store::ddl::quote_ident;
use crate::store::{OnConflict, Store};

/// Where a parameter table and its method lookup live in the schema
#[derive(Debug, Clone)]
pub struct ParamTableSpec {
    /// The parameter entity, keyed by `idx_attr`
    pub entity: String,
    /// Lookup entity naming the methods (e.g. sorters)
    pub method_entity: String,
    /// Text attribute carrying the method name, on both entities
    pub method_attr: String,
    /// Integer key attribute of `entity`
    pub idx_attr: String,
    /// Text description attribute
    pub desc_attr: String,
    /// Uuid attribute holding the content hash
    pub hash_attr: String,
    /// Json attribute holding the payload
    pub params_attr: String,
}

/// Outcome of a deduplicating insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamInsert {
    Inserted,
    /// Identical payload already bound to this index
    AlreadyExists,
}

/// Deduplicating access to one parameter table
#[derive(Clone)]
pub struct ParamStore {
    store: Store,
    spec: ParamTableSpec,
}

impl ParamStore {
    /// Validate the table binding against the registry up front so later
    /// inserts can assume well-typed attributes.
    pub fn new(store: Store, spec: ParamTableSpec) -> Result<Self> {
        let def = store.registry().expect_entity(&spec.entity)?;
        let method_def = store.registry().expect_entity(&spec.method_entity)?;

        let check = |name: &str, ty: AttrType| -> Result<()> {
            match def.attribute(name) {
                Some(a) if a.ty == ty => Ok(()),
                _ => Err(Error::Config(format!(
                    "parameter entity '{}' needs attribute '{}' of type {}",
                    spec.entity, name, ty
                ))),
            }
        };
        check(&spec.idx_attr, AttrType::Int)?;
        check(&spec.method_attr, AttrType::Text)?;
        check(&spec.desc_attr, AttrType::Text)?;
        check(&spec.hash_attr, AttrType::Uuid)?;
        check(&spec.params_attr, AttrType::Json)?;

        if !def.is_key_attr(&spec.idx_attr) || def.key().len() != 1 {
            return Err(Error::Config(format!(
                "parameter entity '{}' must be keyed by '{}' alone",
                spec.entity, spec.idx_attr
            )));
        }
        match method_def.attribute(&spec.method_attr) {
            Some(a) if a.ty == AttrType::Text && method_def.is_key_attr(&spec.method_attr) => {}
            _ => {
                return Err(Error::Config(format!(
                    "method entity '{}' must be keyed by text attribute '{}'",
                    spec.method_entity, spec.method_attr
                )));
            }
        }

        Ok(ParamStore { store, spec })
    }

    /// Insert a parameter set if it is new.
    ///
    /// The hash covers the payload plus the method name, so the same
    /// numbers under two methods stay distinct. The method row itself is
    /// created on first use.
    pub async fn insert_new_params(
        &self,
        method: &str,
        paramset_idx: i64,
        description: &str,
        payload: &serde_json::Value,
    ) -> Result<ParamInsert> {
        let object = payload.as_object().ok_or_else(|| {
            Error::InvalidInput("parameter payload must be a JSON object".to_string())
        })?;

        let mut hashed = object.clone();
        hashed.insert(
            self.spec.method_attr.clone(),
            serde_json::Value::from(method),
        );
        let hash = content_hash(&serde_json::Value::Object(hashed));

        // A concurrent writer can slip in between our existence check and
        // insert; the retry re-reads and lands in the no-op branch.
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .try_insert(method, paramset_idx, description, payload, hash)
                .await
            {
                Err(Error::Database(err))
                    if attempt < 3 && crate::store::retry::is_unique_violation(&err) =>
                {
                    tracing::debug!(
                        entity = %self.spec.entity,
                        paramset_idx,
                        "Concurrent parameter insert detected, re-checking"
                    );
                }
                other => return other,
            }
        }
    }

    async fn try_insert(
        &self,
        method: &str,
        paramset_idx: i64,
        description: &str,
        payload: &serde_json::Value,
        hash: Uuid,
    ) -> Result<ParamInsert> {
        let mut tx = self.store.pool().begin().await?;

        let existing_sql = format!(
            "SELECT {} FROM {} WHERE {} = ?",
            quote_ident(&self.spec.hash_attr),
            quote_ident(&self.store.table_name(&self.spec.entity)),
            quote_ident(&self.spec.idx_attr)
        );
        let existing: Option<String> = sqlx::query_scalar(&existing_sql)
            .bind(paramset_idx)
            .fetch_optional(&mut *tx)
            .await?;

        if let Some(text) = existing {
            let existing_hash = Uuid::parse_str(&text).map_err(|e| {
                Error::Internal(format!("stored parameter hash is malformed: {}", e))
            })?;
            if existing_hash == hash {
                tracing::debug!(
                    entity = %self.spec.entity,
                    paramset_idx,
                    "Parameter set already registered with identical payload"
                );
                return Ok(ParamInsert::AlreadyExists);
            }
            return Err(Error::ParamConflict {
                method: method.to_string(),
                paramset_idx,
                existing: existing_hash,
                candidate: hash,
            });
        }

        // Same payload under a different index is legal but suspicious
        let alias_sql = format!(
            "SELECT {} FROM {} WHERE {} = ?",
            quote_ident(&self.spec.idx_attr),
            quote_ident(&self.store.table_name(&self.spec.entity)),
            quote_ident(&self.spec.hash_attr)
        );
        let alias: Option<i64> = sqlx::query_scalar(&alias_sql)
            .bind(hash.to_string())
            .fetch_optional(&mut *tx)
            .await?;
        if let Some(other_idx) = alias {
            tracing::warn!(
                entity = %self.spec.entity,
                paramset_idx,
                aliases = other_idx,
                "Identical parameter payload already registered under another index"
            );
        }

        let mut method_row = AttrMap::new();
        method_row.insert(
            self.spec.method_attr.clone(),
            AttrValue::Text(method.to_string()),
        );
        self.store
            .insert_tx(&mut tx, &self.spec.method_entity, &method_row, OnConflict::Ignore)
            .await?;

        let mut row = AttrMap::new();
        row.insert(self.spec.idx_attr.clone(), AttrValue::Int(paramset_idx));
        row.insert(
            self.spec.method_attr.clone(),
            AttrValue::Text(method.to_string()),
        );
        row.insert(
            self.spec.desc_attr.clone(),
            AttrValue::Text(description.to_string()),
        );
        row.insert(self.spec.hash_attr.clone(), AttrValue::Uuid(hash));
        row.insert(self.spec.params_attr.clone(), AttrValue::Json(payload.clone()));
        self.store
            .insert_tx(&mut tx, &self.spec.entity, &row, OnConflict::Error)
            .await?;

        tx.commit().await?;
        tracing::info!(
            entity = %self.spec.entity,
            method,
            paramset_idx,
            hash = %hash,
            "Registered new parameter set"
        );
        Ok(ParamInsert::Inserted)
    }

    pub async fn contains(&self, paramset_idx: i64) -> Result<bool> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE {} = ?",
            quote_ident(&self.store.table_name(&self.spec.entity)),
            quote_ident(&self.spec.idx_attr)
        );
        let count: i64 = sqlx::query_scalar(&sql)
            .bind(paramset_idx)
            .fetch_one(self.store.pool())
            .await?;
        Ok(count > 0)
    }

    /// The stored payload for an index
    pub async fn fetch_payload(&self, paramset_idx: i64) -> Result<serde_json::Value> {
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?",
            quote_ident(&self.spec.params_attr),
            quote_ident(&self.store.table_name(&self.spec.entity)),
            quote_ident(&self.spec.idx_attr)
        );
        let row = sqlx::query(&sql)
            .bind(paramset_idx)
            .fetch_optional(self.store.pool())
            .await?
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "{} {}={}",
                    self.spec.entity, self.spec.idx_attr, paramset_idx
                ))
            })?;
        let text: String = row.try_get(0)?;
        serde_json::from_str(&text)
            .map_err(|e| Error::Internal(format!("stored parameter payload is malformed: {}", e)))
    }
}

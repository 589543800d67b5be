//! Row encoding and decoding between [`AttrValue`] and SQLite

use chrono::NaiveDateTime;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::Row;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::key::{AttrMap, AttrType, AttrValue, Restriction, TIMESTAMP_FORMAT};
use crate::registry::EntityDef;

use super::ddl::quote_ident;

pub(crate) type SqliteQuery<'q> = sqlx::query::Query<'q, sqlx::Sqlite, SqliteArguments<'q>>;

/// Bind one attribute value to the next placeholder. Values are bound
/// owned so the query does not borrow from the row map.
pub(crate) fn bind_value<'q>(q: SqliteQuery<'q>, value: &AttrValue) -> SqliteQuery<'q> {
    match value {
        AttrValue::Int(v) => q.bind(*v),
        AttrValue::Real(v) => q.bind(*v),
        AttrValue::Text(v) => q.bind(v.clone()),
        AttrValue::Timestamp(v) => q.bind(v.format(TIMESTAMP_FORMAT).to_string()),
        AttrValue::Uuid(v) => q.bind(v.to_string()),
        AttrValue::Json(v) => q.bind(v.to_string()),
        AttrValue::Null => q.bind(Option::<String>::None),
    }
}

/// Read one column back into an [`AttrValue`] according to its declared type
pub(crate) fn decode_value(row: &SqliteRow, name: &str, ty: AttrType) -> Result<AttrValue> {
    let value = match ty {
        AttrType::Int => row
            .try_get::<Option<i64>, _>(name)?
            .map_or(AttrValue::Null, AttrValue::Int),
        AttrType::Real => row
            .try_get::<Option<f64>, _>(name)?
            .map_or(AttrValue::Null, AttrValue::Real),
        AttrType::Text => row
            .try_get::<Option<String>, _>(name)?
            .map_or(AttrValue::Null, AttrValue::Text),
        AttrType::Timestamp => match row.try_get::<Option<String>, _>(name)? {
            Some(text) => AttrValue::Timestamp(parse_timestamp(name, &text)?),
            None => AttrValue::Null,
        },
        AttrType::Uuid => match row.try_get::<Option<String>, _>(name)? {
            Some(text) => AttrValue::Uuid(Uuid::parse_str(&text).map_err(|e| {
                Error::Internal(format!("stored uuid in '{}' is malformed: {}", name, e))
            })?),
            None => AttrValue::Null,
        },
        AttrType::Json => match row.try_get::<Option<String>, _>(name)? {
            Some(text) => AttrValue::Json(serde_json::from_str(&text).map_err(|e| {
                Error::Internal(format!("stored json in '{}' is malformed: {}", name, e))
            })?),
            None => AttrValue::Null,
        },
    };
    Ok(value)
}

pub(crate) fn parse_timestamp(name: &str, text: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f"))
        .map_err(|e| {
            Error::Internal(format!(
                "stored timestamp in '{}' is malformed ('{}'): {}",
                name, text, e
            ))
        })
}

/// Check a row against the entity definition and return its values in
/// declaration order, ready to bind.
///
/// Key attributes must all be present and non-null. Secondary attributes
/// must be present unless nullable; unknown names and type mismatches are
/// rejected so typos fail loudly instead of landing in the wrong column.
pub(crate) fn validate_row(def: &EntityDef, row: &AttrMap) -> Result<Vec<(String, AttrValue)>> {
    for name in row.keys() {
        if def.attribute(name).is_none() {
            return Err(Error::InvalidInput(format!(
                "entity '{}' has no attribute '{}'",
                def.name(),
                name
            )));
        }
    }

    let mut out = Vec::with_capacity(def.key().len() + def.attributes().len());

    for attr in def.key() {
        match row.get(&attr.name) {
            Some(value) if !value.is_null() && value.matches(attr.ty) => {
                out.push((attr.name.clone(), value.clone()));
            }
            Some(value) => {
                return Err(Error::InvalidKey(format!(
                    "key attribute '{}' of '{}' expects {}, got {}",
                    attr.name,
                    def.name(),
                    attr.ty,
                    value.type_name()
                )));
            }
            None => {
                return Err(Error::InvalidKey(format!(
                    "key attribute '{}' of '{}' is missing",
                    attr.name,
                    def.name()
                )));
            }
        }
    }

    for attr in def.attributes() {
        match row.get(&attr.name) {
            Some(value) if value.matches(attr.ty) => {
                if value.is_null() && !attr.nullable {
                    return Err(Error::InvalidInput(format!(
                        "attribute '{}' of '{}' is not nullable",
                        attr.name,
                        def.name()
                    )));
                }
                out.push((attr.name.clone(), value.clone()));
            }
            Some(value) => {
                return Err(Error::InvalidInput(format!(
                    "attribute '{}' of '{}' expects {}, got {}",
                    attr.name,
                    def.name(),
                    attr.ty,
                    value.type_name()
                )));
            }
            None if attr.nullable => {}
            None => {
                return Err(Error::InvalidInput(format!(
                    "attribute '{}' of '{}' is required",
                    attr.name,
                    def.name()
                )));
            }
        }
    }

    Ok(out)
}

/// Build an INSERT statement for pre-validated columns
pub(crate) fn insert_sql(table: &str, columns: &[(String, AttrValue)], or_ignore: bool) -> String {
    let verb = if or_ignore {
        "INSERT OR IGNORE"
    } else {
        "INSERT"
    };
    let cols = columns
        .iter()
        .map(|(name, _)| quote_ident(name))
        .collect::<Vec<_>>()
        .join(", ");
    let marks = vec!["?"; columns.len()].join(", ");
    format!(
        "{} INTO {} ({}) VALUES ({})",
        verb,
        quote_ident(table),
        cols,
        marks
    )
}

/// Build a `WHERE` clause for a restriction, returning the SQL fragment
/// (empty when unrestricted) and the values to bind in order. NULL
/// constraints render as `IS NULL` and bind nothing.
pub(crate) fn where_clause(
    def: &EntityDef,
    restriction: &Restriction,
) -> Result<(String, Vec<AttrValue>)> {
    if restriction.is_empty() {
        return Ok((String::new(), Vec::new()));
    }

    let mut terms = Vec::new();
    let mut binds = Vec::new();
    for (name, value) in restriction.attrs() {
        let attr = def.attribute(name).ok_or_else(|| {
            Error::InvalidInput(format!(
                "entity '{}' has no attribute '{}' to restrict on",
                def.name(),
                name
            ))
        })?;
        if value.is_null() {
            terms.push(format!("{} IS NULL", quote_ident(name)));
            continue;
        }
        if !value.matches(attr.ty) {
            return Err(Error::InvalidInput(format!(
                "restriction on '{}' of '{}' expects {}, got {}",
                name,
                def.name(),
                attr.ty,
                value.type_name()
            )));
        }
        terms.push(format!("{} = ?", quote_ident(name)));
        binds.push(value.clone());
    }
    Ok((format!(" WHERE {}", terms.join(" AND ")), binds))
}

/// ORDER BY over the primary key, for deterministic listings
pub(crate) fn order_by_key(def: &EntityDef) -> String {
    let cols = def
        .key()
        .iter()
        .map(|a| quote_ident(&a.name))
        .collect::<Vec<_>>()
        .join(", ");
    format!(" ORDER BY {}", cols)
}

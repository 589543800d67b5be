//! Attribute values, entity keys, and restrictions
//!
//! Every row the engine touches is a map from attribute name to [`AttrValue`].
//! An [`EntityKey`] is the primary-key slice of such a row; a [`Restriction`]
//! is a partial key used to narrow queries and populate runs. Attribute names
//! are ordered (BTreeMap) so that formatting and hashing are deterministic.

use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDateTime;
use uuid::Uuid;

/// Storage format for timestamp attributes, matching SQLite's
/// CURRENT_TIMESTAMP output so text comparison orders correctly.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Declared type of an entity attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrType {
    Int,
    Real,
    Text,
    Timestamp,
    Uuid,
    Json,
}

impl AttrType {
    /// SQLite column type for this attribute type
    pub fn sql_type(&self) -> &'static str {
        match self {
            AttrType::Int => "INTEGER",
            AttrType::Real => "REAL",
            AttrType::Text => "TEXT",
            AttrType::Timestamp => "TIMESTAMP",
            AttrType::Uuid => "TEXT",
            AttrType::Json => "TEXT",
        }
    }
}

impl fmt::Display for AttrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AttrType::Int => "int",
            AttrType::Real => "real",
            AttrType::Text => "text",
            AttrType::Timestamp => "timestamp",
            AttrType::Uuid => "uuid",
            AttrType::Json => "json",
        };
        write!(f, "{}", name)
    }
}

/// A single attribute value
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Int(i64),
    Real(f64),
    Text(String),
    Timestamp(NaiveDateTime),
    Uuid(Uuid),
    Json(serde_json::Value),
    /// Explicit NULL, valid only for nullable secondary attributes
    Null,
}

impl AttrValue {
    /// Whether this value can be stored in a column of the given type.
    /// NULL is acceptable for any type; nullability is checked separately.
    pub fn matches(&self, ty: AttrType) -> bool {
        matches!(
            (self, ty),
            (AttrValue::Int(_), AttrType::Int)
                | (AttrValue::Real(_), AttrType::Real)
                | (AttrValue::Text(_), AttrType::Text)
                | (AttrValue::Timestamp(_), AttrType::Timestamp)
                | (AttrValue::Uuid(_), AttrType::Uuid)
                | (AttrValue::Json(_), AttrType::Json)
                | (AttrValue::Null, _)
        )
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            AttrValue::Int(_) => "int",
            AttrValue::Real(_) => "real",
            AttrValue::Text(_) => "text",
            AttrValue::Timestamp(_) => "timestamp",
            AttrValue::Uuid(_) => "uuid",
            AttrValue::Json(_) => "json",
            AttrValue::Null => "null",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, AttrValue::Null)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            AttrValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_real(&self) -> Option<f64> {
        match self {
            AttrValue::Real(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            AttrValue::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<NaiveDateTime> {
        match self {
            AttrValue::Timestamp(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            AttrValue::Uuid(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            AttrValue::Json(v) => Some(v),
            _ => None,
        }
    }

    /// Stable textual form used for key hashing and display.
    ///
    /// Floats go through serde_json's formatter so the same bit pattern
    /// always yields the same text.
    pub fn canonical(&self) -> String {
        match self {
            AttrValue::Int(v) => v.to_string(),
            AttrValue::Real(v) => serde_json::Number::from_f64(*v)
                .map(|n| n.to_string())
                .unwrap_or_else(|| v.to_string()),
            AttrValue::Text(v) => v.clone(),
            AttrValue::Timestamp(v) => v.format(TIMESTAMP_FORMAT).to_string(),
            AttrValue::Uuid(v) => v.to_string(),
            AttrValue::Json(v) => v.to_string(),
            AttrValue::Null => "null".to_string(),
        }
    }

    /// JSON rendering used for job-queue key snapshots
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            AttrValue::Int(v) => serde_json::Value::from(*v),
            AttrValue::Real(v) => serde_json::Value::from(*v),
            AttrValue::Text(v) => serde_json::Value::from(v.as_str()),
            AttrValue::Timestamp(v) => {
                serde_json::Value::from(v.format(TIMESTAMP_FORMAT).to_string())
            }
            AttrValue::Uuid(v) => serde_json::Value::from(v.to_string()),
            AttrValue::Json(v) => v.clone(),
            AttrValue::Null => serde_json::Value::Null,
        }
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::Int(v)
    }
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        AttrValue::Real(v)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::Text(v.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        AttrValue::Text(v)
    }
}

impl From<NaiveDateTime> for AttrValue {
    fn from(v: NaiveDateTime) -> Self {
        AttrValue::Timestamp(v)
    }
}

impl From<Uuid> for AttrValue {
    fn from(v: Uuid) -> Self {
        AttrValue::Uuid(v)
    }
}

impl From<serde_json::Value> for AttrValue {
    fn from(v: serde_json::Value) -> Self {
        AttrValue::Json(v)
    }
}

/// Named attribute values for one row (or row fragment)
pub type AttrMap = BTreeMap<String, AttrValue>;

/// Primary-key values addressing exactly one row of an entity
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EntityKey(BTreeMap<String, AttrValue>);

impl EntityKey {
    pub fn new() -> Self {
        EntityKey(BTreeMap::new())
    }

    /// Builder-style insert
    pub fn with(mut self, name: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<AttrValue>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&AttrValue> {
        self.0.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn attrs(&self) -> impl Iterator<Item = (&str, &AttrValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Row attributes merged over this key. Key attributes win on collision
    /// so a make callback cannot silently retarget its own output.
    pub fn merged_into(&self, row: &AttrMap) -> AttrMap {
        let mut out = row.clone();
        for (name, value) in &self.0 {
            out.insert(name.clone(), value.clone());
        }
        out
    }

    pub fn to_attr_map(&self) -> AttrMap {
        self.0.clone()
    }

    /// JSON object snapshot, used by the job queue
    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (name, value) in &self.0 {
            map.insert(name.clone(), value.to_json());
        }
        serde_json::Value::Object(map)
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, (name, value)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", name, value.canonical())?;
        }
        write!(f, ")")
    }
}

impl FromIterator<(String, AttrValue)> for EntityKey {
    fn from_iter<T: IntoIterator<Item = (String, AttrValue)>>(iter: T) -> Self {
        EntityKey(iter.into_iter().collect())
    }
}

/// Partial key: attribute equality constraints ANDed together.
/// An empty restriction matches everything.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Restriction(BTreeMap<String, AttrValue>);

impl Restriction {
    /// Matches all rows
    pub fn all() -> Self {
        Restriction(BTreeMap::new())
    }

    /// Builder-style constraint
    pub fn with(mut self, name: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    /// Restriction matching exactly the rows addressed by a key
    pub fn from_key(key: &EntityKey) -> Self {
        Restriction(key.attrs().map(|(k, v)| (k.to_string(), v.clone())).collect())
    }

    pub fn get(&self, name: &str) -> Option<&AttrValue> {
        self.0.get(name)
    }

    pub fn attrs(&self) -> impl Iterator<Item = (&str, &AttrValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Keep only constraints on the given attribute names. Used when one
    /// restriction is applied across several entities with different keys.
    pub fn project(&self, names: &[&str]) -> Restriction {
        Restriction(
            self.0
                .iter()
                .filter(|(k, _)| names.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

impl fmt::Display for Restriction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "(all)");
        }
        for (i, (name, value)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, " AND ")?;
            }
            write!(f, "{}={}", name, value.canonical())?;
        }
        Ok(())
    }
}

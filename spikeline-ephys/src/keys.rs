//! Typed views over entity keys
//!
//! Make callbacks receive an untyped [`EntityKey`]; these wrappers pull the
//! expected attributes out once, with real types, so the rest of the code
//! works with named fields instead of string lookups.

use std::fmt;

use chrono::NaiveDateTime;
use spikeline_core::{EntityKey, Error, Result};

use crate::schema::attr;

fn text_attr(key: &EntityKey, name: &str) -> Result<String> {
    key.get(name)
        .and_then(|v| v.as_text())
        .map(|s| s.to_string())
        .ok_or_else(|| Error::InvalidKey(format!("missing text attribute '{}' in {}", name, key)))
}

fn int_attr(key: &EntityKey, name: &str) -> Result<i64> {
    key.get(name)
        .and_then(|v| v.as_int())
        .ok_or_else(|| Error::InvalidKey(format!("missing integer attribute '{}' in {}", name, key)))
}

fn timestamp_attr(key: &EntityKey, name: &str) -> Result<NaiveDateTime> {
    key.get(name)
        .and_then(|v| v.as_timestamp())
        .ok_or_else(|| {
            Error::InvalidKey(format!("missing timestamp attribute '{}' in {}", name, key))
        })
}

/// Key of one recording session: (subject, session_datetime)
#[derive(Debug, Clone, PartialEq)]
pub struct SessionKey {
    pub subject: String,
    pub session_datetime: NaiveDateTime,
}

impl SessionKey {
    pub fn new(subject: impl Into<String>, session_datetime: NaiveDateTime) -> Self {
        SessionKey {
            subject: subject.into(),
            session_datetime,
        }
    }

    pub fn from_key(key: &EntityKey) -> Result<Self> {
        Ok(SessionKey {
            subject: text_attr(key, attr::SUBJECT)?,
            session_datetime: timestamp_attr(key, attr::SESSION_DATETIME)?,
        })
    }

    pub fn to_key(&self) -> EntityKey {
        EntityKey::new()
            .with(attr::SUBJECT, self.subject.as_str())
            .with(attr::SESSION_DATETIME, self.session_datetime)
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.subject, self.session_datetime)
    }
}

/// Key of one probe insertion within a session
#[derive(Debug, Clone, PartialEq)]
pub struct InsertionKey {
    pub session: SessionKey,
    pub insertion_number: i64,
}

impl InsertionKey {
    pub fn new(session: SessionKey, insertion_number: i64) -> Self {
        InsertionKey {
            session,
            insertion_number,
        }
    }

    pub fn from_key(key: &EntityKey) -> Result<Self> {
        Ok(InsertionKey {
            session: SessionKey::from_key(key)?,
            insertion_number: int_attr(key, attr::INSERTION_NUMBER)?,
        })
    }

    pub fn to_key(&self) -> EntityKey {
        self.session
            .to_key()
            .with(attr::INSERTION_NUMBER, self.insertion_number)
    }
}

impl fmt::Display for InsertionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/imec{}", self.session, self.insertion_number)
    }
}

/// Key of one clustering task: an insertion plus a parameter set
#[derive(Debug, Clone, PartialEq)]
pub struct TaskKey {
    pub insertion: InsertionKey,
    pub paramset_idx: i64,
}

impl TaskKey {
    pub fn new(insertion: InsertionKey, paramset_idx: i64) -> Self {
        TaskKey {
            insertion,
            paramset_idx,
        }
    }

    pub fn from_key(key: &EntityKey) -> Result<Self> {
        Ok(TaskKey {
            insertion: InsertionKey::from_key(key)?,
            paramset_idx: int_attr(key, attr::PARAMSET_IDX)?,
        })
    }

    pub fn to_key(&self) -> EntityKey {
        self.insertion
            .to_key()
            .with(attr::PARAMSET_IDX, self.paramset_idx)
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/paramset{}", self.insertion, self.paramset_idx)
    }
}

/// Key of a curated result. `curation_id` is present only when the schema
/// carries a curation step.
#[derive(Debug, Clone, PartialEq)]
pub struct CurationKey {
    pub task: TaskKey,
    pub curation_id: Option<i64>,
}

impl CurationKey {
    pub fn from_key(key: &EntityKey) -> Result<Self> {
        let curation_id = if key.contains(attr::CURATION_ID) {
            Some(int_attr(key, attr::CURATION_ID)?)
        } else {
            None
        };
        Ok(CurationKey {
            task: TaskKey::from_key(key)?,
            curation_id,
        })
    }

    pub fn to_key(&self) -> EntityKey {
        let key = self.task.to_key();
        match self.curation_id {
            Some(id) => key.with(attr::CURATION_ID, id),
            None => key,
        }
    }
}

impl fmt::Display for CurationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.curation_id {
            Some(id) => write!(f, "{}/curation{}", self.task, id),
            None => write!(f, "{}", self.task),
        }
    }
}

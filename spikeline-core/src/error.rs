//! Common error types for the spikeline engine

use thiserror::Error;
use uuid::Uuid;

/// Common result type for spikeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across the pipeline engine and workflows built on it
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Entity registry construction or lookup error
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// A parameter index is already bound to a different payload
    #[error(
        "Parameter set {paramset_idx} for '{method}' already exists with hash {existing}, \
         refusing to overwrite with hash {candidate}"
    )]
    ParamConflict {
        method: String,
        paramset_idx: i64,
        existing: Uuid,
        candidate: Uuid,
    },

    /// A key is malformed for the entity it addresses
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Upstream data required by a computation is absent or unreadable
    #[error("Missing data: {0}")]
    MissingData(String),

    /// Operation is recognized but deliberately not supported
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Requested resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid user input or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors raised while building or querying the entity registry
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("entity '{0}' is declared more than once")]
    DuplicateEntity(String),

    #[error("entity name '{0}' is not a valid identifier")]
    InvalidName(String),

    #[error("entity name '{0}' is reserved for engine bookkeeping")]
    ReservedName(String),

    #[error("entity '{child}' references unknown parent '{parent}'")]
    UnknownParent { child: String, parent: String },

    #[error("entity '{child}' declares parent '{parent}' more than once")]
    DuplicateParent { child: String, parent: String },

    #[error("unknown entity '{0}'")]
    UnknownEntity(String),

    #[error("attribute '{attribute}' is declared more than once on entity '{entity}'")]
    DuplicateAttribute { entity: String, attribute: String },

    #[error("entity '{0}' has an empty primary key")]
    EmptyKey(String),

    #[error(
        "entity '{child}' must carry key attribute '{attribute}' of parent '{parent}' \
         with a matching type"
    )]
    KeyNotCovered {
        child: String,
        parent: String,
        attribute: String,
    },

    #[error(
        "auto-populated entity '{entity}' must have a primary key equal to the union of \
         its primary parents' keys; attribute '{attribute}' breaks that"
    )]
    KeySourceMismatch { entity: String, attribute: String },

    #[error("auto-populated entity '{0}' has no primary parents to enumerate keys from")]
    NoPrimaryParents(String),

    #[error("part entity '{part}' names '{master}' as master, which is not a valid master")]
    InvalidMaster { part: String, master: String },

    #[error("dependency cycle detected involving entity '{0}'")]
    DependencyCycle(String),
}

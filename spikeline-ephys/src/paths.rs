//! Resolution between stored relative paths and on-disk locations
//!
//! The database stores session and output directories relative to one of
//! the configured data roots, with forward slashes, so the same rows work
//! from any machine that mounts the data. These helpers map between that
//! stored form and real paths.

use std::path::{Component, Path, PathBuf};

use spikeline_core::{Error, Result};

/// Locate a stored relative path under the configured roots, first match
/// wins. An absolute path that exists is returned unchanged.
pub fn find_full_path(roots: &[PathBuf], relative: &Path) -> Result<PathBuf> {
    if relative.is_absolute() {
        if relative.exists() {
            return Ok(relative.to_path_buf());
        }
        return Err(Error::MissingData(format!(
            "path not found: {}",
            relative.display()
        )));
    }
    for root in roots {
        let candidate = root.join(relative);
        if candidate.exists() {
            return Ok(candidate);
        }
    }
    Err(Error::MissingData(format!(
        "'{}' not found under any of {} data root(s)",
        relative.display(),
        roots.len()
    )))
}

/// The configured root a full path lives under
pub fn find_root_directory<'a>(roots: &'a [PathBuf], full_path: &Path) -> Result<&'a Path> {
    roots
        .iter()
        .find(|root| full_path.starts_with(root))
        .map(|root| root.as_path())
        .ok_or_else(|| {
            Error::MissingData(format!(
                "'{}' is outside every configured data root",
                full_path.display()
            ))
        })
}

/// Strip the containing root, leaving the form stored in the database
pub fn relative_path(roots: &[PathBuf], full_path: &Path) -> Result<PathBuf> {
    let root = find_root_directory(roots, full_path)?;
    full_path
        .strip_prefix(root)
        .map(|p| p.to_path_buf())
        .map_err(|_| {
            Error::Internal(format!(
                "failed to relativize '{}' against '{}'",
                full_path.display(),
                root.display()
            ))
        })
}

/// Forward-slash rendering used for stored paths
pub fn to_posix(path: &Path) -> String {
    let mut out = String::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => {
                if !out.is_empty() {
                    out.push('/');
                }
                out.push_str(&part.to_string_lossy());
            }
            Component::RootDir => out.push('/'),
            _ => {}
        }
    }
    out
}

use crate::error::Error;
use std::path::{Path, PathBuf};

/// Check that a resource path declared by a module is relative to the module directory.
pub fn validate_resource_path(path: &str) -> Result<(), Error> {
    if path.starts_with('/') || path.starts_with('\\') || Path::new(path).is_absolute() {
        return Err(Error::AbsoluteResourcePath(path.to_owned()));
    }
    Ok(())
}

/// Resolve a validated resource path against the directory its module was loaded from.
pub fn resolve_resource_path(module_dir: Option<&Path>, path: &str) -> PathBuf {
    match module_dir {
        Some(dir) if path.is_empty() => dir.to_path_buf(),
        Some(dir) => dir.join(path),
        None => PathBuf::from(path),
    }
}

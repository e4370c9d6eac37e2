use crate::error::Error;
use crate::export::{collect_registered, ModuleExport};
use lazy_static::lazy_static;
use libloading::Library;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Where a loading set looks for export descriptors.
#[derive(Debug, Clone, Copy)]
pub enum ModuleSource<'a> {
    /// Descriptors registered in the running binary.
    Current,
    /// Descriptors exposed by a shared object built with `keel_library!`.
    Path(&'a Path),
}

lazy_static! {
    static ref CURRENT: Arc<ModuleLibrary> = {
        let path = match std::env::current_exe().and_then(|p| p.canonicalize()) {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::debug!("location of the running binary is unknown: {}", e);
                None
            }
        };
        Arc::new(ModuleLibrary { path, lib: None })
    };
}

type ExportsFn = fn() -> Result<Vec<ModuleExport>, Error>;

/// The binary a set of modules was loaded from.
///
/// Instances hold their library, so a shared object stays mapped until the last module it
/// provided is destroyed.
pub struct ModuleLibrary {
    /// Canonical path of the binary.
    path: Option<PathBuf>,
    /// `None` for the running binary.
    lib: Option<Library>,
}

impl fmt::Debug for ModuleLibrary {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ModuleLibrary")
            .field("path", &self.path)
            .field("shared_object", &self.lib.is_some())
            .finish()
    }
}

impl ModuleLibrary {
    /// The running binary.
    pub fn current() -> Arc<ModuleLibrary> {
        CURRENT.clone()
    }

    /// Load a shared object from the filesystem.
    pub fn open(path: &Path) -> Result<Arc<ModuleLibrary>, Error> {
        let abs_path = path.canonicalize().map_err(|e| {
            Error::NotFound(format!("module library `{}`: {}", path.display(), e))
        })?;
        let lib = Library::new(abs_path.as_os_str()).map_err(|e| {
            Error::InvalidArgument(format!(
                "`{}` is not a loadable library: {}",
                abs_path.display(),
                e
            ))
        })?;
        tracing::info!(path = %abs_path.display(), "module library opened");
        Ok(Arc::new(ModuleLibrary {
            path: Some(abs_path),
            lib: Some(lib),
        }))
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// The directory containing the binary, used to resolve module resources.
    pub fn directory(&self) -> Option<&Path> {
        self.path.as_deref().and_then(Path::parent)
    }

    /// Build every descriptor the binary exposes.
    pub fn exports(&self) -> Result<Vec<ModuleExport>, Error> {
        match &self.lib {
            None => collect_registered(),
            Some(lib) => {
                let exports = unsafe {
                    lib.get::<ExportsFn>(b"keel_module_exports").map_err(|e| {
                        Error::InvalidArgument(format!(
                            "error loading required symbol `keel_module_exports`: {}",
                            e
                        ))
                    })?
                };
                exports()
            }
        }
    }
}

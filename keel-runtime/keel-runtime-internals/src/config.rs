use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Runtime configuration of a [`Context`](../context/struct.Context.html).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Directory that relative library paths given to `append_modules` are resolved against.
    /// Must be absolute when present. (default: the process working directory)
    pub module_root: Option<PathBuf>,
    /// Whether dropping a pseudo instance unloads modules nothing references any more.
    /// (default false)
    pub prune_on_release: bool,
    /// Upper bound on concurrently loaded modules, pseudo instances excluded. (default 1024)
    pub max_modules: usize,
}

impl Config {
    pub const fn default() -> Config {
        Config {
            module_root: None,
            prune_on_release: false,
            max_modules: 1024,
        }
    }

    pub fn with_module_root<P: Into<PathBuf>>(mut self, module_root: P) -> Self {
        self.module_root = Some(module_root.into());
        self
    }

    pub const fn with_prune_on_release(mut self, prune_on_release: bool) -> Self {
        self.prune_on_release = prune_on_release;
        self
    }

    pub const fn with_max_modules(mut self, max_modules: usize) -> Self {
        self.max_modules = max_modules;
        self
    }

    /// Fold one construction option into this configuration.
    pub fn apply(&mut self, option: &ContextOption) {
        match option {
            ContextOption::ModuleRoot { path } => self.module_root = Some(path.clone()),
            ContextOption::PruneOnRelease { enabled } => self.prune_on_release = *enabled,
            ContextOption::MaxModules { count } => self.max_modules = *count,
            ContextOption::Unknown => {
                tracing::debug!("ignoring unknown context option");
            }
        }
    }

    /// Validate that the module root is absolute and that at least one module may be loaded.
    pub fn validate(&self) -> Result<(), Error> {
        if let Some(root) = &self.module_root {
            if !root.is_absolute() {
                return Err(Error::InvalidArgument(format!(
                    "module root `{}` must be an absolute path",
                    root.display()
                )));
            }
        }
        if self.max_modules == 0 {
            return Err(Error::InvalidArgument(
                "max modules must be greater than 0".to_owned(),
            ));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Config {
        Config::default()
    }
}

/// One block of a context construction chain.
///
/// Options are tagged by `type`. Kinds this runtime does not know deserialize to
/// [`ContextOption::Unknown`] and are skipped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContextOption {
    ModuleRoot { path: PathBuf },
    PruneOnRelease { enabled: bool },
    MaxModules { count: usize },
    #[serde(other)]
    Unknown,
}

impl ContextOption {
    /// Parse a JSON array of option blocks.
    pub fn parse_chain(json: &str) -> Result<Vec<ContextOption>, Error> {
        serde_json::from_str(json)
            .map_err(|e| Error::InvalidArgument(format!("malformed context options: {}", e)))
    }
}

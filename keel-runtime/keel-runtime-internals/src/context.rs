//! The runtime context: the registry of loaded modules, and the locks that serialize loading
//! and unloading.

use crate::config::{Config, ContextOption};
use crate::error::Error;
use crate::info::{ModuleInfo, ModuleKind};
#[cfg(feature = "concurrent_testpoints")]
use crate::lock_testpoints::LockTestpoints;
use crate::parameter::ParameterInfo;
use crate::registry::Registry;
use crate::RUNTIME_VERSION;
use keel_module::{ParameterAccess, ParameterValue, Version, GLOBAL_NAMESPACE};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, TryLockError,
};

/// Lock `mutex`, recovering the guard if a previous holder panicked.
pub(crate) fn lock_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) struct ContextInner {
    config: Config,
    registry: RwLock<Registry>,
    /// Held for the whole of a `finish`, `unload`, or prune.
    critical: Mutex<()>,
    /// Held while dynamic dependency edges change.
    graph: Mutex<()>,
    next_pseudo: AtomicUsize,
    #[cfg(feature = "concurrent_testpoints")]
    lock_testpoints: LockTestpoints,
}

/// A handle to a module runtime.
///
/// Handles are cheap to clone and all refer to the same registry. Every loaded module holds a
/// handle too, so the registry lives until its last module is unloaded.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Context")
            .field("config", &self.inner.config)
            .field("modules", &self.registry().module_count())
            .finish()
    }
}

impl Default for Context {
    fn default() -> Context {
        Context::new()
    }
}

impl Context {
    /// Create a context with the default configuration.
    pub fn new() -> Context {
        Context::from_config(Config::default())
    }

    /// Create a context with `config`, which is validated first.
    pub fn with_config(config: Config) -> Result<Context, Error> {
        config.validate()?;
        Ok(Context::from_config(config))
    }

    pub fn builder() -> ContextBuilder {
        ContextBuilder::new()
    }

    fn from_config(config: Config) -> Context {
        tracing::debug!(
            max_modules = config.max_modules,
            prune_on_release = config.prune_on_release,
            "creating context"
        );
        Context {
            inner: Arc::new(ContextInner {
                config,
                registry: RwLock::new(Registry::default()),
                critical: Mutex::new(()),
                graph: Mutex::new(()),
                next_pseudo: AtomicUsize::new(0),
                #[cfg(feature = "concurrent_testpoints")]
                lock_testpoints: LockTestpoints::new(),
            }),
        }
    }

    /// Return a new owning handle to this context.
    pub fn acquire(&self) -> Context {
        self.clone()
    }

    /// Number of live handles, including the ones held by loaded modules.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn ptr_eq(&self, other: &Context) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// The version of this runtime.
    pub fn version(&self) -> Version {
        RUNTIME_VERSION
    }

    /// Check that this runtime can serve a caller built against `required`.
    pub fn check_version(&self, required: &Version) -> Result<(), Error> {
        if !RUNTIME_VERSION.compatible_with(required) {
            tracing::warn!(
                runtime = %RUNTIME_VERSION,
                required = %required,
                "incompatible runtime version requested"
            );
            bail_kind!(
                Unsupported,
                "runtime version {} does not satisfy required version {}",
                RUNTIME_VERSION,
                required
            );
        }
        Ok(())
    }

    /// Look up a loaded module by name.
    pub fn find_by_name(&self, name: &str) -> Result<ModuleInfo, Error> {
        match self.registry().module(name) {
            Some(info) => Ok(info.clone()),
            None => Err(Error::NotFound(format!("no module named `{}` is loaded", name))),
        }
    }

    /// Look up the module exporting a symbol compatible with `version`.
    pub fn find_by_symbol(
        &self,
        name: &str,
        namespace: &str,
        version: &Version,
    ) -> Result<ModuleInfo, Error> {
        let registry = self.registry();
        let owner = registry
            .compatible_symbol(name, namespace, version)
            .and_then(|symbol| registry.module(&symbol.owner));
        match owner {
            Some(info) => Ok(info.clone()),
            None => Err(Error::NotFound(format!(
                "no loaded module exports `{}::{}` compatible with {}",
                namespace, name, version
            ))),
        }
    }

    /// Whether at least one loaded module exports into `namespace`. The global namespace always
    /// exists.
    pub fn namespace_exists(&self, namespace: &str) -> bool {
        namespace == GLOBAL_NAMESPACE || self.registry().namespace_exists(namespace)
    }

    /// Handles to every loaded module, ordered by name.
    pub fn loaded_modules(&self) -> Vec<ModuleInfo> {
        self.registry().modules().cloned().collect()
    }

    /// Unload every module that has no dependents and no unload locks, until none is left.
    pub fn prune_instances(&self) -> Result<(), Error> {
        let _critical = self.try_enter_critical("prune")?;
        let mut unloaded = 0;
        loop {
            let candidates: Vec<ModuleInfo> = self
                .registry()
                .modules()
                .filter(|info| info.dependent_count() == 0 && info.unload_lock_count() == 0)
                .cloned()
                .collect();
            let mut progressed = false;
            for info in candidates {
                match info.unload_in_critical(self) {
                    Ok(()) => {
                        unloaded += 1;
                        progressed = true;
                    }
                    Err(e) => tracing::debug!(module = info.name(), "not pruned: {}", e),
                }
            }
            if !progressed {
                break;
            }
        }
        tracing::debug!(unloaded = unloaded, "pruned context");
        Ok(())
    }

    /// Type and access tiers of a parameter of a loaded module.
    pub fn query_parameter(&self, module: &str, parameter: &str) -> Result<ParameterInfo, Error> {
        let instance = self.find_by_name(module)?.instance_or_not_found()?;
        instance.parameters().info(parameter).ok_or_else(|| {
            Error::NotFound(format!(
                "module `{}` has no parameter `{}`",
                module, parameter
            ))
        })
    }

    /// Read a parameter as a caller outside any module.
    pub fn read_parameter(&self, module: &str, parameter: &str) -> Result<ParameterValue, Error> {
        let instance = self.find_by_name(module)?.instance_or_not_found()?;
        instance
            .parameters()
            .read(module, parameter, ParameterAccess::Public)
    }

    /// Write a parameter as a caller outside any module.
    pub fn write_parameter<V: Into<ParameterValue>>(
        &self,
        module: &str,
        parameter: &str,
        value: V,
    ) -> Result<(), Error> {
        let instance = self.find_by_name(module)?.instance_or_not_found()?;
        instance
            .parameters()
            .write(module, parameter, ParameterAccess::Public, value.into())
    }

    /// Resolve a library path against the configured module root.
    pub(crate) fn resolve_module_path(&self, path: &Path) -> PathBuf {
        match &self.inner.config.module_root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        }
    }

    pub(crate) fn registry(&self) -> RwLockReadGuard<'_, Registry> {
        self.inner
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn registry_mut(&self) -> RwLockWriteGuard<'_, Registry> {
        self.inner
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Enter the section shared by `finish`, `unload` and prune, or fail with `Busy` if another
    /// caller, possibly on this thread, is inside it.
    pub(crate) fn try_enter_critical(&self, op: &str) -> Result<MutexGuard<'_, ()>, Error> {
        match self.inner.critical.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::Poisoned(guard)) => Ok(guard.into_inner()),
            Err(TryLockError::WouldBlock) => {
                tracing::debug!(op = op, "context is busy loading or unloading");
                Err(Error::Busy(format!(
                    "cannot {} while the context is loading or unloading modules",
                    op
                )))
            }
        }
    }

    pub(crate) fn lock_graph(&self) -> MutexGuard<'_, ()> {
        lock_recover(&self.inner.graph)
    }

    pub(crate) fn next_pseudo_id(&self) -> usize {
        self.inner.next_pseudo.fetch_add(1, Ordering::SeqCst)
    }

    #[cfg(feature = "concurrent_testpoints")]
    pub fn lock_testpoints(&self) -> &LockTestpoints {
        &self.inner.lock_testpoints
    }

    pub(crate) fn into_raw(self) -> *const ContextInner {
        Arc::into_raw(self.inner)
    }

    /// Borrow a handle previously produced by `into_raw` without consuming it.
    pub(crate) unsafe fn clone_from_raw(raw: *const ContextInner) -> Context {
        let inner = Arc::from_raw(raw);
        let ctx = Context {
            inner: inner.clone(),
        };
        let _ = Arc::into_raw(inner);
        ctx
    }

    pub(crate) unsafe fn from_raw(raw: *const ContextInner) -> Context {
        Context {
            inner: Arc::from_raw(raw),
        }
    }
}

impl ModuleInfo {
    fn instance_or_not_found(&self) -> Result<crate::instance::ModuleInstance, Error> {
        if self.kind() == ModuleKind::Pseudo {
            bail_kind!(NotFound, "pseudo module `{}` has no parameters", self.name());
        }
        self.instance()
            .ok_or_else(|| Error::NotFound(format!("module `{}` is not loaded", self.name())))
    }
}

/// Assemble a [`Context`] from a configuration and a chain of options.
#[derive(Debug, Default)]
pub struct ContextBuilder {
    config: Config,
}

impl ContextBuilder {
    pub fn new() -> ContextBuilder {
        ContextBuilder {
            config: Config::default(),
        }
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn with_option(mut self, option: &ContextOption) -> Self {
        self.config.apply(option);
        self
    }

    pub fn with_options<'a, I: IntoIterator<Item = &'a ContextOption>>(mut self, options: I) -> Self {
        for option in options {
            self.config.apply(option);
        }
        self
    }

    /// Apply a JSON array of option blocks.
    pub fn with_options_json(self, json: &str) -> Result<Self, Error> {
        let options = ContextOption::parse_chain(json)?;
        Ok(self.with_options(options.iter()))
    }

    pub fn build(self) -> Result<Context, Error> {
        Context::with_config(self.config)
    }
}

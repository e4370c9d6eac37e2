//! Long-lived handles to loaded modules.

use crate::context::{lock_recover, Context};
use crate::error::Error;
use crate::instance::ModuleInstance;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Load state of a module.
///
/// A module starts `Loaded`, is `Unloading` while its instance is being destroyed, and is `Freed`
/// afterwards. Handles that outlive the module keep reporting `Freed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    Loaded,
    Unloading,
    Freed,
}

impl ModuleState {
    fn from_u8(v: u8) -> ModuleState {
        match v {
            STATE_LOADED => ModuleState::Loaded,
            STATE_UNLOADING => ModuleState::Unloading,
            _ => ModuleState::Freed,
        }
    }
}

const STATE_LOADED: u8 = 0;
const STATE_UNLOADING: u8 = 1;
const STATE_FREED: u8 = 2;

/// Whether a module was constructed from an export descriptor or stands in for the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    Regular,
    Pseudo,
}

pub(crate) struct InfoInner {
    name: String,
    description: Option<String>,
    author: Option<String>,
    license: Option<String>,
    module_path: Option<PathBuf>,
    kind: ModuleKind,
    state: AtomicU8,
    unload_locks: AtomicUsize,
    dependents: AtomicUsize,
    instance: Mutex<Option<ModuleInstance>>,
}

/// A shareable, reference-counted handle to a module.
///
/// The handle stays valid after the module is unloaded; only [`state`](#method.state) changes.
#[derive(Clone)]
pub struct ModuleInfo {
    inner: Arc<InfoInner>,
}

impl fmt::Debug for ModuleInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ModuleInfo")
            .field("name", &self.inner.name)
            .field("kind", &self.inner.kind)
            .field("state", &self.state())
            .finish()
    }
}

pub(crate) struct ModuleMetadata {
    pub name: String,
    pub description: Option<String>,
    pub author: Option<String>,
    pub license: Option<String>,
    pub module_path: Option<PathBuf>,
}

impl ModuleInfo {
    pub(crate) fn new(meta: ModuleMetadata, kind: ModuleKind) -> ModuleInfo {
        ModuleInfo {
            inner: Arc::new(InfoInner {
                name: meta.name,
                description: meta.description,
                author: meta.author,
                license: meta.license,
                module_path: meta.module_path,
                kind,
                state: AtomicU8::new(STATE_LOADED),
                unload_locks: AtomicUsize::new(0),
                dependents: AtomicUsize::new(0),
                instance: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn description(&self) -> Option<&str> {
        self.inner.description.as_deref()
    }

    pub fn author(&self) -> Option<&str> {
        self.inner.author.as_deref()
    }

    pub fn license(&self) -> Option<&str> {
        self.inner.license.as_deref()
    }

    /// Directory of the binary the module was loaded from, when known.
    pub fn module_path(&self) -> Option<&Path> {
        self.inner.module_path.as_deref()
    }

    pub fn kind(&self) -> ModuleKind {
        self.inner.kind
    }

    pub fn state(&self) -> ModuleState {
        ModuleState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    /// Point-in-time check that the module is loaded.
    pub fn is_loaded(&self) -> bool {
        self.state() == ModuleState::Loaded
    }

    /// Return a new owning handle to the same module.
    pub fn acquire(&self) -> ModuleInfo {
        self.clone()
    }

    /// Number of live handles to this module, including the ones held by the runtime.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn unload_lock_count(&self) -> usize {
        self.inner.unload_locks.load(Ordering::SeqCst)
    }

    /// Number of modules holding a dependency edge to this one.
    pub fn dependent_count(&self) -> usize {
        self.inner.dependents.load(Ordering::SeqCst)
    }

    pub fn ptr_eq(&self, other: &ModuleInfo) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Prevent the module from being unloaded until the returned guard is dropped.
    pub fn lock_unload(&self) -> Result<UnloadLock, Error> {
        self.inner.unload_locks.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = self.check_loaded() {
            self.inner.unload_locks.fetch_sub(1, Ordering::SeqCst);
            return Err(e);
        }
        Ok(UnloadLock { info: self.clone() })
    }

    /// Unload the module from `ctx`.
    ///
    /// Fails with `Busy` while another module depends on it, while an [`UnloadLock`] exists, or
    /// while a `finish` or `unload` is running on the same context. A failed unload leaves the
    /// module loaded.
    pub fn unload(&self, ctx: &Context) -> Result<(), Error> {
        if self.kind() == ModuleKind::Pseudo {
            bail_kind!(
                InvalidArgument,
                "pseudo module `{}` is released by dropping it",
                self.name()
            );
        }
        let _critical = ctx.try_enter_critical("unload")?;
        self.unload_in_critical(ctx)
    }

    /// Unload with the context's critical section already held by the caller.
    pub(crate) fn unload_in_critical(&self, ctx: &Context) -> Result<(), Error> {
        match ctx.registry().module(self.name()) {
            Some(registered) if registered.ptr_eq(self) => {}
            _ => bail_kind!(
                NotFound,
                "module `{}` is not loaded in this context",
                self.name()
            ),
        }
        self.begin_unload()?;

        #[cfg(feature = "concurrent_testpoints")]
        ctx.lock_testpoints()
            .module_info_unload_before_destroy
            .check();

        ctx.registry_mut().remove(self.name());
        if let Some(instance) = self.take_instance() {
            instance.teardown();
        }
        tracing::info!(module = self.name(), "module unloaded");
        Ok(())
    }

    /// Claim the module for unloading, or explain why it can not be.
    fn begin_unload(&self) -> Result<(), Error> {
        if self
            .inner
            .state
            .compare_exchange(
                STATE_LOADED,
                STATE_UNLOADING,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            bail_kind!(NotFound, "module `{}` is not loaded", self.name());
        }
        let dependents = self.dependent_count();
        let locks = self.unload_lock_count();
        if dependents > 0 || locks > 0 {
            self.inner.state.store(STATE_LOADED, Ordering::SeqCst);
            tracing::debug!(
                module = self.name(),
                dependents = dependents,
                locks = locks,
                "refusing to unload module"
            );
            bail_kind!(
                Busy,
                "module `{}` has {} dependents and {} unload locks",
                self.name(),
                dependents,
                locks
            );
        }
        Ok(())
    }

    fn check_loaded(&self) -> Result<(), Error> {
        match self.state() {
            ModuleState::Loaded => Ok(()),
            ModuleState::Unloading => Err(Error::Busy(format!(
                "module `{}` is being unloaded",
                self.name()
            ))),
            ModuleState::Freed => Err(Error::NotFound(format!(
                "module `{}` is not loaded",
                self.name()
            ))),
        }
    }

    /// Record a new incoming dependency edge.
    pub(crate) fn add_dependent(&self) -> Result<(), Error> {
        self.inner.dependents.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = self.check_loaded() {
            self.inner.dependents.fetch_sub(1, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }

    pub(crate) fn remove_dependent(&self) {
        self.inner.dependents.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn set_instance(&self, instance: ModuleInstance) {
        *lock_recover(&self.inner.instance) = Some(instance);
    }

    pub(crate) fn instance(&self) -> Option<ModuleInstance> {
        lock_recover(&self.inner.instance).clone()
    }

    pub(crate) fn take_instance(&self) -> Option<ModuleInstance> {
        lock_recover(&self.inner.instance).take()
    }

    pub(crate) fn mark_unloading(&self) {
        self.inner.state.store(STATE_UNLOADING, Ordering::SeqCst);
    }

    pub(crate) fn mark_freed(&self) {
        self.inner.state.store(STATE_FREED, Ordering::SeqCst);
    }

    pub(crate) fn into_raw(self) -> *const InfoInner {
        Arc::into_raw(self.inner)
    }

    /// Borrow a handle previously produced by `into_raw` without consuming it.
    pub(crate) unsafe fn clone_from_raw(raw: *const InfoInner) -> ModuleInfo {
        let inner = Arc::from_raw(raw);
        let info = ModuleInfo {
            inner: inner.clone(),
        };
        let _ = Arc::into_raw(inner);
        info
    }

    pub(crate) unsafe fn from_raw(raw: *const InfoInner) -> ModuleInfo {
        ModuleInfo {
            inner: Arc::from_raw(raw),
        }
    }
}

/// A lease that keeps a module loaded.
///
/// Any number of locks may be held at once; `unload` fails until all of them are dropped.
pub struct UnloadLock {
    info: ModuleInfo,
}

impl UnloadLock {
    pub fn module_info(&self) -> &ModuleInfo {
        &self.info
    }
}

impl Drop for UnloadLock {
    fn drop(&mut self) {
        self.info.inner.unload_locks.fetch_sub(1, Ordering::SeqCst);
    }
}

impl fmt::Debug for UnloadLock {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("UnloadLock").field(&self.info.name()).finish()
    }
}

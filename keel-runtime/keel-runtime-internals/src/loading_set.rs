//! Batched, transactional module loading.
//!
//! Modules are appended to a [`LoadingSet`] and constructed together by
//! [`finish`](struct.LoadingSet.html#method.finish). Imports may be satisfied by already loaded
//! modules or by other modules of the same set, in which case the exporter is constructed
//! first. If any constructor fails, every module constructed so far is destroyed again in
//! reverse order and nothing is published.

use crate::context::Context;
use crate::error::Error;
use crate::export::{AnyArc, ModuleExport};
use crate::info::{ModuleInfo, ModuleKind, ModuleMetadata, UnloadLock};
use crate::instance::{ExportedSymbol, ImportedSymbol, InstanceParts, ModuleInstance};
use crate::library::{ModuleLibrary, ModuleSource};
use crate::parameter::ParameterTable;
use crate::registry::Registry;
use keel_module::{resolve_resource_path, SymbolId, Version};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Why a module of a loading set was not loaded.
#[derive(Debug, Clone, Copy)]
pub enum LoadFailure<'a> {
    /// The module, or one it depends on, failed to construct.
    Failed(&'a Error),
    /// The set was dropped or dismissed before the module was loaded.
    Dismissed,
}

type SuccessCallback = Box<dyn FnOnce(&ModuleInfo) + Send>;
type ErrorCallback = Box<dyn for<'a> FnOnce(&'a ModuleExport, LoadFailure<'a>) + Send>;
type SetSuccessCallback = Box<dyn FnOnce(&[ModuleInfo]) + Send>;
type SetErrorCallback = Box<dyn for<'a> FnOnce(LoadFailure<'a>) + Send>;

struct ModuleCallback {
    on_success: SuccessCallback,
    on_error: ErrorCallback,
}

struct SetCallback {
    on_success: SetSuccessCallback,
    on_error: SetErrorCallback,
}

enum PendingStatus {
    Pending,
    Failed { module: String, message: String },
}

struct PendingModule {
    export: Arc<ModuleExport>,
    library: Arc<ModuleLibrary>,
    status: PendingStatus,
    /// Keeps the owner of a freestanding module loaded until the set is done with it.
    owner_lock: Option<UnloadLock>,
}

impl PendingModule {
    fn is_pending(&self) -> bool {
        matches!(self.status, PendingStatus::Pending)
    }
}

struct PendingSymbol {
    id: SymbolId,
    module: String,
}

#[derive(Default)]
struct SetState {
    modules: BTreeMap<String, PendingModule>,
    symbols: HashMap<(String, String), PendingSymbol>,
    finished: bool,
}

impl SetState {
    fn pending_symbol(&self, name: &str, namespace: &str, version: &Version) -> Option<&PendingSymbol> {
        self.symbols
            .get(&(name.to_owned(), namespace.to_owned()))
            .filter(|s| s.id.version.compatible_with(version))
            .filter(|s| {
                self.modules
                    .get(&s.module)
                    .map(PendingModule::is_pending)
                    .unwrap_or(false)
            })
    }

    fn namespace_pending(&self, namespace: &str) -> bool {
        self.symbols.values().any(|s| {
            s.id.namespace == namespace
                && self
                    .modules
                    .get(&s.module)
                    .map(PendingModule::is_pending)
                    .unwrap_or(false)
        })
    }
}

/// A read-only view of a loading set, handed to module constructors.
#[derive(Clone)]
pub struct LoadingSetView {
    ctx: Context,
    state: Arc<RwLock<SetState>>,
}

impl fmt::Debug for LoadingSetView {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("LoadingSetView").finish()
    }
}

impl LoadingSetView {
    fn state(&self) -> RwLockReadGuard<'_, SetState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Whether `name` is pending in the set or already loaded.
    pub fn has_module(&self, name: &str) -> bool {
        let pending = self
            .state()
            .modules
            .get(name)
            .map(PendingModule::is_pending)
            .unwrap_or(false);
        pending || self.ctx.find_by_name(name).is_ok()
    }

    /// Whether a compatible symbol is pending in the set or already loaded.
    pub fn has_symbol(&self, name: &str, namespace: &str, version: &Version) -> bool {
        let pending = self.state().pending_symbol(name, namespace, version).is_some();
        pending || self.ctx.find_by_symbol(name, namespace, version).is_ok()
    }
}

/// A batch of modules to be loaded together.
///
/// Dropping an unfinished set dismisses it: every pending module's error callback runs with
/// [`LoadFailure::Dismissed`].
pub struct LoadingSet {
    ctx: Context,
    state: Arc<RwLock<SetState>>,
    callbacks: BTreeMap<String, Vec<ModuleCallback>>,
    set_callbacks: Vec<SetCallback>,
}

impl fmt::Debug for LoadingSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = self.read_state();
        f.debug_struct("LoadingSet")
            .field("modules", &state.modules.keys().collect::<Vec<_>>())
            .field("finished", &state.finished)
            .finish()
    }
}

/// A pending module selected for construction.
struct Candidate {
    name: String,
    export: Arc<ModuleExport>,
    library: Arc<ModuleLibrary>,
}

impl LoadingSet {
    pub fn new(ctx: &Context) -> LoadingSet {
        LoadingSet {
            ctx: ctx.clone(),
            state: Arc::new(RwLock::new(SetState::default())),
            callbacks: BTreeMap::new(),
            set_callbacks: vec![],
        }
    }

    pub fn view(&self) -> LoadingSetView {
        LoadingSetView {
            ctx: self.ctx.clone(),
            state: self.state.clone(),
        }
    }

    fn read_state(&self) -> RwLockReadGuard<'_, SetState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, SetState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.read_state().finished {
            bail_kind!(InvalidArgument, "loading set was already finished");
        }
        Ok(())
    }

    pub fn has_module(&self, name: &str) -> bool {
        self.view().has_module(name)
    }

    pub fn has_symbol(&self, name: &str, namespace: &str, version: &Version) -> bool {
        self.view().has_symbol(name, namespace, version)
    }

    /// Append every descriptor from `source` accepted by `filter`.
    ///
    /// All accepted descriptors are appended or none is: a name or symbol that clashes with a
    /// pending or loaded module fails the whole call with `AlreadyExists`.
    pub fn append_modules<F>(&mut self, source: ModuleSource, mut filter: F) -> Result<(), Error>
    where
        F: FnMut(&ModuleExport) -> bool,
    {
        self.ensure_open()?;
        let library = match source {
            ModuleSource::Current => ModuleLibrary::current(),
            ModuleSource::Path(path) => ModuleLibrary::open(&self.ctx.resolve_module_path(path))?,
        };
        let batch = library
            .exports()?
            .into_iter()
            .filter(|export| filter(export))
            .map(|export| (export, library.clone(), None))
            .collect();
        self.insert_batch(batch)
    }

    /// Append a descriptor built at runtime by `owner`, sharing its library.
    ///
    /// `owner` can not be unloaded while the module is pending.
    pub fn append_freestanding_module(
        &mut self,
        owner: &ModuleInstance,
        export: ModuleExport,
    ) -> Result<(), Error> {
        self.ensure_open()?;
        let lock = owner.module_info().lock_unload()?;
        let library = match owner.library() {
            Some(library) => library.clone(),
            None => ModuleLibrary::current(),
        };
        self.insert_batch(vec![(export, library, Some(lock))])
    }

    fn insert_batch(
        &mut self,
        batch: Vec<(ModuleExport, Arc<ModuleLibrary>, Option<UnloadLock>)>,
    ) -> Result<(), Error> {
        let registry = self.ctx.registry();
        let mut state = self.write_state();

        let mut names = HashSet::new();
        let mut keys = HashSet::new();
        for (export, _, _) in batch.iter() {
            let name = export.name();
            if state.modules.contains_key(name)
                || registry.module(name).is_some()
                || !names.insert(name)
            {
                bail_kind!(AlreadyExists, "module `{}` is already loaded or pending", name);
            }
            for id in export.symbol_exports() {
                let key = id.key();
                if state.symbols.contains_key(&key)
                    || registry.symbol(&id.name, &id.namespace).is_some()
                    || !keys.insert(key)
                {
                    bail_kind!(
                        AlreadyExists,
                        "symbol {} of module `{}` is already exported or pending",
                        id,
                        name
                    );
                }
            }
        }

        for (export, library, owner_lock) in batch {
            let name = export.name().to_owned();
            for id in export.symbol_exports() {
                state.symbols.insert(
                    id.key(),
                    PendingSymbol {
                        id: id.clone(),
                        module: name.clone(),
                    },
                );
            }
            tracing::debug!(module = name.as_str(), "module appended to loading set");
            state.modules.insert(
                name,
                PendingModule {
                    export: Arc::new(export),
                    library,
                    status: PendingStatus::Pending,
                    owner_lock,
                },
            );
        }
        Ok(())
    }

    /// Register callbacks for one module of the set.
    ///
    /// If the module is already loaded, `on_success` runs immediately. If it already failed,
    /// `on_error` runs immediately.
    pub fn append_callback<S, E>(&mut self, module: &str, on_success: S, on_error: E) -> Result<(), Error>
    where
        S: FnOnce(&ModuleInfo) + Send + 'static,
        E: for<'a> FnOnce(&'a ModuleExport, LoadFailure<'a>) + Send + 'static,
    {
        self.ensure_open()?;
        let found = {
            let state = self.read_state();
            state.modules.get(module).map(|pending| match &pending.status {
                PendingStatus::Pending => None,
                PendingStatus::Failed { module: failing, message } => Some((
                    pending.export.clone(),
                    Error::ConstructionFailed {
                        module: failing.clone(),
                        source: anyhow::format_err!("{}", message),
                    },
                )),
            })
        };
        match found {
            Some(None) => self
                .callbacks
                .entry(module.to_owned())
                .or_insert_with(Vec::new)
                .push(ModuleCallback {
                    on_success: Box::new(on_success),
                    on_error: Box::new(on_error),
                }),
            Some(Some((export, err))) => on_error(&export, LoadFailure::Failed(&err)),
            None => {
                let info = self.ctx.find_by_name(module).map_err(|_| {
                    Error::NotFound(format!(
                        "module `{}` is not part of the loading set",
                        module
                    ))
                })?;
                on_success(&info);
            }
        }
        Ok(())
    }

    /// Register callbacks that run once when the set is finished, failed, or dismissed.
    pub fn append_set_callback<S, E>(&mut self, on_success: S, on_error: E) -> Result<(), Error>
    where
        S: FnOnce(&[ModuleInfo]) + Send + 'static,
        E: for<'a> FnOnce(LoadFailure<'a>) + Send + 'static,
    {
        self.ensure_open()?;
        self.set_callbacks.push(SetCallback {
            on_success: Box::new(on_success),
            on_error: Box::new(on_error),
        });
        Ok(())
    }

    /// Construct and publish every pending module.
    ///
    /// Fails with `Busy` if another `finish` or `unload` is running on the context, including
    /// one further up the current call stack.
    pub fn finish(&mut self) -> Result<(), Error> {
        self.ensure_open()?;
        let ctx = self.ctx.clone();
        let _critical = ctx.try_enter_critical("finish")?;

        let candidates: BTreeMap<String, Candidate> = self
            .read_state()
            .modules
            .iter()
            .filter(|(_, m)| m.is_pending())
            .map(|(name, m)| {
                (
                    name.clone(),
                    Candidate {
                        name: name.clone(),
                        export: m.export.clone(),
                        library: m.library.clone(),
                    },
                )
            })
            .collect();

        let order = {
            let registry = ctx.registry();
            let state = self.read_state();
            let limit = ctx.config().max_modules;
            if registry.module_count() + candidates.len() > limit {
                bail_kind!(
                    InvalidArgument,
                    "loading {} modules would exceed the limit of {}",
                    candidates.len(),
                    limit
                );
            }
            let graph = resolve(&candidates, &registry, &state)?;
            topological_order(&graph)?
        };

        #[cfg(feature = "concurrent_testpoints")]
        ctx.lock_testpoints()
            .loading_set_finish_before_construction
            .check();

        let view = self.view();
        let mut staged: Vec<ModuleInstance> = Vec::with_capacity(order.len());
        for (idx, name) in order.iter().enumerate() {
            let candidate = match candidates.get(name) {
                Some(c) => c,
                None => return Err(keel_format_err!("module `{}` vanished from the set", name)),
            };
            match construct(&ctx, candidate, &staged, &view) {
                Ok(instance) => staged.push(instance),
                Err(e) => return Err(self.roll_back(staged, &order[idx..], e)),
            }
        }
        for idx in 0..staged.len() {
            if let Err(source) = staged[idx].start() {
                let err = Error::ConstructionFailed {
                    module: order[idx].clone(),
                    source: source.context("start event failed"),
                };
                return Err(self.roll_back(staged, &order[idx..=idx], err));
            }
        }

        #[cfg(feature = "concurrent_testpoints")]
        ctx.lock_testpoints()
            .loading_set_finish_before_publish
            .check();

        if let Err(e) = publish(&ctx, &staged) {
            return Err(self.roll_back(staged, &order, e));
        }

        let infos: Vec<ModuleInfo> = staged.iter().map(|i| i.module_info().clone()).collect();
        {
            let mut state = self.write_state();
            state.finished = true;
            state.modules.clear();
            state.symbols.clear();
        }
        tracing::info!(modules = infos.len(), "loading set finished");

        for info in infos.iter() {
            if let Some(callbacks) = self.callbacks.remove(info.name()) {
                for callback in callbacks {
                    (callback.on_success)(info);
                }
            }
        }
        for callback in std::mem::take(&mut self.set_callbacks) {
            (callback.on_success)(&infos);
        }
        Ok(())
    }

    /// Destroy `staged` in reverse, mark `failed` as failed, and report `error`.
    ///
    /// Modules that were rolled back but did not fail stay pending with their callbacks.
    fn roll_back(&mut self, staged: Vec<ModuleInstance>, failed: &[String], error: Error) -> Error {
        tracing::warn!(
            constructed = staged.len(),
            "loading set failed, rolling back: {}",
            error
        );
        for instance in staged.into_iter().rev() {
            instance.teardown();
        }

        let failing = failed.first().cloned().unwrap_or_default();
        let message = match &error {
            Error::ConstructionFailed { source, .. } => format!("{:#}", source),
            other => other.to_string(),
        };
        let mut exports = vec![];
        {
            let mut state = self.write_state();
            for name in failed {
                if let Some(pending) = state.modules.get_mut(name) {
                    pending.status = PendingStatus::Failed {
                        module: failing.clone(),
                        message: message.clone(),
                    };
                    pending.owner_lock = None;
                    exports.push(pending.export.clone());
                }
            }
            let failed: HashSet<&String> = failed.iter().collect();
            state.symbols.retain(|_, s| !failed.contains(&s.module));
        }

        for export in exports {
            if let Some(callbacks) = self.callbacks.remove(export.name()) {
                for callback in callbacks {
                    (callback.on_error)(&export, LoadFailure::Failed(&error));
                }
            }
        }
        for callback in std::mem::take(&mut self.set_callbacks) {
            (callback.on_error)(LoadFailure::Failed(&error));
        }
        error
    }

    /// Abandon the set, running the error callbacks of every pending module.
    pub fn dismiss(self) {
        drop(self)
    }

    fn dismiss_pending(&mut self) {
        let callbacks = std::mem::take(&mut self.callbacks);
        let set_callbacks = std::mem::take(&mut self.set_callbacks);
        if callbacks.is_empty() && set_callbacks.is_empty() {
            return;
        }
        tracing::debug!(modules = callbacks.len(), "dismissing loading set");
        let exports: Vec<(Arc<ModuleExport>, Vec<ModuleCallback>)> = {
            let state = self.read_state();
            callbacks
                .into_iter()
                .filter_map(|(name, cbs)| state.modules.get(&name).map(|m| (m.export.clone(), cbs)))
                .collect()
        };
        for (export, callbacks) in exports {
            for callback in callbacks {
                (callback.on_error)(&export, LoadFailure::Dismissed);
            }
        }
        for callback in set_callbacks {
            (callback.on_error)(LoadFailure::Dismissed);
        }
    }
}

impl Drop for LoadingSet {
    fn drop(&mut self) {
        let finished = self.read_state().finished;
        if !finished {
            self.dismiss_pending();
        }
    }
}

/// Map every candidate to the candidates it must be constructed after, or explain which import
/// can not be satisfied.
fn resolve(
    candidates: &BTreeMap<String, Candidate>,
    registry: &Registry,
    state: &SetState,
) -> Result<BTreeMap<String, BTreeSet<String>>, Error> {
    let mut graph = BTreeMap::new();
    for (name, candidate) in candidates.iter() {
        let export = &candidate.export;
        let mut deps = BTreeSet::new();
        for import in export.symbol_imports() {
            if let Some(pending) = state.pending_symbol(&import.name, &import.namespace, &import.version) {
                deps.insert(pending.module.clone());
            } else if registry
                .compatible_symbol(&import.name, &import.namespace, &import.version)
                .is_none()
            {
                bail_kind!(
                    NotFound,
                    "module `{}` imports {}, which no module provides",
                    name,
                    import
                );
            }
        }
        for namespace in export.namespace_imports() {
            if !registry.namespace_exists(namespace) && !state.namespace_pending(namespace) {
                bail_kind!(
                    NotFound,
                    "module `{}` imports namespace `{}`, which does not exist",
                    name,
                    namespace
                );
            }
        }
        for dep in export.dependencies() {
            let loaded = registry
                .module(dep.name())
                .map(|m| m.ptr_eq(dep) && m.is_loaded())
                .unwrap_or(false);
            if !loaded {
                bail_kind!(
                    NotFound,
                    "module `{}` depends on `{}`, which is not loaded",
                    name,
                    dep.name()
                );
            }
        }
        graph.insert(name.clone(), deps);
    }
    Ok(graph)
}

/// Order `graph` so that every module follows its dependencies.
fn topological_order(graph: &BTreeMap<String, BTreeSet<String>>) -> Result<Vec<String>, Error> {
    #[derive(PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit(
        node: &str,
        graph: &BTreeMap<String, BTreeSet<String>>,
        marks: &mut HashMap<String, Mark>,
        path: &mut Vec<String>,
        order: &mut Vec<String>,
    ) -> Result<(), Error> {
        match marks.get(node) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                let start = path.iter().position(|n| n == node).unwrap_or(0);
                let mut cycle = path[start..].to_vec();
                cycle.push(node.to_owned());
                bail_kind!(CyclicDependency, "{}", cycle.join(" -> "));
            }
            None => {}
        }
        marks.insert(node.to_owned(), Mark::Visiting);
        path.push(node.to_owned());
        if let Some(deps) = graph.get(node) {
            for dep in deps {
                visit(dep, graph, marks, path, order)?;
            }
        }
        path.pop();
        marks.insert(node.to_owned(), Mark::Done);
        order.push(node.to_owned());
        Ok(())
    }

    let mut marks = HashMap::new();
    let mut path = vec![];
    let mut order = Vec::with_capacity(graph.len());
    for node in graph.keys() {
        visit(node, graph, &mut marks, &mut path, &mut order)?;
    }
    Ok(order)
}

/// Find an export among the modules already constructed by this `finish`.
fn staged_symbol(staged: &[ModuleInstance], import: &SymbolId) -> Option<(SymbolId, ModuleInfo, AnyArc)> {
    staged.iter().find_map(|instance| {
        instance
            .exported_values()
            .into_iter()
            .find(|(id, _)| {
                id.name == import.name
                    && id.namespace == import.namespace
                    && id.version.compatible_with(&import.version)
            })
            .map(|(id, value)| (id, instance.module_info().clone(), value))
    })
}

/// Create one instance and run its constructor and dynamic export constructors.
fn construct(
    ctx: &Context,
    candidate: &Candidate,
    staged: &[ModuleInstance],
    view: &LoadingSetView,
) -> Result<ModuleInstance, Error> {
    let export = &candidate.export;
    let module_dir = candidate.library.directory();

    let mut imports = vec![];
    let mut static_dependencies: Vec<ModuleInfo> = vec![];
    for import in export.symbol_imports() {
        let found = staged_symbol(staged, import).or_else(|| {
            let registry = ctx.registry();
            registry
                .compatible_symbol(&import.name, &import.namespace, &import.version)
                .and_then(|s| {
                    registry
                        .module(&s.owner)
                        .map(|owner| (s.id.clone(), owner.clone(), s.value.clone()))
                })
        });
        let (id, owner, value) = match found {
            Some(found) => found,
            None => bail_kind!(
                NotFound,
                "import {} of module `{}` disappeared during loading",
                import,
                candidate.name
            ),
        };
        if !static_dependencies.iter().any(|d| d.ptr_eq(&owner)) {
            static_dependencies.push(owner.clone());
        }
        imports.push(ImportedSymbol::new(id, owner, value));
    }
    for dep in export.dependencies() {
        if !static_dependencies.iter().any(|d| d.ptr_eq(dep)) {
            static_dependencies.push(dep.clone());
        }
    }

    let info = ModuleInfo::new(
        ModuleMetadata {
            name: candidate.name.clone(),
            description: export.description().map(str::to_owned),
            author: export.author().map(str::to_owned),
            license: export.license().map(str::to_owned),
            module_path: module_dir.map(|d| d.to_path_buf()),
        },
        ModuleKind::Regular,
    );
    let instance = ModuleInstance::create(InstanceParts {
        info,
        context: ctx.clone(),
        parameters: ParameterTable::from_decls(export.parameters()),
        resources: export
            .resources()
            .iter()
            .map(|r| resolve_resource_path(module_dir, r))
            .collect(),
        imports,
        static_dependencies,
        static_namespaces: export.namespace_imports().to_vec(),
        export: Some(export.clone()),
        library: Some(candidate.library.clone()),
    })?;

    if let Some(constructor) = export.constructor() {
        match constructor(&instance, view) {
            Ok(data) => instance.set_data(data),
            Err(source) => {
                instance.teardown();
                return Err(Error::ConstructionFailed {
                    module: candidate.name.clone(),
                    source,
                });
            }
        }
    }
    for symbol in export.static_exports() {
        instance.push_export(ExportedSymbol {
            id: symbol.id.clone(),
            value: symbol.value.clone(),
            dynamic: None,
        });
    }
    for (idx, symbol) in export.dynamic_exports().iter().enumerate() {
        match (symbol.construct)(&instance) {
            Ok(value) => instance.push_export(ExportedSymbol {
                id: symbol.id.clone(),
                value,
                dynamic: Some(idx),
            }),
            Err(source) => {
                instance.teardown();
                return Err(Error::ConstructionFailed {
                    module: candidate.name.clone(),
                    source: source.context(format!("dynamic export {}", symbol.id)),
                });
            }
        }
    }
    tracing::debug!(module = candidate.name.as_str(), "module constructed");
    Ok(instance)
}

/// Make every staged module visible in the registry at once.
fn publish(ctx: &Context, staged: &[ModuleInstance]) -> Result<(), Error> {
    let mut registry = ctx.registry_mut();
    for instance in staged {
        keel_ensure!(
            registry.module(instance.name()).is_none(),
            "module `{}` was published concurrently",
            instance.name()
        );
        for (id, _) in instance.exported_values() {
            keel_ensure!(
                registry.symbol(&id.name, &id.namespace).is_none(),
                "symbol {} was published concurrently",
                id
            );
        }
    }
    for instance in staged {
        registry.insert(instance.module_info().clone(), instance.exported_values())?;
        tracing::info!(module = instance.name(), "module loaded");
    }
    Ok(())
}

//! Live module instances.
//!
//! An instance is what a module's constructor, exports and callbacks see of themselves: its
//! parameters, resources, imports, and the dependency and namespace edges it holds. Every edge
//! is either *static*, fixed by the export descriptor for the instance's whole lifetime, or
//! *dynamic*, added and removed at runtime.

use crate::context::{lock_recover, Context};
use crate::error::Error;
use crate::export::{AnyArc, ModuleExport};
use crate::info::{ModuleInfo, ModuleKind, ModuleMetadata, ModuleState};
use crate::library::ModuleLibrary;
use crate::parameter::ParameterTable;
use keel_module::{ParameterAccess, ParameterValue, SymbolId, Version, GLOBAL_NAMESPACE};
use std::any::Any;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// How an instance depends on a module or namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyKind {
    None,
    Static,
    Dynamic,
}

/// A symbol resolved for an instance when it was constructed.
#[derive(Clone)]
pub struct ImportedSymbol {
    id: SymbolId,
    owner: ModuleInfo,
    value: AnyArc,
}

impl ImportedSymbol {
    /// The exporter's identity of the symbol, which may be newer than the one imported.
    pub fn id(&self) -> &SymbolId {
        &self.id
    }

    pub fn owner(&self) -> &ModuleInfo {
        &self.owner
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }
}

impl fmt::Debug for ImportedSymbol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ImportedSymbol")
            .field("id", &self.id)
            .field("owner", &self.owner.name())
            .finish()
    }
}

pub(crate) struct ExportedSymbol {
    pub id: SymbolId,
    pub value: AnyArc,
    /// Index of the dynamic export that built the value.
    pub dynamic: Option<usize>,
}

struct Edge {
    info: ModuleInfo,
    kind: DependencyKind,
    loans: Arc<AtomicUsize>,
}

impl Edge {
    fn new(info: ModuleInfo, kind: DependencyKind) -> Edge {
        Edge {
            info,
            kind,
            loans: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn lend(&self) -> EdgeLoan {
        self.loans.fetch_add(1, Ordering::SeqCst);
        EdgeLoan {
            loans: self.loans.clone(),
        }
    }
}

/// Keeps a dynamic dependency edge from being removed while a symbol borrowed through it lives.
struct EdgeLoan {
    loans: Arc<AtomicUsize>,
}

impl Drop for EdgeLoan {
    fn drop(&mut self) {
        self.loans.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A symbol loaded through [`ModuleInstance::load_symbol`].
///
/// While it lives, the dependency edge it was loaded through can not be removed, so the
/// exporting module stays loaded.
pub struct Symbol<'a, T> {
    id: SymbolId,
    value: Arc<T>,
    _loan: EdgeLoan,
    _instance: PhantomData<&'a ModuleInstance>,
}

impl<'a, T> Symbol<'a, T> {
    pub fn id(&self) -> &SymbolId {
        &self.id
    }
}

impl<'a, T> Deref for Symbol<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<'a, T: fmt::Debug> fmt::Debug for Symbol<'a, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Symbol")
            .field("id", &self.id)
            .field("value", &self.value)
            .finish()
    }
}

pub(crate) struct InstanceInner {
    info: ModuleInfo,
    context: Context,
    parameters: ParameterTable,
    resources: Vec<PathBuf>,
    imports: Mutex<Vec<ImportedSymbol>>,
    exports: Mutex<Vec<ExportedSymbol>>,
    data: Mutex<Option<AnyArc>>,
    dependencies: Mutex<BTreeMap<String, Edge>>,
    namespaces: Mutex<BTreeMap<String, DependencyKind>>,
    started: AtomicBool,
    export: Option<Arc<ModuleExport>>,
    // Declared last: the library must stay mapped until everything above is dropped.
    library: Option<Arc<ModuleLibrary>>,
}

/// Everything needed to create an instance, before its constructor runs.
pub(crate) struct InstanceParts {
    pub info: ModuleInfo,
    pub context: Context,
    pub parameters: ParameterTable,
    pub resources: Vec<PathBuf>,
    pub imports: Vec<ImportedSymbol>,
    pub static_dependencies: Vec<ModuleInfo>,
    pub static_namespaces: Vec<String>,
    pub export: Option<Arc<ModuleExport>>,
    pub library: Option<Arc<ModuleLibrary>>,
}

impl ImportedSymbol {
    pub(crate) fn new(id: SymbolId, owner: ModuleInfo, value: AnyArc) -> ImportedSymbol {
        ImportedSymbol { id, owner, value }
    }
}

/// A handle to a live module instance.
#[derive(Clone)]
pub struct ModuleInstance {
    inner: Arc<InstanceInner>,
}

impl fmt::Debug for ModuleInstance {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ModuleInstance")
            .field("name", &self.name())
            .field("imports", &*lock_recover(&self.inner.imports))
            .finish()
    }
}

impl ModuleInstance {
    /// Create an instance and its static edges, and attach it to its info.
    pub(crate) fn create(parts: InstanceParts) -> Result<ModuleInstance, Error> {
        let mut dependencies: BTreeMap<String, Edge> = BTreeMap::new();
        for dep in parts.static_dependencies {
            if let Err(e) = dep.add_dependent() {
                for edge in dependencies.values() {
                    edge.info.remove_dependent();
                }
                return Err(e);
            }
            dependencies.insert(
                dep.name().to_owned(),
                Edge::new(dep, DependencyKind::Static),
            );
        }
        let namespaces = parts
            .static_namespaces
            .into_iter()
            .map(|ns| (ns, DependencyKind::Static))
            .collect();
        let instance = ModuleInstance {
            inner: Arc::new(InstanceInner {
                info: parts.info,
                context: parts.context,
                parameters: parts.parameters,
                resources: parts.resources,
                imports: Mutex::new(parts.imports),
                exports: Mutex::new(vec![]),
                data: Mutex::new(None),
                dependencies: Mutex::new(dependencies),
                namespaces: Mutex::new(namespaces),
                started: AtomicBool::new(false),
                export: parts.export,
                library: parts.library,
            }),
        };
        instance.inner.info.set_instance(instance.clone());
        Ok(instance)
    }

    pub fn name(&self) -> &str {
        self.inner.info.name()
    }

    pub fn module_info(&self) -> &ModuleInfo {
        &self.inner.info
    }

    pub fn context(&self) -> &Context {
        &self.inner.context
    }

    pub fn parameters(&self) -> &ParameterTable {
        &self.inner.parameters
    }

    /// Declared resource paths, resolved against the module's directory.
    pub fn resources(&self) -> &[PathBuf] {
        &self.inner.resources
    }

    /// Symbols resolved for this instance. Empty once the instance is destroyed.
    pub fn imports(&self) -> Vec<ImportedSymbol> {
        lock_recover(&self.inner.imports).clone()
    }

    pub fn exports(&self) -> Vec<SymbolId> {
        lock_recover(&self.inner.exports)
            .iter()
            .map(|e| e.id.clone())
            .collect()
    }

    /// The value returned by the module constructor.
    pub fn data(&self) -> Option<AnyArc> {
        lock_recover(&self.inner.data).clone()
    }

    pub fn data_as<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.data().and_then(|d| d.downcast::<T>().ok())
    }

    pub(crate) fn set_data(&self, data: AnyArc) {
        *lock_recover(&self.inner.data) = Some(data);
    }

    pub(crate) fn push_export(&self, export: ExportedSymbol) {
        lock_recover(&self.inner.exports).push(export);
    }

    pub(crate) fn exported_values(&self) -> Vec<(SymbolId, AnyArc)> {
        lock_recover(&self.inner.exports)
            .iter()
            .map(|e| (e.id.clone(), e.value.clone()))
            .collect()
    }

    pub(crate) fn library(&self) -> Option<&Arc<ModuleLibrary>> {
        self.inner.library.as_ref()
    }

    pub fn ptr_eq(&self, other: &ModuleInstance) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Modules this instance depends on, with the kind of each edge.
    pub fn dependencies(&self) -> Vec<(ModuleInfo, DependencyKind)> {
        lock_recover(&self.inner.dependencies)
            .values()
            .map(|e| (e.info.clone(), e.kind))
            .collect()
    }

    /// Include `namespace` dynamically, allowing symbols from it to be loaded.
    pub fn include_namespace(&self, namespace: &str) -> Result<(), Error> {
        if namespace == GLOBAL_NAMESPACE {
            bail_kind!(InvalidArgument, "the global namespace is always included");
        }
        let mut namespaces = lock_recover(&self.inner.namespaces);
        self.ensure_loaded()?;
        if namespaces.contains_key(namespace) {
            bail_kind!(
                AlreadyExists,
                "module `{}` already includes namespace `{}`",
                self.name(),
                namespace
            );
        }
        if !self.inner.context.namespace_exists(namespace) {
            bail_kind!(NotFound, "namespace `{}` does not exist", namespace);
        }
        namespaces.insert(namespace.to_owned(), DependencyKind::Dynamic);
        tracing::debug!(
            module = self.name(),
            namespace = namespace,
            "namespace included"
        );
        Ok(())
    }

    /// Remove a dynamic namespace inclusion.
    pub fn exclude_namespace(&self, namespace: &str) -> Result<(), Error> {
        let mut namespaces = lock_recover(&self.inner.namespaces);
        match namespaces.get(namespace) {
            None => bail_kind!(
                NotFound,
                "module `{}` does not include namespace `{}`",
                self.name(),
                namespace
            ),
            Some(DependencyKind::Static) => bail_kind!(
                PermissionDenied,
                "namespace `{}` is a static import of module `{}`",
                namespace,
                self.name()
            ),
            Some(_) => {
                namespaces.remove(namespace);
            }
        }
        Ok(())
    }

    pub fn has_namespace_dependency(&self, namespace: &str) -> DependencyKind {
        lock_recover(&self.inner.namespaces)
            .get(namespace)
            .copied()
            .unwrap_or(DependencyKind::None)
    }

    /// Add a dynamic dependency edge to a loaded module.
    pub fn acquire_dependency(&self, info: &ModuleInfo) -> Result<(), Error> {
        if info.kind() == ModuleKind::Pseudo {
            bail_kind!(
                InvalidArgument,
                "pseudo module `{}` can not be depended on",
                info.name()
            );
        }
        if info.ptr_eq(&self.inner.info) {
            bail_kind!(CyclicDependency, "module `{}` depends on itself", self.name());
        }
        let _graph = self.inner.context.lock_graph();
        self.ensure_loaded()?;
        if lock_recover(&self.inner.dependencies).contains_key(info.name()) {
            bail_kind!(
                AlreadyExists,
                "module `{}` already depends on `{}`",
                self.name(),
                info.name()
            );
        }
        if let Some(path) = dependency_path(info, &self.inner.info) {
            bail_kind!(
                CyclicDependency,
                "{} -> {}",
                self.name(),
                path.join(" -> ")
            );
        }
        info.add_dependent()?;
        lock_recover(&self.inner.dependencies).insert(
            info.name().to_owned(),
            Edge::new(info.clone(), DependencyKind::Dynamic),
        );
        tracing::debug!(
            module = self.name(),
            dependency = info.name(),
            "dependency acquired"
        );
        Ok(())
    }

    /// New edges may only be added while the module is loaded, since teardown releases them once.
    fn ensure_loaded(&self) -> Result<(), Error> {
        match self.inner.info.state() {
            ModuleState::Loaded => Ok(()),
            state => Err(Error::NotFound(format!(
                "module `{}` is {:?}",
                self.name(),
                state
            ))),
        }
    }

    /// Remove a dynamic dependency edge.
    pub fn remove_dependency(&self, info: &ModuleInfo) -> Result<(), Error> {
        let _graph = self.inner.context.lock_graph();
        let mut dependencies = lock_recover(&self.inner.dependencies);
        match dependencies.get(info.name()) {
            Some(edge) if edge.info.ptr_eq(info) => {
                if edge.kind == DependencyKind::Static {
                    bail_kind!(
                        PermissionDenied,
                        "dependency of `{}` on `{}` is static",
                        self.name(),
                        info.name()
                    );
                }
                let loans = edge.loans.load(Ordering::SeqCst);
                if loans > 0 {
                    bail_kind!(
                        Busy,
                        "{} symbols loaded from `{}` are still in use",
                        loans,
                        info.name()
                    );
                }
            }
            _ => bail_kind!(
                NotFound,
                "module `{}` does not depend on `{}`",
                self.name(),
                info.name()
            ),
        }
        if let Some(edge) = dependencies.remove(info.name()) {
            edge.info.remove_dependent();
        }
        tracing::debug!(
            module = self.name(),
            dependency = info.name(),
            "dependency removed"
        );
        Ok(())
    }

    pub fn has_dependency(&self, info: &ModuleInfo) -> DependencyKind {
        match lock_recover(&self.inner.dependencies).get(info.name()) {
            Some(edge) if edge.info.ptr_eq(info) => edge.kind,
            _ => DependencyKind::None,
        }
    }

    /// Load a symbol exported by a module this instance depends on.
    ///
    /// Symbols outside the global namespace also require the namespace to be included.
    pub fn load_symbol<T: Any + Send + Sync>(
        &self,
        name: &str,
        namespace: &str,
        version: &Version,
    ) -> Result<Symbol<'_, T>, Error> {
        let (id, owner, value) = self.find_symbol(name, namespace, version)?;
        let loan = match lock_recover(&self.inner.dependencies).get(owner.name()) {
            Some(edge) if edge.info.ptr_eq(&owner) => edge.lend(),
            _ => bail_kind!(
                NotFound,
                "module `{}` does not depend on `{}`, which exports {}",
                self.name(),
                owner.name(),
                id
            ),
        };
        if !id.is_global() && self.has_namespace_dependency(namespace) == DependencyKind::None {
            bail_kind!(
                PermissionDenied,
                "module `{}` does not include namespace `{}`",
                self.name(),
                namespace
            );
        }
        let value = match value.downcast::<T>() {
            Ok(value) => value,
            Err(_) => bail_kind!(
                InvalidArgument,
                "symbol {} is not a `{}`",
                id,
                std::any::type_name::<T>()
            ),
        };
        Ok(Symbol {
            id,
            value,
            _loan: loan,
            _instance: PhantomData,
        })
    }

    fn find_symbol(
        &self,
        name: &str,
        namespace: &str,
        version: &Version,
    ) -> Result<(SymbolId, ModuleInfo, AnyArc), Error> {
        let import = lock_recover(&self.inner.imports)
            .iter()
            .find(|i| {
                i.id.name == name
                    && i.id.namespace == namespace
                    && i.id.version.compatible_with(version)
            })
            .map(|i| (i.id.clone(), i.owner.clone(), i.value.clone()));
        if let Some(import) = import {
            return Ok(import);
        }
        let registry = self.inner.context.registry();
        let found = registry
            .compatible_symbol(name, namespace, version)
            .and_then(|s| registry.module(&s.owner).map(|owner| (s, owner)));
        match found {
            Some((symbol, owner)) => Ok((symbol.id.clone(), owner.clone(), symbol.value.clone())),
            None => Err(Error::NotFound(format!(
                "no loaded module exports `{}::{}` compatible with {}",
                namespace, name, version
            ))),
        }
    }

    /// Read a parameter of `module`, which may be this instance, a dependency, or any other
    /// loaded module. The caller class follows from that relation.
    pub fn read_parameter(&self, module: &str, parameter: &str) -> Result<ParameterValue, Error> {
        let (target, caller) = self.parameter_target(module)?;
        target.parameters().read(module, parameter, caller)
    }

    pub fn write_parameter<V: Into<ParameterValue>>(
        &self,
        module: &str,
        parameter: &str,
        value: V,
    ) -> Result<(), Error> {
        let (target, caller) = self.parameter_target(module)?;
        target
            .parameters()
            .write(module, parameter, caller, value.into())
    }

    fn parameter_target(&self, module: &str) -> Result<(ModuleInstance, ParameterAccess), Error> {
        if module == self.name() {
            return Ok((self.clone(), ParameterAccess::Private));
        }
        let (info, caller) = match lock_recover(&self.inner.dependencies).get(module) {
            Some(edge) => (edge.info.clone(), ParameterAccess::Dependency),
            None => (
                self.inner.context.find_by_name(module)?,
                ParameterAccess::Public,
            ),
        };
        match info.instance() {
            Some(target) => Ok((target, caller)),
            None => Err(Error::NotFound(format!("module `{}` is not loaded", module))),
        }
    }

    /// Run the start event, once.
    pub(crate) fn start(&self) -> anyhow::Result<()> {
        if let Some(start) = self.inner.export.as_ref().and_then(|e| e.start_event()) {
            start(self)?;
        }
        self.inner.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Destroy the instance: stop event, dynamic exports in reverse, module data, edges.
    ///
    /// The caller has already withdrawn the module from the registry, or never published it.
    pub(crate) fn teardown(&self) {
        let info = &self.inner.info;
        info.mark_unloading();
        let export = self.inner.export.as_ref();

        if self.inner.started.swap(false, Ordering::SeqCst) {
            if let Some(stop) = export.and_then(|e| e.stop_event()) {
                stop(self);
            }
        }

        let exports = std::mem::take(&mut *lock_recover(&self.inner.exports));
        for symbol in exports.into_iter().rev() {
            let destroy = symbol
                .dynamic
                .and_then(|idx| export.and_then(|e| e.dynamic_exports().get(idx)));
            if let Some(dynamic) = destroy {
                (dynamic.destroy)(symbol.value);
            }
        }

        let data = lock_recover(&self.inner.data).take();
        if let Some(data) = data {
            match export.and_then(|e| e.destructor()) {
                Some(destructor) => destructor(self, data),
                None => drop(data),
            }
        }

        // surviving handles must not keep exporters' values shared
        drop(std::mem::take(&mut *lock_recover(&self.inner.imports)));
        {
            let _graph = self.inner.context.lock_graph();
            let dependencies = std::mem::take(&mut *lock_recover(&self.inner.dependencies));
            for edge in dependencies.values() {
                edge.info.remove_dependent();
            }
            lock_recover(&self.inner.namespaces).clear();
        }

        info.take_instance();
        info.mark_freed();
        tracing::debug!(module = self.name(), "instance destroyed");
    }
}

/// A path of dependency edges leading from `from` to `to`, if one exists.
fn dependency_path(from: &ModuleInfo, to: &ModuleInfo) -> Option<Vec<String>> {
    let mut visited = HashSet::new();
    let mut stack = vec![(from.clone(), vec![from.name().to_owned()])];
    while let Some((node, path)) = stack.pop() {
        if node.ptr_eq(to) {
            return Some(path);
        }
        if !visited.insert(node.name().to_owned()) {
            continue;
        }
        let instance = match node.instance() {
            Some(instance) => instance,
            None => continue,
        };
        for (dep, _) in instance.dependencies() {
            let mut next = path.clone();
            next.push(dep.name().to_owned());
            stack.push((dep, next));
        }
    }
    None
}

/// A host-side instance with no exports, used to hold dependencies from outside any module.
///
/// It is not registered in the context. Dropping it releases its edges and, if the context is
/// configured to prune on release, unloads modules nothing references any more.
pub struct PseudoInstance {
    instance: ModuleInstance,
}

impl PseudoInstance {
    pub fn new(ctx: &Context) -> Result<PseudoInstance, Error> {
        let name = format!("__pseudo_{}", ctx.next_pseudo_id());
        let info = ModuleInfo::new(
            ModuleMetadata {
                name,
                description: None,
                author: None,
                license: None,
                module_path: None,
            },
            ModuleKind::Pseudo,
        );
        let instance = ModuleInstance::create(InstanceParts {
            info,
            context: ctx.clone(),
            parameters: ParameterTable::default(),
            resources: vec![],
            imports: vec![],
            static_dependencies: vec![],
            static_namespaces: vec![],
            export: None,
            library: None,
        })?;
        tracing::debug!(module = instance.name(), "pseudo instance created");
        Ok(PseudoInstance { instance })
    }
}

impl Deref for PseudoInstance {
    type Target = ModuleInstance;

    fn deref(&self) -> &ModuleInstance {
        &self.instance
    }
}

impl fmt::Debug for PseudoInstance {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("PseudoInstance")
            .field(&self.instance.name())
            .finish()
    }
}

impl Drop for PseudoInstance {
    fn drop(&mut self) {
        self.instance.teardown();
        let ctx = self.instance.context();
        if ctx.config().prune_on_release {
            if let Err(e) = ctx.prune_instances() {
                tracing::debug!(
                    module = self.instance.name(),
                    "prune after pseudo release skipped: {}",
                    e
                );
            }
        }
    }
}

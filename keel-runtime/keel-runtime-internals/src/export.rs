//! Declarative module descriptors.
//!
//! A [`ModuleExport`] states everything the runtime needs to know to load a module: its
//! identity, parameters, resources, imports, exports, and lifecycle callbacks. Descriptors are
//! assembled with an [`ExportBuilder`] and checked once, in [`ExportBuilder::build`].

use crate::error::Error;
use crate::info::ModuleInfo;
use crate::instance::ModuleInstance;
use crate::loading_set::LoadingSetView;
use crate::parameter::ParameterDecl;
use keel_module::{validate_resource_path, SymbolId, Version, GLOBAL_NAMESPACE};
use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// A type-erased, shareable value: module data or an exported symbol.
pub type AnyArc = Arc<dyn Any + Send + Sync>;

type ConstructorFn =
    Box<dyn Fn(&ModuleInstance, &LoadingSetView) -> anyhow::Result<AnyArc> + Send + Sync>;
type DestructorFn = Box<dyn Fn(&ModuleInstance, AnyArc) + Send + Sync>;
type StartFn = Box<dyn Fn(&ModuleInstance) -> anyhow::Result<()> + Send + Sync>;
type StopFn = Box<dyn Fn(&ModuleInstance) + Send + Sync>;

pub(crate) struct StaticExport {
    pub id: SymbolId,
    pub value: AnyArc,
}

pub(crate) struct DynamicExport {
    pub id: SymbolId,
    pub construct: Box<dyn Fn(&ModuleInstance) -> anyhow::Result<AnyArc> + Send + Sync>,
    pub destroy: Box<dyn Fn(AnyArc) + Send + Sync>,
}

/// Optional behaviour attached to a descriptor.
pub enum Modifier {
    /// A static dependency on a module that is already loaded.
    Dependency(ModuleInfo),
    /// Runs after the whole loading set was constructed. An error aborts the set.
    StartEvent(StartFn),
    /// Runs before the module is destroyed, if its start event ran.
    StopEvent(StopFn),
}

impl fmt::Debug for Modifier {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Modifier::Dependency(info) => f.debug_tuple("Dependency").field(info).finish(),
            Modifier::StartEvent(_) => write!(f, "StartEvent"),
            Modifier::StopEvent(_) => write!(f, "StopEvent"),
        }
    }
}

/// The immutable description of one loadable module.
pub struct ModuleExport {
    name: String,
    description: Option<String>,
    author: Option<String>,
    license: Option<String>,
    parameters: Vec<(String, ParameterDecl)>,
    resources: Vec<String>,
    namespace_imports: Vec<String>,
    symbol_imports: Vec<SymbolId>,
    static_exports: Vec<StaticExport>,
    dynamic_exports: Vec<DynamicExport>,
    modifiers: Vec<Modifier>,
    constructor: Option<ConstructorFn>,
    destructor: Option<DestructorFn>,
}

impl fmt::Debug for ModuleExport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ModuleExport")
            .field("name", &self.name)
            .field("symbol_imports", &self.symbol_imports)
            .field("namespace_imports", &self.namespace_imports)
            .field("symbol_exports", &self.symbol_exports().collect::<Vec<_>>())
            .finish()
    }
}

impl ModuleExport {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn author(&self) -> Option<&str> {
        self.author.as_deref()
    }

    pub fn license(&self) -> Option<&str> {
        self.license.as_deref()
    }

    pub fn parameters(&self) -> impl Iterator<Item = (&String, &ParameterDecl)> {
        self.parameters.iter().map(|(n, d)| (n, d))
    }

    pub fn resources(&self) -> &[String] {
        &self.resources
    }

    pub fn namespace_imports(&self) -> &[String] {
        &self.namespace_imports
    }

    pub fn symbol_imports(&self) -> &[SymbolId] {
        &self.symbol_imports
    }

    /// Static exports followed by dynamic exports.
    pub fn symbol_exports(&self) -> impl Iterator<Item = &SymbolId> {
        self.static_exports
            .iter()
            .map(|s| &s.id)
            .chain(self.dynamic_exports.iter().map(|s| &s.id))
    }

    /// Modules named by `Dependency` modifiers.
    pub fn dependencies(&self) -> impl Iterator<Item = &ModuleInfo> {
        self.modifiers.iter().filter_map(|m| match m {
            Modifier::Dependency(info) => Some(info),
            _ => None,
        })
    }

    pub(crate) fn static_exports(&self) -> &[StaticExport] {
        &self.static_exports
    }

    pub(crate) fn dynamic_exports(&self) -> &[DynamicExport] {
        &self.dynamic_exports
    }

    pub(crate) fn constructor(&self) -> Option<&ConstructorFn> {
        self.constructor.as_ref()
    }

    pub(crate) fn destructor(&self) -> Option<&DestructorFn> {
        self.destructor.as_ref()
    }

    pub(crate) fn start_event(&self) -> Option<&StartFn> {
        self.modifiers.iter().find_map(|m| match m {
            Modifier::StartEvent(f) => Some(f),
            _ => None,
        })
    }

    pub(crate) fn stop_event(&self) -> Option<&StopFn> {
        self.modifiers.iter().find_map(|m| match m {
            Modifier::StopEvent(f) => Some(f),
            _ => None,
        })
    }
}

/// A builder for [`ModuleExport`]s.
pub struct ExportBuilder {
    export: ModuleExport,
}

impl ExportBuilder {
    pub fn new<S: Into<String>>(name: S) -> Self {
        ExportBuilder {
            export: ModuleExport {
                name: name.into(),
                description: None,
                author: None,
                license: None,
                parameters: vec![],
                resources: vec![],
                namespace_imports: vec![],
                symbol_imports: vec![],
                static_exports: vec![],
                dynamic_exports: vec![],
                modifiers: vec![],
                constructor: None,
                destructor: None,
            },
        }
    }

    pub fn with_description<S: Into<String>>(mut self, description: S) -> Self {
        self.export.description = Some(description.into());
        self
    }

    pub fn with_author<S: Into<String>>(mut self, author: S) -> Self {
        self.export.author = Some(author.into());
        self
    }

    pub fn with_license<S: Into<String>>(mut self, license: S) -> Self {
        self.export.license = Some(license.into());
        self
    }

    pub fn with_parameter<S: Into<String>>(mut self, name: S, decl: ParameterDecl) -> Self {
        self.export.parameters.push((name.into(), decl));
        self
    }

    /// Declare a resource path relative to the module's directory.
    pub fn with_resource<S: Into<String>>(mut self, path: S) -> Self {
        self.export.resources.push(path.into());
        self
    }

    /// Statically include `namespace`; the inclusion can not be removed while loaded.
    pub fn with_namespace_import<S: Into<String>>(mut self, namespace: S) -> Self {
        self.export.namespace_imports.push(namespace.into());
        self
    }

    pub fn with_symbol_import(mut self, name: &str, namespace: &str, version: Version) -> Self {
        self.export
            .symbol_imports
            .push(SymbolId::new(name, namespace, version));
        self
    }

    /// Export a value that exists independently of any instance.
    pub fn with_static_export<T: Any + Send + Sync>(
        mut self,
        name: &str,
        namespace: &str,
        version: Version,
        value: T,
    ) -> Self {
        self.export.static_exports.push(StaticExport {
            id: SymbolId::new(name, namespace, version),
            value: Arc::new(value),
        });
        self
    }

    /// Export a value built by `construct` after the module constructor ran, and handed back to
    /// `destroy` when the module is torn down.
    pub fn with_dynamic_export<T, C, D>(
        mut self,
        name: &str,
        namespace: &str,
        version: Version,
        construct: C,
        destroy: D,
    ) -> Self
    where
        T: Any + Send + Sync,
        C: Fn(&ModuleInstance) -> anyhow::Result<T> + Send + Sync + 'static,
        D: Fn(T) + Send + Sync + 'static,
    {
        let id = SymbolId::new(name, namespace, version);
        let label = id.to_string();
        self.export.dynamic_exports.push(DynamicExport {
            id,
            construct: Box::new(move |instance| Ok(Arc::new(construct(instance)?) as AnyArc)),
            destroy: Box::new(move |value: AnyArc| match value.downcast::<T>() {
                Ok(value) => match Arc::try_unwrap(value) {
                    Ok(value) => destroy(value),
                    Err(_) => tracing::error!(
                        symbol = label.as_str(),
                        "dynamic export still referenced at destruction, destructor skipped"
                    ),
                },
                Err(_) => tracing::error!(
                    symbol = label.as_str(),
                    "dynamic export changed type, destructor skipped"
                ),
            }),
        });
        self
    }

    pub fn with_dependency(mut self, info: &ModuleInfo) -> Self {
        self.export.modifiers.push(Modifier::Dependency(info.clone()));
        self
    }

    pub fn with_start_event<F>(mut self, f: F) -> Self
    where
        F: Fn(&ModuleInstance) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.export.modifiers.push(Modifier::StartEvent(Box::new(f)));
        self
    }

    pub fn with_stop_event<F>(mut self, f: F) -> Self
    where
        F: Fn(&ModuleInstance) + Send + Sync + 'static,
    {
        self.export.modifiers.push(Modifier::StopEvent(Box::new(f)));
        self
    }

    /// Construct the module's private data. The loading set is visible read-only.
    pub fn with_constructor<T, F>(mut self, f: F) -> Self
    where
        T: Any + Send + Sync,
        F: Fn(&ModuleInstance, &LoadingSetView) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.export.constructor = Some(Box::new(move |instance, set| {
            Ok(Arc::new(f(instance, set)?) as AnyArc)
        }));
        self
    }

    /// Receive the module's private data back when it is destroyed.
    pub fn with_destructor<T, F>(mut self, f: F) -> Self
    where
        T: Any + Send + Sync,
        F: Fn(&ModuleInstance, Arc<T>) + Send + Sync + 'static,
    {
        self.export.destructor = Some(Box::new(move |instance, data: AnyArc| {
            match data.downcast::<T>() {
                Ok(data) => f(instance, data),
                Err(_) => tracing::error!(
                    module = instance.name(),
                    "module data changed type, destructor skipped"
                ),
            }
        }));
        self
    }

    /// Check the descriptor and freeze it.
    pub fn build(self) -> Result<ModuleExport, Error> {
        let export = self.export;
        let name = &export.name;
        if name.is_empty() {
            bail_kind!(InvalidArgument, "module name must not be empty");
        }

        let mut params = HashSet::new();
        for (param, _) in export.parameters.iter() {
            if param.is_empty() || !params.insert(param.as_str()) {
                bail_kind!(
                    InvalidArgument,
                    "module `{}` declares parameter `{}` more than once or without a name",
                    name,
                    param
                );
            }
        }

        for resource in export.resources.iter() {
            validate_resource_path(resource)?;
        }

        let mut namespaces = HashSet::new();
        for ns in export.namespace_imports.iter() {
            if ns == GLOBAL_NAMESPACE {
                bail_kind!(
                    InvalidArgument,
                    "module `{}` imports the global namespace, which is always included",
                    name
                );
            }
            if !namespaces.insert(ns.as_str()) {
                bail_kind!(
                    InvalidArgument,
                    "module `{}` imports namespace `{}` more than once",
                    name,
                    ns
                );
            }
        }

        let mut symbols = HashSet::new();
        let all_symbols = export
            .symbol_imports
            .iter()
            .chain(export.static_exports.iter().map(|s| &s.id))
            .chain(export.dynamic_exports.iter().map(|s| &s.id));
        for id in all_symbols {
            if id.name.is_empty() {
                bail_kind!(InvalidArgument, "module `{}` names an empty symbol", name);
            }
            if !symbols.insert((id.name.as_str(), id.namespace.as_str())) {
                bail_kind!(
                    InvalidArgument,
                    "module `{}` mentions symbol {} more than once",
                    name,
                    id
                );
            }
        }

        let starts = export
            .modifiers
            .iter()
            .filter(|m| matches!(m, Modifier::StartEvent(_)))
            .count();
        let stops = export
            .modifiers
            .iter()
            .filter(|m| matches!(m, Modifier::StopEvent(_)))
            .count();
        if starts > 1 || stops > 1 {
            bail_kind!(
                InvalidArgument,
                "module `{}` declares more than one start or stop event",
                name
            );
        }
        let deps: Vec<&ModuleInfo> = export.dependencies().collect();
        for (i, dep) in deps.iter().enumerate() {
            if deps[..i].iter().any(|d| d.ptr_eq(dep)) {
                bail_kind!(
                    InvalidArgument,
                    "module `{}` depends on `{}` more than once",
                    name,
                    dep.name()
                );
            }
        }

        Ok(export)
    }
}

/// A descriptor builder submitted to the current binary's export collection.
pub struct ExportRegistration {
    build: fn() -> Result<ModuleExport, Error>,
}

impl ExportRegistration {
    pub const fn new(build: fn() -> Result<ModuleExport, Error>) -> Self {
        ExportRegistration { build }
    }
}

inventory::collect!(ExportRegistration);

/// Build every descriptor registered in this binary with [`keel_module!`](../macro.keel_module.html).
pub fn collect_registered() -> Result<Vec<ModuleExport>, Error> {
    inventory::iter::<ExportRegistration>
        .into_iter()
        .map(|r| (r.build)())
        .collect()
}

/// Register a descriptor builder `fn() -> Result<ModuleExport, Error>` with the binary it is
/// compiled into. The invoking crate must depend on `inventory`.
#[macro_export]
macro_rules! keel_module {
    ( $build:path ) => {
        inventory::submit! {
            $crate::export::ExportRegistration::new($build)
        }
    };
}

/// Expose the registered descriptors of a shared object to `ModuleSource::Path` loading.
#[macro_export]
macro_rules! keel_library {
    () => {
        #[no_mangle]
        pub fn keel_module_exports(
        ) -> Result<Vec<$crate::export::ModuleExport>, $crate::error::Error> {
            $crate::export::collect_registered()
        }
    };
}

//! `keel-runtime` loads modules from the running binary or from shared objects, resolves the
//! symbols they import and export, and keeps them alive for as long as something depends on
//! them.
//!
//! A host creates a [`Context`], appends export descriptors to a [`LoadingSet`], and calls
//! [`LoadingSet::finish`] to construct them. A [`PseudoInstance`] lets the host itself hold
//! dependencies and load symbols:
//!
//! ```no_run
//! use keel_runtime::{Context, LoadingSet, ModuleSource, PseudoInstance, Version};
//!
//! let ctx = Context::new();
//! let mut set = LoadingSet::new(&ctx);
//! set.append_modules(ModuleSource::Current, |_| true).unwrap();
//! set.finish().unwrap();
//!
//! let host = PseudoInstance::new(&ctx).unwrap();
//! let a = ctx.find_by_name("a").unwrap();
//! host.acquire_dependency(&a).unwrap();
//! let answer = host
//!     .load_symbol::<u32>("answer", "", &Version::new(0, 1, 0))
//!     .unwrap();
//! assert_eq!(*answer, 42);
//! ```

#![deny(bare_trait_objects)]

pub mod c_api;

pub use keel_module::{
    ParameterAccess, ParameterType, ParameterValue, SymbolId, Version, GLOBAL_NAMESPACE,
};
pub use keel_runtime_internals::config::{Config, ContextOption};
pub use keel_runtime_internals::context::{Context, ContextBuilder};
pub use keel_runtime_internals::error::{Error, ErrorKind};
pub use keel_runtime_internals::export::{
    self, collect_registered, AnyArc, ExportBuilder, ExportRegistration, Modifier, ModuleExport,
};
pub use keel_runtime_internals::info::{ModuleInfo, ModuleKind, ModuleState, UnloadLock};
pub use keel_runtime_internals::instance::{
    DependencyKind, ImportedSymbol, ModuleInstance, PseudoInstance, Symbol,
};
pub use keel_runtime_internals::library::{ModuleLibrary, ModuleSource};
pub use keel_runtime_internals::loading_set::{LoadFailure, LoadingSet, LoadingSetView};
pub use keel_runtime_internals::parameter::{ParameterDecl, ParameterInfo, ParameterTable};
pub use keel_runtime_internals::{keel_library, keel_module, RUNTIME_VERSION};

#[cfg(feature = "concurrent_testpoints")]
pub use keel_runtime_internals::lock_testpoints::{LockTestpoints, SyncWaiter, Syncpoint};

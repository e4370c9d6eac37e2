//! Common types for describing keel modules.
//!
//! These types are shared between modules, which use them in their export descriptors, and
//! `keel-runtime`, which resolves and checks them. None of them carry runtime state.

#![deny(bare_trait_objects)]

pub mod error;
mod parameter;
mod resource;
mod symbol;
mod version;

pub use crate::error::Error;
pub use crate::parameter::{ParameterAccess, ParameterType, ParameterValue};
pub use crate::resource::{resolve_resource_path, validate_resource_path};
pub use crate::symbol::{SymbolId, GLOBAL_NAMESPACE};
pub use crate::version::Version;

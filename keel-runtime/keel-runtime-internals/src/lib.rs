//! `keel-runtime-internals` holds the implementation of the keel module runtime: the context
//! and its registry, export descriptors, loading sets, module instances, and the C ABI used to
//! pass contexts between binaries.
//!
//! Most users want the `keel-runtime` crate, which re-exports the public surface of this one.

#![deny(bare_trait_objects)]

#[macro_use]
pub mod error;

pub mod c_api;
pub mod config;
pub mod context;
pub mod export;
pub mod info;
pub mod instance;
pub mod library;
pub mod loading_set;
#[cfg(feature = "concurrent_testpoints")]
pub mod lock_testpoints;
pub mod parameter;
mod registry;

use keel_module::Version;

/// The version of this runtime, as checked against the versions modules and foreign callers
/// require.
pub const RUNTIME_VERSION: Version = keel_module::version!();

//! Module descriptors and helpers for tests that park the runtime at one of its testpoints and
//! race a second operation against it.
//!
//! Descriptors have to be registered with `keel_module!` from the test binary itself, so they
//! are plain builder functions here.

use keel_module::Version;
use keel_runtime::{Context, Error, ErrorKind, ExportBuilder, LoadingSet, ModuleExport, ModuleSource};
use keel_runtime_internals::lock_testpoints::{LockTestpoints, Syncpoint};
use std::thread::{self, JoinHandle};

pub const V1: Version = Version::new(1, 0, 0);

/// `base` exports `base_sym` and nothing else.
pub fn module_base() -> Result<ModuleExport, Error> {
    ExportBuilder::new("base")
        .with_static_export("base_sym", "", V1, 1u64)
        .build()
}

/// `user` imports `base_sym`.
pub fn module_user() -> Result<ModuleExport, Error> {
    ExportBuilder::new("user")
        .with_symbol_import("base_sym", "", V1)
        .build()
}

/// Load the named modules of the running binary in one set.
pub fn load(ctx: &Context, names: &'static [&'static str]) -> Result<(), Error> {
    let mut set = LoadingSet::new(ctx);
    set.append_modules(ModuleSource::Current, |e| names.contains(&e.name()))?;
    set.finish()
}

/// Run [`load`] on another thread.
pub fn load_in_thread(ctx: &Context, names: &'static [&'static str]) -> JoinHandle<Result<(), ErrorKind>> {
    let ctx = ctx.clone();
    thread::spawn(move || load(&ctx, names).map_err(|e| e.kind()))
}

/// Pick a testpoint of `ctx` by name.
pub fn testpoint<'a>(ctx: &'a Context, select: fn(&LockTestpoints) -> &Syncpoint) -> &'a Syncpoint {
    select(ctx.lock_testpoints())
}

use anyhow::format_err;
use keel_runtime::{
    keel_module, Context, Error, ExportBuilder, LoadingSet, ModuleExport, ModuleSource,
    ParameterAccess, ParameterDecl, Version,
};
use lazy_static::lazy_static;
use std::sync::{Mutex, RwLock};

lazy_static! {
    static ref EXCLUSIVE_TEST: RwLock<()> = RwLock::default();
    static ref EVENTS: Mutex<Vec<String>> = Mutex::default();
}

/// Run a test non-exclusively with other `test_nonex` tests.
///
/// Tests that only look at their own context can run this way.
#[allow(dead_code)]
pub fn test_nonex<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let lock = EXCLUSIVE_TEST.read().unwrap_or_else(|e| e.into_inner());
    let r = f();
    drop(lock);
    r
}

/// Run a test exclusively, so that no other `test_nonex` or `test_ex` tests will run concurrently.
///
/// This function _must_ wrap any test that inspects the event log.
#[allow(dead_code)]
pub fn test_ex<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let lock = EXCLUSIVE_TEST.write().unwrap_or_else(|e| e.into_inner());
    EVENTS.lock().unwrap().clear();
    let r = f();
    drop(lock);
    r
}

/// Append an entry to the process-wide event log.
pub fn record<S: Into<String>>(event: S) {
    EVENTS.lock().unwrap().push(event.into());
}

#[allow(dead_code)]
pub fn take_events() -> Vec<String> {
    std::mem::take(&mut *EVENTS.lock().unwrap())
}

pub const V0_1: Version = Version::new(0, 1, 0);

/// Append the named modules of this binary to `set`.
#[allow(dead_code)]
pub fn append_named(set: &mut LoadingSet, names: &[&str]) -> Result<(), Error> {
    set.append_modules(ModuleSource::Current, |export| names.contains(&export.name()))
}

/// Load the named modules of this binary into `ctx` in one loading set.
#[allow(dead_code)]
pub fn load_named(ctx: &Context, names: &[&str]) -> Result<(), Error> {
    let mut set = LoadingSet::new(ctx);
    append_named(&mut set, names)?;
    set.finish()
}

/// `a` exports one symbol in the global namespace and one in namespace `a`.
pub fn module_a() -> Result<ModuleExport, Error> {
    ExportBuilder::new("a")
        .with_description("root module")
        .with_author("keel")
        .with_license("MIT")
        .with_static_export("a_export_0", "", V0_1, 5u32)
        .with_static_export("a_export_1", "a", V0_1, 10u32)
        .with_constructor(|_, _| {
            record("construct a");
            Ok(())
        })
        .with_destructor(|_, _: std::sync::Arc<()>| record("destroy a"))
        .build()
}

/// `b` exports a static symbol in namespace `b` and a dynamic one in the global namespace.
pub fn module_b() -> Result<ModuleExport, Error> {
    ExportBuilder::new("b")
        .with_static_export("b_export_0", "b", V0_1, -2i64)
        .with_dynamic_export(
            "b_export_1",
            "",
            Version::new(0, 1, 3),
            |_| {
                record("construct b_export_1");
                Ok(7u64)
            },
            |_| record("destroy b_export_1"),
        )
        .with_constructor(|_, _| {
            record("construct b");
            Ok(())
        })
        .with_destructor(|_, _: std::sync::Arc<()>| record("destroy b"))
        .build()
}

/// Declare one `u32` parameter for every pair of read and write tiers, named `<read>_<write>`
/// with defaults counting up from 0.
pub fn with_tiered_parameters(mut builder: ExportBuilder) -> ExportBuilder {
    let mut default = 0u32;
    for (read_name, read) in TIERS.iter() {
        for (write_name, write) in TIERS.iter() {
            builder = builder.with_parameter(
                format!("{}_{}", read_name, write_name),
                ParameterDecl::new(default)
                    .with_read_access(*read)
                    .with_write_access(*write),
            );
            default += 1;
        }
    }
    builder
}

pub const TIERS: [(&str, ParameterAccess); 3] = [
    ("pub", ParameterAccess::Public),
    ("dep", ParameterAccess::Dependency),
    ("pri", ParameterAccess::Private),
];

/// `c` imports from both `a` and `b`, and carries the tiered parameters.
pub fn module_c() -> Result<ModuleExport, Error> {
    let builder = ExportBuilder::new("c")
        .with_resource("")
        .with_resource("c.bin")
        .with_resource("data/c.txt")
        .with_namespace_import("a")
        .with_namespace_import("b")
        .with_symbol_import("a_export_1", "a", V0_1)
        .with_symbol_import("b_export_0", "b", V0_1)
        .with_symbol_import("b_export_1", "", V0_1);
    with_tiered_parameters(builder)
        .with_constructor(|instance, set| {
            record("construct c");
            record(format!("c resources {:?}", instance.resources()));
            if !set.has_module("a") || !set.has_symbol("b_export_0", "b", &V0_1) {
                return Err(format_err!("imports of c are not visible to its constructor"));
            }
            let a = instance.imports()[0]
                .downcast_ref::<u32>()
                .copied()
                .ok_or_else(|| format_err!("a_export_1 is not a u32"))?;
            let b = instance.imports()[1]
                .downcast_ref::<i64>()
                .copied()
                .ok_or_else(|| format_err!("b_export_0 is not an i64"))?;
            Ok(a as i64 + b)
        })
        .with_destructor(|_, _: std::sync::Arc<i64>| record("destroy c"))
        .with_static_export("c_export_0", "c", V0_1, "from c")
        .build()
}

keel_module!(module_a);
keel_module!(module_b);
keel_module!(module_c);

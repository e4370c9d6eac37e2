//! Modules compiled into a shared object, so that tests can load them through
//! `ModuleSource::Path`.

use keel_module::{ParameterAccess, Version};
use keel_runtime_internals::error::Error;
use keel_runtime_internals::export::{ExportBuilder, ModuleExport};
use keel_runtime_internals::parameter::ParameterDecl;
use keel_runtime_internals::{keel_library, keel_module};

pub const SHARED_VERSION: Version = Version::new(0, 1, 0);

pub const GREETING: &str = "hello from a shared object";

fn shared_base() -> Result<ModuleExport, Error> {
    ExportBuilder::new("shared_base")
        .with_description("provides symbols from a shared object")
        .with_static_export("shared_value", "", SHARED_VERSION, 42u32)
        .with_dynamic_export(
            "shared_greeting",
            "shared",
            SHARED_VERSION,
            |_| Ok(GREETING.to_owned()),
            |greeting: String| drop(greeting),
        )
        .build()
}

fn shared_user() -> Result<ModuleExport, Error> {
    ExportBuilder::new("shared_user")
        .with_symbol_import("shared_value", "", SHARED_VERSION)
        .with_parameter(
            "scale",
            ParameterDecl::new(2u32).with_write_access(ParameterAccess::Private),
        )
        .with_constructor(|instance, _| {
            let value = instance
                .imports()
                .first()
                .and_then(|i| i.downcast_ref::<u32>().copied())
                .unwrap_or_default();
            Ok(u64::from(value) * 2)
        })
        .build()
}

keel_module!(shared_base);
keel_module!(shared_user);
keel_library!();

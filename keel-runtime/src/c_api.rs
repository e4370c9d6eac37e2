use crate::Context;
use keel_runtime_internals::assert_nonnull;
use keel_runtime_internals::RUNTIME_VERSION;
use libc::{c_char, c_int};
use num_traits::FromPrimitive;

pub use keel_runtime_internals::c_api::{
    keel_context, keel_context_handle, keel_error, keel_module_info, keel_param_value,
    keel_version,
};

#[no_mangle]
pub extern "C" fn keel_error_name(e: c_int) -> *const c_char {
    if let Some(e) = keel_error::from_i32(e) {
        use self::keel_error::*;
        match e {
            Ok => "keel_error_ok\0".as_ptr() as _,
            InvalidArgument => "keel_error_invalid_argument\0".as_ptr() as _,
            NotFound => "keel_error_not_found\0".as_ptr() as _,
            AlreadyExists => "keel_error_already_exists\0".as_ptr() as _,
            PermissionDenied => "keel_error_permission_denied\0".as_ptr() as _,
            CyclicDependency => "keel_error_cyclic_dependency\0".as_ptr() as _,
            Busy => "keel_error_busy\0".as_ptr() as _,
            Unsupported => "keel_error_unsupported\0".as_ptr() as _,
            ConstructionFailed => "keel_error_construction_failed\0".as_ptr() as _,
            Internal => "keel_error_internal\0".as_ptr() as _,
        }
    } else {
        "!!! error: unknown keel_error variant\0".as_ptr() as _
    }
}

/// The version of the runtime this library was built as.
#[no_mangle]
pub extern "C" fn keel_runtime_version() -> keel_version {
    RUNTIME_VERSION.into()
}

#[no_mangle]
pub unsafe extern "C" fn keel_context_create(handle_out: *mut keel_context_handle) -> keel_error {
    assert_nonnull!(handle_out);
    *handle_out = Context::new().into_handle();
    keel_error::Ok
}

/// Create a context from a JSON array of option blocks. Unknown option kinds are skipped.
#[no_mangle]
pub unsafe extern "C" fn keel_context_create_with_options(
    options_json: *const c_char,
    handle_out: *mut keel_context_handle,
) -> keel_error {
    assert_nonnull!(options_json);
    assert_nonnull!(handle_out);
    let json = match std::ffi::CStr::from_ptr(options_json).to_str() {
        Ok(json) => json,
        Err(_) => return keel_error::InvalidArgument,
    };
    match Context::builder()
        .with_options_json(json)
        .and_then(|b| b.build())
    {
        Ok(ctx) => {
            *handle_out = ctx.into_handle();
            keel_error::Ok
        }
        Err(e) => e.into(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn keel_context_check_version(
    handle: *const keel_context_handle,
    required: *const keel_version,
) -> keel_error {
    assert_nonnull!(handle);
    assert_nonnull!(required);
    match Context::from_handle(&*handle) {
        Ok(ctx) => ctx.check_version(&(&*required).into()).into(),
        Err(e) => e.into(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn keel_context_release(handle: *const keel_context_handle) {
    if let Some(handle) = handle.as_ref() {
        // a handle that fails its version check holds no reference of ours
        if let Err(e) = Context::release_handle(*handle) {
            tracing::debug!("context handle not released: {}", e);
        }
    }
}

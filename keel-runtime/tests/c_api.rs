use keel_runtime::c_api::*;
use keel_runtime::{Context, ErrorKind, RUNTIME_VERSION};
use std::ffi::{CStr, CString};
use std::mem::MaybeUninit;
use std::os::raw::c_int;

fn error_name(e: keel_error) -> String {
    unsafe { CStr::from_ptr(keel_error_name(e as c_int)) }
        .to_str()
        .unwrap()
        .to_owned()
}

#[test]
fn error_names() {
    assert_eq!(error_name(keel_error::Ok), "keel_error_ok");
    assert_eq!(error_name(keel_error::Busy), "keel_error_busy");
    assert_eq!(
        error_name(keel_error::ConstructionFailed),
        "keel_error_construction_failed"
    );
    let unknown = unsafe { CStr::from_ptr(keel_error_name(-1)) };
    assert!(unknown.to_str().unwrap().contains("unknown"));
}

#[test]
fn create_check_and_release() {
    unsafe {
        let mut handle = MaybeUninit::<keel_context_handle>::uninit();
        assert_eq!(keel_context_create(handle.as_mut_ptr()), keel_error::Ok);
        let handle = handle.assume_init();

        let ctx = Context::from_handle(&handle).unwrap();
        assert_eq!(ctx.ref_count(), 2);
        assert_eq!(ctx.version(), RUNTIME_VERSION);

        let current = keel_runtime_version();
        assert_eq!(keel_context_check_version(&handle, &current), keel_error::Ok);
        let future = keel_version {
            major: current.major + 1,
            ..current
        };
        assert_eq!(
            keel_context_check_version(&handle, &future),
            keel_error::Unsupported
        );

        keel_context_release(&handle);
        assert_eq!(ctx.ref_count(), 1);
    }
}

#[test]
fn releasing_a_bad_handle_is_harmless() {
    let ctx = Context::new();
    unsafe {
        keel_context_release(std::ptr::null());
        let null = keel_context_handle {
            data: std::ptr::null(),
            vtable: std::ptr::null(),
        };
        keel_context_release(&null);

        // a handle whose data is fine but whose vtable is missing
        let handle = ctx.acquire().into_handle();
        let broken = keel_context_handle {
            vtable: std::ptr::null(),
            ..handle
        };
        keel_context_release(&broken);
        assert_eq!(ctx.ref_count(), 2);
        keel_context_release(&handle);
    }
    assert_eq!(ctx.ref_count(), 1);
}

#[test]
fn handles_share_the_context() {
    let ctx = Context::new();
    let handle = ctx.acquire().into_handle();
    assert_eq!(ctx.ref_count(), 2);
    unsafe {
        let again = Context::from_handle(&handle).unwrap();
        assert!(again.ptr_eq(&ctx));
        drop(again);
        Context::release_handle(handle).unwrap();
    }
    assert_eq!(ctx.ref_count(), 1);
}

#[test]
fn create_with_options() {
    let json = CString::new(
        r#"[
            {"type": "max_modules", "count": 3},
            {"type": "some_future_option", "level": 9},
            {"type": "prune_on_release", "enabled": true}
        ]"#,
    )
    .unwrap();
    unsafe {
        let mut handle = MaybeUninit::<keel_context_handle>::uninit();
        assert_eq!(
            keel_context_create_with_options(json.as_ptr(), handle.as_mut_ptr()),
            keel_error::Ok
        );
        let handle = handle.assume_init();
        let ctx = Context::from_handle(&handle).unwrap();
        assert_eq!(ctx.config().max_modules, 3);
        assert!(ctx.config().prune_on_release);
        drop(ctx);
        keel_context_release(&handle);
    }
}

#[test]
fn invalid_options_are_rejected() {
    let cases = [
        r#"{"type": "max_modules"}"#,
        r#"[{"type": "max_modules", "count": 0}]"#,
        r#"[{"type": "module_root", "path": "relative/modules"}]"#,
    ];
    for json in cases.iter() {
        let json = CString::new(*json).unwrap();
        let mut handle = MaybeUninit::<keel_context_handle>::uninit();
        let err =
            unsafe { keel_context_create_with_options(json.as_ptr(), handle.as_mut_ptr()) };
        assert_eq!(err, keel_error::InvalidArgument, "{:?}", json);
    }
    assert_eq!(
        keel_error::from(ErrorKind::CyclicDependency),
        keel_error::CyclicDependency
    );
}

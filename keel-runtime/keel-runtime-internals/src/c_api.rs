#![allow(non_camel_case_types)]

use crate::context::{Context, ContextInner};
use crate::error::{Error, ErrorKind};
use crate::info::{InfoInner, ModuleInfo};
use crate::RUNTIME_VERSION;
use keel_module::{ParameterType, ParameterValue, Version};
use libc::c_char;
use num_derive::FromPrimitive;
use std::convert::TryFrom;
use std::ffi::CStr;

#[macro_export]
macro_rules! assert_nonnull {
    ( $name:ident ) => {
        if $name.is_null() {
            return keel_error::InvalidArgument;
        }
    };
}

/// Borrow the context behind a raw pointer for the duration of `$body`.
macro_rules! with_context {
    ( $name:ident, $body:block ) => {{
        assert_nonnull!($name);
        let $name = Context::clone_from_raw($name as *const ContextInner);
        $body
    }};
}

macro_rules! with_module_info {
    ( $name:ident, $body:block ) => {{
        assert_nonnull!($name);
        let $name = ModuleInfo::clone_from_raw($name as *const InfoInner);
        $body
    }};
}

#[repr(C)]
pub struct keel_context {
    _unused: [u8; 0],
}

#[repr(C)]
pub struct keel_module_info {
    _unused: [u8; 0],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
pub enum keel_error {
    Ok,
    InvalidArgument,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    CyclicDependency,
    Busy,
    Unsupported,
    ConstructionFailed,
    Internal,
}

impl From<ErrorKind> for keel_error {
    fn from(kind: ErrorKind) -> keel_error {
        match kind {
            ErrorKind::InvalidArgument => keel_error::InvalidArgument,
            ErrorKind::NotFound => keel_error::NotFound,
            ErrorKind::AlreadyExists => keel_error::AlreadyExists,
            ErrorKind::PermissionDenied => keel_error::PermissionDenied,
            ErrorKind::CyclicDependency => keel_error::CyclicDependency,
            ErrorKind::Busy => keel_error::Busy,
            ErrorKind::Unsupported => keel_error::Unsupported,
            ErrorKind::ConstructionFailed => keel_error::ConstructionFailed,
            ErrorKind::Internal => keel_error::Internal,
        }
    }
}

impl From<Error> for keel_error {
    fn from(e: Error) -> keel_error {
        e.kind().into()
    }
}

impl From<Result<(), Error>> for keel_error {
    fn from(res: Result<(), Error>) -> keel_error {
        match res {
            Ok(()) => keel_error::Ok,
            Err(e) => {
                tracing::debug!("C API call failed: {}", e);
                e.into()
            }
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct keel_version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub build: u64,
}

impl From<Version> for keel_version {
    fn from(v: Version) -> keel_version {
        keel_version {
            major: v.major,
            minor: v.minor,
            patch: v.patch,
            build: v.build,
        }
    }
}

impl From<&keel_version> for Version {
    fn from(v: &keel_version) -> Version {
        Version::new_with_build(v.major, v.minor, v.patch, v.build)
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union keel_param_value_inner {
    pub as_u64: u64,
    pub as_i64: i64,
}

/// A parameter value. `ty` holds a `ParameterType` discriminant.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct keel_param_value {
    pub ty: i32,
    pub value: keel_param_value_inner,
}

impl From<ParameterValue> for keel_param_value {
    fn from(v: ParameterValue) -> keel_param_value {
        let value = match v {
            ParameterValue::U8(x) => keel_param_value_inner { as_u64: x as u64 },
            ParameterValue::U16(x) => keel_param_value_inner { as_u64: x as u64 },
            ParameterValue::U32(x) => keel_param_value_inner { as_u64: x as u64 },
            ParameterValue::U64(x) => keel_param_value_inner { as_u64: x },
            ParameterValue::I8(x) => keel_param_value_inner { as_i64: x as i64 },
            ParameterValue::I16(x) => keel_param_value_inner { as_i64: x as i64 },
            ParameterValue::I32(x) => keel_param_value_inner { as_i64: x as i64 },
            ParameterValue::I64(x) => keel_param_value_inner { as_i64: x },
        };
        keel_param_value {
            ty: v.ty() as i32,
            value,
        }
    }
}

impl TryFrom<&keel_param_value> for ParameterValue {
    type Error = Error;

    fn try_from(v: &keel_param_value) -> Result<ParameterValue, Error> {
        let ty = ParameterType::from_tag(v.ty)?;
        let (u, i) = unsafe { (v.value.as_u64, v.value.as_i64) };
        Ok(match ty {
            ParameterType::U8 => ParameterValue::U8(narrow(u, ty)?),
            ParameterType::U16 => ParameterValue::U16(narrow(u, ty)?),
            ParameterType::U32 => ParameterValue::U32(narrow(u, ty)?),
            ParameterType::U64 => ParameterValue::U64(u),
            ParameterType::I8 => ParameterValue::I8(narrow(i, ty)?),
            ParameterType::I16 => ParameterValue::I16(narrow(i, ty)?),
            ParameterType::I32 => ParameterValue::I32(narrow(i, ty)?),
            ParameterType::I64 => ParameterValue::I64(i),
        })
    }
}

fn narrow<T, W>(payload: W, ty: ParameterType) -> Result<T, Error>
where
    T: TryFrom<W>,
    W: Copy + std::fmt::Display,
{
    T::try_from(payload).map_err(|_| {
        Error::InvalidArgument(format!("{} does not fit in a {:?} parameter", payload, ty))
    })
}

/// The first member of every context vtable version.
#[repr(C)]
pub struct keel_vtable_header {
    pub check_version:
        unsafe extern "C" fn(ctx: *const keel_context, required: *const keel_version) -> keel_error,
}

#[repr(C)]
pub struct keel_core_vtable_v0 {
    pub acquire: unsafe extern "C" fn(ctx: *const keel_context),
    pub release: unsafe extern "C" fn(ctx: *const keel_context),
}

#[repr(C)]
pub struct keel_module_vtable_v0 {
    pub find_by_name: unsafe extern "C" fn(
        ctx: *const keel_context,
        name: *const c_char,
        info_out: *mut *const keel_module_info,
    ) -> keel_error,
    pub namespace_exists: unsafe extern "C" fn(
        ctx: *const keel_context,
        namespace: *const c_char,
        exists_out: *mut bool,
    ) -> keel_error,
    pub prune_instances: unsafe extern "C" fn(ctx: *const keel_context) -> keel_error,
    pub read_parameter: unsafe extern "C" fn(
        ctx: *const keel_context,
        module: *const c_char,
        parameter: *const c_char,
        value_out: *mut keel_param_value,
    ) -> keel_error,
    pub write_parameter: unsafe extern "C" fn(
        ctx: *const keel_context,
        module: *const c_char,
        parameter: *const c_char,
        value: *const keel_param_value,
    ) -> keel_error,
    pub info_release: unsafe extern "C" fn(info: *const keel_module_info),
    pub info_is_loaded: unsafe extern "C" fn(info: *const keel_module_info) -> bool,
    pub info_unload:
        unsafe extern "C" fn(ctx: *const keel_context, info: *const keel_module_info) -> keel_error,
}

/// Version 0 of the context vtable. Later versions only append members.
#[repr(C)]
pub struct keel_context_vtable_v0 {
    pub header: keel_vtable_header,
    pub core: keel_core_vtable_v0,
    pub module: keel_module_vtable_v0,
}

/// A context as passed between binaries.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct keel_context_handle {
    pub data: *const keel_context,
    pub vtable: *const keel_context_vtable_v0,
}

pub static KEEL_CONTEXT_VTABLE_V0: keel_context_vtable_v0 = keel_context_vtable_v0 {
    header: keel_vtable_header {
        check_version: ctx_check_version,
    },
    core: keel_core_vtable_v0 {
        acquire: ctx_acquire,
        release: ctx_release,
    },
    module: keel_module_vtable_v0 {
        find_by_name: ctx_find_by_name,
        namespace_exists: ctx_namespace_exists,
        prune_instances: ctx_prune_instances,
        read_parameter: ctx_read_parameter,
        write_parameter: ctx_write_parameter,
        info_release: module_info_release,
        info_is_loaded: module_info_is_loaded,
        info_unload: module_info_unload,
    },
};

impl Context {
    /// Hand one reference to this context across the C boundary.
    pub fn into_handle(self) -> keel_context_handle {
        keel_context_handle {
            data: self.into_raw() as *const keel_context,
            vtable: &KEEL_CONTEXT_VTABLE_V0,
        }
    }

    /// Obtain a new reference to the context behind `handle`.
    ///
    /// The handle's version check runs before anything else is read through it.
    ///
    /// # Safety
    ///
    /// `handle` must have been produced by [`into_handle`](#method.into_handle) in this
    /// binary, and still hold its reference.
    pub unsafe fn from_handle(handle: &keel_context_handle) -> Result<Context, Error> {
        if handle.data.is_null() || handle.vtable.is_null() {
            bail_kind!(InvalidArgument, "null context handle");
        }
        let header = &*(handle.vtable as *const keel_vtable_header);
        let required: keel_version = RUNTIME_VERSION.into();
        match (header.check_version)(handle.data, &required) {
            keel_error::Ok => {}
            keel_error::Unsupported => bail_kind!(
                Unsupported,
                "context handle does not support runtime version {}",
                RUNTIME_VERSION
            ),
            other => {
                return Err(keel_format_err!(
                    "context version check failed: {:?}",
                    other
                ))
            }
        }
        Ok(Context::clone_from_raw(handle.data as *const ContextInner))
    }

    /// Give back the reference held by `handle`.
    ///
    /// # Safety
    ///
    /// Same as [`from_handle`](#method.from_handle); the handle must not be used afterwards.
    pub unsafe fn release_handle(handle: keel_context_handle) -> Result<(), Error> {
        let ctx = Context::from_handle(&handle)?;
        drop(ctx);
        drop(Context::from_raw(handle.data as *const ContextInner));
        Ok(())
    }
}

unsafe fn c_str<'a>(s: *const c_char) -> Result<&'a str, Error> {
    if s.is_null() {
        bail_kind!(InvalidArgument, "null string argument");
    }
    CStr::from_ptr(s)
        .to_str()
        .map_err(|e| Error::InvalidArgument(format!("string argument is not UTF-8: {}", e)))
}

unsafe extern "C" fn ctx_check_version(
    ctx: *const keel_context,
    required: *const keel_version,
) -> keel_error {
    assert_nonnull!(required);
    with_context!(ctx, {
        let required: Version = (&*required).into();
        ctx.check_version(&required).into()
    })
}

unsafe extern "C" fn ctx_acquire(ctx: *const keel_context) {
    if !ctx.is_null() {
        let ctx = Context::clone_from_raw(ctx as *const ContextInner);
        let _ = ctx.acquire().into_raw();
    }
}

unsafe extern "C" fn ctx_release(ctx: *const keel_context) {
    if !ctx.is_null() {
        drop(Context::from_raw(ctx as *const ContextInner));
    }
}

unsafe extern "C" fn ctx_find_by_name(
    ctx: *const keel_context,
    name: *const c_char,
    info_out: *mut *const keel_module_info,
) -> keel_error {
    assert_nonnull!(info_out);
    with_context!(ctx, {
        let found = c_str(name).and_then(|name| ctx.find_by_name(name));
        match found {
            Ok(info) => {
                *info_out = info.into_raw() as *const keel_module_info;
                keel_error::Ok
            }
            Err(e) => e.into(),
        }
    })
}

unsafe extern "C" fn ctx_namespace_exists(
    ctx: *const keel_context,
    namespace: *const c_char,
    exists_out: *mut bool,
) -> keel_error {
    assert_nonnull!(exists_out);
    with_context!(ctx, {
        match c_str(namespace) {
            Ok(ns) => {
                *exists_out = ctx.namespace_exists(ns);
                keel_error::Ok
            }
            Err(e) => e.into(),
        }
    })
}

unsafe extern "C" fn ctx_prune_instances(ctx: *const keel_context) -> keel_error {
    with_context!(ctx, { ctx.prune_instances().into() })
}

unsafe extern "C" fn ctx_read_parameter(
    ctx: *const keel_context,
    module: *const c_char,
    parameter: *const c_char,
    value_out: *mut keel_param_value,
) -> keel_error {
    assert_nonnull!(value_out);
    with_context!(ctx, {
        let read = c_str(module)
            .and_then(|m| c_str(parameter).map(|p| (m, p)))
            .and_then(|(m, p)| ctx.read_parameter(m, p));
        match read {
            Ok(value) => {
                *value_out = value.into();
                keel_error::Ok
            }
            Err(e) => e.into(),
        }
    })
}

unsafe extern "C" fn ctx_write_parameter(
    ctx: *const keel_context,
    module: *const c_char,
    parameter: *const c_char,
    value: *const keel_param_value,
) -> keel_error {
    assert_nonnull!(value);
    with_context!(ctx, {
        let res = ParameterValue::try_from(&*value).and_then(|value| {
            let module = c_str(module)?;
            let parameter = c_str(parameter)?;
            ctx.write_parameter(module, parameter, value)
        });
        res.into()
    })
}

unsafe extern "C" fn module_info_release(info: *const keel_module_info) {
    if !info.is_null() {
        drop(ModuleInfo::from_raw(info as *const InfoInner));
    }
}

unsafe extern "C" fn module_info_is_loaded(info: *const keel_module_info) -> bool {
    if info.is_null() {
        return false;
    }
    ModuleInfo::clone_from_raw(info as *const InfoInner).is_loaded()
}

unsafe extern "C" fn module_info_unload(
    ctx: *const keel_context,
    info: *const keel_module_info,
) -> keel_error {
    with_context!(ctx, {
        with_module_info!(info, { info.unload(&ctx).into() })
    })
}

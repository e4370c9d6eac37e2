//! Module parameters: declarations carried by export descriptors, and the per-instance table
//! that enforces their access tiers.

use crate::context::lock_recover;
use crate::error::Error;
use keel_module::{ParameterAccess, ParameterType, ParameterValue};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

pub type ParameterSetter =
    Arc<dyn Fn(ParameterValue) -> anyhow::Result<ParameterValue> + Send + Sync>;
pub type ParameterGetter = Arc<dyn Fn(ParameterValue) -> ParameterValue + Send + Sync>;

/// Declaration of one module parameter.
///
/// The default value fixes the parameter's type. Reads and writes default to the `Public` tier.
#[derive(Clone)]
pub struct ParameterDecl {
    default: ParameterValue,
    read: ParameterAccess,
    write: ParameterAccess,
    setter: Option<ParameterSetter>,
    getter: Option<ParameterGetter>,
}

impl fmt::Debug for ParameterDecl {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ParameterDecl")
            .field("default", &self.default)
            .field("read", &self.read)
            .field("write", &self.write)
            .finish()
    }
}

impl ParameterDecl {
    pub fn new<V: Into<ParameterValue>>(default: V) -> Self {
        ParameterDecl {
            default: default.into(),
            read: ParameterAccess::Public,
            write: ParameterAccess::Public,
            setter: None,
            getter: None,
        }
    }

    pub fn with_read_access(mut self, read: ParameterAccess) -> Self {
        self.read = read;
        self
    }

    pub fn with_write_access(mut self, write: ParameterAccess) -> Self {
        self.write = write;
        self
    }

    /// Route writes through `setter`, which may reject or transform the incoming value.
    pub fn with_setter<F>(mut self, setter: F) -> Self
    where
        F: Fn(ParameterValue) -> anyhow::Result<ParameterValue> + Send + Sync + 'static,
    {
        self.setter = Some(Arc::new(setter));
        self
    }

    /// Route reads through `getter`.
    pub fn with_getter<F>(mut self, getter: F) -> Self
    where
        F: Fn(ParameterValue) -> ParameterValue + Send + Sync + 'static,
    {
        self.getter = Some(Arc::new(getter));
        self
    }

    pub fn ty(&self) -> ParameterType {
        self.default.ty()
    }

    pub fn default_value(&self) -> ParameterValue {
        self.default
    }

    pub fn read_access(&self) -> ParameterAccess {
        self.read
    }

    pub fn write_access(&self) -> ParameterAccess {
        self.write
    }
}

/// Type and access tiers of a parameter, as returned by queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterInfo {
    pub ty: ParameterType,
    pub read: ParameterAccess,
    pub write: ParameterAccess,
}

struct Parameter {
    decl: ParameterDecl,
    value: Mutex<ParameterValue>,
}

/// The live parameters of one module instance.
#[derive(Default)]
pub struct ParameterTable {
    params: BTreeMap<String, Parameter>,
}

impl ParameterTable {
    pub(crate) fn from_decls<'a, I>(decls: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a ParameterDecl)>,
    {
        let params = decls
            .into_iter()
            .map(|(name, decl)| {
                (
                    name.clone(),
                    Parameter {
                        decl: decl.clone(),
                        value: Mutex::new(decl.default_value()),
                    },
                )
            })
            .collect();
        ParameterTable { params }
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.params.keys().map(|k| k.as_str())
    }

    pub fn info(&self, name: &str) -> Option<ParameterInfo> {
        self.params.get(name).map(|p| ParameterInfo {
            ty: p.decl.ty(),
            read: p.decl.read,
            write: p.decl.write,
        })
    }

    fn get(&self, owner: &str, name: &str) -> Result<&Parameter, Error> {
        self.params.get(name).ok_or_else(|| {
            Error::NotFound(format!("module `{}` has no parameter `{}`", owner, name))
        })
    }

    /// Read `name` on behalf of a caller of class `caller`.
    pub fn read(
        &self,
        owner: &str,
        name: &str,
        caller: ParameterAccess,
    ) -> Result<ParameterValue, Error> {
        let param = self.get(owner, name)?;
        if !param.decl.read.permits(caller) {
            tracing::debug!(
                module = owner,
                parameter = name,
                "read denied for {:?} caller",
                caller
            );
            bail_kind!(
                PermissionDenied,
                "{:?} caller may not read parameter `{}` of module `{}`",
                caller,
                name,
                owner
            );
        }
        let value = *lock_recover(&param.value);
        Ok(match &param.decl.getter {
            Some(getter) => getter(value),
            None => value,
        })
    }

    /// Write `name` on behalf of a caller of class `caller`.
    pub fn write(
        &self,
        owner: &str,
        name: &str,
        caller: ParameterAccess,
        value: ParameterValue,
    ) -> Result<(), Error> {
        let param = self.get(owner, name)?;
        if !param.decl.write.permits(caller) {
            tracing::debug!(
                module = owner,
                parameter = name,
                "write denied for {:?} caller",
                caller
            );
            bail_kind!(
                PermissionDenied,
                "{:?} caller may not write parameter `{}` of module `{}`",
                caller,
                name,
                owner
            );
        }
        value.expect_type(param.decl.ty())?;
        let value = match &param.decl.setter {
            Some(setter) => {
                let v = setter(value).map_err(|e| {
                    Error::InvalidArgument(format!(
                        "setter of parameter `{}` rejected {}: {}",
                        name, value, e
                    ))
                })?;
                v.expect_type(param.decl.ty())?;
                v
            }
            None => value,
        };
        *lock_recover(&param.value) = value;
        Ok(())
    }
}

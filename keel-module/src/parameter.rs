use crate::error::Error;
use num_derive::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::fmt;

/// The declared type of a module parameter.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive, Serialize, Deserialize)]
pub enum ParameterType {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
}

impl ParameterType {
    pub fn from_tag(tag: i32) -> Result<ParameterType, Error> {
        num_traits::FromPrimitive::from_i32(tag).ok_or(Error::UnknownParameterType(tag))
    }
}

/// A parameter value.
///
/// The runtime routes these between callers and a parameter's setter and getter without looking
/// at the payload beyond its tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParameterValue {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
}

impl ParameterValue {
    pub fn ty(&self) -> ParameterType {
        match self {
            ParameterValue::U8(_) => ParameterType::U8,
            ParameterValue::U16(_) => ParameterType::U16,
            ParameterValue::U32(_) => ParameterType::U32,
            ParameterValue::U64(_) => ParameterType::U64,
            ParameterValue::I8(_) => ParameterType::I8,
            ParameterValue::I16(_) => ParameterType::I16,
            ParameterValue::I32(_) => ParameterType::I32,
            ParameterValue::I64(_) => ParameterType::I64,
        }
    }

    /// Fail unless this value carries the `expected` tag.
    pub fn expect_type(&self, expected: ParameterType) -> Result<(), Error> {
        if self.ty() == expected {
            Ok(())
        } else {
            Err(Error::ParameterTypeMismatch {
                expected,
                got: self.ty(),
            })
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ParameterValue::U8(v) => write!(f, "{}u8", v),
            ParameterValue::U16(v) => write!(f, "{}u16", v),
            ParameterValue::U32(v) => write!(f, "{}u32", v),
            ParameterValue::U64(v) => write!(f, "{}u64", v),
            ParameterValue::I8(v) => write!(f, "{}i8", v),
            ParameterValue::I16(v) => write!(f, "{}i16", v),
            ParameterValue::I32(v) => write!(f, "{}i32", v),
            ParameterValue::I64(v) => write!(f, "{}i64", v),
        }
    }
}

macro_rules! impl_from_scalars {
    ( { $( $ctor:ident : $ty:ty ),* } ) => {
        $(
            impl From<$ty> for ParameterValue {
                fn from(x: $ty) -> ParameterValue {
                    ParameterValue::$ctor(x)
                }
            }

            impl TryFrom<ParameterValue> for $ty {
                type Error = Error;

                fn try_from(v: ParameterValue) -> Result<$ty, Error> {
                    match v {
                        ParameterValue::$ctor(x) => Ok(x),
                        other => Err(Error::ParameterTypeMismatch {
                            expected: ParameterType::$ctor,
                            got: other.ty(),
                        }),
                    }
                }
            }
        )*
    };
}

impl_from_scalars!({
    U8: u8,
    U16: u16,
    U32: u32,
    U64: u64,
    I8: i8,
    I16: i16,
    I32: i32,
    I64: i64
});

/// Access tier of one direction (read or write) of a parameter.
///
/// Tiers are ordered from least to most restrictive. The same enum doubles as the class of a
/// caller: the host is `Public`, a module holding a dependency on the owner is `Dependency`, and
/// the owner itself is `Private`.
#[repr(i32)]
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    FromPrimitive,
    ToPrimitive,
    Serialize,
    Deserialize,
)]
pub enum ParameterAccess {
    Public,
    Dependency,
    Private,
}

impl ParameterAccess {
    pub fn permits(self, caller: ParameterAccess) -> bool {
        caller >= self
    }
}

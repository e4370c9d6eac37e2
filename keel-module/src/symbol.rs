use crate::Version;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Namespace of symbols that every module may read without including it first.
pub const GLOBAL_NAMESPACE: &str = "";

/// Identity of an exported or imported symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SymbolId {
    pub name: String,
    pub namespace: String,
    pub version: Version,
}

impl SymbolId {
    pub fn new<N: Into<String>, S: Into<String>>(name: N, namespace: S, version: Version) -> Self {
        SymbolId {
            name: name.into(),
            namespace: namespace.into(),
            version,
        }
    }

    pub fn is_global(&self) -> bool {
        self.namespace == GLOBAL_NAMESPACE
    }

    /// The `(name, namespace)` pair under which at most one symbol may be exported per context.
    pub fn key(&self) -> (String, String) {
        (self.name.clone(), self.namespace.clone())
    }
}

impl fmt::Display for SymbolId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_global() {
            write!(f, "{}@{}", self.name, self.version)
        } else {
            write!(f, "{}::{}@{}", self.namespace, self.name, self.version)
        }
    }
}

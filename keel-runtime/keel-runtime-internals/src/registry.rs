use crate::error::Error;
use crate::export::AnyArc;
use crate::info::ModuleInfo;
use keel_module::{SymbolId, Version};
use std::collections::{BTreeMap, HashMap};

pub(crate) struct RegisteredSymbol {
    pub id: SymbolId,
    pub owner: String,
    pub value: AnyArc,
}

/// Name-indexed modules and symbols of a context.
///
/// A `(name, namespace)` pair has at most one exporter. Namespaces exist for as long as some
/// module exports into them.
#[derive(Default)]
pub(crate) struct Registry {
    modules: BTreeMap<String, ModuleInfo>,
    symbols: HashMap<(String, String), RegisteredSymbol>,
    namespaces: HashMap<String, usize>,
}

impl Registry {
    pub fn module(&self, name: &str) -> Option<&ModuleInfo> {
        self.modules.get(name)
    }

    pub fn modules(&self) -> impl Iterator<Item = &ModuleInfo> {
        self.modules.values()
    }

    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    pub fn symbol(&self, name: &str, namespace: &str) -> Option<&RegisteredSymbol> {
        self.symbols.get(&(name.to_owned(), namespace.to_owned()))
    }

    /// The exporter of `(name, namespace)`, if its version satisfies `required`.
    pub fn compatible_symbol(
        &self,
        name: &str,
        namespace: &str,
        required: &Version,
    ) -> Option<&RegisteredSymbol> {
        self.symbol(name, namespace)
            .filter(|s| s.id.version.compatible_with(required))
    }

    pub fn namespace_exists(&self, namespace: &str) -> bool {
        self.namespaces.contains_key(namespace)
    }

    /// Publish a module and its exports. Nothing is published if any name is taken.
    pub fn insert(&mut self, info: ModuleInfo, exports: Vec<(SymbolId, AnyArc)>) -> Result<(), Error> {
        if self.modules.contains_key(info.name()) {
            bail_kind!(AlreadyExists, "module `{}` is already loaded", info.name());
        }
        for (id, _) in exports.iter() {
            if let Some(existing) = self.symbol(&id.name, &id.namespace) {
                bail_kind!(
                    AlreadyExists,
                    "symbol {} is already exported by module `{}`",
                    id,
                    existing.owner
                );
            }
        }
        let owner = info.name().to_owned();
        for (id, value) in exports {
            if !id.is_global() {
                *self.namespaces.entry(id.namespace.clone()).or_insert(0) += 1;
            }
            self.symbols.insert(
                id.key(),
                RegisteredSymbol {
                    id,
                    owner: owner.clone(),
                    value,
                },
            );
        }
        self.modules.insert(owner, info);
        Ok(())
    }

    /// Withdraw a module and every symbol it exports.
    pub fn remove(&mut self, name: &str) -> Option<ModuleInfo> {
        let info = self.modules.remove(name)?;
        let owned: Vec<(String, String)> = self
            .symbols
            .iter()
            .filter(|(_, s)| s.owner == name)
            .map(|(k, _)| k.clone())
            .collect();
        for key in owned {
            if let Some(symbol) = self.symbols.remove(&key) {
                if !symbol.id.is_global() {
                    let ns = &symbol.id.namespace;
                    let gone = match self.namespaces.get_mut(ns) {
                        Some(count) => {
                            *count -= 1;
                            *count == 0
                        }
                        None => false,
                    };
                    if gone {
                        self.namespaces.remove(ns);
                    }
                }
            }
        }
        Some(info)
    }
}

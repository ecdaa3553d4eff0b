//! Name → operator lookup built from the loaded modules.

use std::collections::HashMap;

use crate::error::RegistryError;

use super::module::{ComponentFactory, Module};
use super::operator::Operator;

struct Entry<T> {
    module: String,
    item: T,
}

/// Functions and factories of every loaded module.
///
/// Names are global across modules; a clash is a load error rather than a
/// silent override.
#[derive(Default)]
pub(crate) struct Registry {
    functions: HashMap<String, Entry<Operator>>,
    factories: HashMap<String, Entry<ComponentFactory>>,
}

impl Registry {
    /// Merge `modules`, rejecting duplicate function or component-type names.
    pub fn from_modules(modules: Vec<Module>) -> Result<Self, RegistryError> {
        let mut registry = Self::default();
        for module in modules {
            let name = module.name().to_string();
            for (function, op) in module.functions {
                insert_unique(&mut registry.functions, "function", function, &name, op)?;
            }
            for (ty, factory) in module.factories {
                insert_unique(&mut registry.factories, "component type", ty, &name, factory)?;
            }
            log::debug!("[VM] Loaded module {name}");
        }
        Ok(registry)
    }

    pub fn function(&self, name: &str) -> Option<&Operator> {
        self.functions.get(name).map(|e| &e.item)
    }

    pub fn factory(&self, component_type: &str) -> Option<&ComponentFactory> {
        self.factories.get(component_type).map(|e| &e.item)
    }

    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    pub fn factory_count(&self) -> usize {
        self.factories.len()
    }
}

fn insert_unique<T>(
    table: &mut HashMap<String, Entry<T>>,
    kind: &'static str,
    name: String,
    module: &str,
    item: T,
) -> Result<(), RegistryError> {
    if let Some(existing) = table.get(&name) {
        return Err(RegistryError::DuplicateName {
            kind,
            name,
            first: existing.module.clone(),
            second: module.to_string(),
        });
    }
    table.insert(name, Entry { module: module.to_string(), item });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::component::ComponentBuilder;

    fn echo_module(name: &str) -> Module {
        Module::new(name).instant("echo", Ok)
    }

    #[test]
    fn test_merges_distinct_modules() {
        let a = echo_module("a");
        let b = Module::new("b").factory("counter", |_| Ok(ComponentBuilder::new(0u32).build()));
        let registry = Registry::from_modules(vec![a, b]).unwrap();
        assert!(registry.function("echo").is_some());
        assert!(registry.factory("counter").is_some());
        assert!(registry.function("counter").is_none());
        assert_eq!((registry.function_count(), registry.factory_count()), (1, 1));
    }

    #[test]
    fn test_duplicate_function_names_across_modules() {
        let err = Registry::from_modules(vec![echo_module("a"), echo_module("b")]).err().unwrap();
        assert_eq!(
            err,
            RegistryError::DuplicateName {
                kind: "function",
                name: "echo".into(),
                first: "a".into(),
                second: "b".into(),
            }
        );
    }

    #[test]
    fn test_function_and_type_may_share_a_name() {
        let module = Module::new("m")
            .instant("counter", Ok)
            .factory("counter", |_| Ok(ComponentBuilder::new(()).build()));
        assert!(Registry::from_modules(vec![module]).is_ok());
    }
}

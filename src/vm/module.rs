//! Module descriptors: named bundles of functions and component factories.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::error::RuntimeError;
use crate::value::Value;

use super::component::Component;
use super::operator::{Operator, ValueStream};

/// Builds a component from the `args` of a `define_component`.
pub type ComponentFactory = Arc<dyn Fn(Value) -> Result<Component, RuntimeError> + Send + Sync>;

/// A set of functions and component factories loaded into the VM.
///
/// ```ignore
/// let module = Module::new("text")
///     .instant("echo", |args| Ok(args))
///     .factory("counter", |_args| Ok(ComponentBuilder::new(0i64).build()));
/// ```
#[derive(Clone)]
pub struct Module {
    name: String,
    pub(crate) functions: IndexMap<String, Operator>,
    pub(crate) factories: IndexMap<String, ComponentFactory>,
}

impl Module {
    /// Empty module.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), functions: IndexMap::new(), factories: IndexMap::new() }
    }

    /// Module name, used in diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a function. A later registration of the same name replaces the earlier one.
    #[must_use]
    pub fn function(mut self, name: impl Into<String>, operator: Operator) -> Self {
        self.functions.insert(name.into(), operator);
        self
    }

    /// Add an instant function.
    #[must_use]
    pub fn instant<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value) -> Result<Value, RuntimeError> + Send + Sync + 'static,
    {
        self.function(name, Operator::instant(f))
    }

    /// Add a streaming function.
    #[must_use]
    pub fn streaming<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value) -> Result<ValueStream, RuntimeError> + Send + Sync + 'static,
    {
        self.function(name, Operator::streaming(f))
    }

    /// Add a component factory for `component_type`.
    #[must_use]
    pub fn factory<F>(mut self, component_type: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value) -> Result<Component, RuntimeError> + Send + Sync + 'static,
    {
        self.factories.insert(component_type.into(), Arc::new(f));
        self
    }

    /// Function names in registration order.
    pub fn function_names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    /// Component type names in registration order.
    pub fn component_types(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.name)
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .field("factories", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

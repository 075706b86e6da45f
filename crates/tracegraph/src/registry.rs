//! Whitelist of invocables a graph may reference by name.
//!
//! Graph nodes can target plain functions directly. Anything that has to leave the process
//! (see [`wire`](crate::backend::wire)) is identified by the canonical name it was registered
//! under, so only registered functions can be shipped.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;

use crate::value::{Kwargs, NativeFn};

/// Named handle to a registered function.
pub struct FunctionRef<V> {
    name: Arc<str>,
    func: NativeFn<V>,
}

impl<V> FunctionRef<V> {
    pub fn new<F>(name: &str, func: F) -> Self
    where
        F: Fn(&[V], &Kwargs<V>) -> Result<V> + Send + Sync + 'static,
    {
        FunctionRef {
            name: Arc::from(name),
            func: Arc::new(func),
        }
    }

    /// Label given at construction; not necessarily the registered name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn invoke(&self, args: &[V], kwargs: &Kwargs<V>) -> Result<V> {
        (self.func)(args, kwargs)
    }

    /// Two refs are the same function only if they share the underlying closure.
    pub fn same_function(&self, other: &FunctionRef<V>) -> bool {
        Arc::ptr_eq(&self.func, &other.func)
    }
}

impl<V> Clone for FunctionRef<V> {
    fn clone(&self) -> Self {
        FunctionRef {
            name: Arc::clone(&self.name),
            func: Arc::clone(&self.func),
        }
    }
}

impl<V> PartialEq for FunctionRef<V> {
    fn eq(&self, other: &Self) -> bool {
        self.same_function(other)
    }
}

impl<V> fmt::Debug for FunctionRef<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FunctionRef({})", self.name)
    }
}

/// Name-to-function table consulted when building and shipping graphs.
pub struct FunctionRegistry<V> {
    functions: HashMap<String, FunctionRef<V>>,
}

impl<V> FunctionRegistry<V> {
    pub fn new() -> Self {
        FunctionRegistry {
            functions: HashMap::new(),
        }
    }

    /// Registers `func` under `name` and returns the handle graphs should target.
    ///
    /// Re-registering a name replaces the previous entry.
    pub fn register<F>(&mut self, name: &str, func: F) -> FunctionRef<V>
    where
        F: Fn(&[V], &Kwargs<V>) -> Result<V> + Send + Sync + 'static,
    {
        let function = FunctionRef::new(name, func);
        self.functions.insert(name.to_string(), function.clone());
        function
    }

    pub fn resolve(&self, name: &str) -> Option<FunctionRef<V>> {
        self.functions.get(name).cloned()
    }

    /// Canonical name of `function`, if it is whitelisted.
    pub fn canonical_name(&self, function: &FunctionRef<V>) -> Option<&str> {
        self.functions
            .iter()
            .find(|(_, registered)| registered.same_function(function))
            .map(|(name, _)| name.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.keys().cloned().collect();
        names.sort();
        names
    }
}

impl<V> Default for FunctionRegistry<V> {
    fn default() -> Self {
        Self::new()
    }
}

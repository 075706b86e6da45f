use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tracegraph::{Kwargs, Method};

use crate::RefValue;

/// Native implementation of a module's `__call__`.
pub type Forward = Arc<dyn Fn(&RefModule, &[RefValue], &Kwargs<RefValue>) -> Result<RefValue> + Send + Sync>;

/// Container of named members (tensors, submodules, constants) with an optional native
/// forward and any number of traced methods.
pub struct RefModule {
    name: String,
    members: BTreeMap<String, RefValue>,
    forward: Option<Forward>,
    methods: BTreeMap<String, Method<RefValue>>,
}

impl RefModule {
    pub fn builder(name: impl Into<String>) -> RefModuleBuilder {
        RefModuleBuilder {
            module: RefModule {
                name: name.into(),
                members: BTreeMap::new(),
                forward: None,
                methods: BTreeMap::new(),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn member(&self, name: &str) -> Option<&RefValue> {
        self.members.get(name)
    }

    pub fn member_names(&self) -> impl Iterator<Item = &str> {
        self.members.keys().map(String::as_str)
    }

    /// Member `name`, failing with the list of members the module does have.
    pub fn require(&self, name: &str) -> Result<&RefValue> {
        self.member(name).ok_or_else(|| {
            anyhow!(
                "module `{}` has no member `{name}` (members: {})",
                self.name,
                self.members.keys().cloned().collect::<Vec<_>>().join(", ")
            )
        })
    }

    pub fn forward(&self, args: &[RefValue], kwargs: &Kwargs<RefValue>) -> Result<RefValue> {
        let forward = self
            .forward
            .as_ref()
            .ok_or_else(|| anyhow!("module `{}` is not callable", self.name))?;
        forward(self, args, kwargs)
    }

    /// True when `name` resolves to a method rather than a member.
    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains_key(name) || (name == "forward" && self.forward.is_some())
    }

    pub fn traced_method(&self, name: &str) -> Option<Method<RefValue>> {
        self.methods.get(name).cloned()
    }
}

impl fmt::Debug for RefModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefModule")
            .field("name", &self.name)
            .field("members", &self.members.keys().collect::<Vec<_>>())
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}

pub struct RefModuleBuilder {
    module: RefModule,
}

impl RefModuleBuilder {
    pub fn member(mut self, name: impl Into<String>, value: impl Into<RefValue>) -> Self {
        self.module.members.insert(name.into(), value.into());
        self
    }

    pub fn submodule(self, name: impl Into<String>, module: Arc<RefModule>) -> Self {
        self.member(name, RefValue::Module(module))
    }

    pub fn forward<F>(mut self, forward: F) -> Self
    where
        F: Fn(&RefModule, &[RefValue], &Kwargs<RefValue>) -> Result<RefValue> + Send + Sync + 'static,
    {
        self.module.forward = Some(Arc::new(forward));
        self
    }

    /// Adds a method whose body is traced when it is called on a traced root.
    pub fn method(mut self, name: impl Into<String>, method: Method<RefValue>) -> Self {
        self.module.methods.insert(name.into(), method);
        self
    }

    pub fn build(self) -> Arc<RefModule> {
        Arc::new(self.module)
    }
}

/// Method fetched off a module. Only `forward` runs natively; other methods exist to be traced.
#[derive(Clone)]
pub struct RefMethod {
    module: Arc<RefModule>,
    name: String,
}

impl RefMethod {
    pub(crate) fn new(module: Arc<RefModule>, name: impl Into<String>) -> Self {
        RefMethod {
            module,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn module(&self) -> &Arc<RefModule> {
        &self.module
    }

    pub fn call(&self, args: &[RefValue], kwargs: &Kwargs<RefValue>) -> Result<RefValue> {
        if self.name == "forward" {
            return self.module.forward(args, kwargs);
        }
        Err(anyhow!(
            "method `{}.{}` has no native body; call it on a traced root",
            self.module.name(),
            self.name
        ))
    }

    pub(crate) fn same_method(&self, other: &RefMethod) -> bool {
        Arc::ptr_eq(&self.module, &other.module) && self.name == other.name
    }
}

impl fmt::Debug for RefMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RefMethod({}.{})", self.module.name(), self.name)
    }
}

//! Capability seam between the tracer and the value library being proxied.
//!
//! The tracer never computes anything itself. It asks values to perform the handful of
//! operations a [`Proxy`](crate::graph::Proxy) can intercept, once against structural
//! stand-ins while tracing and once against real values while a backend executes.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::TraceError;
use crate::graph::{Arg, Proxy};

/// Keyword arguments keyed by name, iterated in key order.
pub type Kwargs<T> = BTreeMap<String, T>;

/// Plain function over values, as stored in the [`FunctionRegistry`](crate::registry::FunctionRegistry).
pub type NativeFn<V> = Arc<dyn Fn(&[V], &Kwargs<V>) -> Result<V> + Send + Sync>;

/// Method of the traced root that is traced rather than invoked: it receives the root proxy as
/// `self` and records whatever operations its body performs.
pub type Method<V> =
    Arc<dyn Fn(&Proxy<V>, Vec<Arg<V>>, Kwargs<Arg<V>>) -> Result<Proxy<V>, TraceError> + Send + Sync>;

/// Location a value lives on (`"cpu"`, `"cuda:0"`, `"meta"`, ...).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Device(String);

impl Device {
    pub fn new(name: impl Into<String>) -> Self {
        Device(name.into())
    }

    pub fn cpu() -> Self {
        Device::new("cpu")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Arithmetic operators a proxy intercepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

impl BinaryOp {
    /// Symbolic target name recorded on nodes.
    pub fn name(self) -> &'static str {
        match self {
            BinaryOp::Add => "__add__",
            BinaryOp::Sub => "__sub__",
            BinaryOp::Mul => "__mul__",
            BinaryOp::Div => "__truediv__",
            BinaryOp::Pow => "pow",
        }
    }
}

/// Operations the tracer needs from the proxied library.
///
/// Every method is used twice: on structural stand-ins while recording (so shape and type
/// errors surface at trace time) and on real values during execution.
pub trait TracedValue: Clone + fmt::Debug + Send + Sync + 'static {
    /// Location of the value, when it has one.
    fn device(&self) -> Option<Device>;

    /// Copy of the value placed on `device`. Values without a location return a clone.
    fn to_device(&self, device: &Device) -> Result<Self>;

    /// Cheap stand-in that keeps the structure (shapes, members, types) but not the data.
    fn structural(&self) -> Self;

    fn call(&self, args: &[Self], kwargs: &Kwargs<Self>) -> Result<Self>;

    fn get_item(&self, key: &Self) -> Result<Self>;

    fn get_attr(&self, name: &str) -> Result<Self>;

    /// Length of the value, as a value.
    fn length(&self) -> Result<Self>;

    fn binary(&self, op: BinaryOp, rhs: &Self) -> Result<Self>;

    fn to_bool(&self) -> Result<bool>;

    fn to_index(&self) -> Result<i64>;

    /// Containers such as submodules are called through their own `__call__` even when they
    /// hang directly off the traced root.
    fn is_passthrough(&self) -> bool {
        false
    }

    /// Traced body for a method value fetched off the root, if this value is one.
    fn unbound_method(&self) -> Option<Method<Self>> {
        None
    }

    fn list(items: Vec<Self>) -> Self;

    fn dict(entries: Kwargs<Self>) -> Self;

    fn slice(start: Option<Self>, stop: Option<Self>, step: Option<Self>) -> Result<Self>;
}

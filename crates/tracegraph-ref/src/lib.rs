//! Reference value domain for `tracegraph`.
//!
//! [`RefValue`] implements [`tracegraph::TracedValue`] over host tensors, plain Python-like
//! scalars and containers, and [`RefModule`]s with named members. Tensors without data act as
//! structural stand-ins during tracing. [`functions`] holds the builtin whitelist and
//! [`models`] a few deterministic modules.

pub mod functions;
pub mod models;
mod module;
mod tensor;
mod value;

pub use module::{Forward, RefMethod, RefModule, RefModuleBuilder};
pub use tensor::RefTensor;
pub use value::RefValue;

//! Builtin functions graphs may target, registered once per process.
//!
//! Functions are whitelisted under `ref.*` names, so graphs using them can be shipped to a
//! remote executor that uses the same registry.

use std::sync::{Arc, OnceLock};

use anyhow::{anyhow, ensure, Result};
use tracegraph::{FunctionRef, FunctionRegistry, Kwargs};

use crate::{RefTensor, RefValue};

static BUILTINS: OnceLock<Arc<FunctionRegistry<RefValue>>> = OnceLock::new();

/// Shared registry holding every builtin.
pub fn registry() -> Arc<FunctionRegistry<RefValue>> {
    Arc::clone(BUILTINS.get_or_init(|| Arc::new(build_registry())))
}

fn builtin(name: &str) -> FunctionRef<RefValue> {
    registry()
        .resolve(name)
        .unwrap_or_else(|| panic!("builtin `{name}` is registered at initialisation"))
}

pub fn relu() -> FunctionRef<RefValue> {
    builtin("ref.relu")
}

pub fn sum() -> FunctionRef<RefValue> {
    builtin("ref.sum")
}

pub fn mean() -> FunctionRef<RefValue> {
    builtin("ref.mean")
}

pub fn zeros_like() -> FunctionRef<RefValue> {
    builtin("ref.zeros_like")
}

pub fn cat() -> FunctionRef<RefValue> {
    builtin("ref.cat")
}

pub fn matmul() -> FunctionRef<RefValue> {
    builtin("ref.matmul")
}

fn single_tensor<'a>(name: &str, args: &'a [RefValue]) -> Result<&'a RefTensor> {
    ensure!(args.len() == 1, "`{name}` takes one tensor, got {} argument(s)", args.len());
    args[0].as_tensor()
}

fn build_registry() -> FunctionRegistry<RefValue> {
    let mut registry = FunctionRegistry::new();
    registry.register("ref.relu", |args: &[RefValue], _: &Kwargs<RefValue>| {
        Ok(RefValue::Tensor(single_tensor("ref.relu", args)?.map(|x| x.max(0.0))))
    });
    registry.register("ref.sum", |args: &[RefValue], _: &Kwargs<RefValue>| {
        Ok(RefValue::Tensor(single_tensor("ref.sum", args)?.sum()))
    });
    registry.register("ref.mean", |args: &[RefValue], _: &Kwargs<RefValue>| {
        Ok(RefValue::Tensor(single_tensor("ref.mean", args)?.mean()?))
    });
    registry.register("ref.zeros_like", |args: &[RefValue], _: &Kwargs<RefValue>| {
        Ok(RefValue::Tensor(single_tensor("ref.zeros_like", args)?.map(|_| 0.0)))
    });
    registry.register("ref.matmul", |args: &[RefValue], _: &Kwargs<RefValue>| {
        ensure!(args.len() == 2, "`ref.matmul` takes two tensors");
        Ok(RefValue::Tensor(args[0].as_tensor()?.matmul(args[1].as_tensor()?)?))
    });
    registry.register("ref.cat", |args: &[RefValue], kwargs: &Kwargs<RefValue>| {
        if let Some(dim) = kwargs.get("dim") {
            ensure!(
                matches!(dim, RefValue::Int(0)),
                "`ref.cat` only concatenates along dim 0"
            );
        }
        let tensors = match args {
            [RefValue::List(items)] => items
                .iter()
                .map(|item| item.as_tensor().cloned())
                .collect::<Result<Vec<_>>>()?,
            _ => {
                return Err(anyhow!(
                    "`ref.cat` takes a single list of tensors, got {} argument(s)",
                    args.len()
                ))
            }
        };
        Ok(RefValue::Tensor(RefTensor::cat(&tensors)?))
    });
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_share_one_registration() {
        let registry = registry();
        assert_eq!(registry.canonical_name(&relu()), Some("ref.relu"));
        assert!(relu().same_function(&relu()));
        assert_eq!(
            registry.names(),
            vec!["ref.cat", "ref.matmul", "ref.mean", "ref.relu", "ref.sum", "ref.zeros_like"]
        );
    }

    #[test]
    fn cat_joins_rows() {
        let list = RefValue::List(vec![
            RefValue::Tensor(RefTensor::from_vec(vec![1.0])),
            RefValue::Tensor(RefTensor::from_vec(vec![2.0, 3.0])),
        ]);
        let out = cat().invoke(&[list], &Kwargs::new()).expect("cat");
        assert_eq!(out.as_tensor().expect("tensor").data(), Some(&[1.0, 2.0, 3.0][..]));
    }
}

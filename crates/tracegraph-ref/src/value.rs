use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use tracegraph::{Arg, BinaryOp, Device, Kwargs, Method, TracedValue};

use crate::module::{RefMethod, RefModule};
use crate::tensor::{normalize_index, slice_positions, RefTensor};

/// Dynamically typed value of the reference domain.
///
/// Modules and methods live in-process only; serializing one fails.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RefValue {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<RefValue>),
    Dict(BTreeMap<String, RefValue>),
    Slice {
        start: Option<i64>,
        stop: Option<i64>,
        step: Option<i64>,
    },
    Tensor(RefTensor),
    #[serde(skip)]
    Module(Arc<RefModule>),
    #[serde(skip)]
    Method(RefMethod),
}

impl RefValue {
    pub fn kind(&self) -> &'static str {
        match self {
            RefValue::None => "none",
            RefValue::Bool(_) => "bool",
            RefValue::Int(_) => "int",
            RefValue::Float(_) => "float",
            RefValue::Str(_) => "str",
            RefValue::List(_) => "list",
            RefValue::Dict(_) => "dict",
            RefValue::Slice { .. } => "slice",
            RefValue::Tensor(_) => "tensor",
            RefValue::Module(_) => "module",
            RefValue::Method(_) => "method",
        }
    }

    pub fn as_tensor(&self) -> Result<&RefTensor> {
        match self {
            RefValue::Tensor(tensor) => Ok(tensor),
            other => Err(anyhow!("expected a tensor, got {}", other.kind())),
        }
    }

    pub fn as_module(&self) -> Result<&Arc<RefModule>> {
        match self {
            RefValue::Module(module) => Ok(module),
            other => Err(anyhow!("expected a module, got {}", other.kind())),
        }
    }

    pub fn as_f64(&self) -> Result<f64> {
        match self {
            RefValue::Int(value) => Ok(*value as f64),
            RefValue::Float(value) => Ok(*value),
            RefValue::Bool(value) => Ok(f64::from(u8::from(*value))),
            RefValue::Tensor(tensor) => tensor.item(),
            other => Err(anyhow!("expected a number, got {}", other.kind())),
        }
    }

    /// Promotes numbers to a scalar tensor on `device`.
    fn to_tensor_on(&self, device: &Device) -> Result<RefTensor> {
        match self {
            RefValue::Tensor(tensor) => Ok(tensor.clone()),
            RefValue::Int(_) | RefValue::Float(_) | RefValue::Bool(_) => {
                Ok(RefTensor::scalar(self.as_f64()?).with_device(device.clone()))
            }
            other => Err(anyhow!("cannot use {} as a tensor operand", other.kind())),
        }
    }

    fn optional_index(value: Option<&RefValue>) -> Result<Option<i64>> {
        match value {
            None | Some(RefValue::None) => Ok(None),
            Some(RefValue::Int(value)) => Ok(Some(*value)),
            Some(other) => Err(anyhow!("slice bounds must be ints, got {}", other.kind())),
        }
    }
}

fn scalar_binary(op: BinaryOp, lhs: &RefValue, rhs: &RefValue) -> Result<RefValue> {
    if let (RefValue::Int(a), RefValue::Int(b)) = (lhs, rhs) {
        match op {
            BinaryOp::Add => return Ok(RefValue::Int(a.wrapping_add(*b))),
            BinaryOp::Sub => return Ok(RefValue::Int(a.wrapping_sub(*b))),
            BinaryOp::Mul => return Ok(RefValue::Int(a.wrapping_mul(*b))),
            BinaryOp::Pow if *b >= 0 => {
                let exponent = u32::try_from(*b).map_err(|_| anyhow!("exponent {b} too large"))?;
                return Ok(RefValue::Int(a.wrapping_pow(exponent)));
            }
            BinaryOp::Div | BinaryOp::Pow => {}
        }
    }
    let (a, b) = (lhs.as_f64()?, rhs.as_f64()?);
    Ok(RefValue::Float(match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => a / b,
        BinaryOp::Pow => a.powf(b),
    }))
}

impl TracedValue for RefValue {
    fn device(&self) -> Option<Device> {
        match self {
            RefValue::Tensor(tensor) => Some(tensor.device().clone()),
            _ => None,
        }
    }

    fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(match self {
            RefValue::Tensor(tensor) => RefValue::Tensor(tensor.to_device(device)),
            other => other.clone(),
        })
    }

    fn structural(&self) -> Self {
        match self {
            RefValue::Tensor(tensor) => RefValue::Tensor(tensor.structural()),
            RefValue::List(items) => RefValue::List(items.iter().map(Self::structural).collect()),
            RefValue::Dict(entries) => RefValue::Dict(
                entries
                    .iter()
                    .map(|(key, value)| (key.clone(), value.structural()))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    fn call(&self, args: &[Self], kwargs: &Kwargs<Self>) -> Result<Self> {
        match self {
            RefValue::Module(module) => module.forward(args, kwargs),
            RefValue::Method(method) => method.call(args, kwargs),
            other => Err(anyhow!("{} is not callable", other.kind())),
        }
    }

    fn get_item(&self, key: &Self) -> Result<Self> {
        match (self, key) {
            (RefValue::List(items), RefValue::Int(index)) => {
                Ok(items[normalize_index(*index, items.len())?].clone())
            }
            (RefValue::List(items), RefValue::Slice { start, stop, step }) => {
                let positions = slice_positions(items.len(), *start, *stop, *step)?;
                Ok(RefValue::List(
                    positions.into_iter().map(|at| items[at].clone()).collect(),
                ))
            }
            (RefValue::Dict(entries), RefValue::Str(name)) => entries
                .get(name)
                .cloned()
                .ok_or_else(|| anyhow!("key `{name}` not found")),
            (RefValue::Tensor(tensor), RefValue::Int(index)) => {
                Ok(RefValue::Tensor(tensor.row(*index)?))
            }
            (RefValue::Tensor(tensor), RefValue::Slice { start, stop, step }) => {
                Ok(RefValue::Tensor(tensor.rows(*start, *stop, *step)?))
            }
            (container, key) => Err(anyhow!(
                "{} cannot be indexed by {}",
                container.kind(),
                key.kind()
            )),
        }
    }

    fn get_attr(&self, name: &str) -> Result<Self> {
        match self {
            RefValue::Module(module) => {
                if let Some(member) = module.member(name) {
                    return Ok(member.clone());
                }
                if module.has_method(name) {
                    return Ok(RefValue::Method(RefMethod::new(Arc::clone(module), name)));
                }
                module.require(name).cloned()
            }
            RefValue::Tensor(tensor) => match name {
                "shape" => Ok(RefValue::List(
                    tensor
                        .shape()
                        .iter()
                        .map(|&dim| RefValue::Int(dim as i64))
                        .collect(),
                )),
                "T" => Ok(RefValue::Tensor(tensor.transpose()?)),
                other => Err(anyhow!("tensor has no attribute `{other}`")),
            },
            RefValue::Dict(entries) => entries
                .get(name)
                .cloned()
                .ok_or_else(|| anyhow!("dict has no attribute `{name}`")),
            other => Err(anyhow!("{} has no attribute `{name}`", other.kind())),
        }
    }

    fn length(&self) -> Result<Self> {
        let len = match self {
            RefValue::List(items) => items.len(),
            RefValue::Dict(entries) => entries.len(),
            RefValue::Str(text) => text.chars().count(),
            RefValue::Tensor(tensor) => *tensor
                .shape()
                .first()
                .ok_or_else(|| anyhow!("len() of a zero-dimensional tensor"))?,
            other => bail!("{} has no length", other.kind()),
        };
        Ok(RefValue::Int(len as i64))
    }

    fn binary(&self, op: BinaryOp, rhs: &Self) -> Result<Self> {
        match (self, rhs) {
            (RefValue::Tensor(tensor), other) => {
                let rhs = other.to_tensor_on(tensor.device())?;
                Ok(RefValue::Tensor(tensor.binary(op, &rhs)?))
            }
            (other, RefValue::Tensor(tensor)) => {
                let lhs = other.to_tensor_on(tensor.device())?;
                Ok(RefValue::Tensor(lhs.binary(op, tensor)?))
            }
            (RefValue::Str(a), RefValue::Str(b)) if op == BinaryOp::Add => {
                Ok(RefValue::Str(format!("{a}{b}")))
            }
            (RefValue::List(a), RefValue::List(b)) if op == BinaryOp::Add => {
                Ok(RefValue::List(a.iter().chain(b).cloned().collect()))
            }
            (lhs, rhs) => scalar_binary(op, lhs, rhs).map_err(|err| {
                anyhow!(
                    "`{}` is not defined for {} and {}: {err}",
                    op.name(),
                    lhs.kind(),
                    rhs.kind()
                )
            }),
        }
    }

    fn to_bool(&self) -> Result<bool> {
        Ok(match self {
            RefValue::None => false,
            RefValue::Bool(value) => *value,
            RefValue::Int(value) => *value != 0,
            RefValue::Float(value) => *value != 0.0,
            RefValue::Str(text) => !text.is_empty(),
            RefValue::List(items) => !items.is_empty(),
            RefValue::Dict(entries) => !entries.is_empty(),
            RefValue::Tensor(tensor) => tensor.item()? != 0.0,
            other => bail!("{} has no truth value", other.kind()),
        })
    }

    fn to_index(&self) -> Result<i64> {
        match self {
            RefValue::Int(value) => Ok(*value),
            RefValue::Bool(value) => Ok(i64::from(*value)),
            RefValue::Tensor(tensor) => {
                let value = tensor.item()?;
                if value.fract() != 0.0 {
                    bail!("tensor value {value} is not an integer");
                }
                Ok(value as i64)
            }
            other => Err(anyhow!("{} cannot be used as an index", other.kind())),
        }
    }

    fn is_passthrough(&self) -> bool {
        matches!(self, RefValue::Module(_))
    }

    fn unbound_method(&self) -> Option<Method<Self>> {
        match self {
            RefValue::Method(method) => method.module().traced_method(method.name()),
            _ => None,
        }
    }

    fn list(items: Vec<Self>) -> Self {
        RefValue::List(items)
    }

    fn dict(entries: Kwargs<Self>) -> Self {
        RefValue::Dict(entries)
    }

    fn slice(start: Option<Self>, stop: Option<Self>, step: Option<Self>) -> Result<Self> {
        Ok(RefValue::Slice {
            start: Self::optional_index(start.as_ref())?,
            stop: Self::optional_index(stop.as_ref())?,
            step: Self::optional_index(step.as_ref())?,
        })
    }
}

impl PartialEq for RefValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (RefValue::None, RefValue::None) => true,
            (RefValue::Bool(a), RefValue::Bool(b)) => a == b,
            (RefValue::Int(a), RefValue::Int(b)) => a == b,
            (RefValue::Float(a), RefValue::Float(b)) => a == b,
            (RefValue::Str(a), RefValue::Str(b)) => a == b,
            (RefValue::List(a), RefValue::List(b)) => a == b,
            (RefValue::Dict(a), RefValue::Dict(b)) => a == b,
            (
                RefValue::Slice { start, stop, step },
                RefValue::Slice {
                    start: other_start,
                    stop: other_stop,
                    step: other_step,
                },
            ) => start == other_start && stop == other_stop && step == other_step,
            (RefValue::Tensor(a), RefValue::Tensor(b)) => a == b,
            (RefValue::Module(a), RefValue::Module(b)) => Arc::ptr_eq(a, b),
            (RefValue::Method(a), RefValue::Method(b)) => a.same_method(b),
            _ => false,
        }
    }
}

impl From<bool> for RefValue {
    fn from(value: bool) -> Self {
        RefValue::Bool(value)
    }
}

impl From<i64> for RefValue {
    fn from(value: i64) -> Self {
        RefValue::Int(value)
    }
}

impl From<f64> for RefValue {
    fn from(value: f64) -> Self {
        RefValue::Float(value)
    }
}

impl From<&str> for RefValue {
    fn from(value: &str) -> Self {
        RefValue::Str(value.to_string())
    }
}

impl From<String> for RefValue {
    fn from(value: String) -> Self {
        RefValue::Str(value)
    }
}

impl From<RefTensor> for RefValue {
    fn from(tensor: RefTensor) -> Self {
        RefValue::Tensor(tensor)
    }
}

impl From<Arc<RefModule>> for RefValue {
    fn from(module: Arc<RefModule>) -> Self {
        RefValue::Module(module)
    }
}

impl From<Vec<RefValue>> for RefValue {
    fn from(items: Vec<RefValue>) -> Self {
        RefValue::List(items)
    }
}

impl From<RefValue> for Arg<RefValue> {
    fn from(value: RefValue) -> Self {
        Arg::Value(value)
    }
}

impl From<RefTensor> for Arg<RefValue> {
    fn from(tensor: RefTensor) -> Self {
        Arg::Value(RefValue::Tensor(tensor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_promote_to_tensors_on_the_tensor_device() {
        let device = Device::new("accel:0");
        let x = RefValue::Tensor(RefTensor::from_vec(vec![1.0, 2.0]).with_device(device.clone()));
        let out = x.binary(BinaryOp::Mul, &RefValue::Int(3)).expect("tensor * int");
        let tensor = out.as_tensor().expect("tensor result");
        assert_eq!(tensor.device(), &device);
        assert_eq!(tensor.data(), Some(&[3.0, 6.0][..]));

        let reversed = RefValue::Float(1.0)
            .binary(BinaryOp::Sub, &x)
            .expect("float - tensor");
        assert_eq!(reversed.as_tensor().expect("tensor").data(), Some(&[0.0, -1.0][..]));
    }

    #[test]
    fn integer_arithmetic_stays_integral_except_division() {
        assert_eq!(
            RefValue::Int(7).binary(BinaryOp::Add, &RefValue::Int(5)).expect("add"),
            RefValue::Int(12)
        );
        assert_eq!(
            RefValue::Int(2).binary(BinaryOp::Pow, &RefValue::Int(10)).expect("pow"),
            RefValue::Int(1024)
        );
        assert_eq!(
            RefValue::Int(7).binary(BinaryOp::Div, &RefValue::Int(2)).expect("div"),
            RefValue::Float(3.5)
        );
        assert!(RefValue::Str("a".into())
            .binary(BinaryOp::Mul, &RefValue::Int(2))
            .is_err());
    }

    #[test]
    fn structural_drops_tensor_data_but_keeps_shape() {
        let value = RefValue::List(vec![
            RefValue::Tensor(RefTensor::from_vec(vec![1.0, 2.0, 3.0])),
            RefValue::Int(4),
        ]);
        let RefValue::List(items) = value.structural() else {
            panic!("structural keeps containers");
        };
        let tensor = items[0].as_tensor().expect("tensor");
        assert!(tensor.is_meta());
        assert_eq!(tensor.shape(), &[3]);
        assert_eq!(items[1], RefValue::Int(4));
    }

    #[test]
    fn coercions_need_concrete_values() {
        assert!(RefValue::Tensor(RefTensor::scalar(2.0)).to_bool().expect("bool"));
        assert_eq!(RefValue::Tensor(RefTensor::scalar(2.0)).to_index().expect("index"), 2);
        let meta = RefValue::Tensor(RefTensor::meta(vec![], Device::cpu()));
        assert!(meta.to_bool().is_err());
        assert!(RefValue::Tensor(RefTensor::scalar(0.5)).to_index().is_err());
    }

    #[test]
    fn slices_index_lists_and_tensor_rows() {
        let list = RefValue::List((0..5).map(RefValue::Int).collect());
        let slice = RefValue::slice(Some(RefValue::Int(1)), None, Some(RefValue::Int(2)))
            .expect("slice");
        assert_eq!(
            list.get_item(&slice).expect("list slice"),
            RefValue::List(vec![RefValue::Int(1), RefValue::Int(3)])
        );
        let matrix =
            RefValue::Tensor(RefTensor::new(vec![3, 2], (0..6).map(f64::from).collect()).expect("matrix"));
        let row = matrix.get_item(&RefValue::Int(-1)).expect("last row");
        assert_eq!(row.as_tensor().expect("tensor").data(), Some(&[4.0, 5.0][..]));
    }
}

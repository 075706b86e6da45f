//! Host tensor with an optional payload.
//!
//! A tensor without data is a *meta* tensor: it keeps shape and device and every operation on
//! it computes only the output shape. Tracing runs against meta tensors.

use anyhow::{bail, ensure, Result};
use serde::{Deserialize, Serialize};
use tracegraph::{BinaryOp, Device};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RefTensor {
    shape: Vec<usize>,
    data: Option<Vec<f64>>,
    device: Device,
}

fn element_count(shape: &[usize]) -> usize {
    shape.iter().product()
}

impl RefTensor {
    pub fn new(shape: Vec<usize>, data: Vec<f64>) -> Result<Self> {
        ensure!(
            element_count(&shape) == data.len(),
            "shape {:?} holds {} element(s), got {}",
            shape,
            element_count(&shape),
            data.len()
        );
        Ok(RefTensor {
            shape,
            data: Some(data),
            device: Device::cpu(),
        })
    }

    /// One-dimensional tensor.
    pub fn from_vec(data: Vec<f64>) -> Self {
        RefTensor {
            shape: vec![data.len()],
            data: Some(data),
            device: Device::cpu(),
        }
    }

    pub fn scalar(value: f64) -> Self {
        RefTensor {
            shape: Vec::new(),
            data: Some(vec![value]),
            device: Device::cpu(),
        }
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        let data = vec![0.0; element_count(&shape)];
        RefTensor {
            shape,
            data: Some(data),
            device: Device::cpu(),
        }
    }

    pub fn meta(shape: Vec<usize>, device: Device) -> Self {
        RefTensor {
            shape,
            data: None,
            device,
        }
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> Option<&[f64]> {
        self.data.as_deref()
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn is_meta(&self) -> bool {
        self.data.is_none()
    }

    pub fn numel(&self) -> usize {
        element_count(&self.shape)
    }

    pub fn to_device(&self, device: &Device) -> Self {
        RefTensor {
            shape: self.shape.clone(),
            data: self.data.clone(),
            device: device.clone(),
        }
    }

    /// Same shape and device, no data.
    pub fn structural(&self) -> Self {
        RefTensor::meta(self.shape.clone(), self.device.clone())
    }

    /// The only element of a one-element tensor.
    pub fn item(&self) -> Result<f64> {
        let data = self.require_data("item")?;
        ensure!(
            data.len() == 1,
            "only one-element tensors convert to scalars, shape is {:?}",
            self.shape
        );
        Ok(data[0])
    }

    pub fn map(&self, f: impl Fn(f64) -> f64) -> Self {
        RefTensor {
            shape: self.shape.clone(),
            data: self
                .data
                .as_ref()
                .map(|data| data.iter().map(|&x| f(x)).collect()),
            device: self.device.clone(),
        }
    }

    /// Elementwise arithmetic. Shapes must match, or one side must be a single element or
    /// match the trailing dimensions of the other.
    pub fn binary(&self, op: BinaryOp, rhs: &RefTensor) -> Result<Self> {
        self.check_device(rhs)?;
        let shape = broadcast_shape(&self.shape, &rhs.shape).ok_or_else(|| {
            anyhow::anyhow!(
                "`{}` shape mismatch: {:?} vs {:?}",
                op.name(),
                self.shape,
                rhs.shape
            )
        })?;
        let data = match (&self.data, &rhs.data) {
            (Some(lhs), Some(rhs)) => {
                let count = element_count(&shape);
                Some(
                    (0..count)
                        .map(|index| apply(op, lhs[index % lhs.len()], rhs[index % rhs.len()]))
                        .collect(),
                )
            }
            _ => None,
        };
        Ok(RefTensor {
            shape,
            data,
            device: self.device.clone(),
        })
    }

    /// `[m, k] x [k, n]` or `[k] x [k, n]`.
    pub fn matmul(&self, rhs: &RefTensor) -> Result<Self> {
        self.check_device(rhs)?;
        let (rows, inner, squeeze) = match self.shape.as_slice() {
            [k] => (1, *k, true),
            [m, k] => (*m, *k, false),
            other => bail!("matmul expects a vector or matrix on the left, got {:?}", other),
        };
        let cols = match rhs.shape.as_slice() {
            [k, n] if *k == inner => *n,
            other => bail!(
                "matmul inner dimensions differ: {:?} x {:?}",
                self.shape,
                other
            ),
        };
        let shape = if squeeze { vec![cols] } else { vec![rows, cols] };
        let data = match (&self.data, &rhs.data) {
            (Some(lhs), Some(rhs)) => {
                let mut out = vec![0.0; rows * cols];
                for row in 0..rows {
                    for col in 0..cols {
                        out[row * cols + col] = (0..inner)
                            .map(|k| lhs[row * inner + k] * rhs[k * cols + col])
                            .sum();
                    }
                }
                Some(out)
            }
            _ => None,
        };
        Ok(RefTensor {
            shape,
            data,
            device: self.device.clone(),
        })
    }

    pub fn transpose(&self) -> Result<Self> {
        let (rows, cols) = match self.shape.as_slice() {
            [rows, cols] => (*rows, *cols),
            other => bail!("transpose expects a matrix, got {:?}", other),
        };
        let data = self.data.as_ref().map(|data| {
            let mut out = vec![0.0; data.len()];
            for row in 0..rows {
                for col in 0..cols {
                    out[col * rows + row] = data[row * cols + col];
                }
            }
            out
        });
        Ok(RefTensor {
            shape: vec![cols, rows],
            data,
            device: self.device.clone(),
        })
    }

    pub fn sum(&self) -> Self {
        RefTensor {
            shape: Vec::new(),
            data: self.data.as_ref().map(|data| vec![data.iter().sum()]),
            device: self.device.clone(),
        }
    }

    pub fn mean(&self) -> Result<Self> {
        ensure!(self.numel() > 0, "mean of an empty tensor");
        let count = self.numel() as f64;
        Ok(self.sum().map(|total| total / count))
    }

    /// Sub-tensor at `index` along the first dimension. Negative indices count from the end.
    pub fn row(&self, index: i64) -> Result<Self> {
        let (&len, rest) = self
            .shape
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("cannot index a zero-dimensional tensor"))?;
        let position = normalize_index(index, len)?;
        let stride = element_count(rest);
        Ok(RefTensor {
            shape: rest.to_vec(),
            data: self
                .data
                .as_ref()
                .map(|data| data[position * stride..(position + 1) * stride].to_vec()),
            device: self.device.clone(),
        })
    }

    /// Rows `start..stop` (by `step`) along the first dimension.
    pub fn rows(&self, start: Option<i64>, stop: Option<i64>, step: Option<i64>) -> Result<Self> {
        let (&len, rest) = self
            .shape
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("cannot slice a zero-dimensional tensor"))?;
        let positions = slice_positions(len, start, stop, step)?;
        let stride = element_count(rest);
        let mut shape = vec![positions.len()];
        shape.extend_from_slice(rest);
        Ok(RefTensor {
            shape,
            data: self.data.as_ref().map(|data| {
                positions
                    .iter()
                    .flat_map(|&row| data[row * stride..(row + 1) * stride].iter().copied())
                    .collect()
            }),
            device: self.device.clone(),
        })
    }

    /// Concatenates along the first dimension.
    pub fn cat(tensors: &[RefTensor]) -> Result<Self> {
        let (first, rest) = tensors
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("cat needs at least one tensor"))?;
        ensure!(!first.shape.is_empty(), "cannot concatenate scalars");
        let mut rows = first.shape[0];
        for tensor in rest {
            first.check_device(tensor)?;
            ensure!(
                tensor.shape.len() == first.shape.len() && tensor.shape[1..] == first.shape[1..],
                "cat shape mismatch: {:?} vs {:?}",
                first.shape,
                tensor.shape
            );
            rows += tensor.shape[0];
        }
        let mut shape = first.shape.clone();
        shape[0] = rows;
        let data = tensors
            .iter()
            .map(|tensor| tensor.data.clone())
            .collect::<Option<Vec<_>>>()
            .map(|parts| parts.concat());
        Ok(RefTensor {
            shape,
            data,
            device: first.device.clone(),
        })
    }

    fn check_device(&self, other: &RefTensor) -> Result<()> {
        ensure!(
            self.device == other.device,
            "expected tensors on one device, found {} and {}",
            self.device,
            other.device
        );
        Ok(())
    }

    fn require_data(&self, what: &str) -> Result<&[f64]> {
        self.data
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("`{what}` needs data, but the tensor is meta"))
    }
}

fn apply(op: BinaryOp, lhs: f64, rhs: f64) -> f64 {
    match op {
        BinaryOp::Add => lhs + rhs,
        BinaryOp::Sub => lhs - rhs,
        BinaryOp::Mul => lhs * rhs,
        BinaryOp::Div => lhs / rhs,
        BinaryOp::Pow => lhs.powf(rhs),
    }
}

fn broadcast_shape(lhs: &[usize], rhs: &[usize]) -> Option<Vec<usize>> {
    if lhs == rhs || element_count(rhs) == 1 || lhs.ends_with(rhs) {
        Some(lhs.to_vec())
    } else if element_count(lhs) == 1 || rhs.ends_with(lhs) {
        Some(rhs.to_vec())
    } else {
        None
    }
}

pub(crate) fn normalize_index(index: i64, len: usize) -> Result<usize> {
    let resolved = if index < 0 { index + len as i64 } else { index };
    ensure!(
        (0..len as i64).contains(&resolved),
        "index {index} is out of range for length {len}"
    );
    Ok(resolved as usize)
}

/// Positions selected by a Python-style slice over `len` elements.
pub(crate) fn slice_positions(
    len: usize,
    start: Option<i64>,
    stop: Option<i64>,
    step: Option<i64>,
) -> Result<Vec<usize>> {
    let step = step.unwrap_or(1);
    ensure!(step != 0, "slice step cannot be zero");
    let len = len as i64;
    let clamp = |bound: i64, low: i64, high: i64| {
        let bound = if bound < 0 { bound + len } else { bound };
        bound.clamp(low, high)
    };
    let mut positions = Vec::new();
    if step > 0 {
        let mut at = start.map_or(0, |start| clamp(start, 0, len));
        let stop = stop.map_or(len, |stop| clamp(stop, 0, len));
        while at < stop {
            positions.push(at as usize);
            at += step;
        }
    } else {
        let mut at = start.map_or(len - 1, |start| clamp(start, -1, len - 1));
        let stop = stop.map_or(-1, |stop| clamp(stop, -1, len - 1));
        while at > stop {
            positions.push(at as usize);
            at += step;
        }
    }
    Ok(positions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bias_broadcasts_over_rows() {
        let x = RefTensor::new(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]).expect("matrix");
        let bias = RefTensor::from_vec(vec![10.0, 20.0]);
        let out = x.binary(BinaryOp::Add, &bias).expect("broadcast add");
        assert_eq!(out.shape(), &[2, 2]);
        assert_eq!(out.data(), Some(&[11.0, 22.0, 13.0, 24.0][..]));
    }

    #[test]
    fn meta_operands_only_compute_shapes() {
        let x = RefTensor::meta(vec![3], Device::cpu());
        let w = RefTensor::new(vec![3, 2], vec![1.0; 6]).expect("matrix");
        let out = x.matmul(&w).expect("shape-only matmul");
        assert!(out.is_meta());
        assert_eq!(out.shape(), &[2]);
        assert!(out.item().is_err());
    }

    #[test]
    fn mismatched_shapes_and_devices_are_rejected() {
        let a = RefTensor::from_vec(vec![1.0, 2.0, 3.0]);
        let b = RefTensor::from_vec(vec![1.0, 2.0]);
        assert!(a.binary(BinaryOp::Add, &b).is_err());

        let moved = b.to_device(&Device::new("accel:0"));
        assert!(RefTensor::from_vec(vec![1.0, 2.0])
            .binary(BinaryOp::Mul, &moved)
            .is_err());
    }

    #[test]
    fn slices_follow_python_semantics() {
        assert_eq!(slice_positions(5, None, None, None).expect("full"), vec![0, 1, 2, 3, 4]);
        assert_eq!(slice_positions(5, Some(-2), None, None).expect("tail"), vec![3, 4]);
        assert_eq!(slice_positions(5, None, None, Some(-2)).expect("reverse"), vec![4, 2, 0]);
        assert!(slice_positions(5, None, None, Some(0)).is_err());
    }
}

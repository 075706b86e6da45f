//! Small deterministic models used by tests and demos.

use std::sync::Arc;

use anyhow::{ensure, Result};
use tracegraph::{Arg, BinaryOp, Kwargs, Method, Proxy};

use crate::functions;
use crate::{RefModule, RefTensor, RefValue};

fn single_input<'a>(module: &RefModule, args: &'a [RefValue]) -> Result<&'a RefTensor> {
    ensure!(
        args.len() == 1,
        "`{}` takes one input, got {}",
        module.name(),
        args.len()
    );
    args[0].as_tensor()
}

/// `y = x W^T + b` with `weight` shaped `[out, in]`.
pub fn linear(name: &str, weight: RefTensor, bias: Option<RefTensor>) -> Arc<RefModule> {
    let mut builder = RefModule::builder(name).member("weight", weight);
    if let Some(bias) = bias {
        builder = builder.member("bias", bias);
    }
    builder
        .forward(|module, args, _| {
            let x = single_input(module, args)?;
            let weight = module.require("weight")?.as_tensor()?;
            let mut out = x.matmul(&weight.transpose()?)?;
            if let Some(bias) = module.member("bias") {
                out = out.binary(BinaryOp::Add, bias.as_tensor()?)?;
            }
            Ok(RefValue::Tensor(out))
        })
        .build()
}

/// Two linear layers with a ReLU in between: 3 inputs, 4 hidden units, 2 outputs.
///
/// Besides `forward` it has two traced methods: `double` (twice the output) and `hidden`
/// (the post-activation hidden layer).
pub fn tiny_mlp() -> Arc<RefModule> {
    let fc1 = linear(
        "fc1",
        RefTensor::new(
            vec![4, 3],
            vec![
                0.5, -1.0, 0.25, //
                1.0, 0.5, -0.5, //
                -0.25, 0.75, 1.0, //
                0.1, 0.2, 0.3,
            ],
        )
        .expect("fc1 weight shape"),
        Some(RefTensor::from_vec(vec![0.1, -0.2, 0.0, 0.5])),
    );
    let fc2 = linear(
        "fc2",
        RefTensor::new(
            vec![2, 4],
            vec![
                1.0, -1.0, 0.5, 2.0, //
                0.5, 0.5, -1.0, 1.0,
            ],
        )
        .expect("fc2 weight shape"),
        Some(RefTensor::from_vec(vec![0.0, 1.0])),
    );

    let double: Method<RefValue> = Arc::new(
        |this: &Proxy<RefValue>, args: Vec<Arg<RefValue>>, kwargs: Kwargs<Arg<RefValue>>| {
            let out = this.call(args, kwargs)?;
            out.try_mul(RefValue::Float(2.0))
        },
    );
    let hidden: Method<RefValue> = Arc::new(
        |this: &Proxy<RefValue>, args: Vec<Arg<RefValue>>, kwargs: Kwargs<Arg<RefValue>>| {
            let pre = this.attr("fc1")?.call(args, kwargs)?;
            pre.apply(&functions::relu(), Vec::new(), Kwargs::new())
        },
    );

    RefModule::builder("tiny_mlp")
        .submodule("fc1", fc1)
        .submodule("fc2", fc2)
        .member("scale", RefValue::Float(2.0))
        .forward(|module, args, kwargs| {
            let fc1 = module.require("fc1")?.as_module()?;
            let fc2 = module.require("fc2")?.as_module()?;
            let hidden = fc1.forward(args, kwargs)?;
            let activated = functions::relu().invoke(&[hidden], &Kwargs::new())?;
            fc2.forward(&[activated], &Kwargs::new())
        })
        .method("double", double)
        .method("hidden", hidden)
        .build()
}

mod common;

use anyhow::Result;
use tracegraph::{
    args, kwargs, BackendError, BinaryOp, IteratorBackend, Kwargs, LocalBackend, TraceConfig,
    TracedValue, Tracer,
};
use tracegraph_ref::{functions, RefTensor, RefValue};

use common::{eager, eager_member, input, model, tensor_data};

#[test]
fn local_execution_matches_eager_evaluation() -> Result<()> {
    let model = model();
    let mut tracer = Tracer::new(RefValue::from(model.clone()), LocalBackend);
    let x = tracer.input("x", RefValue::from(input()))?;
    let out = tracer.root().call(args![&x], kwargs! {})?.save();
    tracer.execute()?;

    assert_eq!(out.value(), Some(eager(&model, input())));
    Ok(())
}

#[test]
fn traced_methods_execute_like_their_eager_counterpart() -> Result<()> {
    let model = model();
    let mut tracer = Tracer::new(RefValue::from(model.clone()), LocalBackend);
    let x = tracer.input("x", RefValue::from(input()))?;
    let doubled = tracer.root().attr("double")?.call(args![&x], kwargs! {})?.save();
    let hidden = tracer.root().attr("hidden")?.call(args![&x], kwargs! {})?.save();
    tracer.exit()?;

    let expected = eager(&model, input()).binary(BinaryOp::Mul, &RefValue::Float(2.0))?;
    assert_eq!(doubled.value(), Some(expected));

    let pre = eager_member(&model, "fc1", input());
    let activated = functions::relu().invoke(&[pre], &Kwargs::new())?;
    assert_eq!(hidden.value(), Some(activated));
    Ok(())
}

#[test]
fn unsaved_intermediates_are_released() -> Result<()> {
    let mut tracer = Tracer::new(RefValue::from(model()), LocalBackend);
    let x = tracer.input("x", RefValue::from(input()))?;
    let hidden = tracer.root().attr("fc1")?.call(args![&x], kwargs! {})?;
    let activated = hidden.apply(&functions::relu(), Vec::new(), Kwargs::new())?;
    let out = tracer.root().attr("fc2")?.call(args![&activated], kwargs! {})?.save();
    tracer.execute()?;

    assert!(hidden.value().is_none(), "nothing reads fc1's output after relu");
    assert!(activated.value().is_none());
    assert!(out.value().is_some());
    Ok(())
}

#[test]
fn interventions_change_downstream_values() -> Result<()> {
    let mut tracer = Tracer::new(RefValue::from(model()), LocalBackend);
    let x = tracer.input("x", RefValue::from(input()))?;
    let hidden = tracer.root().attr("fc1")?.call(args![&x], kwargs! {})?;
    let silenced = hidden.apply(&functions::zeros_like(), Vec::new(), Kwargs::new())?;
    let out = tracer.root().attr("fc2")?.call(args![&silenced], kwargs! {})?.save();
    tracer.execute()?;

    // With a zeroed hidden layer only fc2's bias remains.
    assert_eq!(tensor_data(&out.value().expect("saved")), vec![0.0, 1.0]);
    Ok(())
}

#[test]
fn failed_nodes_report_their_target() -> Result<()> {
    let config = TraceConfig::default().with_validation(false);
    let mut tracer = Tracer::with_config(RefValue::from(model()), LocalBackend, &config);
    let x = tracer.input("x", RefValue::from(input()))?;
    let wrong = tracer.root().attr("fc2")?.call(args![&x], kwargs! {})?;

    let err = tracer.execute().expect_err("fc2 expects four features");
    assert!(!err.is_recoverable());
    match err {
        BackendError::Node { node, target, .. } => {
            assert_eq!(node, wrong.node_ref());
            assert_eq!(target, "__call__");
        }
        other => panic!("expected a node failure, got {other}"),
    }
    Ok(())
}

#[test]
fn executing_twice_recomputes_from_scratch() -> Result<()> {
    let model = model();
    let mut tracer = Tracer::new(RefValue::from(model.clone()), LocalBackend);
    let x = tracer.input("x", RefValue::from(input()))?;
    let out = tracer.root().call(args![&x], kwargs! {})?.save();
    tracer.execute()?;
    let first = out.value();
    tracer.execute()?;

    assert_eq!(out.value(), first);
    assert_eq!(first, Some(eager(&model, input())));
    Ok(())
}

#[test]
fn iterator_backend_runs_once_per_item() -> Result<()> {
    let model = model();
    let items = vec![
        RefTensor::from_vec(vec![1.0, 0.0, 0.0]),
        RefTensor::from_vec(vec![0.0, 1.0, 0.0]),
        RefTensor::from_vec(vec![0.0, 0.0, 1.0]),
    ];
    let mut tracer = Tracer::new(RefValue::from(model.clone()), IteratorBackend);
    let item = tracer.iteration_input(items.iter().cloned().map(RefValue::from).collect())?;
    let out = tracer.root().call(args![&item], kwargs! {})?.save();
    tracer.execute()?;

    let expected: Vec<RefValue> = items.into_iter().map(|x| eager(&model, x)).collect();
    assert_eq!(out.iteration_values(), expected);
    assert_eq!(out.value(), expected.last().cloned());
    Ok(())
}

#[test]
fn iterator_backend_requires_an_iteration_input() -> Result<()> {
    let mut tracer = Tracer::new(RefValue::from(model()), IteratorBackend);
    tracer.input("x", RefValue::from(input()))?;
    let err = tracer.execute().expect_err("nothing to iterate over");
    assert!(matches!(err, BackendError::Execution { .. }), "got {err}");
    Ok(())
}

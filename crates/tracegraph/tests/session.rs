mod common;

use anyhow::Result;
use tracegraph::{
    args, kwargs, BinaryOp, LocalBackend, Protocol, Session, Target, TraceError, TracedValue,
    Tracer,
};
use tracegraph_ref::{RefTensor, RefValue};

use common::{eager_member, input, model, tensor_data};

#[test]
fn later_graphs_read_values_of_earlier_graphs() -> Result<()> {
    let model = model();
    let mut session = Session::new(RefValue::from(model.clone()), LocalBackend);

    let mut first = session.trace();
    let x = first.input("x", RefValue::from(input()))?;
    let hidden = first.root().attr("fc1")?.call(args![&x], kwargs! {})?;
    first.exit()?;

    let second = session.trace();
    let doubled = (&hidden * RefValue::Float(2.0))?.save();
    assert_eq!(doubled.graph().id(), second.graph().id());
    let bridged = second
        .graph()
        .nodes()
        .into_iter()
        .find(|node| node.target().is_protocol() && node.target().name() == "bridge")
        .expect("hidden is bridged into the second graph");
    assert_eq!(
        bridged.target(),
        &Target::Protocol(Protocol::Bridge {
            source: hidden.node_ref()
        })
    );
    second.exit()?;

    assert_eq!(session.queued(), 2);
    session.execute()?;

    let expected =
        eager_member(&model, "fc1", input()).binary(BinaryOp::Mul, &RefValue::Float(2.0))?;
    assert_eq!(doubled.value(), Some(expected));
    assert!(hidden.value().is_none(), "the bridged source is released once consumed");
    assert_eq!(session.bridge().locks(), 0);
    assert_eq!(session.queued(), 0);
    Ok(())
}

#[test]
fn a_node_is_bridged_once_per_consuming_graph() -> Result<()> {
    let session = Session::new(RefValue::from(model()), LocalBackend);
    let mut first = session.trace();
    let x = first.input("x", RefValue::from(input()))?;
    first.exit()?;

    let second = session.trace();
    let _a = x.try_add(RefValue::Float(1.0))?;
    let _b = x.try_mul(RefValue::Float(3.0))?;
    let bridges = second
        .graph()
        .nodes()
        .iter()
        .filter(|node| node.target().name() == "bridge")
        .count();
    assert_eq!(bridges, 1);
    assert_eq!(session.bridge().representations(x.node_ref()).len(), 1);
    Ok(())
}

#[test]
fn iterating_graphs_consume_bridged_values_on_every_item() -> Result<()> {
    let mut session = Session::new(RefValue::from(model()), LocalBackend);

    let first = session.trace();
    let base = first.literal(RefValue::Float(10.0))?;
    let offset = (&base * RefValue::Float(2.0))?;
    first.exit()?;

    let items = vec![
        RefValue::from(RefTensor::from_vec(vec![1.0, 2.0])),
        RefValue::from(RefTensor::from_vec(vec![3.0, 4.0])),
    ];
    let (tracer, item) = session.iter(items)?;
    let shifted = (&item + &offset)?.save();
    tracer.exit()?;

    session.execute()?;
    let values: Vec<Vec<f64>> = shifted.iteration_values().iter().map(tensor_data).collect();
    assert_eq!(values, vec![vec![21.0, 22.0], vec![23.0, 24.0]]);
    assert_eq!(session.bridge().locks(), 0);
    Ok(())
}

#[test]
fn graphs_cannot_read_from_later_graphs() -> Result<()> {
    let session = Session::new(RefValue::from(model()), LocalBackend);
    let outer = session.trace();
    let mut inner = session.trace();
    let late = inner.input("late", RefValue::Float(1.0))?;
    inner.exit()?;

    // `outer` is innermost again, but it was registered before `inner`.
    let err = late
        .try_add(RefValue::Float(1.0))
        .expect_err("outer predates inner");
    assert!(matches!(err, TraceError::TemporalOrder { .. }), "got {err}");
    drop(outer);
    Ok(())
}

#[test]
fn graphs_outside_the_session_cannot_be_read() -> Result<()> {
    let mut standalone = Tracer::new(RefValue::from(model()), LocalBackend);
    let outside = standalone.input("x", RefValue::from(input()))?;

    let session = Session::new(RefValue::from(model()), LocalBackend);
    let tracer = session.trace();
    let err = tracer
        .root()
        .attr("fc1")?
        .call(args![&outside], kwargs! {})
        .expect_err("no shared bridge");
    assert!(matches!(err, TraceError::Unbridged { .. }), "got {err}");
    Ok(())
}

#[test]
fn sessions_refuse_to_run_with_open_tracers() -> Result<()> {
    let mut session = Session::new(RefValue::from(model()), LocalBackend);
    let open = session.trace();
    assert!(session.execute().is_err());

    drop(open);
    assert_eq!(session.bridge().depth(), 0);
    session.execute()?;
    Ok(())
}

#[test]
fn unconsumed_ties_keep_the_bridge_locked_until_abandoned() -> Result<()> {
    let mut session = Session::new(RefValue::from(model()), LocalBackend);
    let mut first = session.trace();
    let x = first.input("x", RefValue::from(input()))?;
    first.exit()?;

    // The consumer is recorded but never queued, so its tie is never consumed.
    let consumer = session.trace();
    let _doubled = (&x * RefValue::Float(2.0))?;
    drop(consumer);

    let err = session.execute().expect_err("tie left open");
    assert!(
        matches!(err, tracegraph::BackendError::BridgeLocked { locks: 1 }),
        "got {err}"
    );
    assert!(!session.bridge().release());

    assert_eq!(session.abandon_unqueued()?, 1);
    assert!(session.bridge().release());
    assert!(session.bridge().representations(x.node_ref()).is_empty());
    session.execute()?;
    assert_eq!(session.queued(), 0);
    Ok(())
}

#[test]
fn failed_operations_leave_no_bridge_node_behind() -> Result<()> {
    let model = model();
    let mut session = Session::new(RefValue::from(model.clone()), LocalBackend);
    let mut first = session.trace();
    let x = first.input("x", RefValue::from(input()))?;
    first.exit()?;

    let second = session.trace();
    let fc2 = second.root().attr("fc2")?;
    let before = second.graph().len();
    let err = fc2
        .call(args![&x], kwargs! {})
        .expect_err("fc2 expects the hidden width");
    assert!(matches!(err, TraceError::Structural { .. }), "got {err}");
    assert_eq!(second.graph().len(), before);
    assert!(session.bridge().representations(x.node_ref()).is_empty());

    // The next use bridges `x` afresh and runs normally.
    let doubled = (&x * RefValue::Float(2.0))?.save();
    assert_eq!(second.graph().len(), before + 2);
    assert_eq!(session.bridge().representations(x.node_ref()).len(), 1);
    second.exit()?;

    session.execute()?;
    let expected = RefValue::from(input()).binary(BinaryOp::Mul, &RefValue::Float(2.0))?;
    assert_eq!(doubled.value(), Some(expected));
    assert_eq!(session.bridge().locks(), 0);
    Ok(())
}

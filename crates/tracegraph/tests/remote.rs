mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use tracegraph::{
    args, kwargs, Arg, BackendError, BinaryOp, FunctionRef, Kwargs, LocalBackend,
    LoopbackTransport, Operator, RemoteBackend, RemoteConfig, RemoteExecutor, Session, Target,
    TracedValue, Tracer, WireEncoding,
};
use tracegraph::backend::wire::WireError;
use tracegraph_ref::{functions, RefValue};

use common::{eager, eager_member, input, model, tensor_data};

const MODEL_KEY: &str = "tiny_mlp";

fn executor(encoding: WireEncoding) -> Arc<RemoteExecutor<RefValue>> {
    Arc::new(
        RemoteExecutor::new(functions::registry(), encoding)
            .with_model(MODEL_KEY, RefValue::from(model())),
    )
}

fn remote(encoding: WireEncoding, latency: Option<Duration>) -> RemoteBackend<RefValue> {
    let mut transport = LoopbackTransport::new(executor(encoding));
    if let Some(latency) = latency {
        transport = transport.with_latency(latency);
    }
    let config = RemoteConfig {
        timeout_ms: 5_000,
        encoding,
    };
    RemoteBackend::new(MODEL_KEY, functions::registry(), Arc::new(transport)).with_config(config)
}

fn run_remote(encoding: WireEncoding) -> Result<()> {
    let model = model();
    let mut tracer = Tracer::new(RefValue::from(model.clone()), remote(encoding, None));
    let x = tracer.input("x", RefValue::from(input()))?;
    let out = tracer.root().call(args![&x], kwargs! {})?.save();
    let hidden = tracer.root().attr("hidden")?.call(args![&x], kwargs! {})?.save();
    let unsaved = tracer.root().attr("fc1")?.call(args![&x], kwargs! {})?;
    tracer.execute()?;

    assert_eq!(out.value(), Some(eager(&model, input())));
    let pre = eager_member(&model, "fc1", input());
    let activated = functions::relu().invoke(&[pre], &Kwargs::new())?;
    assert_eq!(hidden.value(), Some(activated));
    assert!(unsaved.value().is_none(), "only saved values come back");
    Ok(())
}

#[test]
fn remote_results_match_local_execution_over_json() -> Result<()> {
    run_remote(WireEncoding::Json)
}

#[test]
fn remote_results_match_local_execution_over_bincode() -> Result<()> {
    run_remote(WireEncoding::Bincode)
}

fn run_nested_arguments(encoding: WireEncoding) -> Result<()> {
    let mut tracer = Tracer::new(RefValue::from(model()), remote(encoding, None));
    let x = tracer.input("x", RefValue::from(input()))?;
    let step = tracer.literal(RefValue::Int(2))?;
    let length = x.len()?;
    let strided = x
        .get_item(Arg::slice(None, Some(Arg::from(&length)), Some(Arg::from(&step))))?
        .save();

    let prefix = tracer.literal(RefValue::List(vec![RefValue::Int(7)]))?;
    let joined = prefix
        .try_add(Arg::List(vec![Arg::from(&length), Arg::from(RefValue::Float(0.5))]))?
        .save();

    let width = tracer
        .graph()
        .add(
            RefValue::Int(3),
            Target::Op(Operator::GetItem),
            vec![
                Arg::Dict(kwargs! { "width" => &length }),
                Arg::from(RefValue::from("width")),
            ],
            Kwargs::new(),
        )?
        .save();

    tracer.execute()?;
    assert_eq!(tensor_data(&strided.value().expect("saved")), vec![1.0, 0.5]);
    assert_eq!(
        joined.value(),
        Some(RefValue::List(vec![
            RefValue::Int(7),
            RefValue::Int(3),
            RefValue::Float(0.5)
        ]))
    );
    assert_eq!(width.value(), Some(RefValue::Int(3)));
    Ok(())
}

#[test]
fn nested_arguments_survive_the_json_wire() -> Result<()> {
    run_nested_arguments(WireEncoding::Json)
}

#[test]
fn nested_arguments_survive_the_bincode_wire() -> Result<()> {
    run_nested_arguments(WireEncoding::Bincode)
}

#[test]
fn sessions_ship_every_graph_and_their_bridges() -> Result<()> {
    let model = model();
    let mut session = Session::new(
        RefValue::from(model.clone()),
        remote(WireEncoding::Json, None),
    );

    let mut first = session.trace();
    let x = first.input("x", RefValue::from(input()))?;
    let hidden = first.root().attr("fc1")?.call(args![&x], kwargs! {})?;
    first.exit()?;

    let second = session.trace();
    let doubled = (&hidden * RefValue::Float(2.0))?.save();
    second.exit()?;

    session.execute()?;
    let expected =
        eager_member(&model, "fc1", input()).binary(BinaryOp::Mul, &RefValue::Float(2.0))?;
    assert_eq!(doubled.value(), Some(expected));
    assert_eq!(session.bridge().locks(), 0);
    assert_eq!(session.queued(), 0);
    Ok(())
}

#[test]
fn iterating_graphs_return_every_iteration() -> Result<()> {
    let model = model();
    let items = vec![input(), input().map(|x| x * 2.0)];
    let mut tracer = Tracer::new(RefValue::from(model.clone()), LocalBackend);
    let item = tracer.iteration_input(items.iter().cloned().map(RefValue::from).collect())?;
    let out = tracer.root().call(args![&item], kwargs! {})?.save();
    tracer.set_backend(remote(WireEncoding::Bincode, None));
    tracer.execute()?;

    let expected: Vec<RefValue> = items.into_iter().map(|x| eager(&model, x)).collect();
    assert_eq!(out.iteration_values(), expected);
    Ok(())
}

#[test]
fn timeouts_are_recoverable_with_another_backend() -> Result<()> {
    let model = model();
    let backend = remote(WireEncoding::Json, Some(Duration::from_millis(200)))
        .with_timeout(Duration::from_millis(20));
    let mut tracer = Tracer::new(RefValue::from(model.clone()), backend);
    let x = tracer.input("x", RefValue::from(input()))?;
    let out = tracer.root().call(args![&x], kwargs! {})?.save();

    let err = tracer.execute().expect_err("transport is slower than the timeout");
    assert!(matches!(err, BackendError::Timeout(_)), "got {err}");
    assert!(err.is_recoverable());
    assert!(out.value().is_none());

    tracer.set_backend(LocalBackend);
    tracer.execute()?;
    assert_eq!(out.value(), Some(eager(&model, input())));
    Ok(())
}

#[test]
fn cancelled_requests_fail_without_touching_the_graph() -> Result<()> {
    let model = model();
    let backend = remote(WireEncoding::Json, Some(Duration::from_millis(200)));
    let token = backend.cancellation_token();
    let mut tracer = Tracer::new(RefValue::from(model.clone()), backend);
    let x = tracer.input("x", RefValue::from(input()))?;
    let out = tracer.root().call(args![&x], kwargs! {})?.save();

    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        token.cancel();
    });
    let err = tracer.execute().expect_err("request was cancelled in flight");
    canceller.join().expect("canceller thread");
    assert!(matches!(err, BackendError::Cancelled), "got {err}");
    assert!(err.is_recoverable());
    assert!(out.value().is_none());

    // The same backend serves the retry.
    tracer.execute()?;
    assert_eq!(out.value(), Some(eager(&model, input())));
    Ok(())
}

#[test]
fn cancelling_between_requests_does_not_affect_the_next_one() -> Result<()> {
    let model = model();
    let backend = remote(WireEncoding::Bincode, None);
    backend.cancel();
    backend.cancellation_token().cancel();

    let mut tracer = Tracer::new(RefValue::from(model.clone()), backend);
    let x = tracer.input("x", RefValue::from(input()))?;
    let out = tracer.root().call(args![&x], kwargs! {})?.save();
    tracer.execute()?;
    assert_eq!(out.value(), Some(eager(&model, input())));
    Ok(())
}

#[test]
fn functions_outside_the_whitelist_cannot_be_shipped() -> Result<()> {
    let negate = FunctionRef::new("negate", |args: &[RefValue], _: &Kwargs<RefValue>| {
        args[0].binary(BinaryOp::Mul, &RefValue::Float(-1.0))
    });
    let mut tracer = Tracer::new(RefValue::from(model()), remote(WireEncoding::Json, None));
    let x = tracer.input("x", RefValue::from(input()))?;
    let _negated = x.apply(&negate, Vec::new(), Kwargs::new())?.save();

    let err = tracer.execute().expect_err("negate is not registered");
    assert!(
        matches!(&err, BackendError::Wire(WireError::NotWhitelisted(name)) if name == "negate"),
        "got {err}"
    );
    assert!(!err.is_recoverable());
    Ok(())
}

#[test]
fn unknown_models_are_reported_by_the_executor() -> Result<()> {
    let transport = LoopbackTransport::new(executor(WireEncoding::Bincode));
    let backend = RemoteBackend::new("missing", functions::registry(), Arc::new(transport))
        .with_config(RemoteConfig {
            timeout_ms: 5_000,
            encoding: WireEncoding::Bincode,
        });
    let mut tracer = Tracer::new(RefValue::from(model()), backend);
    let x = tracer.input("x", RefValue::from(input()))?;
    tracer.root().call(args![&x], kwargs! {})?.save();

    let err = tracer.execute().expect_err("no model registered under `missing`");
    match &err {
        BackendError::Remote(message) => assert!(message.contains("missing"), "{message}"),
        other => panic!("expected a remote failure, got {other}"),
    }
    assert!(err.is_recoverable());
    Ok(())
}

#[tokio::test]
async fn async_execution_runs_inside_an_existing_runtime() -> Result<()> {
    let model = model();
    let backend = remote(WireEncoding::Json, None);

    let mut blocking = Tracer::new(
        RefValue::from(model.clone()),
        remote(WireEncoding::Json, None),
    );
    let x = blocking.input("x", RefValue::from(input()))?;
    blocking.root().call(args![&x], kwargs! {})?.save();
    let err = blocking.execute().expect_err("cannot block inside the runtime");
    assert!(matches!(err, BackendError::Execution { .. }), "got {err}");

    let mut tracer = Tracer::new(RefValue::from(model.clone()), LocalBackend);
    let x = tracer.input("x", RefValue::from(input()))?;
    let out = tracer.root().call(args![&x], kwargs! {})?.save();
    backend.execute_async(&mut tracer).await?;

    assert_eq!(out.value(), Some(eager(&model, input())));
    Ok(())
}

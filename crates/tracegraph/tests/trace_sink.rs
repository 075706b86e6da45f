//! The sink is process-wide, so this binary holds a single test.

mod common;

use std::sync::{Arc, Mutex};

use anyhow::Result;
use tracegraph::trace::{self, ExecutionTraceSink, GraphRunContext, GraphRunStats, RunStatus};
use tracegraph::{args, kwargs, IteratorBackend, LocalBackend, TraceConfig, Tracer};
use tracegraph_ref::{RefTensor, RefValue};

use common::{input, model};

#[derive(Default)]
struct CollectingSink {
    started: Mutex<Vec<GraphRunContext>>,
    finished: Mutex<Vec<(u64, Option<usize>, usize, RunStatus)>>,
}

impl ExecutionTraceSink for CollectingSink {
    fn before_graph(&self, context: &GraphRunContext) {
        self.started
            .lock()
            .expect("sink mutex poisoned")
            .push(context.clone());
    }

    fn after_graph(&self, context: &GraphRunContext, stats: &GraphRunStats) {
        self.finished.lock().expect("sink mutex poisoned").push((
            context.trace_id,
            context.iteration,
            stats.executed,
            stats.status.clone(),
        ));
    }
}

#[test]
fn sink_observes_every_graph_run() -> Result<()> {
    let sink = Arc::new(CollectingSink::default());
    trace::install_sink(sink.clone());

    let mut tracer = Tracer::new(RefValue::from(model()), LocalBackend);
    let x = tracer.input("x", RefValue::from(input()))?;
    tracer.root().call(args![&x], kwargs! {})?.save();
    let nodes = tracer.graph().len();
    tracer.execute()?;

    let items = vec![
        RefValue::from(RefTensor::from_vec(vec![1.0, 0.0, 0.0])),
        RefValue::from(RefTensor::from_vec(vec![0.0, 1.0, 0.0])),
    ];
    let mut iterating = Tracer::new(RefValue::from(model()), IteratorBackend);
    let item = iterating.iteration_input(items)?;
    iterating.root().call(args![&item], kwargs! {})?.save();
    iterating.execute()?;

    let config = TraceConfig::default().with_validation(false);
    let mut failing = Tracer::with_config(RefValue::from(model()), LocalBackend, &config);
    let x = failing.input("x", RefValue::from(input()))?;
    failing.root().attr("fc2")?.call(args![&x], kwargs! {})?;
    assert!(failing.execute().is_err());

    trace::clear_sink();

    let started = sink.started.lock().expect("sink mutex poisoned").clone();
    let finished = sink.finished.lock().expect("sink mutex poisoned").clone();
    assert_eq!(started.len(), 4);
    assert_eq!(finished.len(), 4);

    assert_eq!(started[0].graph, tracer.graph().id());
    assert_eq!(started[0].backend, "local");
    assert_eq!(started[0].nodes, nodes);
    assert_eq!(finished[0].2, nodes);
    assert_eq!(finished[0].3, RunStatus::Success);

    assert_eq!(started[1].backend, "iterator");
    let iterations: Vec<Option<usize>> = finished[1..3].iter().map(|run| run.1).collect();
    assert_eq!(iterations, vec![Some(0), Some(1)]);

    match &finished[3].3 {
        RunStatus::Failure { message } => assert!(message.contains("__call__"), "{message}"),
        other => panic!("expected a failed run, got {other:?}"),
    }
    assert!(finished[3].2 < failing.graph().len());

    let ids: Vec<u64> = started.iter().map(|run| run.trace_id).collect();
    assert!(ids.windows(2).all(|pair| pair[0] < pair[1]), "{ids:?}");
    assert!(started.iter().zip(&finished).all(|(s, f)| s.trace_id == f.0));

    // Nothing is observed once the sink is cleared.
    let mut quiet = Tracer::new(RefValue::from(model()), LocalBackend);
    let x = quiet.input("x", RefValue::from(input()))?;
    quiet.root().call(args![&x], kwargs! {})?;
    quiet.execute()?;
    assert_eq!(sink.started.lock().expect("sink mutex poisoned").len(), 4);
    Ok(())
}

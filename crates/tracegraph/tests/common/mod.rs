#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use tracegraph::{Backend, BackendResult, Kwargs, TracedValue, Tracer};
use tracegraph_ref::{models, RefModule, RefTensor, RefValue};

/// Test-only backend that records the target names of every graph it is handed and runs
/// nothing.
#[derive(Clone, Default)]
pub struct RecordingBackend {
    graphs: Arc<Mutex<Vec<Vec<String>>>>,
}

impl RecordingBackend {
    pub fn recorded(&self) -> Vec<Vec<String>> {
        self.graphs.lock().expect("recording mutex poisoned").clone()
    }

    pub fn last_targets_or_panic(&self) -> Vec<String> {
        self.recorded()
            .pop()
            .expect("backend should have recorded a graph")
    }
}

impl Backend<Tracer<RefValue>> for RecordingBackend {
    fn backend_name(&self) -> &str {
        "recording"
    }

    fn execute(&self, context: &mut Tracer<RefValue>) -> BackendResult<()> {
        let targets = context
            .graph()
            .nodes()
            .iter()
            .map(|node| node.target().name())
            .collect();
        self.graphs
            .lock()
            .expect("recording mutex poisoned")
            .push(targets);
        Ok(())
    }
}

pub fn model() -> Arc<RefModule> {
    models::tiny_mlp()
}

pub fn input() -> RefTensor {
    RefTensor::from_vec(vec![1.0, -2.0, 0.5])
}

/// Runs `model` directly on `x`, without tracing.
pub fn eager(model: &Arc<RefModule>, x: RefTensor) -> RefValue {
    model
        .forward(&[RefValue::from(x)], &Kwargs::new())
        .expect("eager forward")
}

pub fn eager_member(model: &Arc<RefModule>, member: &str, x: RefTensor) -> RefValue {
    model
        .require(member)
        .expect("member exists")
        .call(&[RefValue::from(x)], &Kwargs::new())
        .expect("eager member call")
}

pub fn tensor_data(value: &RefValue) -> Vec<f64> {
    value
        .as_tensor()
        .expect("tensor value")
        .data()
        .expect("materialised tensor")
        .to_vec()
}

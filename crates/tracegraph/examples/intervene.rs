use anyhow::Result;
use serde_json::json;
use tracegraph::{args, kwargs, Kwargs, LocalBackend, Session, TraceConfig, Tracer};
use tracegraph_ref::{functions, models, RefTensor, RefValue};

fn main() -> Result<()> {
    let config: TraceConfig = serde_json::from_value(json!({ "validate": true }))?;
    let model = models::tiny_mlp();
    let x = RefValue::from(RefTensor::from_vec(vec![1.0, -2.0, 0.5]));

    let mut tracer = Tracer::with_config(RefValue::from(model.clone()), LocalBackend, &config);
    let input = tracer.input("x", x.clone())?;
    let hidden = tracer.root().attr("fc1")?.call(args![&input], kwargs! {})?.save();
    let silenced = hidden.apply(&functions::zeros_like(), Vec::new(), Kwargs::new())?;
    let out = tracer.root().attr("fc2")?.call(args![&silenced], kwargs! {})?.save();
    println!("traced {} nodes", tracer.graph().len());
    tracer.exit()?;
    println!("fc1 output: {:?}", hidden.value());
    println!("output with fc1 zeroed: {:?}", out.value());

    let mut session = Session::with_config(RefValue::from(model), LocalBackend, config);
    let mut first = session.trace();
    let input = first.input("x", x)?;
    let logits = first.root().call(args![&input], kwargs! {})?;
    first.exit()?;

    let second = session.trace();
    let total = logits.apply(&functions::sum(), Vec::new(), Kwargs::new())?.save();
    second.exit()?;
    session.execute()?;
    println!("sum of logits read across graphs: {:?}", total.value());

    Ok(())
}

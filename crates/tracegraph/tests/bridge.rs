use std::sync::Arc;

use tracegraph::{BackendError, Bridge, Graph, GraphId, NodeId, NodeRef, TraceError};
use tracegraph_ref::RefValue;

fn bridge_with_two_graphs() -> (Arc<Bridge<RefValue>>, Arc<Graph<RefValue>>, Arc<Graph<RefValue>>) {
    let bridge = Bridge::new();
    let first = Graph::new(true);
    let second = Graph::new(true);
    bridge.add(&first);
    bridge.add(&second);
    (bridge, first, second)
}

#[test]
fn stack_tracks_the_innermost_graph() {
    let bridge = Bridge::<RefValue>::new();
    let outer = Graph::new(true);
    let inner = Graph::new(true);

    bridge.add(&outer);
    assert_eq!(bridge.peek_graph().id(), outer.id());
    bridge.add(&inner);
    assert_eq!(bridge.peek_graph().id(), inner.id());
    assert_eq!(bridge.depth(), 2);

    assert_eq!(bridge.pop_graph().id(), inner.id());
    assert_eq!(bridge.peek_graph().id(), outer.id());
    assert_eq!(bridge.pop_graph().id(), outer.id());
    assert!(bridge.try_peek_graph().is_none());

    // Registrations outlive the stack.
    assert!(bridge.get_graph(inner.id()).is_some());
    assert!(bridge.get_graph(GraphId(u64::MAX)).is_none());
    assert!(Arc::ptr_eq(
        &inner.bridge().expect("graph is tagged"),
        &bridge
    ));
}

#[test]
fn scopes_pop_when_dropped() {
    let bridge = Bridge::<RefValue>::new();
    let graph = Graph::new(true);
    {
        let scope = bridge.enter(&graph);
        assert_eq!(scope.graph(), graph.id());
        assert_eq!(bridge.depth(), 1);
    }
    assert_eq!(bridge.depth(), 0);
}

#[test]
#[should_panic(expected = "empty graph stack")]
fn peeking_an_empty_stack_panics() {
    Bridge::<RefValue>::new().peek_graph();
}

#[test]
#[should_panic(expected = "empty graph stack")]
fn popping_an_empty_stack_panics() {
    Bridge::<RefValue>::new().pop_graph();
}

#[test]
fn bridge_nodes_are_found_per_consuming_graph() {
    let (bridge, first, second) = bridge_with_two_graphs();
    let x = NodeRef::new(first.id(), NodeId(0));
    let y = NodeRef::new(second.id(), NodeId(3));

    assert_eq!(bridge.get_bridge_node(x, second.id()), None);
    bridge.add_bridge_node(x, y).expect("first representation");
    assert_eq!(bridge.get_bridge_node(x, second.id()), Some(y));
    assert_eq!(bridge.get_bridge_node(x, GraphId(999)), None);
    assert_eq!(bridge.representations(x), vec![y]);
}

#[test]
fn a_second_representation_in_one_graph_is_rejected() {
    let (bridge, first, second) = bridge_with_two_graphs();
    let x = NodeRef::new(first.id(), NodeId(0));
    bridge
        .add_bridge_node(x, NodeRef::new(second.id(), NodeId(1)))
        .expect("first representation");

    let err = bridge
        .add_bridge_node(x, NodeRef::new(second.id(), NodeId(2)))
        .expect_err("duplicate representation");
    assert!(matches!(err, TraceError::DuplicateBridgeNode { .. }), "got {err}");
    assert_eq!(
        bridge.get_bridge_node(x, second.id()),
        Some(NodeRef::new(second.id(), NodeId(1)))
    );
}

#[test]
fn registration_order_is_temporal_order() {
    let (bridge, first, second) = bridge_with_two_graphs();
    assert!(bridge.precedes(first.id(), second.id()));
    assert!(!bridge.precedes(second.id(), first.id()));
    assert!(!bridge.precedes(first.id(), GraphId(u64::MAX)));
    let order: Vec<GraphId> = bridge.graphs().iter().map(|graph| graph.id()).collect();
    assert_eq!(order, vec![first.id(), second.id()]);
}

#[test]
fn release_tracks_the_lock_count() {
    let bridge = Bridge::<RefValue>::new();
    assert!(bridge.release());
    bridge.lock();
    assert_eq!(bridge.locks(), 1);
    assert!(!bridge.release());
    bridge.unlock();
    assert!(bridge.release());
}

#[test]
#[should_panic(expected = "unlocked more often than locked")]
fn unlocking_below_zero_panics() {
    Bridge::<RefValue>::new().unlock();
}

#[test]
fn teardown_waits_for_release() {
    let (bridge, _first, _second) = bridge_with_two_graphs();
    bridge.pop_graph();
    bridge.pop_graph();
    bridge.lock();

    let err = bridge.teardown().expect_err("bridge is locked");
    assert!(matches!(err, BackendError::BridgeLocked { locks: 1 }), "got {err}");

    bridge.unlock();
    bridge.teardown().expect("released bridge tears down");
    assert!(bridge.graphs().is_empty());
}

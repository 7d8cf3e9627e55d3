use hive_core::ConnectionPhase;
use hive_services::MeshEvent;

use crate::*;

#[test]
fn test_three_nodes_form_a_full_mesh() {
    let mut mesh = Mesh::with_defaults();
    for name in ["a", "b", "c"] {
        mesh.join(name);
    }
    mesh.settle();

    for (x, y) in [("a", "b"), ("a", "c"), ("b", "c")] {
        assert!(mesh.is_linked(x, y), "{x} and {y} should be linked");
    }
    for name in ["a", "b", "c"] {
        let node = mesh.node(name);
        assert_eq!(node.connections().connected_peers().len(), 2, "{name}");
        assert_eq!(node.self_id(), Some(&id(name)));
    }
}

#[test]
fn test_request_glare_yields_one_offer_per_pair() {
    let mut mesh = Mesh::with_defaults();
    for name in ["a", "b", "c"] {
        mesh.join(name);
    }
    mesh.settle();

    let offers: usize = ["a", "b", "c"]
        .iter()
        .map(|n| mesh.peer(n).offers_created)
        .sum();
    assert_eq!(offers, 3);
    // The higher id answers the lower id's request.
    assert_eq!(mesh.peer("a").offers_created, 0);
    assert_eq!(mesh.peer("c").offers_created, 2);
}

#[test]
fn test_repeated_candidates_are_added_once() {
    let mesh = connected_mesh(&["a", "b", "c"]);
    for name in ["a", "b", "c"] {
        assert_eq!(mesh.peer(name).candidates_added, 2, "{name}");
    }
}

#[test]
fn test_late_joiner_connects_to_everyone() {
    let mut mesh = Mesh::with_defaults();
    mesh.join("a");
    mesh.join("b");
    mesh.settle();
    assert!(mesh.is_linked("a", "b"));

    mesh.join("c");
    mesh.settle();
    assert!(mesh.is_linked("a", "c"));
    assert!(mesh.is_linked("b", "c"));

    let connected = mesh.peer("a").events.iter().any(|e| {
        matches!(e, MeshEvent::ConnectionState { node, state }
            if *node == id("c") && state.connection == ConnectionPhase::Connected)
    });
    assert!(connected, "a should report c as connected");
}

#[test]
fn test_departed_peer_is_forgotten() {
    let mut mesh = connected_mesh(&["a", "b", "c"]);
    mesh.leave("c");
    mesh.settle();

    for name in ["a", "b"] {
        let node = mesh.node(name);
        assert!(node.connections().state(&id("c")).is_none(), "{name}");
        assert!(!node.scheduler().contains(&id("c")), "{name}");
        assert!(mesh
            .peer(name)
            .events
            .contains(&MeshEvent::NodeRemoved(id("c"))));
    }
    assert!(mesh.is_linked("a", "b"));
}

#[test]
fn test_peers_learn_each_others_module_state() {
    let mesh = connected_mesh(&["a", "b"]);
    let seen = mesh
        .node("a")
        .scheduler()
        .module_state(&id("b"))
        .expect("a tracks b");
    assert_eq!(seen.benchmark, 1.0);
}

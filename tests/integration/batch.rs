use std::collections::BTreeSet;

use hive_services::MeshEvent;

use crate::*;

#[test]
fn test_batch_is_spread_over_the_mesh_and_completes() {
    let mut mesh = connected_mesh(&["a", "b", "c"]);

    let receipt = mesh.submit("a", files(9));
    assert_eq!(receipt.task_ids.len(), 9);
    assert_eq!(receipt.batch_total, 9);
    mesh.settle();

    let results = &mesh.peer("a").results;
    assert_eq!(results.len(), 9);
    for (i, task_id) in receipt.task_ids.iter().enumerate() {
        let done = results.get(task_id).expect("result stored");
        assert_eq!(&done.output[..], format!("PAYLOAD {i}").as_bytes());
        assert_eq!(done.name, format!("task-{i}.txt"));
    }

    let workers: BTreeSet<_> = results.list().into_iter().map(|r| r.node).collect();
    assert_eq!(workers.len(), 3, "every node should have worked: {workers:?}");

    let progress = mesh.node("a").scheduler().progress(mesh.now());
    assert!(progress.finished);
    assert_eq!(progress.complete, 9);
    assert_eq!(progress.pending, 0);

    let reports: Vec<_> = mesh
        .peer("a")
        .events
        .iter()
        .filter_map(|e| match e {
            MeshEvent::BatchComplete(report) => Some(report.tasks),
            _ => None,
        })
        .collect();
    assert_eq!(reports, vec![9]);
}

#[test]
fn test_nodes_without_benchmark_get_no_work() {
    let mut mesh = Mesh::with_defaults();
    for name in ["a", "b", "c"] {
        mesh.join(name);
    }
    mesh.settle();
    mesh.benchmark("a", 1.0);
    mesh.benchmark("b", 1.0);
    mesh.settle();

    mesh.submit("a", files(6));
    mesh.settle();

    let results = mesh.peer("a").results.list();
    assert_eq!(results.len(), 6);
    assert!(results.iter().all(|r| r.node != id("c")));
    assert_eq!(mesh.node("c").module_state().queued, 0);
    assert_eq!(mesh.node("c").module_state().complete, 0);
}

#[test]
fn test_lone_node_runs_its_own_batch() {
    let mut mesh = Mesh::with_defaults();
    mesh.join("a");
    mesh.settle();
    mesh.benchmark("a", 1.0);

    mesh.submit("a", files(3));
    mesh.settle();

    let results = mesh.peer("a").results.list();
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|r| r.node == id("a")));
    let state = mesh.node("a").module_state();
    assert_eq!((state.queued, state.complete), (3, 3));
}

#[test]
fn test_tasks_wait_for_a_capable_node() {
    let mut mesh = Mesh::with_defaults();
    mesh.join("a");
    mesh.settle();

    mesh.submit("a", files(2));
    mesh.settle();
    let progress = mesh.node("a").scheduler().progress(mesh.now());
    assert_eq!((progress.pending, progress.complete), (2, 0));

    mesh.benchmark("a", 0.5);
    mesh.settle();
    let progress = mesh.node("a").scheduler().progress(mesh.now());
    assert_eq!((progress.pending, progress.complete), (0, 2));
    assert!(progress.finished);
}

#[test]
fn test_new_batch_after_completion_starts_fresh() {
    let mut mesh = Mesh::with_defaults();
    mesh.join("a");
    mesh.settle();
    mesh.benchmark("a", 1.0);

    mesh.submit("a", files(2));
    mesh.settle();
    assert_eq!(mesh.peer("a").results.len(), 2);

    let receipt = mesh.submit("a", vec![file("again.txt", b"again")]);
    assert_eq!(receipt.batch_total, 1);
    mesh.settle();

    let results = mesh.peer("a").results.list();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].name, "again.txt");
}

#[test]
fn test_submitted_before_identity_still_runs() {
    let mut mesh = Mesh::with_defaults();
    mesh.join("a");
    // Identity not processed yet.
    let receipt = mesh.submit("a", files(1));
    mesh.settle();
    mesh.benchmark("a", 1.0);
    mesh.settle();

    let done = mesh.peer("a").results.get(&receipt.task_ids[0]);
    assert!(done.is_some());
}

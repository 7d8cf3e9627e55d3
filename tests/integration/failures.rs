use hive_core::ConnectionPhase;
use hive_services::scheduler::MAX_TASK_FAILURES;

use crate::*;

#[test]
fn test_disconnected_worker_tasks_are_reoffered() {
    let mut mesh = connected_mesh(&["a", "b", "c"]);
    mesh.auto_compute = false;

    mesh.submit("a", files(6));
    mesh.settle();
    for name in ["a", "b", "c"] {
        assert_eq!(mesh.node("a").scheduler().assigned_to(&id(name)), 2, "{name}");
    }

    mesh.cut("a", "b");
    mesh.settle();
    let scheduler = mesh.node("a").scheduler();
    assert_eq!(scheduler.assigned_to(&id("b")), 0);
    // a and c are at their threshold, so b's two tasks wait.
    assert_eq!(scheduler.progress(mesh.now()).pending, 2);

    mesh.auto_compute = true;
    mesh.run_jobs("a");
    mesh.run_jobs("c");
    mesh.settle();

    let results = mesh.peer("a").results.list();
    assert_eq!(results.len(), 6);
    assert!(results.iter().all(|r| r.node != id("b")));
    assert!(mesh.node("a").scheduler().progress(mesh.now()).finished);
}

#[test]
fn test_worker_leaving_mid_batch_hands_back_its_tasks() {
    let mut mesh = connected_mesh(&["a", "b"]);
    mesh.auto_compute = false;

    mesh.submit("a", files(4));
    mesh.settle();
    assert_eq!(mesh.node("a").scheduler().assigned_to(&id("b")), 2);

    mesh.leave("b");
    mesh.settle();
    assert!(!mesh.node("a").scheduler().contains(&id("b")));
    assert_eq!(mesh.node("a").scheduler().progress(mesh.now()).pending, 2);

    mesh.auto_compute = true;
    mesh.settle();
    let results = mesh.peer("a").results.list();
    assert_eq!(results.len(), 4);
    assert!(results.iter().all(|r| r.node == id("a")));
}

#[test]
fn test_failing_task_is_abandoned_after_retries() {
    let mut mesh = connected_mesh(&["a", "b"]);

    let receipt = mesh.submit(
        "a",
        vec![
            file(&format!("{FAILING_PREFIX}-poisoned.txt"), b"x"),
            file("fine.txt", b"y"),
        ],
    );
    mesh.settle();

    let scheduler = mesh.node("a").scheduler();
    let poisoned = scheduler.task(&receipt.task_ids[0]).expect("task kept");
    assert!(poisoned.is_abandoned());
    assert_eq!(poisoned.failures, MAX_TASK_FAILURES);

    let progress = scheduler.progress(mesh.now());
    assert_eq!((progress.complete, progress.abandoned), (1, 1));
    assert!(!progress.finished);

    let fine = mesh.peer("a").results.get(&receipt.task_ids[1]).expect("stored");
    assert_eq!(&fine.output[..], b"Y");
}

#[test]
fn test_result_after_disconnect_is_not_delivered() {
    let mut mesh = connected_mesh(&["a", "b"]);
    mesh.auto_compute = false;

    mesh.submit("a", files(4));
    mesh.settle();
    mesh.cut("a", "b");
    mesh.settle();

    // b finishes work it was given before the cut; nowhere to send it.
    mesh.run_jobs("b");
    mesh.settle();
    assert!(mesh
        .peer("a")
        .results
        .list()
        .iter()
        .all(|r| r.node != id("b")));
}

#[test]
fn test_failed_link_hands_back_its_tasks() {
    let mut mesh = connected_mesh(&["a", "b"]);
    mesh.auto_compute = false;

    mesh.submit("a", files(4));
    mesh.settle();
    assert_eq!(mesh.node("a").scheduler().assigned_to(&id("b")), 2);

    mesh.fail_link("a", "b", "send failed: outbound packet too large");
    mesh.settle();
    assert!(!mesh.is_linked("a", "b"));
    for (at, peer) in [("a", "b"), ("b", "a")] {
        let state = mesh.node(at).connections().state(&id(peer)).expect("tracked");
        assert_eq!(state.connection, ConnectionPhase::Closed, "{at}");
    }
    let scheduler = mesh.node("a").scheduler();
    assert_eq!(scheduler.assigned_to(&id("b")), 0);
    assert_eq!(scheduler.progress(mesh.now()).pending, 2);

    mesh.auto_compute = true;
    mesh.settle();
    let results = mesh.peer("a").results.list();
    assert_eq!(results.len(), 4);
    assert!(results.iter().all(|r| r.node == id("a")));
    assert!(mesh.node("a").scheduler().progress(mesh.now()).finished);
}

#[test]
fn test_out_of_order_answer_closes_the_connection() {
    let mut mesh = connected_mesh(&["a", "b"]);

    // a requested b, so a never sent an offer b could answer.
    let answer = Blob(serde_json::json!({ "type": "answer", "sdp": "b" }));
    mesh.relay("b", "a", SignalBody::NegotiationAnswer(answer));
    mesh.settle();

    let state = mesh.node("a").connections().state(&id("b")).expect("tracked");
    assert_eq!(state.connection, ConnectionPhase::Closed);
    assert!(!mesh.is_linked("a", "b"));
    assert!(mesh.node("a").scheduler().scheduling_state(&id("b")).is_none());
}

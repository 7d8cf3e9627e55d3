use crate::*;

fn small_chunks() -> HiveConfig {
    let mut config = HiveConfig::default();
    config.transport.chunk_size = 1024;
    config
}

#[test]
fn test_large_payload_is_chunked_both_ways() {
    let mut mesh = Mesh::new(small_chunks());
    mesh.join("a");
    mesh.join("b");
    mesh.settle();
    // Only b may compute, so the payload has to cross the link.
    mesh.benchmark("b", 1.0);
    mesh.settle();

    let payload: Vec<u8> = (0..10_000).map(|i| b'a' + (i % 26) as u8).collect();
    let receipt = mesh.submit("a", vec![file("big.txt", &payload)]);
    mesh.settle();

    let done = mesh
        .peer("a")
        .results
        .get(&receipt.task_ids[0])
        .expect("result stored");
    assert_eq!(done.node, id("b"));
    assert_eq!(done.output.len(), payload.len());
    assert_eq!(&done.output[..], &payload.to_ascii_uppercase()[..]);

    for name in ["a", "b"] {
        let status = mesh.node(name).status(mesh.now());
        assert_eq!(status.transfers_in_flight, 0, "{name}");
    }
}

#[test]
fn test_chunked_transfers_measure_link_speed() {
    let mut mesh = Mesh::new(small_chunks());
    mesh.join("a");
    mesh.join("b");
    mesh.settle();
    mesh.benchmark("b", 1.0);
    mesh.settle();

    let speed_of = |mesh: &Mesh, at: &str, peer: &str| {
        mesh.node(at)
            .connections()
            .state(&id(peer))
            .and_then(|s| s.speed)
    };
    assert!(speed_of(&mesh, "a", "b").is_none());

    mesh.submit("a", vec![file("big.txt", &[7u8; 8_000])]);
    mesh.settle();

    let a_to_b = speed_of(&mesh, "a", "b").expect("a measured b");
    let b_to_a = speed_of(&mesh, "b", "a").expect("b measured a");
    assert!(a_to_b > 0.0 && a_to_b.is_finite());
    assert!(b_to_a > 0.0 && b_to_a.is_finite());
}

#[test]
fn test_small_messages_need_no_reassembly() {
    let mut mesh = connected_mesh(&["a", "b"]);
    mesh.submit("a", files(4));
    mesh.settle();

    assert_eq!(mesh.peer("a").results.len(), 4);
    // Nothing was chunked, so nothing was timed.
    let state = mesh.node("a").connections().state(&id("b")).expect("tracked");
    assert!(state.speed.is_none());
}

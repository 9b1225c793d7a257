//! Route propagation scenarios: linear flooding with longest-prefix
//! refinement, triangle loop suppression, and connection supersession.

mod support;

use support::{agent, link, settle};

#[tokio::test]
async fn linear_propagation_longest_prefix_wins() {
    let a = agent("a", &[]);
    let b = agent("b", &[]);
    let c = agent("c", &["10.0.0.0/8", "10.1.0.0/16"]);

    link(&a, &b).await;
    link(&b, &c).await;
    settle().await;

    let table = a.routing().table();

    // The broad prefix arrives via B at metric 2 with the visited path.
    let broad = table.lookup_ip("10.2.3.4".parse().unwrap()).expect("/8 route");
    assert_eq!(broad.via, b.id());
    assert_eq!(broad.metric, 2);
    assert_eq!(broad.origin, c.id());
    assert_eq!(broad.path, vec![c.id(), b.id()]);

    // A more specific prefix shadows it for addresses it covers.
    let narrow = table.lookup_ip("10.1.2.3".parse().unwrap()).expect("/16 route");
    match &narrow.dest {
        trellis::routing::RouteDest::Cidr(prefix) => assert_eq!(prefix.len(), 16),
        other => panic!("expected cidr, got {other}"),
    }

    a.shutdown().await;
    b.shutdown().await;
    c.shutdown().await;
}

#[tokio::test]
async fn triangle_floods_once_and_stabilizes() {
    let a = agent("a", &[]);
    let b = agent("b", &[]);
    let c = agent("c", &["10.0.0.0/8"]);

    link(&a, &b).await;
    link(&a, &c).await;
    link(&b, &c).await;
    settle().await;

    // Each non-origin node converges on exactly two candidates: the
    // direct hop and the one-removed hop. Nothing circulates further.
    let a_entries = a.routing().table().len();
    let b_entries = b.routing().table().len();
    assert_eq!(a_entries, 2, "a sees direct and indirect routes");
    assert_eq!(b_entries, 2, "b sees direct and indirect routes");

    // The direct route wins the lookup on metric.
    let table = a.routing().table();
    let best = table.lookup_ip("10.0.0.1".parse().unwrap()).unwrap();
    assert_eq!(best.via, c.id());
    assert_eq!(best.metric, 1);

    settle().await;
    assert_eq!(a.routing().table().len(), 2, "table is stable");

    a.shutdown().await;
    b.shutdown().await;
    c.shutdown().await;
}

#[tokio::test]
async fn duplicate_connection_supersedes_older() {
    let a = agent("a", &[]);
    let b = agent("b", &[]);

    let (first, _) = link(&a, &b).await;
    let (second, _) = link(&a, &b).await;
    settle().await;

    assert!(first.is_closed(), "older connection is torn down");
    assert!(!second.is_closed(), "newer connection survives");
    // Exactly one live registration remains for the pair.
    assert_eq!(a.registry().len(), 1);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn withdrawal_removes_propagated_route() {
    let a = agent("a", &[]);
    let b = agent("b", &[]);
    let c = agent("c", &["172.16.0.0/12"]);

    link(&a, &b).await;
    link(&b, &c).await;
    settle().await;
    assert!(a
        .routing()
        .table()
        .lookup_ip("172.16.5.5".parse().unwrap())
        .is_some());

    // C withdraws its route set; the withdrawal floods the same way.
    let withdrawal = c
        .routing()
        .local_withdrawal(c.routing().local_routes())
        .expect("withdrawal flood");
    // Broadcast through the same dispatcher path an expiry would use.
    for peer in c.registry().list() {
        let payload = trellis::frame::encode_cbor(&withdrawal).unwrap();
        peer.send_control(trellis::frame::Frame::control(
            trellis::frame::FrameType::RouteWithdraw,
            payload,
        ))
        .unwrap();
    }
    settle().await;

    assert!(
        a.routing()
            .table()
            .lookup_ip("172.16.5.5".parse().unwrap())
            .is_none(),
        "withdrawal reaches the far end of the chain"
    );

    a.shutdown().await;
    b.shutdown().await;
    c.shutdown().await;
}

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{start_server, start_server_with, Args};
use geerpc_core::{
    Discovery, MultiServerDiscovery, Options, RpcError, SelectMode, Service, XClient,
};

async fn two_server_discovery() -> Arc<MultiServerDiscovery> {
    let addr1 = start_server().await;
    let addr2 = start_server().await;
    Arc::new(MultiServerDiscovery::new(vec![
        format!("tcp@{addr1}"),
        format!("tcp@{addr2}"),
    ]))
}

#[tokio::test]
async fn call_routes_through_discovery() {
    let discovery = two_server_discovery().await;
    let xclient = XClient::new(discovery, SelectMode::RoundRobin, Options::default());

    // A few rounds so both endpoints get dialed.
    for i in 0..4i64 {
        let reply: i64 = xclient
            .call("Foo.Sum", &Args { num1: i, num2: i * i })
            .await
            .unwrap();
        assert_eq!(reply, i + i * i);
    }
}

#[tokio::test]
async fn broadcast_returns_the_first_successful_reply() {
    let discovery = two_server_discovery().await;
    let xclient = XClient::new(discovery, SelectMode::Random, Options::default());

    let reply: i64 = xclient
        .broadcast("Foo.Sum", &Args { num1: 1, num2: 2 })
        .await
        .unwrap();
    assert_eq!(reply, 3);
}

#[tokio::test]
async fn broadcast_surfaces_the_first_error() {
    let ok = start_server().await;
    let failing = start_server_with(
        Service::builder("Foo")
            .method("Sum", |_args: Args| async move {
                Err::<i64, _>("boom".to_string())
            })
            .build(),
    )
    .await;
    let discovery = Arc::new(MultiServerDiscovery::new(vec![
        format!("tcp@{ok}"),
        format!("tcp@{failing}"),
    ]));
    let xclient = XClient::new(discovery, SelectMode::Random, Options::default());

    let err = xclient
        .broadcast::<_, i64>("Foo.Sum", &Args { num1: 1, num2: 2 })
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "boom");
}

#[tokio::test]
async fn broadcast_under_a_caller_deadline_cancels_in_flight_calls() {
    let discovery = two_server_discovery().await;
    let xclient = XClient::new(discovery, SelectMode::Random, Options::default());

    let started = Instant::now();
    let timed_out = tokio::time::timeout(
        Duration::from_secs(2),
        xclient.broadcast::<_, i64>("Foo.Sleep", &Args { num1: 3, num2: 0 }),
    )
    .await;
    let elapsed = started.elapsed();

    assert!(timed_out.is_err(), "expected the deadline to win");
    assert!(
        elapsed < Duration::from_millis(2500),
        "broadcast returned after {elapsed:?}, expected ~2s"
    );
}

#[tokio::test]
async fn sessions_are_pooled_per_endpoint() {
    let addr = start_server().await;
    let endpoint = format!("tcp@{addr}");
    let discovery = Arc::new(MultiServerDiscovery::new(vec![endpoint.clone()]));
    let xclient = XClient::new(discovery, SelectMode::RoundRobin, Options::default());

    for _ in 0..3 {
        let reply: i64 = xclient
            .call_addr(&endpoint, "Foo.Sum", &Args { num1: 1, num2: 1 })
            .await
            .unwrap();
        assert_eq!(reply, 2);
    }
}

#[tokio::test]
async fn endpoints_without_a_network_tag_are_rejected() {
    let addr = start_server().await;
    let discovery = Arc::new(MultiServerDiscovery::new(vec![addr]));
    let xclient = XClient::new(discovery, SelectMode::Random, Options::default());

    let err = xclient
        .call::<_, i64>("Foo.Sum", &Args { num1: 1, num2: 1 })
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::InvalidEndpoint(_)));
}

#[tokio::test]
async fn operations_after_close_fail_with_shutdown() {
    let discovery = two_server_discovery().await;
    let xclient = XClient::new(discovery, SelectMode::Random, Options::default());

    let reply: i64 = xclient
        .call("Foo.Sum", &Args { num1: 1, num2: 1 })
        .await
        .unwrap();
    assert_eq!(reply, 2);

    xclient.close().await.unwrap();
    let err = xclient
        .call::<_, i64>("Foo.Sum", &Args { num1: 1, num2: 1 })
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Shutdown));
}

#[tokio::test]
async fn broadcast_over_no_endpoints_is_a_discovery_error() {
    let discovery = Arc::new(MultiServerDiscovery::new(Vec::new()));
    let xclient = XClient::new(discovery, SelectMode::Random, Options::default());

    let err = xclient
        .broadcast::<_, i64>("Foo.Sum", &Args { num1: 1, num2: 1 })
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Discovery(_)));
}

#[tokio::test]
async fn discovery_trait_object_round_robin_cycles_through_endpoints() {
    let discovery = two_server_discovery().await;
    let as_trait: Arc<dyn Discovery> = discovery;
    let first = as_trait.get(SelectMode::RoundRobin).await.unwrap();
    let second = as_trait.get(SelectMode::RoundRobin).await.unwrap();
    let third = as_trait.get(SelectMode::RoundRobin).await.unwrap();
    assert_ne!(first, second);
    assert_eq!(first, third);
}

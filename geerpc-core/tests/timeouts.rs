mod common;

use std::time::{Duration, Instant};

use common::{options_with_handle_timeout, start_server, Args};
use geerpc_core::Client;

#[tokio::test]
async fn server_handle_timeout_bounds_slow_methods() {
    let addr = start_server().await;
    // The handle timeout travels in the option preamble, so the client
    // picks the bound for its own connection.
    let client = Client::dial(&addr, options_with_handle_timeout(Duration::from_secs(1)))
        .await
        .unwrap();

    let started = Instant::now();
    let err = client
        .call::<_, i64>("Foo.Sleep", &Args { num1: 2, num2: 0 })
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(
        err.to_string().contains("request handle timeout"),
        "unexpected error: {err}"
    );
    assert!(
        elapsed < Duration::from_millis(1800),
        "timeout response took {elapsed:?}, expected ~1s"
    );
}

#[tokio::test]
async fn fast_methods_are_unaffected_by_the_handle_timeout() {
    let addr = start_server().await;
    let client = Client::dial(&addr, options_with_handle_timeout(Duration::from_secs(1)))
        .await
        .unwrap();

    let reply: i64 = client
        .call("Foo.Sum", &Args { num1: 4, num2: 5 })
        .await
        .unwrap();
    assert_eq!(reply, 9);
}

#[tokio::test]
async fn caller_side_timeout_leaves_the_session_usable() {
    let addr = start_server().await;
    let client = Client::dial(&addr, geerpc_core::Options::default())
        .await
        .unwrap();

    // Give up on a slow call from the caller side. Dropping the call
    // deregisters it, so the late response must be drained as an unknown
    // seq instead of corrupting the session.
    let timed_out = tokio::time::timeout(
        Duration::from_millis(300),
        client.call::<_, i64>("Foo.Sleep", &Args { num1: 1, num2: 0 }),
    )
    .await;
    assert!(timed_out.is_err(), "expected the caller-side timeout to win");

    // The session keeps working, including after the orphaned response
    // arrives.
    let reply: i64 = client
        .call("Foo.Sum", &Args { num1: 2, num2: 3 })
        .await
        .unwrap();
    assert_eq!(reply, 5);

    tokio::time::sleep(Duration::from_millis(900)).await;
    let reply: i64 = client
        .call("Foo.Sum", &Args { num1: 7, num2: 8 })
        .await
        .unwrap();
    assert_eq!(reply, 15);
}

#[tokio::test]
async fn zero_handle_timeout_means_unlimited() {
    let addr = start_server().await;
    let client = Client::dial(&addr, geerpc_core::Options::default())
        .await
        .unwrap();

    let reply: i64 = client
        .call("Foo.Sleep", &Args { num1: 1, num2: 1 })
        .await
        .unwrap();
    assert_eq!(reply, 2);
}


use std::sync::Arc;
use std::time::Duration;

use harness::{spawn_balancer, upstreams, TaggedBackend, TaggedClient};
use tcplb::{LbError, LoadBalancer, RouteOptions, RouteState, TcpLoadBalancer};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_test::assert_ok;
use tracing::Dispatch;

#[tokio::test]
async fn close_twice_is_ok() {
    let backend = TaggedBackend::spawn("a").await.unwrap();
    let (lb, _addr) = spawn_balancer(&upstreams(&[backend.upstream()]), RouteOptions::default()).await;

    assert_ok!(lb.close().await);
    assert_ok!(lb.close().await);
}

#[tokio::test]
async fn concurrent_closes_all_succeed() {
    let backend = TaggedBackend::spawn("a").await.unwrap();
    let (lb, _addr) = spawn_balancer(&upstreams(&[backend.upstream()]), RouteOptions::default()).await;
    let lb = Arc::new(lb);

    let closers: Vec<_> = (0..4)
        .map(|_| {
            let lb = Arc::clone(&lb);
            tokio::spawn(async move { lb.close().await })
        })
        .collect();

    for closer in closers {
        assert_ok!(closer.await.unwrap());
    }
}

#[tokio::test]
async fn concurrent_closes_all_wait_for_open_relay() {
    let backend = TaggedBackend::spawn("a").await.unwrap();
    let (lb, addr) = spawn_balancer(&upstreams(&[backend.upstream()]), RouteOptions::default()).await;
    let route = lb.route("127.0.0.1:0").await.unwrap();
    let mut states = route.state_changes();

    let mut client = TaggedClient::connect(addr).await.unwrap();
    assert_eq!(client.echo(b"hold").await.unwrap(), b"hold");

    let lb = Arc::new(lb);
    let spawn_close = |lb: &Arc<TcpLoadBalancer>| {
        let lb = Arc::clone(lb);
        tokio::spawn(async move { lb.close().await })
    };

    let first = spawn_close(&lb);
    timeout(
        Duration::from_secs(2),
        states.wait_for(|s| *s == RouteState::Draining),
    )
    .await
    .expect("route starts draining")
    .unwrap();

    // Callers arriving mid-drain block too
    let later: Vec<_> = (0..3).map(|_| spawn_close(&lb)).collect();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!first.is_finished(), "first close returned while a relay was open");
    for closer in &later {
        assert!(!closer.is_finished(), "later close returned while a relay was open");
    }
    assert_eq!(route.state(), RouteState::Draining);

    drop(client);

    for closer in std::iter::once(first).chain(later) {
        let result = timeout(Duration::from_secs(2), closer)
            .await
            .expect("close finishes once the relay ends")
            .unwrap();
        assert_ok!(result);
        assert_eq!(route.state(), RouteState::Closed);
    }
}

#[tokio::test]
async fn close_waits_for_open_relay() {
    let backend = TaggedBackend::spawn("a").await.unwrap();
    let (lb, addr) = spawn_balancer(&upstreams(&[backend.upstream()]), RouteOptions::default()).await;
    let route = lb.route("127.0.0.1:0").await.unwrap();
    let mut states = route.state_changes();

    let mut client = TaggedClient::connect(addr).await.unwrap();
    assert_eq!(client.echo(b"hold").await.unwrap(), b"hold");

    let lb = Arc::new(lb);
    let closer = tokio::spawn({
        let lb = Arc::clone(&lb);
        async move { lb.close().await }
    });

    timeout(
        Duration::from_secs(2),
        states.wait_for(|s| *s == RouteState::Draining),
    )
    .await
    .expect("route starts draining")
    .unwrap();

    // Draining: no new connections, the open relay still works
    assert!(TcpStream::connect(addr).await.is_err());
    assert_eq!(client.echo(b"still here").await.unwrap(), b"still here");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!closer.is_finished(), "close returned while a relay was open");

    drop(client);

    let result = timeout(Duration::from_secs(2), closer)
        .await
        .expect("close finishes once the relay ends")
        .unwrap();
    assert_ok!(result);
    assert_eq!(route.state(), RouteState::Closed);
}

#[tokio::test]
async fn close_drains_every_route() {
    let backend_a = TaggedBackend::spawn("a").await.unwrap();
    let backend_b = TaggedBackend::spawn("b").await.unwrap();

    let lb = TcpLoadBalancer::new(Some(Dispatch::none())).unwrap();
    lb.add_route("127.0.0.1:0", &upstreams(&[backend_a.upstream()]), RouteOptions::default())
        .await
        .unwrap();
    lb.add_route("[::1]:0", &upstreams(&[backend_b.upstream()]), RouteOptions::default())
        .await
        .unwrap();
    lb.start().await.unwrap();

    let v4 = lb.route("127.0.0.1:0").await.unwrap();
    let v6 = lb.route("[::1]:0").await.unwrap();
    let v4_addr = v4.local_addr().unwrap();

    let client = TaggedClient::connect(v4_addr).await.unwrap();
    assert_eq!(client.tag, "a");
    drop(client);

    timeout(Duration::from_secs(5), lb.close())
        .await
        .expect("close finishes")
        .unwrap();

    assert_eq!(v4.state(), RouteState::Closed);
    assert_eq!(v6.state(), RouteState::Closed);
    assert!(lb.listen_addrs().await.is_empty());
}

#[tokio::test]
async fn remove_route_drains_and_releases_listener() {
    let backend = TaggedBackend::spawn("a").await.unwrap();
    let (lb, addr) = spawn_balancer(&upstreams(&[backend.upstream()]), RouteOptions::default()).await;

    let client = TaggedClient::connect(addr).await.unwrap();
    drop(client);

    assert_ok!(lb.remove_route("127.0.0.1:0").await);
    assert!(lb.route("127.0.0.1:0").await.is_none());
    assert!(TcpStream::connect(addr).await.is_err());

    // Removing twice is a caller error
    assert!(matches!(
        lb.remove_route("127.0.0.1:0").await,
        Err(LbError::InvalidRoute { .. })
    ));

    assert_ok!(lb.close().await);
}

#[tokio::test]
async fn drain_timeout_is_reported_by_close() {
    let backend = TaggedBackend::spawn("a").await.unwrap();
    let options = RouteOptions {
        drain_timeout: Some(Duration::from_millis(100)),
        ..RouteOptions::default()
    };
    let (lb, addr) = spawn_balancer(&upstreams(&[backend.upstream()]), options).await;

    let mut client = TaggedClient::connect(addr).await.unwrap();

    match lb.close().await {
        Err(LbError::Close(errors)) => {
            assert_eq!(errors.len(), 1);
            assert!(matches!(errors[0], LbError::DrainTimeout { remaining: 1, .. }));
        }
        other => panic!("Expected Close error, got {:?}", other),
    }

    // The relay was left running
    assert_eq!(client.echo(b"alive").await.unwrap(), b"alive");

    // Later closes are benign
    assert_ok!(lb.close().await);
}

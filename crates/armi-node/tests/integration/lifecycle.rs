//! Connection and hub lifecycle: peer loss, shutdown cascades, access
//! control, dial failures.

use std::sync::Arc;
use std::time::Duration;

use armi_node::protocol::Value;
use armi_node::{ArmiError, ServiceDescriptor, REASON_SHUTDOWN};

use crate::harness::{wait_peer_count, wait_subscriptions, Collector, TestHub};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_remote_hub_closing_aborts_subscribers() -> anyhow::Result<()> {
    let publisher = TestHub::start().await?;
    let collector = Collector::new();

    let subscriber = TestHub::client();
    subscriber
        .subscribe("armi.test.Tick", None, None, collector.clone(), Some(publisher.addr))
        .await?;
    wait_subscriptions(&publisher.hub, 1, WAIT).await?;
    assert_eq!(subscriber.peer_count().await, 1);

    publisher.shutdown().await;

    let reason = collector.wait_abort(WAIT).await?;
    assert!(
        reason.contains("disconnected") || reason.contains(REASON_SHUTDOWN),
        "abort reason should mention the remote closing, got {reason:?}"
    );
    wait_peer_count(&subscriber, 0, WAIT).await?;
    assert!(subscriber.subscription_descriptions().await.is_empty());

    subscriber.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_hub_shutdown_releases_blocked_callers() -> anyhow::Result<()> {
    let server = TestHub::start().await?;
    let stuck = ServiceDescriptor::new().async_method("stall", 0, |_| {
        Box::pin(async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Value::Null)
        })
    });
    server.hub.register_service("Sloth", Some(Arc::new(stuck))).await?;

    let client = TestHub::client();
    let caller = {
        let client = client.clone();
        let addr = server.addr;
        tokio::spawn(async move { client.call(addr, "Sloth", "stall", vec![]).await })
    };

    // let the call get onto the wire, then tear the caller's hub down
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(client.outstanding_calls().await, 1);
    client.shutdown().await;

    match caller.await? {
        Err(ArmiError::Closed(reason)) => assert_eq!(reason, REASON_SHUTDOWN),
        other => panic!("expected Closed({REASON_SHUTDOWN:?}), got {other:?}"),
    }

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_access_control_closes_denied_connections() -> anyhow::Result<()> {
    let hub = armi_node::Hub::default();
    let port = hub
        .accept_remote_clients(
            Some("127.0.0.1:0".parse()?),
            Some(Arc::new(|_addr| false)),
        )
        .await?;
    let addr = format!("127.0.0.1:{port}").parse()?;

    let client = TestHub::client();
    let err = client.call(addr, "Server", "hello", vec![]).await.unwrap_err();
    assert!(
        matches!(err, ArmiError::Closed(_) | ArmiError::Io(_)),
        "denied connection must fail the call, got {err}"
    );
    assert_eq!(hub.peer_count().await, 0);

    client.shutdown().await;
    hub.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_dial_refused_port_is_io_error() -> anyhow::Result<()> {
    // bind and immediately drop to get a port nobody listens on
    let free_port = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        listener.local_addr()?.port()
    };
    let client = TestHub::client();
    let err = client
        .call(format!("127.0.0.1:{free_port}").parse()?, "Server", "hello", vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, ArmiError::Io(_)), "expected io error, got {err}");
    client.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_dial_port_zero_rejected() -> anyhow::Result<()> {
    let client = TestHub::client();
    let err = client
        .call("127.0.0.1:0".parse()?, "Server", "hello", vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, ArmiError::Io(_)));
    client.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_racing_dials_converge_on_one_connection() -> anyhow::Result<()> {
    let server = TestHub::start().await?;
    server
        .hub
        .register_service(
            "Server",
            Some(armi_node::demo::server_service(server.hub.clone(), None)),
        )
        .await?;

    let client = TestHub::client();
    let mut handles = Vec::new();
    for _ in 0..8 {
        let client = client.clone();
        let addr = server.addr;
        handles.push(tokio::spawn(async move {
            client.call(addr, "Server", "hello", vec![]).await
        }));
    }
    for handle in handles {
        assert!(handle.await?.is_ok());
    }
    assert_eq!(client.peer_count().await, 1, "racing callers must share one connection");

    client.shutdown().await;
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_shutdown_is_idempotent_and_terminal() -> anyhow::Result<()> {
    let server = TestHub::start().await?;
    let hub = server.hub.clone();
    assert!(hub.is_running());
    hub.shutdown().await;
    hub.shutdown().await; // second call is a no-op
    assert!(!hub.is_running());
    assert_eq!(hub.peer_count().await, 0);
    Ok(())
}

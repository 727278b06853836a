//! Synchronous call scenarios across two real hubs.

use std::sync::Arc;
use std::time::Duration;

use armi_node::demo::{self, OS_EOL};
use armi_node::protocol::Value;
use armi_node::{ArmiError, ServiceDescriptor};

use crate::harness::TestHub;

#[tokio::test]
async fn test_world_clock_call_across_hubs() -> anyhow::Result<()> {
    let server = TestHub::start().await?;
    server
        .hub
        .register_service("WorldClock", Some(demo::world_clock_service()))
        .await?;

    let client = TestHub::client();
    let value = client
        .call(server.addr, "WorldClock", "getTime", vec![Value::from("UTC")])
        .await?;

    let text = value.as_str().expect("getTime returns a string");
    assert!(!text.trim().is_empty());
    assert!(text.ends_with(OS_EOL), "time string must end with the O/S line terminator");
    assert_eq!(client.outstanding_calls().await, 0);

    client.shutdown().await;
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_empty_argument_list_against_zero_arity_method() -> anyhow::Result<()> {
    let server = TestHub::start().await?;
    server
        .hub
        .register_service("Server", Some(demo::server_service(server.hub.clone(), None)))
        .await?;

    let client = TestHub::client();
    let value = client.call(server.addr, "Server", "hello", vec![]).await?;
    assert_eq!(value.as_str(), Some("Hi!  Nice talking with you."));

    client.shutdown().await;
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_variadic_method_across_hubs() -> anyhow::Result<()> {
    let server = TestHub::start().await?;
    server
        .hub
        .register_service("WorldClock", Some(demo::world_clock_service()))
        .await?;

    let client = TestHub::client();
    let args = vec![Value::from("UTC"), Value::from("GMT+5")];
    let value = client.call(server.addr, "WorldClock", "getTimes", args).await?;
    assert_eq!(value.as_str().unwrap().matches(OS_EOL).count(), 2);

    // varargs accepts an empty zone list and answers with the empty string
    let value = client.call(server.addr, "WorldClock", "getTimes", vec![]).await?;
    assert_eq!(value.as_str(), Some(""));

    client.shutdown().await;
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_service_not_found() -> anyhow::Result<()> {
    let server = TestHub::start().await?;
    let client = TestHub::client();

    let err = client
        .call(server.addr, "NonExistentService", "foo", vec![])
        .await
        .unwrap_err();
    match err {
        ArmiError::Invocation(e) => assert!(e.message.contains("Service not found")),
        other => panic!("expected invocation error, got {other}"),
    }

    client.shutdown().await;
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_wrong_password_returns_denial_without_teardown() -> anyhow::Result<()> {
    let server = TestHub::start().await?;
    server
        .hub
        .register_service(
            "Server",
            Some(demo::server_service(server.hub.clone(), Some("secret".into()))),
        )
        .await?;

    let client = TestHub::client();
    let value = client
        .call(server.addr, "Server", "shutdown", vec![Value::from("wrong")])
        .await?;
    assert_eq!(value.as_str(), Some("Permission denied."));
    assert!(server.hub.is_running());

    // same connection is still good for further calls
    let again = client.call(server.addr, "Server", "hello", vec![]).await?;
    assert!(again.as_str().is_some());
    assert_eq!(client.peer_count().await, 1);

    client.shutdown().await;
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_slow_method_times_out_and_late_response_is_dropped() -> anyhow::Result<()> {
    let server = TestHub::start().await?;
    let slow = ServiceDescriptor::new().async_method("slowMethod", 0, |_| {
        Box::pin(async {
            tokio::time::sleep(Duration::from_millis(800)).await;
            Ok(Value::Str("finally".into()))
        })
    });
    server.hub.register_service("Sloth", Some(Arc::new(slow))).await?;

    let client = TestHub::client_with_call_timeout(150);
    let started = tokio::time::Instant::now();
    let err = client.call(server.addr, "Sloth", "slowMethod", vec![]).await.unwrap_err();
    assert!(matches!(err, ArmiError::Timeout(_)), "expected timeout, got {err}");
    assert!(started.elapsed() < Duration::from_millis(700));
    assert_eq!(client.outstanding_calls().await, 0);

    // The worker finishes and its late response arrives with an unknown
    // serial; the connection must absorb it and stay usable.
    tokio::time::sleep(Duration::from_millis(900)).await;
    server
        .hub
        .register_service("Server", Some(demo::server_service(server.hub.clone(), None)))
        .await?;
    let value = client.call(server.addr, "Server", "hello", vec![]).await?;
    assert!(value.as_str().is_some());

    client.shutdown().await;
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_invocation_error_carries_wire_trace() -> anyhow::Result<()> {
    let server = TestHub::start().await?;
    let svc = ServiceDescriptor::new().method("fail", 0, |_| {
        Err(armi_node::protocol::WireError::here("Problem reported by service during method call.")
            .with_cause(armi_node::protocol::WireError::new("backend unavailable")))
    });
    server.hub.register_service("Fragile", Some(Arc::new(svc))).await?;

    let client = TestHub::client();
    let err = client.call(server.addr, "Fragile", "fail", vec![]).await.unwrap_err();
    match err {
        ArmiError::Invocation(e) => {
            assert!(e.message.contains("Problem reported by service"));
            assert_eq!(e.cause.unwrap().message, "backend unavailable");
            assert!(!e.trace.is_empty(), "origin frame must survive the wire");
        }
        other => panic!("expected invocation error, got {other}"),
    }

    client.shutdown().await;
    server.shutdown().await;
    Ok(())
}

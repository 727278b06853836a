//! Publish/subscribe scenarios: flavored routing, null-flavor
//! generalisation, remote cancellation, and server-side filtering.

use std::time::Duration;

use armi_node::demo::{self, ClockTick};
use armi_node::protocol::FilterSpec;
use armi_node::{Filter, TypedPayload};

use crate::harness::{wait_subscriptions, Collector, TestHub};

const TICK: &str = "armi.test.Tick";
const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_flavored_and_null_flavor_subscribers_exactly_once() -> anyhow::Result<()> {
    let publisher = TestHub::start().await?;

    let one_sec = Collector::new();
    let any_flavor = Collector::new();
    let five_sec = Collector::new();

    let b = TestHub::client();
    let c = TestHub::client();
    let d = TestHub::client();
    b.subscribe(TICK, Some("1sec"), None, one_sec.clone(), Some(publisher.addr)).await?;
    c.subscribe(TICK, None, None, any_flavor.clone(), Some(publisher.addr)).await?;
    d.subscribe(TICK, Some("5sec"), None, five_sec.clone(), Some(publisher.addr)).await?;
    wait_subscriptions(&publisher.hub, 3, WAIT).await?;

    publisher.hub.publish_raw(TICK, Some("1sec"), vec![1, 2, 3]).await;

    one_sec.wait_count(1, WAIT).await?;
    any_flavor.wait_count(1, WAIT).await?;

    // settle, then check nobody got duplicates and the 5sec key stayed quiet
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(one_sec.count(), 1);
    assert_eq!(any_flavor.count(), 1);
    assert_eq!(five_sec.count(), 0);

    let received = one_sec.envelopes().remove(0);
    assert_eq!(received.data_type, TICK);
    assert_eq!(received.flavor.as_deref(), Some("1sec"));
    assert_eq!(&received.payload[..], &[1, 2, 3]);

    for hub in [b, c, d] {
        hub.shutdown().await;
    }
    publisher.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_null_flavor_publish_skips_flavored_remote_subscribers() -> anyhow::Result<()> {
    let publisher = TestHub::start().await?;
    let flavored = Collector::new();
    let plain = Collector::new();

    let subscriber = TestHub::client();
    subscriber
        .subscribe(TICK, Some("1sec"), None, flavored.clone(), Some(publisher.addr))
        .await?;
    subscriber
        .subscribe(TICK, None, None, plain.clone(), Some(publisher.addr))
        .await?;
    wait_subscriptions(&publisher.hub, 2, WAIT).await?;

    publisher.hub.publish_raw(TICK, None, vec![9]).await;

    plain.wait_count(1, WAIT).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(flavored.count(), 0);
    assert_eq!(plain.count(), 1);

    subscriber.shutdown().await;
    publisher.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_remote_subscribe_then_cancel_stops_delivery() -> anyhow::Result<()> {
    let publisher = TestHub::start().await?;
    let collector = Collector::new();

    let subscriber = TestHub::client();
    let receipt = subscriber
        .subscribe(TICK, None, None, collector.clone(), Some(publisher.addr))
        .await?;
    wait_subscriptions(&publisher.hub, 1, WAIT).await?;

    publisher.hub.publish_raw(TICK, None, vec![1]).await;
    collector.wait_count(1, WAIT).await?;

    receipt.cancel().await?;
    let deadline = tokio::time::Instant::now() + WAIT;
    while !publisher.hub.subscription_descriptions().await.is_empty() {
        anyhow::ensure!(tokio::time::Instant::now() < deadline, "cancel never reached publisher");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    publisher.hub.publish_raw(TICK, None, vec![2]).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(collector.count(), 1, "no delivery after cancellation");

    subscriber.shutdown().await;
    publisher.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_transportable_filter_evaluated_at_publisher() -> anyhow::Result<()> {
    let publisher = TestHub::start().await?;
    let collector = Collector::new();

    let subscriber = TestHub::client();
    subscriber
        .subscribe(
            TICK,
            None,
            Some(Filter::Spec(FilterSpec::PayloadMaxBytes(4))),
            collector.clone(),
            Some(publisher.addr),
        )
        .await?;
    wait_subscriptions(&publisher.hub, 1, WAIT).await?;

    publisher.hub.publish_raw(TICK, None, vec![0; 64]).await; // filtered out remotely
    publisher.hub.publish_raw(TICK, None, vec![7; 2]).await;

    collector.wait_count(1, WAIT).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(collector.count(), 1);
    assert_eq!(collector.envelopes()[0].payload.len(), 2);

    subscriber.shutdown().await;
    publisher.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_date_publisher_delivers_typed_ticks() -> anyhow::Result<()> {
    let hub = TestHub::client();
    let collector = Collector::new();
    hub.subscribe(ClockTick::DATA_TYPE, Some("fast"), None, collector.clone(), None)
        .await?;

    let publisher = demo::spawn_date_publisher(hub.clone(), Duration::from_millis(50), "fast");
    collector.wait_count(2, WAIT).await?;
    publisher.abort();

    let tick: ClockTick = collector.envelopes()[0].decode_payload()?;
    assert!(tick.unix_ms > 0);

    hub.shutdown().await;
    Ok(())
}

//! Multiplexer behaviour over the in-memory transport.

use futures::StreamExt;
use reactive_messaging::{
    Destination, JsonCodec, MessagingConfig, Multiplexer, OverflowPolicy, StreamError,
    TransportMessage,
};
use std::sync::Arc;
use std::time::Duration;
use test_utils::assertions::within;
use test_utils::{init_test_tracing, InMemoryTransport, MetricEvent, RecordingMetrics, TestDataBuilder};

struct Harness {
    transport: Arc<InMemoryTransport>,
    metrics: Arc<RecordingMetrics>,
    multiplexer: Multiplexer,
    data: TestDataBuilder,
}

impl Harness {
    fn new(test_name: &str) -> Self {
        Self::with_config(test_name, MessagingConfig::default())
    }

    fn with_config(test_name: &str, config: MessagingConfig) -> Self {
        init_test_tracing();
        let transport = Arc::new(InMemoryTransport::new());
        let metrics = Arc::new(RecordingMetrics::new());
        let multiplexer = Multiplexer::new(transport.clone(), metrics.clone(), config);
        Self {
            transport,
            metrics,
            multiplexer,
            data: TestDataBuilder::from_test_name(test_name),
        }
    }
}

fn payloads(n: u8) -> impl Iterator<Item = TransportMessage> {
    (1..=n).map(|i| TransportMessage::new(vec![i]))
}

#[tokio::test]
async fn test_subscriptions_share_one_connection() {
    let h = Harness::new("test_subscriptions_share_one_connection");
    let quotes = h.data.destination("quotes");

    let mut a = h.multiplexer.subscribe(quotes.clone(), OverflowPolicy::Unbounded);
    let mut b = h.multiplexer.subscribe(quotes.clone(), OverflowPolicy::Unbounded);
    assert_eq!(h.transport.connect_count(quotes.clone()), 1);
    assert_eq!(h.multiplexer.refcount(&quotes), 2);

    assert!(h.transport.inject(quotes.clone(), TransportMessage::new("tick")));

    for sub in [&mut a, &mut b] {
        let message = within(Duration::from_secs(1), "broadcast", sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.payload().as_ref(), b"tick");
        assert_eq!(message.destination(), &quotes);
    }

    // One payload from the connection counts once, however many subscribers.
    assert_eq!(h.metrics.count(MetricEvent::MessageReceived, quotes.clone()), 1);
    assert_eq!(h.metrics.count(MetricEvent::SubscriptionCreated, quotes.clone()), 2);

    drop(a);
    assert!(h.transport.is_connected(quotes.clone()));
    h.multiplexer.unsubscribe(&b);
    assert!(!h.transport.is_connected(quotes.clone()));
    assert_eq!(h.transport.disconnect_count(quotes.clone()), 1);
    assert_eq!(h.metrics.count(MetricEvent::SubscriptionDestroyed, quotes.clone()), 2);

    // Dropping the already released handle changes nothing.
    drop(b);
    assert_eq!(h.transport.disconnect_count(quotes.clone()), 1);
    assert_eq!(h.metrics.count(MetricEvent::SubscriptionDestroyed, quotes), 2);
    assert!(h.transport.violations().is_empty());
}

#[tokio::test]
async fn test_destinations_are_independent() {
    let h = Harness::new("test_destinations_are_independent");
    let orders = h.data.destination("orders");
    let quotes = h.data.destination("quotes");

    let mut order_sub = h.multiplexer.subscribe(orders.clone(), OverflowPolicy::Unbounded);
    let quote_sub = h.multiplexer.subscribe(quotes.clone(), OverflowPolicy::Unbounded);

    h.transport.inject(orders.clone(), TransportMessage::new("o-1"));
    drop(quote_sub);

    assert!(h.transport.is_connected(orders.clone()));
    assert!(!h.transport.is_connected(quotes.clone()));
    let message = order_sub.try_recv().unwrap().unwrap();
    assert_eq!(message.payload().as_ref(), b"o-1");

    let stats = h.multiplexer.stats();
    assert_eq!(stats.active_destinations, 1);
    assert_eq!(stats.active_subscriptions, 1);
    assert_eq!(stats.connects, 2);
    assert_eq!(stats.disconnects, 1);
}

#[tokio::test]
async fn test_overflow_policies_apply_per_subscription() {
    let h = Harness::with_config(
        "test_overflow_policies_apply_per_subscription",
        MessagingConfig::default().with_buffer_capacity(2),
    );
    let feed = h.data.destination("feed");

    let mut all = h.multiplexer.subscribe(feed.clone(), OverflowPolicy::Unbounded);
    let mut latest = h.multiplexer.subscribe(feed.clone(), OverflowPolicy::LatestOnly);
    let mut bounded = h.multiplexer.subscribe(feed.clone(), OverflowPolicy::DropNewest);
    let mut strict = h.multiplexer.subscribe(feed.clone(), OverflowPolicy::Fail);

    for message in payloads(5) {
        h.transport.inject(feed.clone(), message);
    }

    let mut seen = Vec::new();
    while let Some(Ok(m)) = all.try_recv() {
        seen.push(m.payload()[0]);
    }
    assert_eq!(seen, vec![1, 2, 3, 4, 5]);

    assert_eq!(latest.try_recv().unwrap().unwrap().payload()[0], 5);
    assert!(latest.try_recv().is_none());
    assert!(!latest.is_terminated());
    assert_eq!(latest.dropped_count(), 4);

    assert_eq!(bounded.try_recv().unwrap().unwrap().payload()[0], 1);
    assert_eq!(bounded.try_recv().unwrap().unwrap().payload()[0], 2);
    assert!(bounded.try_recv().is_none());
    assert!(!bounded.is_terminated());
    assert_eq!(bounded.dropped_count(), 3);

    assert_eq!(strict.try_recv().unwrap().unwrap().payload()[0], 1);
    assert_eq!(strict.try_recv().unwrap().unwrap().payload()[0], 2);
    match strict.try_recv() {
        Some(Err(StreamError::Overflow { destination, capacity })) => {
            assert_eq!(destination, feed);
            assert_eq!(capacity, 2);
        }
        other => panic!("expected overflow, got {:?}", other),
    }
    assert!(strict.recv().await.is_none());

    // latest: 4 replaced, bounded: 3 rejected, strict: 1 overflow
    assert_eq!(h.metrics.count(MetricEvent::MessageDropped, feed.clone()), 8);

    // The other subscriptions keep receiving after one overflowed.
    h.transport.inject(feed.clone(), TransportMessage::new(vec![6]));
    assert_eq!(all.try_recv().unwrap().unwrap().payload()[0], 6);
    assert_eq!(latest.try_recv().unwrap().unwrap().payload()[0], 6);
    assert_eq!(bounded.try_recv().unwrap().unwrap().payload()[0], 6);
}

#[tokio::test]
async fn test_connection_loss_fails_every_subscription() {
    let h = Harness::new("test_connection_loss_fails_every_subscription");
    let feed = h.data.destination("feed");

    let mut a = h.multiplexer.subscribe(feed.clone(), OverflowPolicy::Unbounded);
    let mut b = h.multiplexer.subscribe(feed.clone(), OverflowPolicy::LatestOnly);
    h.transport.inject(feed.clone(), TransportMessage::new("before"));

    assert!(h.transport.lose_connection(feed.clone(), "peer reset"));

    // Buffered data drains first, then the fault.
    assert_eq!(a.recv().await.unwrap().unwrap().payload().as_ref(), b"before");
    assert!(matches!(
        a.recv().await,
        Some(Err(StreamError::ConnectionFault { .. }))
    ));
    assert!(a.recv().await.is_none());

    assert_eq!(b.recv().await.unwrap().unwrap().payload().as_ref(), b"before");
    assert!(matches!(
        b.recv().await,
        Some(Err(StreamError::ConnectionFault { .. }))
    ));

    assert!(!h.multiplexer.is_connected(&feed));
    assert_eq!(h.multiplexer.refcount(&feed), 0);

    // A later subscriber starts from a clean slate.
    let mut c = h.multiplexer.subscribe(feed.clone(), OverflowPolicy::Unbounded);
    assert_eq!(h.transport.connect_count(feed.clone()), 2);
    h.transport.inject(feed.clone(), TransportMessage::new("after"));
    assert_eq!(c.recv().await.unwrap().unwrap().payload().as_ref(), b"after");

    drop(a);
    drop(b);
    assert!(h.transport.is_connected(feed.clone()));
    drop(c);
    assert_eq!(h.transport.disconnect_count(feed.clone()), 2);
    assert!(h.transport.violations().is_empty());
}

#[tokio::test]
async fn test_connect_failure_yields_terminated_subscription() {
    let h = Harness::new("test_connect_failure_yields_terminated_subscription");
    let down = h.data.destination("down");
    h.transport.refuse_connect(down.clone(), true);

    let mut sub = h.multiplexer.subscribe(down.clone(), OverflowPolicy::Unbounded);
    match sub.recv().await {
        Some(Err(StreamError::ConnectionFault { destination, .. })) => assert_eq!(destination, down),
        other => panic!("expected connection fault, got {:?}", other),
    }
    assert!(!h.multiplexer.is_connected(&down));

    h.transport.refuse_connect(down.clone(), false);
    let _sub = h.multiplexer.subscribe(down.clone(), OverflowPolicy::Unbounded);
    assert!(h.multiplexer.is_connected(&down));
    assert_eq!(h.transport.connect_count(down), 1);
}

#[tokio::test]
async fn test_unsubscribe_ends_stream_immediately() {
    let h = Harness::new("test_unsubscribe_ends_stream_immediately");
    let feed = h.data.destination("feed");
    let mut sub = h.multiplexer.subscribe(feed.clone(), OverflowPolicy::Unbounded);

    h.transport.inject(feed.clone(), TransportMessage::new("pending"));
    sub.unsubscribe();

    assert!(sub.recv().await.is_none());
    assert!(sub.is_terminated());
}

#[tokio::test]
async fn test_subscription_as_stream() {
    let h = Harness::new("test_subscription_as_stream");
    let feed = h.data.destination("feed");
    let stream = h
        .multiplexer
        .subscribe(feed.clone(), OverflowPolicy::Unbounded)
        .into_stream();

    for message in payloads(3) {
        h.transport.inject(feed.clone(), message);
    }
    h.transport.lose_connection(feed.clone(), "closed by test");

    let items: Vec<_> = within(Duration::from_secs(1), "stream end", stream.collect()).await;
    assert_eq!(items.len(), 4);
    assert!(items[..3].iter().all(|item| item.is_ok()));
    assert!(items[3].is_err());
}

#[tokio::test]
async fn test_waiting_subscriber_wakes_on_delivery() {
    let h = Harness::new("test_waiting_subscriber_wakes_on_delivery");
    let feed = h.data.destination("feed");
    let mut sub = h.multiplexer.subscribe(feed.clone(), OverflowPolicy::Unbounded);

    let transport = h.transport.clone();
    let producer_feed = feed.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        transport.inject(producer_feed, TransportMessage::new("late"));
    });

    let message = within(Duration::from_secs(1), "delivery", sub.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.payload().as_ref(), b"late");
}

#[tokio::test]
async fn test_publisher_loops_back_to_subscribers() {
    let h = Harness::new("test_publisher_loops_back_to_subscribers");
    let events = h.data.destination("events");
    let mut sub = h
        .multiplexer
        .subscribe(events.clone(), OverflowPolicy::Unbounded)
        .decoded::<serde_json::Value, _>(JsonCodec);

    let publisher = h.multiplexer.publisher(JsonCodec);
    publisher
        .publish(&events, &serde_json::json!({"kind": "created", "id": 7}))
        .unwrap();

    let message = sub.recv().await.unwrap().unwrap();
    assert_eq!(message.payload()["id"], 7);
    assert_eq!(h.transport.sent_to(events).len(), 1);
}

#[tokio::test]
async fn test_shutdown_completes_all_streams() {
    let h = Harness::new("test_shutdown_completes_all_streams");
    let a = h.data.destination("a");
    let b = h.data.destination("b");
    let mut sub_a = h.multiplexer.subscribe(a.clone(), OverflowPolicy::Unbounded);
    let mut sub_b = h.multiplexer.subscribe(b.clone(), OverflowPolicy::Fail);

    h.multiplexer.shutdown();

    assert!(sub_a.recv().await.is_none());
    assert!(sub_b.recv().await.is_none());
    assert!(!h.transport.is_connected(a.clone()));
    assert!(!h.transport.is_connected(b.clone()));

    drop(sub_a);
    drop(sub_b);
    assert_eq!(h.transport.disconnect_count(a), 1);
    assert_eq!(h.transport.disconnect_count(b), 1);
    assert_eq!(h.multiplexer.stats().active_destinations, 0);
    assert!(h.transport.violations().is_empty());
}

#[test]
fn test_destination_keys_compare_by_name() {
    let h = Harness::new("test_destination_keys_compare_by_name");
    let _a = h.multiplexer.subscribe("shared", OverflowPolicy::Unbounded);
    let _b = h
        .multiplexer
        .subscribe(Destination::from(String::from("shared")), OverflowPolicy::Unbounded);
    assert_eq!(h.transport.connect_count("shared"), 1);
    assert_eq!(h.multiplexer.refcount(&Destination::new("shared")), 2);
}

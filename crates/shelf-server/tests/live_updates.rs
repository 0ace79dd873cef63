//! End-to-end flow: store mutation → change feed → broker → session pump.

use std::io;
use std::time::Duration;

use futures::channel::mpsc;
use futures::StreamExt;
use tokio::task::JoinHandle;

use shelf_proto::Product;
use shelf_server::feed::{self, ChangeFeed};
use shelf_server::{
    Broker, BrokerConfig, CloseReason, MemoryStore, OverflowPolicy, ProductStore, SessionPump,
};

struct Client {
    inbound: mpsc::UnboundedSender<Result<String, io::Error>>,
    outbound: mpsc::UnboundedReceiver<String>,
    pump: JoinHandle<CloseReason>,
}

impl Client {
    fn connect(broker: &Broker) -> Self {
        let (inbound, inbound_rx) = mpsc::unbounded();
        let (outbound_tx, outbound) = mpsc::unbounded();
        let pump = tokio::spawn(SessionPump::new(broker.clone()).run(inbound_rx, outbound_tx));
        Self {
            inbound,
            outbound,
            pump,
        }
    }

    fn send(&self, text: &str) {
        self.inbound.unbounded_send(Ok(text.to_string())).unwrap();
    }

    async fn next_product(&mut self) -> Option<Product> {
        let frame = tokio::time::timeout(Duration::from_secs(1), self.outbound.next())
            .await
            .ok()
            .flatten()?;
        Some(serde_json::from_str(&frame).unwrap())
    }

    async fn disconnect(self) -> CloseReason {
        drop(self.inbound);
        tokio::time::timeout(Duration::from_secs(1), self.pump)
            .await
            .unwrap()
            .unwrap()
    }
}

struct Catalog {
    store: MemoryStore,
    broker: Broker,
    feed: JoinHandle<Result<(), shelf_server::Error>>,
}

fn catalog(config: BrokerConfig) -> Catalog {
    let broker = Broker::start(config);
    let (changes, source) = feed::channel(64);
    let feed = tokio::spawn(ChangeFeed::new(source, broker.clone(), feed::DEFAULT_IDLE_PROBE).run());
    Catalog {
        store: MemoryStore::with_changes(changes),
        broker,
        feed,
    }
}

async fn wait_for_subscriptions(broker: &Broker, count: usize) {
    for _ in 0..200 {
        if broker.stats().await.unwrap().subscriptions == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("expected {count} subscriptions");
}

fn macbook(units: i32) -> Product {
    Product::new("MacBook Pro", "Apple", "900EUR", units)
}

#[tokio::test]
async fn test_updates_reach_only_interested_clients() {
    let catalog = catalog(BrokerConfig::default());
    let first = catalog.store.create(macbook(5)).await.unwrap();
    let second = catalog.store.create(macbook(8)).await.unwrap();

    let mut watcher = Client::connect(&catalog.broker);
    let mut bystander = Client::connect(&catalog.broker);
    watcher.send(&format!(
        r#"{{"command":"subscribe","entityIds":[{}]}}"#,
        first.product_id
    ));
    bystander.send(&format!(
        r#"{{"command":"subscribe","productIDs":[{}]}}"#,
        second.product_id
    ));
    wait_for_subscriptions(&catalog.broker, 2).await;

    let mut changed = first.clone();
    changed.units_available = 1;
    catalog
        .store
        .update_by_id(first.product_id, changed.clone())
        .await
        .unwrap();

    assert_eq!(watcher.next_product().await, Some(changed));
    assert_eq!(
        tokio::time::timeout(Duration::from_millis(50), bystander.outbound.next())
            .await
            .ok(),
        None
    );

    assert_eq!(watcher.disconnect().await, CloseReason::ClientClosed);
    assert_eq!(bystander.disconnect().await, CloseReason::ClientClosed);
    assert_eq!(catalog.broker.stats().await.unwrap().sessions, 0);
    catalog.feed.abort();
}

#[tokio::test]
async fn test_deleted_product_is_pushed_once() {
    let catalog = catalog(BrokerConfig::default());
    let product = catalog.store.create(macbook(3)).await.unwrap();

    let mut client = Client::connect(&catalog.broker);
    client.send(&format!(
        r#"{{"command":"subscribe","entityIds":[{}]}}"#,
        product.product_id
    ));
    wait_for_subscriptions(&catalog.broker, 1).await;

    assert!(catalog.store.delete_by_id(product.product_id).await.unwrap());
    assert_eq!(client.next_product().await, Some(product.clone()));

    // Deleting again changes nothing, so nothing is pushed.
    assert!(!catalog.store.delete_by_id(product.product_id).await.unwrap());
    assert_eq!(
        tokio::time::timeout(Duration::from_millis(50), client.outbound.next())
            .await
            .ok(),
        None
    );

    client.disconnect().await;
    catalog.feed.abort();
}

#[tokio::test]
async fn test_unsubscribed_client_stops_receiving() {
    let catalog = catalog(BrokerConfig::default());
    let product = catalog.store.create(macbook(3)).await.unwrap();
    let id = product.product_id;

    let mut client = Client::connect(&catalog.broker);
    client.send(&format!(r#"{{"command":"subscribe","entityIds":[{id}]}}"#));
    wait_for_subscriptions(&catalog.broker, 1).await;

    catalog.store.update_by_id(id, macbook(2)).await.unwrap();
    assert_eq!(client.next_product().await.unwrap().units_available, 2);

    client.send(&format!(r#"{{"command":"unsubscribe","entityIds":[{id}]}}"#));
    wait_for_subscriptions(&catalog.broker, 0).await;

    catalog.store.update_by_id(id, macbook(1)).await.unwrap();
    assert_eq!(
        tokio::time::timeout(Duration::from_millis(50), client.outbound.next())
            .await
            .ok(),
        None
    );

    client.disconnect().await;
    catalog.feed.abort();
}

#[tokio::test]
async fn test_slow_client_does_not_hold_back_others() {
    let config = BrokerConfig::default()
        .with_queue_capacity(4)
        .with_overflow(OverflowPolicy::DropOldest);
    let catalog = catalog(config);
    let product = catalog.store.create(macbook(0)).await.unwrap();
    let id = product.product_id;

    // An endpoint nobody reads from stands in for a stalled client.
    let slow = catalog.broker.open_session();
    catalog.broker.subscribe(&slow, vec![id]).await.unwrap();

    let mut fast = Client::connect(&catalog.broker);
    fast.send(&format!(r#"{{"command":"subscribe","entityIds":[{id}]}}"#));
    wait_for_subscriptions(&catalog.broker, 2).await;

    for units in 1..=20 {
        catalog.store.update_by_id(id, macbook(units)).await.unwrap();
        let received = fast.next_product().await.unwrap();
        assert_eq!(received.units_available, units);
    }

    assert_eq!(slow.queue().len(), 4);
    let mut kept = Vec::new();
    while let Some(product) = tokio::time::timeout(Duration::from_millis(50), slow.recv())
        .await
        .ok()
        .flatten()
    {
        kept.push(product.units_available);
    }
    assert_eq!(kept, vec![17, 18, 19, 20]);

    catalog.broker.teardown(&slow).await.unwrap();
    fast.disconnect().await;
    catalog.feed.abort();
}

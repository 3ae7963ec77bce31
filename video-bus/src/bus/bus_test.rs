use std::sync::{Arc, Mutex};
use std::thread;

use super::*;

/// Records every call, tagged with the instance number and calling thread.
struct FakeClient {
    instance: u32,
    log: Arc<Mutex<Vec<(String, thread::ThreadId)>>>,
    relay: Arc<dyn ErrorCallbacks>,
}

impl FakeClient {
    fn record(&self, op: String) {
        self.log
            .lock()
            .unwrap()
            .push((op, thread::current().id()));
    }
}

impl Client for FakeClient {
    fn publish(
        &self,
        channel: &str,
        _message: serde_json::Value,
        _callbacks: Option<Arc<dyn RequestCallbacks>>,
    ) {
        self.record(format!("client{}.publish {}", self.instance, channel));
    }

    fn subscribe(
        &self,
        channel: &str,
        _sub: &Subscription,
        _data_callbacks: Arc<dyn SubscriptionCallbacks>,
        _callbacks: Option<Arc<dyn RequestCallbacks>>,
        _options: Option<&SubscriptionOptions>,
    ) {
        self.record(format!("client{}.subscribe {}", self.instance, channel));
    }

    fn unsubscribe(&self, _sub: &Subscription, _callbacks: Option<Arc<dyn RequestCallbacks>>) {
        self.record(format!("client{}.unsubscribe", self.instance));
    }

    fn start(&self) -> Result<(), ClientError> {
        self.record(format!("client{}.start", self.instance));
        Ok(())
    }

    fn stop(&self) -> Result<(), ClientError> {
        self.record(format!("client{}.stop", self.instance));
        Ok(())
    }
}

struct NoopCallbacks;

impl ErrorCallbacks for NoopCallbacks {
    fn on_error(&self, error: ClientError) {
        log::error!("test callbacks got error: {}", error);
    }
}

impl SubscriptionCallbacks for NoopCallbacks {
    fn on_data(&self, _subscription: &Subscription, _data: ChannelData) {}
}

fn ops(log: &Arc<Mutex<Vec<(String, thread::ThreadId)>>>) -> Vec<String> {
    log.lock().unwrap().iter().map(|(op, _)| op.clone()).collect()
}

#[test]
fn test_channel_position_round_trip() {
    let positions = [
        ChannelPosition::new(0, 0),
        ChannelPosition::new(1, 2),
        ChannelPosition::new(u32::MAX, u64::MAX),
    ];
    for position in positions {
        assert_eq!(ChannelPosition::parse(&position.to_string()), position);
    }
}

#[test]
fn test_channel_position_malformed_parses_to_zero() {
    for input in ["", "abc", "5", "1:", ":2", "1:2:3", "-1:5", "1:-5", "99999999999999999999:1"] {
        assert_eq!(
            ChannelPosition::parse(input),
            ChannelPosition::default(),
            "input {:?} should parse to (0, 0)",
            input
        );
    }
}

#[test]
fn test_thread_checking_client_reposts_to_io_thread() {
    let io = IoLoop::new();
    let io_thread = thread::current().id();
    let log = Arc::new(Mutex::new(Vec::new()));
    let relay: Arc<dyn ErrorCallbacks> = Arc::new(NoopCallbacks);
    let fake = Arc::new(FakeClient {
        instance: 1,
        log: log.clone(),
        relay,
    });
    let client = Arc::new(ThreadCheckingClient::new(io.handle(), fake));

    let worker_client = client.clone();
    let worker = thread::spawn(move || {
        worker_client.publish("ch", serde_json::json!({"x": 1}), None);
    });
    worker.join().unwrap();

    assert!(
        log.lock().unwrap().is_empty(),
        "cross-thread publish must not run inline"
    );

    io.handle().stop();
    io.run();

    let entries = log.lock().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].0, "client1.publish ch");
    assert_eq!(entries[0].1, io_thread, "call must run on the io thread");
}

#[test]
fn test_resilient_client_restarts_and_replays_subscriptions() {
    let io = IoLoop::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    let relays: Arc<Mutex<Vec<Arc<dyn ErrorCallbacks>>>> = Arc::new(Mutex::new(Vec::new()));

    let factory_log = log.clone();
    let factory_relays = relays.clone();
    let instances = Arc::new(Mutex::new(0u32));
    let factory: ClientFactory = Box::new(move |relay| {
        let mut count = instances.lock().unwrap();
        *count += 1;
        factory_relays.lock().unwrap().push(relay.clone());
        Ok(Arc::new(FakeClient {
            instance: *count,
            log: factory_log.clone(),
            relay,
        }))
    });

    let outer: Arc<dyn ErrorCallbacks> = Arc::new(NoopCallbacks);
    let client = ResilientClient::new(io.handle(), factory, &outer).unwrap();
    client.start().unwrap();

    let data_callbacks: Arc<dyn SubscriptionCallbacks> = Arc::new(NoopCallbacks);
    let sub1 = Subscription::new();
    let sub2 = Subscription::new();
    client.subscribe("channel/a", &sub1, data_callbacks.clone(), None, None);
    client.subscribe("channel/b", &sub2, data_callbacks.clone(), None, None);

    // First delegate reports a transport error.
    relays.lock().unwrap()[0].on_error(ClientError::Io("connection reset".to_string()));

    assert_eq!(
        ops(&log),
        vec![
            "client1.start",
            "client1.subscribe channel/a",
            "client1.subscribe channel/b",
            "client1.stop",
            "client2.start",
            "client2.subscribe channel/a",
            "client2.subscribe channel/b",
        ],
        "both subscriptions must be replayed in order on the fresh delegate"
    );

    // Publishes go to the new delegate afterwards.
    client.publish("channel/a", serde_json::json!({}), None);
    assert_eq!(ops(&log).last().unwrap(), "client2.publish channel/a");
}

struct CollectingCallbacks {
    received: Arc<Mutex<Vec<serde_json::Value>>>,
}

impl ErrorCallbacks for CollectingCallbacks {
    fn on_error(&self, error: ClientError) {
        panic!("unexpected error: {}", error);
    }
}

impl SubscriptionCallbacks for CollectingCallbacks {
    fn on_data(&self, _subscription: &Subscription, data: ChannelData) {
        self.received.lock().unwrap().push(data.payload);
    }
}

#[test]
fn test_local_bus_replays_retained_message_with_history() {
    let bus = LocalBus::new();
    bus.publish("meta", serde_json::json!({"codec": "vp9"}), None);

    let received = Arc::new(Mutex::new(Vec::new()));
    let late = Subscription::new();
    let options = SubscriptionOptions {
        history: HistoryOptions {
            count: Some(1),
            age: None,
        },
        ..Default::default()
    };
    bus.subscribe(
        "meta",
        &late,
        Arc::new(CollectingCallbacks {
            received: received.clone(),
        }),
        None,
        Some(&options),
    );

    assert_eq!(
        *received.lock().unwrap(),
        vec![serde_json::json!({"codec": "vp9"})],
        "a history subscription sees the retained message"
    );

    let no_history = Subscription::new();
    let fresh = Arc::new(Mutex::new(Vec::new()));
    bus.subscribe(
        "meta",
        &no_history,
        Arc::new(CollectingCallbacks {
            received: fresh.clone(),
        }),
        None,
        None,
    );
    assert!(fresh.lock().unwrap().is_empty());
}

#[test]
fn test_resilient_client_drops_unsubscribed_entries() {
    let io = IoLoop::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    let relays: Arc<Mutex<Vec<Arc<dyn ErrorCallbacks>>>> = Arc::new(Mutex::new(Vec::new()));

    let factory_log = log.clone();
    let factory_relays = relays.clone();
    let instances = Arc::new(Mutex::new(0u32));
    let factory: ClientFactory = Box::new(move |relay| {
        let mut count = instances.lock().unwrap();
        *count += 1;
        factory_relays.lock().unwrap().push(relay.clone());
        Ok(Arc::new(FakeClient {
            instance: *count,
            log: factory_log.clone(),
            relay,
        }))
    });

    let outer: Arc<dyn ErrorCallbacks> = Arc::new(NoopCallbacks);
    let client = ResilientClient::new(io.handle(), factory, &outer).unwrap();
    client.start().unwrap();

    let data_callbacks: Arc<dyn SubscriptionCallbacks> = Arc::new(NoopCallbacks);
    let sub1 = Subscription::new();
    let sub2 = Subscription::new();
    client.subscribe("channel/a", &sub1, data_callbacks.clone(), None, None);
    client.subscribe("channel/b", &sub2, data_callbacks.clone(), None, None);
    client.unsubscribe(&sub1, None);

    relays.lock().unwrap()[0].on_error(ClientError::Unknown);

    let replayed: Vec<String> = ops(&log)
        .into_iter()
        .filter(|op| op.starts_with("client2.subscribe"))
        .collect();
    assert_eq!(replayed, vec!["client2.subscribe channel/b"]);
}

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::streams::{publishers, Publisher, Subscriber, SubscriptionHandle};

#[derive(Default)]
struct Events<T> {
    items: Vec<T>,
    completions: u32,
    errors: Vec<String>,
}

impl<T> Events<T> {
    fn terminals(&self) -> u32 {
        self.completions + self.errors.len() as u32
    }
}

/// Test subscriber with a configurable demand strategy: `initial` demand on
/// subscribe, `per_next` more after every element.
struct TestSubscriber<T> {
    events: Arc<Mutex<Events<T>>>,
    handle: Arc<Mutex<Option<SubscriptionHandle>>>,
    initial: u64,
    per_next: u64,
}

impl<T: Send + 'static> TestSubscriber<T> {
    fn new(
        initial: u64,
        per_next: u64,
    ) -> (
        Self,
        Arc<Mutex<Events<T>>>,
        Arc<Mutex<Option<SubscriptionHandle>>>,
    ) {
        let events = Arc::new(Mutex::new(Events {
            items: Vec::new(),
            completions: 0,
            errors: Vec::new(),
        }));
        let handle = Arc::new(Mutex::new(None));
        (
            Self {
                events: events.clone(),
                handle: handle.clone(),
                initial,
                per_next,
            },
            events,
            handle,
        )
    }
}

impl<T: Send + 'static> Subscriber<T> for TestSubscriber<T> {
    fn on_subscribe(&mut self, subscription: SubscriptionHandle) {
        *self.handle.lock().unwrap() = Some(subscription.clone());
        if self.initial > 0 {
            subscription.request(self.initial);
        }
    }

    fn on_next(&mut self, element: T) {
        self.events.lock().unwrap().items.push(element);
        if self.per_next > 0 {
            if let Some(subscription) = self.handle.lock().unwrap().clone() {
                subscription.request(self.per_next);
            }
        }
    }

    fn on_error(&mut self, error: anyhow::Error) {
        self.events.lock().unwrap().errors.push(error.to_string());
    }

    fn on_complete(&mut self) {
        self.events.lock().unwrap().completions += 1;
    }
}

fn wait_until<F: Fn() -> bool>(timeout: Duration, predicate: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    predicate()
}

#[test]
fn test_of_delivers_all_and_completes_once() {
    let (subscriber, events, _) = TestSubscriber::new(u64::MAX, 0);
    publishers::of(vec![1, 2, 3]).subscribe(subscriber);

    let events = events.lock().unwrap();
    assert_eq!(events.items, vec![1, 2, 3]);
    assert_eq!(events.completions, 1);
    assert!(events.errors.is_empty());
}

#[test]
fn test_demand_bounds_delivery() {
    let (subscriber, events, handle) = TestSubscriber::new(2, 0);
    publishers::of(vec![1, 2, 3]).subscribe(subscriber);

    {
        let events = events.lock().unwrap();
        assert_eq!(events.items, vec![1, 2], "only requested demand is served");
        assert_eq!(events.terminals(), 0, "no terminal while demand is unmet");
    }

    let handle = handle.lock().unwrap().clone().unwrap();
    handle.request(5);

    let events = events.lock().unwrap();
    assert_eq!(events.items, vec![1, 2, 3]);
    assert_eq!(events.completions, 1);
}

#[test]
fn test_map_transforms_elements() {
    let (subscriber, events, _) = TestSubscriber::new(u64::MAX, 0);
    publishers::of(vec![1, 2, 3])
        .map(|x| x * 10)
        .subscribe(subscriber);

    let events = events.lock().unwrap();
    assert_eq!(events.items, vec![10, 20, 30]);
    assert_eq!(events.completions, 1);
}

#[test]
fn test_error_publisher_propagates_through_map() {
    let (subscriber, events, _) = TestSubscriber::new(u64::MAX, 0);
    publishers::error::<i32>(anyhow::anyhow!("boom"))
        .map(|x| x + 1)
        .subscribe(subscriber);

    let events = events.lock().unwrap();
    assert!(events.items.is_empty());
    assert_eq!(events.errors, vec!["boom".to_string()]);
    assert_eq!(events.completions, 0);
}

#[test]
fn test_stateful_generator_counts() {
    let (subscriber, events, _) = TestSubscriber::new(u64::MAX, 0);
    crate::streams::generators::stateful(
        || 0u32,
        |count, sink| {
            *count += 1;
            if *count > 3 {
                sink.complete();
            } else {
                sink.next(*count);
            }
        },
    )
    .subscribe(subscriber);

    let events = events.lock().unwrap();
    assert_eq!(events.items, vec![1, 2, 3]);
    assert_eq!(events.completions, 1);
}

#[test]
fn test_generator_is_lazy_until_demand() {
    let started = Arc::new(Mutex::new(false));
    let started_clone = started.clone();
    let publisher: Publisher<i32> = crate::streams::generators::stateful(
        move || {
            *started_clone.lock().unwrap() = true;
        },
        |_state, sink| sink.complete(),
    );

    let (subscriber, events, handle) = TestSubscriber::new(0, 0);
    publisher.subscribe(subscriber);
    assert!(!*started.lock().unwrap(), "init must wait for demand");

    handle.lock().unwrap().clone().unwrap().request(1);
    assert!(*started.lock().unwrap());
    assert_eq!(events.lock().unwrap().completions, 1);
}

#[test]
fn test_concat_orders_streams_and_completes_once() {
    let (subscriber, events, _) = TestSubscriber::new(u64::MAX, 0);
    publishers::concat(publishers::of(vec![1]), publishers::of(vec![2, 3])).subscribe(subscriber);

    let events = events.lock().unwrap();
    assert_eq!(events.items, vec![1, 2, 3]);
    assert_eq!(events.completions, 1);
    assert_eq!(events.terminals(), 1);
}

#[test]
fn test_concat_carries_unmet_demand_into_second() {
    // First stream is empty; demand requested against it must be served by
    // the second stream without a fresh request.
    let (subscriber, events, _) = TestSubscriber::new(2, 0);
    publishers::concat(publishers::empty(), publishers::of(vec![7, 8, 9])).subscribe(subscriber);

    let events = events.lock().unwrap();
    assert_eq!(events.items, vec![7, 8]);
    assert_eq!(events.terminals(), 0);
}

#[test]
fn test_flatten_concatenates_batches() {
    let (subscriber, events, _) = TestSubscriber::new(u64::MAX, 0);
    publishers::of(vec![vec![1, 2], vec![], vec![3]])
        .flatten()
        .subscribe(subscriber);

    let events = events.lock().unwrap();
    assert_eq!(events.items, vec![1, 2, 3]);
    assert_eq!(events.completions, 1);
}

#[test]
fn test_flat_map_inner_error_terminates() {
    let (subscriber, events, _) = TestSubscriber::new(u64::MAX, 0);
    publishers::of(vec![1, 2, 3])
        .flat_map(|x| {
            if x == 2 {
                publishers::error(anyhow::anyhow!("inner failed"))
            } else {
                publishers::of(vec![x])
            }
        })
        .subscribe(subscriber);

    let events = events.lock().unwrap();
    assert_eq!(events.items, vec![1]);
    assert_eq!(events.errors, vec!["inner failed".to_string()]);
    assert_eq!(events.terminals(), 1);
}

#[test]
fn test_flatten_respects_downstream_demand() {
    let (subscriber, events, handle) = TestSubscriber::new(3, 0);
    publishers::of(vec![vec![1, 2], vec![3, 4], vec![5]])
        .flatten()
        .subscribe(subscriber);

    {
        let events = events.lock().unwrap();
        assert_eq!(events.items, vec![1, 2, 3]);
        assert_eq!(events.terminals(), 0);
    }

    handle.lock().unwrap().clone().unwrap().request(10);
    let events = events.lock().unwrap();
    assert_eq!(events.items, vec![1, 2, 3, 4, 5]);
    assert_eq!(events.completions, 1);
}

#[test]
fn test_merge_delivers_everything_and_completes_once() {
    let (subscriber, events, _) = TestSubscriber::new(u64::MAX, 0);
    publishers::merge(vec![
        publishers::of(vec![1, 2]),
        publishers::empty(),
        publishers::of(vec![3]),
    ])
    .subscribe(subscriber);

    let events = events.lock().unwrap();
    let mut sorted = events.items.clone();
    sorted.sort_unstable();
    assert_eq!(sorted, vec![1, 2, 3]);
    assert_eq!(events.completions, 1);
    assert_eq!(events.terminals(), 1);
}

#[test]
fn test_merge_error_terminates_stream() {
    let (subscriber, events, _) = TestSubscriber::new(u64::MAX, 0);
    publishers::merge(vec![
        publishers::of(vec![1]),
        publishers::error(anyhow::anyhow!("merge failure")),
    ])
    .subscribe(subscriber);

    let events = events.lock().unwrap();
    assert_eq!(events.errors, vec!["merge failure".to_string()]);
    assert_eq!(events.terminals(), 1);
}

#[test]
fn test_cancel_is_idempotent_and_stops_delivery() {
    let (subscriber, events, handle) = TestSubscriber::new(1, 0);
    publishers::of(vec![1, 2, 3]).subscribe(subscriber);

    let handle = handle.lock().unwrap().clone().unwrap();
    handle.cancel();
    handle.cancel();
    handle.request(10);

    let events = events.lock().unwrap();
    assert_eq!(events.items, vec![1], "no delivery after cancel");
    assert_eq!(events.terminals(), 0, "cancel is not a terminal signal");
}

#[test]
fn test_threaded_worker_preserves_order_and_terminal() {
    let input: Vec<u32> = (0..200).collect();
    let expected = input.clone();
    let (subscriber, events, _) = TestSubscriber::new(u64::MAX, 0);
    publishers::of(input)
        .threaded_worker("test_worker")
        .flatten()
        .subscribe(subscriber);

    assert!(
        wait_until(Duration::from_secs(5), || events
            .lock()
            .unwrap()
            .completions
            == 1),
        "worker stream did not complete"
    );
    let events = events.lock().unwrap();
    assert_eq!(events.items, expected);
    assert_eq!(events.terminals(), 1);
}

#[test]
fn test_threaded_worker_emits_error_after_elements() {
    let source = publishers::concat(
        publishers::of(vec![1, 2]),
        publishers::error(anyhow::anyhow!("late failure")),
    );
    let (subscriber, events, _) = TestSubscriber::new(u64::MAX, 0);
    source.threaded_worker("test_worker_err").subscribe(subscriber);

    assert!(
        wait_until(Duration::from_secs(5), || !events
            .lock()
            .unwrap()
            .errors
            .is_empty()),
        "worker stream did not fail"
    );
    let events = events.lock().unwrap();
    let received: Vec<u32> = events.items.iter().flatten().copied().collect();
    assert_eq!(received, vec![1, 2], "elements are delivered before the error");
    assert_eq!(events.errors, vec!["late failure".to_string()]);
    assert_eq!(events.terminals(), 1);
}

#[test]
fn test_signal_breaker_completes_on_signal() {
    // An endless generator; only the signal can end it.
    let publisher = crate::streams::generators::stateful(|| 0u64, |n, sink| {
        *n += 1;
        sink.next(*n);
    })
    .threaded_worker("test_signal_src")
    .flatten()
    .signal_breaker(&[signal_hook::consts::SIGUSR1]);

    let (subscriber, events, _) = TestSubscriber::new(0, 0);
    publisher.subscribe(subscriber);

    // Give the watcher thread a moment to install the handler, then fire.
    std::thread::sleep(Duration::from_millis(50));
    signal_hook::low_level::raise(signal_hook::consts::SIGUSR1).unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || events
            .lock()
            .unwrap()
            .completions
            == 1),
        "signal did not complete the stream"
    );
    assert_eq!(events.lock().unwrap().terminals(), 1);
}

//! Demand-driven streams: lazy publishers, subscribers and the operators the
//! pipelines are composed from. Everything runs on whichever thread delivers
//! a signal; `threaded_worker` is the only operator that crosses threads.

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

mod flatten;
pub mod generators;
mod merge;
mod signal;
mod worker;

#[cfg(test)]
#[path = "streams_test.rs"]
mod streams_test;

/// Demand and cancellation handle issued to a subscriber. Holding one never
/// keeps the publisher alive: implementations reference their producer state
/// weakly.
pub trait Subscription: Send + Sync {
    /// Adds `n` to the outstanding demand.
    fn request(&self, n: u64);
    /// Stops the upstream promptly. Idempotent; a no-op after a terminal.
    fn cancel(&self);
}

pub type SubscriptionHandle = Arc<dyn Subscription>;

/// Receives exactly one `on_subscribe`, then zero or more `on_next` bounded
/// by requested demand, then at most one of `on_complete` / `on_error`.
pub trait Subscriber<T>: Send {
    fn on_subscribe(&mut self, subscription: SubscriptionHandle);
    fn on_next(&mut self, element: T);
    fn on_error(&mut self, error: anyhow::Error);
    fn on_complete(&mut self);
}

pub type BoxSubscriber<T> = Box<dyn Subscriber<T>>;

pub trait PublisherImpl<T>: Send {
    fn subscribe(self: Box<Self>, subscriber: BoxSubscriber<T>);
}

/// A lazy stream of `T`. Consumed by `subscribe` (at most once); nothing is
/// produced until the subscriber requests demand.
pub struct Publisher<T> {
    inner: Box<dyn PublisherImpl<T>>,
}

impl<T: Send + 'static> Publisher<T> {
    pub fn new(inner: impl PublisherImpl<T> + 'static) -> Self {
        Self {
            inner: Box::new(inner),
        }
    }

    pub fn subscribe(self, subscriber: impl Subscriber<T> + 'static) {
        self.inner.subscribe(Box::new(subscriber));
    }

    pub(crate) fn subscribe_boxed(self, subscriber: BoxSubscriber<T>) {
        self.inner.subscribe(subscriber);
    }

    /// Applies `f` to every element. Completion and errors pass through.
    pub fn map<U, F>(self, f: F) -> Publisher<U>
    where
        U: Send + 'static,
        F: FnMut(T) -> U + Send + 'static,
    {
        Publisher::new(MapPublisher {
            source: self,
            f,
            _marker: PhantomData,
        })
    }

    /// Subscribes to each produced publisher in turn, forwarding its
    /// elements. At most one inner subscription is active at a time.
    pub fn flatten<U>(self) -> Publisher<U>
    where
        U: Send + 'static,
        T: IntoPublisher<U>,
    {
        flatten::flatten(self)
    }

    pub fn flat_map<U, P, F>(self, f: F) -> Publisher<U>
    where
        U: Send + 'static,
        P: IntoPublisher<U> + Send + 'static,
        F: FnMut(T) -> P + Send + 'static,
    {
        self.map(f).flatten()
    }

    /// Decouples upstream and downstream with a dedicated worker thread.
    /// Elements queued while downstream is busy are delivered as one batch;
    /// upstream demand is withheld while the queue is full. An upstream
    /// terminal is emitted after the last element.
    pub fn threaded_worker(self, name: impl Into<String>) -> Publisher<VecDeque<T>> {
        worker::threaded_worker(self, name.into())
    }

    /// Completes downstream and cancels upstream on the first of the given
    /// process signals.
    pub fn signal_breaker(self, signals: &[i32]) -> Publisher<T> {
        signal::signal_breaker(self, signals.to_vec())
    }
}

/// Conversion into a publisher; lets `flatten` accept batches as well as
/// publishers of publishers.
pub trait IntoPublisher<T>: Send {
    fn into_publisher(self) -> Publisher<T>;
}

impl<T: Send + 'static> IntoPublisher<T> for Publisher<T> {
    fn into_publisher(self) -> Publisher<T> {
        self
    }
}

impl<T: Send + 'static> IntoPublisher<T> for VecDeque<T> {
    fn into_publisher(self) -> Publisher<T> {
        publishers::of(self)
    }
}

impl<T: Send + 'static> IntoPublisher<T> for Vec<T> {
    fn into_publisher(self) -> Publisher<T> {
        publishers::of(self)
    }
}

struct MapPublisher<T, U, F> {
    source: Publisher<T>,
    f: F,
    _marker: PhantomData<fn(T) -> U>,
}

impl<T, U, F> PublisherImpl<U> for MapPublisher<T, U, F>
where
    T: Send + 'static,
    U: Send + 'static,
    F: FnMut(T) -> U + Send + 'static,
{
    fn subscribe(self: Box<Self>, subscriber: BoxSubscriber<U>) {
        self.source.inner.subscribe(Box::new(MapSubscriber {
            f: self.f,
            downstream: subscriber,
            _marker: PhantomData,
        }));
    }
}

struct MapSubscriber<T, U, F> {
    f: F,
    downstream: BoxSubscriber<U>,
    _marker: PhantomData<fn(T) -> U>,
}

impl<T, U, F> Subscriber<T> for MapSubscriber<T, U, F>
where
    T: Send + 'static,
    U: Send + 'static,
    F: FnMut(T) -> U + Send + 'static,
{
    fn on_subscribe(&mut self, subscription: SubscriptionHandle) {
        self.downstream.on_subscribe(subscription);
    }

    fn on_next(&mut self, element: T) {
        let mapped = (self.f)(element);
        self.downstream.on_next(mapped);
    }

    fn on_error(&mut self, error: anyhow::Error) {
        self.downstream.on_error(error);
    }

    fn on_complete(&mut self) {
        self.downstream.on_complete();
    }
}

pub mod publishers {
    use super::*;

    /// Publishes the items of `iterable` on demand, then completes.
    pub fn of<T, I>(iterable: I) -> Publisher<T>
    where
        T: Send + 'static,
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        let mut iter = iterable.into_iter();
        generators::stateful(
            move || (),
            move |_state, sink| match iter.next() {
                Some(element) => sink.next(element),
                None => sink.complete(),
            },
        )
    }

    /// Completes without producing anything.
    pub fn empty<T: Send + 'static>() -> Publisher<T> {
        of(Vec::new())
    }

    /// Fails with `error` as soon as it is subscribed to.
    pub fn error<T: Send + 'static>(error: anyhow::Error) -> Publisher<T> {
        Publisher::new(ErrorPublisher {
            error,
            _marker: PhantomData,
        })
    }

    /// Publishes all of `first`, then all of `second`. Errors of either
    /// stream are forwarded.
    pub fn concat<T: Send + 'static>(first: Publisher<T>, second: Publisher<T>) -> Publisher<T> {
        Publisher::new(ConcatPublisher { first, second })
    }

    /// Interleaves the given streams; completes when all of them complete,
    /// fails on the first error.
    pub fn merge<T: Send + 'static>(sources: Vec<Publisher<T>>) -> Publisher<T> {
        super::merge::merge(sources)
    }

    struct ErrorPublisher<T> {
        error: anyhow::Error,
        _marker: PhantomData<fn() -> T>,
    }

    impl<T: Send + 'static> PublisherImpl<T> for ErrorPublisher<T> {
        fn subscribe(self: Box<Self>, mut subscriber: BoxSubscriber<T>) {
            subscriber.on_subscribe(Arc::new(NoopSubscription));
            subscriber.on_error(self.error);
        }
    }

    struct NoopSubscription;

    impl Subscription for NoopSubscription {
        fn request(&self, _n: u64) {}
        fn cancel(&self) {}
    }

    struct ConcatPublisher<T> {
        first: Publisher<T>,
        second: Publisher<T>,
    }

    impl<T: Send + 'static> PublisherImpl<T> for ConcatPublisher<T> {
        fn subscribe(self: Box<Self>, subscriber: BoxSubscriber<T>) {
            let ctl = Arc::new(Mutex::new(ConcatCtl {
                upstream: None,
                outstanding: 0,
                cancelled: false,
            }));
            self.first.inner.subscribe(Box::new(ConcatSubscriber {
                ctl,
                downstream: Some(subscriber),
                second: Some(self.second),
                first_phase: true,
            }));
        }
    }

    struct ConcatCtl {
        upstream: Option<SubscriptionHandle>,
        outstanding: u64,
        cancelled: bool,
    }

    struct ConcatSubscriber<T> {
        ctl: Arc<Mutex<ConcatCtl>>,
        downstream: Option<BoxSubscriber<T>>,
        second: Option<Publisher<T>>,
        first_phase: bool,
    }

    impl<T: Send + 'static> Subscriber<T> for ConcatSubscriber<T> {
        fn on_subscribe(&mut self, subscription: SubscriptionHandle) {
            let replay = {
                let mut guard = self.ctl.lock().unwrap();
                if guard.cancelled {
                    drop(guard);
                    subscription.cancel();
                    return;
                }
                let outstanding = guard.outstanding;
                guard.upstream = Some(subscription.clone());
                outstanding
            };
            if self.first_phase {
                if let Some(downstream) = self.downstream.as_mut() {
                    downstream.on_subscribe(Arc::new(ConcatSubscription {
                        ctl: self.ctl.clone(),
                    }));
                }
            } else if replay > 0 {
                subscription.request(replay);
            }
        }

        fn on_next(&mut self, element: T) {
            {
                let mut guard = self.ctl.lock().unwrap();
                guard.outstanding = guard.outstanding.saturating_sub(1);
            }
            if let Some(downstream) = self.downstream.as_mut() {
                downstream.on_next(element);
            }
        }

        fn on_error(&mut self, error: anyhow::Error) {
            if let Some(mut downstream) = self.downstream.take() {
                downstream.on_error(error);
            }
        }

        fn on_complete(&mut self) {
            if self.first_phase {
                let downstream = self.downstream.take();
                if let Some(second) = self.second.take() {
                    second.inner.subscribe(Box::new(ConcatSubscriber {
                        ctl: self.ctl.clone(),
                        downstream,
                        second: None,
                        first_phase: false,
                    }));
                }
            } else if let Some(mut downstream) = self.downstream.take() {
                downstream.on_complete();
            }
        }
    }

    struct ConcatSubscription {
        ctl: Arc<Mutex<ConcatCtl>>,
    }

    impl Subscription for ConcatSubscription {
        fn request(&self, n: u64) {
            let upstream = {
                let mut guard = self.ctl.lock().unwrap();
                if guard.cancelled {
                    return;
                }
                guard.outstanding = guard.outstanding.saturating_add(n);
                guard.upstream.clone()
            };
            if let Some(upstream) = upstream {
                upstream.request(n);
            }
        }

        fn cancel(&self) {
            let upstream = {
                let mut guard = self.ctl.lock().unwrap();
                if guard.cancelled {
                    return;
                }
                guard.cancelled = true;
                guard.upstream.take()
            };
            if let Some(upstream) = upstream {
                upstream.cancel();
            }
        }
    }
}

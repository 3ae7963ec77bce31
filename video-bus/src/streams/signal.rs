use std::sync::{Arc, Mutex};
use std::thread;

use signal_hook::iterator::backend::Handle;
use signal_hook::iterator::Signals;

use super::{BoxSubscriber, Publisher, PublisherImpl, Subscriber, Subscription, SubscriptionHandle};

pub(super) fn signal_breaker<T: Send + 'static>(
    source: Publisher<T>,
    signals: Vec<i32>,
) -> Publisher<T> {
    Publisher::new(SignalBreakerPublisher { source, signals })
}

struct SignalBreakerPublisher<T> {
    source: Publisher<T>,
    signals: Vec<i32>,
}

struct BreakerCtl<T> {
    downstream: Option<BoxSubscriber<T>>,
    upstream: Option<SubscriptionHandle>,
    watcher: Option<Handle>,
    /// Demand requested before the upstream subscription arrived.
    pending: u64,
    terminated: bool,
}

type Shared<T> = Arc<Mutex<BreakerCtl<T>>>;

impl<T: Send + 'static> PublisherImpl<T> for SignalBreakerPublisher<T> {
    fn subscribe(self: Box<Self>, mut subscriber: BoxSubscriber<T>) {
        let mut signals = match Signals::new(&self.signals) {
            Ok(signals) => signals,
            Err(e) => {
                subscriber.on_subscribe(Arc::new(DeadSubscription));
                subscriber.on_error(anyhow::anyhow!("installing signal handlers: {}", e));
                return;
            }
        };

        let ctl: Shared<T> = Arc::new(Mutex::new(BreakerCtl {
            downstream: None,
            upstream: None,
            watcher: Some(signals.handle()),
            pending: 0,
            terminated: false,
        }));

        let watcher_ctl = ctl.clone();
        thread::Builder::new()
            .name("signal_breaker".to_string())
            .spawn(move || {
                if let Some(signal) = signals.forever().next() {
                    log::info!("got signal {}, breaking pipeline", signal);
                    break_pipeline(&watcher_ctl);
                }
            })
            .unwrap_or_else(|e| panic!("failed to spawn signal_breaker thread: {}", e));

        subscriber.on_subscribe(Arc::new(BreakerSubscription { ctl: ctl.clone() }));
        {
            let mut guard = ctl.lock().unwrap();
            if guard.terminated {
                return;
            }
            guard.downstream = Some(subscriber);
        }
        self.source.subscribe_boxed(Box::new(ForwardSubscriber { ctl }));
    }
}

/// Completes downstream and cancels upstream; runs on the watcher thread.
fn break_pipeline<T>(ctl: &Shared<T>) {
    let (downstream, upstream, watcher) = {
        let mut guard = ctl.lock().unwrap();
        if guard.terminated {
            return;
        }
        guard.terminated = true;
        (
            guard.downstream.take(),
            guard.upstream.take(),
            guard.watcher.take(),
        )
    };
    if let Some(upstream) = upstream {
        upstream.cancel();
    }
    if let Some(watcher) = watcher {
        watcher.close();
    }
    if let Some(mut downstream) = downstream {
        downstream.on_complete();
    }
}

struct ForwardSubscriber<T> {
    ctl: Shared<T>,
}

impl<T: Send + 'static> ForwardSubscriber<T> {
    fn terminate(&self) -> Option<BoxSubscriber<T>> {
        let mut guard = self.ctl.lock().unwrap();
        if guard.terminated {
            return None;
        }
        guard.terminated = true;
        guard.upstream = None;
        if let Some(watcher) = guard.watcher.take() {
            watcher.close();
        }
        guard.downstream.take()
    }
}

impl<T: Send + 'static> Subscriber<T> for ForwardSubscriber<T> {
    fn on_subscribe(&mut self, subscription: SubscriptionHandle) {
        let replay = {
            let mut guard = self.ctl.lock().unwrap();
            if guard.terminated {
                drop(guard);
                subscription.cancel();
                return;
            }
            guard.upstream = Some(subscription.clone());
            std::mem::take(&mut guard.pending)
        };
        if replay > 0 {
            subscription.request(replay);
        }
    }

    fn on_next(&mut self, element: T) {
        let downstream = {
            let mut guard = self.ctl.lock().unwrap();
            if guard.terminated {
                return;
            }
            guard.downstream.take()
        };
        let Some(mut downstream) = downstream else {
            return;
        };
        downstream.on_next(element);
        let mut guard = self.ctl.lock().unwrap();
        if guard.terminated {
            // A signal fired while the element was in flight; the watcher
            // could not reach the subscriber, so complete it here.
            drop(guard);
            downstream.on_complete();
        } else {
            guard.downstream = Some(downstream);
        }
    }

    fn on_error(&mut self, error: anyhow::Error) {
        if let Some(mut downstream) = self.terminate() {
            downstream.on_error(error);
        }
    }

    fn on_complete(&mut self) {
        if let Some(mut downstream) = self.terminate() {
            downstream.on_complete();
        }
    }
}

struct BreakerSubscription<T> {
    ctl: Shared<T>,
}

impl<T: Send + 'static> Subscription for BreakerSubscription<T> {
    fn request(&self, n: u64) {
        let upstream = {
            let mut guard = self.ctl.lock().unwrap();
            if guard.terminated {
                return;
            }
            match guard.upstream.clone() {
                Some(upstream) => upstream,
                None => {
                    guard.pending = guard.pending.saturating_add(n);
                    return;
                }
            }
        };
        upstream.request(n);
    }

    fn cancel(&self) {
        let (upstream, watcher) = {
            let mut guard = self.ctl.lock().unwrap();
            if guard.terminated {
                return;
            }
            guard.terminated = true;
            guard.downstream = None;
            (guard.upstream.take(), guard.watcher.take())
        };
        if let Some(upstream) = upstream {
            upstream.cancel();
        }
        if let Some(watcher) = watcher {
            watcher.close();
        }
    }
}

struct DeadSubscription;

impl Subscription for DeadSubscription {
    fn request(&self, _n: u64) {}
    fn cancel(&self) {}
}

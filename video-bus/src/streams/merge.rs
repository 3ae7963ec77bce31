use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::{BoxSubscriber, Publisher, PublisherImpl, Subscriber, Subscription, SubscriptionHandle};

/// Interleaves several streams: elements are forwarded as their upstream
/// produces them, the merged stream completes when every upstream has
/// completed, and the first error terminates it. Demand is forwarded to all
/// upstreams; the surplus is buffered.
pub(super) fn merge<T: Send + 'static>(sources: Vec<Publisher<T>>) -> Publisher<T> {
    Publisher::new(MergePublisher { sources })
}

struct MergePublisher<T> {
    sources: Vec<Publisher<T>>,
}

impl<T: Send + 'static> PublisherImpl<T> for MergePublisher<T> {
    fn subscribe(self: Box<Self>, mut subscriber: BoxSubscriber<T>) {
        if self.sources.is_empty() {
            subscriber.on_subscribe(Arc::new(IdleSubscription));
            subscriber.on_complete();
            return;
        }

        let ctl: Shared<T> = Arc::new(Mutex::new(MergeCtl {
            downstream: None,
            upstreams: Vec::new(),
            live: self.sources.len(),
            outstanding: 0,
            buffered: VecDeque::new(),
            failed: None,
            draining: false,
            terminated: false,
            cancelled: false,
        }));

        subscriber.on_subscribe(Arc::new(MergeSubscription { ctl: ctl.clone() }));
        {
            let mut guard = ctl.lock().unwrap();
            if guard.cancelled {
                return;
            }
            guard.downstream = Some(subscriber);
        }
        for source in self.sources {
            source.subscribe_boxed(Box::new(MergeUpstream { ctl: ctl.clone() }));
        }
    }
}

struct MergeCtl<T> {
    downstream: Option<BoxSubscriber<T>>,
    upstreams: Vec<SubscriptionHandle>,
    /// Upstreams that have not completed yet.
    live: usize,
    outstanding: u64,
    buffered: VecDeque<T>,
    failed: Option<anyhow::Error>,
    draining: bool,
    terminated: bool,
    cancelled: bool,
}

type Shared<T> = Arc<Mutex<MergeCtl<T>>>;

fn drain<T: Send + 'static>(ctl: &Shared<T>) {
    let mut subscriber = {
        let mut guard = ctl.lock().unwrap();
        if guard.draining || guard.terminated || guard.cancelled {
            return;
        }
        guard.draining = true;
        guard.downstream.take()
    };

    loop {
        enum Step<T> {
            Emit(T),
            Fail(anyhow::Error),
            Complete,
            Idle,
        }
        let step = {
            let mut guard = ctl.lock().unwrap();
            if guard.cancelled {
                Step::Idle
            } else if guard.outstanding > 0 && !guard.buffered.is_empty() {
                guard.outstanding -= 1;
                Step::Emit(guard.buffered.pop_front().unwrap())
            } else if guard.buffered.is_empty() && guard.failed.is_some() {
                guard.terminated = true;
                Step::Fail(guard.failed.take().unwrap())
            } else if guard.buffered.is_empty() && guard.live == 0 {
                guard.terminated = true;
                Step::Complete
            } else {
                guard.downstream = subscriber.take();
                guard.draining = false;
                return;
            }
        };
        match step {
            Step::Emit(element) => {
                if let Some(subscriber) = subscriber.as_mut() {
                    subscriber.on_next(element);
                }
            }
            Step::Fail(error) => {
                let upstreams = {
                    let mut guard = ctl.lock().unwrap();
                    guard.draining = false;
                    std::mem::take(&mut guard.upstreams)
                };
                for upstream in upstreams {
                    upstream.cancel();
                }
                if let Some(subscriber) = subscriber.as_mut() {
                    subscriber.on_error(error);
                }
                return;
            }
            Step::Complete => {
                ctl.lock().unwrap().draining = false;
                if let Some(subscriber) = subscriber.as_mut() {
                    subscriber.on_complete();
                }
                return;
            }
            Step::Idle => {
                ctl.lock().unwrap().draining = false;
                return;
            }
        }
    }
}

struct MergeUpstream<T> {
    ctl: Shared<T>,
}

impl<T: Send + 'static> Subscriber<T> for MergeUpstream<T> {
    fn on_subscribe(&mut self, subscription: SubscriptionHandle) {
        let replay = {
            let mut guard = self.ctl.lock().unwrap();
            if guard.cancelled || guard.terminated {
                drop(guard);
                subscription.cancel();
                return;
            }
            guard.upstreams.push(subscription.clone());
            guard.outstanding
        };
        if replay > 0 {
            subscription.request(replay);
        }
    }

    fn on_next(&mut self, element: T) {
        {
            let mut guard = self.ctl.lock().unwrap();
            if guard.cancelled || guard.terminated {
                return;
            }
            guard.buffered.push_back(element);
        }
        drain(&self.ctl);
    }

    fn on_error(&mut self, error: anyhow::Error) {
        {
            let mut guard = self.ctl.lock().unwrap();
            if guard.cancelled || guard.terminated || guard.failed.is_some() {
                return;
            }
            guard.failed = Some(error);
        }
        drain(&self.ctl);
    }

    fn on_complete(&mut self) {
        {
            let mut guard = self.ctl.lock().unwrap();
            if guard.cancelled || guard.terminated {
                return;
            }
            guard.live = guard.live.saturating_sub(1);
            if guard.live > 0 {
                return;
            }
        }
        drain(&self.ctl);
    }
}

struct MergeSubscription<T> {
    ctl: Shared<T>,
}

impl<T: Send + 'static> Subscription for MergeSubscription<T> {
    fn request(&self, n: u64) {
        let upstreams = {
            let mut guard = self.ctl.lock().unwrap();
            if guard.cancelled || guard.terminated {
                return;
            }
            guard.outstanding = guard.outstanding.saturating_add(n);
            guard.upstreams.clone()
        };
        for upstream in upstreams {
            upstream.request(n);
        }
        drain(&self.ctl);
    }

    fn cancel(&self) {
        let upstreams = {
            let mut guard = self.ctl.lock().unwrap();
            if guard.cancelled || guard.terminated {
                return;
            }
            guard.cancelled = true;
            guard.downstream = None;
            guard.buffered.clear();
            std::mem::take(&mut guard.upstreams)
        };
        for upstream in upstreams {
            upstream.cancel();
        }
    }
}

struct IdleSubscription;

impl Subscription for IdleSubscription {
    fn request(&self, _n: u64) {}
    fn cancel(&self) {}
}

use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use super::{
    BoxSubscriber, IntoPublisher, Publisher, PublisherImpl, Subscriber, Subscription,
    SubscriptionHandle,
};

pub(super) fn flatten<O, T>(source: Publisher<O>) -> Publisher<T>
where
    O: IntoPublisher<T> + Send + 'static,
    T: Send + 'static,
{
    Publisher::new(FlattenPublisher {
        source,
        _marker: PhantomData,
    })
}

struct FlattenPublisher<O, T> {
    source: Publisher<O>,
    _marker: PhantomData<fn(O) -> T>,
}

impl<O, T> PublisherImpl<T> for FlattenPublisher<O, T>
where
    O: IntoPublisher<T> + Send + 'static,
    T: Send + 'static,
{
    fn subscribe(self: Box<Self>, mut subscriber: BoxSubscriber<T>) {
        let ctl: Shared<T> = Arc::new(Mutex::new(FlattenCtl {
            downstream: None,
            outer: None,
            inner: None,
            outstanding: 0,
            inner_active: false,
            outer_pending: false,
            outer_done: false,
            terminated: false,
            cancelled: false,
        }));

        subscriber.on_subscribe(Arc::new(FlattenSubscription { ctl: ctl.clone() }));
        {
            let mut guard = ctl.lock().unwrap();
            if guard.cancelled {
                return;
            }
            guard.downstream = Some(subscriber);
        }
        self.source.subscribe_boxed(Box::new(OuterSubscriber {
            ctl,
            _marker: PhantomData,
        }));
    }
}

struct FlattenCtl<T> {
    downstream: Option<BoxSubscriber<T>>,
    outer: Option<SubscriptionHandle>,
    inner: Option<SubscriptionHandle>,
    /// Downstream demand not yet satisfied by an inner element.
    outstanding: u64,
    inner_active: bool,
    /// One element has been requested from the outer stream and not yet
    /// delivered.
    outer_pending: bool,
    outer_done: bool,
    terminated: bool,
    cancelled: bool,
}

type Shared<T> = Arc<Mutex<FlattenCtl<T>>>;

struct OuterSubscriber<O, T> {
    ctl: Shared<T>,
    _marker: PhantomData<fn(O)>,
}

impl<O, T> Subscriber<O> for OuterSubscriber<O, T>
where
    O: IntoPublisher<T> + Send + 'static,
    T: Send + 'static,
{
    fn on_subscribe(&mut self, subscription: SubscriptionHandle) {
        let request_one = {
            let mut guard = self.ctl.lock().unwrap();
            if guard.cancelled {
                drop(guard);
                subscription.cancel();
                return;
            }
            guard.outer = Some(subscription.clone());
            if guard.outstanding > 0 && !guard.inner_active && !guard.outer_pending {
                guard.outer_pending = true;
                true
            } else {
                false
            }
        };
        if request_one {
            subscription.request(1);
        }
    }

    fn on_next(&mut self, element: O) {
        {
            let mut guard = self.ctl.lock().unwrap();
            guard.outer_pending = false;
            if guard.cancelled || guard.terminated {
                return;
            }
            guard.inner_active = true;
        }
        element.into_publisher().subscribe_boxed(Box::new(InnerSubscriber {
            ctl: self.ctl.clone(),
        }));
    }

    fn on_error(&mut self, error: anyhow::Error) {
        let (downstream, inner) = {
            let mut guard = self.ctl.lock().unwrap();
            if guard.terminated || guard.cancelled {
                return;
            }
            guard.terminated = true;
            (guard.downstream.take(), guard.inner.take())
        };
        if let Some(inner) = inner {
            inner.cancel();
        }
        if let Some(mut downstream) = downstream {
            downstream.on_error(error);
        }
    }

    fn on_complete(&mut self) {
        let downstream = {
            let mut guard = self.ctl.lock().unwrap();
            guard.outer_done = true;
            if guard.inner_active || guard.terminated || guard.cancelled {
                return;
            }
            guard.terminated = true;
            guard.downstream.take()
        };
        if let Some(mut downstream) = downstream {
            downstream.on_complete();
        }
    }
}

struct InnerSubscriber<T> {
    ctl: Shared<T>,
}

impl<T: Send + 'static> Subscriber<T> for InnerSubscriber<T> {
    fn on_subscribe(&mut self, subscription: SubscriptionHandle) {
        let replay = {
            let mut guard = self.ctl.lock().unwrap();
            if guard.cancelled || guard.terminated {
                drop(guard);
                subscription.cancel();
                return;
            }
            guard.inner = Some(subscription.clone());
            guard.outstanding
        };
        if replay > 0 {
            subscription.request(replay);
        }
    }

    fn on_next(&mut self, element: T) {
        let downstream = {
            let mut guard = self.ctl.lock().unwrap();
            if guard.cancelled || guard.terminated {
                return;
            }
            guard.outstanding = guard.outstanding.saturating_sub(1);
            guard.downstream.take()
        };
        let Some(mut downstream) = downstream else {
            return;
        };
        downstream.on_next(element);
        let mut guard = self.ctl.lock().unwrap();
        if !guard.cancelled && !guard.terminated {
            guard.downstream = Some(downstream);
        }
    }

    fn on_error(&mut self, error: anyhow::Error) {
        let (downstream, outer) = {
            let mut guard = self.ctl.lock().unwrap();
            guard.inner_active = false;
            guard.inner = None;
            if guard.terminated || guard.cancelled {
                return;
            }
            guard.terminated = true;
            (guard.downstream.take(), guard.outer.take())
        };
        if let Some(outer) = outer {
            outer.cancel();
        }
        if let Some(mut downstream) = downstream {
            downstream.on_error(error);
        }
    }

    fn on_complete(&mut self) {
        enum Next<T> {
            Complete(BoxSubscriber<T>),
            RequestOuter(SubscriptionHandle),
            Wait,
        }
        let next = {
            let mut guard = self.ctl.lock().unwrap();
            guard.inner_active = false;
            guard.inner = None;
            if guard.terminated || guard.cancelled {
                Next::Wait
            } else if guard.outer_done {
                guard.terminated = true;
                match guard.downstream.take() {
                    Some(downstream) => Next::Complete(downstream),
                    None => Next::Wait,
                }
            } else if guard.outstanding > 0 && !guard.outer_pending {
                match guard.outer.clone() {
                    Some(outer) => {
                        guard.outer_pending = true;
                        Next::RequestOuter(outer)
                    }
                    None => Next::Wait,
                }
            } else {
                Next::Wait
            }
        };
        match next {
            Next::Complete(mut downstream) => downstream.on_complete(),
            Next::RequestOuter(outer) => outer.request(1),
            Next::Wait => {}
        }
    }
}

struct FlattenSubscription<T> {
    ctl: Shared<T>,
}

impl<T: Send + 'static> Subscription for FlattenSubscription<T> {
    fn request(&self, n: u64) {
        enum Target {
            Inner(SubscriptionHandle),
            Outer(SubscriptionHandle),
            None,
        }
        let target = {
            let mut guard = self.ctl.lock().unwrap();
            if guard.cancelled || guard.terminated {
                return;
            }
            guard.outstanding = guard.outstanding.saturating_add(n);
            if guard.inner_active {
                match guard.inner.clone() {
                    Some(inner) => Target::Inner(inner),
                    None => Target::None,
                }
            } else if !guard.outer_pending && !guard.outer_done {
                match guard.outer.clone() {
                    Some(outer) => {
                        guard.outer_pending = true;
                        Target::Outer(outer)
                    }
                    None => Target::None,
                }
            } else {
                Target::None
            }
        };
        match target {
            Target::Inner(inner) => inner.request(n),
            Target::Outer(outer) => outer.request(1),
            Target::None => {}
        }
    }

    fn cancel(&self) {
        let (outer, inner) = {
            let mut guard = self.ctl.lock().unwrap();
            if guard.cancelled || guard.terminated {
                return;
            }
            guard.cancelled = true;
            guard.downstream = None;
            (guard.outer.take(), guard.inner.take())
        };
        if let Some(inner) = inner {
            inner.cancel();
        }
        if let Some(outer) = outer {
            outer.cancel();
        }
    }
}

//! Stateful generator sources. The producer state lives behind a mutex and
//! owns itself (via a self reference) until a terminal signal or a cancel
//! releases it, so a subscription handle never extends its life.

use std::sync::{Arc, Mutex, Weak};

use super::{BoxSubscriber, Publisher, PublisherImpl, Subscriber, Subscription};

/// Emission surface handed to the pump. A pump invocation services one unit
/// of demand: emit at most one element per call, or terminate the stream.
pub struct Sink<'a, T> {
    subscriber: &'a mut BoxSubscriber<T>,
    terminal: Option<()>,
}

impl<T> Sink<'_, T> {
    pub fn next(&mut self, element: T) {
        if self.terminal.is_some() {
            return;
        }
        self.subscriber.on_next(element);
    }

    pub fn complete(&mut self) {
        if self.terminal.is_some() {
            return;
        }
        self.terminal = Some(());
        self.subscriber.on_complete();
    }

    pub fn error(&mut self, error: anyhow::Error) {
        if self.terminal.is_some() {
            return;
        }
        self.terminal = Some(());
        self.subscriber.on_error(error);
    }
}

/// Builds a lazy source: `init` runs when demand first arrives and produces
/// the pump state; `pump` then runs once per requested element.
pub fn stateful<S, T, I, P>(init: I, pump: P) -> Publisher<T>
where
    S: Send + 'static,
    T: Send + 'static,
    I: FnOnce() -> S + Send + 'static,
    P: FnMut(&mut S, &mut Sink<'_, T>) + Send + 'static,
{
    Publisher::new(GenPublisher {
        init: Some(Box::new(init)),
        pump: Box::new(pump),
    })
}

type Init<S> = Box<dyn FnOnce() -> S + Send>;
type Pump<S, T> = Box<dyn FnMut(&mut S, &mut Sink<'_, T>) + Send>;

struct GenPublisher<S, T> {
    init: Option<Init<S>>,
    pump: Pump<S, T>,
}

impl<S, T> PublisherImpl<T> for GenPublisher<S, T>
where
    S: Send + 'static,
    T: Send + 'static,
{
    fn subscribe(self: Box<Self>, mut subscriber: BoxSubscriber<T>) {
        let core = Arc::new(GenCore {
            inner: Mutex::new(GenInner {
                init: self.init,
                pump: Some(self.pump),
                state: None,
                subscriber: None,
                requested: 0,
                draining: true,
                cancelled: false,
                terminated: false,
                self_ref: None,
            }),
        });
        core.inner.lock().unwrap().self_ref = Some(core.clone());

        subscriber.on_subscribe(Arc::new(GenSubscription {
            core: Arc::downgrade(&core),
        }));

        let run = {
            let mut guard = core.inner.lock().unwrap();
            if guard.cancelled {
                guard.self_ref = None;
                false
            } else {
                guard.subscriber = Some(subscriber);
                guard.draining = false;
                guard.requested > 0
            }
        };
        if run {
            GenCore::drain(&core);
        }
    }
}

struct GenCore<S, T> {
    inner: Mutex<GenInner<S, T>>,
}

struct GenInner<S, T> {
    init: Option<Init<S>>,
    pump: Option<Pump<S, T>>,
    state: Option<S>,
    subscriber: Option<BoxSubscriber<T>>,
    requested: u64,
    draining: bool,
    cancelled: bool,
    terminated: bool,
    /// Self-ownership: cleared on terminal or cancel, which drops the state.
    self_ref: Option<Arc<GenCore<S, T>>>,
}

impl<S, T> GenCore<S, T>
where
    S: Send + 'static,
    T: Send + 'static,
{
    fn drain(core: &Arc<Self>) {
        let (mut subscriber, mut pump, init, mut state) = {
            let mut guard = core.inner.lock().unwrap();
            if guard.draining || guard.terminated {
                return;
            }
            if guard.cancelled {
                Self::release(&mut guard);
                return;
            }
            if guard.requested == 0 {
                return;
            }
            guard.draining = true;
            (
                guard.subscriber.take(),
                guard.pump.take(),
                guard.init.take(),
                guard.state.take(),
            )
        };

        if state.is_none() {
            if let Some(init) = init {
                state = Some(init());
            }
        }

        let mut finished = false;
        loop {
            {
                let mut guard = core.inner.lock().unwrap();
                if guard.cancelled {
                    finished = true;
                    break;
                }
                if guard.requested == 0 {
                    // Restore under the lock so demand arriving right now is
                    // either seen here or drives a fresh drain itself.
                    guard.subscriber = subscriber.take();
                    guard.pump = pump.take();
                    guard.state = state.take();
                    guard.draining = false;
                    return;
                }
                guard.requested -= 1;
            }

            let (sub, pmp, st) = match (subscriber.as_mut(), pump.as_mut(), state.as_mut()) {
                (Some(sub), Some(pmp), Some(st)) => (sub, pmp, st),
                _ => {
                    finished = true;
                    break;
                }
            };
            let mut sink = Sink {
                subscriber: sub,
                terminal: None,
            };
            pmp(st, &mut sink);
            if sink.terminal.is_some() {
                finished = true;
                break;
            }
        }

        if finished {
            let mut guard = core.inner.lock().unwrap();
            guard.terminated = true;
            guard.draining = false;
            Self::release(&mut guard);
        }
    }

    fn release(inner: &mut GenInner<S, T>) {
        inner.subscriber = None;
        inner.pump = None;
        inner.init = None;
        inner.state = None;
        inner.self_ref = None;
    }
}

struct GenSubscription<S, T> {
    core: Weak<GenCore<S, T>>,
}

impl<S, T> Subscription for GenSubscription<S, T>
where
    S: Send + 'static,
    T: Send + 'static,
{
    fn request(&self, n: u64) {
        let Some(core) = self.core.upgrade() else {
            return;
        };
        {
            let mut guard = core.inner.lock().unwrap();
            if guard.terminated || guard.cancelled {
                return;
            }
            guard.requested = guard.requested.saturating_add(n);
        }
        GenCore::drain(&core);
    }

    fn cancel(&self) {
        let Some(core) = self.core.upgrade() else {
            return;
        };
        let mut guard = core.inner.lock().unwrap();
        if guard.terminated || guard.cancelled {
            return;
        }
        guard.cancelled = true;
        if !guard.draining {
            GenCore::release(&mut guard);
        }
    }
}

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread;

use super::{BoxSubscriber, Publisher, PublisherImpl, Subscriber, Subscription, SubscriptionHandle};

/// Capacity of the bounded queue between upstream and the worker; demand is
/// withheld upstream while it is full.
const QUEUE_CAPACITY: u64 = 1024;

pub(super) fn threaded_worker<T: Send + 'static>(
    source: Publisher<T>,
    name: String,
) -> Publisher<VecDeque<T>> {
    Publisher::new(WorkerPublisher { source, name })
}

struct WorkerPublisher<T> {
    source: Publisher<T>,
    name: String,
}

enum QueueMsg<T> {
    Element(T),
    Error(anyhow::Error),
    Complete,
}

enum DemandMsg {
    Request(u64),
    Cancel,
}

struct WorkerCtl {
    upstream: Option<SubscriptionHandle>,
    cancelled: bool,
}

impl<T: Send + 'static> PublisherImpl<VecDeque<T>> for WorkerPublisher<T> {
    fn subscribe(self: Box<Self>, mut subscriber: BoxSubscriber<VecDeque<T>>) {
        let (queue_tx, queue_rx) =
            crossbeam_channel::bounded::<QueueMsg<T>>(QUEUE_CAPACITY as usize);
        let (demand_tx, demand_rx) = crossbeam_channel::unbounded::<DemandMsg>();
        let ctl = Arc::new(Mutex::new(WorkerCtl {
            upstream: None,
            cancelled: false,
        }));

        subscriber.on_subscribe(Arc::new(WorkerSubscription {
            demand: demand_tx,
            ctl: ctl.clone(),
        }));

        let worker_ctl = ctl.clone();
        let name = self.name.clone();
        thread::Builder::new()
            .name(self.name)
            .spawn(move || worker_loop(queue_rx, demand_rx, subscriber, worker_ctl))
            .unwrap_or_else(|e| panic!("failed to spawn worker thread {}: {}", name, e));

        self.source.subscribe_boxed(Box::new(UpstreamSubscriber {
            queue: queue_tx,
            ctl,
        }));
    }
}

struct UpstreamSubscriber<T> {
    queue: crossbeam_channel::Sender<QueueMsg<T>>,
    ctl: Arc<Mutex<WorkerCtl>>,
}

impl<T: Send + 'static> Subscriber<T> for UpstreamSubscriber<T> {
    fn on_subscribe(&mut self, subscription: SubscriptionHandle) {
        {
            let mut guard = self.ctl.lock().unwrap();
            if guard.cancelled {
                drop(guard);
                subscription.cancel();
                return;
            }
            guard.upstream = Some(subscription.clone());
        }
        subscription.request(QUEUE_CAPACITY);
    }

    fn on_next(&mut self, element: T) {
        let _ = self.queue.send(QueueMsg::Element(element));
    }

    fn on_error(&mut self, error: anyhow::Error) {
        let _ = self.queue.send(QueueMsg::Error(error));
    }

    fn on_complete(&mut self) {
        let _ = self.queue.send(QueueMsg::Complete);
    }
}

fn worker_loop<T: Send + 'static>(
    queue_rx: crossbeam_channel::Receiver<QueueMsg<T>>,
    demand_rx: crossbeam_channel::Receiver<DemandMsg>,
    mut subscriber: BoxSubscriber<VecDeque<T>>,
    ctl: Arc<Mutex<WorkerCtl>>,
) {
    let is_cancelled = |ctl: &Arc<Mutex<WorkerCtl>>| ctl.lock().unwrap().cancelled;
    let mut credit: u64 = 0;

    loop {
        let msg = match queue_rx.recv() {
            Ok(msg) => msg,
            // Upstream went away without a terminal: it was cancelled.
            Err(_) => return,
        };

        match msg {
            QueueMsg::Element(first) => {
                let mut batch = VecDeque::new();
                batch.push_back(first);
                let mut stashed_terminal = None;
                while let Ok(next) = queue_rx.try_recv() {
                    match next {
                        QueueMsg::Element(element) => batch.push_back(element),
                        terminal => {
                            stashed_terminal = Some(terminal);
                            break;
                        }
                    }
                }

                // Elements left the queue; hand the credit back upstream.
                let upstream = ctl.lock().unwrap().upstream.clone();
                if let Some(upstream) = upstream {
                    upstream.request(batch.len() as u64);
                }

                while credit == 0 {
                    match demand_rx.recv() {
                        Ok(DemandMsg::Request(n)) => credit = credit.saturating_add(n),
                        Ok(DemandMsg::Cancel) | Err(_) => return,
                    }
                }
                while let Ok(more) = demand_rx.try_recv() {
                    match more {
                        DemandMsg::Request(n) => credit = credit.saturating_add(n),
                        DemandMsg::Cancel => return,
                    }
                }

                if is_cancelled(&ctl) {
                    return;
                }
                credit -= 1;
                subscriber.on_next(batch);

                match stashed_terminal {
                    Some(QueueMsg::Error(error)) => {
                        if !is_cancelled(&ctl) {
                            subscriber.on_error(error);
                        }
                        return;
                    }
                    Some(QueueMsg::Complete) => {
                        if !is_cancelled(&ctl) {
                            subscriber.on_complete();
                        }
                        return;
                    }
                    _ => {}
                }
            }
            QueueMsg::Error(error) => {
                if !is_cancelled(&ctl) {
                    subscriber.on_error(error);
                }
                return;
            }
            QueueMsg::Complete => {
                if !is_cancelled(&ctl) {
                    subscriber.on_complete();
                }
                return;
            }
        }
    }
}

struct WorkerSubscription {
    demand: crossbeam_channel::Sender<DemandMsg>,
    ctl: Arc<Mutex<WorkerCtl>>,
}

impl Subscription for WorkerSubscription {
    fn request(&self, n: u64) {
        let _ = self.demand.send(DemandMsg::Request(n));
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
        let _ = self.demand.send(DemandMsg::Cancel);
    }
}

use std::sync::{Arc, Mutex, Weak};

use super::{
    Client, ClientError, ErrorCallbacks, IoHandle, RequestCallbacks, Subscription,
    SubscriptionCallbacks, SubscriptionOptions,
};

pub type ClientFactory =
    Box<dyn Fn(Arc<dyn ErrorCallbacks>) -> Result<Arc<dyn Client>, ClientError> + Send + Sync>;

/// Reconnects on any delegate error: stops the failed client, builds a fresh
/// one through the factory, starts it and replays every recorded
/// subscription in insertion order. Methods are expected to run on the I/O
/// thread.
pub struct ResilientClient {
    io: IoHandle,
    factory: ClientFactory,
    /// Outer callbacks for errors the wrapper cannot recover from. The
    /// caller owns them; never extend their lifetime.
    error_callbacks: Weak<dyn ErrorCallbacks>,
    state: Mutex<ResilientState>,
    self_weak: Weak<ResilientClient>,
}

struct ResilientState {
    client: Option<Arc<dyn Client>>,
    started: bool,
    restarting: bool,
    subscriptions: Vec<SubscriptionInfo>,
}

/// Back-pointers to caller-owned callback objects; weak by design.
struct SubscriptionInfo {
    channel: String,
    sub: Subscription,
    data_callbacks: Weak<dyn SubscriptionCallbacks>,
    callbacks: Option<Weak<dyn RequestCallbacks>>,
    options: Option<SubscriptionOptions>,
}

struct ErrorRelay {
    client: Weak<ResilientClient>,
}

impl ErrorCallbacks for ErrorRelay {
    fn on_error(&self, error: ClientError) {
        if let Some(client) = self.client.upgrade() {
            client.handle_delegate_error(error);
        }
    }
}

impl ResilientClient {
    pub fn new(
        io: IoHandle,
        factory: ClientFactory,
        error_callbacks: &Arc<dyn ErrorCallbacks>,
    ) -> Result<Arc<Self>, ClientError> {
        let client = Arc::new_cyclic(|self_weak: &Weak<ResilientClient>| Self {
            io,
            factory,
            error_callbacks: Arc::downgrade(error_callbacks),
            state: Mutex::new(ResilientState {
                client: None,
                started: false,
                restarting: false,
                subscriptions: Vec::new(),
            }),
            self_weak: self_weak.clone(),
        });

        let relay: Arc<dyn ErrorCallbacks> = Arc::new(ErrorRelay {
            client: client.self_weak.clone(),
        });
        let delegate = (client.factory)(relay)?;
        client.state.lock().unwrap().client = Some(delegate);
        Ok(client)
    }

    fn delegate(&self) -> Option<Arc<dyn Client>> {
        self.state.lock().unwrap().client.clone()
    }

    fn handle_delegate_error(&self, error: ClientError) {
        debug_assert!(self.io.is_io_thread());
        {
            let mut state = self.state.lock().unwrap();
            if state.restarting {
                log::debug!("client error while restarting: {}", error);
                return;
            }
            state.restarting = true;
        }
        log::error!("bus client error: {}, restarting", error);
        self.restart();
    }

    fn restart(&self) {
        let (old, was_started) = {
            let mut state = self.state.lock().unwrap();
            (state.client.take(), state.started)
        };
        if let (Some(old), true) = (old, was_started) {
            if let Err(e) = old.stop() {
                log::warn!("error stopping failed client: {}", e);
            }
        }

        let relay: Arc<dyn ErrorCallbacks> = Arc::new(ErrorRelay {
            client: self.self_weak.clone(),
        });
        let delegate = match (self.factory)(relay) {
            Ok(delegate) => delegate,
            Err(e) => {
                self.fatal(e);
                return;
            }
        };
        if let Err(e) = delegate.start() {
            self.fatal(e);
            return;
        }

        // Replay recorded subscriptions in insertion order; entries whose
        // callbacks are gone belong to callers that went away.
        let replay: Vec<_> = {
            let mut state = self.state.lock().unwrap();
            state
                .subscriptions
                .retain(|info| info.data_callbacks.upgrade().is_some());
            state
                .subscriptions
                .iter()
                .map(|info| {
                    (
                        info.channel.clone(),
                        info.sub.clone(),
                        info.data_callbacks.clone(),
                        info.callbacks.clone(),
                        info.options.clone(),
                    )
                })
                .collect()
        };
        for (channel, sub, data_callbacks, callbacks, options) in replay {
            let Some(data_callbacks) = data_callbacks.upgrade() else {
                continue;
            };
            let callbacks = callbacks.and_then(|weak| weak.upgrade());
            log::info!("replaying subscription to {}", channel);
            delegate.subscribe(&channel, &sub, data_callbacks, callbacks, options.as_ref());
        }

        let mut state = self.state.lock().unwrap();
        state.client = Some(delegate);
        state.started = true;
        state.restarting = false;
    }

    fn fatal(&self, error: ClientError) {
        log::error!("bus client restart failed: {}", error);
        {
            let mut state = self.state.lock().unwrap();
            state.restarting = false;
            state.started = false;
        }
        if let Some(callbacks) = self.error_callbacks.upgrade() {
            callbacks.on_error(error);
        }
    }
}

impl Client for ResilientClient {
    fn publish(
        &self,
        channel: &str,
        message: serde_json::Value,
        callbacks: Option<Arc<dyn RequestCallbacks>>,
    ) {
        debug_assert!(self.io.is_io_thread());
        match self.delegate() {
            Some(client) => client.publish(channel, message, callbacks),
            None => {
                if let Some(callbacks) = callbacks {
                    callbacks.on_error(ClientError::NotConnected);
                }
            }
        }
    }

    fn subscribe(
        &self,
        channel: &str,
        sub: &Subscription,
        data_callbacks: Arc<dyn SubscriptionCallbacks>,
        callbacks: Option<Arc<dyn RequestCallbacks>>,
        options: Option<&SubscriptionOptions>,
    ) {
        debug_assert!(self.io.is_io_thread());
        {
            let mut state = self.state.lock().unwrap();
            state.subscriptions.push(SubscriptionInfo {
                channel: channel.to_string(),
                sub: sub.clone(),
                data_callbacks: Arc::downgrade(&data_callbacks),
                callbacks: callbacks.as_ref().map(Arc::downgrade),
                options: options.cloned(),
            });
        }
        match self.delegate() {
            Some(client) => client.subscribe(channel, sub, data_callbacks, callbacks, options),
            None => {
                if let Some(callbacks) = callbacks {
                    callbacks.on_error(ClientError::NotConnected);
                }
            }
        }
    }

    fn unsubscribe(&self, sub: &Subscription, callbacks: Option<Arc<dyn RequestCallbacks>>) {
        debug_assert!(self.io.is_io_thread());
        {
            let mut state = self.state.lock().unwrap();
            state.subscriptions.retain(|info| info.sub.id() != sub.id());
        }
        match self.delegate() {
            Some(client) => client.unsubscribe(sub, callbacks),
            None => {
                if let Some(callbacks) = callbacks {
                    callbacks.on_error(ClientError::NotConnected);
                }
            }
        }
    }

    fn start(&self) -> Result<(), ClientError> {
        debug_assert!(self.io.is_io_thread());
        let client = {
            let mut state = self.state.lock().unwrap();
            state.started = true;
            state.client.clone()
        };
        match client {
            Some(client) => client.start(),
            None => Err(ClientError::NotConnected),
        }
    }

    fn stop(&self) -> Result<(), ClientError> {
        debug_assert!(self.io.is_io_thread());
        let client = {
            let mut state = self.state.lock().unwrap();
            state.started = false;
            state.client.clone()
        };
        match client {
            Some(client) => client.stop(),
            None => Err(ClientError::NotConnected),
        }
    }
}

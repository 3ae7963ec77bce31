use std::sync::Arc;

use super::{
    Client, ClientError, IoHandle, RequestCallbacks, Subscription, SubscriptionCallbacks,
    SubscriptionOptions,
};

/// Forwards every call to the wrapped client, re-posting to the I/O thread
/// when invoked from anywhere else.
pub struct ThreadCheckingClient {
    io: IoHandle,
    inner: Arc<dyn Client>,
}

impl ThreadCheckingClient {
    pub fn new(io: IoHandle, inner: Arc<dyn Client>) -> Self {
        Self { io, inner }
    }
}

impl Client for ThreadCheckingClient {
    fn publish(
        &self,
        channel: &str,
        message: serde_json::Value,
        callbacks: Option<Arc<dyn RequestCallbacks>>,
    ) {
        if self.io.is_io_thread() {
            self.inner.publish(channel, message, callbacks);
        } else {
            let inner = self.inner.clone();
            let channel = channel.to_string();
            self.io
                .post(move || inner.publish(&channel, message, callbacks));
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
        if self.io.is_io_thread() {
            self.inner
                .subscribe(channel, sub, data_callbacks, callbacks, options);
        } else {
            let inner = self.inner.clone();
            let channel = channel.to_string();
            let sub = sub.clone();
            let options = options.cloned();
            self.io.post(move || {
                inner.subscribe(&channel, &sub, data_callbacks, callbacks, options.as_ref())
            });
        }
    }

    fn unsubscribe(&self, sub: &Subscription, callbacks: Option<Arc<dyn RequestCallbacks>>) {
        if self.io.is_io_thread() {
            self.inner.unsubscribe(sub, callbacks);
        } else {
            let inner = self.inner.clone();
            let sub = sub.clone();
            self.io.post(move || inner.unsubscribe(&sub, callbacks));
        }
    }

    fn start(&self) -> Result<(), ClientError> {
        if self.io.is_io_thread() {
            self.inner.start()
        } else {
            let inner = self.inner.clone();
            self.io.post(move || {
                if let Err(e) = inner.start() {
                    log::error!("error starting bus client: {}", e);
                }
            });
            Ok(())
        }
    }

    fn stop(&self) -> Result<(), ClientError> {
        if self.io.is_io_thread() {
            self.inner.stop()
        } else {
            let inner = self.inner.clone();
            self.io.post(move || {
                if let Err(e) = inner.stop() {
                    log::error!("error stopping bus client: {}", e);
                }
            });
            Ok(())
        }
    }
}

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use super::{
    ChannelData, Client, ClientError, RequestCallbacks, Subscription, SubscriptionCallbacks,
    SubscriptionOptions,
};

/// In-process bus: publishes are delivered synchronously to matching
/// subscriptions, and the last message per channel is retained for
/// subscribers that ask for history. Stands in for a wire transport in demos
/// and tests; real deployments inject their own [`Client`].
#[derive(Default)]
pub struct LocalBus {
    state: Mutex<LocalState>,
}

#[derive(Default)]
struct LocalState {
    subscriptions: Vec<(String, Subscription, Arc<dyn SubscriptionCallbacks>)>,
    retained: HashMap<String, serde_json::Value>,
    started: bool,
}

impl LocalBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl Client for LocalBus {
    fn publish(
        &self,
        channel: &str,
        message: serde_json::Value,
        callbacks: Option<Arc<dyn RequestCallbacks>>,
    ) {
        let receivers: Vec<_> = {
            let mut state = self.state.lock().unwrap();
            state
                .retained
                .insert(channel.to_string(), message.clone());
            state
                .subscriptions
                .iter()
                .filter(|(sub_channel, _, _)| sub_channel == channel)
                .map(|(_, sub, data_callbacks)| (sub.clone(), data_callbacks.clone()))
                .collect()
        };
        for (sub, data_callbacks) in receivers {
            data_callbacks.on_data(
                &sub,
                ChannelData {
                    payload: message.clone(),
                    arrival_time: SystemTime::now(),
                },
            );
        }
        if let Some(callbacks) = callbacks {
            callbacks.on_ok();
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
        let replay = {
            let mut state = self.state.lock().unwrap();
            state
                .subscriptions
                .push((channel.to_string(), sub.clone(), data_callbacks.clone()));
            let wants_history = options
                .map(|o| o.history.count.unwrap_or(0) > 0)
                .unwrap_or(false);
            if wants_history {
                state.retained.get(channel).cloned()
            } else {
                None
            }
        };
        if let Some(payload) = replay {
            data_callbacks.on_data(
                sub,
                ChannelData {
                    payload,
                    arrival_time: SystemTime::now(),
                },
            );
        }
        if let Some(callbacks) = callbacks {
            callbacks.on_ok();
        }
    }

    fn unsubscribe(&self, sub: &Subscription, callbacks: Option<Arc<dyn RequestCallbacks>>) {
        self.state
            .lock()
            .unwrap()
            .subscriptions
            .retain(|(_, s, _)| s.id() != sub.id());
        if let Some(callbacks) = callbacks {
            callbacks.on_ok();
        }
    }

    fn start(&self) -> Result<(), ClientError> {
        self.state.lock().unwrap().started = true;
        Ok(())
    }

    fn stop(&self) -> Result<(), ClientError> {
        self.state.lock().unwrap().started = false;
        Ok(())
    }
}

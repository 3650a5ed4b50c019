// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Server-driven configuration values with per-key watchers.
//!
//! Values arrive with negotiated options and as inbound `remoteConfig` messages. Updates merge
//! into the current snapshot; watchers of a key run whenever its value changes.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::{Map, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::constants::REMOTE_CONFIG_MESSAGE;
use crate::dispatcher::{Dispatcher, HandlerId};
use crate::negotiator::Negotiator;

/// Called with the new value of a key, or `None` when the key is not set.
pub type WatchCallback = Arc<dyn Fn(Option<&Value>) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(u64);

#[derive(Default)]
struct StoreState {
    config: Option<Map<String, Value>>,
    watchers: HashMap<String, Vec<(WatchId, WatchCallback)>>,
}

#[derive(Default)]
pub struct RemoteConfigStore {
    state: Mutex<StoreState>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for RemoteConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteConfigStore")
            .field("config", &self.lock().config)
            .finish()
    }
}

impl RemoteConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_loaded(&self) -> bool {
        self.lock().config.is_some()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.lock().config.as_ref()?.get(key).cloned()
    }

    /// Current values; empty before the first update.
    pub fn snapshot(&self) -> Map<String, Value> {
        self.lock().config.clone().unwrap_or_default()
    }

    /// Merges `update` into the current values and notifies watchers of changed keys. The first
    /// update also tells watchers of keys it does not contain that they are unset.
    pub fn update(&self, update: Map<String, Value>) {
        let notifications = {
            let mut state = self.lock();
            let first_load = state.config.is_none();
            let config = state.config.get_or_insert_with(Map::new);

            let mut changed = Vec::new();
            for (key, value) in update {
                if config.get(&key) != Some(&value) {
                    config.insert(key.clone(), value.clone());
                    changed.push((key, Some(value)));
                }
            }
            if first_load {
                let unset: Vec<_> = state
                    .watchers
                    .keys()
                    .filter(|key| !changed.iter().any(|(name, _)| name == *key))
                    .map(|key| (key.clone(), None))
                    .collect();
                changed.extend(unset);
            }

            changed
                .into_iter()
                .filter_map(|(key, value)| {
                    let callbacks: Vec<_> = state
                        .watchers
                        .get(&key)?
                        .iter()
                        .map(|(_, callback)| Arc::clone(callback))
                        .collect();
                    Some((key, value, callbacks))
                })
                .collect::<Vec<_>>()
        };

        for (key, value, callbacks) in notifications {
            for callback in callbacks {
                notify(&key, &callback, value.as_ref());
            }
        }
    }

    /// Registers `callback` for `key`. Runs it right away when config is already loaded.
    pub fn watch<F>(&self, key: impl Into<String>, callback: F) -> WatchId
    where
        F: Fn(Option<&Value>) + Send + Sync + 'static,
    {
        let key = key.into();
        let id = WatchId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let callback: WatchCallback = Arc::new(callback);
        let current = {
            let mut state = self.lock();
            state
                .watchers
                .entry(key.clone())
                .or_default()
                .push((id, Arc::clone(&callback)));
            state.config.as_ref().map(|config| config.get(&key).cloned())
        };
        if let Some(value) = current {
            notify(&key, &callback, value.as_ref());
        }
        id
    }

    pub fn unwatch(&self, key: &str, id: WatchId) -> bool {
        let mut state = self.lock();
        let Some(watchers) = state.watchers.get_mut(key) else {
            return false;
        };
        let before = watchers.len();
        watchers.retain(|(watch_id, _)| *watch_id != id);
        let removed = watchers.len() < before;
        if watchers.is_empty() {
            state.watchers.remove(key);
        }
        removed
    }

    /// Feeds the store from options updates and `remoteConfig` messages until `cancel` fires.
    pub fn attach(
        self: &Arc<Self>,
        negotiator: &Arc<Negotiator>,
        dispatcher: &Dispatcher,
        cancel: CancellationToken,
    ) -> (HandlerId, JoinHandle<()>) {
        let store = Arc::clone(self);
        let handler = dispatcher.on(REMOTE_CONFIG_MESSAGE, move |message| {
            match &message.envelope.payload {
                Value::Object(config) => {
                    store.update(config.clone());
                    Ok(())
                }
                other => Err(format!("remote config payload is not an object: {other}").into()),
            }
        });

        let mut updates = negotiator.subscribe();
        let current = negotiator.options();
        let store = Arc::clone(self);
        let task = tokio::spawn(async move {
            if let Some(options) = current {
                store.update(options.server_config());
            }
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    update = updates.recv() => match update {
                        Ok(options) => store.update(options.server_config()),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("RELAY | Remote config missed {skipped} option updates");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            debug!("RELAY | Remote config detached");
        });
        (handler, task)
    }
}

fn notify(key: &str, callback: &WatchCallback, value: Option<&Value>) {
    if catch_unwind(AssertUnwindSafe(|| callback(value))).is_err() {
        error!("RELAY | Remote config watcher for '{key}' panicked");
    }
}

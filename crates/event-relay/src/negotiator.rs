// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Remote option negotiation.
//!
//! Before anything is flushed the relay asks the backend where to send data and how to behave.
//! The answer is cached and replaced wholesale whenever a flush response carries a new one.
//! Callers that need options before they exist park on [`Negotiator::wait_for_options`]; all of
//! them are released together the first time options become available.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, warn};

use crate::errors::HttpError;
use crate::http::IngestTransport;

const UPDATES_CAPACITY: usize = 16;

/// Options negotiated with the backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteOptions {
    /// Where flushed batches are posted.
    #[serde(rename = "url")]
    pub ingest_url: String,
    /// Server-side configuration for this instance.
    #[serde(rename = "config", default, skip_serializing_if = "Map::is_empty")]
    pub server_config: Map<String, Value>,
    #[serde(rename = "options", default)]
    pub extra: Map<String, Value>,
}

impl RemoteOptions {
    pub fn new(ingest_url: impl Into<String>) -> Self {
        RemoteOptions {
            ingest_url: ingest_url.into(),
            ..Default::default()
        }
    }

    /// Server config, reading `options.config` when the payload predates the `config` field.
    pub fn server_config(&self) -> Map<String, Value> {
        if !self.server_config.is_empty() {
            return self.server_config.clone();
        }
        match self.extra.get("config") {
            Some(Value::Object(config)) => config.clone(),
            _ => Map::new(),
        }
    }
}

#[derive(Default)]
struct NegotiatorState {
    options: Option<Arc<RemoteOptions>>,
    waiters: Vec<oneshot::Sender<Arc<RemoteOptions>>>,
}

pub struct Negotiator {
    transport: Arc<dyn IngestTransport>,
    url: String,
    state: Mutex<NegotiatorState>,
    fetch_lock: tokio::sync::Mutex<()>,
    updates: broadcast::Sender<Arc<RemoteOptions>>,
}

impl std::fmt::Debug for Negotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Negotiator")
            .field("url", &self.url)
            .field("options", &self.options())
            .finish()
    }
}

impl Negotiator {
    pub fn new(transport: Arc<dyn IngestTransport>, url: impl Into<String>) -> Self {
        let (updates, _) = broadcast::channel(UPDATES_CAPACITY);
        Negotiator {
            transport,
            url: url.into(),
            state: Mutex::new(NegotiatorState::default()),
            fetch_lock: tokio::sync::Mutex::new(()),
            updates,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn lock(&self) -> MutexGuard<'_, NegotiatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Currently cached options.
    pub fn options(&self) -> Option<Arc<RemoteOptions>> {
        self.lock().options.clone()
    }

    /// Performs the handshake and caches the result.
    pub async fn fetch_options(&self) -> Result<Arc<RemoteOptions>, HttpError> {
        debug!("RELAY | Negotiating options with {}", self.url);
        match self.transport.fetch_options(&self.url).await {
            Ok(options) => Ok(self.set_options(options)),
            Err(e) => {
                warn!("RELAY | Negotiation with {} failed: {e}", self.url);
                Err(e)
            }
        }
    }

    /// Returns the cached options, negotiating if there are none. Concurrent callers share a
    /// single request.
    pub async fn ensure_options(&self) -> Result<Arc<RemoteOptions>, HttpError> {
        if let Some(options) = self.options() {
            return Ok(options);
        }
        let _guard = self.fetch_lock.lock().await;
        if let Some(options) = self.options() {
            return Ok(options);
        }
        self.fetch_options().await
    }

    /// Caches `options`, releases every waiter and notifies subscribers.
    pub fn set_options(&self, options: RemoteOptions) -> Arc<RemoteOptions> {
        let options = Arc::new(options);
        let waiters = {
            let mut state = self.lock();
            state.options = Some(Arc::clone(&options));
            std::mem::take(&mut state.waiters)
        };
        debug!(
            "RELAY | Options updated (ingest url {}), releasing {} waiters",
            options.ingest_url,
            waiters.len()
        );
        for waiter in waiters {
            let _ = waiter.send(Arc::clone(&options));
        }
        // No subscribers is fine.
        let _ = self.updates.send(Arc::clone(&options));
        options
    }

    /// Resolves once options are available. Never times out.
    pub async fn wait_for_options(&self) -> Arc<RemoteOptions> {
        loop {
            let receiver = {
                let mut state = self.lock();
                if let Some(options) = &state.options {
                    return Arc::clone(options);
                }
                state.waiters.retain(|waiter| !waiter.is_closed());
                let (sender, receiver) = oneshot::channel();
                state.waiters.push(sender);
                receiver
            };
            if let Ok(options) = receiver.await {
                return options;
            }
        }
    }

    pub async fn wait_for_options_timeout(&self, timeout: Duration) -> Option<Arc<RemoteOptions>> {
        tokio::time::timeout(timeout, self.wait_for_options())
            .await
            .ok()
    }

    /// Receives every options replacement from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<RemoteOptions>> {
        self.updates.subscribe()
    }

    #[cfg(test)]
    fn waiter_count(&self) -> usize {
        self.lock().waiters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedTransport;
    use serde_json::json;

    fn negotiator(transport: &Arc<ScriptedTransport>) -> Arc<Negotiator> {
        Arc::new(Negotiator::new(
            Arc::clone(transport) as Arc<dyn IngestTransport>,
            "http://backend.test/instances/a/messaging",
        ))
    }

    #[test]
    fn test_server_config_falls_back_to_options_config() {
        let options: RemoteOptions =
            serde_json::from_value(json!({"url": "u", "options": {"config": {"a": 1}}}))
                .expect("decode failed");
        assert_eq!(options.server_config()["a"], 1);

        let options: RemoteOptions = serde_json::from_value(
            json!({"url": "u", "config": {"b": 2}, "options": {"config": {"a": 1}}}),
        )
        .expect("decode failed");
        assert_eq!(options.server_config().len(), 1);
        assert_eq!(options.server_config()["b"], 2);
    }

    #[tokio::test]
    async fn test_waiters_are_released_together_by_one_fetch() {
        let transport = Arc::new(ScriptedTransport::default());
        let negotiator = negotiator(&transport);

        let waiters: Vec<_> = (0..5)
            .map(|_| {
                let negotiator = Arc::clone(&negotiator);
                tokio::spawn(async move { negotiator.wait_for_options().await })
            })
            .collect();
        while negotiator.waiter_count() < 5 {
            tokio::task::yield_now().await;
        }

        let fetched = negotiator.ensure_options().await.expect("fetch failed");
        for waiter in waiters {
            let options = waiter.await.expect("waiter panicked");
            assert!(Arc::ptr_eq(&options, &fetched));
        }
        assert_eq!(transport.fetch_calls(), 1);
        assert_eq!(negotiator.waiter_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_ensure_issues_one_request() {
        let transport = Arc::new(ScriptedTransport::default());
        let negotiator = negotiator(&transport);

        let calls: Vec<_> = (0..4)
            .map(|_| {
                let negotiator = Arc::clone(&negotiator);
                tokio::spawn(async move { negotiator.ensure_options().await })
            })
            .collect();
        for call in calls {
            assert!(call.await.expect("task panicked").is_ok());
        }
        assert_eq!(transport.fetch_calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_fetch_keeps_waiters_parked() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push_options(Err(HttpError::Status {
            status: 500,
            retry_after: None,
        }));
        let negotiator = negotiator(&transport);

        assert!(negotiator.fetch_options().await.is_err());
        assert!(negotiator.options().is_none());
        assert!(negotiator
            .wait_for_options_timeout(Duration::from_millis(10))
            .await
            .is_none());

        assert!(negotiator.fetch_options().await.is_ok());
        assert!(negotiator
            .wait_for_options_timeout(Duration::from_millis(10))
            .await
            .is_some());
    }

    #[tokio::test]
    async fn test_set_options_broadcasts_every_replacement() {
        let transport = Arc::new(ScriptedTransport::default());
        let negotiator = negotiator(&transport);
        let mut updates = negotiator.subscribe();

        negotiator.set_options(RemoteOptions::new("first"));
        negotiator.set_options(RemoteOptions::new("second"));

        assert_eq!(updates.recv().await.expect("missing update").ingest_url, "first");
        assert_eq!(updates.recv().await.expect("missing update").ingest_url, "second");
        assert_eq!(
            negotiator.options().expect("no options").ingest_url,
            "second"
        );
        assert_eq!(transport.fetch_calls(), 0);
    }
}

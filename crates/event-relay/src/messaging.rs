// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Cross-process messaging over the distributed queues.
//!
//! Every channel `N` owns three queues:
//!
//! - `__relay.local.N.<instance>`: messages addressed to one instance
//! - `__relay.global.N`: messages for whichever instance reads them first
//! - `__relay.remote.N`: envelopes waiting to be posted to the backend by a queue-polling
//!   scheduler, stored as `[origin instance, envelope]`
//!
//! Consumers started with [`Messenger::listen`] feed the direct and global queues into the
//! [`Dispatcher`].

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::constants::{
    CONSUMER_POLL_INTERVAL, DEFAULT_MESSAGE_EXPIRY, DEFAULT_VISIBILITY_TIMEOUT,
    MAX_BATCH_ENVELOPES, QUEUE_PREFIX,
};
use crate::dispatcher::{Dispatcher, InboundMessage, InboundSource};
use crate::envelope::{encode, Envelope, ProtocolVersion};
use crate::errors::QueueError;
use crate::negotiator::Negotiator;
use crate::queue::{QueueBackend, QueueClient, QueuedEnvelope};

/// Longest a consumer blocks on one read before checking for shutdown again.
const CONSUMER_READ_WAIT: Duration = Duration::from_secs(5);

pub fn local_queue_name(channel: &str, instance_id: &str) -> String {
    format!("{QUEUE_PREFIX}.local.{channel}.{instance_id}")
}

pub fn global_queue_name(channel: &str) -> String {
    format!("{QUEUE_PREFIX}.global.{channel}")
}

pub fn remote_queue_name(channel: &str) -> String {
    format!("{QUEUE_PREFIX}.remote.{channel}")
}

/// Queue a consumer reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenScope {
    Direct,
    Global,
}

impl ListenScope {
    fn source(self) -> InboundSource {
        match self {
            ListenScope::Direct => InboundSource::Direct,
            ListenScope::Global => InboundSource::Global,
        }
    }
}

pub struct MessengerConfig {
    pub channel: String,
    pub instance_id: String,
    pub backend: Arc<dyn QueueBackend>,
    pub dispatcher: Arc<Dispatcher>,
    pub negotiator: Arc<Negotiator>,
    pub protocol_version: ProtocolVersion,
    pub visibility_timeout: Duration,
    pub message_expiry: Duration,
}

impl MessengerConfig {
    pub fn new(
        channel: impl Into<String>,
        instance_id: impl Into<String>,
        backend: Arc<dyn QueueBackend>,
        dispatcher: Arc<Dispatcher>,
        negotiator: Arc<Negotiator>,
    ) -> Self {
        MessengerConfig {
            channel: channel.into(),
            instance_id: instance_id.into(),
            backend,
            dispatcher,
            negotiator,
            protocol_version: ProtocolVersion::default(),
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            message_expiry: DEFAULT_MESSAGE_EXPIRY,
        }
    }
}

pub struct Messenger {
    channel: String,
    instance_id: String,
    backend: Arc<dyn QueueBackend>,
    dispatcher: Arc<Dispatcher>,
    negotiator: Arc<Negotiator>,
    protocol_version: ProtocolVersion,
    visibility_timeout: Duration,
    message_expiry: Duration,
    local: QueueClient<Envelope>,
    global: QueueClient<Envelope>,
    remote: QueueClient<QueuedEnvelope>,
    cancel: CancellationToken,
    listeners: Mutex<HashMap<ListenScope, JoinHandle<()>>>,
}

impl std::fmt::Debug for Messenger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Messenger")
            .field("channel", &self.channel)
            .field("instance_id", &self.instance_id)
            .finish()
    }
}

impl Messenger {
    pub fn new(config: MessengerConfig) -> Self {
        let local = QueueClient::new(
            local_queue_name(&config.channel, &config.instance_id),
            Arc::clone(&config.backend),
            config.visibility_timeout,
        );
        let global = QueueClient::new(
            global_queue_name(&config.channel),
            Arc::clone(&config.backend),
            config.visibility_timeout,
        );
        let remote = QueueClient::new(
            remote_queue_name(&config.channel),
            Arc::clone(&config.backend),
            config.visibility_timeout,
        );
        Messenger {
            channel: config.channel,
            instance_id: config.instance_id,
            backend: config.backend,
            dispatcher: config.dispatcher,
            negotiator: config.negotiator,
            protocol_version: config.protocol_version,
            visibility_timeout: config.visibility_timeout,
            message_expiry: config.message_expiry,
            local,
            global,
            remote,
            cancel: CancellationToken::new(),
            listeners: Mutex::new(HashMap::new()),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Client of the remote queue, drained by a queue-polling scheduler.
    pub fn remote_queue(&self) -> QueueClient<QueuedEnvelope> {
        self.remote.clone()
    }

    fn check_size(&self, envelope: &Envelope) -> Result<(), QueueError> {
        encode(envelope, self.protocol_version)?;
        Ok(())
    }

    /// Queues an envelope for delivery to the backend by whichever instance polls first.
    pub async fn send_remote(
        &self,
        envelope: Envelope,
        priority: i64,
        expires_in: Option<Duration>,
    ) -> Result<(), QueueError> {
        self.check_size(&envelope)?;
        self.remote
            .add(
                &QueuedEnvelope(self.instance_id.clone(), envelope),
                expires_in.unwrap_or(self.message_expiry),
                priority,
            )
            .await
    }

    /// Sends an envelope to one instance's direct queue.
    pub async fn send_local(
        &self,
        envelope: Envelope,
        instance_id: &str,
        priority: i64,
        expires_in: Option<Duration>,
    ) -> Result<(), QueueError> {
        self.check_size(&envelope)?;
        let queue: QueueClient<Envelope> = QueueClient::new(
            local_queue_name(&self.channel, instance_id),
            Arc::clone(&self.backend),
            self.visibility_timeout,
        );
        queue
            .add(&envelope, expires_in.unwrap_or(self.message_expiry), priority)
            .await
    }

    pub async fn send_global(
        &self,
        envelope: Envelope,
        priority: i64,
        expires_in: Option<Duration>,
    ) -> Result<(), QueueError> {
        self.check_size(&envelope)?;
        self.global
            .add(&envelope, expires_in.unwrap_or(self.message_expiry), priority)
            .await
    }

    /// Forwards the `locals` and `global` payloads of a flush response. Failures are logged per
    /// envelope.
    pub async fn route(&self, locals: BTreeMap<String, Vec<Envelope>>, global: Vec<Envelope>) {
        for (instance_id, envelopes) in locals {
            for envelope in envelopes {
                let name = envelope.name.clone();
                if let Err(e) = self.send_local(envelope, &instance_id, 0, None).await {
                    error!("RELAY | Failed to route '{name}' to instance {instance_id}: {e}");
                }
            }
        }
        for envelope in global {
            let name = envelope.name.clone();
            if let Err(e) = self.send_global(envelope, 0, None).await {
                error!("RELAY | Failed to route global message '{name}': {e}");
            }
        }
    }

    /// Starts the consumer for `scope`. Each scope can be listened to once.
    pub fn listen(&self, scope: ListenScope) -> Result<(), QueueError> {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        if listeners.contains_key(&scope) {
            return Err(QueueError::AlreadyListening(format!("{scope:?}").to_lowercase()));
        }
        let queue = match scope {
            ListenScope::Direct => self.local.clone(),
            ListenScope::Global => self.global.clone(),
        };
        let consumer = Consumer {
            channel: self.channel.clone(),
            source: scope.source(),
            queue,
            dispatcher: Arc::clone(&self.dispatcher),
            negotiator: Arc::clone(&self.negotiator),
            cancel: self.cancel.child_token(),
        };
        listeners.insert(scope, tokio::spawn(consumer.run()));
        Ok(())
    }

    /// Signals every consumer to exit without waiting for them.
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    /// Stops every consumer and waits for them to exit.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handles: Vec<_> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!("RELAY | Consumer task of {} failed: {e}", self.channel);
            }
        }
    }
}

struct Consumer {
    channel: String,
    source: InboundSource,
    queue: QueueClient<Envelope>,
    dispatcher: Arc<Dispatcher>,
    negotiator: Arc<Negotiator>,
    cancel: CancellationToken,
}

impl Consumer {
    async fn run(self) {
        tokio::select! {
            () = self.cancel.cancelled() => return,
            _ = self.negotiator.wait_for_options() => {}
        }
        debug!("RELAY | Consuming {}", self.queue.name());

        while !self.cancel.is_cancelled() {
            let started = Instant::now();
            let read = tokio::select! {
                () = self.cancel.cancelled() => break,
                read = self.queue.read(MAX_BATCH_ENVELOPES, false, Some(CONSUMER_READ_WAIT)) => read,
            };
            match read {
                Ok(batch) => self.consume(batch).await,
                Err(e) => warn!("RELAY | Failed to read {}: {e}", self.queue.name()),
            }

            let pause = CONSUMER_POLL_INTERVAL.saturating_sub(started.elapsed());
            if !pause.is_zero() {
                tokio::select! {
                    () = self.cancel.cancelled() => break,
                    () = tokio::time::sleep(pause) => {}
                }
            }
        }
        debug!("RELAY | Stopped consuming {}", self.queue.name());
    }

    /// Dispatches a batch and acknowledges it unless a handler failed.
    async fn consume(&self, batch: crate::queue::ReadBatch<Envelope>) {
        let Some(key) = batch.delete_key else {
            return;
        };
        let mut failed = false;
        for envelope in batch.items {
            let message = InboundMessage::new(self.source, self.channel.clone(), envelope);
            failed |= self.dispatcher.dispatch(message).failed > 0;
        }
        if failed {
            debug!(
                "RELAY | Leaving batch on {} for redelivery after handler failure",
                self.queue.name()
            );
            return;
        }
        if let Err(e) = self.queue.remove(&key).await {
            error!("RELAY | Failed to acknowledge batch on {}: {e}", self.queue.name());
        }
    }
}

// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Composition root.
//!
//! A [`RelayBuilder`] registers every channel once, at startup, and [`RelayBuilder::build`]
//! spawns one scheduler task per channel. The resulting [`Relay`] is what producers send
//! through and what the process shuts down on exit.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::api_key::ApiKeyFactory;
use crate::config::RelayConfig;
use crate::dispatcher::Dispatcher;
use crate::envelope::Envelope;
use crate::errors::{ConfigError, RelayError};
use crate::http::{build_client, IngestClient, IngestTransport};
use crate::messaging::{ListenScope, Messenger, MessengerConfig};
use crate::negotiator::Negotiator;
use crate::queue::{MemoryQueueStore, QueueBackend};
use crate::remote_config::RemoteConfigStore;
use crate::scheduler::{FlushScheduler, SchedulerConfig, SchedulerHandle, SchedulerState, Topology};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Flushes envelopes sent on this instance.
    Direct,
    /// Flushes envelopes any instance queued on the channel's remote queue.
    QueuePolling { post_empty_batches: bool },
}

#[derive(Debug, Clone)]
pub struct ChannelSpec {
    pub name: String,
    pub kind: ChannelKind,
    /// Posts here instead of the negotiated ingest URL.
    pub ingest_url: Option<String>,
    /// Queues whose messages are fed to the dispatcher.
    pub listen: Vec<ListenScope>,
}

impl ChannelSpec {
    pub fn direct(name: impl Into<String>) -> Self {
        ChannelSpec {
            name: name.into(),
            kind: ChannelKind::Direct,
            ingest_url: None,
            listen: Vec::new(),
        }
    }

    pub fn queue_polling(name: impl Into<String>, post_empty_batches: bool) -> Self {
        ChannelSpec {
            name: name.into(),
            kind: ChannelKind::QueuePolling { post_empty_batches },
            ingest_url: None,
            listen: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_ingest_url(mut self, url: impl Into<String>) -> Self {
        self.ingest_url = Some(url.into());
        self
    }

    #[must_use]
    pub fn listening(mut self, scope: ListenScope) -> Self {
        if !self.listen.contains(&scope) {
            self.listen.push(scope);
        }
        self
    }
}

pub struct RelayBuilder {
    config: RelayConfig,
    api_key_factory: Option<Arc<ApiKeyFactory>>,
    transport: Option<Arc<dyn IngestTransport>>,
    backend: Option<Arc<dyn QueueBackend>>,
    channels: Vec<ChannelSpec>,
}

impl RelayBuilder {
    pub fn new(config: RelayConfig) -> Self {
        RelayBuilder {
            config,
            api_key_factory: None,
            transport: None,
            backend: None,
            channels: Vec::new(),
        }
    }

    /// Defaults to the static key from the configuration.
    #[must_use]
    pub fn api_key_factory(mut self, factory: Arc<ApiKeyFactory>) -> Self {
        self.api_key_factory = Some(factory);
        self
    }

    /// Replaces the reqwest transport.
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn IngestTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Queue service shared with other relays. Defaults to a private in-memory store.
    #[must_use]
    pub fn queue_backend(mut self, backend: Arc<dyn QueueBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    #[must_use]
    pub fn channel(mut self, spec: ChannelSpec) -> Self {
        self.channels.push(spec);
        self
    }

    fn make_transport(&self) -> Result<Arc<dyn IngestTransport>, RelayError> {
        if let Some(transport) = &self.transport {
            return Ok(Arc::clone(transport));
        }
        let api_key_factory = match &self.api_key_factory {
            Some(factory) => Arc::clone(factory),
            None => Arc::new(ApiKeyFactory::new_from_static_key(
                self.config.api_key.as_deref().unwrap_or_default(),
            )),
        };
        let client = build_client(self.config.https_proxy.as_deref(), self.config.request_timeout)?;
        Ok(Arc::new(IngestClient::new(
            client,
            api_key_factory,
            self.config.run_mode.clone(),
            self.config.protocol_version,
            self.config.compression_level,
        )))
    }

    /// Validates the registrations and starts every channel. Must run inside a tokio runtime.
    pub fn build(self) -> Result<Relay, RelayError> {
        self.config.validate()?;
        let mut names = HashSet::new();
        for spec in &self.channels {
            if spec.name.trim().is_empty() || spec.name.contains('.') {
                return Err(ConfigError::InvalidConfig(format!(
                    "Invalid channel name '{}'",
                    spec.name
                ))
                .into());
            }
            if !names.insert(spec.name.as_str()) {
                return Err(RelayError::DuplicateChannel(spec.name.clone()));
            }
            let mut scopes = HashSet::new();
            if !spec.listen.iter().all(|scope| scopes.insert(*scope)) {
                return Err(ConfigError::InvalidConfig(format!(
                    "Channel '{}' listens to the same queue more than once",
                    spec.name
                ))
                .into());
            }
        }

        let transport = self.make_transport()?;
        let backend: Arc<dyn QueueBackend> = self
            .backend
            .clone()
            .unwrap_or_else(|| Arc::new(MemoryQueueStore::new()));
        let dispatcher = Arc::new(Dispatcher::new());
        let negotiator = Arc::new(Negotiator::new(
            Arc::clone(&transport),
            self.config.negotiation_url(),
        ));
        let cancel = CancellationToken::new();
        let remote_config = Arc::new(RemoteConfigStore::new());
        let (_, remote_config_task) =
            remote_config.attach(&negotiator, &dispatcher, cancel.child_token());

        let mut channels: HashMap<String, Channel> = HashMap::new();
        for spec in self.channels {
            let mut messenger_config = MessengerConfig::new(
                spec.name.clone(),
                self.config.instance_id.clone(),
                Arc::clone(&backend),
                Arc::clone(&dispatcher),
                Arc::clone(&negotiator),
            );
            messenger_config.protocol_version = self.config.protocol_version;
            let messenger = Arc::new(Messenger::new(messenger_config));
            for scope in &spec.listen {
                if let Err(e) = messenger.listen(*scope) {
                    messenger.abort();
                    for channel in channels.values() {
                        channel.handle.stop();
                        channel.messenger.abort();
                    }
                    cancel.cancel();
                    return Err(e.into());
                }
            }

            let mut scheduler_config = SchedulerConfig::new(
                spec.name.clone(),
                Arc::clone(&transport),
                Arc::clone(&negotiator),
                Arc::clone(&dispatcher),
            );
            scheduler_config.messenger = Some(Arc::clone(&messenger));
            scheduler_config.intervals = self.config.intervals;
            scheduler_config.ingest_url = spec.ingest_url;
            scheduler_config.protocol_version = self.config.protocol_version;
            scheduler_config.tags = self.config.tags.clone();
            scheduler_config.topology = match spec.kind {
                ChannelKind::Direct => Topology::Direct,
                ChannelKind::QueuePolling { post_empty_batches } => Topology::QueuePolling {
                    queue: messenger.remote_queue(),
                    wait: self.config.intervals.ingest,
                    post_empty_batches,
                },
            };

            let (scheduler, handle) = FlushScheduler::new(scheduler_config);
            let task = tokio::spawn(scheduler.run());
            debug!("RELAY | Started channel {} ({:?})", spec.name, spec.kind);
            channels.insert(
                spec.name,
                Channel {
                    kind: spec.kind,
                    handle,
                    messenger,
                    task,
                },
            );
        }

        info!(
            "RELAY | Relay {} started with {} channels",
            self.config.instance_id,
            channels.len()
        );
        Ok(Relay {
            instance_id: self.config.instance_id,
            channels,
            dispatcher,
            negotiator,
            remote_config,
            remote_config_task,
            cancel,
        })
    }
}

struct Channel {
    kind: ChannelKind,
    handle: SchedulerHandle,
    messenger: Arc<Messenger>,
    task: JoinHandle<()>,
}

pub struct Relay {
    instance_id: String,
    channels: HashMap<String, Channel>,
    dispatcher: Arc<Dispatcher>,
    negotiator: Arc<Negotiator>,
    remote_config: Arc<RemoteConfigStore>,
    remote_config_task: JoinHandle<()>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("instance_id", &self.instance_id)
            .field("channels", &self.channels.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Relay {
    pub fn builder(config: RelayConfig) -> RelayBuilder {
        RelayBuilder::new(config)
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn channel(&self, name: &str) -> Result<&Channel, RelayError> {
        self.channels
            .get(name)
            .ok_or_else(|| RelayError::UnknownChannel(name.to_string()))
    }

    /// Sends an envelope on `channel`. Oversized envelopes are rejected; nothing is truncated.
    pub async fn send(&self, channel: &str, envelope: Envelope) -> Result<(), RelayError> {
        let channel = self.channel(channel)?;
        match channel.kind {
            ChannelKind::Direct => channel.handle.send(envelope)?,
            ChannelKind::QueuePolling { .. } => {
                let envelope = channel.handle.prepare(envelope)?;
                channel.messenger.send_remote(envelope, 0, None).await?;
            }
        }
        Ok(())
    }

    /// Sends an envelope to the direct queue of another instance.
    pub async fn send_local(
        &self,
        channel: &str,
        instance_id: &str,
        envelope: Envelope,
    ) -> Result<(), RelayError> {
        let channel = self.channel(channel)?;
        let envelope = channel.handle.prepare(envelope)?;
        channel
            .messenger
            .send_local(envelope, instance_id, 0, None)
            .await?;
        Ok(())
    }

    /// Sends an envelope to the global queue of `channel`.
    pub async fn send_global(&self, channel: &str, envelope: Envelope) -> Result<(), RelayError> {
        let channel = self.channel(channel)?;
        let envelope = channel.handle.prepare(envelope)?;
        channel.messenger.send_global(envelope, 0, None).await?;
        Ok(())
    }

    pub fn handle(&self, channel: &str) -> Option<&SchedulerHandle> {
        self.channels.get(channel).map(|channel| &channel.handle)
    }

    pub fn messenger(&self, channel: &str) -> Option<Arc<Messenger>> {
        self.channels
            .get(channel)
            .map(|channel| Arc::clone(&channel.messenger))
    }

    pub fn state(&self, channel: &str) -> Option<SchedulerState> {
        self.handle(channel).map(SchedulerHandle::state)
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn negotiator(&self) -> &Arc<Negotiator> {
        &self.negotiator
    }

    pub fn remote_config(&self) -> &Arc<RemoteConfigStore> {
        &self.remote_config
    }

    /// Stops every channel, lets each drain, and waits for all tasks to finish.
    pub async fn shutdown(self) {
        info!("RELAY | Shutting down relay {}", self.instance_id);
        for channel in self.channels.values() {
            channel.handle.stop();
        }
        for (name, channel) in self.channels {
            channel.messenger.stop().await;
            if let Err(e) = channel.task.await {
                error!("RELAY | Scheduler task of {name} failed: {e}");
            }
        }
        self.cancel.cancel();
        if let Err(e) = self.remote_config_task.await {
            error!("RELAY | Remote config task failed: {e}");
        }
    }
}

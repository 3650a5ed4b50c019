// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fan-out of inbound messages.
//!
//! Messages arrive from flush responses and from the distributed queues. Each one is delivered
//! to the handlers registered for its kind (the envelope name), then to the wildcard handlers,
//! then to broadcast subscribers. A handler that fails or panics is logged and skipped; the
//! remaining handlers still run.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use crate::envelope::Envelope;

const BROADCAST_CAPACITY: usize = 256;

/// Where an inbound message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InboundSource {
    /// `messages` of a flush response.
    Response,
    /// Queue addressed to this instance only.
    Direct,
    /// Queue shared by every instance.
    Global,
}

impl fmt::Display for InboundSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InboundSource::Response => f.write_str("response"),
            InboundSource::Direct => f.write_str("direct"),
            InboundSource::Global => f.write_str("global"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub source: InboundSource,
    /// Channel the message was received on.
    pub channel: String,
    pub envelope: Envelope,
}

impl InboundMessage {
    pub fn new(source: InboundSource, channel: impl Into<String>, envelope: Envelope) -> Self {
        InboundMessage {
            source,
            channel: channel.into(),
            envelope,
        }
    }

    /// Dispatch key.
    pub fn kind(&self) -> &str {
        &self.envelope.name
    }
}

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// A handler returns `Ok` once it has handled the message.
pub type Handler = Arc<dyn Fn(&InboundMessage) -> Result<(), HandlerError> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Result of delivering one message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Dispatch {
    pub handled: usize,
    pub failed: usize,
}

impl Dispatch {
    /// At least one handler ran to completion and none failed.
    pub fn is_clean(&self) -> bool {
        self.handled > 0 && self.failed == 0
    }
}

#[derive(Default)]
struct Registry {
    by_kind: HashMap<String, Vec<(HandlerId, Handler)>>,
    wildcard: Vec<(HandlerId, Handler)>,
}

pub struct Dispatcher {
    registry: RwLock<Registry>,
    next_id: AtomicU64,
    stream: broadcast::Sender<InboundMessage>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        let (stream, _) = broadcast::channel(BROADCAST_CAPACITY);
        Dispatcher {
            registry: RwLock::new(Registry::default()),
            next_id: AtomicU64::new(0),
            stream,
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("Dispatcher")
            .field("kinds", &registry.by_kind.keys().collect::<Vec<_>>())
            .field("wildcard", &registry.wildcard.len())
            .finish()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> HandlerId {
        HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Registers a handler for messages named `kind`.
    pub fn on<F>(&self, kind: impl Into<String>, handler: F) -> HandlerId
    where
        F: Fn(&InboundMessage) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .by_kind
            .entry(kind.into())
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Registers a handler for every message.
    pub fn on_any<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&InboundMessage) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .wildcard
            .push((id, Arc::new(handler)));
        id
    }

    /// Removes a handler. Returns whether it was registered.
    pub fn off(&self, id: HandlerId) -> bool {
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        let before = registry.wildcard.len()
            + registry.by_kind.values().map(Vec::len).sum::<usize>();
        registry.wildcard.retain(|(handler_id, _)| *handler_id != id);
        for handlers in registry.by_kind.values_mut() {
            handlers.retain(|(handler_id, _)| *handler_id != id);
        }
        registry.by_kind.retain(|_, handlers| !handlers.is_empty());
        let after = registry.wildcard.len()
            + registry.by_kind.values().map(Vec::len).sum::<usize>();
        after < before
    }

    /// Stream of every emitted message, for consumers that prefer pulling.
    pub fn subscribe(&self) -> broadcast::Receiver<InboundMessage> {
        self.stream.subscribe()
    }

    /// Delivers `message` and reports whether at least one handler handled it.
    pub fn emit(&self, message: InboundMessage) -> bool {
        self.dispatch(message).handled > 0
    }

    /// Delivers `message` and reports how each handler fared.
    pub fn dispatch(&self, message: InboundMessage) -> Dispatch {
        // Handlers run outside the lock so they may register or remove handlers themselves.
        let handlers: Vec<Handler> = {
            let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
            registry
                .by_kind
                .get(message.kind())
                .into_iter()
                .flatten()
                .chain(registry.wildcard.iter())
                .map(|(_, handler)| Arc::clone(handler))
                .collect()
        };

        let mut dispatch = Dispatch::default();
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(&message))) {
                Ok(Ok(())) => dispatch.handled += 1,
                Ok(Err(e)) => {
                    dispatch.failed += 1;
                    error!(
                        "RELAY | Handler for '{}' ({} on {}) failed: {e}",
                        message.kind(),
                        message.source,
                        message.channel
                    );
                }
                Err(payload) => {
                    dispatch.failed += 1;
                    error!(
                        "RELAY | Handler for '{}' ({} on {}) panicked: {}",
                        message.kind(),
                        message.source,
                        message.channel,
                        panic_message(payload.as_ref())
                    );
                }
            }
        }

        if dispatch.handled == 0 && dispatch.failed == 0 {
            warn!(
                "RELAY | Unhandled inbound message '{}' ({} on {})",
                message.kind(),
                message.source,
                message.channel
            );
        } else {
            debug!(
                "RELAY | Dispatched '{}': {} handled, {} failed",
                message.kind(),
                dispatch.handled,
                dispatch.failed
            );
        }

        // No subscribers is fine.
        let _ = self.stream.send(message);
        dispatch
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "unknown panic payload".to_string()
}

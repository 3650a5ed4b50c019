// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Buffered delivery of application events to a remote ingest endpoint.
//!
//! Producers hand [`Envelope`]s to a [`Relay`]. Each channel buffers them locally (or on a
//! distributed queue shared by several relay instances) and a flush scheduler posts them in
//! batches to the ingest URL negotiated with the backend. Responses may carry options, retries
//! and messages, which are routed back to this instance or its peers and dispatched to handlers.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod api_key;
pub mod buffer;
pub mod config;
pub mod constants;
pub mod dispatcher;
pub mod envelope;
pub mod errors;
pub mod http;
pub mod messaging;
pub mod negotiator;
pub mod queue;
pub mod relay;
pub mod remote_config;
pub mod scheduler;

#[cfg(test)]
mod testing;

pub use api_key::ApiKeyFactory;
pub use config::{Intervals, RelayConfig, Tags};
pub use dispatcher::{Dispatcher, HandlerId, InboundMessage, InboundSource};
pub use envelope::{Envelope, ProtocolVersion};
pub use errors::{ConfigError, EnvelopeError, HttpError, QueueError, RelayError};
pub use http::{IngestClient, IngestResponse, IngestTransport};
pub use messaging::{ListenScope, Messenger};
pub use negotiator::{Negotiator, RemoteOptions};
pub use queue::{MemoryQueueStore, QueueBackend, QueueClient};
pub use relay::{ChannelKind, ChannelSpec, Relay, RelayBuilder};
pub use remote_config::RemoteConfigStore;
pub use scheduler::{DeliveryOutcome, SchedulerHandle, SchedulerState};

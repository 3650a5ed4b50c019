// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Client version reported to the backend in `X-Client-Version`.
pub const CLIENT_VERSION: u32 = 107;

/// Hard cap on the serialized size of a single envelope, in bytes.
pub const MAX_ENVELOPE_BYTES: usize = 9000;

/// Soft cap on the number of envelopes waiting in a local buffer.
pub const MAX_BUFFERED_ENVELOPES: usize = 1000;

/// Envelopes per POST. Keeps a full batch well under the backend's ~1MB body limit.
pub const MAX_BATCH_ENVELOPES: usize = 100;

/// Flush cycles attempted back-to-back when a channel shuts down.
pub const SHUTDOWN_FLUSH_CYCLES: usize = 10;

/// Waits shorter than this are skipped instead of slept.
pub const MIN_SCHEDULER_WAIT: Duration = Duration::from_millis(29);

pub const DEFAULT_INGEST_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_INGEST_RETRY_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_INGEST_NOOP_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_NEGOTIATION_RETRY_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default lifetime of a message placed on a distributed queue.
pub const DEFAULT_MESSAGE_EXPIRY: Duration = Duration::from_secs(3600);

/// Default visibility timeout applied to claimed queue entries.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

/// Minimum time between two reads of a messenger consumer loop.
pub const CONSUMER_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Prefix shared by every distributed queue the relay creates.
pub const QUEUE_PREFIX: &str = "__relay";

/// Inbound message name carrying a remote config update.
pub const REMOTE_CONFIG_MESSAGE: &str = "remoteConfig";

// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-channel flush control loop.
//!
//! A [`FlushScheduler`] repeatedly builds a bounded batch, posts it and waits an interval chosen
//! from the outcome. It runs as one task per channel and is driven from the outside only through
//! its [`SchedulerHandle`]: producers push envelopes, the owner stops it. Stopping ends the loop
//! and runs a bounded drain so buffered data gets one last chance to leave the process.
//!
//! Two topologies exist:
//!
//! - [`Topology::Direct`] posts what producers pushed into the local buffer.
//! - [`Topology::QueuePolling`] posts envelopes read from a distributed queue shared by several
//!   instances. Envelopes the backend asks to retry are still requeued locally and go first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buffer::{LocalBuffer, SharedBuffer};
use crate::config::{Intervals, Tags};
use crate::constants::{MAX_BATCH_ENVELOPES, MAX_BUFFERED_ENVELOPES, SHUTDOWN_FLUSH_CYCLES};
use crate::dispatcher::{Dispatcher, InboundMessage, InboundSource};
use crate::envelope::{encode, Envelope, ProtocolVersion};
use crate::errors::{EnvelopeError, HttpError};
use crate::http::{IngestResponse, IngestTransport};
use crate::messaging::Messenger;
use crate::negotiator::{Negotiator, RemoteOptions};
use crate::queue::{DeleteKey, QueueClient, QueuedEnvelope, ReadBatch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Negotiating,
    Flushing,
    Waiting,
    /// Terminal.
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The batch of this many envelopes was accepted.
    Success(usize),
    /// Nothing to send.
    Empty,
    /// Nothing was lost; the batch is retried later. `negotiation` is set when the cycle failed
    /// before a batch was built.
    TransientFailure {
        retry_after: Option<Duration>,
        negotiation: bool,
    },
    /// Credentials were rejected; the channel never flushes again.
    FatalAuthFailure,
}

/// Delay before the next cycle, or `None` to start it right away.
pub fn next_wait(
    outcome: DeliveryOutcome,
    elapsed: Duration,
    intervals: &Intervals,
) -> Option<Duration> {
    let base = match outcome {
        DeliveryOutcome::Success(_) => intervals.ingest,
        DeliveryOutcome::Empty => intervals.ingest_noop,
        DeliveryOutcome::TransientFailure {
            negotiation: true, ..
        } => intervals.negotiation_retry,
        DeliveryOutcome::TransientFailure { retry_after, .. } => retry_after
            .map_or(intervals.ingest_retry, |hint| hint.max(intervals.ingest_retry)),
        DeliveryOutcome::FatalAuthFailure => return None,
    };
    let wait = base.saturating_sub(elapsed);
    (wait >= intervals.min_wait).then_some(wait)
}

pub enum Topology {
    Direct,
    QueuePolling {
        queue: QueueClient<QueuedEnvelope>,
        /// Longest a cycle waits for the queue to fill.
        wait: Duration,
        /// Post even when there is nothing to send, so the backend can answer with inbound
        /// messages.
        post_empty_batches: bool,
    },
}

impl std::fmt::Debug for Topology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Topology::Direct => f.write_str("Direct"),
            Topology::QueuePolling {
                queue,
                wait,
                post_empty_batches,
            } => f
                .debug_struct("QueuePolling")
                .field("queue", &queue.name())
                .field("wait", wait)
                .field("post_empty_batches", post_empty_batches)
                .finish(),
        }
    }
}

pub struct SchedulerConfig {
    pub channel: String,
    pub transport: Arc<dyn IngestTransport>,
    pub negotiator: Arc<Negotiator>,
    pub dispatcher: Arc<Dispatcher>,
    /// Receives `locals` and `global` payloads of responses. Dropped with a warning when absent.
    pub messenger: Option<Arc<Messenger>>,
    pub topology: Topology,
    pub intervals: Intervals,
    /// Posts here instead of the negotiated ingest URL.
    pub ingest_url: Option<String>,
    pub protocol_version: ProtocolVersion,
    pub tags: Tags,
    pub buffer_capacity: usize,
    pub batch_size: usize,
}

impl SchedulerConfig {
    pub fn new(
        channel: impl Into<String>,
        transport: Arc<dyn IngestTransport>,
        negotiator: Arc<Negotiator>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        SchedulerConfig {
            channel: channel.into(),
            transport,
            negotiator,
            dispatcher,
            messenger: None,
            topology: Topology::Direct,
            intervals: Intervals::default(),
            ingest_url: None,
            protocol_version: ProtocolVersion::default(),
            tags: Tags::new(),
            buffer_capacity: MAX_BUFFERED_ENVELOPES,
            batch_size: MAX_BATCH_ENVELOPES,
        }
    }
}

fn lock(buffer: &SharedBuffer) -> MutexGuard<'_, LocalBuffer> {
    buffer.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Producer and owner side of a running scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    channel: String,
    buffer: SharedBuffer,
    tags: Arc<Tags>,
    protocol_version: ProtocolVersion,
    state: watch::Receiver<SchedulerState>,
    cancel: CancellationToken,
}

impl SchedulerHandle {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Adds the channel tags, checks the size and buffers the envelope. A full buffer drops the
    /// envelope with a warning; that is not an error for the producer.
    pub fn send(&self, envelope: Envelope) -> Result<(), EnvelopeError> {
        let envelope = self.prepare(envelope)?;
        lock(&self.buffer).push(envelope);
        Ok(())
    }

    /// Adds the channel tags and checks the size without buffering.
    pub fn prepare(&self, envelope: Envelope) -> Result<Envelope, EnvelopeError> {
        let envelope = envelope.with_tags(self.tags.tags());
        encode(&envelope, self.protocol_version)?;
        Ok(envelope)
    }

    /// Ends the loop after the current cycle. Safe to call any number of times.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    /// Watches state transitions.
    pub fn states(&self) -> watch::Receiver<SchedulerState> {
        self.state.clone()
    }

    /// Envelopes waiting in the local buffer.
    pub fn buffered(&self) -> usize {
        lock(&self.buffer).len()
    }

    /// Envelopes dropped because the local buffer was full.
    pub fn dropped(&self) -> u64 {
        lock(&self.buffer).dropped()
    }
}

struct Batch {
    envelopes: Vec<Envelope>,
    /// The first `from_buffer` envelopes came from the local buffer.
    from_buffer: usize,
    delete_key: Option<DeleteKey>,
}

pub struct FlushScheduler {
    channel: String,
    buffer: SharedBuffer,
    transport: Arc<dyn IngestTransport>,
    negotiator: Arc<Negotiator>,
    dispatcher: Arc<Dispatcher>,
    messenger: Option<Arc<Messenger>>,
    topology: Topology,
    intervals: Intervals,
    ingest_url: Option<String>,
    batch_size: usize,
    state: watch::Sender<SchedulerState>,
    cancel: CancellationToken,
    fatal: AtomicBool,
}

impl FlushScheduler {
    pub fn new(config: SchedulerConfig) -> (Self, SchedulerHandle) {
        let buffer = LocalBuffer::shared(config.buffer_capacity);
        let (state, state_rx) = watch::channel(SchedulerState::Idle);
        let cancel = CancellationToken::new();

        let handle = SchedulerHandle {
            channel: config.channel.clone(),
            buffer: Arc::clone(&buffer),
            tags: Arc::new(config.tags),
            protocol_version: config.protocol_version,
            state: state_rx,
            cancel: cancel.clone(),
        };
        let scheduler = FlushScheduler {
            channel: config.channel,
            buffer,
            transport: config.transport,
            negotiator: config.negotiator,
            dispatcher: config.dispatcher,
            messenger: config.messenger,
            topology: config.topology,
            intervals: config.intervals,
            ingest_url: config.ingest_url,
            batch_size: config.batch_size.max(1),
            state,
            cancel,
            fatal: AtomicBool::new(false),
        };
        (scheduler, handle)
    }

    fn set_state(&self, state: SchedulerState) {
        self.state.send_if_modified(|current| {
            if *current == SchedulerState::Stopped || *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    /// Runs cycles until stopped or halted by an authentication failure, then drains.
    pub async fn run(self) {
        debug!("RELAY | Scheduler for {} started", self.channel);

        while !self.cancel.is_cancelled() {
            let started = Instant::now();
            let outcome = self.run_cycle().await;
            if outcome == DeliveryOutcome::FatalAuthFailure {
                return;
            }
            let Some(wait) = next_wait(outcome, started.elapsed(), &self.intervals) else {
                // A cycle may complete without suspending; let other tasks run.
                tokio::task::yield_now().await;
                continue;
            };
            self.set_state(SchedulerState::Waiting);
            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(wait) => {}
            }
        }

        self.drain(SHUTDOWN_FLUSH_CYCLES).await;
        self.set_state(SchedulerState::Stopped);
        debug!("RELAY | Scheduler for {} stopped", self.channel);
    }

    /// Flushes back-to-back without waiting, at most `max_cycles` times. Stops early once
    /// there is nothing left or the channel is halted. Does nothing on a halted channel.
    pub async fn drain(&self, max_cycles: usize) -> usize {
        if self.fatal.load(Ordering::SeqCst) {
            debug!("RELAY | Skipping drain of halted channel {}", self.channel);
            return 0;
        }
        let mut cycles = 0;
        while cycles < max_cycles {
            cycles += 1;
            match self.cycle(None).await {
                DeliveryOutcome::Empty | DeliveryOutcome::FatalAuthFailure => break,
                outcome => debug!("RELAY | Drain cycle {cycles} of {}: {outcome:?}", self.channel),
            }
        }
        info!("RELAY | Drained {} in {cycles} cycles", self.channel);
        cycles
    }

    /// Runs a single cycle.
    pub async fn run_cycle(&self) -> DeliveryOutcome {
        let queue_wait = match &self.topology {
            Topology::Direct => None,
            Topology::QueuePolling { wait, .. } => Some(*wait),
        };
        self.cycle(queue_wait).await
    }

    async fn cycle(&self, queue_wait: Option<Duration>) -> DeliveryOutcome {
        if self.fatal.load(Ordering::SeqCst) {
            return DeliveryOutcome::FatalAuthFailure;
        }

        let options = match self.negotiator.options() {
            Some(options) => options,
            None => {
                self.set_state(SchedulerState::Negotiating);
                match self.negotiator.ensure_options().await {
                    Ok(options) => options,
                    Err(e) => {
                        return DeliveryOutcome::TransientFailure {
                            retry_after: e.retry_after(),
                            negotiation: true,
                        }
                    }
                }
            }
        };

        self.set_state(SchedulerState::Flushing);
        let batch = self.collect_batch(queue_wait).await;
        if batch.envelopes.is_empty() && !self.posts_empty_batches() {
            // Entries that failed to decode were still claimed.
            self.acknowledge(batch.delete_key.as_ref()).await;
            return DeliveryOutcome::Empty;
        }

        self.deliver(batch, &options).await
    }

    fn posts_empty_batches(&self) -> bool {
        matches!(
            self.topology,
            Topology::QueuePolling {
                post_empty_batches: true,
                ..
            }
        )
    }

    async fn collect_batch(&self, queue_wait: Option<Duration>) -> Batch {
        let mut envelopes = lock(&self.buffer).drain(self.batch_size);
        let from_buffer = envelopes.len();
        let mut delete_key = None;

        if let Topology::QueuePolling { queue, .. } = &self.topology {
            let remaining = self.batch_size - from_buffer;
            // Requeued envelopes are ready now; do not hold them back waiting for more.
            let wait = if from_buffer == 0 { queue_wait } else { None };
            if remaining > 0 {
                // A stop ends the wait but not a read that already claimed entries.
                let read = tokio::select! {
                    read = queue.read(remaining, false, wait) => read,
                    () = self.cancel.cancelled(), if wait.is_some() => Ok(ReadBatch::empty()),
                };
                match read {
                    Ok(read) => {
                        envelopes.extend(read.items.into_iter().map(|QueuedEnvelope(_, e)| e));
                        delete_key = read.delete_key;
                    }
                    Err(e) => warn!("RELAY | Failed to read {}: {e}", queue.name()),
                }
            }
        }

        Batch {
            envelopes,
            from_buffer,
            delete_key,
        }
    }

    async fn acknowledge(&self, key: Option<&DeleteKey>) {
        let (Some(key), Topology::QueuePolling { queue, .. }) = (key, &self.topology) else {
            return;
        };
        if let Err(e) = queue.remove(key).await {
            error!("RELAY | Failed to acknowledge batch on {}: {e}", queue.name());
        }
    }

    async fn deliver(&self, mut batch: Batch, options: &RemoteOptions) -> DeliveryOutcome {
        let url = self.ingest_url.as_deref().unwrap_or(&options.ingest_url);
        let count = batch.envelopes.len();

        match self.transport.post_batch(url, &batch.envelopes).await {
            Ok(response) => {
                self.acknowledge(batch.delete_key.as_ref()).await;
                self.apply(response).await;
                if count == 0 {
                    DeliveryOutcome::Empty
                } else {
                    debug!("RELAY | Flushed {count} envelopes on {}", self.channel);
                    DeliveryOutcome::Success(count)
                }
            }
            Err(e) => {
                batch.envelopes.truncate(batch.from_buffer);
                lock(&self.buffer).requeue_front(batch.envelopes);
                if e.is_fatal() {
                    self.halt(&e);
                    return DeliveryOutcome::FatalAuthFailure;
                }
                warn!(
                    "RELAY | Failed to flush {count} envelopes on {}, will retry: {e}",
                    self.channel
                );
                DeliveryOutcome::TransientFailure {
                    retry_after: e.retry_after(),
                    negotiation: false,
                }
            }
        }
    }

    fn halt(&self, e: &HttpError) {
        self.fatal.store(true, Ordering::SeqCst);
        self.set_state(SchedulerState::Stopped);
        error!(
            "RELAY | FATAL | Channel {} disabled, credentials rejected ({e}). Please verify that your API key is valid.",
            self.channel
        );
    }

    async fn apply(&self, response: IngestResponse) {
        if let Some(options) = response.options {
            self.negotiator.set_options(options);
        }

        for envelope in response.messages {
            self.dispatcher.emit(InboundMessage::new(
                InboundSource::Response,
                self.channel.clone(),
                envelope,
            ));
        }

        if !response.locals.is_empty() || !response.global.is_empty() {
            match &self.messenger {
                Some(messenger) => messenger.route(response.locals, response.global).await,
                None => warn!(
                    "RELAY | Dropping routed messages on {}: no messenger attached",
                    self.channel
                ),
            }
        }

        if !response.retry.is_empty() {
            debug!(
                "RELAY | Backend asked to retry {} envelopes on {}",
                response.retry.len(),
                self.channel
            );
            lock(&self.buffer).requeue_front(response.retry);
        }
    }
}

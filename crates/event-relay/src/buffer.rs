// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-memory buffer of envelopes waiting to be flushed.
//!
//! The buffer is a FIFO queue with a soft cap. When the cap is reached new envelopes are
//! dropped (and counted) instead of evicting unsent data. Batches that fail to send are put back
//! at the head with [`LocalBuffer::requeue_front`], so a retried batch always goes out before
//! anything that was pushed after it. Requeueing ignores the cap: data that was already accepted
//! is never dropped.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::constants::MAX_BUFFERED_ENVELOPES;
use crate::envelope::Envelope;

/// Buffer shared between a scheduler and its producer handle. The lock is never held across an
/// await point.
pub type SharedBuffer = Arc<Mutex<LocalBuffer>>;

#[derive(Debug, Clone)]
pub struct LocalBuffer {
    entries: VecDeque<Envelope>,
    max_entries: usize,
    dropped: u64,
}

impl Default for LocalBuffer {
    fn default() -> Self {
        LocalBuffer::new(MAX_BUFFERED_ENVELOPES)
    }
}

impl LocalBuffer {
    pub fn new(max_entries: usize) -> Self {
        LocalBuffer {
            entries: VecDeque::new(),
            max_entries,
            dropped: 0,
        }
    }

    pub fn shared(max_entries: usize) -> SharedBuffer {
        Arc::new(Mutex::new(LocalBuffer::new(max_entries)))
    }

    /// Appends an envelope. Returns `false` if the buffer is full and the envelope was dropped.
    pub fn push(&mut self, envelope: Envelope) -> bool {
        if self.entries.len() >= self.max_entries {
            self.dropped += 1;
            warn!(
                "RELAY | Buffer full ({} entries), dropping envelope '{}'",
                self.max_entries, envelope.name
            );
            return false;
        }
        self.entries.push_back(envelope);
        true
    }

    /// Removes and returns up to `max` envelopes from the head, oldest first.
    pub fn drain(&mut self, max: usize) -> Vec<Envelope> {
        let count = max.min(self.entries.len());
        self.entries.drain(..count).collect()
    }

    /// Puts `envelopes` back at the head, keeping their relative order.
    pub fn requeue_front(&mut self, envelopes: Vec<Envelope>) {
        for envelope in envelopes.into_iter().rev() {
            self.entries.push_front(envelope);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of envelopes dropped because the buffer was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Test doubles shared by the unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::envelope::Envelope;
use crate::errors::HttpError;
use crate::http::{IngestResponse, IngestTransport};
use crate::negotiator::RemoteOptions;

pub(crate) const TEST_INGEST_URL: &str = "http://backend.test/ingest";

/// Transport answering from scripted queues. Once a queue runs dry every call succeeds with a
/// default answer.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    options: Mutex<VecDeque<Result<RemoteOptions, HttpError>>>,
    posts: Mutex<VecDeque<Result<IngestResponse, HttpError>>>,
    posted: Mutex<Vec<Vec<Envelope>>>,
    fetch_calls: AtomicUsize,
}

impl ScriptedTransport {
    pub(crate) fn push_options(&self, result: Result<RemoteOptions, HttpError>) {
        self.options.lock().expect("lock poisoned").push_back(result);
    }

    pub(crate) fn push_post(&self, result: Result<IngestResponse, HttpError>) {
        self.posts.lock().expect("lock poisoned").push_back(result);
    }

    pub(crate) fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    /// Names of the envelopes of every POST, in call order.
    pub(crate) fn posted_names(&self) -> Vec<Vec<String>> {
        self.posted
            .lock()
            .expect("lock poisoned")
            .iter()
            .map(|batch| batch.iter().map(|e| e.name.clone()).collect())
            .collect()
    }
}

#[async_trait]
impl IngestTransport for ScriptedTransport {
    async fn fetch_options(&self, _url: &str) -> Result<RemoteOptions, HttpError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.options
            .lock()
            .expect("lock poisoned")
            .pop_front()
            .unwrap_or_else(|| Ok(RemoteOptions::new(TEST_INGEST_URL)))
    }

    async fn post_batch(
        &self,
        _url: &str,
        envelopes: &[Envelope],
    ) -> Result<IngestResponse, HttpError> {
        self.posted
            .lock()
            .expect("lock poisoned")
            .push(envelopes.to_vec());
        self.posts
            .lock()
            .expect("lock poisoned")
            .pop_front()
            .unwrap_or_else(|| Ok(IngestResponse::default()))
    }
}

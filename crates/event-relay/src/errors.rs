// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for the relay.

use std::time::Duration;

use reqwest::StatusCode;

/// Errors raised while encoding or decoding envelopes.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("envelope is {size} bytes, larger than the {max} byte limit")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("malformed envelope: {0}")]
    Protocol(String),
    #[error("failed to serialize envelope: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Errors returned by the ingest HTTP client.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    /// Credentials were rejected. The channel must not retry.
    #[error("unauthorized: status {0}")]
    Unauthorized(u16),
    /// Non-success status other than an authentication failure.
    #[error("unexpected status {status}")]
    Status {
        status: u16,
        retry_after: Option<Duration>,
    },
    /// 2xx response whose body reported `"success": false`.
    #[error("backend rejected the batch")]
    Rejected,
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("failed to decode response body: {0}")]
    Decode(String),
    #[error("failed to prepare request: {0}")]
    Client(String),
}

impl HttpError {
    /// Authentication failures permanently disable a channel.
    pub fn is_fatal(&self) -> bool {
        matches!(self, HttpError::Unauthorized(_))
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            HttpError::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub(crate) fn from_status(status: StatusCode, retry_after: Option<Duration>) -> Self {
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return HttpError::Unauthorized(status.as_u16());
        }
        HttpError::Status {
            status: status.as_u16(),
            retry_after,
        }
    }
}

/// Errors returned by distributed queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("failed to encode queue value: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("queue backend error: {0}")]
    Backend(String),
    #[error("already listening to the {0} queue")]
    AlreadyListening(String),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Errors raised while assembling or driving a relay.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("channel {0} registered more than once")]
    DuplicateChannel(String),
    #[error("no channel named {0}")]
    UnknownChannel(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

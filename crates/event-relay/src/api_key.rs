// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! API key used as the bearer token on every ingest request.
//!
//! Keys are either known at startup or resolved lazily (e.g. from a secret store) the first time
//! a request needs one. A resolver runs at most once; every channel sharing the factory sees the
//! same key.

use std::fmt::Debug;
use std::sync::Arc;
use std::{future::Future, pin::Pin};
use tokio::sync::OnceCell;

/// Resolves the key. Returning `None` means no key is available, which the ingest client treats
/// as an authentication failure.
pub type ApiKeyResolverFn =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Option<String>> + Send>> + Send + Sync>;

#[derive(Clone)]
pub enum ApiKeyFactory {
    Static(String),
    Dynamic {
        resolver_fn: ApiKeyResolverFn,
        api_key: Arc<OnceCell<Option<String>>>,
    },
}

impl ApiKeyFactory {
    pub fn new_from_resolver(resolver_fn: ApiKeyResolverFn) -> Self {
        Self::Dynamic {
            resolver_fn,
            api_key: Arc::new(OnceCell::new()),
        }
    }

    pub fn new_from_static_key(api_key: &str) -> Self {
        Self::Static(api_key.trim().to_string())
    }

    /// Returns the key, or `None` if it is empty or could not be resolved.
    pub async fn get_api_key(&self) -> Option<&str> {
        let key = match self {
            Self::Static(api_key) => Some(api_key.as_str()),
            Self::Dynamic {
                resolver_fn,
                api_key,
            } => api_key
                .get_or_init(|| async { (resolver_fn)().await })
                .await
                .as_deref(),
        };
        key.filter(|key| !key.is_empty())
    }
}

impl Debug for ApiKeyFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Static(_) => write!(f, "ApiKeyFactory::Static(<redacted>)"),
            Self::Dynamic { .. } => write!(f, "ApiKeyFactory::Dynamic"),
        }
    }
}

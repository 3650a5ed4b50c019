// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP plumbing towards the ingest backend.
//!
//! [`IngestTransport`] is what the negotiator and the flush scheduler talk to; [`IngestClient`]
//! is its reqwest implementation. Every request carries the same identification headers and
//! every response status goes through [`classify_status`].

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{
    HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_ENCODING, CONTENT_TYPE, RETRY_AFTER,
};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};
use zstd::stream::write::Encoder;

use crate::api_key::ApiKeyFactory;
use crate::constants::CLIENT_VERSION;
use crate::envelope::{decode_value, Envelope, ProtocolVersion};
use crate::errors::HttpError;
use crate::negotiator::RemoteOptions;

/// Builds the reqwest client used for every request of a relay.
pub fn build_client(proxy_url: Option<&str>, timeout: Duration) -> Result<reqwest::Client, HttpError> {
    let mut builder = reqwest::Client::builder().timeout(timeout);
    if let Some(proxy) = proxy_url {
        builder = builder.proxy(reqwest::Proxy::https(proxy)?);
    }
    Ok(builder.build()?)
}

/// Maps a response status onto the error taxonomy. 401 and 403 are fatal; everything else that
/// is not a 2xx is transient.
pub(crate) fn classify_status(
    status: StatusCode,
    headers: &HeaderMap,
) -> Result<(), HttpError> {
    if status.is_success() {
        return Ok(());
    }
    Err(HttpError::from_status(status, retry_after(headers)))
}

/// Parses a `Retry-After` header given in seconds. HTTP-date values are ignored.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[derive(Debug, Default, Deserialize)]
struct RawResponse {
    success: Option<bool>,
    options: Option<RemoteOptions>,
    #[serde(default)]
    retry: Vec<Value>,
    #[serde(default)]
    messages: Vec<Value>,
    #[serde(default)]
    locals: BTreeMap<String, Vec<Value>>,
    #[serde(default)]
    global: Vec<Value>,
}

/// Decoded body of a successful flush. An empty body decodes to the default value.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct IngestResponse {
    /// Replaces the cached options when present.
    pub options: Option<RemoteOptions>,
    /// Envelopes the backend asks to have sent again, in order.
    pub retry: Vec<Envelope>,
    /// Inbound messages for this instance.
    pub messages: Vec<Envelope>,
    /// Messages to forward to other instances, keyed by instance id.
    pub locals: BTreeMap<String, Vec<Envelope>>,
    /// Messages to forward to every instance.
    pub global: Vec<Envelope>,
}

impl IngestResponse {
    fn from_raw(raw: RawResponse, version: ProtocolVersion) -> Self {
        IngestResponse {
            options: raw.options,
            retry: decode_list(raw.retry, version, "retry"),
            messages: decode_list(raw.messages, version, "messages"),
            locals: raw
                .locals
                .into_iter()
                .map(|(instance, values)| (instance, decode_list(values, version, "locals")))
                .collect(),
            global: decode_list(raw.global, version, "global"),
        }
    }
}

/// Decodes each element independently; one bad element never poisons the rest.
fn decode_list(values: Vec<Value>, version: ProtocolVersion, field: &str) -> Vec<Envelope> {
    values
        .into_iter()
        .filter_map(|value| match decode_value(value, version) {
            Ok(envelope) => Some(envelope),
            Err(e) => {
                warn!("RELAY | Discarding element of '{field}': {e}");
                None
            }
        })
        .collect()
}

#[async_trait]
pub trait IngestTransport: Send + Sync {
    /// Negotiation handshake. Anything but a 200 with a decodable body is an error.
    async fn fetch_options(&self, url: &str) -> Result<RemoteOptions, HttpError>;

    /// Posts one batch as `{"messages": [...]}`.
    async fn post_batch(
        &self,
        url: &str,
        envelopes: &[Envelope],
    ) -> Result<IngestResponse, HttpError>;
}

#[derive(Debug, Clone)]
pub struct IngestClient {
    client: reqwest::Client,
    api_key_factory: Arc<ApiKeyFactory>,
    run_mode: String,
    protocol_version: ProtocolVersion,
    compression_level: Option<i32>,
}

impl IngestClient {
    pub fn new(
        client: reqwest::Client,
        api_key_factory: Arc<ApiKeyFactory>,
        run_mode: impl Into<String>,
        protocol_version: ProtocolVersion,
        compression_level: Option<i32>,
    ) -> Self {
        IngestClient {
            client,
            api_key_factory,
            run_mode: run_mode.into(),
            protocol_version,
            compression_level,
        }
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.protocol_version
    }

    async fn headers(&self, with_body: bool) -> Result<HeaderMap, HttpError> {
        let Some(api_key) = self.api_key_factory.get_api_key().await else {
            return Err(HttpError::Unauthorized(StatusCode::UNAUTHORIZED.as_u16()));
        };
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {api_key}"))
                .map_err(|_| HttpError::Client("API key is not a valid header value".to_string()))?,
        );
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert("X-Client-Version", HeaderValue::from(CLIENT_VERSION));
        headers.insert(
            "X-Run-Mode",
            HeaderValue::from_str(&self.run_mode)
                .map_err(|_| HttpError::Client(format!("invalid run mode '{}'", self.run_mode)))?,
        );
        headers.insert(
            "X-Protocol-Version",
            HeaderValue::from_static(self.protocol_version.as_header()),
        );
        if with_body {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            if self.compression_level.is_some() {
                headers.insert(CONTENT_ENCODING, HeaderValue::from_static("zstd"));
            }
        }
        Ok(headers)
    }

    fn body(&self, envelopes: &[Envelope]) -> Result<Vec<u8>, HttpError> {
        let messages: Vec<Value> = envelopes
            .iter()
            .map(|envelope| envelope.to_wire(self.protocol_version))
            .collect();
        let body = serde_json::to_vec(&json!({ "messages": messages }))
            .map_err(|e| HttpError::Client(e.to_string()))?;
        match self.compression_level {
            Some(level) => compress(&body, level)
                .map_err(|e| HttpError::Client(format!("compression failed: {e}"))),
            None => Ok(body),
        }
    }
}

fn compress(data: &[u8], level: i32) -> std::io::Result<Vec<u8>> {
    let mut encoder = Encoder::new(Vec::new(), level)?;
    encoder.write_all(data)?;
    encoder.finish()
}

#[async_trait]
impl IngestTransport for IngestClient {
    async fn fetch_options(&self, url: &str) -> Result<RemoteOptions, HttpError> {
        let headers = self.headers(false).await?;
        let response = self.client.get(url).headers(headers).send().await?;
        let status = response.status();
        classify_status(status, response.headers())?;
        if status != StatusCode::OK {
            return Err(HttpError::Status {
                status: status.as_u16(),
                retry_after: None,
            });
        }
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| HttpError::Decode(e.to_string()))
    }

    async fn post_batch(
        &self,
        url: &str,
        envelopes: &[Envelope],
    ) -> Result<IngestResponse, HttpError> {
        let headers = self.headers(true).await?;
        let body = self.body(envelopes)?;
        debug!(
            "RELAY | Posting {} envelopes ({} bytes) to {url}",
            envelopes.len(),
            body.len()
        );

        let response = self
            .client
            .post(url)
            .headers(headers)
            .body(body)
            .send()
            .await?;
        classify_status(response.status(), response.headers())?;

        let bytes = response.bytes().await?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(IngestResponse::default());
        }
        let raw: RawResponse =
            serde_json::from_slice(&bytes).map_err(|e| HttpError::Decode(e.to_string()))?;
        if raw.success == Some(false) {
            return Err(HttpError::Rejected);
        }
        Ok(IngestResponse::from_raw(raw, self.protocol_version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn client(protocol_version: ProtocolVersion, compression_level: Option<i32>) -> IngestClient {
        IngestClient::new(
            build_client(None, Duration::from_secs(5)).expect("failed to build client"),
            Arc::new(ApiKeyFactory::new_from_static_key("test-key")),
            "server",
            protocol_version,
            compression_level,
        )
    }

    fn envelope(name: &str) -> Envelope {
        Envelope::new(name).with_timestamp_millis(1_000)
    }

    #[test]
    fn test_retry_after_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), None);
        headers.insert(RETRY_AFTER, HeaderValue::from_static("12"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(12)));
        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(retry_after(&headers), None);
    }

    #[test]
    fn test_classify_status() {
        let headers = HeaderMap::new();
        assert!(classify_status(StatusCode::OK, &headers).is_ok());
        assert!(classify_status(StatusCode::NO_CONTENT, &headers).is_ok());
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, &headers),
            Err(HttpError::Unauthorized(403))
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, &headers),
            Err(HttpError::Status { status: 502, .. })
        ));
    }

    #[test]
    fn test_compressed_body_round_trips() {
        let client = client(ProtocolVersion::V2, Some(3));
        let body = client.body(&[envelope("a")]).expect("body failed");
        let mut decoder = zstd::stream::read::Decoder::new(&body[..]).expect("decoder failed");
        let mut plain = Vec::new();
        std::io::Read::read_to_end(&mut decoder, &mut plain).expect("decompress failed");
        let value: Value = serde_json::from_slice(&plain).expect("not json");
        assert_eq!(value["messages"][0]["name"], "a");
    }

    #[tokio::test]
    async fn test_post_sends_identification_headers() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/ingest")
            .match_header("authorization", "Bearer test-key")
            .match_header("accept", "application/json")
            .match_header("content-type", "application/json")
            .match_header("x-client-version", CLIENT_VERSION.to_string().as_str())
            .match_header("x-run-mode", "server")
            .match_header("x-protocol-version", "1")
            .match_body(Matcher::Json(json!({"messages": [["a", 1, {}, null]]})))
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let response = client(ProtocolVersion::V1, None)
            .post_batch(&format!("{}/ingest", server.url()), &[envelope("a")])
            .await
            .expect("post failed");

        assert_eq!(response, IngestResponse::default());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_post_decodes_response_payloads() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/ingest")
            .with_status(200)
            .with_body(
                json!({
                    "success": true,
                    "options": {"url": "https://next.example.com/ingest", "config": {"k": 1}},
                    "retry": [{"name": "again", "timestamp": 5}, {"bogus": true}],
                    "messages": [{"name": "kick"}],
                    "locals": {"server-2": [{"name": "hello"}]},
                    "global": [{"name": "announce"}]
                })
                .to_string(),
            )
            .create_async()
            .await;

        let response = client(ProtocolVersion::V2, None)
            .post_batch(&format!("{}/ingest", server.url()), &[])
            .await
            .expect("post failed");

        let options = response.options.expect("missing options");
        assert_eq!(options.ingest_url, "https://next.example.com/ingest");
        assert_eq!(response.retry.len(), 1);
        assert_eq!(response.retry[0].name, "again");
        assert_eq!(response.messages[0].name, "kick");
        assert_eq!(response.locals["server-2"][0].name, "hello");
        assert_eq!(response.global[0].name, "announce");
    }

    #[tokio::test]
    async fn test_post_error_statuses() {
        let mut server = mockito::Server::new_async().await;
        let _rejected = server
            .mock("POST", "/rejected")
            .with_status(200)
            .with_body(r#"{"success": false}"#)
            .create_async()
            .await;
        let _limited = server
            .mock("POST", "/limited")
            .with_status(429)
            .with_header("retry-after", "30")
            .create_async()
            .await;
        let _denied = server
            .mock("POST", "/denied")
            .with_status(401)
            .create_async()
            .await;
        let _garbage = server
            .mock("POST", "/garbage")
            .with_status(200)
            .with_body("<html>")
            .create_async()
            .await;

        let client = client(ProtocolVersion::V2, None);
        let post = |path: &'static str| {
            let client = client.clone();
            let url = format!("{}{path}", server.url());
            async move { client.post_batch(&url, &[envelope("a")]).await }
        };

        assert!(matches!(post("/rejected").await, Err(HttpError::Rejected)));
        let limited = post("/limited").await.expect_err("expected an error");
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(30)));
        assert!(!limited.is_fatal());
        assert!(post("/denied").await.expect_err("expected an error").is_fatal());
        assert!(matches!(post("/garbage").await, Err(HttpError::Decode(_))));
    }

    #[tokio::test]
    async fn test_fetch_options() {
        let mut server = mockito::Server::new_async().await;
        let _ok = server
            .mock("GET", "/negotiate")
            .match_header("authorization", "Bearer test-key")
            .with_status(200)
            .with_body(r#"{"url": "https://ingest.example.com", "options": {"config": {"a": true}}}"#)
            .create_async()
            .await;
        let _accepted = server
            .mock("GET", "/accepted")
            .with_status(202)
            .create_async()
            .await;

        let client = client(ProtocolVersion::V2, None);
        let options = client
            .fetch_options(&format!("{}/negotiate", server.url()))
            .await
            .expect("fetch failed");
        assert_eq!(options.ingest_url, "https://ingest.example.com");
        assert_eq!(options.server_config()["a"], true);

        assert!(client
            .fetch_options(&format!("{}/accepted", server.url()))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_missing_api_key_is_fatal() {
        let client = IngestClient::new(
            build_client(None, Duration::from_secs(5)).expect("failed to build client"),
            Arc::new(ApiKeyFactory::new_from_static_key("")),
            "server",
            ProtocolVersion::V2,
            None,
        );
        let error = client
            .post_batch("http://127.0.0.1:1/ingest", &[])
            .await
            .expect_err("expected an error");
        assert!(error.is_fatal());
    }
}

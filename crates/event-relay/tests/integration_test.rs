// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use event_relay::{
    api_key::ApiKeyFactory,
    config::{Intervals, RelayConfig},
    envelope::{Envelope, ProtocolVersion},
    errors::{EnvelopeError, RelayError},
    http::{build_client, IngestClient, IngestTransport},
    messaging::ListenScope,
    negotiator::Negotiator,
    queue::MemoryQueueStore,
    relay::{ChannelSpec, Relay, RelayBuilder},
    scheduler::SchedulerState,
};
use mockito::{Matcher, Mock, Server, ServerGuard};
use serde_json::json;
use std::sync::Arc;
use tokio::time::{sleep, timeout, Duration};

const API_KEY: &str = "mock-api-key";

fn config(server: &ServerGuard) -> RelayConfig {
    RelayConfig {
        api_key: Some(API_KEY.to_string()),
        base_url: server.url(),
        ..RelayConfig::default()
    }
}

async fn negotiation_mock(server: &mut ServerGuard) -> Mock {
    let body = json!({ "url": format!("{}/ingest", server.url()), "options": {} });
    server
        .mock("GET", Matcher::Regex(r"^/instances/[^/]+/messaging$".to_string()))
        .match_header("Authorization", format!("Bearer {API_KEY}").as_str())
        .with_status(200)
        .with_body(body.to_string())
        .expect_at_least(1)
        .create_async()
        .await
}

fn batch(names: &[(&str, i64)]) -> Matcher {
    let messages: Vec<_> = names
        .iter()
        .map(|(name, ts)| json!({"name": name, "timestamp": ts, "tags": {}, "payload": null}))
        .collect();
    Matcher::Json(json!({ "messages": messages }))
}

async fn wait_until_matched(mock: &Mock) {
    let matched = async {
        while !mock.matched_async().await {
            sleep(Duration::from_millis(10)).await;
        }
    };
    if timeout(Duration::from_secs(5), matched).await.is_err() {
        panic!("timed out waiting for request");
    }
}

#[tokio::test]
async fn relay_flushes_buffered_envelopes_in_call_order() {
    let mut server = Server::new_async().await;
    let negotiation = negotiation_mock(&mut server).await;
    let ingest = server
        .mock("POST", "/ingest")
        .match_header("Authorization", format!("Bearer {API_KEY}").as_str())
        .match_header("X-Protocol-Version", "2")
        .match_body(batch(&[("x", 1), ("x", 2), ("x", 3)]))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let relay = RelayBuilder::new(config(&server))
        .channel(ChannelSpec::direct("analytics"))
        .build()
        .expect("failed to build relay");
    for ts in 1..=3 {
        relay
            .send("analytics", Envelope::new("x").with_timestamp_millis(ts))
            .await
            .expect("send failed");
    }
    let handle = relay.handle("analytics").expect("missing channel").clone();

    relay.shutdown().await;

    negotiation.assert_async().await;
    ingest.assert_async().await;
    assert_eq!(handle.buffered(), 0);
    assert_eq!(handle.state(), SchedulerState::Stopped);
}

#[tokio::test]
async fn concurrent_waiters_share_one_negotiation() {
    let mut server = Server::new_async().await;
    let negotiation = server
        .mock("GET", "/negotiate")
        .with_status(200)
        .with_body(json!({"url": "http://ingest.test/", "config": {"motd": "hi"}}).to_string())
        .expect(1)
        .create_async()
        .await;

    let transport: Arc<dyn IngestTransport> = Arc::new(IngestClient::new(
        build_client(None, Duration::from_secs(5)).expect("failed to build client"),
        Arc::new(ApiKeyFactory::new_from_static_key(API_KEY)),
        "server".to_string(),
        ProtocolVersion::V2,
        None,
    ));
    let negotiator = Arc::new(Negotiator::new(
        transport,
        format!("{}/negotiate", server.url()),
    ));

    let waiters: Vec<_> = (0..5)
        .map(|_| {
            let negotiator = Arc::clone(&negotiator);
            tokio::spawn(async move { negotiator.wait_for_options().await })
        })
        .collect();
    let fetchers: Vec<_> = (0..3)
        .map(|_| {
            let negotiator = Arc::clone(&negotiator);
            tokio::spawn(async move { negotiator.ensure_options().await })
        })
        .collect();

    let mut fetched = Vec::new();
    for fetcher in fetchers {
        fetched.push(fetcher.await.expect("fetcher panicked").expect("fetch failed"));
    }
    for waiter in waiters {
        let options = waiter.await.expect("waiter panicked");
        assert!(Arc::ptr_eq(&options, &fetched[0]));
    }
    assert!(fetched.iter().all(|options| Arc::ptr_eq(options, &fetched[0])));
    assert_eq!(fetched[0].ingest_url, "http://ingest.test/");
    assert_eq!(fetched[0].server_config()["motd"], "hi");
    negotiation.assert_async().await;
}

#[tokio::test]
async fn unauthorized_response_halts_channel_for_good() {
    let mut server = Server::new_async().await;
    let _negotiation = negotiation_mock(&mut server).await;
    let ingest = server
        .mock("POST", "/ingest")
        .with_status(401)
        .expect(1)
        .create_async()
        .await;

    let mut config = config(&server);
    config.intervals = Intervals {
        ingest_noop: Duration::from_millis(50),
        ..Intervals::default()
    };
    let relay = RelayBuilder::new(config)
        .channel(ChannelSpec::direct("analytics"))
        .build()
        .expect("failed to build relay");
    relay
        .send("analytics", Envelope::new("first"))
        .await
        .expect("send failed");

    let mut states = relay.handle("analytics").expect("missing channel").states();
    timeout(
        Duration::from_secs(5),
        states.wait_for(|state| *state == SchedulerState::Stopped),
    )
    .await
    .expect("channel was not halted")
    .expect("scheduler dropped");

    for _ in 0..3 {
        relay
            .send("analytics", Envelope::new("later"))
            .await
            .expect("send failed");
    }
    sleep(Duration::from_millis(100)).await;
    let handle = relay.handle("analytics").expect("missing channel").clone();
    relay.shutdown().await;

    ingest.assert_async().await;
    assert_eq!(handle.buffered(), 4);
}

#[tokio::test]
async fn oversized_envelope_is_rejected_at_send() {
    let mut server = Server::new_async().await;
    let _negotiation = negotiation_mock(&mut server).await;

    let relay = RelayBuilder::new(config(&server))
        .channel(ChannelSpec::direct("analytics"))
        .channel(ChannelSpec::queue_polling("matches", false))
        .build()
        .expect("failed to build relay");
    let huge = Envelope::new("huge").with_payload(json!("x".repeat(10_000)));

    for channel in ["analytics", "matches"] {
        match relay.send(channel, huge.clone()).await {
            Err(RelayError::Envelope(EnvelopeError::PayloadTooLarge { size, max })) => {
                assert!(size > max);
            }
            other => panic!("expected PayloadTooLarge, got {other:?}"),
        }
    }
    assert_eq!(
        relay.handle("analytics").expect("missing channel").buffered(),
        0
    );
    relay.shutdown().await;
}

#[tokio::test]
async fn retried_envelopes_go_out_before_newer_ones() {
    let mut server = Server::new_async().await;
    let _negotiation = negotiation_mock(&mut server).await;
    let retried = json!({
        "retry": [
            {"name": "e1", "timestamp": 1, "tags": {}, "payload": null},
            {"name": "e2", "timestamp": 2, "tags": {}, "payload": null},
        ]
    });
    let first = server
        .mock("POST", "/ingest")
        .match_body(batch(&[("first", 0)]))
        .with_status(200)
        .with_body(retried.to_string())
        .expect(1)
        .create_async()
        .await;
    let second = server
        .mock("POST", "/ingest")
        .match_body(batch(&[("e1", 1), ("e2", 2), ("e3", 3)]))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let mut config = config(&server);
    config.intervals = Intervals {
        ingest: Duration::from_secs(60),
        ..Intervals::default()
    };
    let relay = RelayBuilder::new(config)
        .channel(ChannelSpec::direct("analytics"))
        .build()
        .expect("failed to build relay");
    relay
        .send("analytics", Envelope::new("first").with_timestamp_millis(0))
        .await
        .expect("send failed");

    wait_until_matched(&first).await;
    relay
        .send("analytics", Envelope::new("e3").with_timestamp_millis(3))
        .await
        .expect("send failed");
    relay.shutdown().await;

    first.assert_async().await;
    second.assert_async().await;
}

#[tokio::test]
async fn queue_polling_channel_drains_remote_queue_on_shutdown() {
    let mut server = Server::new_async().await;
    let _negotiation = negotiation_mock(&mut server).await;
    let ingest = server
        .mock("POST", "/ingest")
        .match_body(batch(&[("a", 1), ("b", 2), ("c", 3)]))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let store = MemoryQueueStore::new();
    let producer = RelayBuilder::new(config(&server))
        .queue_backend(Arc::new(store.clone()))
        .channel(ChannelSpec::queue_polling("analytics", false))
        .build()
        .expect("failed to build relay");

    for (name, ts) in [("a", 1), ("b", 2), ("c", 3)] {
        producer
            .send("analytics", Envelope::new(name).with_timestamp_millis(ts))
            .await
            .expect("send failed");
    }
    producer.shutdown().await;

    ingest.assert_async().await;
    assert_eq!(store.len("__relay.remote.analytics"), 0);
}

#[tokio::test]
async fn relays_sharing_a_store_exchange_direct_messages() {
    let mut server = Server::new_async().await;
    let _negotiation = negotiation_mock(&mut server).await;
    let store = MemoryQueueStore::new();

    let sender = RelayBuilder::new(config(&server))
        .queue_backend(Arc::new(store.clone()))
        .channel(ChannelSpec::direct("game"))
        .build()
        .expect("failed to build sender");
    let receiver: Relay = RelayBuilder::new(config(&server))
        .queue_backend(Arc::new(store.clone()))
        .channel(ChannelSpec::direct("game").listening(ListenScope::Direct))
        .build()
        .expect("failed to build receiver");

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    receiver.dispatcher().on("kick", move |message| {
        tx.send(message.envelope.payload.clone())?;
        Ok(())
    });

    sender
        .send_local(
            "game",
            receiver.instance_id(),
            Envelope::new("kick").with_payload(json!({"player": 7})),
        )
        .await
        .expect("send failed");

    let payload = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("message was not delivered")
        .expect("handler dropped");
    assert_eq!(payload, json!({"player": 7}));

    sender.shutdown().await;
    receiver.shutdown().await;
}

#[tokio::test]
async fn duplicate_channels_fail_at_build_time() {
    let server = Server::new_async().await;
    let result = RelayBuilder::new(config(&server))
        .channel(ChannelSpec::direct("analytics"))
        .channel(ChannelSpec::direct("analytics"))
        .build();
    assert!(matches!(result, Err(RelayError::DuplicateChannel(_))));
}

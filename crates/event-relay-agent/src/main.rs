// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use event_relay::{
    config::RelayConfig,
    envelope::{now_millis, Envelope},
    messaging::ListenScope,
    relay::{ChannelSpec, RelayBuilder},
};

#[tokio::main]
pub async fn main() {
    let config = match RelayConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading relay configuration: {e}");
            return;
        }
    };

    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", config.log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .with_writer(std::io::stderr)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    if config.api_key.is_none() {
        error!("RELAY_API_KEY is not set. Shutting down relay agent.");
        return;
    }

    let channel = config.channel.clone();
    let relay = match RelayBuilder::new(config)
        .channel(
            ChannelSpec::direct(channel.clone())
                .listening(ListenScope::Direct)
                .listening(ListenScope::Global),
        )
        .build()
    {
        Ok(relay) => relay,
        Err(e) => {
            error!("Error starting relay: {e}");
            return;
        }
    };

    relay.dispatcher().on_any(|message| {
        info!(
            "Inbound {} message '{}': {}",
            message.source,
            message.kind(),
            message.envelope.payload
        );
        Ok(())
    });

    info!(
        "Relay agent {} started, reading envelopes from stdin",
        relay.instance_id()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received interrupt");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Envelope>(&line) {
                        Ok(mut envelope) => {
                            if envelope.timestamp == 0 {
                                envelope.timestamp = now_millis();
                            }
                            if let Err(e) = relay.send(&channel, envelope).await {
                                warn!("Envelope rejected: {e}");
                            }
                        }
                        Err(e) => warn!("Skipping malformed envelope: {e}"),
                    }
                }
                Ok(None) => {
                    debug!("End of input");
                    break;
                }
                Err(e) => {
                    error!("Error reading stdin: {e}");
                    break;
                }
            },
        }
    }

    relay.shutdown().await;
    info!("Relay agent stopped");
}

//! Events relay
//!
//! Receives CloudEvents from NATS, logs them with their trace context and
//! optionally emits heartbeat events on the same binding.

mod config;
mod handler;

use cloudevents_nats::{
    init_metrics, CancellationToken, Client, Context, Event, EventMetrics, Observability,
    Protocol, Telemetry,
};
use config::Config;
use eyre::{Result, WrapErr};
use handler::LogHandler;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_tracing(is_production: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if is_production {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().pretty())
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().wrap_err("Failed to load configuration")?;
    init_tracing(config.is_production);

    info!(
        service = %config.service_name,
        url = %config.protocol.url,
        subject = %config.protocol.subject,
        "Starting events relay"
    );

    let metrics = init_metrics().wrap_err("Failed to initialize metrics")?;

    let provider = SdkTracerProvider::builder().build();
    let telemetry = Telemetry::new(provider.tracer(config.service_name.clone()));

    let protocol = Protocol::connect(&config.protocol, telemetry.clone())
        .await
        .wrap_err("Failed to connect to NATS")?;
    let observability = Observability::new(telemetry)
        .with_metrics(EventMetrics::new(config.protocol.subject.clone()));
    let client = Arc::new(
        Client::new(protocol, observability).with_concurrency(config.protocol.receiver_concurrency),
    );

    let cancel = CancellationToken::new();
    let receiver = tokio::spawn({
        let client = client.clone();
        let cancel = cancel.clone();
        async move {
            client
                .start_receiver(&Context::new(), &cancel, LogHandler)
                .await
        }
    });

    if let Some(interval) = config.heartbeat_interval {
        tokio::spawn({
            let client = client.clone();
            let cancel = cancel.clone();
            let source = config.service_name.clone();
            async move { heartbeat(&client, &cancel, &source, interval).await }
        });
    }

    tokio::signal::ctrl_c()
        .await
        .wrap_err("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    cancel.cancel();
    match receiver.await.wrap_err("Receiver task panicked")? {
        Ok(()) => info!("Receiver drained"),
        Err(e) => error!(error = %e, "Receiver ended with an error"),
    }

    client.close().await.wrap_err("Failed to close client")?;
    debug!(metrics = %metrics.render(), "Final metrics snapshot");

    if let Err(e) = provider.shutdown() {
        warn!(error = %e, "Failed to shut down tracer provider");
    }

    info!("Events relay stopped");
    Ok(())
}

/// Send a heartbeat event every `interval` until `cancel` fires.
async fn heartbeat(client: &Client, cancel: &CancellationToken, source: &str, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    let mut sequence: u64 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        sequence += 1;
        let event = match Event::new("dev.zerg.relay.heartbeat", source).with_json_data(
            &serde_json::json!({
                "sequence": sequence,
                "at": chrono::Utc::now().to_rfc3339(),
            }),
        ) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Failed to build heartbeat event");
                continue;
            }
        };

        match client.send(&Context::new(), event).await {
            Ok(()) => debug!(sequence, "Heartbeat sent"),
            Err(e) => warn!(sequence, error = %e, "Failed to send heartbeat"),
        }
    }
}

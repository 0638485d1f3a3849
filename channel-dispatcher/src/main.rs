//! Dispatch the records of a Kafka channel to its subscribers.
use std::sync::Arc;

use anyhow::{Context, Result};
use envconfig::Envconfig;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use channel_dispatcher::config::Config;
use channel_dispatcher::forwarder::HttpForwarder;
use channel_dispatcher::kafka::KafkaConsumerGroupFactory;
use channel_dispatcher::metrics::{serve, setup_metrics_recorder, setup_metrics_router};
use channel_dispatcher::settings::{ClientSettings, SettingsOverlay};
use channel_dispatcher::{Dispatcher, DispatcherConfig, KafkaDispatcher, SubscriberSpec};

fn start_server(config: &Config) -> Result<JoinHandle<()>> {
    let recorder_handle =
        setup_metrics_recorder().context("failed to install metrics recorder")?;
    let bind = config.bind();

    Ok(tokio::task::spawn(async move {
        let router = setup_metrics_router(recorder_handle);
        if let Err(e) = serve(router, &bind).await {
            error!("failed to serve metrics on {}: {}", bind, e);
        }
    }))
}

/// Resolves once SIGTERM or SIGINT is received.
async fn shutdown_signal() -> std::io::Result<()> {
    let mut term = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    }
    Ok(())
}

async fn read_overlay(path: &str) -> Result<(String, SettingsOverlay)> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read settings overlay {path}"))?;
    let overlay = SettingsOverlay::from_json(&content)
        .with_context(|| format!("invalid settings overlay in {path}"))?;
    Ok((content, overlay))
}

async fn read_subscribers(path: &str) -> Result<Vec<SubscriberSpec>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read subscribers {path}"))?;
    serde_json::from_str(&content).with_context(|| format!("invalid subscribers in {path}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::init_from_env().context("invalid configuration")?;
    info!(
        channel_key = config.channel_key.as_str(),
        topic = config.kafka_topic.as_str(),
        "starting kafka channel dispatcher"
    );

    let server_handle = start_server(&config)?;

    let (mut overlay_content, overlay) = match &config.settings_overlay_path {
        Some(path) => {
            let (content, overlay) = read_overlay(path).await?;
            (Some(content), overlay)
        }
        None => (None, SettingsOverlay::default()),
    };
    let settings = ClientSettings::merge(None, &overlay)
        .context("invalid consumer settings")?
        .with_identity(
            &config.kafka_client_id,
            config.kafka_username.as_deref(),
            config.kafka_password.as_deref(),
        );

    let retry_policy = config.retry_policy.provide();
    let forwarder = HttpForwarder::new(config.request_timeout.0, retry_policy)
        .context("failed to build http forwarder")?;

    let mut dispatcher = KafkaDispatcher::new(DispatcherConfig {
        client_id: config.kafka_client_id.clone(),
        brokers: config.kafka_brokers.0.clone(),
        topic: config.kafka_topic.as_str().to_owned(),
        username: config.kafka_username.clone(),
        password: config.kafka_password.clone(),
        channel_key: config.channel_key.as_str().to_owned(),
        settings,
        forwarder: Arc::new(forwarder),
        redelivery_policy: retry_policy,
        group_factory: Arc::new(KafkaConsumerGroupFactory),
    });

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut ticker = tokio::time::interval(config.watch_interval.0);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                result.context("failed to listen for shutdown signals")?;
                break;
            }
            _ = ticker.tick() => {}
        }

        if let Some(path) = &config.settings_overlay_path {
            match read_overlay(path).await {
                Ok((content, overlay)) if overlay_content.as_ref() != Some(&content) => {
                    if let Some(replacement) = dispatcher.config_changed(&overlay) {
                        dispatcher = replacement;
                    }
                    overlay_content = Some(content);
                }
                Ok(_) => {}
                Err(e) => warn!("ignoring settings overlay: {:#}", e),
            }
        }

        match read_subscribers(&config.subscribers_path).await {
            Ok(specs) => {
                let failed = dispatcher.update_subscriptions(&specs);
                for (spec, e) in &failed {
                    warn!(uid = %spec.uid, "failed to subscribe: {}", e);
                }
            }
            Err(e) => warn!("ignoring subscribers: {:#}", e),
        }
    }

    info!("shutting down kafka channel dispatcher");
    dispatcher.shutdown();
    server_handle.abort();

    Ok(())
}

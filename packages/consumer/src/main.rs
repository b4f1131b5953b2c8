//! Indexer consumer entry point.
//!
//! Drains the event queue into the document store until SIGINT/SIGTERM.

use std::sync::Arc;

use anyhow::{Context, Result};
use indexer_consumer::config::{Config, StoreBackend};
use indexer_consumer::consumer::{shutdown_requested, unless_shutdown, ConsumerLoop, ConsumerStats};
use indexer_consumer::queue::AmqpBroker;
use indexer_consumer::sink::{MongoSink, RedisSink, Sink};
use indexer_consumer::transform::MessageTransformer;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_LOG_FILTER: &str = "indexer_consumer=info";

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = Config::from_env().context("Invalid configuration")?;
    info!(
        queue = %config.amqp.queue,
        backend = config.store.backend.as_str(),
        workers = config.workers,
        precision = config.precision.as_str(),
        "Starting indexer consumer"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn({
        let shutdown_tx = shutdown_tx.clone();
        async move {
            shutdown_signal().await;
            let _ = shutdown_tx.send(true);
        }
    });

    let Some(sink) = unless_shutdown(connect_sink(&config), &shutdown_rx).await.transpose()? else {
        info!("Shutdown requested during startup");
        return Ok(());
    };
    let Some(broker) = unless_shutdown(AmqpBroker::connect(config.amqp.clone(), &config.retry), &shutdown_rx)
        .await
        .transpose()
        .context("Failed to connect to AMQP broker")?
    else {
        info!("Shutdown requested during startup");
        return Ok(());
    };

    let transformer = MessageTransformer::new(config.precision);
    let mut workers = JoinSet::new();

    for worker in 0..config.workers {
        let source = broker
            .subscribe(worker)
            .await
            .with_context(|| format!("Failed to subscribe worker {}", worker))?;
        let mut consumer = ConsumerLoop::new(source, sink.clone(), transformer)
            .with_persist_timeout(config.persist_timeout())
            .with_worker(worker);
        let stop = shutdown_requested(shutdown_rx.clone());

        workers.spawn(async move {
            let result = consumer.run(stop).await;
            (worker, result)
        });
    }

    let mut totals = ConsumerStats::default();
    let mut failed = false;

    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok((worker, Ok(stats))) => {
                info!(worker, received = stats.received, persisted = stats.persisted, "Worker stopped");
                totals.merge(&stats);
            }
            Ok((worker, Err(e))) => {
                error!(worker, error = %e, "Worker failed, stopping remaining workers");
                failed = true;
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                error!(error = %e, "Worker task panicked");
                failed = true;
                let _ = shutdown_tx.send(true);
            }
        }
    }

    if let Err(e) = broker.close().await {
        warn!(error = %e, "Failed to close AMQP connection cleanly");
    }

    info!(
        received = totals.received,
        persisted = totals.persisted,
        undecodable = totals.undecodable,
        malformed = totals.malformed,
        persist_failed = totals.persist_failed,
        "Indexer consumer stopped"
    );

    if failed {
        anyhow::bail!("Consumer stopped after a broker failure");
    }
    Ok(())
}

/// Connect the configured store, retrying with backoff
async fn connect_sink(config: &Config) -> Result<Arc<dyn Sink>> {
    let store = &config.store;
    let sink: Arc<dyn Sink> = match store.backend {
        StoreBackend::Mongo => Arc::new(
            config
                .retry
                .retry("MongoDB", || MongoSink::connect(&store.url, &store.database, &store.collection))
                .await
                .context("Failed to connect to MongoDB")?,
        ),
        StoreBackend::Redis => Arc::new(
            config
                .retry
                .retry("Redis", || RedisSink::connect(&store.url, &store.database, &store.collection))
                .await
                .context("Failed to connect to Redis")?,
        ),
    };
    Ok(sink)
}

/// `RUST_LOG` filter, plain text unless `LOG_FORMAT=json`
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let json = std::env::var("LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Received shutdown signal, finishing in-flight messages");
}

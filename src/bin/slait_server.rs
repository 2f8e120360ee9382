use slait::{cache::Cache, config::CacheConfig, router::Router};
use std::{error::Error, sync::Arc};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, info_span, warn, Instrument};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Logs every event passing through the router until the router is dropped.
async fn log_router_events(router: Arc<Router>) {
    let mut publications = router.pull();
    let mut additions = router.pull_additions();
    let mut removals = router.pull_removals();

    drop(router);

    loop {
        tokio::select! {
            publication = publications.recv() => match publication {
                Ok(publication) => debug!(
                    topic = %publication.topic,
                    partition = %publication.partition,
                    entries = publication.entries.len(),
                    "publication"
                ),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "publications lagging"),
                Err(RecvError::Closed) => break,
            },
            addition = additions.recv() => match addition {
                Ok(addition) => info!(topic = %addition.topic, partition = ?addition.partition, "addition"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "additions lagging"),
                Err(RecvError::Closed) => break,
            },
            removal = removals.recv() => match removal {
                Ok(removal) => info!(topic = %removal.topic, partition = ?removal.partition, "removal"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "removals lagging"),
                Err(RecvError::Closed) => break,
            },
        }
    }
}

#[cfg(not(tarpaulin_include))]
#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();

    let config = CacheConfig::from_env()?;

    info!(
        data_dir = %config.data_dir.display(),
        max_segment_bytes = config.log.max_segment_bytes,
        event_buffer = config.event_buffer,
        trim_interval = ?config.trim_interval,
        "starting slait"
    );

    let (signal_tx, mut signal_rx) = tokio::sync::mpsc::channel::<()>(1);

    ctrlc_async::set_async_handler(
        async move {
            info!("Received CTRL+C.");

            if signal_tx.send(()).await.is_err() {
                error!("unable to send on signal channel");
            }
        }
        .instrument(info_span!("ctrlc_async_handler")),
    )?;

    let router = Arc::new(Router::new(config.event_buffer));
    let cache = Arc::new(Cache::new(&config, router.clone()).await?);

    let router_logger = tokio::spawn(
        log_router_events(router).instrument(info_span!("router_event_logger")),
    );

    cache.fill().await?;

    info!(catalog = ?cache.catalog().await, "cache ready");

    let trimmer = cache.spawn_trimmer(config.trim_interval);

    signal_rx.recv().await;

    trimmer.abort();

    if let Err(error) = cache.close().await {
        error!("unable to close cache: {}", error);
    }

    drop(cache);

    if let Err(error) = router_logger.await {
        error!("router event logger failed: {}", error);
    }

    info!("Exiting...");

    Ok(())
}

use anyhow::Context;
use reelindex::api::{self, AppState};
use reelindex::broker;
use reelindex::config::{Config, SearchStoreKind};
use reelindex::embedding::EmbeddingEngine;
use reelindex::ingest::{JobProcessor, WorkerPool};
use reelindex::metrics::IngestMetrics;
use reelindex::search::{ElasticsearchClient, IndexingClient, MemoryStore, SearchQueries};
use reelindex::{logging, status};
use std::sync::Arc;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;
    let _log_guard = logging::init_tracing("reelindex");

    let SearchStore {
        indexer,
        search,
        elasticsearch,
    } = build_search_store(&config)?;
    let engine = Arc::new(
        EmbeddingEngine::from_config(&config).context("Failed to initialize embedding engine")?,
    );
    let status_channel = status::connect(&config)
        .await
        .context("Failed to connect to status channel")?;
    let metrics = Arc::new(IngestMetrics::new());
    let broker = broker::connect(&config, elasticsearch)
        .await
        .context("Failed to connect to job broker")?;

    let processor = Arc::new(JobProcessor::new(
        engine.clone(),
        indexer,
        status_channel,
        metrics.clone(),
    ));
    let pool = WorkerPool::new(broker.clone(), processor, config.worker_count).start();

    let state = AppState::new(
        broker.clone(),
        search,
        engine,
        metrics,
        config.ingest_source_file.clone(),
    );
    let app = api::create_router(Arc::new(state));

    let (listener, port) = bind_listener(config.server_port)
        .await
        .context("Failed to bind listener")?;
    tracing::info!("Listening on http://0.0.0.0:{}", port);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    broker.close().await;
    pool.shutdown().await;
    Ok(())
}

struct SearchStore {
    indexer: Arc<dyn IndexingClient>,
    search: Arc<dyn SearchQueries>,
    // Also backs durable job results when present.
    elasticsearch: Option<Arc<ElasticsearchClient>>,
}

fn build_search_store(config: &Config) -> anyhow::Result<SearchStore> {
    match config.search_store {
        SearchStoreKind::Elasticsearch => {
            let client = Arc::new(
                ElasticsearchClient::from_config(config)
                    .context("Failed to configure Elasticsearch client")?,
            );
            Ok(SearchStore {
                indexer: client.clone(),
                search: client.clone(),
                elasticsearch: Some(client),
            })
        }
        SearchStoreKind::Memory => {
            tracing::warn!("Using in-memory search store; documents are lost on restart");
            let store = Arc::new(MemoryStore::new());
            Ok(SearchStore {
                indexer: store.clone(),
                search: store,
                elasticsearch: None,
            })
        }
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Received shutdown signal");
}

async fn bind_listener(configured: Option<u16>) -> Result<(TcpListener, u16), std::io::Error> {
    use std::net::Ipv4Addr;

    if let Some(port) = configured {
        return TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
            .await
            .map(|listener| (listener, port));
    }

    const PORT_RANGE: std::ops::RangeInclusive<u16> = 5000..=5099;
    for port in PORT_RANGE {
        match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await {
            Ok(listener) => {
                tracing::debug!(port, "Bound server port");
                return Ok((listener, port));
            }
            Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
                tracing::debug!(port, "Port already in use; trying next");
                continue;
            }
            Err(err) => return Err(err),
        }
    }

    Err(std::io::Error::new(
        std::io::ErrorKind::AddrNotAvailable,
        "No available port found in range 5000-5099",
    ))
}

use crate::{
    cache::StreamingCache,
    config::{Config, LogStoreType},
    coordinator::IngestionCoordinator,
    lock::{DistributedLock, MemoryLock},
    metrics,
    producer::{FfmpegProducer, HttpSourceProducer, Producer},
    store::{LogStore, MemoryLogStore},
};
use metrics_exporter_prometheus::PrometheusHandle;
use reqwest::Client;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// How often the in-memory store drops logs whose retention has run out.
const EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<Config>,
    /// Single-flight ingestion over the streaming cache
    pub coordinator: IngestionCoordinator,
    /// Process start, reported by the health endpoint
    pub started_at: Instant,
    /// Prometheus handle, when metrics are enabled
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    /// Create a new AppState with the given configuration
    ///
    /// Falls back to the in-memory store and lock if Valkey is requested but
    /// cannot be reached.
    pub async fn new(config: Config) -> Self {
        let http_client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .build()
            .unwrap_or_else(|e| {
                warn!("Failed to configure HTTP client ({}); using defaults", e);
                Client::new()
            });

        let (store, lock) = build_backends(&config).await;
        let cache = StreamingCache::new(store, config.cache_config());

        let source = HttpSourceProducer::new(http_client, config.source_url.clone());
        let producer: Arc<dyn Producer> = if config.transcode {
            info!(
                "Transcoding sources with {} to {} @ {}",
                config.ffmpeg_path, config.audio_format, config.audio_bitrate
            );
            Arc::new(FfmpegProducer::new(Arc::new(source), &config.ffmpeg_path))
        } else {
            info!("Serving sources as fetched (transcoding disabled)");
            Arc::new(source)
        };

        let coordinator =
            IngestionCoordinator::new(cache, lock, producer, config.produce_options());
        let metrics = if config.metrics_enabled {
            metrics::install()
        } else {
            None
        };

        Self::with_coordinator(config, coordinator, metrics)
    }

    /// Assemble state around an existing coordinator.
    pub fn with_coordinator(
        config: Config,
        coordinator: IngestionCoordinator,
        metrics: Option<PrometheusHandle>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            coordinator,
            started_at: Instant::now(),
            metrics,
        }
    }
}

type Backends = (Arc<dyn LogStore>, Arc<dyn DistributedLock>);

fn memory_backends(config: &Config) -> Backends {
    let store = MemoryLogStore::new();
    store.spawn_sweeper(EXPIRY_SWEEP_INTERVAL);
    (
        Arc::new(store),
        Arc::new(MemoryLock::new(config.lock_config())),
    )
}

#[cfg(feature = "valkey")]
async fn build_backends(config: &Config) -> Backends {
    use crate::lock::ValkeyLock;
    use crate::store::ValkeyLogStore;

    if config.log_store != LogStoreType::Valkey {
        info!("Using in-memory log store");
        return memory_backends(config);
    }
    let Some(url) = config.valkey_url.as_deref() else {
        warn!("LOG_STORE=valkey but VALKEY_URL is not set; using in-memory log store");
        return memory_backends(config);
    };

    let store = match ValkeyLogStore::connect(url).await {
        Ok(store) => store,
        Err(e) => {
            warn!("Valkey log store unavailable ({}); using in-memory log store", e);
            return memory_backends(config);
        }
    };
    match ValkeyLock::connect(url, config.lock_config()).await {
        Ok(lock) => {
            info!("Using Valkey log store and lock at {}", url);
            (Arc::new(store), Arc::new(lock))
        }
        Err(e) => {
            warn!("Valkey lock unavailable ({}); using in-memory log store", e);
            memory_backends(config)
        }
    }
}

#[cfg(not(feature = "valkey"))]
async fn build_backends(config: &Config) -> Backends {
    if config.log_store == LogStoreType::Valkey {
        warn!("LOG_STORE=valkey requires the `valkey` feature; using in-memory log store");
    } else {
        info!("Using in-memory log store");
    }
    memory_backends(config)
}

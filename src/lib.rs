pub mod cache;
pub mod candidates;
pub mod config;
mod db;
pub mod errors;
pub mod executor;
mod health;
pub mod model;
pub mod providers;
pub mod resolver;

use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cache::CacheStore;
use crate::candidates::CandidateGenerator;
use crate::config::AppConfig;
use crate::errors::AppResult;
use crate::providers::GeocodeClient;
use crate::resolver::{EventSink, GeocodeResolver, RunHandle};

pub use crate::errors::AppError;
pub use crate::health::ServiceHealth;
pub use crate::model::{AddressableEntity, Coordinates, GeocodeHit, ProviderSource, RunToken};
pub use crate::resolver::{HitOrigin, ResolutionEvent, RunOutcome, RunSummary};

/// Process-wide entry point: owns the cache, the provider chain and the run registry.
pub struct GeocoderService {
    resolver: Arc<GeocodeResolver>,
    config: AppConfig,
}

impl GeocoderService {
    pub fn initialize(config: AppConfig) -> AppResult<Self> {
        init_tracing();
        config.validate()?;
        let cache = CacheStore::open(&config.data_dir, &config.cache_file_name, config.cache_ttl())?;
        if cache.recovered() {
            warn!(
                path = ?cache.path(),
                "geocode cache was unreadable and has been recreated empty"
            );
        }
        let client = GeocodeClient::from_config(&config)?;
        let service = Self::with_parts(config, cache, client);
        info!(
            providers = service.resolver.client_provider_count(),
            max_concurrency = service.config.max_concurrency,
            "geocoder service ready"
        );
        Ok(service)
    }

    pub fn with_parts(config: AppConfig, cache: CacheStore, client: GeocodeClient) -> Self {
        let resolver = GeocodeResolver::new(
            cache,
            Arc::new(client),
            CandidateGenerator::new(config.default_country.clone()),
            config.max_concurrency,
        );
        Self {
            resolver: Arc::new(resolver),
            config,
        }
    }

    /// Starts resolving `entities`, superseding any in-flight run. Must be called
    /// from within a tokio runtime.
    pub fn submit_batch(&self, entities: Vec<AddressableEntity>, sink: EventSink) -> RunHandle {
        self.resolver.submit_batch(entities, sink)
    }

    pub fn refresh_current_batch(&self) -> Option<RunHandle> {
        self.resolver.refresh_current_batch()
    }

    pub fn clear_cache(&self) -> AppResult<()> {
        self.resolver.clear_cache()
    }

    pub fn health(&self) -> AppResult<ServiceHealth> {
        let cache = self.resolver.cache();
        Ok(ServiceHealth::new(
            cache.path().map(|path| path.to_string_lossy().to_string()),
            cache.recovered(),
            cache.stats()?,
            self.resolver.client_provider_count(),
            self.resolver.current_token(),
            self.config.public_profile(),
        ))
    }
}

fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,shelter_geocoder=debug"));
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init();
    });
}

use serde::Serialize;

use crate::cache::CacheStats;
use crate::config::PublicAppConfig;
use crate::model::RunToken;

#[derive(Debug, Serialize)]
pub struct ServiceHealth {
    pub cache_path: Option<String>,
    pub cache_recovered: bool,
    pub cache_stats: CacheStats,
    pub provider_count: usize,
    pub current_run: RunToken,
    pub config: PublicAppConfig,
}

impl ServiceHealth {
    pub fn new(
        cache_path: Option<String>,
        cache_recovered: bool,
        cache_stats: CacheStats,
        provider_count: usize,
        current_run: RunToken,
        config: PublicAppConfig,
    ) -> Self {
        Self {
            cache_path,
            cache_recovered,
            cache_stats,
            provider_count,
            current_run,
            config,
        }
    }
}

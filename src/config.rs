use std::path::PathBuf;
use std::time::Duration;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

use crate::errors::{AppError, AppResult};

const DEFAULT_CACHE_TTL_DAYS: u32 = 30;
const DEFAULT_MAX_CONCURRENCY: usize = 48;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 8_000;
const DEFAULT_PROVIDER_MAX_ATTEMPTS: u32 = 2;
const MAX_PROVIDER_ATTEMPTS: u32 = 5;
const DEFAULT_PRIMARY_ENDPOINT: &str = "https://nominatim.openstreetmap.org/search";
const DEFAULT_USER_AGENT: &str = concat!("shelter-geocoder/", env!("CARGO_PKG_VERSION"));

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub cache_file_name: String,
    pub cache_ttl_days: u32,
    pub max_concurrency: usize,
    pub request_timeout_ms: u64,
    pub provider_max_attempts: u32,
    pub default_country: String,
    pub primary_endpoint: String,
    pub secondary_endpoint: Option<String>,
    pub secondary_api_key: Option<SecretString>,
    pub user_agent: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub data_dir: String,
    pub cache_file_name: String,
    pub cache_ttl_days: u32,
    pub max_concurrency: usize,
    pub request_timeout_ms: u64,
    pub provider_max_attempts: u32,
    pub default_country: String,
    pub primary_endpoint: String,
    pub secondary_endpoint: Option<String>,
    pub has_secondary_api_key: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self {
            data_dir: env::var("GEOCODER_DATA_DIR")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".shelter-geocoder")),
            cache_file_name: env::var("GEOCODER_CACHE_FILE")
                .unwrap_or_else(|_| "geocode-cache.db".to_string()),
            cache_ttl_days: parse_u32("GEOCODER_CACHE_TTL_DAYS", DEFAULT_CACHE_TTL_DAYS).max(1),
            max_concurrency: parse_usize("GEOCODER_MAX_CONCURRENCY", DEFAULT_MAX_CONCURRENCY)
                .max(1),
            request_timeout_ms: parse_u64(
                "GEOCODER_REQUEST_TIMEOUT_MS",
                DEFAULT_REQUEST_TIMEOUT_MS,
            ),
            provider_max_attempts: parse_u32(
                "GEOCODER_PROVIDER_MAX_ATTEMPTS",
                DEFAULT_PROVIDER_MAX_ATTEMPTS,
            )
            .clamp(1, MAX_PROVIDER_ATTEMPTS),
            default_country: env::var("GEOCODER_DEFAULT_COUNTRY")
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| "USA".to_string()),
            primary_endpoint: env::var("GEOCODER_PRIMARY_ENDPOINT")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_PRIMARY_ENDPOINT.to_string()),
            secondary_endpoint: env::var("GEOCODER_SECONDARY_ENDPOINT")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            secondary_api_key: env::var("GEOCODER_SECONDARY_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(SecretString::from),
            user_agent: env::var("GEOCODER_USER_AGENT")
                .unwrap_or_else(|_| DEFAULT_USER_AGENT.to_string()),
        }
    }

    pub fn cache_ttl(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.cache_ttl_days))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            data_dir: self.data_dir.to_string_lossy().to_string(),
            cache_file_name: self.cache_file_name.clone(),
            cache_ttl_days: self.cache_ttl_days,
            max_concurrency: self.max_concurrency,
            request_timeout_ms: self.request_timeout_ms,
            provider_max_attempts: self.provider_max_attempts,
            default_country: self.default_country.clone(),
            primary_endpoint: self.primary_endpoint.clone(),
            secondary_endpoint: self.secondary_endpoint.clone(),
            has_secondary_api_key: self.secondary_api_key.is_some(),
        }
    }

    /// Rejects settings the provider chain cannot work with.
    pub fn validate(&self) -> AppResult<()> {
        check_endpoint("GEOCODER_PRIMARY_ENDPOINT", &self.primary_endpoint)?;
        if let Some(endpoint) = &self.secondary_endpoint {
            check_endpoint("GEOCODER_SECONDARY_ENDPOINT", endpoint)?;
        }
        if self.default_country.trim().is_empty() {
            return Err(AppError::Config(
                "GEOCODER_DEFAULT_COUNTRY cannot be empty".into(),
            ));
        }
        if self.cache_file_name.trim().is_empty() {
            return Err(AppError::Config("GEOCODER_CACHE_FILE cannot be empty".into()));
        }
        Ok(())
    }
}

fn check_endpoint(key: &str, endpoint: &str) -> AppResult<()> {
    let endpoint = endpoint.trim();
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        Ok(())
    } else {
        Err(AppError::Config(format!(
            "{key} must be an http(s) URL, got {endpoint:?}"
        )))
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_public_profile_without_secrets() {
        env::set_var("GEOCODER_SECONDARY_API_KEY", "secret");
        env::set_var("GEOCODER_SECONDARY_ENDPOINT", "https://proxy.example/geocode");
        env::set_var("GEOCODER_CACHE_FILE", "custom.db");
        env::set_var("GEOCODER_MAX_CONCURRENCY", "0");
        env::set_var("GEOCODER_PROVIDER_MAX_ATTEMPTS", "99");

        let config = AppConfig::from_env();
        let public = config.public_profile();

        assert_eq!(public.cache_file_name, "custom.db");
        assert_eq!(public.max_concurrency, 1);
        assert_eq!(public.provider_max_attempts, MAX_PROVIDER_ATTEMPTS);
        assert!(public.has_secondary_api_key);
        assert!(config.secondary_api_key.is_some());
        assert_eq!(
            public.secondary_endpoint.as_deref(),
            Some("https://proxy.example/geocode")
        );
        assert_eq!(public.cache_ttl_days, DEFAULT_CACHE_TTL_DAYS);
        assert_eq!(config.cache_ttl(), chrono::Duration::days(30));

        let serialized = serde_json::to_string(&public).unwrap();
        assert!(!serialized.contains("secret\""));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_non_http_endpoints_and_blank_country() {
        let mut config = AppConfig {
            data_dir: PathBuf::from("/tmp/geocoder"),
            cache_file_name: "geocode-cache.db".into(),
            cache_ttl_days: 30,
            max_concurrency: 4,
            request_timeout_ms: 1_000,
            provider_max_attempts: 2,
            default_country: "USA".into(),
            primary_endpoint: "nominatim.local/search".into(),
            secondary_endpoint: None,
            secondary_api_key: None,
            user_agent: "test".into(),
        };
        assert!(matches!(config.validate(), Err(AppError::Config(msg)) if msg.contains("PRIMARY")));

        config.primary_endpoint = DEFAULT_PRIMARY_ENDPOINT.into();
        config.secondary_endpoint = Some("ftp://proxy".into());
        assert!(config.validate().is_err());

        config.secondary_endpoint = None;
        config.default_country = "  ".into();
        assert!(matches!(config.validate(), Err(AppError::Config(msg)) if msg.contains("COUNTRY")));
    }
}

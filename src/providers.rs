use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::model::{Coordinates, GeocodeHit, ProviderSource};

const BASE_BACKOFF_MS: u64 = 250;

#[async_trait]
pub trait GeocodeProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn source(&self) -> ProviderSource;

    /// `Ok(None)` means the provider answered but found nothing.
    async fn geocode(&self, query: &str) -> AppResult<Option<Coordinates>>;
}

enum ProviderAttempt {
    Hit(Coordinates),
    Miss,
    Cancelled,
}

/// Ordered provider chain; the first valid hit wins.
pub struct GeocodeClient {
    providers: Vec<Arc<dyn GeocodeProvider>>,
    request_timeout: Duration,
    max_attempts: u32,
    jitter_rng: Mutex<StdRng>,
}

impl GeocodeClient {
    pub fn new(
        providers: Vec<Arc<dyn GeocodeProvider>>,
        request_timeout: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            providers,
            request_timeout,
            max_attempts: max_attempts.max(1),
            jitter_rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn from_config(config: &AppConfig) -> AppResult<Self> {
        let primary: Arc<dyn GeocodeProvider> = Arc::new(NominatimProvider::new(
            config.primary_endpoint.clone(),
            &config.user_agent,
            config.request_timeout(),
        )?);
        let mut providers = vec![primary];
        if let Some(endpoint) = &config.secondary_endpoint {
            providers.push(Arc::new(ProxyProvider::new(
                endpoint.clone(),
                config.secondary_api_key.clone(),
                &config.user_agent,
                config.request_timeout(),
            )?));
        }
        Ok(Self::new(
            providers,
            config.request_timeout(),
            config.provider_max_attempts,
        ))
    }

    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    pub async fn resolve(&self, query: &str, cancel: &CancellationToken) -> Option<GeocodeHit> {
        for provider in &self.providers {
            if cancel.is_cancelled() {
                return None;
            }
            match self.call_provider(provider.as_ref(), query, cancel).await {
                ProviderAttempt::Hit(coordinates) => {
                    trace!(provider = provider.name(), query, "geocode hit");
                    return Some(GeocodeHit::new(coordinates, query, provider.source()));
                }
                ProviderAttempt::Miss => continue,
                ProviderAttempt::Cancelled => return None,
            }
        }
        None
    }

    async fn call_provider(
        &self,
        provider: &dyn GeocodeProvider,
        query: &str,
        cancel: &CancellationToken,
    ) -> ProviderAttempt {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return ProviderAttempt::Cancelled,
                result = timeout(self.request_timeout, provider.geocode(query)) => result,
            };

            match outcome {
                Ok(Ok(Some(coordinates))) if coordinates.is_valid() => {
                    return ProviderAttempt::Hit(coordinates);
                }
                Ok(Ok(Some(coordinates))) => {
                    warn!(
                        provider = provider.name(),
                        query,
                        latitude = coordinates.latitude,
                        longitude = coordinates.longitude,
                        "provider returned out-of-range coordinates"
                    );
                    return ProviderAttempt::Miss;
                }
                Ok(Ok(None)) => {
                    debug!(provider = provider.name(), query, "provider found no match");
                    return ProviderAttempt::Miss;
                }
                Ok(Err(err @ AppError::RateLimited { .. })) if attempt < self.max_attempts => {
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        ?err,
                        attempt,
                        provider = provider.name(),
                        "geocode request throttled; retrying after {:?}",
                        delay
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return ProviderAttempt::Cancelled,
                        _ = sleep(delay) => {}
                    }
                }
                Ok(Err(err)) => {
                    warn!(?err, provider = provider.name(), query, "provider lookup failed");
                    return ProviderAttempt::Miss;
                }
                Err(_) => {
                    warn!(
                        provider = provider.name(),
                        query,
                        timeout_ms = self.request_timeout.as_millis() as u64,
                        "provider lookup timed out"
                    );
                    return ProviderAttempt::Miss;
                }
            }
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = (attempt - 1).min(6);
        let base = Duration::from_millis(BASE_BACKOFF_MS * (1 << exponent));
        let jitter = {
            let mut rng = self.jitter_rng.lock();
            Duration::from_millis(rng.gen_range(0..BASE_BACKOFF_MS))
        };
        base + jitter
    }
}

fn build_http(user_agent: &str, request_timeout: Duration) -> AppResult<Client> {
    Ok(Client::builder()
        .user_agent(user_agent)
        .timeout(request_timeout)
        .build()?)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrText {
    Number(f64),
    Text(String),
}

impl NumberOrText {
    fn parse(&self, provider: &'static str, field: &str) -> AppResult<f64> {
        match self {
            NumberOrText::Number(value) => Ok(*value),
            NumberOrText::Text(text) => text.trim().parse::<f64>().map_err(|_| AppError::Provider {
                provider,
                message: format!("{field} is not numeric: {text}"),
            }),
        }
    }
}

/// Public OpenStreetMap search endpoint.
pub struct NominatimProvider {
    http: Client,
    endpoint: String,
}

impl NominatimProvider {
    pub fn new(endpoint: String, user_agent: &str, request_timeout: Duration) -> AppResult<Self> {
        Ok(Self {
            http: build_http(user_agent, request_timeout)?,
            endpoint,
        })
    }
}

#[async_trait]
impl GeocodeProvider for NominatimProvider {
    fn name(&self) -> &'static str {
        "nominatim"
    }

    fn source(&self) -> ProviderSource {
        ProviderSource::Primary
    }

    async fn geocode(&self, query: &str) -> AppResult<Option<Coordinates>> {
        #[derive(Deserialize)]
        struct Place {
            lat: NumberOrText,
            lon: NumberOrText,
        }

        let response = self
            .http
            .get(&self.endpoint)
            .query(&[("format", "jsonv2"), ("limit", "1"), ("q", query)])
            .send()
            .await?;
        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            return Err(AppError::RateLimited {
                provider: self.name(),
            });
        }

        let places: Vec<Place> = response.error_for_status()?.json().await?;
        let Some(place) = places.into_iter().next() else {
            return Ok(None);
        };
        Ok(Some(Coordinates::new(
            place.lat.parse(self.name(), "lat")?,
            place.lon.parse(self.name(), "lon")?,
        )))
    }
}

/// Secondary geocoding proxy with an optional API key.
pub struct ProxyProvider {
    http: Client,
    endpoint: String,
    api_key: Option<SecretString>,
}

impl ProxyProvider {
    pub fn new(
        endpoint: String,
        api_key: Option<SecretString>,
        user_agent: &str,
        request_timeout: Duration,
    ) -> AppResult<Self> {
        Ok(Self {
            http: build_http(user_agent, request_timeout)?,
            endpoint,
            api_key,
        })
    }
}

#[async_trait]
impl GeocodeProvider for ProxyProvider {
    fn name(&self) -> &'static str {
        "proxy"
    }

    fn source(&self) -> ProviderSource {
        ProviderSource::Secondary
    }

    async fn geocode(&self, query: &str) -> AppResult<Option<Coordinates>> {
        #[derive(Deserialize)]
        struct Point {
            #[serde(alias = "latitude")]
            lat: NumberOrText,
            #[serde(alias = "lon", alias = "longitude")]
            lng: NumberOrText,
        }

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Response {
            List { results: Vec<Point> },
            Single(Point),
        }

        let mut request = self.http.get(&self.endpoint).query(&[("q", query)]);
        if let Some(key) = &self.api_key {
            request = request.header("X-Api-Key", key.expose_secret());
        }
        let response = request.send().await?;
        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            return Err(AppError::RateLimited {
                provider: self.name(),
            });
        }

        let point = match response.error_for_status()?.json::<Response>().await? {
            Response::List { results } => results.into_iter().next(),
            Response::Single(point) => Some(point),
        };
        let Some(point) = point else {
            return Ok(None);
        };
        Ok(Some(Coordinates::new(
            point.lat.parse(self.name(), "lat")?,
            point.lng.parse(self.name(), "lng")?,
        )))
    }
}

use std::path::Path;

use httptest::matchers::{all_of, contains, request, url_decoded};
use httptest::responders::{json_encoded, status_code};
use httptest::{Expectation, Server};
use secrecy::SecretString;
use serde_json::json;
use tempfile::tempdir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use shelter_geocoder::config::AppConfig;
use shelter_geocoder::providers::GeocodeClient;
use shelter_geocoder::{
    AddressableEntity, GeocoderService, HitOrigin, ProviderSource, ResolutionEvent,
};

const ELM_ST: &str = "123 Elm St, Springfield, IL 62701";

fn config_for(data_dir: &Path, primary: &Server, secondary: Option<&Server>) -> AppConfig {
    AppConfig {
        data_dir: data_dir.to_path_buf(),
        cache_file_name: "geocode-cache.db".into(),
        cache_ttl_days: 30,
        max_concurrency: 8,
        request_timeout_ms: 2_000,
        provider_max_attempts: 2,
        default_country: "USA".into(),
        primary_endpoint: primary.url("/search").to_string(),
        secondary_endpoint: secondary.map(|server| server.url("/geocode").to_string()),
        secondary_api_key: secondary.map(|_| SecretString::from("proxy-key".to_string())),
        user_agent: "shelter-geocoder-tests/0.1".into(),
    }
}

#[tokio::test]
async fn falls_through_to_proxy_when_nominatim_has_no_match() {
    let primary = Server::run();
    let secondary = Server::run();
    primary.expect(
        Expectation::matching(all_of!(
            request::method("GET"),
            request::path("/search"),
            request::query(url_decoded(contains(("q", "Small Pet Haven, USA")))),
            request::query(url_decoded(contains(("format", "jsonv2")))),
        ))
        .respond_with(json_encoded(json!([]))),
    );
    secondary.expect(
        Expectation::matching(all_of!(
            request::method("GET"),
            request::path("/geocode"),
            request::query(url_decoded(contains(("q", "Small Pet Haven, USA")))),
            request::headers(contains(("x-api-key", "proxy-key"))),
        ))
        .respond_with(json_encoded(json!({
            "results": [{ "lat": "44.97", "lng": -93.26 }]
        }))),
    );

    let dir = tempdir().unwrap();
    let config = config_for(dir.path(), &primary, Some(&secondary));
    let client = GeocodeClient::from_config(&config).unwrap();
    assert_eq!(client.provider_count(), 2);

    let hit = client
        .resolve("Small Pet Haven, USA", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(hit.source, ProviderSource::Secondary);
    assert_eq!(hit.latitude, 44.97);
    assert_eq!(hit.longitude, -93.26);
    assert_eq!(hit.query_used, "Small Pet Haven, USA");
}

#[tokio::test]
async fn retries_after_rate_limit() {
    let primary = Server::run();
    primary.expect(
        Expectation::matching(all_of!(
            request::method("GET"),
            request::path("/search"),
            request::query(url_decoded(contains(("q", "Salem, OR, USA")))),
        ))
        .times(2)
        .respond_with(httptest::cycle![
            status_code(429),
            json_encoded(json!([{ "lat": "44.94", "lon": "-123.03" }])),
        ]),
    );

    let dir = tempdir().unwrap();
    let config = config_for(dir.path(), &primary, None);
    let client = GeocodeClient::from_config(&config).unwrap();

    let hit = client
        .resolve("Salem, OR, USA", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(hit.source, ProviderSource::Primary);
    assert_eq!(hit.longitude, -123.03);
}

#[tokio::test]
async fn resolved_batch_is_served_from_disk_cache_after_restart() {
    let primary = Server::run();
    primary.expect(
        Expectation::matching(all_of!(
            request::method("GET"),
            request::path("/search"),
            request::query(url_decoded(contains(("q", ELM_ST)))),
        ))
        .times(1)
        .respond_with(json_encoded(json!([{ "lat": "39.78", "lon": "-89.64" }]))),
    );

    let dir = tempdir().unwrap();
    let batch = vec![AddressableEntity::new("p1", "Buddy")
        .with_address(ELM_ST)
        .with_organization("Happy Paws Rescue")];

    {
        let service = GeocoderService::initialize(config_for(dir.path(), &primary, None)).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outcome = service.submit_batch(batch.clone(), tx).wait().await.unwrap();
        assert_eq!(outcome.summary().unwrap().resolved, 1);

        match rx.recv().await.unwrap() {
            ResolutionEvent::Resolved {
                entity_id,
                hit,
                origin,
                ..
            } => {
                assert_eq!(entity_id, "p1");
                assert_eq!(hit.query_used, ELM_ST);
                assert_eq!(origin, HitOrigin::Network);
            }
            other => panic!("unexpected event {other:?}"),
        }

        let health = service.health().unwrap();
        assert_eq!(health.cache_stats.entity_entries, 1);
        assert_eq!(health.cache_stats.query_entries, 1);
        assert!(!health.cache_recovered);
    }

    let service = GeocoderService::initialize(config_for(dir.path(), &primary, None)).unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let outcome = service.submit_batch(batch, tx).wait().await.unwrap();
    let summary = outcome.summary().unwrap();
    assert_eq!(summary.entity_cache_hits, 1);
    assert_eq!(summary.network_queries, 0);
    assert!(matches!(
        rx.recv().await,
        Some(ResolutionEvent::Resolved {
            origin: HitOrigin::EntityCache,
            ..
        })
    ));

    service.clear_cache().unwrap();
    assert_eq!(service.health().unwrap().cache_stats.entity_entries, 0);
}

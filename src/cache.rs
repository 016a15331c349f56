use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use tracing::{debug, warn};

use crate::db::{open_cache_database, open_in_memory, DatabaseBootstrap, DatabaseContext};
use crate::errors::AppResult;
use crate::model::GeocodeHit;

/// The two independently keyed cache tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheNamespace {
    Query,
    Entity,
}

impl CacheNamespace {
    fn table(&self) -> &'static str {
        match self {
            CacheNamespace::Query => "query_cache",
            CacheNamespace::Entity => "entity_cache",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub hit: GeocodeHit,
    pub stored_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CacheStats {
    pub query_entries: usize,
    pub entity_entries: usize,
}

pub fn is_fresh(entry: &CacheEntry, ttl: Duration, now: DateTime<Utc>) -> bool {
    now.signed_duration_since(entry.stored_at) < ttl
}

/// SQLite-backed store shared by every worker of a run and across runs.
#[derive(Clone)]
pub struct CacheStore {
    db: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
    ttl: Duration,
    recovered: bool,
}

impl CacheStore {
    pub fn open<P: AsRef<Path>>(data_dir: P, file_name: &str, ttl: Duration) -> AppResult<Self> {
        let DatabaseBootstrap {
            context: DatabaseContext { connection, path },
            recovered,
        } = open_cache_database(data_dir, file_name)?;
        Ok(Self {
            db: Arc::new(Mutex::new(connection)),
            path: Some(path),
            ttl,
            recovered,
        })
    }

    pub fn in_memory(ttl: Duration) -> AppResult<Self> {
        Ok(Self {
            db: Arc::new(Mutex::new(open_in_memory()?)),
            path: None,
            ttl,
            recovered: false,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn recovered(&self) -> bool {
        self.recovered
    }

    /// Returns the stored entry regardless of age. Unreadable rows are reported as absent.
    pub fn get(&self, namespace: CacheNamespace, key: &str) -> Option<CacheEntry> {
        let row = {
            let conn = self.db.lock();
            conn.query_row(
                &format!(
                    "SELECT payload, stored_at FROM {} WHERE cache_key = ?1",
                    namespace.table()
                ),
                [key],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()
        };

        let (payload, stored_at) = match row {
            Ok(Some(row)) => row,
            Ok(None) => return None,
            Err(err) => {
                warn!(?err, ?namespace, key, "cache read failed; treating as miss");
                return None;
            }
        };

        let hit = match serde_json::from_str::<GeocodeHit>(&payload) {
            Ok(hit) => hit,
            Err(err) => {
                warn!(?err, ?namespace, key, "corrupt cache payload; treating as miss");
                return None;
            }
        };
        let Some(stored_at) = Utc.timestamp_millis_opt(stored_at).single() else {
            warn!(?namespace, key, stored_at, "invalid cache timestamp; treating as miss");
            return None;
        };
        Some(CacheEntry { hit, stored_at })
    }

    pub fn get_fresh(
        &self,
        namespace: CacheNamespace,
        key: &str,
        now: DateTime<Utc>,
    ) -> Option<CacheEntry> {
        let entry = self.get(namespace, key)?;
        if is_fresh(&entry, self.ttl, now) {
            Some(entry)
        } else {
            debug!(?namespace, key, stored_at = %entry.stored_at, "stale cache entry ignored");
            None
        }
    }

    pub fn put(
        &self,
        namespace: CacheNamespace,
        key: &str,
        hit: &GeocodeHit,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        let payload = serde_json::to_string(hit)?;
        let conn = self.db.lock();
        conn.execute(
            &format!(
                "INSERT INTO {} (cache_key, payload, stored_at) VALUES (?1, ?2, ?3)
                ON CONFLICT(cache_key) DO UPDATE SET
                    payload = excluded.payload,
                    stored_at = excluded.stored_at",
                namespace.table()
            ),
            (key, payload.as_str(), now.timestamp_millis()),
        )?;
        Ok(())
    }

    pub fn clear(&self) -> AppResult<()> {
        self.clear_namespace(CacheNamespace::Query)?;
        self.clear_namespace(CacheNamespace::Entity)
    }

    pub fn clear_namespace(&self, namespace: CacheNamespace) -> AppResult<()> {
        let conn = self.db.lock();
        conn.execute(&format!("DELETE FROM {}", namespace.table()), [])?;
        Ok(())
    }

    pub fn stats(&self) -> AppResult<CacheStats> {
        let conn = self.db.lock();
        let count = |table: &str| -> AppResult<usize> {
            let value: i64 =
                conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
            Ok(value.max(0) as usize)
        };
        Ok(CacheStats {
            query_entries: count(CacheNamespace::Query.table())?,
            entity_entries: count(CacheNamespace::Entity.table())?,
        })
    }

    #[cfg(test)]
    pub(crate) fn put_raw(
        &self,
        namespace: CacheNamespace,
        key: &str,
        payload: &str,
        stored_at: i64,
    ) -> AppResult<()> {
        let conn = self.db.lock();
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO {} (cache_key, payload, stored_at) VALUES (?1, ?2, ?3)",
                namespace.table()
            ),
            (key, payload, stored_at),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Coordinates, ProviderSource};
    use tempfile::tempdir;

    fn sample_hit(query: &str) -> GeocodeHit {
        GeocodeHit::new(Coordinates::new(39.78, -89.64), query, ProviderSource::Primary)
    }

    fn at_millis(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(millis).single().unwrap()
    }

    #[test]
    fn freshness_boundary_follows_ttl() {
        let ttl = Duration::days(30);
        let now = at_millis(1_760_000_000_000);
        let one_ms = Duration::milliseconds(1);
        let expired = CacheEntry {
            hit: sample_hit("q"),
            stored_at: now - ttl - one_ms,
        };
        let fresh = CacheEntry {
            hit: sample_hit("q"),
            stored_at: now - ttl + one_ms,
        };
        assert!(!is_fresh(&expired, ttl, now));
        assert!(is_fresh(&fresh, ttl, now));
    }

    #[test]
    fn namespaces_are_independent() {
        let store = CacheStore::in_memory(Duration::days(30)).unwrap();
        let now = Utc::now();
        store
            .put(CacheNamespace::Query, "p1", &sample_hit("a"), now)
            .unwrap();

        assert!(store.get(CacheNamespace::Query, "p1").is_some());
        assert!(store.get(CacheNamespace::Entity, "p1").is_none());
    }

    #[test]
    fn put_overwrites_existing_entry() {
        let store = CacheStore::in_memory(Duration::days(30)).unwrap();
        let earlier = at_millis(1_000);
        let later = at_millis(2_000);
        store
            .put(CacheNamespace::Entity, "p1", &sample_hit("old"), earlier)
            .unwrap();
        store
            .put(CacheNamespace::Entity, "p1", &sample_hit("new"), later)
            .unwrap();

        let entry = store.get(CacheNamespace::Entity, "p1").unwrap();
        assert_eq!(entry.hit.query_used, "new");
        assert_eq!(entry.stored_at, later);
        assert_eq!(store.stats().unwrap().entity_entries, 1);
    }

    #[test]
    fn stale_entries_are_present_but_not_fresh() {
        let store = CacheStore::in_memory(Duration::days(30)).unwrap();
        let now = Utc::now();
        store
            .put(
                CacheNamespace::Query,
                "old query",
                &sample_hit("old query"),
                now - Duration::days(31),
            )
            .unwrap();

        assert!(store.get(CacheNamespace::Query, "old query").is_some());
        assert!(store
            .get_fresh(CacheNamespace::Query, "old query", now)
            .is_none());
    }

    #[test]
    fn corrupt_payload_reads_as_absent() {
        let store = CacheStore::in_memory(Duration::days(30)).unwrap();
        store
            .put_raw(CacheNamespace::Query, "broken", "{not json", 1)
            .unwrap();
        store
            .put_raw(
                CacheNamespace::Query,
                "wrong-shape",
                r#"{"latitude":"north"}"#,
                1,
            )
            .unwrap();
        assert!(store.get(CacheNamespace::Query, "broken").is_none());
        assert!(store.get(CacheNamespace::Query, "wrong-shape").is_none());
    }

    #[test]
    fn clear_empties_both_namespaces() {
        let store = CacheStore::in_memory(Duration::days(30)).unwrap();
        let now = Utc::now();
        store
            .put(CacheNamespace::Query, "q", &sample_hit("q"), now)
            .unwrap();
        store
            .put(CacheNamespace::Entity, "e", &sample_hit("q"), now)
            .unwrap();
        store.clear().unwrap();
        let stats = store.stats().unwrap();
        assert_eq!(stats.query_entries, 0);
        assert_eq!(stats.entity_entries, 0);
    }

    #[test]
    fn survives_reopen_from_disk() {
        let dir = tempdir().unwrap();
        let now = Utc::now();
        {
            let store = CacheStore::open(dir.path(), "cache.db", Duration::days(30)).unwrap();
            store
                .put(CacheNamespace::Query, "q", &sample_hit("q"), now)
                .unwrap();
        }
        let reopened = CacheStore::open(dir.path(), "cache.db", Duration::days(30)).unwrap();
        let entry = reopened
            .get_fresh(CacheNamespace::Query, "q", now)
            .unwrap();
        assert_eq!(entry.hit, sample_hit("q"));
        assert_eq!(entry.stored_at.timestamp_millis(), now.timestamp_millis());
    }
}

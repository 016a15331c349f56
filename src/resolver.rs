use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::cache::{CacheNamespace, CacheStore};
use crate::candidates::{CandidateGenerator, CandidateTiers, TIER_COUNT};
use crate::errors::AppResult;
use crate::executor::{run_all, JobError};
use crate::model::{AddressableEntity, GeocodeHit, RunToken};
use crate::providers::GeocodeClient;

pub type EventSink = mpsc::UnboundedSender<ResolutionEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HitOrigin {
    EntityCache,
    QueryCache,
    Network,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ResolutionEvent {
    Resolved {
        run: RunToken,
        entity_id: String,
        hit: GeocodeHit,
        origin: HitOrigin,
        tier: Option<usize>,
    },
    Done {
        run: RunToken,
        summary: RunSummary,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub requested: usize,
    pub resolved: usize,
    pub unresolved: usize,
    pub entity_cache_hits: usize,
    pub query_cache_hits: usize,
    pub network_queries: usize,
    pub network_hits: usize,
    pub unresolved_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed(RunSummary),
    Superseded,
}

impl RunOutcome {
    pub fn summary(&self) -> Option<&RunSummary> {
        match self {
            RunOutcome::Completed(summary) => Some(summary),
            RunOutcome::Superseded => None,
        }
    }
}

pub struct RunHandle {
    token: RunToken,
    handle: JoinHandle<RunOutcome>,
}

impl RunHandle {
    pub fn token(&self) -> RunToken {
        self.token
    }

    pub async fn wait(self) -> AppResult<RunOutcome> {
        Ok(self.handle.await?)
    }
}

struct ActiveBatch {
    entities: Arc<Vec<AddressableEntity>>,
    sink: EventSink,
}

struct RunRegistry {
    current: RunToken,
    cancel: CancellationToken,
    batch: Option<ActiveBatch>,
}

struct RunContext {
    token: RunToken,
    cancel: CancellationToken,
    entities: Arc<Vec<AddressableEntity>>,
    sink: EventSink,
}

#[derive(Default)]
struct RunState {
    pending: HashSet<String>,
    resolved: HashMap<String, GeocodeHit>,
    entity_cache_hits: usize,
    query_cache_hits: usize,
    network_hits: usize,
}

struct HitApplication<'a> {
    query: Option<&'a str>,
    entity_ids: &'a [String],
    hit: &'a GeocodeHit,
    origin: HitOrigin,
    tier: Option<usize>,
}

/// Per-tier grouping of pending entities by candidate query.
struct TierPlan {
    queries: Vec<String>,
    subscribers: HashMap<String, Vec<String>>,
    ranked: Vec<(String, Vec<String>)>,
}

impl TierPlan {
    fn build<'a>(
        level: usize,
        pending_ids: impl IntoIterator<Item = &'a str>,
        tiers: &HashMap<&str, CandidateTiers>,
    ) -> Self {
        let mut plan = TierPlan {
            queries: Vec::new(),
            subscribers: HashMap::new(),
            ranked: Vec::new(),
        };
        for id in pending_ids {
            let Some(candidates) = tiers.get(id) else {
                continue;
            };
            let queries = candidates.tier(level);
            for query in queries {
                let subscribers = plan.subscribers.entry(query.clone()).or_default();
                if subscribers.is_empty() {
                    plan.queries.push(query.clone());
                }
                subscribers.push(id.to_string());
            }
            plan.ranked.push((id.to_string(), queries.to_vec()));
        }
        plan
    }

    fn subscribers(&self, query: &str) -> &[String] {
        self.subscribers
            .get(query)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Next untried query of every still-pending entity, deduplicated.
    fn next_round(&self, pending: &HashSet<String>, attempted: &HashSet<String>) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut round = Vec::new();
        for (id, queries) in &self.ranked {
            if !pending.contains(id) {
                continue;
            }
            if let Some(query) = queries.iter().find(|query| !attempted.contains(*query)) {
                if seen.insert(query.as_str()) {
                    round.push(query.clone());
                }
            }
        }
        round
    }
}

/// Drives one batch of entities through entity cache, query cache and the
/// provider chain, tier by tier. Only the most recently minted run may publish.
pub struct GeocodeResolver {
    cache: CacheStore,
    client: Arc<GeocodeClient>,
    candidates: CandidateGenerator,
    max_concurrency: usize,
    registry: Mutex<RunRegistry>,
}

impl GeocodeResolver {
    pub fn new(
        cache: CacheStore,
        client: Arc<GeocodeClient>,
        candidates: CandidateGenerator,
        max_concurrency: usize,
    ) -> Self {
        Self {
            cache,
            client,
            candidates,
            max_concurrency: max_concurrency.max(1),
            registry: Mutex::new(RunRegistry {
                current: RunToken(0),
                cancel: CancellationToken::new(),
                batch: None,
            }),
        }
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn client_provider_count(&self) -> usize {
        self.client.provider_count()
    }

    pub fn current_token(&self) -> RunToken {
        self.registry.lock().current
    }

    /// Supersedes any in-flight run and resolves `entities` on a spawned task.
    pub fn submit_batch(
        self: &Arc<Self>,
        entities: Vec<AddressableEntity>,
        sink: EventSink,
    ) -> RunHandle {
        let ctx = self.install_batch(entities, sink);
        self.spawn_run(ctx)
    }

    /// Re-runs the last submitted batch under a new token. Caches are still consulted.
    pub fn refresh_current_batch(self: &Arc<Self>) -> Option<RunHandle> {
        let ctx = {
            let mut registry = self.registry.lock();
            let batch = registry.batch.as_ref()?;
            let (entities, sink) = (Arc::clone(&batch.entities), batch.sink.clone());
            Self::mint_run(&mut registry, entities, sink)
        };
        Some(self.spawn_run(ctx))
    }

    /// Like [`submit_batch`](Self::submit_batch) but resolves on the caller's task.
    pub async fn resolve_batch(
        &self,
        entities: Vec<AddressableEntity>,
        sink: EventSink,
    ) -> RunOutcome {
        let ctx = self.install_batch(entities, sink);
        self.execute(ctx).await
    }

    pub fn clear_cache(&self) -> AppResult<()> {
        self.cache.clear()?;
        info!("geocode cache cleared");
        Ok(())
    }

    fn install_batch(&self, entities: Vec<AddressableEntity>, sink: EventSink) -> RunContext {
        let entities = Arc::new(entities);
        let mut registry = self.registry.lock();
        registry.batch = Some(ActiveBatch {
            entities: Arc::clone(&entities),
            sink: sink.clone(),
        });
        Self::mint_run(&mut registry, entities, sink)
    }

    /// Cancels the current run and hands out the next token. Callers hold the registry lock.
    fn mint_run(
        registry: &mut RunRegistry,
        entities: Arc<Vec<AddressableEntity>>,
        sink: EventSink,
    ) -> RunContext {
        registry.cancel.cancel();
        registry.current = RunToken(registry.current.0 + 1);
        registry.cancel = CancellationToken::new();
        debug!(run = %registry.current, entities = entities.len(), "minted resolution run");
        RunContext {
            token: registry.current,
            cancel: registry.cancel.clone(),
            entities,
            sink,
        }
    }

    fn spawn_run(self: &Arc<Self>, ctx: RunContext) -> RunHandle {
        let token = ctx.token;
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.execute(ctx).await });
        RunHandle { token, handle }
    }

    fn is_current(&self, token: RunToken) -> bool {
        self.registry.lock().current == token
    }

    async fn execute(&self, ctx: RunContext) -> RunOutcome {
        let started = Instant::now();
        let now = Utc::now();

        let mut seen = HashSet::new();
        let batch: Vec<&AddressableEntity> = ctx
            .entities
            .iter()
            .filter(|entity| seen.insert(entity.id.as_str()))
            .collect();
        if batch.len() < ctx.entities.len() {
            debug!(
                run = %ctx.token,
                duplicates = ctx.entities.len() - batch.len(),
                "collapsed duplicate entity ids"
            );
        }

        let state = Mutex::new(RunState {
            pending: batch.iter().map(|entity| entity.id.clone()).collect(),
            ..RunState::default()
        });

        for entity in &batch {
            let Some(entry) = self
                .cache
                .get_fresh(CacheNamespace::Entity, &entity.id, now)
            else {
                continue;
            };
            let applied = self.apply_hit(
                &ctx,
                &state,
                HitApplication {
                    query: None,
                    entity_ids: std::slice::from_ref(&entity.id),
                    hit: &entry.hit,
                    origin: HitOrigin::EntityCache,
                    tier: None,
                },
            );
            if !applied {
                return self.superseded(&ctx);
            }
        }

        let tiers: HashMap<&str, CandidateTiers> = batch
            .iter()
            .filter(|entity| state.lock().pending.contains(&entity.id))
            .map(|entity| (entity.id.as_str(), self.candidates.generate(entity)))
            .collect();
        debug!(
            run = %ctx.token,
            pending = tiers.len(),
            candidate_queries = tiers.values().map(CandidateTiers::total_queries).sum::<usize>(),
            "generated candidate queries"
        );
        let mut attempted: HashSet<String> = HashSet::new();
        let mut network_queries = 0;

        for level in 0..TIER_COUNT {
            if !self.is_current(ctx.token) {
                return self.superseded(&ctx);
            }
            let pending_ids: Vec<&str> = {
                let state = state.lock();
                batch
                    .iter()
                    .map(|entity| entity.id.as_str())
                    .filter(|id| state.pending.contains(*id))
                    .collect()
            };
            if pending_ids.is_empty() {
                break;
            }

            let plan = TierPlan::build(level, pending_ids, &tiers);
            debug!(
                run = %ctx.token,
                tier = level,
                queries = plan.queries.len(),
                "draining tier"
            );

            for query in &plan.queries {
                let remembered = state.lock().resolved.get(query).cloned();
                let hit = match remembered {
                    Some(hit) => hit,
                    None => match self.cache.get_fresh(CacheNamespace::Query, query, now) {
                        Some(entry) => entry.hit,
                        None => continue,
                    },
                };
                attempted.insert(query.clone());
                let applied = self.apply_hit(
                    &ctx,
                    &state,
                    HitApplication {
                        query: Some(query.as_str()),
                        entity_ids: plan.subscribers(query),
                        hit: &hit,
                        origin: HitOrigin::QueryCache,
                        tier: Some(level),
                    },
                );
                if !applied {
                    return self.superseded(&ctx);
                }
            }

            loop {
                let round = {
                    let state = state.lock();
                    plan.next_round(&state.pending, &attempted)
                };
                if round.is_empty() {
                    break;
                }
                if !self.is_current(ctx.token) {
                    return self.superseded(&ctx);
                }
                attempted.extend(round.iter().cloned());

                let lost_run = AtomicBool::new(false);
                let client = self.client.as_ref();
                let cancel = &ctx.cancel;
                let stats = run_all(
                    &round,
                    self.max_concurrency,
                    |query: &String| {
                        let query = query.clone();
                        async move {
                            if cancel.is_cancelled() {
                                return Ok::<_, Infallible>(None);
                            }
                            Ok(client.resolve(&query, cancel).await)
                        }
                    },
                    |query, result| match result {
                        Ok(Some(hit)) => {
                            let applied = self.apply_hit(
                                &ctx,
                                &state,
                                HitApplication {
                                    query: Some(query.as_str()),
                                    entity_ids: plan.subscribers(query),
                                    hit: &hit,
                                    origin: HitOrigin::Network,
                                    tier: Some(level),
                                },
                            );
                            if !applied {
                                lost_run.store(true, Ordering::SeqCst);
                            }
                        }
                        Ok(None) => {
                            trace!(run = %ctx.token, tier = level, query = %query, "query unresolved");
                        }
                        Err(JobError::Failed(never)) => match never {},
                        Err(JobError::Panicked) => {
                            warn!(run = %ctx.token, tier = level, query = %query, "geocode job panicked");
                        }
                    },
                )
                .await;
                network_queries += stats.dispatched;

                if lost_run.load(Ordering::SeqCst) || ctx.cancel.is_cancelled() {
                    return self.superseded(&ctx);
                }
            }
        }

        self.finish(&ctx, &batch, &state, network_queries, started)
    }

    /// Applies `hit` to every still-pending entity in the application and
    /// remembers it for the rest of the run. Returns `false` without touching
    /// anything when the run is no longer current.
    fn apply_hit(
        &self,
        ctx: &RunContext,
        state: &Mutex<RunState>,
        application: HitApplication<'_>,
    ) -> bool {
        let registry = self.registry.lock();
        if registry.current != ctx.token {
            return false;
        }

        let now = Utc::now();
        let hit = application.hit;
        if let (HitOrigin::Network, Some(query)) = (application.origin, application.query) {
            if let Err(err) = self.cache.put(CacheNamespace::Query, query, hit, now) {
                warn!(?err, query, "failed to store query cache entry");
            }
        }

        let mut state = state.lock();
        match application.origin {
            HitOrigin::EntityCache => state.entity_cache_hits += 1,
            HitOrigin::QueryCache => state.query_cache_hits += 1,
            HitOrigin::Network => state.network_hits += 1,
        }
        if let Some(query) = application.query {
            state.resolved.insert(query.to_string(), hit.clone());
        }
        for entity_id in application.entity_ids {
            if !state.pending.remove(entity_id) {
                continue;
            }
            if application.origin != HitOrigin::EntityCache {
                if let Err(err) = self.cache.put(CacheNamespace::Entity, entity_id, hit, now) {
                    warn!(?err, entity_id = %entity_id, "failed to store entity cache entry");
                }
            }
            trace!(
                run = %ctx.token,
                entity_id = %entity_id,
                origin = ?application.origin,
                query = %hit.query_used,
                "entity resolved"
            );
            let event = ResolutionEvent::Resolved {
                run: ctx.token,
                entity_id: entity_id.clone(),
                hit: hit.clone(),
                origin: application.origin,
                tier: application.tier,
            };
            if ctx.sink.send(event).is_err() {
                trace!(run = %ctx.token, "resolution event receiver dropped");
            }
        }
        drop(registry);
        true
    }

    fn finish(
        &self,
        ctx: &RunContext,
        batch: &[&AddressableEntity],
        state: &Mutex<RunState>,
        network_queries: usize,
        started: Instant,
    ) -> RunOutcome {
        let registry = self.registry.lock();
        if registry.current != ctx.token {
            drop(registry);
            return self.superseded(ctx);
        }

        let state = state.lock();
        let unresolved_ids: Vec<String> = batch
            .iter()
            .filter(|entity| state.pending.contains(&entity.id))
            .map(|entity| entity.id.clone())
            .collect();
        let summary = RunSummary {
            requested: batch.len(),
            resolved: batch.len() - unresolved_ids.len(),
            unresolved: unresolved_ids.len(),
            entity_cache_hits: state.entity_cache_hits,
            query_cache_hits: state.query_cache_hits,
            network_queries,
            network_hits: state.network_hits,
            unresolved_ids,
        };
        info!(
            run = %ctx.token,
            requested = summary.requested,
            resolved = summary.resolved,
            unresolved = summary.unresolved,
            network_queries = summary.network_queries,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "resolution run complete"
        );
        let event = ResolutionEvent::Done {
            run: ctx.token,
            summary: summary.clone(),
        };
        if ctx.sink.send(event).is_err() {
            trace!(run = %ctx.token, "resolution event receiver dropped");
        }
        RunOutcome::Completed(summary)
    }

    fn superseded(&self, ctx: &RunContext) -> RunOutcome {
        debug!(run = %ctx.token, "resolution run superseded");
        RunOutcome::Superseded
    }
}

//! Memory manager
//!
//! Per-user short-term and long-term stores with a secondary index. Embeddings
//! and summaries are computed outside the lock; the lock only guards the
//! in-memory maps.

use super::embedding::{centroid, cosine_similarity, EmbeddingProvider};
use super::index::MemoryIndex;
use super::models::{
    CleanupReport, FactualMemory, MemoryItem, MemoryQuery, MemoryResult, MemorySource, MemoryType,
    NewMemory, Preference, Skill, UserMemoryProfile,
};
use super::strategy::{
    extract_fact, extract_preference, extract_skill, freshness, resolve_importance, Clusterer,
    SimilarityClusterer,
};
use crate::config::MemoryConfig;
use crate::error::{CoreError, Result};
use crate::metrics::METRICS;
use crate::summarizer::Summarizer;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Token target for consolidation summaries
const INSIGHT_MAX_TOKENS: usize = 200;

/// Outcome of a store call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMemory {
    pub id: String,
    pub importance: f64,
    pub long_term: bool,
}

/// One user's memories
#[derive(Debug, Default)]
struct UserMemoryStore {
    short_term: HashMap<String, MemoryItem>,
    long_term: HashMap<String, MemoryItem>,
    index: MemoryIndex,
    facts: HashMap<String, FactualMemory>,
    preferences: HashMap<String, Preference>,
    /// Skills are keyed by name; this maps each source memory id to its skill
    skill_sources: HashMap<String, String>,
    skills: HashMap<String, Skill>,
    last_consolidated: Option<DateTime<Utc>>,
}

impl UserMemoryStore {
    fn len(&self) -> usize {
        self.short_term.len() + self.long_term.len()
    }

    fn get(&self, id: &str) -> Option<&MemoryItem> {
        self.short_term.get(id).or_else(|| self.long_term.get(id))
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut MemoryItem> {
        match self.short_term.get_mut(id) {
            Some(item) => Some(item),
            None => self.long_term.get_mut(id),
        }
    }

    fn items(&self) -> impl Iterator<Item = &MemoryItem> {
        self.short_term.values().chain(self.long_term.values())
    }

    fn insert(&mut self, item: MemoryItem, long_term: bool) {
        self.index.insert(&item);
        match item.memory_type {
            MemoryType::Fact => {
                self.facts.insert(item.id.clone(), extract_fact(&item));
            }
            MemoryType::Preference => {
                self.preferences.insert(item.id.clone(), extract_preference(&item));
            }
            MemoryType::Skill => {
                let skill = extract_skill(&item);
                self.skill_sources.insert(item.id.clone(), skill.name.clone());
                self.skills.insert(skill.name.clone(), skill);
            }
            _ => {}
        }

        if long_term {
            self.long_term.insert(item.id.clone(), item);
        } else {
            self.short_term.insert(item.id.clone(), item);
        }
    }

    fn remove(&mut self, id: &str) -> Option<MemoryItem> {
        let item = self
            .short_term
            .remove(id)
            .or_else(|| self.long_term.remove(id))?;
        self.index.remove(&item);
        self.facts.remove(id);
        self.preferences.remove(id);
        if let Some(name) = self.skill_sources.remove(id) {
            if !self.skill_sources.values().any(|n| *n == name) {
                self.skills.remove(&name);
            }
        }
        Some(item)
    }

    /// Lowest-value item, preferring short-term
    fn eviction_candidate(&self) -> Option<String> {
        let pick = |items: &HashMap<String, MemoryItem>| {
            items
                .values()
                .min_by(|a, b| {
                    a.importance
                        .partial_cmp(&b.importance)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then(a.created_at.cmp(&b.created_at))
                })
                .map(|item| item.id.clone())
        };
        pick(&self.short_term).or_else(|| pick(&self.long_term))
    }
}

/// Memory manager
pub struct MemoryManager {
    config: MemoryConfig,
    stores: RwLock<HashMap<String, UserMemoryStore>>,
    embedder: Arc<dyn EmbeddingProvider>,
    summarizer: Arc<dyn Summarizer>,
    clusterer: Arc<dyn Clusterer>,
}

impl MemoryManager {
    pub fn new(
        config: MemoryConfig,
        embedder: Arc<dyn EmbeddingProvider>,
        summarizer: Arc<dyn Summarizer>,
    ) -> Self {
        let clusterer = Arc::new(SimilarityClusterer::new(
            config.cluster_similarity,
            config.min_cluster_size,
        ));
        Self {
            config,
            stores: RwLock::new(HashMap::new()),
            embedder,
            summarizer,
            clusterer,
        }
    }

    pub fn with_clusterer(mut self, clusterer: Arc<dyn Clusterer>) -> Self {
        self.clusterer = clusterer;
        self
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Embed `text`, treating failure as "no embedding"
    async fn try_embed(&self, text: &str) -> Option<Vec<f32>> {
        match self.embedder.embed(text).await {
            Ok(vector) => Some(vector),
            Err(e) => {
                METRICS.embedding_failures.inc();
                warn!("Embedding failed with {}: {}", self.embedder.name(), e);
                None
            }
        }
    }

    /// Store a memory.
    ///
    /// Importance at or above the configured threshold goes to long-term
    /// storage. Content longer than the minimum embedding length is embedded
    /// when the provider allows it.
    pub async fn store(&self, memory: NewMemory) -> Result<StoredMemory> {
        if memory.user_id.trim().is_empty() {
            return Err(CoreError::InvalidRequest("user_id is required".to_string()));
        }
        if memory.content.trim().is_empty() {
            return Err(CoreError::InvalidRequest("memory content is empty".to_string()));
        }

        let importance = resolve_importance(&memory);
        let embedding = if memory.content.chars().count() > self.config.min_embedding_length {
            self.try_embed(&memory.content).await
        } else {
            None
        };

        let long_term = importance >= self.config.importance_threshold;
        let item = memory.into_item(importance, embedding, Utc::now());
        let stored = StoredMemory {
            id: item.id.clone(),
            importance,
            long_term,
        };

        {
            let mut stores = self.stores.write().await;
            let store = stores.entry(item.user_id.clone()).or_default();

            while store.len() >= self.config.max_memories_per_user.max(1) {
                let Some(victim) = store.eviction_candidate() else {
                    break;
                };
                store.remove(&victim);
                debug!("Evicted memory {} for user {} at capacity", victim, item.user_id);
            }

            debug!(
                "Stored {:?} memory {} for user {} (importance {:.2}, long_term {})",
                item.memory_type, item.id, item.user_id, importance, long_term
            );
            store.insert(item, long_term);
        }

        METRICS.record_memory_store(long_term);
        Ok(stored)
    }

    /// Ranked retrieval.
    ///
    /// Unknown users get an empty list. Returned items have their access
    /// count and timestamp updated.
    pub async fn retrieve(&self, query: &MemoryQuery) -> Result<Vec<MemoryResult>> {
        if query.user_id.trim().is_empty() {
            return Err(CoreError::InvalidRequest("user_id is required".to_string()));
        }

        let query_embedding = if query.query.trim().is_empty() {
            None
        } else {
            self.try_embed(&query.query).await
        };

        let now = Utc::now();
        let mut stores = self.stores.write().await;
        let Some(store) = stores.get_mut(&query.user_id) else {
            return Ok(Vec::new());
        };

        let candidates = candidate_ids(&store.index, query, now);
        let mut ranked: Vec<(String, f32, f64, f64)> = Vec::new();

        for item in store.items() {
            if let Some(ids) = &candidates {
                if !ids.contains(&item.id) {
                    continue;
                }
            }
            if !query.types.is_empty() && !query.types.contains(&item.memory_type) {
                continue;
            }
            if let Some(min) = query.min_importance {
                if item.importance < min {
                    continue;
                }
            }
            if let Some(max_age) = query.max_age {
                if item.age(now) > max_age {
                    continue;
                }
            }
            if !query.tags.is_empty() && !query.tags.iter().any(|t| item.has_tag(t)) {
                continue;
            }

            let similarity = match (&query_embedding, &item.embedding) {
                (Some(q), Some(e)) => {
                    let s = cosine_similarity(q, e);
                    if s < query.similarity_threshold {
                        continue;
                    }
                    s
                }
                _ => 0.0,
            };

            let relevance = item.relevance(now);
            ranked.push((item.id.clone(), similarity, relevance, relevance + similarity as f64));
        }

        ranked.sort_by(|a, b| b.3.partial_cmp(&a.3).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(query.limit);

        let mut results = Vec::with_capacity(ranked.len());
        for (id, similarity, relevance, score) in ranked {
            if let Some(item) = store.get_mut(&id) {
                item.access_count += 1;
                item.last_accessed = now;
                results.push(MemoryResult {
                    item: item.clone(),
                    similarity,
                    relevance,
                    score,
                });
            }
        }

        METRICS.memory_retrievals.inc();
        debug!("Retrieved {} memories for user {}", results.len(), query.user_id);
        Ok(results)
    }

    /// Fold clusters of related short-term memories into long-term insights.
    ///
    /// Returns the number of insights created.
    pub async fn consolidate_user(&self, user_id: &str) -> Result<usize> {
        let snapshot: Vec<MemoryItem> = {
            let stores = self.stores.read().await;
            let store = stores
                .get(user_id)
                .ok_or_else(|| CoreError::NotFound(format!("no memories for user {}", user_id)))?;
            store
                .short_term
                .values()
                .filter(|item| !item.consolidated)
                .cloned()
                .collect()
        };

        let mut created = 0;
        for cluster in self.clusterer.cluster(&snapshot) {
            let members: Vec<&MemoryItem> = cluster.iter().filter_map(|&i| snapshot.get(i)).collect();
            let texts: Vec<String> = members.iter().map(|m| m.content.clone()).collect();

            let summary = match self.summarizer.summarize(&texts, INSIGHT_MAX_TOKENS).await {
                Ok(summary) if !summary.trim().is_empty() => summary,
                Ok(_) => continue,
                Err(e) => {
                    warn!("Skipping cluster of {} for user {}: {}", members.len(), user_id, e);
                    continue;
                }
            };

            let insight = build_insight(user_id, &members, summary, self.config.importance_threshold);
            let source_ids: Vec<String> = members.iter().map(|m| m.id.clone()).collect();

            let mut stores = self.stores.write().await;
            let Some(store) = stores.get_mut(user_id) else {
                break;
            };
            // Sources may have been pruned or evicted while summarizing.
            if !source_ids.iter().all(|id| store.short_term.contains_key(id)) {
                debug!("Cluster for user {} changed during consolidation, skipping", user_id);
                continue;
            }
            for id in &source_ids {
                store.remove(id);
            }
            store.insert(insight, true);
            created += 1;
        }

        if let Some(store) = self.stores.write().await.get_mut(user_id) {
            store.last_consolidated = Some(Utc::now());
        }

        if created > 0 {
            METRICS.memory_consolidations.inc_by(created as f64);
            info!("Consolidated {} insight(s) for user {}", created, user_id);
        }
        Ok(created)
    }

    /// Consolidate every user; failures are logged and skipped
    pub async fn consolidate_all(&self) -> usize {
        let mut total = 0;
        for user in self.users().await {
            match self.consolidate_user(&user).await {
                Ok(n) => total += n,
                Err(e) => warn!("Consolidation failed for user {}: {}", user, e),
            }
        }
        total
    }

    /// Recompute freshness everywhere and prune stale, unimportant
    /// short-term items.
    pub async fn cleanup(&self, now: DateTime<Utc>) -> CleanupReport {
        let retention = Duration::days(self.config.retention_days);
        let mut report = CleanupReport::default();
        let mut stores = self.stores.write().await;

        for store in stores.values_mut() {
            for item in store.short_term.values_mut().chain(store.long_term.values_mut()) {
                item.freshness = freshness(item, now, self.config.freshness_half_life_days);
                report.refreshed += 1;
            }

            let stale: Vec<String> = store
                .short_term
                .values()
                .filter(|item| {
                    item.importance <= self.config.prune_importance && item.age(now) >= retention
                })
                .map(|item| item.id.clone())
                .collect();
            for id in stale {
                store.remove(&id);
                report.pruned += 1;
            }
        }
        stores.retain(|_, store| store.len() > 0);

        if report.pruned > 0 {
            METRICS.memory_pruned.inc_by(report.pruned as f64);
            info!("Memory cleanup pruned {} item(s)", report.pruned);
        }
        report
    }

    pub async fn users(&self) -> Vec<String> {
        let mut users: Vec<String> = self.stores.read().await.keys().cloned().collect();
        users.sort();
        users
    }

    /// All of a user's memories, oldest first
    pub async fn user_memories(&self, user_id: &str) -> Vec<MemoryItem> {
        let stores = self.stores.read().await;
        let mut items: Vec<MemoryItem> = stores
            .get(user_id)
            .map(|store| store.items().cloned().collect())
            .unwrap_or_default();
        items.sort_by_key(|item| item.created_at);
        items
    }

    pub async fn get(&self, user_id: &str, id: &str) -> Option<MemoryItem> {
        self.stores.read().await.get(user_id)?.get(id).cloned()
    }

    /// Partition counts and extracted facts, preferences, and skills
    pub async fn profile(&self, user_id: &str) -> Option<UserMemoryProfile> {
        let stores = self.stores.read().await;
        let store = stores.get(user_id)?;
        Some(UserMemoryProfile {
            user_id: user_id.to_string(),
            short_term_count: store.short_term.len(),
            long_term_count: store.long_term.len(),
            facts: store.facts.values().cloned().collect(),
            preferences: store.preferences.values().cloned().collect(),
            skills: store.skills.values().cloned().collect(),
            last_consolidated: store.last_consolidated,
        })
    }

    pub async fn forget(&self, user_id: &str, id: &str) -> Result<()> {
        self.stores
            .write()
            .await
            .get_mut(user_id)
            .and_then(|store| store.remove(id))
            .map(|_| ())
            .ok_or_else(|| CoreError::NotFound(format!("memory {} for user {}", id, user_id)))
    }

    /// Drop everything for a user, returning how many items were removed
    pub async fn clear_user(&self, user_id: &str) -> usize {
        self.stores
            .write()
            .await
            .remove(user_id)
            .map(|store| store.len())
            .unwrap_or(0)
    }

    pub fn spawn_consolidation(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.consolidation_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Memory consolidation task stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.consolidate_all().await;
                    }
                }
            }
        })
    }

    pub fn spawn_cleanup(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.cleanup_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Memory cleanup task stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.cleanup(Utc::now()).await;
                    }
                }
            }
        })
    }
}

/// Narrow the scan through the index; `None` means every item
fn candidate_ids(index: &MemoryIndex, query: &MemoryQuery, now: DateTime<Utc>) -> Option<HashSet<String>> {
    let mut sets: Vec<HashSet<String>> = Vec::new();
    if !query.types.is_empty() {
        sets.push(index.with_any_type(&query.types));
    }
    if !query.tags.is_empty() {
        sets.push(index.with_any_tag(&query.tags));
    }
    if let Some(min) = query.min_importance {
        sets.push(index.with_importance_at_least(min));
    }
    if let Some(max_age) = query.max_age {
        sets.push(index.created_since((now - max_age).date_naive()));
    }

    let mut sets = sets.into_iter();
    let first = sets.next()?;
    Some(sets.fold(first, |acc, set| acc.intersection(&set).cloned().collect()))
}

fn build_insight(user_id: &str, members: &[&MemoryItem], summary: String, threshold: f64) -> MemoryItem {
    let max_importance = members.iter().map(|m| m.importance).fold(0.0, f64::max);
    let importance = (max_importance + 0.1).max(threshold).min(1.0);

    let tags: BTreeSet<String> = members.iter().flat_map(|m| m.tags.iter().cloned()).collect();
    let vectors: Vec<&[f32]> = members.iter().filter_map(|m| m.embedding.as_deref()).collect();
    let source_ids: Vec<&str> = members.iter().map(|m| m.id.as_str()).collect();

    let mut insight = NewMemory::new(user_id, summary, MemoryType::Insight).with_tags(tags);
    insight.source = MemorySource::Consolidation;
    insight
        .metadata
        .insert("source_ids".to_string(), source_ids.join(","));

    let mut item = insight.into_item(importance, centroid(&vectors), Utc::now());
    item.consolidated = true;
    item
}

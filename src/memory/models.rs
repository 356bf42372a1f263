//! Memory data model

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Kind of memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryType {
    Conversation,
    Fact,
    Preference,
    Skill,
    Goal,
    Experience,
    Context,
    Insight,
}

impl MemoryType {
    /// Starting importance before content heuristics
    pub fn base_importance(&self) -> f64 {
        match self {
            MemoryType::Fact => 0.7,
            MemoryType::Preference => 0.6,
            MemoryType::Skill => 0.8,
            MemoryType::Goal => 0.9,
            MemoryType::Insight => 0.8,
            MemoryType::Conversation
            | MemoryType::Experience
            | MemoryType::Context => 0.4,
        }
    }
}

/// Where a memory came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemorySource {
    Conversation,
    User,
    System,
    Consolidation,
}

impl Default for MemorySource {
    fn default() -> Self {
        MemorySource::Conversation
    }
}

/// A stored memory. Content never changes after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryItem {
    pub id: String,
    pub user_id: String,
    pub session_id: Option<String>,
    pub content: String,
    pub summary: Option<String>,
    pub memory_type: MemoryType,
    pub source: MemorySource,
    pub importance: f64,
    pub freshness: f64,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u64,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub consolidated: bool,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl MemoryItem {
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.created_at
    }

    /// Importance plus recency, usage, and freshness bonuses, capped at 1.0
    pub fn relevance(&self, now: DateTime<Utc>) -> f64 {
        let age = self.age(now);
        let recency = if age < Duration::hours(24) {
            0.2
        } else if age < Duration::days(7) {
            0.1
        } else {
            0.0
        };
        let usage = if self.access_count > 5 { 0.1 } else { 0.0 };

        (self.importance + recency + usage + self.freshness * 0.1).min(1.0)
    }

    /// Case-insensitive tag match
    pub fn has_tag(&self, tag: &str) -> bool {
        let tag = normalize_tag(tag);
        self.tags.iter().any(|t| normalize_tag(t) == tag)
    }
}

/// Tags compare case-insensitively; they are stored trimmed and lowercased
pub fn normalize_tag(tag: &str) -> String {
    tag.trim().to_lowercase()
}

fn normalize_tags(tags: Vec<String>) -> Vec<String> {
    let mut normalized: Vec<String> = Vec::with_capacity(tags.len());
    for tag in tags {
        let tag = normalize_tag(&tag);
        if !tag.is_empty() && !normalized.contains(&tag) {
            normalized.push(tag);
        }
    }
    normalized
}

/// Input for storing a memory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMemory {
    pub user_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    pub content: String,
    pub memory_type: MemoryType,
    /// Computed from content when absent
    #[serde(default)]
    pub importance: Option<f64>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub source: MemorySource,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl NewMemory {
    pub fn new(user_id: impl Into<String>, content: impl Into<String>, memory_type: MemoryType) -> Self {
        Self {
            user_id: user_id.into(),
            session_id: None,
            content: content.into(),
            memory_type,
            importance: None,
            tags: Vec::new(),
            source: MemorySource::default(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_importance(mut self, importance: f64) -> Self {
        self.importance = Some(importance);
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = normalize_tags(tags.into_iter().map(Into::into).collect());
        self
    }

    pub(crate) fn into_item(self, importance: f64, embedding: Option<Vec<f32>>, now: DateTime<Utc>) -> MemoryItem {
        MemoryItem {
            id: Uuid::new_v4().to_string(),
            user_id: self.user_id,
            session_id: self.session_id,
            content: self.content,
            summary: None,
            memory_type: self.memory_type,
            source: self.source,
            importance,
            freshness: 1.0,
            created_at: now,
            last_accessed: now,
            access_count: 0,
            tags: normalize_tags(self.tags),
            embedding,
            consolidated: false,
            metadata: self.metadata,
        }
    }
}

/// Retrieval filters and ranking inputs
#[derive(Debug, Clone, Default)]
pub struct MemoryQuery {
    pub user_id: String,
    /// Text compared against stored embeddings; empty skips similarity
    pub query: String,
    /// Empty means every type
    pub types: Vec<MemoryType>,
    pub min_importance: Option<f64>,
    pub max_age: Option<Duration>,
    /// Items must share at least one tag when non-empty
    pub tags: Vec<String>,
    pub similarity_threshold: f32,
    pub limit: usize,
}

impl MemoryQuery {
    pub fn new(user_id: impl Into<String>, query: impl Into<String>, limit: usize) -> Self {
        Self {
            user_id: user_id.into(),
            query: query.into(),
            limit,
            ..Default::default()
        }
    }
}

/// A ranked retrieval hit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryResult {
    pub item: MemoryItem,
    pub similarity: f32,
    pub relevance: f64,
    pub score: f64,
}

/// A fact extracted from a fact memory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactualMemory {
    pub fact: String,
    pub category: String,
    pub confidence: f64,
    pub last_updated: DateTime<Utc>,
    pub source: MemorySource,
    pub verified: bool,
}

/// A like or dislike; `strength` runs from -1.0 (dislike) to 1.0
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preference {
    pub category: String,
    pub preference: String,
    pub strength: f64,
    pub last_updated: DateTime<Utc>,
}

/// A skill with an inferred level
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Skill {
    pub name: String,
    pub level: String,
    pub confidence: f64,
    pub last_used: DateTime<Utc>,
    pub context: Vec<String>,
}

/// Read-only summary of one user's memories
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserMemoryProfile {
    pub user_id: String,
    pub short_term_count: usize,
    pub long_term_count: usize,
    pub facts: Vec<FactualMemory>,
    pub preferences: Vec<Preference>,
    pub skills: Vec<Skill>,
    pub last_consolidated: Option<DateTime<Utc>>,
}

/// Result of one cleanup pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub refreshed: usize,
    pub pruned: usize,
}

//! Scoring, extraction, and clustering rules for memories

use super::embedding::cosine_similarity;
use super::models::{FactualMemory, MemoryItem, MemoryType, NewMemory, Preference, Skill};
use chrono::{DateTime, Utc};

const IMPORTANCE_KEYWORDS: [&str; 8] = [
    "important", "remember", "always", "never", "love", "hate", "goal", "project",
];

/// Content-based importance for a new memory, in `[0.0, 1.0]`.
///
/// Starts from the type's base value, then adds 0.1 per keyword present,
/// 0.2 for a question, and 0.1 for content longer than 100 characters.
pub fn score_importance(content: &str, memory_type: MemoryType) -> f64 {
    let lowered = content.to_lowercase();
    let mut score = memory_type.base_importance();

    score += 0.1 * IMPORTANCE_KEYWORDS
        .iter()
        .filter(|k| lowered.contains(*k))
        .count() as f64;
    if content.contains('?') {
        score += 0.2;
    }
    if content.chars().count() > 100 {
        score += 0.1;
    }
    score.min(1.0)
}

/// Importance for `memory`, honoring an explicit value when given
pub fn resolve_importance(memory: &NewMemory) -> f64 {
    match memory.importance {
        Some(value) => value.clamp(0.0, 1.0),
        None => score_importance(&memory.content, memory.memory_type),
    }
}

/// Exponential freshness decay by age with a bonus for recent access
pub fn freshness(item: &MemoryItem, now: DateTime<Utc>, half_life_days: f64) -> f64 {
    let age_days = (now - item.created_at).num_seconds().max(0) as f64 / 86_400.0;
    let half_life = half_life_days.max(f64::EPSILON);
    let mut value = 0.5f64.powf(age_days / half_life);
    if now - item.last_accessed < chrono::Duration::hours(24) {
        value += 0.2;
    }
    value.min(1.0)
}

fn category(item: &MemoryItem) -> String {
    item.metadata
        .get("category")
        .cloned()
        .or_else(|| item.tags.first().cloned())
        .unwrap_or_else(|| "general".to_string())
}

pub fn extract_fact(item: &MemoryItem) -> FactualMemory {
    FactualMemory {
        fact: item.content.clone(),
        category: category(item),
        confidence: item.importance,
        last_updated: item.created_at,
        source: item.source,
        verified: item.metadata.get("verified").map(|v| v == "true").unwrap_or(false),
    }
}

const NEGATIVE_MARKERS: [&str; 6] = ["dislike", "hate", "don't like", "do not like", "never", "avoid"];
const STRONG_MARKERS: [&str; 4] = ["love", "hate", "always", "never"];

/// Negative wording flips the sign; strong wording raises the magnitude
pub fn extract_preference(item: &MemoryItem) -> Preference {
    let lowered = item.content.to_lowercase();
    let magnitude = if STRONG_MARKERS.iter().any(|m| lowered.contains(m)) {
        0.9
    } else {
        0.5
    };
    let strength = if NEGATIVE_MARKERS.iter().any(|m| lowered.contains(m)) {
        -magnitude
    } else {
        magnitude
    };

    Preference {
        category: category(item),
        preference: item.content.clone(),
        strength,
        last_updated: item.created_at,
    }
}

pub fn extract_skill(item: &MemoryItem) -> Skill {
    let lowered = item.content.to_lowercase();
    let level = if lowered.contains("expert") || lowered.contains("master") {
        "expert"
    } else if lowered.contains("advanced") || lowered.contains("years") {
        "advanced"
    } else if lowered.contains("beginner") || lowered.contains("learning") || lowered.contains("new to") {
        "beginner"
    } else {
        "intermediate"
    };

    let name = item
        .metadata
        .get("skill")
        .cloned()
        .or_else(|| item.tags.first().cloned())
        .unwrap_or_else(|| item.content.split_whitespace().take(4).collect::<Vec<_>>().join(" "));

    Skill {
        name,
        level: level.to_string(),
        confidence: item.importance,
        last_used: item.created_at,
        context: item.session_id.iter().cloned().collect(),
    }
}

/// Groups memories for consolidation
pub trait Clusterer: Send + Sync {
    /// Index groups into `items`; each group has at least the minimum size
    fn cluster(&self, items: &[MemoryItem]) -> Vec<Vec<usize>>;
}

/// Connects memories whose embeddings meet a cosine threshold and returns
/// the connected components large enough to consolidate.
pub struct SimilarityClusterer {
    threshold: f32,
    min_size: usize,
}

impl SimilarityClusterer {
    pub fn new(threshold: f32, min_size: usize) -> Self {
        Self {
            threshold,
            min_size: min_size.max(2),
        }
    }
}

impl Clusterer for SimilarityClusterer {
    fn cluster(&self, items: &[MemoryItem]) -> Vec<Vec<usize>> {
        let n = items.len();
        let mut parent: Vec<usize> = (0..n).collect();

        fn find(parent: &mut [usize], i: usize) -> usize {
            if parent[i] != i {
                parent[i] = find(parent, parent[i]);
            }
            parent[i]
        }

        for i in 0..n {
            let Some(a) = items[i].embedding.as_deref() else {
                continue;
            };
            for j in (i + 1)..n {
                let Some(b) = items[j].embedding.as_deref() else {
                    continue;
                };
                if cosine_similarity(a, b) >= self.threshold {
                    let (pi, pj) = (find(&mut parent, i), find(&mut parent, j));
                    if pi != pj {
                        parent[pi] = pj;
                    }
                }
            }
        }

        let mut groups: std::collections::BTreeMap<usize, Vec<usize>> = Default::default();
        for i in 0..n {
            let root = find(&mut parent, i);
            groups.entry(root).or_default().push(i);
        }

        groups
            .into_values()
            .filter(|g| g.len() >= self.min_size)
            .collect()
    }
}

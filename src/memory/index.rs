//! Secondary indexes over one user's memories

use super::models::{normalize_tag, MemoryItem, MemoryType};
use chrono::NaiveDate;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Tag, type, day, and importance lookups by memory id.
///
/// Kept in step with the store on every insert and removal.
#[derive(Debug, Default, Clone)]
pub struct MemoryIndex {
    by_tag: HashMap<String, HashSet<String>>,
    by_type: HashMap<MemoryType, HashSet<String>>,
    by_day: BTreeMap<NaiveDate, HashSet<String>>,
    /// Importance in tenths, 0..=10
    by_importance: BTreeMap<u8, HashSet<String>>,
}

fn bucket(importance: f64) -> u8 {
    (importance.clamp(0.0, 1.0) * 10.0).floor() as u8
}

impl MemoryIndex {
    pub fn insert(&mut self, item: &MemoryItem) {
        for tag in &item.tags {
            self.by_tag.entry(normalize_tag(tag)).or_default().insert(item.id.clone());
        }
        self.by_type
            .entry(item.memory_type)
            .or_default()
            .insert(item.id.clone());
        self.by_day
            .entry(item.created_at.date_naive())
            .or_default()
            .insert(item.id.clone());
        self.by_importance
            .entry(bucket(item.importance))
            .or_default()
            .insert(item.id.clone());
    }

    pub fn remove(&mut self, item: &MemoryItem) {
        for tag in &item.tags {
            remove_hashed(&mut self.by_tag, &normalize_tag(tag), &item.id);
        }
        remove_hashed(&mut self.by_type, &item.memory_type, &item.id);
        remove_ordered(&mut self.by_day, &item.created_at.date_naive(), &item.id);
        remove_ordered(&mut self.by_importance, &bucket(item.importance), &item.id);
    }

    /// Ids carrying any of `tags`
    pub fn with_any_tag(&self, tags: &[String]) -> HashSet<String> {
        tags.iter()
            .filter_map(|t| self.by_tag.get(&normalize_tag(t)))
            .flat_map(|ids| ids.iter().cloned())
            .collect()
    }

    /// Ids of any of `types`
    pub fn with_any_type(&self, types: &[MemoryType]) -> HashSet<String> {
        types
            .iter()
            .filter_map(|t| self.by_type.get(t))
            .flat_map(|ids| ids.iter().cloned())
            .collect()
    }

    /// Ids whose importance bucket could meet `min`; callers still check exact values
    pub fn with_importance_at_least(&self, min: f64) -> HashSet<String> {
        self.by_importance
            .range(bucket(min)..)
            .flat_map(|(_, ids)| ids.iter().cloned())
            .collect()
    }

    /// Ids created on or after `day`
    pub fn created_since(&self, day: NaiveDate) -> HashSet<String> {
        self.by_day
            .range(day..)
            .flat_map(|(_, ids)| ids.iter().cloned())
            .collect()
    }

    pub fn tag_counts(&self) -> BTreeMap<String, usize> {
        self.by_tag
            .iter()
            .map(|(tag, ids)| (tag.clone(), ids.len()))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }
}

fn remove_hashed<K: std::hash::Hash + Eq>(map: &mut HashMap<K, HashSet<String>>, key: &K, id: &str) {
    if let Some(ids) = map.get_mut(key) {
        ids.remove(id);
        if ids.is_empty() {
            map.remove(key);
        }
    }
}

fn remove_ordered<K: Ord>(map: &mut BTreeMap<K, HashSet<String>>, key: &K, id: &str) {
    if let Some(ids) = map.get_mut(key) {
        ids.remove(id);
        if ids.is_empty() {
            map.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::models::NewMemory;
    use chrono::Utc;

    fn item(memory_type: MemoryType, importance: f64, tags: &[&str]) -> MemoryItem {
        NewMemory::new("u1", "content", memory_type)
            .with_tags(tags.iter().copied())
            .into_item(importance, None, Utc::now())
    }

    #[test]
    fn test_insert_and_lookup() {
        let mut index = MemoryIndex::default();
        let a = item(MemoryType::Fact, 0.75, &["rust", "work"]);
        let b = item(MemoryType::Preference, 0.3, &["food"]);
        index.insert(&a);
        index.insert(&b);

        assert_eq!(index.with_any_tag(&["rust".to_string()]), HashSet::from([a.id.clone()]));
        assert_eq!(index.with_any_type(&[MemoryType::Preference]), HashSet::from([b.id.clone()]));
        assert_eq!(index.with_importance_at_least(0.7), HashSet::from([a.id.clone()]));
        assert_eq!(index.created_since(Utc::now().date_naive()).len(), 2);
    }

    #[test]
    fn test_remove_cleans_empty_entries() {
        let mut index = MemoryIndex::default();
        let a = item(MemoryType::Fact, 0.5, &["rust"]);
        index.insert(&a);
        index.remove(&a);

        assert!(index.is_empty());
        assert!(index.tag_counts().is_empty());
        assert!(index.with_any_tag(&["rust".to_string()]).is_empty());
    }
}

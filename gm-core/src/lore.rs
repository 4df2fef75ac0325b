//! Lore retrieval.
//!
//! The engine talks to lore through [`LoreService`]. [`KeywordLore`] is a
//! small keyword index good enough for local play and tests; a hybrid
//! vector retriever can sit behind the same trait.

use crate::lang::Language;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum LoreError {
    #[error("lore backend unavailable: {0}")]
    Unavailable(String),
    #[error("failed to read lore file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid lore data: {0}")]
    Parse(#[from] serde_json::Error),
}

/// A lore lookup issued by the Game Master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoreQuery {
    pub query: String,
    /// The player input that led to the lookup.
    pub context: Option<String>,
    pub world_pack_id: String,
    pub current_location: String,
    pub current_region: Option<String>,
    pub language: Language,
}

/// Lore retrieval backend. Calls must be idempotent.
#[async_trait]
pub trait LoreService: Send + Sync {
    /// Return matching lore as text; an empty string means nothing matched.
    async fn search(&self, query: &LoreQuery) -> Result<String, LoreError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoreEntry {
    pub title: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    pub content: String,
    /// Entries tied to a region rank higher when the player is there.
    #[serde(default)]
    pub region: Option<String>,
}

/// In-memory keyword index.
#[derive(Debug, Clone, Default)]
pub struct KeywordLore {
    entries: Vec<LoreEntry>,
    max_results: usize,
}

impl KeywordLore {
    pub fn new(entries: Vec<LoreEntry>) -> Self {
        Self {
            entries,
            max_results: 3,
        }
    }

    pub fn with_max_results(mut self, n: usize) -> Self {
        self.max_results = n.max(1);
        self
    }

    pub fn from_json(json: &str) -> Result<Self, LoreError> {
        let entries: Vec<LoreEntry> = serde_json::from_str(json)?;
        Ok(Self::new(entries))
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, LoreError> {
        let json = tokio::fs::read_to_string(path).await?;
        Self::from_json(&json)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn score(entry: &LoreEntry, query: &str, region: Option<&str>) -> usize {
        let mut score = entry
            .keywords
            .iter()
            .filter(|k| !k.is_empty() && query.contains(&k.to_lowercase()))
            .count()
            * 2;

        score += entry
            .title
            .to_lowercase()
            .split_whitespace()
            .filter(|word| word.chars().count() > 2 && query.contains(word))
            .count();

        if score > 0 && region.is_some() && entry.region.as_deref() == region {
            score += 1;
        }
        score
    }
}

#[async_trait]
impl LoreService for KeywordLore {
    async fn search(&self, query: &LoreQuery) -> Result<String, LoreError> {
        let haystack = query.query.to_lowercase();
        let region = query.current_region.as_deref();

        let mut scored: Vec<(usize, &LoreEntry)> = self
            .entries
            .iter()
            .map(|entry| (Self::score(entry, &haystack, region), entry))
            .filter(|(score, _)| *score > 0)
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0));

        debug!(query = %query.query, matches = scored.len(), "Keyword lore search");

        Ok(scored
            .into_iter()
            .take(self.max_results)
            .map(|(_, entry)| format!("## {}\n{}", entry.title, entry.content))
            .collect::<Vec<_>>()
            .join("\n\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(text: &str) -> LoreQuery {
        LoreQuery {
            query: text.to_string(),
            context: None,
            world_pack_id: "border-keep".to_string(),
            current_location: "Keep Gate".to_string(),
            current_region: Some("Northern Marches".to_string()),
            language: Language::En,
        }
    }

    fn index() -> KeywordLore {
        KeywordLore::from_json(
            r#"[
                {"title": "The Smugglers", "keywords": ["smuggler", "contraband"], "content": "They use the old tunnels."},
                {"title": "Keep History", "keywords": ["keep", "siege"], "content": "The keep fell once.", "region": "Northern Marches"},
                {"title": "Southern Sea", "keywords": ["sea"], "content": "Far away."}
            ]"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_search_ranks_matches() {
        let result = index().search(&query("Who are the smugglers near the keep?")).await.unwrap();
        assert!(result.contains("The Smugglers"));
        assert!(result.contains("Keep History"));
        assert!(!result.contains("Southern Sea"));
    }

    #[tokio::test]
    async fn test_no_match_is_empty() {
        let result = index().search(&query("dragons")).await.unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn test_max_results() {
        let lore = index().with_max_results(1);
        let result = lore.search(&query("smuggler siege keep")).await.unwrap();
        assert_eq!(result.matches("## ").count(), 1);
    }
}

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use banter_core::domain::conversation::UserId;

const MAX_RECALLED_SNIPPETS: usize = 5;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("memory backend failure: {0}")]
    Backend(String),
}

/// Long-lived per-user memory, consulted when a turn starts and written to in
/// the background after it completes. Retrieval failures degrade the prompt,
/// never the turn.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn retrieve(&self, user_id: &UserId, query: &str) -> Result<Vec<String>, MemoryError>;

    async fn store(&self, user_id: &UserId, snippet: &str) -> Result<(), MemoryError>;
}

/// Memory disabled: recalls nothing, stores nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopMemoryStore;

#[async_trait]
impl MemoryStore for NoopMemoryStore {
    async fn retrieve(&self, _user_id: &UserId, _query: &str) -> Result<Vec<String>, MemoryError> {
        Ok(Vec::new())
    }

    async fn store(&self, _user_id: &UserId, _snippet: &str) -> Result<(), MemoryError> {
        Ok(())
    }
}

/// Process-local store with word-overlap recall. Enough for single-node
/// deployments and tests; swap in an embedding-backed store for anything
/// bigger.
#[derive(Default)]
pub struct InMemoryMemoryStore {
    entries: RwLock<HashMap<String, Vec<String>>>,
}

#[async_trait]
impl MemoryStore for InMemoryMemoryStore {
    async fn retrieve(&self, user_id: &UserId, query: &str) -> Result<Vec<String>, MemoryError> {
        let entries = self.entries.read().await;
        let Some(snippets) = entries.get(&user_id.0) else {
            return Ok(Vec::new());
        };

        let query_words = significant_words(query);
        if query_words.is_empty() {
            return Ok(Vec::new());
        }

        let mut recalled: Vec<String> = snippets
            .iter()
            .rev()
            .filter(|snippet| {
                let snippet_words = significant_words(snippet);
                query_words.iter().any(|word| snippet_words.contains(word))
            })
            .take(MAX_RECALLED_SNIPPETS)
            .cloned()
            .collect();
        recalled.reverse();

        Ok(recalled)
    }

    async fn store(&self, user_id: &UserId, snippet: &str) -> Result<(), MemoryError> {
        let trimmed = snippet.trim();
        if trimmed.is_empty() {
            return Ok(());
        }

        let mut entries = self.entries.write().await;
        entries.entry(user_id.0.clone()).or_default().push(trimmed.to_string());
        Ok(())
    }
}

fn significant_words(text: &str) -> Vec<String> {
    text.split(|ch: char| !ch.is_alphanumeric())
        .filter(|word| word.len() > 2)
        .map(str::to_ascii_lowercase)
        .collect()
}

/// Renders recalled snippets as the bulleted block injected into the system
/// prompt.
pub fn format_memory_block(snippets: &[String]) -> String {
    if snippets.is_empty() {
        return "No relevant memory found.".to_string();
    }

    snippets.iter().map(|snippet| format!("* {snippet}")).collect::<Vec<_>>().join("\n")
}

#[cfg(test)]
mod tests {
    use banter_core::domain::conversation::UserId;

    use super::{format_memory_block, InMemoryMemoryStore, MemoryStore, NoopMemoryStore};

    fn user() -> UserId {
        UserId("user-1".to_string())
    }

    #[tokio::test]
    async fn in_memory_store_recalls_overlapping_snippets() {
        let store = InMemoryMemoryStore::default();
        store.store(&user(), "The user lives in Paris.").await.expect("store");
        store.store(&user(), "Prefers metric units.").await.expect("store");

        let recalled = store.retrieve(&user(), "what is the weather in Paris?").await.expect("retrieve");

        assert_eq!(recalled, vec!["The user lives in Paris.".to_string()]);
    }

    #[tokio::test]
    async fn in_memory_store_isolates_users() {
        let store = InMemoryMemoryStore::default();
        store.store(&user(), "Allergic to peanuts.").await.expect("store");

        let other = UserId("user-2".to_string());
        let recalled = store.retrieve(&other, "peanuts").await.expect("retrieve");

        assert!(recalled.is_empty());
    }

    #[tokio::test]
    async fn noop_store_recalls_nothing() {
        let store = NoopMemoryStore;
        store.store(&user(), "anything").await.expect("store");

        let recalled = store.retrieve(&user(), "anything").await.expect("retrieve");
        assert!(recalled.is_empty());
    }

    #[test]
    fn memory_block_renders_bullets_or_fallback() {
        let block = format_memory_block(&[
            "The user lives in Paris.".to_string(),
            "Prefers metric units.".to_string(),
        ]);
        assert_eq!(block, "* The user lives in Paris.\n* Prefers metric units.");

        assert_eq!(format_memory_block(&[]), "No relevant memory found.");
    }
}

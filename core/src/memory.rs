//! Per-agent memory store
//!
//! Append-only notes with relevance-ranked recall and a token-budgeted
//! context-window assembler. A note can be promoted into a cross-agent
//! shared pool.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Owner id used for entries promoted into the shared pool
pub const SHARED_POOL: &str = "workspace";

const TITLE_PREFIX_LEN: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryScope {
    Personal,
    Workspace,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: String,
    pub agent_id: String,
    pub title: String,
    pub content: String,
    pub category: String,
    /// Estimated token cost: ceil(len / 4)
    pub tokens: usize,
    pub pinned: bool,
    pub access_count: u64,
    pub scope: MemoryScope,
    pub created_at: DateTime<Utc>,
}

impl MemoryEntry {
    /// Context-window line for this entry
    fn render(&self) -> String {
        format!("[{}] {}: {}", self.category, self.title, self.content)
    }
}

#[derive(Default)]
struct MemoryInner {
    entries: Vec<MemoryEntry>,
    shared: Vec<MemoryEntry>,
}

/// Shared memory store; personal entries are scoped per agent, the shared
/// pool is visible to everyone.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a note for an agent. The title defaults to the first 50
    /// characters of the content.
    pub fn remember(
        &self,
        agent_id: &str,
        content: &str,
        category: &str,
        title: Option<&str>,
    ) -> MemoryEntry {
        let title = title
            .map(str::to_string)
            .unwrap_or_else(|| content.chars().take(TITLE_PREFIX_LEN).collect());

        let entry = MemoryEntry {
            id: Uuid::new_v4().to_string(),
            agent_id: agent_id.to_string(),
            title,
            content: content.to_string(),
            category: category.to_string(),
            tokens: estimate_tokens(content),
            pinned: false,
            access_count: 0,
            scope: MemoryScope::Personal,
            created_at: Utc::now(),
        };

        self.inner.lock().entries.push(entry.clone());
        entry
    }

    /// Relevance-ranked recall over the agent's notes plus the shared pool.
    ///
    /// Term-frequency scoring normalized by note length; no corpus-wide IDF,
    /// so adding unrelated notes never re-ranks existing matches. Only
    /// non-zero scores are returned, ties broken by insertion order.
    pub fn recall(&self, agent_id: &str, query: &str, limit: usize) -> Vec<MemoryEntry> {
        let terms: Vec<String> = query
            .to_lowercase()
            .split_whitespace()
            .map(str::to_string)
            .collect();
        if terms.is_empty() {
            return Vec::new();
        }

        let mut inner = self.inner.lock();
        let mut scored: Vec<(f64, usize, bool)> = Vec::new();

        {
            let candidates = inner
                .entries
                .iter()
                .enumerate()
                .filter(|(_, e)| e.agent_id == agent_id)
                .map(|(i, e)| (i, e, false))
                .chain(inner.shared.iter().enumerate().map(|(i, e)| (i, e, true)));

            for (index, entry, shared) in candidates {
                let score = score_entry(entry, &terms);
                if score > 0.0 {
                    scored.push((score, index, shared));
                }
            }
        }

        // Stable sort keeps insertion order among equal scores
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);

        let mut results = Vec::with_capacity(scored.len());
        for (_, index, shared) in scored {
            let entry = if shared {
                &mut inner.shared[index]
            } else {
                &mut inner.entries[index]
            };
            entry.access_count += 1;
            results.push(entry.clone());
        }
        results
    }

    /// Greedy token-budgeted context assembly: pinned notes first, then by
    /// descending access count. A line that alone exceeds the remaining
    /// budget is skipped, not truncated.
    pub fn context_window(&self, agent_id: &str, token_budget: usize) -> String {
        let inner = self.inner.lock();
        let mut candidates: Vec<&MemoryEntry> = inner
            .entries
            .iter()
            .filter(|e| e.agent_id == agent_id)
            .chain(inner.shared.iter())
            .collect();

        // Pinned first; within each group, most-accessed first
        candidates.sort_by(|a, b| {
            b.pinned
                .cmp(&a.pinned)
                .then(b.access_count.cmp(&a.access_count))
        });

        let mut lines = Vec::new();
        let mut remaining = token_budget;
        for entry in candidates {
            let line = entry.render();
            let cost = estimate_tokens(&line);
            if cost > remaining {
                continue;
            }
            remaining -= cost;
            lines.push(line);
        }
        lines.join("\n")
    }

    /// Copy a note into the shared pool with workspace scope. No-op for an
    /// unknown id.
    pub fn share_insight(&self, agent_id: &str, memory_id: &str) {
        let mut inner = self.inner.lock();
        let Some(source) = inner
            .entries
            .iter()
            .find(|e| e.agent_id == agent_id && e.id == memory_id)
        else {
            return;
        };

        let mut shared = source.clone();
        shared.id = Uuid::new_v4().to_string();
        shared.agent_id = SHARED_POOL.to_string();
        shared.scope = MemoryScope::Workspace;
        inner.shared.push(shared);
    }

    pub fn pin(&self, agent_id: &str, memory_id: &str) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner
            .entries
            .iter_mut()
            .find(|e| e.agent_id == agent_id && e.id == memory_id)
        {
            entry.pinned = true;
        }
    }

    pub fn delete(&self, agent_id: &str, memory_id: &str) {
        self.inner
            .lock()
            .entries
            .retain(|e| !(e.agent_id == agent_id && e.id == memory_id));
    }

    pub fn clear_agent(&self, agent_id: &str) {
        self.inner.lock().entries.retain(|e| e.agent_id != agent_id);
    }

    /// Drop oldest unpinned entries beyond `max_entries`. Invoked
    /// opportunistically from the Observe phase.
    pub fn prune(&self, agent_id: &str, max_entries: usize) -> usize {
        let mut inner = self.inner.lock();
        let count = inner
            .entries
            .iter()
            .filter(|e| e.agent_id == agent_id)
            .count();
        if count <= max_entries {
            return 0;
        }

        let mut to_drop = count - max_entries;
        let mut dropped = 0;
        inner.entries.retain(|e| {
            if to_drop > 0 && e.agent_id == agent_id && !e.pinned {
                to_drop -= 1;
                dropped += 1;
                false
            } else {
                true
            }
        });
        dropped
    }

    pub fn count(&self, agent_id: &str) -> usize {
        self.inner
            .lock()
            .entries
            .iter()
            .filter(|e| e.agent_id == agent_id)
            .count()
    }
}

fn score_entry(entry: &MemoryEntry, terms: &[String]) -> f64 {
    let text = format!("{} {}", entry.title, entry.content).to_lowercase();
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() {
        return 0.0;
    }

    let mut score = 0.0;
    for term in terms {
        let occurrences = words
            .iter()
            .filter(|w| w.trim_matches(|c: char| !c.is_alphanumeric()) == term)
            .count();
        // Frequency weighted by inverse note length
        score += occurrences as f64 / words.len() as f64;
    }
    score
}

//! Typed entity store with per-type retention and search (C3).
//!
//! Backed by a `DashMap` keyed by entity id, matching the teacher's
//! `cortex-memory` working-memory module. Expired entities are evicted
//! lazily on `retrieve`/`search`/`stats` rather than on a timer, since this
//! crate has no background scheduler of its own.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::atomic::{self, StructuredFormat, WriteOptions};
use crate::error::MemoryError;

/// A stored entity: content plus retention metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntity {
    /// Caller-defined type tag (e.g. `"agent-output"`, `"context-package"`).
    pub entity_type: String,
    /// Unique id within the store.
    pub entity_id: String,
    /// Free-form textual content.
    pub content: String,
    /// Free-form metadata attached at store time.
    pub metadata: HashMap<String, Value>,
    /// When the entity was stored.
    pub created_at: DateTime<Utc>,
    /// When the entity should be considered expired; `None` means
    /// indefinite retention.
    pub expires_at: Option<DateTime<Utc>>,
}

impl MemoryEntity {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(t) if t < now)
    }
}

/// Retention policy for a given entity type, in days. `None` means the
/// entity never expires.
fn retention_days(entity_type: &str) -> Option<i64> {
    match entity_type {
        "agent-output" => Some(30),
        "context-package" => Some(7),
        "documentation" => None,
        "workflow-state" => Some(14),
        "security-audit" => Some(90),
        "deployment-evidence" => Some(90),
        "todo-context" => Some(365),
        _ => Some(30),
    }
}

/// Query parameters for [`MemoryStore::search`].
#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    /// Restrict to entities of this type.
    pub entity_type: Option<String>,
    /// Case-insensitive substring match against `content`.
    pub content_substring: Option<String>,
    /// Exact match against named metadata keys.
    pub metadata_filter: HashMap<String, Value>,
    /// Maximum number of results.
    pub limit: usize,
}

impl SearchQuery {
    /// Builds a default query with the spec's `limit=100` default.
    pub fn new() -> Self {
        Self {
            limit: 100,
            ..Default::default()
        }
    }
}

/// Aggregate statistics over the store's current (non-expired) contents.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    /// Count of entities per type.
    pub count_by_type: HashMap<String, usize>,
    /// Approximate total content bytes across all entities.
    pub total_bytes: usize,
    /// Retention policy in days per known entity type (`None` = indefinite).
    pub retention_policies: HashMap<String, Option<i64>>,
}

/// In-process typed entity store.
pub struct MemoryStore {
    entities: DashMap<String, MemoryEntity>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            entities: DashMap::new(),
        }
    }

    /// Stores (or overwrites) an entity, computing `expires_at` from the
    /// type's retention policy.
    pub fn store(
        &self,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        content: impl Into<String>,
        metadata: HashMap<String, Value>,
    ) -> bool {
        let entity_type = entity_type.into();
        let entity_id = entity_id.into();
        let now = Utc::now();
        let expires_at = retention_days(&entity_type).map(|days| now + Duration::days(days));

        self.entities.insert(
            entity_id.clone(),
            MemoryEntity {
                entity_type,
                entity_id,
                content: content.into(),
                metadata,
                created_at: now,
                expires_at,
            },
        );
        true
    }

    /// Retrieves an entity by id, treating expired entities as absent and
    /// evicting them lazily.
    pub fn retrieve(&self, id: &str) -> Option<MemoryEntity> {
        let now = Utc::now();
        match self.entities.get(id) {
            Some(entry) if entry.is_expired(now) => {
                drop(entry);
                self.entities.remove(id);
                None
            }
            Some(entry) => Some(entry.clone()),
            None => None,
        }
    }

    /// Searches stored entities with case-insensitive substring matching on
    /// content and exact matching on metadata keys.
    pub fn search(&self, query: &SearchQuery) -> Vec<MemoryEntity> {
        let now = Utc::now();
        let needle = query.content_substring.as_ref().map(|s| s.to_lowercase());

        let mut expired_ids = Vec::new();
        let mut results = Vec::new();

        for entry in self.entities.iter() {
            let entity = entry.value();
            if entity.is_expired(now) {
                expired_ids.push(entity.entity_id.clone());
                continue;
            }
            if let Some(t) = &query.entity_type {
                if &entity.entity_type != t {
                    continue;
                }
            }
            if let Some(needle) = &needle {
                if !entity.content.to_lowercase().contains(needle.as_str()) {
                    continue;
                }
            }
            let metadata_matches = query
                .metadata_filter
                .iter()
                .all(|(k, v)| entity.metadata.get(k) == Some(v));
            if !metadata_matches {
                continue;
            }
            results.push(entity.clone());
            if results.len() >= query.limit {
                break;
            }
        }

        for id in expired_ids {
            self.entities.remove(&id);
        }

        results
    }

    /// Evicts all currently-expired entities, returning how many were
    /// removed. A second call back-to-back always returns zero.
    pub fn cleanup(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<String> = self
            .entities
            .iter()
            .filter(|e| e.is_expired(now))
            .map(|e| e.entity_id.clone())
            .collect();

        for id in &expired {
            self.entities.remove(id);
        }

        if !expired.is_empty() {
            debug!(count = expired.len(), "evicted expired memory entities");
        }
        expired.len()
    }

    /// Returns aggregate statistics, excluding expired entities (which are
    /// evicted as a side effect).
    pub fn stats(&self) -> MemoryStats {
        self.cleanup();

        let mut count_by_type: HashMap<String, usize> = HashMap::new();
        let mut total_bytes = 0usize;
        let mut retention_policies: HashMap<String, Option<i64>> = HashMap::new();

        for entry in self.entities.iter() {
            let entity = entry.value();
            *count_by_type.entry(entity.entity_type.clone()).or_insert(0) += 1;
            total_bytes += entity.content.len();
            retention_policies
                .entry(entity.entity_type.clone())
                .or_insert_with(|| retention_days(&entity.entity_type));
        }

        MemoryStats {
            count_by_type,
            total_bytes,
            retention_policies,
        }
    }

    /// Persists the entire store to disk atomically, for cross-session
    /// continuity. Supplemental to spec.md, which names
    /// `enable_cross_session_continuity` without specifying a mechanism.
    pub async fn snapshot_to_disk(&self, path: impl AsRef<std::path::Path>) -> Result<(), MemoryError> {
        let snapshot: Vec<MemoryEntity> = self.entities.iter().map(|e| e.value().clone()).collect();
        atomic::write_structured(path, &snapshot, StructuredFormat::Json, WriteOptions::default())
            .await
            .map_err(MemoryError::from)
    }

    /// Restores entities previously written by [`Self::snapshot_to_disk`].
    pub async fn restore_from_disk(&self, path: impl AsRef<std::path::Path>) -> Result<usize, MemoryError> {
        let path = path.as_ref().to_path_buf();
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| MemoryError::Other(anyhow::anyhow!("failed to read snapshot {}: {e}", path.display())))?;
        let snapshot: Vec<MemoryEntity> = serde_json::from_slice(&bytes)
            .map_err(|e| MemoryError::Encode { id: path.display().to_string(), source: e })?;
        let count = snapshot.len();
        for entity in snapshot {
            self.entities.insert(entity.entity_id.clone(), entity);
        }
        Ok(count)
    }
}

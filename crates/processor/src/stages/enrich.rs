//! Enrichment stage
//!
//! Looks up extra fields for an event through a named
//! [`EnrichmentProvider`]. Every lookup goes through a per-enrichment TTL
//! cache; misses are cached as well so an unknown key does not hit the
//! provider on every event.

use crate::config::{EnrichmentDef, OnMissing};
use crate::error::{StageError, StageResult, ValidationError, ValidationResult};
use crate::stages::transform::insert_path;
use async_trait::async_trait;
use moka::sync::Cache;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use stream_analytics_types::Event;
use thiserror::Error;
use tracing::{debug, trace};

/// Enrichment lookup errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EnrichmentError {
    /// The provider has no entry for the key
    #[error("no entry for key '{0}'")]
    NotFound(String),

    /// The provider could not answer
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// Provider data could not be loaded or decoded
    #[error("invalid provider data: {0}")]
    InvalidData(String),
}

/// External lookup used by enrichments
#[async_trait]
pub trait EnrichmentProvider: Send + Sync {
    /// Look up `key`, returning the requested fields (all fields when empty)
    async fn lookup(&self, key: &str, fields: &[String]) -> Result<Map<String, Value>, EnrichmentError>;

    fn name(&self) -> &str;
}

/// In-memory lookup table
#[derive(Debug, Clone, Default)]
pub struct StaticLookupProvider {
    name: String,
    entries: HashMap<String, Map<String, Value>>,
}

impl StaticLookupProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: HashMap::new(),
        }
    }

    pub fn with_entry(mut self, key: impl Into<String>, fields: Map<String, Value>) -> Self {
        self.entries.insert(key.into(), fields);
        self
    }

    /// Build from a JSON object of `key -> object`
    pub fn from_value(name: impl Into<String>, value: Value) -> Result<Self, EnrichmentError> {
        let Value::Object(table) = value else {
            return Err(EnrichmentError::InvalidData(
                "lookup table must be a JSON object".to_string(),
            ));
        };
        let mut provider = Self::new(name);
        for (key, entry) in table {
            match entry {
                Value::Object(fields) => {
                    provider.entries.insert(key, fields);
                }
                other => {
                    return Err(EnrichmentError::InvalidData(format!(
                        "entry '{}' must be an object, got {}",
                        key, other
                    )))
                }
            }
        }
        Ok(provider)
    }

    /// Load a JSON object file
    pub fn from_json_file(name: impl Into<String>, path: impl AsRef<Path>) -> Result<Self, EnrichmentError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| EnrichmentError::InvalidData(format!("{}: {}", path.display(), e)))?;
        let value = serde_json::from_str(&text)
            .map_err(|e| EnrichmentError::InvalidData(format!("{}: {}", path.display(), e)))?;
        Self::from_value(name, value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl EnrichmentProvider for StaticLookupProvider {
    async fn lookup(&self, key: &str, fields: &[String]) -> Result<Map<String, Value>, EnrichmentError> {
        let entry = self
            .entries
            .get(key)
            .ok_or_else(|| EnrichmentError::NotFound(key.to_string()))?;
        if fields.is_empty() {
            return Ok(entry.clone());
        }
        Ok(fields
            .iter()
            .filter_map(|f| entry.get(f).map(|v| (f.clone(), v.clone())))
            .collect())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Providers available to a job, by name
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn EnrichmentProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn EnrichmentProvider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn with(mut self, provider: Arc<dyn EnrichmentProvider>) -> Self {
        self.register(provider);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn EnrichmentProvider>> {
        self.providers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.providers.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.names())
            .finish()
    }
}

/// Per-enrichment lookup cache with hit and miss counters
///
/// Entries expire `ttl` after insertion; beyond `max_entries` moka evicts
/// by its admission policy.
pub struct EnrichmentCache {
    entries: Cache<String, Option<Map<String, Value>>>,
    hits: u64,
    misses: u64,
}

impl EnrichmentCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        let entries = Cache::builder()
            .max_capacity(max_entries.max(1) as u64)
            .time_to_live(ttl.max(Duration::from_millis(1)))
            .build();
        Self {
            entries,
            hits: 0,
            misses: 0,
        }
    }

    /// Cached result: `Some(None)` is a cached miss
    pub fn get(&mut self, key: &str) -> Option<Option<Map<String, Value>>> {
        let found = self.entries.get(key);
        if found.is_some() {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
        found
    }

    pub fn insert(&mut self, key: String, value: Option<Map<String, Value>>) {
        self.entries.insert(key, value);
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    /// Approximate entry count; apply pending evictions first for an exact one
    pub fn len(&self) -> u64 {
        self.entries.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn run_pending_tasks(&self) {
        self.entries.run_pending_tasks();
    }
}

impl std::fmt::Debug for EnrichmentCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnrichmentCache")
            .field("entries", &self.entries.entry_count())
            .field("hits", &self.hits)
            .field("misses", &self.misses)
            .finish()
    }
}

struct Enrichment {
    def: EnrichmentDef,
    provider: Arc<dyn EnrichmentProvider>,
    cache: EnrichmentCache,
}

/// All enrichments of a stream, applied in order
#[derive(Default)]
pub struct EnrichmentStage {
    enrichments: Vec<Enrichment>,
}

impl std::fmt::Debug for EnrichmentStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnrichmentStage")
            .field(
                "enrichments",
                &self.enrichments.iter().map(|e| &e.def.name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl EnrichmentStage {
    /// Resolve every provider; an unknown provider name is a validation error
    pub fn new(defs: &[EnrichmentDef], registry: &ProviderRegistry) -> ValidationResult<Self> {
        let enrichments = defs
            .iter()
            .enumerate()
            .map(|(i, def)| {
                let provider = registry.get(&def.provider).ok_or_else(|| ValidationError::Unknown {
                    kind: "enrichment provider".to_string(),
                    name: def.provider.clone(),
                    path: format!("enrichments[{}].provider", i),
                })?;
                Ok(Enrichment {
                    def: def.clone(),
                    provider,
                    cache: EnrichmentCache::new(def.cache_ttl(), def.cache_max_entries),
                })
            })
            .collect::<ValidationResult<Vec<_>>>()?;
        Ok(Self { enrichments })
    }

    pub fn is_empty(&self) -> bool {
        self.enrichments.is_empty()
    }

    /// Enrich `event` in place
    ///
    /// On failure the event may hold fields from earlier enrichments, but
    /// the caller drops it.
    pub async fn apply(&mut self, event: &mut Event) -> StageResult<()> {
        for enrichment in &mut self.enrichments {
            let def = &enrichment.def;
            let key = match event.field(&def.key_field) {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => {
                    if def.on_missing == OnMissing::Fail {
                        return Err(StageError::Enrichment {
                            name: def.name.clone(),
                            reason: format!("key field '{}' is missing", def.key_field),
                        });
                    }
                    continue;
                }
            };

            let found = match enrichment.cache.get(&key) {
                Some(cached) => cached,
                None => {
                    let result = match enrichment.provider.lookup(&key, &def.fields).await {
                        Ok(fields) => Some(fields),
                        Err(EnrichmentError::NotFound(_)) => None,
                        Err(e) => {
                            return Err(StageError::Enrichment {
                                name: def.name.clone(),
                                reason: e.to_string(),
                            })
                        }
                    };
                    enrichment.cache.insert(key.clone(), result.clone());
                    result
                }
            };

            let Some(fields) = found else {
                if def.on_missing == OnMissing::Fail {
                    return Err(StageError::Enrichment {
                        name: def.name.clone(),
                        reason: EnrichmentError::NotFound(key).to_string(),
                    });
                }
                trace!(enrichment = %def.name, key = %key, "No enrichment entry, skipping");
                continue;
            };

            match &def.target {
                Some(target) => insert_path(&mut event.payload, target, Value::Object(fields)),
                None => {
                    event.payload.extend(fields);
                    Ok(())
                }
            }
            .map_err(|reason| StageError::Enrichment {
                name: def.name.clone(),
                reason,
            })?;
        }
        Ok(())
    }

    /// `(name, hits, misses)` per enrichment
    pub fn cache_stats(&self) -> Vec<(String, u64, u64)> {
        self.enrichments
            .iter()
            .map(|e| (e.def.name.clone(), e.cache.hits(), e.cache.misses()))
            .collect()
    }

    pub fn log_cache_stats(&self) {
        for (name, hits, misses) in self.cache_stats() {
            debug!(enrichment = %name, hits, misses, "Enrichment cache stats");
        }
    }
}

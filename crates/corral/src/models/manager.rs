//! The model lifecycle manager.
//!
//! Loads models on first demand, serialized through a single load lock, and
//! keeps at most [`MAX_LOADED`] resident with LRU + memory-aware eviction.
//! Records with in-flight work (`active_contexts > 0`) are never evicted.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::{
    LoadedModel, ModelDetails, ModelError, ModelFacts, ModelSummary, RunningModelSummary,
    MAX_LOADED, MEMORY_RESERVE_BYTES,
};
use crate::config::{GatewayConfig, ModelEntry};
use crate::generator::{Generator, ModelInsights};
use crate::tools::ToolProviderManager;

pub struct ModelManager {
    generator: Arc<dyn Generator>,
    configs: HashMap<String, ModelEntry>,
    insights: HashMap<String, ModelInsights>,
    loaded: RwLock<HashMap<String, Arc<LoadedModel>>>,
    /// Serializes every load globally.
    load_lock: tokio::sync::Mutex<()>,
}

impl ModelManager {
    /// Reads per-model memory insights up front; a model whose artifact
    /// cannot be inspected still serves, it just skips memory eviction math.
    pub async fn new(generator: Arc<dyn Generator>, config: GatewayConfig) -> Self {
        let mut insights = HashMap::new();
        for (name, entry) in &config.models {
            match generator.inspect(&entry.path).await {
                Ok(info) => {
                    debug!(
                        model = %name,
                        layers = info.total_layers,
                        size = info.size_bytes,
                        "computed model insights"
                    );
                    insights.insert(name.clone(), info);
                }
                Err(e) => {
                    warn!(model = %name, error = %e, "failed to inspect model artifact");
                }
            }
        }
        ModelManager {
            generator,
            configs: config.models,
            insights,
            loaded: RwLock::new(HashMap::new()),
            load_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Return the resident record for `name`, loading it if needed.
    pub async fn ensure_loaded(&self, name: &str) -> Result<Arc<LoadedModel>, ModelError> {
        let entry = self
            .configs
            .get(name)
            .ok_or_else(|| ModelError::UnknownModel(name.to_string()))?
            .clone();

        let _serial = self.load_lock.lock().await;

        // Another caller may have loaded it while we waited on the lock.
        if let Some(record) = self.loaded.read().get(name) {
            record.touch();
            return Ok(record.clone());
        }

        self.evict_for_cap().await;
        self.evict_for_memory(&entry).await;

        let artifact = self
            .generator
            .load(&entry.path, entry.gpu_layers)
            .await
            .map_err(|source| ModelError::Load {
                name: name.to_string(),
                source,
            })?;

        let mut tools = ToolProviderManager::new();
        tools.connect_all(&entry.tool_providers).await;
        let tool_specs = tools.get_all_tools();

        let dialect = entry.dialect.codec();
        let record = Arc::new(LoadedModel::new(entry, artifact, tools, dialect, tool_specs));
        self.loaded.write().insert(name.to_string(), record.clone());
        info!(model = %name, tools = record.tool_specs.len(), "model loaded");
        Ok(record)
    }

    /// Make room under the record cap before a new load.
    async fn evict_for_cap(&self) {
        loop {
            let count = self.loaded.read().len();
            if count + 1 <= MAX_LOADED {
                return;
            }
            if !self.evict_one().await {
                return;
            }
        }
    }

    /// Evict until the new model's estimated footprint fits in free memory
    /// minus the reserve. A runtime that cannot report free memory skips
    /// this entirely.
    async fn evict_for_memory(&self, entry: &ModelEntry) {
        let Some(insights) = self.insights.get(&entry.name) else {
            return;
        };
        let needed =
            insights.model_vram_bytes + insights.context_vram_bytes(entry.context_size);
        loop {
            let Some(free) = self.generator.free_memory().await else {
                warn!(model = %entry.name, "free-memory probe failed; skipping memory eviction");
                return;
            };
            let available = free.saturating_sub(MEMORY_RESERVE_BYTES);
            if needed <= available {
                return;
            }
            debug!(
                model = %entry.name,
                needed,
                available,
                "insufficient memory, evicting"
            );
            if !self.evict_one().await {
                // Everything resident is pinned; proceed and let the load
                // surface whatever the runtime reports.
                return;
            }
        }
    }

    /// Evict the least-recently-used record with no active contexts.
    async fn evict_one(&self) -> bool {
        let victim = {
            let loaded = self.loaded.read();
            loaded
                .values()
                .filter(|record| record.active_contexts() == 0)
                .min_by_key(|record| record.last_used_at())
                .map(|record| record.name.clone())
        };
        match victim {
            Some(name) => {
                info!(model = %name, "evicting");
                self.unload(&name).await
            }
            None => false,
        }
    }

    /// Remove the record before disposing anything, so re-entrant lookups
    /// fail fast instead of racing a half-torn-down model.
    pub async fn unload(&self, name: &str) -> bool {
        let Some(record) = self.loaded.write().remove(name) else {
            return false;
        };
        if let Err(e) = record.artifact.dispose().await {
            warn!(model = %name, error = %e, "error disposing model handle");
        }
        record.tools.lock().await.disconnect_all().await;
        info!(model = %name, "model unloaded");
        true
    }

    pub fn acquire_context(&self, name: &str) {
        if let Some(record) = self.loaded.read().get(name) {
            record.acquire();
        }
    }

    pub fn release_context(&self, name: &str) {
        if let Some(record) = self.loaded.read().get(name) {
            record.release();
        }
    }

    pub fn get_model_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.configs.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has_model(&self, name: &str) -> bool {
        self.configs.contains_key(name)
    }

    pub fn get_model_config(&self, name: &str) -> Option<&ModelEntry> {
        self.configs.get(name)
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.loaded.read().contains_key(name)
    }

    pub fn loaded_count(&self) -> usize {
        self.loaded.read().len()
    }

    pub fn get_all_model_info(&self, allowed: Option<&HashSet<String>>) -> Vec<ModelSummary> {
        let mut names = self.get_model_names();
        names.retain(|name| allows(allowed, name));
        names
            .into_iter()
            .filter_map(|name| {
                let entry = self.configs.get(&name)?;
                let insights = self.insights.get(&name);
                Some(ModelSummary {
                    model: name.clone(),
                    name,
                    size: insights.map(|i| i.size_bytes).unwrap_or(0),
                    details: ModelFacts {
                        format: "gguf",
                        family: entry.dialect.as_str(),
                        context_size: entry.context_size,
                        total_layers: insights.map(|i| i.total_layers),
                    },
                })
            })
            .collect()
    }

    pub fn get_running_model_info(
        &self,
        allowed: Option<&HashSet<String>>,
    ) -> Vec<RunningModelSummary> {
        let loaded = self.loaded.read();
        let mut out: Vec<RunningModelSummary> = loaded
            .values()
            .filter(|record| allows(allowed, &record.name))
            .map(|record| RunningModelSummary {
                name: record.name.clone(),
                model: record.name.clone(),
                size_vram: self
                    .insights
                    .get(&record.name)
                    .map(|i| i.model_vram_bytes)
                    .unwrap_or(0),
                loaded_at: record.loaded_at,
                last_used_at: record.last_used_at(),
                active_contexts: record.active_contexts(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn get_model_details(&self, name: &str) -> Option<ModelDetails> {
        let entry = self.configs.get(name)?;
        let insights = self.insights.get(name);
        let tools = self
            .loaded
            .read()
            .get(name)
            .map(|record| {
                record
                    .tool_specs
                    .iter()
                    .map(|tool| tool.name.clone())
                    .collect()
            })
            .unwrap_or_default();
        Some(ModelDetails {
            name: entry.name.clone(),
            dialect: entry.dialect.as_str(),
            context_size: entry.context_size,
            gpu_layers: entry.gpu_layers,
            size: insights.map(|i| i.size_bytes),
            total_layers: insights.map(|i| i.total_layers),
            loaded: self.is_loaded(name),
            tool_providers: entry
                .tool_providers
                .iter()
                .map(|spec| spec.name.clone())
                .collect(),
            tools,
        })
    }

    /// Unload everything serially, then close the runtime.
    pub async fn shutdown(&self) {
        let names: Vec<String> = self.loaded.read().keys().cloned().collect();
        for name in names {
            self.unload(&name).await;
        }
        self.generator.shutdown().await;
    }
}

fn allows(allowed: Option<&HashSet<String>>, name: &str) -> bool {
    allowed.is_none_or(|set| set.contains(name))
}

//! Model lifecycle: loaded-model records and the manager that loads,
//! evicts, and tracks them.

mod manager;

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::ModelEntry;
use crate::dialect::ToolDialect;
use crate::generator::ModelArtifact;
use crate::tools::{ToolProviderManager, ToolSpec};

pub use manager::ModelManager;

/// Most records resident at once.
pub const MAX_LOADED: usize = 3;

/// Bytes of accelerator memory kept free when sizing a load.
pub const MEMORY_RESERVE_BYTES: u64 = 512 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model not found: {0}")]
    UnknownModel(String),

    #[error("failed to load model {name}: {source}")]
    Load {
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

impl std::fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModel")
            .field("name", &self.name)
            .field("entry", &self.entry)
            .field("loaded_at", &self.loaded_at)
            .finish()
    }
}

/// A resident model: the generator handle plus everything bound to it.
pub struct LoadedModel {
    pub name: String,
    pub artifact: Arc<dyn ModelArtifact>,
    /// Exclusively owned by this record; torn down with it.
    pub tools: Mutex<ToolProviderManager>,
    pub dialect: Arc<dyn ToolDialect>,
    /// Tool list snapshot taken at load time.
    pub tool_specs: Vec<ToolSpec>,
    pub entry: ModelEntry,
    pub loaded_at: DateTime<Utc>,
    last_used_at: AtomicI64,
    active_contexts: AtomicUsize,
}

impl LoadedModel {
    pub fn new(
        entry: ModelEntry,
        artifact: Arc<dyn ModelArtifact>,
        tools: ToolProviderManager,
        dialect: Arc<dyn ToolDialect>,
        tool_specs: Vec<ToolSpec>,
    ) -> Self {
        let now = Utc::now();
        LoadedModel {
            name: entry.name.clone(),
            artifact,
            tools: Mutex::new(tools),
            dialect,
            tool_specs,
            entry,
            loaded_at: now,
            last_used_at: AtomicI64::new(now.timestamp_millis()),
            active_contexts: AtomicUsize::new(0),
        }
    }

    pub fn touch(&self) {
        self.last_used_at
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_used_at(&self) -> DateTime<Utc> {
        let millis = self.last_used_at.load(Ordering::Relaxed);
        Utc.timestamp_millis_opt(millis)
            .single()
            .unwrap_or_else(Utc::now)
    }

    pub fn active_contexts(&self) -> usize {
        self.active_contexts.load(Ordering::SeqCst)
    }

    pub(crate) fn acquire(&self) {
        self.active_contexts.fetch_add(1, Ordering::SeqCst);
        self.touch();
    }

    pub(crate) fn release(&self) {
        // Pairing is the caller's contract; never go below zero regardless.
        let _ = self
            .active_contexts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1));
        self.touch();
    }
}

/// `/api/tags` entry.
#[derive(Debug, Clone, Serialize)]
pub struct ModelSummary {
    pub name: String,
    pub model: String,
    pub size: u64,
    pub details: ModelFacts,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelFacts {
    pub format: &'static str,
    pub family: &'static str,
    pub context_size: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_layers: Option<u32>,
}

/// `/api/ps` entry.
#[derive(Debug, Clone, Serialize)]
pub struct RunningModelSummary {
    pub name: String,
    pub model: String,
    pub size_vram: u64,
    pub loaded_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub active_contexts: usize,
}

/// `/api/show` body.
#[derive(Debug, Clone, Serialize)]
pub struct ModelDetails {
    pub name: String,
    pub dialect: &'static str,
    pub context_size: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_layers: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_layers: Option<u32>,
    pub loaded: bool,
    pub tool_providers: Vec<String>,
    pub tools: Vec<String>,
}

//! The generator seam: the inference runtime that owns model handles and
//! produces completion text.
//!
//! The serving engine only ever talks to these traits. The default
//! implementation lives in [`candle`]; tests drive the engine with scripted
//! generators instead.

pub mod candle;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

pub use candle::CandleGenerator;

/// Static facts about a model artifact used for memory-aware eviction.
#[derive(Debug, Clone, Copy)]
pub struct ModelInsights {
    pub total_layers: u32,
    pub size_bytes: u64,
    /// Estimated resident bytes for the weights themselves.
    pub model_vram_bytes: u64,
    /// Estimated KV-cache bytes per context token.
    pub kv_bytes_per_token: u64,
}

impl ModelInsights {
    pub fn context_vram_bytes(&self, context_size: u32) -> u64 {
        self.kv_bytes_per_token * u64::from(context_size)
    }
}

#[async_trait]
pub trait Generator: Send + Sync {
    /// Open a model handle. `gpu_layers` is an offload hint the runtime may
    /// honor or ignore.
    async fn load(
        &self,
        path: &Path,
        gpu_layers: Option<u32>,
    ) -> anyhow::Result<Arc<dyn ModelArtifact>>;

    /// Read artifact metadata without loading weights.
    async fn inspect(&self, path: &Path) -> anyhow::Result<ModelInsights>;

    /// Free accelerator (or unified) memory in bytes. `None` means the
    /// runtime cannot tell, which disables memory-aware eviction.
    async fn free_memory(&self) -> Option<u64>;

    async fn shutdown(&self) {}
}

/// An open model handle. Sessions outlive the call that creates them, so
/// creation goes through the owning `Arc`.
#[async_trait]
pub trait ModelArtifact: Send + Sync {
    async fn start_chat(
        self: Arc<Self>,
        system_prompt: &str,
        context_size: u32,
    ) -> anyhow::Result<Box<dyn ChatSession>>;

    async fn dispose(&self) -> anyhow::Result<()>;
}

/// One inference conversation. History replay does not generate; `prompt`
/// runs a generation and appends both sides to the session history.
#[async_trait]
pub trait ChatSession: Send {
    fn add_user_turn(&mut self, text: &str);

    async fn prompt(&mut self, input: &str) -> anyhow::Result<String>;
}

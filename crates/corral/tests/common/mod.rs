//! Shared test doubles: a scripted generator whose sessions answer from a
//! closure, plus config builders.

#![allow(dead_code)]

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use serde_json::{Map, Value};

use corral::config::{GatewayConfig, ModelEntry};
use corral::dialect::Dialect;
use corral::generator::{ChatSession, Generator, ModelArtifact, ModelInsights};
use corral::models::LoadedModel;
use corral::tools::{ProviderClient, ToolProviderManager, ToolSpec};

/// `(session_prompt_index, input) -> response`
pub type Script = Arc<dyn Fn(usize, &str) -> String + Send + Sync>;

pub struct ScriptedGenerator {
    script: Script,
    /// Total `prompt` calls across every session.
    pub prompts: Arc<AtomicUsize>,
    pub load_count: AtomicUsize,
    /// System prompts captured at `start_chat`.
    pub systems: Arc<Mutex<Vec<String>>>,
    /// Every artifact handed out, for disposal assertions.
    pub artifacts: Mutex<Vec<Arc<ScriptedArtifact>>>,
    free_memory: Mutex<Option<u64>>,
    fail_loads: Mutex<HashSet<String>>,
    insights: ModelInsights,
}

impl ScriptedGenerator {
    pub fn new(script: impl Fn(usize, &str) -> String + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(ScriptedGenerator {
            script: Arc::new(script),
            prompts: Arc::new(AtomicUsize::new(0)),
            load_count: AtomicUsize::new(0),
            systems: Arc::new(Mutex::new(Vec::new())),
            artifacts: Mutex::new(Vec::new()),
            free_memory: Mutex::new(None),
            fail_loads: Mutex::new(HashSet::new()),
            insights: ModelInsights {
                total_layers: 32,
                size_bytes: 1 << 30,
                model_vram_bytes: 200 * 1024 * 1024,
                kv_bytes_per_token: 1024,
            },
        })
    }

    pub fn constant(text: &str) -> Arc<Self> {
        let text = text.to_string();
        Self::new(move |_, _| text.clone())
    }

    pub fn set_free_memory(&self, bytes: Option<u64>) {
        *self.free_memory.lock() = bytes;
    }

    pub fn fail_load_of(&self, model: &str) {
        self.fail_loads.lock().insert(model.to_string());
    }

    pub fn prompt_count(&self) -> usize {
        self.prompts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn load(
        &self,
        path: &Path,
        _gpu_layers: Option<u32>,
    ) -> anyhow::Result<Arc<dyn ModelArtifact>> {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        if self.fail_loads.lock().contains(&stem) {
            anyhow::bail!("scripted load failure for {stem}");
        }
        self.load_count.fetch_add(1, Ordering::SeqCst);
        let artifact = Arc::new(ScriptedArtifact {
            script: self.script.clone(),
            prompts: self.prompts.clone(),
            systems: self.systems.clone(),
            replays: Arc::new(Mutex::new(Vec::new())),
            inputs: Arc::new(Mutex::new(Vec::new())),
            disposed: AtomicBool::new(false),
        });
        self.artifacts.lock().push(artifact.clone());
        Ok(artifact)
    }

    async fn inspect(&self, _path: &Path) -> anyhow::Result<ModelInsights> {
        Ok(self.insights)
    }

    async fn free_memory(&self) -> Option<u64> {
        *self.free_memory.lock()
    }
}

pub struct ScriptedArtifact {
    script: Script,
    prompts: Arc<AtomicUsize>,
    systems: Arc<Mutex<Vec<String>>>,
    /// User turns replayed into sessions without generation.
    pub replays: Arc<Mutex<Vec<String>>>,
    /// Inputs passed to `prompt`, across every session.
    pub inputs: Arc<Mutex<Vec<String>>>,
    pub disposed: AtomicBool,
}

impl ScriptedArtifact {
    pub fn standalone(script: impl Fn(usize, &str) -> String + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(ScriptedArtifact {
            script: Arc::new(script),
            prompts: Arc::new(AtomicUsize::new(0)),
            systems: Arc::new(Mutex::new(Vec::new())),
            replays: Arc::new(Mutex::new(Vec::new())),
            inputs: Arc::new(Mutex::new(Vec::new())),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn prompt_count(&self) -> usize {
        self.prompts.load(Ordering::SeqCst)
    }

    pub fn captured_systems(&self) -> Vec<String> {
        self.systems.lock().clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelArtifact for ScriptedArtifact {
    async fn start_chat(
        self: Arc<Self>,
        system_prompt: &str,
        _context_size: u32,
    ) -> anyhow::Result<Box<dyn ChatSession>> {
        self.systems.lock().push(system_prompt.to_string());
        Ok(Box::new(ScriptedSession {
            script: self.script.clone(),
            prompts: self.prompts.clone(),
            replays: self.replays.clone(),
            inputs: self.inputs.clone(),
            session_prompts: 0,
        }))
    }

    async fn dispose(&self) -> anyhow::Result<()> {
        self.disposed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct ScriptedSession {
    script: Script,
    prompts: Arc<AtomicUsize>,
    replays: Arc<Mutex<Vec<String>>>,
    inputs: Arc<Mutex<Vec<String>>>,
    session_prompts: usize,
}

#[async_trait]
impl ChatSession for ScriptedSession {
    fn add_user_turn(&mut self, text: &str) {
        self.replays.lock().push(text.to_string());
    }

    async fn prompt(&mut self, input: &str) -> anyhow::Result<String> {
        let index = self.session_prompts;
        self.session_prompts += 1;
        self.prompts.fetch_add(1, Ordering::SeqCst);
        self.inputs.lock().push(input.to_string());
        Ok((self.script)(index, input))
    }
}

/// Tool client answering from a fixed name → result table. Unlisted tools
/// return `"ok"`; a result of `"__fail__"` raises instead.
pub struct StaticToolClient {
    responses: Mutex<std::collections::HashMap<String, Value>>,
    pub calls: Arc<Mutex<Vec<(String, Map<String, Value>)>>>,
}

impl StaticToolClient {
    pub fn new(responses: &[(&str, Value)]) -> Box<Self> {
        Box::new(StaticToolClient {
            responses: Mutex::new(
                responses
                    .iter()
                    .map(|(name, value)| (name.to_string(), value.clone()))
                    .collect(),
            ),
            calls: Arc::new(Mutex::new(Vec::new())),
        })
    }
}

#[async_trait]
impl ProviderClient for StaticToolClient {
    async fn list_tools(&self) -> anyhow::Result<Vec<ToolSpec>> {
        Ok(Vec::new())
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> anyhow::Result<Value> {
        self.calls
            .lock()
            .push((name.to_string(), arguments.unwrap_or_default()));
        let result = self
            .responses
            .lock()
            .get(name)
            .cloned()
            .unwrap_or_else(|| Value::String("ok".into()));
        if result == Value::String("__fail__".into()) {
            anyhow::bail!("tool exploded");
        }
        Ok(result)
    }

    async fn close(self: Box<Self>) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Assemble a loaded-model record directly, bypassing the lifecycle manager.
pub fn loaded_record(
    name: &str,
    dialect: Dialect,
    artifact: Arc<ScriptedArtifact>,
    tools: Vec<ToolSpec>,
    client: Box<dyn ProviderClient>,
) -> Arc<LoadedModel> {
    let mut manager = ToolProviderManager::new();
    manager.register("test", client, tools);
    let specs = manager.get_all_tools();
    Arc::new(LoadedModel::new(
        entry(name, dialect),
        artifact,
        manager,
        dialect.codec(),
        specs,
    ))
}

pub fn entry(name: &str, dialect: Dialect) -> ModelEntry {
    ModelEntry {
        name: name.to_string(),
        path: format!("/models/{name}.gguf").into(),
        dialect,
        system_prompt: format!("You are {name}."),
        gpu_layers: None,
        context_size: 2048,
        tool_providers: Vec::new(),
    }
}

pub fn config_of(names: &[&str]) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    for name in names {
        config
            .models
            .insert(name.to_string(), entry(name, Dialect::Hermes));
    }
    config
}

//! Default generator: quantized GGUF models executed through candle.
//!
//! Loads llama-architecture weights, pairs them with a sibling tokenizer
//! file, and renders chat turns with the template family inferred from the
//! artifact name. Generation is greedy decode with the KV cache advanced one
//! token at a time.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use candle_core::quantized::gguf_file;
use candle_core::{Device, Tensor};
use candle_transformers::models::quantized_llama;
use tokenizers::Tokenizer;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{ChatSession, Generator, ModelArtifact, ModelInsights};

const MAX_GENERATED_TOKENS: usize = 512;

/// Chat serialization family, inferred from the artifact file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChatTemplate {
    Llama3,
    ChatML,
    Mistral,
}

impl ChatTemplate {
    fn for_artifact(path: &Path) -> Self {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if stem.contains("hermes") || stem.contains("qwen") {
            ChatTemplate::ChatML
        } else if stem.contains("mistral") {
            ChatTemplate::Mistral
        } else {
            ChatTemplate::Llama3
        }
    }

    fn eos_strings(&self) -> &[&str] {
        match self {
            ChatTemplate::Llama3 => &["<|eot_id|>", "<|end_of_text|>"],
            ChatTemplate::ChatML => &["<|im_end|>"],
            ChatTemplate::Mistral => &["</s>"],
        }
    }

    fn eos_token_id(&self, tokenizer: &Tokenizer) -> u32 {
        let (marker, fallback) = match self {
            ChatTemplate::Llama3 => ("<|eot_id|>", 128009),
            ChatTemplate::ChatML => ("<|im_end|>", 32000),
            ChatTemplate::Mistral => ("</s>", 2),
        };
        tokenizer.token_to_id(marker).unwrap_or(fallback)
    }

    fn render(&self, system: &str, turns: &[Turn]) -> String {
        match self {
            ChatTemplate::Llama3 => {
                let mut prompt = String::from("<|begin_of_text|>");
                if !system.is_empty() {
                    prompt.push_str("<|start_header_id|>system<|end_header_id|>\n\n");
                    prompt.push_str(system);
                    prompt.push_str("<|eot_id|>");
                }
                for turn in turns {
                    prompt.push_str(&format!(
                        "<|start_header_id|>{}<|end_header_id|>\n\n",
                        turn.role()
                    ));
                    prompt.push_str(&turn.text);
                    prompt.push_str("<|eot_id|>");
                }
                prompt.push_str("<|start_header_id|>assistant<|end_header_id|>\n\n");
                prompt
            }
            ChatTemplate::ChatML => {
                let mut prompt = String::new();
                if !system.is_empty() {
                    prompt.push_str("<|im_start|>system\n");
                    prompt.push_str(system);
                    prompt.push_str("<|im_end|>\n");
                }
                for turn in turns {
                    prompt.push_str(&format!("<|im_start|>{}\n", turn.role()));
                    prompt.push_str(&turn.text);
                    prompt.push_str("<|im_end|>\n");
                }
                prompt.push_str("<|im_start|>assistant\n");
                prompt
            }
            ChatTemplate::Mistral => {
                // No system role; prepend to the first user turn.
                let mut prompt = String::new();
                let mut system_pending = (!system.is_empty()).then(|| format!("{system}\n\n"));
                for turn in turns {
                    if turn.assistant {
                        prompt.push(' ');
                        prompt.push_str(&turn.text);
                        prompt.push_str("</s>");
                    } else {
                        prompt.push_str("[INST] ");
                        if let Some(prefix) = system_pending.take() {
                            prompt.push_str(&prefix);
                        }
                        prompt.push_str(&turn.text);
                        prompt.push_str(" [/INST]");
                    }
                }
                if let Some(prefix) = system_pending {
                    prompt.push_str("[INST] ");
                    prompt.push_str(&prefix);
                    prompt.push_str("[/INST]");
                }
                prompt
            }
        }
    }
}

#[derive(Debug, Clone)]
struct Turn {
    assistant: bool,
    text: String,
}

impl Turn {
    fn role(&self) -> &'static str {
        if self.assistant {
            "assistant"
        } else {
            "user"
        }
    }
}

pub struct CandleGenerator {
    device: Device,
}

impl CandleGenerator {
    pub fn new() -> anyhow::Result<Self> {
        let device = if let Ok(device) = Device::new_metal(0) {
            info!("using Metal device");
            device
        } else if let Ok(device) = Device::new_cuda(0) {
            info!("using CUDA device");
            device
        } else {
            info!("using CPU device");
            Device::Cpu
        };
        Ok(CandleGenerator { device })
    }
}

#[async_trait]
impl Generator for CandleGenerator {
    async fn load(
        &self,
        path: &Path,
        gpu_layers: Option<u32>,
    ) -> anyhow::Result<Arc<dyn ModelArtifact>> {
        if let Some(layers) = gpu_layers {
            // Quantized candle weights live wholly on one device.
            debug!(layers, "per-layer offload hint not supported by this runtime");
        }
        let template = ChatTemplate::for_artifact(path);
        let tokenizer_path = locate_tokenizer(path)?;
        let device = self.device.clone();
        let model_path = path.to_path_buf();

        let (weights, tokenizer) = tokio::task::spawn_blocking(
            move || -> anyhow::Result<(quantized_llama::ModelWeights, Tokenizer)> {
                let mut file = std::fs::File::open(&model_path)
                    .with_context(|| format!("failed to open {}", model_path.display()))?;
                let content = gguf_file::Content::read(&mut file)
                    .with_context(|| format!("failed to read GGUF {}", model_path.display()))?;
                let weights = quantized_llama::ModelWeights::from_gguf(content, &mut file, &device)
                    .context("failed to load model weights")?;
                let tokenizer = Tokenizer::from_file(&tokenizer_path)
                    .map_err(|e| anyhow!("failed to load tokenizer: {e}"))?;
                Ok((weights, tokenizer))
            },
        )
        .await??;

        let eos_token_id = template.eos_token_id(&tokenizer);
        info!(model = %path.display(), "model loaded");
        Ok(Arc::new(CandleArtifact {
            weights: Mutex::new(weights),
            tokenizer,
            device: self.device.clone(),
            template,
            eos_token_id,
        }))
    }

    async fn inspect(&self, path: &Path) -> anyhow::Result<ModelInsights> {
        let size_bytes = std::fs::metadata(path)
            .with_context(|| format!("failed to stat {}", path.display()))?
            .len();
        let mut file = std::fs::File::open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        let content = gguf_file::Content::read(&mut file)
            .with_context(|| format!("failed to read GGUF {}", path.display()))?;

        let arch = content
            .metadata
            .get("general.architecture")
            .and_then(|v| v.to_string().ok())
            .cloned()
            .unwrap_or_else(|| "llama".to_string());
        let metadata_u32 = |key: &str, default: u32| {
            content
                .metadata
                .get(&format!("{arch}.{key}"))
                .and_then(|v| v.to_u32().ok())
                .unwrap_or(default)
        };
        let total_layers = metadata_u32("block_count", 32);
        let embedding_length = metadata_u32("embedding_length", 4096);

        Ok(ModelInsights {
            total_layers,
            size_bytes,
            // Quantized weights stay roughly their file size when resident.
            model_vram_bytes: size_bytes,
            // K and V, one f16 vector per layer per token.
            kv_bytes_per_token: 2 * u64::from(total_layers) * u64::from(embedding_length) * 2,
        })
    }

    async fn free_memory(&self) -> Option<u64> {
        sys_info::mem_info().ok().map(|info| info.avail * 1024)
    }
}

fn locate_tokenizer(model_path: &Path) -> anyhow::Result<PathBuf> {
    let sibling = model_path.with_extension("tokenizer.json");
    if sibling.exists() {
        return Ok(sibling);
    }
    let shared = model_path
        .parent()
        .unwrap_or(Path::new("."))
        .join("tokenizer.json");
    if shared.exists() {
        return Ok(shared);
    }
    bail!(
        "no tokenizer found for {}: expected {} or {}",
        model_path.display(),
        sibling.display(),
        shared.display()
    )
}

struct CandleArtifact {
    weights: Mutex<quantized_llama::ModelWeights>,
    tokenizer: Tokenizer,
    device: Device,
    template: ChatTemplate,
    eos_token_id: u32,
}

impl CandleArtifact {
    /// Greedy decode: prefill the prompt token-by-token, then sample argmax
    /// until EOS or the budget runs out.
    async fn generate(&self, prompt: &str, max_tokens: usize) -> anyhow::Result<String> {
        let prompt_tokens = self
            .tokenizer
            .encode(prompt, false)
            .map_err(|e| anyhow!("failed to encode prompt: {e}"))?
            .get_ids()
            .to_vec();

        let mut weights = self.weights.lock().await;
        let mut next_token = 0u32;
        for (pos, &token) in prompt_tokens.iter().enumerate() {
            next_token = self.step(&mut weights, token, pos)?;
        }

        let mut generated = vec![next_token];
        for index in 0..max_tokens.saturating_sub(1) {
            if next_token == self.eos_token_id {
                break;
            }
            let pos = prompt_tokens.len() + index + 1;
            next_token = self.step(&mut weights, next_token, pos)?;
            generated.push(next_token);
        }
        drop(weights);

        let mut text = self
            .tokenizer
            .decode(&generated, false)
            .map_err(|e| anyhow!("failed to decode output: {e}"))?;
        for eos in self.template.eos_strings() {
            text = text.replace(eos, "");
        }
        Ok(text)
    }

    fn step(
        &self,
        weights: &mut quantized_llama::ModelWeights,
        token: u32,
        pos: usize,
    ) -> anyhow::Result<u32> {
        let input = Tensor::new(&[token], &self.device)?.unsqueeze(0)?;
        let logits = weights.forward(&input, pos)?.squeeze(0)?;
        Ok(logits.argmax(0)?.to_scalar::<u32>()?)
    }
}

#[async_trait]
impl ModelArtifact for CandleArtifact {
    async fn start_chat(
        self: Arc<Self>,
        system_prompt: &str,
        context_size: u32,
    ) -> anyhow::Result<Box<dyn ChatSession>> {
        Ok(Box::new(CandleChatSession {
            artifact: self,
            system: system_prompt.to_string(),
            context_size,
            turns: Vec::new(),
        }))
    }

    async fn dispose(&self) -> anyhow::Result<()> {
        // Weights free with the last Arc; nothing to release eagerly.
        Ok(())
    }
}

struct CandleChatSession {
    artifact: Arc<CandleArtifact>,
    system: String,
    context_size: u32,
    turns: Vec<Turn>,
}

#[async_trait]
impl ChatSession for CandleChatSession {
    fn add_user_turn(&mut self, text: &str) {
        self.turns.push(Turn {
            assistant: false,
            text: text.to_string(),
        });
    }

    async fn prompt(&mut self, input: &str) -> anyhow::Result<String> {
        self.turns.push(Turn {
            assistant: false,
            text: input.to_string(),
        });
        let prompt = self.artifact.template.render(&self.system, &self.turns);
        let budget = (self.context_size as usize).min(MAX_GENERATED_TOKENS);
        let reply = self.artifact.generate(&prompt, budget).await?;
        self.turns.push(Turn {
            assistant: true,
            text: reply.clone(),
        });
        Ok(reply)
    }
}

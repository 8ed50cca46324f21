//! Gateway configuration: the set of served models, each with its artifact
//! path, dialect, system prompt, and tool providers.
//!
//! Relative paths in the file resolve against the directory the config file
//! lives in. A missing system-prompt file is a hard error at load time; a
//! missing model artifact is deferred to the first load attempt.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dialect::Dialect;

pub const DEFAULT_CONTEXT_SIZE: u32 = 4096;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("model {model}: system prompt file {path} could not be read: {source}")]
    PromptFile {
        model: String,
        path: PathBuf,
        source: std::io::Error,
    },
}

/// How to reach one tool provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum ProviderTransport {
    /// Child process speaking MCP over stdio.
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        cwd: Option<PathBuf>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    /// Remote MCP endpoint over streamable HTTP.
    Http { url: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSpec {
    pub name: String,
    #[serde(flatten)]
    pub transport: ProviderTransport,
}

/// One configured model, immutable after load.
#[derive(Debug, Clone)]
pub struct ModelEntry {
    pub name: String,
    pub path: PathBuf,
    pub dialect: Dialect,
    pub system_prompt: String,
    pub gpu_layers: Option<u32>,
    pub context_size: u32,
    pub tool_providers: Vec<ProviderSpec>,
}

#[derive(Debug, Deserialize)]
struct RawModelEntry {
    path: PathBuf,
    dialect: Dialect,
    #[serde(default)]
    system_prompt: Option<String>,
    #[serde(default)]
    system_prompt_file: Option<PathBuf>,
    #[serde(default)]
    gpu_layers: Option<u32>,
    #[serde(default)]
    context_size: Option<u32>,
    #[serde(default)]
    tool_providers: Vec<ProviderSpec>,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    models: HashMap<String, RawModelEntry>,
}

#[derive(Debug, Clone, Default)]
pub struct GatewayConfig {
    pub models: HashMap<String, ModelEntry>,
}

impl GatewayConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let raw: RawConfig = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        let base = path.parent().unwrap_or(Path::new("."));
        let mut models = HashMap::new();
        for (name, entry) in raw.models {
            models.insert(name.clone(), finalize_entry(name, entry, base)?);
        }
        Ok(GatewayConfig { models })
    }
}

fn finalize_entry(
    name: String,
    raw: RawModelEntry,
    base: &Path,
) -> Result<ModelEntry, ConfigError> {
    let system_prompt = match (&raw.system_prompt, &raw.system_prompt_file) {
        (Some(inline), _) => inline.clone(),
        (None, Some(file)) => {
            let resolved = resolve(base, file);
            std::fs::read_to_string(&resolved).map_err(|source| ConfigError::PromptFile {
                model: name.clone(),
                path: resolved,
                source,
            })?
        }
        (None, None) => String::new(),
    };

    let tool_providers = raw
        .tool_providers
        .into_iter()
        .map(|mut spec| {
            if let ProviderTransport::Stdio { cwd: Some(cwd), .. } = &mut spec.transport {
                *cwd = resolve(base, cwd);
            }
            spec
        })
        .collect();

    Ok(ModelEntry {
        path: resolve(base, &raw.path),
        dialect: raw.dialect,
        system_prompt,
        gpu_layers: raw.gpu_layers,
        context_size: raw.context_size.unwrap_or(DEFAULT_CONTEXT_SIZE),
        tool_providers,
        name,
    })
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

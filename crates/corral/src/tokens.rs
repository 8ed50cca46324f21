//! Bearer-token store.
//!
//! Tokens are opaque 32-byte hex strings mapped to a note, an allowed-model
//! list, and a creation timestamp, persisted as a plain JSON file. A missing
//! or unparseable file yields an empty store without error, so a fresh
//! deployment works before any token has been minted.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("failed to write token store {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to serialize token store: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub note: String,
    pub models: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TokenFile {
    tokens: BTreeMap<String, TokenRecord>,
}

#[derive(Debug)]
pub struct TokenStore {
    path: PathBuf,
    tokens: BTreeMap<String, TokenRecord>,
}

impl TokenStore {
    pub fn load(path: &Path) -> Self {
        let tokens = match std::fs::read_to_string(path) {
            Ok(text) => match serde_json::from_str::<TokenFile>(&text) {
                Ok(file) => file.tokens,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "token store unparseable; starting empty");
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        };
        TokenStore {
            path: path.to_path_buf(),
            tokens,
        }
    }

    pub fn save(&self) -> Result<(), TokenError> {
        let file = TokenFile {
            tokens: self.tokens.clone(),
        };
        let text = serde_json::to_string_pretty(&file)?;
        std::fs::write(&self.path, text).map_err(|source| TokenError::Write {
            path: self.path.clone(),
            source,
        })
    }

    pub fn get(&self, token: &str) -> Option<&TokenRecord> {
        self.tokens.get(token)
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Mint a new token, persist, and return the hex string.
    pub fn create(&mut self, note: &str, models: Vec<String>) -> Result<String, TokenError> {
        let bytes: [u8; 32] = rand::thread_rng().gen();
        let token = hex::encode(bytes);
        self.tokens.insert(
            token.clone(),
            TokenRecord {
                note: note.to_string(),
                models,
                created_at: Utc::now(),
            },
        );
        self.save()?;
        Ok(token)
    }

    /// Remove a token and persist. Returns whether it existed.
    pub fn revoke(&mut self, token: &str) -> Result<bool, TokenError> {
        let existed = self.tokens.remove(token).is_some();
        if existed {
            self.save()?;
        }
        Ok(existed)
    }
}

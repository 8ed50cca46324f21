//! corral: a multiplexing gateway for locally-loaded language models.
//!
//! The serving engine: a fair-batching scheduler feeds requests to models
//! made resident on demand by a memory-aware lifecycle manager; each request
//! runs the tool-execution loop, which parses dialect-specific tool-call
//! markup out of model text, executes calls against MCP tool providers, and
//! re-prompts until a final answer emerges. The HTTP surface lives in the
//! `corral-server` crate.

pub mod config;
pub mod dialect;
pub mod generator;
pub mod message;
pub mod models;
pub mod reply;
pub mod scheduler;
pub mod tokens;
pub mod tools;
pub mod wire;

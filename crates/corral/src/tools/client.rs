//! MCP client session over a provider transport.
//!
//! `ProviderClient` is the seam the manager programs against; the rmcp-backed
//! implementation below is the only one used in production.

use std::collections::HashMap;

use async_trait::async_trait;
use rmcp::{
    model::CallToolRequestParam, service::RunningService, transport::StreamableHttpClientTransport,
    transport::TokioChildProcess, RoleClient, ServiceExt,
};
use serde_json::{Map, Value};
use tokio::process::Command;

use super::ToolSpec;

#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn list_tools(&self) -> anyhow::Result<Vec<ToolSpec>>;

    /// Invoke a tool and return the provider's raw result structure.
    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> anyhow::Result<Value>;

    async fn close(self: Box<Self>) -> anyhow::Result<()>;
}

pub struct McpProviderClient {
    service: RunningService<RoleClient, ()>,
}

impl McpProviderClient {
    /// Spawn a child process and speak MCP over its stdio.
    pub async fn connect_stdio(
        command: &str,
        args: &[String],
        cwd: Option<&std::path::Path>,
        env: &HashMap<String, String>,
    ) -> anyhow::Result<Self> {
        let mut cmd = Command::new(command);
        cmd.args(args);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        for (key, value) in env {
            cmd.env(key, value);
        }
        let transport = TokioChildProcess::new(cmd)?;
        let service = ().serve(transport).await?;
        Ok(Self { service })
    }

    /// Connect to a remote MCP endpoint over streamable HTTP.
    pub async fn connect_http(url: &str) -> anyhow::Result<Self> {
        let transport = StreamableHttpClientTransport::from_uri(url.to_string());
        let service = ().serve(transport).await?;
        Ok(Self { service })
    }
}

#[async_trait]
impl ProviderClient for McpProviderClient {
    async fn list_tools(&self) -> anyhow::Result<Vec<ToolSpec>> {
        let tools = self.service.peer().list_all_tools().await?;
        Ok(tools
            .into_iter()
            .map(|tool| ToolSpec {
                name: tool.name.to_string(),
                description: tool
                    .description
                    .as_ref()
                    .map(|d| d.to_string())
                    .unwrap_or_default(),
                input_schema: Value::Object((*tool.input_schema).clone()),
            })
            .collect())
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> anyhow::Result<Value> {
        let result = self
            .service
            .peer()
            .call_tool(CallToolRequestParam {
                name: name.to_string().into(),
                arguments,
            })
            .await?;
        Ok(serde_json::to_value(result)?)
    }

    async fn close(self: Box<Self>) -> anyhow::Result<()> {
        self.service.cancel().await?;
        Ok(())
    }
}

//! Per-model tool-provider manager.
//!
//! Every loaded model owns one of these. It holds the live provider clients
//! and two lookup indexes: tool name → descriptor and tool name → provider.
//! Tools register under both their plain name and the qualified
//! `<provider>__<name>` form; plain-name collisions resolve first-writer-wins
//! while the qualified form stays unambiguous.

use std::collections::HashMap;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::{McpProviderClient, ProviderClient, ToolError, ToolSpec};
use crate::config::{ProviderSpec, ProviderTransport};

#[derive(Default)]
pub struct ToolProviderManager {
    providers: HashMap<String, Box<dyn ProviderClient>>,
    tools: HashMap<String, ToolSpec>,
    tool_to_provider: HashMap<String, String>,
}

impl ToolProviderManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect every provider; a failing provider is logged and skipped so
    /// one bad spec cannot brick the model it belongs to.
    pub async fn connect_all(&mut self, specs: &[ProviderSpec]) {
        for spec in specs {
            if let Err(e) = self.connect(spec).await {
                warn!(provider = %spec.name, error = %e, "failed to connect tool provider");
            }
        }
    }

    pub async fn connect(&mut self, spec: &ProviderSpec) -> anyhow::Result<()> {
        let client: Box<dyn ProviderClient> = match &spec.transport {
            ProviderTransport::Stdio {
                command,
                args,
                cwd,
                env,
            } => Box::new(
                McpProviderClient::connect_stdio(command, args, cwd.as_deref(), env).await?,
            ),
            ProviderTransport::Http { url } => {
                Box::new(McpProviderClient::connect_http(url).await?)
            }
        };

        // A provider that cannot list tools stays connected with zero tools.
        let tools = match client.list_tools().await {
            Ok(tools) => tools,
            Err(e) => {
                warn!(provider = %spec.name, error = %e, "list_tools failed; provider has no tools");
                Vec::new()
            }
        };

        self.register(&spec.name, client, tools);
        Ok(())
    }

    /// Index `tools` under both keys and take ownership of the client.
    pub fn register(&mut self, provider: &str, client: Box<dyn ProviderClient>, tools: Vec<ToolSpec>) {
        for tool in tools {
            let qualified = format!("{provider}__{}", tool.name);
            if !self.tools.contains_key(&tool.name) {
                self.tools.insert(tool.name.clone(), tool.clone());
                self.tool_to_provider
                    .insert(tool.name.clone(), provider.to_string());
            }
            self.tools.insert(qualified.clone(), tool);
            self.tool_to_provider.insert(qualified, provider.to_string());
        }
        self.providers.insert(provider.to_string(), client);
        debug!(provider, tool_count = self.tools.len(), "registered tool provider");
    }

    /// Unique tool descriptors. A tool reachable under both its plain and
    /// qualified key is reported once, via the plain entry.
    pub fn get_all_tools(&self) -> Vec<ToolSpec> {
        let mut out = Vec::new();
        for (key, spec) in &self.tools {
            if let Some(provider) = self.tool_to_provider.get(key) {
                let qualified = format!("{provider}__{}", spec.name);
                let plain_covers = *key == qualified
                    && self.tool_to_provider.get(&spec.name) == Some(provider);
                if plain_covers {
                    continue;
                }
            }
            out.push(spec.clone());
        }
        out
    }

    pub fn find_tool(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.get(name)
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: &Map<String, Value>,
    ) -> Result<Value, ToolError> {
        let provider_name = self
            .tool_to_provider
            .get(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;
        // The provider can be torn down between lookup and use.
        let client = self
            .providers
            .get(provider_name)
            .ok_or_else(|| ToolError::ProviderDisconnected(provider_name.clone()))?;
        let actual_name = self
            .tools
            .get(name)
            .map(|spec| spec.name.clone())
            .unwrap_or_else(|| name.to_string());

        let raw = client
            .call_tool(&actual_name, Some(arguments.clone()))
            .await
            .map_err(|e| ToolError::CallFailed(e.to_string()))?;

        // MCP results carry a content list; join the text items. Anything
        // else passes through as the raw structure.
        if let Some(items) = raw.get("content").and_then(Value::as_array) {
            let text = items
                .iter()
                .filter(|item| item.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|item| item.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n");
            if !text.is_empty() {
                return Ok(Value::String(text));
            }
        }
        Ok(raw)
    }

    pub async fn disconnect_all(&mut self) {
        for (name, client) in self.providers.drain() {
            if let Err(e) = client.close().await {
                warn!(provider = %name, error = %e, "error closing tool provider");
            }
        }
        self.tools.clear();
        self.tool_to_provider.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    struct FakeClient {
        result: Value,
        fail: bool,
    }

    #[async_trait]
    impl ProviderClient for FakeClient {
        async fn list_tools(&self) -> anyhow::Result<Vec<ToolSpec>> {
            Ok(Vec::new())
        }

        async fn call_tool(
            &self,
            _name: &str,
            _arguments: Option<Map<String, Value>>,
        ) -> anyhow::Result<Value> {
            if self.fail {
                anyhow::bail!("boom");
            }
            Ok(self.result.clone())
        }

        async fn close(self: Box<Self>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn fake(result: Value) -> Box<FakeClient> {
        Box::new(FakeClient { result, fail: false })
    }

    fn spec(name: &str) -> ToolSpec {
        ToolSpec::new(name, "", json!({}))
    }

    #[test]
    fn registers_plain_and_qualified_keys() {
        let mut mgr = ToolProviderManager::new();
        mgr.register("files", fake(json!(null)), vec![spec("read")]);
        assert!(mgr.find_tool("read").is_some());
        assert!(mgr.find_tool("files__read").is_some());
        assert_eq!(mgr.tool_to_provider.get("read").unwrap(), "files");
    }

    #[test]
    fn plain_name_collision_is_first_writer_wins() {
        let mut mgr = ToolProviderManager::new();
        mgr.register("alpha", fake(json!(null)), vec![spec("search")]);
        mgr.register("beta", fake(json!(null)), vec![spec("search")]);
        assert_eq!(mgr.tool_to_provider.get("search").unwrap(), "alpha");
        assert_eq!(mgr.tool_to_provider.get("beta__search").unwrap(), "beta");
    }

    #[test]
    fn get_all_tools_prefers_plain_entries() {
        let mut mgr = ToolProviderManager::new();
        mgr.register("alpha", fake(json!(null)), vec![spec("search"), spec("fetch")]);
        let mut names: Vec<String> = mgr.get_all_tools().into_iter().map(|t| t.name).collect();
        names.sort();
        assert_eq!(names, vec!["fetch", "search"]);
    }

    #[test]
    fn collision_loser_stays_reachable_via_qualified_entry() {
        let mut mgr = ToolProviderManager::new();
        mgr.register("alpha", fake(json!(null)), vec![spec("search")]);
        mgr.register("beta", fake(json!(null)), vec![spec("search")]);
        // Plain entry for alpha, qualified-only entry for beta.
        assert_eq!(mgr.get_all_tools().len(), 2);
    }

    #[tokio::test]
    async fn call_tool_joins_text_content() {
        let mut mgr = ToolProviderManager::new();
        let result = json!({"content": [
            {"type": "text", "text": "line one"},
            {"type": "image", "data": "…"},
            {"type": "text", "text": "line two"},
        ]});
        mgr.register("files", fake(result), vec![spec("read")]);
        let out = mgr.call_tool("read", &Map::new()).await.unwrap();
        assert_eq!(out, json!("line one\nline two"));
    }

    #[tokio::test]
    async fn call_tool_returns_raw_structure_when_no_text() {
        let mut mgr = ToolProviderManager::new();
        let result = json!({"content": [{"type": "image", "data": "…"}]});
        mgr.register("files", fake(result.clone()), vec![spec("read")]);
        let out = mgr.call_tool("read", &Map::new()).await.unwrap();
        assert_eq!(out, result);
    }

    #[tokio::test]
    async fn unknown_tool_and_disconnected_provider_fail_distinctly() {
        let mut mgr = ToolProviderManager::new();
        mgr.register("files", fake(json!(null)), vec![spec("read")]);

        let err = mgr.call_tool("nope", &Map::new()).await.unwrap_err();
        assert!(matches!(err, ToolError::UnknownTool(_)));

        // Tear the provider down underneath the index.
        mgr.providers.clear();
        let err = mgr.call_tool("read", &Map::new()).await.unwrap_err();
        assert!(matches!(err, ToolError::ProviderDisconnected(_)));
    }

    #[tokio::test]
    async fn provider_error_becomes_call_failed() {
        let mut mgr = ToolProviderManager::new();
        mgr.register(
            "files",
            Box::new(FakeClient { result: json!(null), fail: true }),
            vec![spec("read")],
        );
        let err = mgr.call_tool("read", &Map::new()).await.unwrap_err();
        assert!(matches!(err, ToolError::CallFailed(ref m) if m.contains("boom")));
    }

    #[tokio::test]
    async fn qualified_call_uses_plain_name_against_provider() {
        struct NameEcho;
        #[async_trait]
        impl ProviderClient for NameEcho {
            async fn list_tools(&self) -> anyhow::Result<Vec<ToolSpec>> {
                Ok(Vec::new())
            }
            async fn call_tool(
                &self,
                name: &str,
                _arguments: Option<Map<String, Value>>,
            ) -> anyhow::Result<Value> {
                Ok(json!(name))
            }
            async fn close(self: Box<Self>) -> anyhow::Result<()> {
                Ok(())
            }
        }
        let mut mgr = ToolProviderManager::new();
        mgr.register("files", Box::new(NameEcho), vec![spec("read")]);
        let out = mgr.call_tool("files__read", &Map::new()).await.unwrap();
        assert_eq!(out, json!("read"));
    }

    #[tokio::test]
    async fn disconnect_all_clears_every_index() {
        let mut mgr = ToolProviderManager::new();
        mgr.register("files", fake(json!(null)), vec![spec("read")]);
        mgr.disconnect_all().await;
        assert!(mgr.get_all_tools().is_empty());
        assert!(matches!(
            mgr.call_tool("read", &Map::new()).await.unwrap_err(),
            ToolError::UnknownTool(_)
        ));
    }
}

//! Tool side-channel: the boundary the agent loop negotiates with.
//!
//! `ToolPort` is the external surface (list tools, call one by name with a
//! timeout). `ToolRegistry` is the in-process implementation: named tools
//! registered behind a lock, each declaring a JSON Schema for its
//! parameters so the model can be shown what is callable.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// The designated terminal tool: calling it is the only legitimate way for
/// the agent loop to end with a reply decision.
pub const FINAL_REPLY_TOOL: &str = "emit_reply";

/// A tool definition as shown to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// A tool the agent can invoke during its negotiation loop.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name used in tool-call JSON (e.g. "web_search").
    fn name(&self) -> &str;

    /// Human-readable description shown to the model.
    fn description(&self) -> &str;

    /// JSON Schema describing the tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute the tool with the given arguments.
    async fn execute(&self, arguments: serde_json::Value) -> Result<serde_json::Value>;
}

/// External tool boundary: what the agent loop actually depends on.
#[async_trait]
pub trait ToolPort: Send + Sync {
    async fn list_tools(&self) -> Vec<ToolSpec>;

    async fn call_tool(&self, name: &str, arguments: serde_json::Value)
        -> Result<serde_json::Value>;
}

/// Thread-safe registry of tools, with a per-call timeout.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
    call_timeout: Duration,
}

impl ToolRegistry {
    pub fn new(call_timeout: Duration) -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            call_timeout,
        }
    }

    /// Register a tool. Overwrites any existing tool with the same name.
    pub async fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        tracing::info!("Registered tool: {}", name);
        self.tools.write().await.insert(name, tool);
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().await.get(name).cloned()
    }
}

#[async_trait]
impl ToolPort for ToolRegistry {
    async fn list_tools(&self) -> Vec<ToolSpec> {
        let tools = self.tools.read().await;
        let mut specs: Vec<ToolSpec> = tools
            .values()
            .map(|tool| ToolSpec {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters_schema(),
            })
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let tool = self
            .get(name)
            .await
            .ok_or_else(|| anyhow::anyhow!("Unknown tool: {}", name))?;

        match tokio::time::timeout(self.call_timeout, tool.execute(arguments)).await {
            Ok(result) => result,
            Err(_) => anyhow::bail!(
                "Tool '{}' timed out after {:?}",
                name,
                self.call_timeout
            ),
        }
    }
}

/// The terminal tool. Echoes the model's reply decision back as the tool
/// result so the loop can extract `{should_reply, reply}` uniformly.
pub struct EmitReplyTool;

#[async_trait]
impl Tool for EmitReplyTool {
    fn name(&self) -> &str {
        FINAL_REPLY_TOOL
    }

    fn description(&self) -> &str {
        "End the exchange. Supply `content` (the reply text) and `should_reply` \
         (false to stay silent)."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "content": {
                    "type": "string",
                    "description": "The final reply text"
                },
                "should_reply": {
                    "type": "boolean",
                    "description": "Whether a reply should be sent at all"
                }
            },
            "required": ["should_reply"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<serde_json::Value> {
        let should_reply = arguments
            .get("should_reply")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        let reply = arguments
            .get("content")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        Ok(serde_json::json!({
            "should_reply": should_reply,
            "reply": reply,
        }))
    }
}

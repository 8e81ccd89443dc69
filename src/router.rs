//! Message admission, structured commands, and the generation entry point.

use std::collections::HashSet;
use std::sync::Arc;

use crate::agent::AgentService;
use crate::llm_client::GenerationMeta;
use crate::prompting::ReplyMode;
use crate::tools::ToolPort;

/// Source name whose messages are subject to the group allow-set.
pub const GROUP_SOURCE: &str = "group";

/// A command issued outside the chat flow (`help`, `ping`, `tools`).
#[derive(Debug, Clone)]
pub struct StructuredCommand {
    pub name: String,
    pub args: serde_json::Value,
}

impl StructuredCommand {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            args: serde_json::Value::Null,
        }
    }
}

pub struct Router {
    agent: Arc<AgentService>,
    tools: Arc<dyn ToolPort>,
    allowed_group_ids: HashSet<i64>,
}

impl Router {
    pub fn new(
        agent: Arc<AgentService>,
        tools: Arc<dyn ToolPort>,
        allowed_group_ids: HashSet<i64>,
    ) -> Self {
        Self {
            agent,
            tools,
            allowed_group_ids,
        }
    }

    /// Trimmed message text, or `None` when there is nothing to process.
    pub fn normalize_text(&self, msg: Option<&str>) -> Option<String> {
        let clean = msg?.trim();
        if clean.is_empty() {
            None
        } else {
            Some(clean.to_string())
        }
    }

    /// Group traffic is gated by the allow-set; every other source passes.
    /// An empty allow-set admits every group.
    pub fn should_process_message(&self, source: &str, group_id: Option<i64>) -> bool {
        if source != GROUP_SOURCE {
            return true;
        }
        if self.allowed_group_ids.is_empty() {
            return true;
        }
        match group_id {
            Some(id) => self.allowed_group_ids.contains(&id),
            None => false,
        }
    }

    pub async fn process_agent(&self, content: &str, is_direct: bool, reply_mode: ReplyMode) -> String {
        let meta = GenerationMeta {
            is_direct,
            reply_mode,
        };
        self.agent.process(content, &meta).await
    }

    pub async fn handle_structured(&self, command: &StructuredCommand) -> String {
        match command.name.as_str() {
            "help" => "可用结构化命令:\n\
                       - help: 查看命令帮助\n\
                       - ping: 健康检查\n\
                       - tools: 列出可用工具"
                .to_string(),
            "ping" => "pong".to_string(),
            "tools" => {
                let specs = self.tools.list_tools().await;
                if specs.is_empty() {
                    return "当前没有已注册的工具。".to_string();
                }
                let mut out = String::from("可用工具:");
                for spec in specs {
                    out.push_str(&format!("\n- {}: {}", spec.name, spec.description));
                }
                out
            }
            other => format!("不支持的命令: {}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::ExhaustionPolicy;
    use crate::llm_client::Generator;
    use crate::prompting::PromptBundle;
    use crate::tools::{EmitReplyTool, ToolRegistry};
    use async_trait::async_trait;
    use std::time::Duration;

    struct CannedGenerator(String);

    #[async_trait]
    impl Generator for CannedGenerator {
        async fn generate(&self, _system: &str, _content: &str, _meta: &GenerationMeta) -> String {
            self.0.clone()
        }
    }

    async fn router_with(allowed: &[i64], canned: &str) -> Router {
        let registry = Arc::new(ToolRegistry::new(Duration::from_secs(5)));
        registry.register(Arc::new(EmitReplyTool)).await;
        let agent = Arc::new(AgentService::new(
            Arc::new(CannedGenerator(canned.to_string())),
            registry.clone(),
            PromptBundle::new("base".into(), "extra".into(), "【紧张模式补充】".into()),
            3,
            ExhaustionPolicy::Silent,
        ));
        Router::new(agent, registry, allowed.iter().copied().collect())
    }

    #[tokio::test]
    async fn normalize_strips_and_rejects_empty() {
        let router = router_with(&[], "x").await;
        assert_eq!(router.normalize_text(Some("  hi  ")), Some("hi".to_string()));
        assert_eq!(router.normalize_text(Some("   ")), None);
        assert_eq!(router.normalize_text(None), None);
    }

    #[tokio::test]
    async fn non_group_sources_are_never_gated() {
        let router = router_with(&[42], "x").await;
        assert!(router.should_process_message("console", None));
        assert!(router.should_process_message("dm", Some(999)));
    }

    #[tokio::test]
    async fn empty_allow_set_admits_every_group() {
        let router = router_with(&[], "x").await;
        assert!(router.should_process_message(GROUP_SOURCE, Some(123)));
        assert!(router.should_process_message(GROUP_SOURCE, None));
    }

    #[tokio::test]
    async fn allow_set_filters_group_traffic() {
        let router = router_with(&[42], "x").await;
        assert!(router.should_process_message(GROUP_SOURCE, Some(42)));
        assert!(!router.should_process_message(GROUP_SOURCE, Some(7)));
        // A group message with no id cannot be admitted once a set exists.
        assert!(!router.should_process_message(GROUP_SOURCE, None));
    }

    #[tokio::test]
    async fn structured_commands_answer_locally() {
        let router = router_with(&[], "x").await;
        let help = router.handle_structured(&StructuredCommand::new("help")).await;
        assert!(help.contains("ping"));
        assert!(help.contains("tools"));

        let pong = router.handle_structured(&StructuredCommand::new("ping")).await;
        assert_eq!(pong, "pong");

        let tools = router.handle_structured(&StructuredCommand::new("tools")).await;
        assert!(tools.contains("emit_reply"));

        let unknown = router.handle_structured(&StructuredCommand::new("restart")).await;
        assert!(unknown.contains("不支持的命令"));
    }

    #[tokio::test]
    async fn process_agent_runs_the_loop() {
        let router = router_with(
            &[],
            r#"{"type":"tool_call","tool":"emit_reply","arguments":{"content":"hello","should_reply":true}}"#,
        )
        .await;
        let reply = router.process_agent("hi", true, ReplyMode::Auto).await;
        assert_eq!(reply, "hello");
    }
}

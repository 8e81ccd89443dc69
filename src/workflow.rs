//! The message pipeline: adapter -> router -> heartbeat -> context -> reply.
//!
//! The workflow owns ordering, not behavior: admission and commands belong
//! to the router, engagement and memory to the context engine, generation
//! to the agent. Lifecycle events are emitted to hooks at every step; a
//! failing hook is logged and skipped, never fatal.

use std::sync::Arc;

use anyhow::Result;
use serde_json::{json, Value};

use crate::context::ContextEngine;
use crate::prompting::ReplyMode;
use crate::router::{Router, StructuredCommand, GROUP_SOURCE};

/// Pluggable observer for workflow lifecycle events.
pub trait WorkflowHook: Send + Sync {
    fn on_event(&self, name: &str, payload: &Value) -> Result<()>;
}

/// Default hook: events go to the tracing log.
pub struct LoggingHook;

impl WorkflowHook for LoggingHook {
    fn on_event(&self, name: &str, payload: &Value) -> Result<()> {
        tracing::info!("[workflow] {} | {}", name, payload);
        Ok(())
    }
}

/// One inbound unit of work.
#[derive(Debug, Clone, Default)]
pub struct Incoming {
    pub text: Option<String>,
    pub directed: bool,
    pub command: Option<StructuredCommand>,
    pub source: String,
    pub group_id: Option<i64>,
    pub user_name: Option<String>,
}

impl Incoming {
    pub fn text(source: &str, text: &str) -> Self {
        Self {
            text: Some(text.to_string()),
            source: source.to_string(),
            ..Self::default()
        }
    }

    pub fn command(source: &str, command: StructuredCommand) -> Self {
        Self {
            command: Some(command),
            source: source.to_string(),
            ..Self::default()
        }
    }

    pub fn directed(mut self) -> Self {
        self.directed = true;
        self
    }

    pub fn from_group(mut self, group_id: i64) -> Self {
        self.group_id = Some(group_id);
        self
    }

    pub fn with_user(mut self, user_name: &str) -> Self {
        self.user_name = Some(user_name.to_string());
        self
    }
}

pub struct MessageWorkflow {
    router: Arc<Router>,
    context: Arc<ContextEngine>,
    hooks: Vec<Box<dyn WorkflowHook>>,
}

impl MessageWorkflow {
    pub fn new(router: Arc<Router>, context: Arc<ContextEngine>) -> Self {
        Self {
            router,
            context,
            hooks: vec![Box::new(LoggingHook)],
        }
    }

    pub fn with_hooks(
        router: Arc<Router>,
        context: Arc<ContextEngine>,
        hooks: Vec<Box<dyn WorkflowHook>>,
    ) -> Self {
        let mut workflow = Self {
            router,
            context,
            hooks,
        };
        if workflow.hooks.is_empty() {
            workflow.hooks.push(Box::new(LoggingHook));
        }
        workflow
    }

    pub fn add_hook(&mut self, hook: Box<dyn WorkflowHook>) {
        self.hooks.push(hook);
    }

    /// Run one message through the pipeline. `None` means silence.
    pub async fn process(&self, incoming: Incoming) -> Option<String> {
        if let Some(command) = incoming.command.as_ref() {
            let response = self.router.handle_structured(command).await;
            self.emit(
                "router.command",
                json!({"source": incoming.source, "command": command.name}),
            );
            return Some(response);
        }

        if !self
            .router
            .should_process_message(&incoming.source, incoming.group_id)
        {
            self.emit(
                "adapter.ignore",
                json!({
                    "source": incoming.source,
                    "reason": "group_not_allowed",
                    "group_id": incoming.group_id,
                }),
            );
            return None;
        }

        let clean = match self.router.normalize_text(incoming.text.as_deref()) {
            Some(clean) => clean,
            None => {
                self.emit(
                    "adapter.ignore",
                    json!({"source": incoming.source, "reason": "empty_message"}),
                );
                return None;
            }
        };

        self.emit(
            "adapter.captured",
            json!({
                "source": incoming.source,
                "message": clean,
                "directed": incoming.directed,
                "group_id": incoming.group_id,
                "user_name": incoming.user_name,
            }),
        );

        let scope = derive_scope(&incoming.source, incoming.group_id);
        let user_name = incoming.user_name.as_deref();

        let (_, was_tense_before) = self.context.heartbeat_snapshot(&scope);
        let should_reply = self
            .context
            .should_engage(&scope, &clean, incoming.directed);
        let (heartbeat, is_tense_now) = self.context.heartbeat_snapshot(&scope);
        let reply_mode = if incoming.directed || was_tense_before {
            ReplyMode::Tense
        } else {
            ReplyMode::Auto
        };
        self.emit(
            "heartbeat.checked",
            json!({
                "should_reply": should_reply,
                "heartbeat": (heartbeat * 100.0).round() / 100.0,
                "is_tense": is_tense_now,
                "reply_mode": reply_mode.as_str(),
                "scope": scope,
            }),
        );

        if !should_reply {
            self.context.remember_user(&scope, &clean, user_name);
            self.emit("context.user_recorded", json!({"reply": false}));
            return None;
        }

        let composed = self.context.compose_input(&scope, &clean);
        self.context.remember_user(&scope, &clean, user_name);
        self.emit(
            "context.composed",
            json!({"has_history": composed.contains("对话记忆")}),
        );

        let reply = self
            .router
            .process_agent(&composed, incoming.directed, reply_mode)
            .await;
        if reply.trim().is_empty() {
            self.emit("workflow.no_reply", json!({"reason": "empty_reply"}));
            return None;
        }

        self.context.remember_assistant(&scope, &reply);
        self.context.on_engaged(&scope, &clean, &reply);
        self.emit("workflow.replied", json!({"reply": reply}));
        Some(reply)
    }

    fn emit(&self, name: &str, payload: Value) {
        for hook in &self.hooks {
            if let Err(e) = hook.on_event(name, &payload) {
                tracing::debug!("Workflow hook failed on '{}': {:#}", name, e);
            }
        }
    }
}

fn derive_scope(source: &str, group_id: Option<i64>) -> String {
    if source == GROUP_SOURCE {
        if let Some(id) = group_id {
            return format!("{}_{}", source, id);
        }
    }
    if source.trim().is_empty() {
        "default".to_string()
    } else {
        source.to_string()
    }
}

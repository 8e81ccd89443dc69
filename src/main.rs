use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use perk::agent::{AgentService, ExhaustionPolicy};
use perk::config::PerkConfig;
use perk::context::ContextEngine;
use perk::heartbeat::store::HeartbeatStore;
use perk::heartbeat::SystemClock;
use perk::llm_client::LlmClient;
use perk::prompting::PromptBundle;
use perk::router::{Router, StructuredCommand};
use perk::tools::{EmitReplyTool, ToolRegistry};
use perk::workflow::{Incoming, MessageWorkflow};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,perk=debug")),
        )
        .init();

    tracing::info!("Perk starting...");

    let config = PerkConfig::load();
    let workflow = build_workflow(&config).await;

    run_console(&workflow).await
}

async fn build_workflow(config: &PerkConfig) -> MessageWorkflow {
    let registry = Arc::new(ToolRegistry::new(Duration::from_secs(
        config.agent.tool_call_timeout_secs.max(1),
    )));
    registry.register(Arc::new(EmitReplyTool)).await;

    let prompts = PromptBundle::new(
        config.auto_system.clone(),
        config.tense_extra.clone(),
        config.tense_section_title.clone(),
    );
    let generator = Arc::new(LlmClient::new(config.llm.clone()));
    let agent = Arc::new(AgentService::new(
        generator,
        registry.clone(),
        prompts,
        config.agent.max_steps,
        ExhaustionPolicy::from_config(&config.agent.on_exhaustion),
    ));

    let allowed: HashSet<i64> = config.allowed_group_ids.iter().copied().collect();
    let router = Arc::new(Router::new(agent, registry, allowed));

    let store_path = Path::new(&config.data_dir).join("heartbeat.sqlite3");
    let store = match HeartbeatStore::new(&store_path) {
        Ok(store) => Some(Arc::new(store)),
        Err(e) => {
            tracing::warn!(
                "Failed to open heartbeat store at {:?}, state will not persist: {:#}",
                store_path,
                e
            );
            None
        }
    };

    let context = Arc::new(ContextEngine::new(
        config.data_dir.clone(),
        config.recent_limit,
        config.heartbeat.clone(),
        store,
        Arc::new(SystemClock),
    ));

    MessageWorkflow::new(router, context)
}

/// Minimal local adapter: one message per stdin line. A leading `@` marks
/// the message as directed; `/help`, `/ping` and `/tools` are commands.
async fn run_console(workflow: &MessageWorkflow) -> Result<()> {
    println!("perk console. `@message` speaks to the bot directly, /help for commands, Ctrl-D exits.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let incoming = match parse_line(&line) {
            Some(incoming) => incoming,
            None => continue,
        };
        if let Some(reply) = workflow.process(incoming).await {
            println!("{}", reply);
        }
    }

    tracing::info!("Perk shutting down");
    Ok(())
}

fn parse_line(line: &str) -> Option<Incoming> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Some(command) = trimmed.strip_prefix('/') {
        return Some(Incoming::command(
            "console",
            StructuredCommand::new(command.trim()),
        ));
    }

    if let Some(directed) = trimmed.strip_prefix('@') {
        return Some(Incoming::text("console", directed.trim()).directed());
    }

    Some(Incoming::text("console", trimmed))
}

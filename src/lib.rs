pub mod agent;
pub mod config;
pub mod context;
pub mod heartbeat;
pub mod llm_client;
pub mod memory;
pub mod prompting;
pub mod router;
pub mod tools;
pub mod workflow;

pub use agent::{AgentService, ExhaustionPolicy};
pub use config::PerkConfig;
pub use context::ContextEngine;
pub use heartbeat::{HeartbeatMonitor, HoldPolicy};
pub use llm_client::{Generator, LlmClient};
pub use prompting::ReplyMode;
pub use router::{Router, StructuredCommand};
pub use workflow::{Incoming, MessageWorkflow, WorkflowHook};

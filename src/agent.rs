//! Bounded tool-calling agent loop.
//!
//! The model negotiates through structured JSON actions, one per round, and
//! the only legitimate way to end with a reply is the terminal `emit_reply`
//! tool. Model output is parsed tolerantly (strict JSON, then a tagged block
//! with common syntax slips repaired, then a brace-bounded substring);
//! anything still unparseable costs the model a round.

use std::sync::{Arc, OnceLock};

use regex_lite::Regex;
use serde_json::Value;

use crate::llm_client::{GenerationMeta, Generator};
use crate::prompting::{passive_gate_system_prompt, PromptBundle, ReplyMode};
use crate::tools::{ToolPort, ToolSpec, FINAL_REPLY_TOOL};

/// What to do when the round budget runs out without a terminal tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExhaustionPolicy {
    /// Say nothing. Preferred: a model that cannot close the loop should
    /// not be paraphrased into a reply.
    Silent,
    /// Fall back to one plain generation call (legacy behavior).
    DirectAnswer,
}

impl ExhaustionPolicy {
    pub fn from_config(name: &str) -> Self {
        match name.trim() {
            "direct_answer" => ExhaustionPolicy::DirectAnswer,
            _ => ExhaustionPolicy::Silent,
        }
    }
}

/// One parsed model action.
#[derive(Debug)]
enum ModelAction {
    ToolCall { tool: String, arguments: Value },
    Final { content: String },
    Violation,
}

pub struct AgentService {
    generator: Arc<dyn Generator>,
    tools: Arc<dyn ToolPort>,
    prompts: PromptBundle,
    max_steps: usize,
    exhaustion: ExhaustionPolicy,
}

impl AgentService {
    pub fn new(
        generator: Arc<dyn Generator>,
        tools: Arc<dyn ToolPort>,
        prompts: PromptBundle,
        max_steps: usize,
        exhaustion: ExhaustionPolicy,
    ) -> Self {
        Self {
            generator,
            tools,
            prompts,
            max_steps: max_steps.max(1),
            exhaustion,
        }
    }

    /// Run the full exchange for one composed input. Returns the reply text,
    /// or an empty string when the decision is to stay silent.
    pub async fn process(&self, composed: &str, meta: &GenerationMeta) -> String {
        if meta.reply_mode == ReplyMode::Tense && !meta.is_direct {
            let verdict = self
                .generator
                .generate(&passive_gate_system_prompt(), composed, meta)
                .await;
            if !verdict.trim().eq_ignore_ascii_case("true") {
                tracing::debug!("Passive gate declined: {:?}", verdict.trim());
                return String::new();
            }
        }

        let specs = self.tools.list_tools().await;
        if specs.is_empty() {
            let system = self.prompts.system_prompt(meta.reply_mode);
            return self.generator.generate(&system, composed, meta).await;
        }

        self.run_tool_loop(composed, meta, &specs).await
    }

    async fn run_tool_loop(
        &self,
        composed: &str,
        meta: &GenerationMeta,
        specs: &[ToolSpec],
    ) -> String {
        let system = tool_loop_system_prompt(&self.prompts.system_prompt(meta.reply_mode), specs);
        let mut content = composed.to_string();

        for step in 0..self.max_steps {
            let raw = self.generator.generate(&system, &content, meta).await;

            match classify_model_output(&raw) {
                ModelAction::Final { content } => return content.trim().to_string(),
                ModelAction::ToolCall { tool, arguments } if tool == FINAL_REPLY_TOOL => {
                    return self.finish(arguments).await;
                }
                ModelAction::ToolCall { tool, arguments } => {
                    tracing::debug!(step, tool = %tool, "Agent tool call");
                    content = match self.tools.call_tool(&tool, arguments).await {
                        Ok(result) => format!(
                            "{}\n\n[工具 {} 返回 / tool result]\n{}\n\n请基于以上结果继续，\
                             完成时调用 {}。",
                            composed, tool, result, FINAL_REPLY_TOOL
                        ),
                        Err(e) => {
                            tracing::warn!("Tool '{}' failed: {:#}", tool, e);
                            format!(
                                "{}\n\n[工具 {} 调用失败 / tool failed]\n{}\n\n请换一种方式继续，\
                                 完成时调用 {}。",
                                composed, tool, e, FINAL_REPLY_TOOL
                            )
                        }
                    };
                }
                ModelAction::Violation => {
                    tracing::debug!(step, "Unparseable model action, re-prompting");
                    content = format!(
                        "{}\n\n上一条输出不符合协议。只允许输出一个 JSON 对象：\
                         {{\"type\":\"tool_call\",\"tool\":\"...\",\"arguments\":{{...}}}}，\
                         不要输出其他文字。",
                        composed
                    );
                }
            }
        }

        match self.exhaustion {
            ExhaustionPolicy::Silent => String::new(),
            ExhaustionPolicy::DirectAnswer => {
                let system = self.prompts.system_prompt(meta.reply_mode);
                self.generator.generate(&system, composed, meta).await
            }
        }
    }

    /// Resolve the terminal tool call into the final reply decision.
    async fn finish(&self, arguments: Value) -> String {
        let fallback = reply_decision(&arguments);
        match self.tools.call_tool(FINAL_REPLY_TOOL, arguments).await {
            Ok(result) => match find_reply_payload(&result, 0) {
                Some((false, _)) => String::new(),
                Some((true, reply)) => reply.trim().to_string(),
                None => fallback,
            },
            Err(e) => {
                tracing::warn!("Terminal tool call failed: {:#}", e);
                fallback
            }
        }
    }
}

/// Interpret `emit_reply` arguments directly: absent `should_reply` means
/// yes, absent `content` means silence anyway.
fn reply_decision(arguments: &Value) -> String {
    let should_reply = arguments
        .get("should_reply")
        .and_then(Value::as_bool)
        .unwrap_or(true);
    if !should_reply {
        return String::new();
    }
    arguments
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_string()
}

/// Depth-bounded search for a `{should_reply: bool, reply?: string}` object
/// nested anywhere inside a tool result, including payloads serialized as
/// JSON text inside string fields (the usual text-envelope shape).
fn find_reply_payload(value: &Value, depth: usize) -> Option<(bool, String)> {
    if depth > 4 {
        return None;
    }
    match value {
        Value::Object(map) => {
            if let Some(should) = map.get("should_reply").and_then(Value::as_bool) {
                let reply = map
                    .get("reply")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                return Some((should, reply));
            }
            map.values().find_map(|v| find_reply_payload(v, depth + 1))
        }
        Value::Array(items) => items.iter().find_map(|v| find_reply_payload(v, depth + 1)),
        Value::String(text) => serde_json::from_str::<Value>(text)
            .ok()
            .and_then(|inner| find_reply_payload(&inner, depth + 1)),
        _ => None,
    }
}

fn tool_loop_system_prompt(base: &str, specs: &[ToolSpec]) -> String {
    let mut listing = String::new();
    for spec in specs {
        listing.push_str(&format!(
            "- {}: {}\n  参数 schema: {}\n",
            spec.name, spec.description, spec.parameters
        ));
    }
    format!(
        "{base}\n\n可用工具 / available tools:\n{listing}\n\
         每轮只输出一个 JSON 对象，不要输出其他文字：\n\
         {{\"type\":\"tool_call\",\"tool\":\"工具名\",\"arguments\":{{...}}}}\n\
         要结束对话并给出最终回复（或决定不回复），调用 {final_tool}，\
         arguments 里带 content 和 should_reply。",
        base = base,
        listing = listing,
        final_tool = FINAL_REPLY_TOOL,
    )
}

fn classify_model_output(raw: &str) -> ModelAction {
    match parse_action_json(raw) {
        Some(value) => classify_value(value),
        None => ModelAction::Violation,
    }
}

fn classify_value(value: Value) -> ModelAction {
    let kind = value.get("type").and_then(Value::as_str).unwrap_or("");
    match kind {
        "tool_call" => {
            let tool = value
                .get("tool")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            if tool.is_empty() {
                return ModelAction::Violation;
            }
            let arguments = value
                .get("arguments")
                .cloned()
                .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
            ModelAction::ToolCall { tool, arguments }
        }
        "final" => ModelAction::Final {
            content: value
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
        },
        _ => ModelAction::Violation,
    }
}

/// Parse order: the whole trimmed output as JSON, then a
/// `[TOOL_CALL]...[/TOOL_CALL]` block with common slips repaired, then the
/// substring between the first `{` and the last `}`.
fn parse_action_json(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if value.is_object() {
            return Some(value);
        }
    }

    if let Some(block) = extract_tagged_block(trimmed) {
        if let Ok(value) = serde_json::from_str::<Value>(&repair_json(&block)) {
            if value.is_object() {
                return Some(value);
            }
        }
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Value>(&trimmed[start..=end])
        .ok()
        .filter(Value::is_object)
}

fn extract_tagged_block(text: &str) -> Option<String> {
    let start = text.find("[TOOL_CALL]")? + "[TOOL_CALL]".len();
    let end = text[start..].find("[/TOOL_CALL]")? + start;
    Some(text[start..end].trim().to_string())
}

/// Repair the slips models actually make inside tagged blocks: `=>` instead
/// of `:` and bare (unquoted) object keys.
fn repair_json(block: &str) -> String {
    static BARE_KEY: OnceLock<Regex> = OnceLock::new();
    let bare_key = BARE_KEY.get_or_init(|| {
        Regex::new(r"([{,]\s*)([A-Za-z_][A-Za-z0-9_]*)(\s*):").expect("bare key pattern")
    });

    let arrows_fixed = block.replace("=>", ":");
    bare_key
        .replace_all(&arrows_fixed, "$1\"$2\"$3:")
        .into_owned()
}

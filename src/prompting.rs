//! Reply modes and system-prompt assembly.

use serde::{Deserialize, Serialize};

/// How the reply should be framed: `Tense` when the scope is in an active
/// exchange (or the message was directed), `Auto` otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyMode {
    Auto,
    Tense,
}

impl ReplyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplyMode::Auto => "auto",
            ReplyMode::Tense => "tense",
        }
    }
}

/// The base system prompt plus the addendum appended in tense mode.
#[derive(Debug, Clone)]
pub struct PromptBundle {
    pub auto_system: String,
    pub tense_extra: String,
    pub tense_section_title: String,
}

impl PromptBundle {
    pub fn new(auto_system: String, tense_extra: String, tense_section_title: String) -> Self {
        Self {
            auto_system,
            tense_extra,
            tense_section_title,
        }
    }

    pub fn system_prompt(&self, mode: ReplyMode) -> String {
        match mode {
            ReplyMode::Tense => format!(
                "{}\n\n{}\n{}",
                self.auto_system, self.tense_section_title, self.tense_extra
            ),
            ReplyMode::Auto => self.auto_system.clone(),
        }
    }
}

/// Gate prompt used before replying to a passive message in a tense scope:
/// the model must answer only "true" or "false".
pub fn passive_gate_system_prompt() -> String {
    "你是群聊回复闸门。判断现在是否值得接话。\
     只输出 true 或 false，不要输出其他任何内容。\n\
     You are a reply gate for a group chat. Decide whether chiming in now is \
     worthwhile. Output only `true` or `false`, nothing else."
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle() -> PromptBundle {
        PromptBundle::new(
            "base prompt".to_string(),
            "stay on topic".to_string(),
            "【紧张模式补充】".to_string(),
        )
    }

    #[test]
    fn auto_mode_is_just_the_base_prompt() {
        assert_eq!(bundle().system_prompt(ReplyMode::Auto), "base prompt");
    }

    #[test]
    fn tense_mode_appends_titled_addendum() {
        let prompt = bundle().system_prompt(ReplyMode::Tense);
        assert!(prompt.starts_with("base prompt\n\n"));
        assert!(prompt.contains("【紧张模式补充】\nstay on topic"));
    }
}

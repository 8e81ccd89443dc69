use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    // OpenAI-compatible endpoint (Ollama, LM Studio, vLLM, OpenAI, etc.)
    #[serde(default)]
    pub api_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

fn default_llm_model() -> String {
    "default".to_string()
}

fn default_llm_timeout() -> u64 {
    15
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            api_key: None,
            model: default_llm_model(),
            timeout_secs: default_llm_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_max_heartbeat")]
    pub max_heartbeat: f64,
    #[serde(default = "default_wakeup_growth")]
    pub wakeup_growth: f64,
    #[serde(default = "default_idle_growth")]
    pub idle_growth: f64,
    #[serde(default = "default_tense_boost")]
    pub tense_boost: f64,
    #[serde(default = "default_tense_floor")]
    pub tense_floor: f64,
    /// Seconds a tense hold lasts before the scope resets to idle.
    /// Zero disables the timer (tense persists until an unrelated message).
    #[serde(default = "default_hold_secs")]
    pub hold_secs: u64,
}

fn default_max_heartbeat() -> f64 {
    100.0
}

fn default_wakeup_growth() -> f64 {
    6.0
}

fn default_idle_growth() -> f64 {
    2.0
}

fn default_tense_boost() -> f64 {
    24.0
}

fn default_tense_floor() -> f64 {
    60.0
}

fn default_hold_secs() -> u64 {
    600
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            max_heartbeat: default_max_heartbeat(),
            wakeup_growth: default_wakeup_growth(),
            idle_growth: default_idle_growth(),
            tense_boost: default_tense_boost(),
            tense_floor: default_tense_floor(),
            hold_secs: default_hold_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLoopConfig {
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    /// When the round budget runs out without a terminal tool call:
    /// "silent" returns no reply, "direct_answer" falls back to a plain
    /// generation call (legacy behavior).
    #[serde(default = "default_exhaustion")]
    pub on_exhaustion: String,
    #[serde(default = "default_tool_call_timeout")]
    pub tool_call_timeout_secs: u64,
}

fn default_max_steps() -> usize {
    3
}

fn default_exhaustion() -> String {
    "silent".to_string()
}

fn default_tool_call_timeout() -> u64 {
    10
}

impl Default for AgentLoopConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            on_exhaustion: default_exhaustion(),
            tool_call_timeout_secs: default_tool_call_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerkConfig {
    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    #[serde(default)]
    pub agent: AgentLoopConfig,

    // Context memory
    #[serde(default = "default_recent_limit")]
    pub recent_limit: usize,

    // Group admission: empty list allows every group
    #[serde(default)]
    pub allowed_group_ids: Vec<i64>,

    // Storage root: heartbeat.sqlite3 plus context/<scope>.jsonl live here
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    // Base system prompt and the addendum appended in tense mode
    #[serde(default = "default_auto_system")]
    pub auto_system: String,
    #[serde(default = "default_tense_extra")]
    pub tense_extra: String,
    #[serde(default = "default_tense_section_title")]
    pub tense_section_title: String,
}

fn default_recent_limit() -> usize {
    100
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_auto_system() -> String {
    "你是群聊里的一位普通成员，回复要自然、简短。\
     You are an ordinary member of a group chat. Keep replies natural and short."
        .to_string()
}

fn default_tense_extra() -> String {
    "现在有人在和你持续对话，请紧扣当前话题回应。\
     Someone is actively talking with you. Stay on the current topic."
        .to_string()
}

fn default_tense_section_title() -> String {
    "【紧张模式补充】".to_string()
}

impl Default for PerkConfig {
    fn default() -> Self {
        Self {
            llm: LlmConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            agent: AgentLoopConfig::default(),
            recent_limit: default_recent_limit(),
            allowed_group_ids: Vec::new(),
            data_dir: default_data_dir(),
            auto_system: default_auto_system(),
            tense_extra: default_tense_extra(),
            tense_section_title: default_tense_section_title(),
        }
    }
}

impl PerkConfig {
    /// Path to the config file, next to the executable.
    pub fn config_path() -> PathBuf {
        let base = match env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        };
        base.join("perk_config.toml")
    }

    /// Load config from perk_config.toml, falling back to defaults.
    /// Environment variables override the LLM endpoint and key.
    pub fn load() -> Self {
        let path = Self::config_path();
        let mut config = match fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str::<PerkConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    config
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                    PerkConfig::default()
                }
            },
            Err(_) => {
                tracing::info!("No config file at {:?}, using defaults", path);
                PerkConfig::default()
            }
        };
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Some(url) = non_empty_env("PERK_LLM_API_URL") {
            self.llm.api_url = url;
        }
        if let Some(key) = non_empty_env("PERK_LLM_API_KEY") {
            self.llm.api_key = Some(key);
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = PerkConfig::default();
        assert_eq!(config.heartbeat.max_heartbeat, 100.0);
        assert_eq!(config.heartbeat.wakeup_growth, 6.0);
        assert_eq!(config.heartbeat.idle_growth, 2.0);
        assert_eq!(config.heartbeat.tense_boost, 24.0);
        assert_eq!(config.heartbeat.tense_floor, 60.0);
        assert_eq!(config.agent.max_steps, 3);
        assert_eq!(config.recent_limit, 100);
        assert!(config.allowed_group_ids.is_empty());
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let parsed: PerkConfig = toml::from_str(
            r#"
            recent_limit = 12

            [llm]
            api_url = "http://localhost:11434/v1"
            model = "llama3.2"

            [heartbeat]
            hold_secs = 0
            "#,
        )
        .unwrap();

        assert_eq!(parsed.recent_limit, 12);
        assert_eq!(parsed.llm.api_url, "http://localhost:11434/v1");
        assert_eq!(parsed.llm.timeout_secs, 15);
        assert_eq!(parsed.heartbeat.hold_secs, 0);
        assert_eq!(parsed.heartbeat.tense_floor, 60.0);
        assert_eq!(parsed.agent.on_exhaustion, "silent");
    }
}

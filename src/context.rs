//! Per-scope conversation context: recent window, durable log, and the
//! scope's heartbeat monitor, all behind one registry.
//!
//! Every scope gets its own mutex, so one busy group never blocks another.
//! A failed log open or append degrades that scope to in-memory operation
//! instead of failing the message.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::HeartbeatConfig;
use crate::heartbeat::store::HeartbeatStore;
use crate::heartbeat::{Clock, HeartbeatMonitor};
use crate::memory::MemoryPool;

/// Map a raw scope key to a filesystem- and sqlite-safe identifier.
/// Alphanumerics (including non-ASCII letters and digits) pass through, so
/// distinct CJK-named scopes stay distinct.
pub fn normalize_scope(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return "default".to_string();
    }
    trimmed
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

struct ScopeContext {
    window: Vec<String>,
    pool: Option<MemoryPool>,
    monitor: HeartbeatMonitor,
}

pub struct ContextEngine {
    data_dir: PathBuf,
    recent_limit: usize,
    heartbeat_config: HeartbeatConfig,
    store: Option<Arc<HeartbeatStore>>,
    clock: Arc<dyn Clock>,
    scopes: Mutex<HashMap<String, Arc<Mutex<ScopeContext>>>>,
}

impl ContextEngine {
    pub fn new(
        data_dir: impl Into<PathBuf>,
        recent_limit: usize,
        heartbeat_config: HeartbeatConfig,
        store: Option<Arc<HeartbeatStore>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            data_dir: data_dir.into(),
            recent_limit: recent_limit.max(1),
            heartbeat_config,
            store,
            clock,
            scopes: Mutex::new(HashMap::new()),
        }
    }

    /// Run the engagement decision for one message. Also advances the
    /// scope's heartbeat state.
    pub fn should_engage(&self, scope: &str, message: &str, is_direct: bool) -> bool {
        let handle = self.scope_handle(scope);
        let mut ctx = lock_scope(&handle);
        ctx.monitor.decide(message, is_direct)
    }

    /// Current (heartbeat, is_tense) for the scope, initializing it lazily.
    pub fn heartbeat_snapshot(&self, scope: &str) -> (f64, bool) {
        let handle = self.scope_handle(scope);
        let ctx = lock_scope(&handle);
        (ctx.monitor.heartbeat(), ctx.monitor.is_tense())
    }

    /// Anchor the scope's focus on the exchange that just completed.
    pub fn on_engaged(&self, scope: &str, trigger_message: &str, reply: &str) {
        let handle = self.scope_handle(scope);
        let mut ctx = lock_scope(&handle);
        ctx.monitor.on_invoked(trigger_message, reply);
    }

    /// Build the model input: the recent window under the memory template,
    /// or the bare message when the scope has no history yet.
    pub fn compose_input(&self, scope: &str, current_msg: &str) -> String {
        let handle = self.scope_handle(scope);
        let ctx = lock_scope(&handle);
        if ctx.window.is_empty() {
            return current_msg.to_string();
        }
        format!(
            "你可以参考以下对话记忆来回答问题。\n对话记忆:\n{}\n当前用户输入:\n{}",
            ctx.window.join("\n"),
            current_msg
        )
    }

    pub fn remember_user(&self, scope: &str, msg: &str, user_name: Option<&str>) {
        self.remember(scope, "user", msg, user_name);
    }

    pub fn remember_assistant(&self, scope: &str, msg: &str) {
        self.remember(scope, "assistant", msg, None);
    }

    fn remember(&self, scope: &str, role: &str, msg: &str, user_name: Option<&str>) {
        let clean = msg.trim();
        if clean.is_empty() {
            return;
        }
        let value = format!("{}: {}", role, clean);

        let handle = self.scope_handle(scope);
        let mut ctx = lock_scope(&handle);

        if let Some(pool) = ctx.pool.as_mut() {
            if let Err(e) = pool.append(&value, user_name) {
                tracing::warn!(
                    "Context log append failed for scope '{}', continuing in memory: {:#}",
                    scope,
                    e
                );
                ctx.pool = None;
            }
        }

        ctx.window.push(value);
        let limit = self.recent_limit;
        if ctx.window.len() > limit {
            let excess = ctx.window.len() - limit;
            ctx.window.drain(..excess);
        }
    }

    fn scope_handle(&self, scope: &str) -> Arc<Mutex<ScopeContext>> {
        let key = normalize_scope(scope);
        {
            let registry = self
                .scopes
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(handle) = registry.get(&key) {
                return handle.clone();
            }
        }

        // First touch replays the log and loads heartbeat state, so do it
        // without the registry lock. Racing initializers both build a
        // context; the first insert wins and the loser is dropped.
        let fresh = Arc::new(Mutex::new(self.init_scope(&key)));
        let mut registry = self
            .scopes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        registry.entry(key).or_insert(fresh).clone()
    }

    fn init_scope(&self, key: &str) -> ScopeContext {
        let log_path = self.data_dir.join("context").join(format!("{}.jsonl", key));
        let (pool, window) = match MemoryPool::open(&log_path) {
            Ok(pool) => {
                let window = pool.recent(self.recent_limit);
                (Some(pool), window)
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to open context log for scope '{}', continuing in memory: {:#}",
                    key,
                    e
                );
                (None, Vec::new())
            }
        };

        let monitor = HeartbeatMonitor::new(
            key,
            self.heartbeat_config.clone(),
            self.store.clone(),
            self.clock.clone(),
            Box::new(fastrand::Rng::new()),
        );

        ScopeContext {
            window,
            pool,
            monitor,
        }
    }
}

fn lock_scope(handle: &Arc<Mutex<ScopeContext>>) -> MutexGuard<'_, ScopeContext> {
    handle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heartbeat::SystemClock;
    use tempfile::tempdir;

    fn engine(dir: &std::path::Path, limit: usize) -> ContextEngine {
        ContextEngine::new(
            dir,
            limit,
            HeartbeatConfig::default(),
            None,
            Arc::new(SystemClock),
        )
    }

    #[test]
    fn scope_keys_are_normalized() {
        assert_eq!(normalize_scope("qq_group_42"), "qq_group_42");
        assert_eq!(normalize_scope("group/7:a b"), "group_7_a_b");
        assert_eq!(normalize_scope("   "), "default");
        assert_eq!(normalize_scope(""), "default");
    }

    #[test]
    fn unicode_scope_names_do_not_collide() {
        assert_eq!(normalize_scope("工作群"), "工作群");
        assert_eq!(normalize_scope("游戏群"), "游戏群");
        assert_ne!(normalize_scope("工作群"), normalize_scope("游戏群"));
        // Punctuation is still replaced.
        assert_eq!(normalize_scope("工作群/7"), "工作群_7");
    }

    #[test]
    fn compose_without_history_returns_message_unchanged() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path(), 10);
        assert_eq!(engine.compose_input("s", "你好"), "你好");
    }

    #[test]
    fn compose_with_history_uses_memory_template() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path(), 10);
        engine.remember_user("s", "hello", Some("alice"));
        engine.remember_assistant("s", "hi there");

        let composed = engine.compose_input("s", "what next");
        assert!(composed.contains("对话记忆:"));
        assert!(composed.contains("user: hello"));
        assert!(composed.contains("assistant: hi there"));
        assert!(composed.ends_with("当前用户输入:\nwhat next"));
    }

    #[test]
    fn window_is_trimmed_to_limit_but_log_keeps_everything() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path(), 2);
        for i in 0..5 {
            engine.remember_user("s", &format!("msg {}", i), None);
        }

        let composed = engine.compose_input("s", "now");
        assert!(!composed.contains("msg 2"));
        assert!(composed.contains("msg 3"));
        assert!(composed.contains("msg 4"));

        let pool = MemoryPool::open(dir.path().join("context").join("s.jsonl")).unwrap();
        assert_eq!(pool.len(), 5);
    }

    #[test]
    fn window_is_rebuilt_from_log_on_fresh_engine() {
        let dir = tempdir().unwrap();
        {
            let engine = engine(dir.path(), 10);
            engine.remember_user("s", "persisted line", Some("bob"));
        }
        let engine = engine(dir.path(), 10);
        let composed = engine.compose_input("s", "again");
        assert!(composed.contains("user: persisted line"));
    }

    #[test]
    fn blank_messages_are_not_recorded() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path(), 10);
        engine.remember_user("s", "   ", None);
        engine.remember_assistant("s", "");
        assert_eq!(engine.compose_input("s", "x"), "x");
    }

    #[test]
    fn directed_engagement_is_visible_in_snapshot() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path(), 10);
        assert_eq!(engine.heartbeat_snapshot("s"), (0.0, false));
        assert!(engine.should_engage("s", "hello", true));
        let (heartbeat, is_tense) = engine.heartbeat_snapshot("s");
        assert!(is_tense);
        assert!(heartbeat > 0.0);
    }

    #[test]
    fn scopes_are_isolated() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path(), 10);
        engine.remember_user("alpha", "only in alpha", None);
        assert!(engine.should_engage("alpha", "hello", true));

        assert_eq!(engine.compose_input("beta", "x"), "x");
        assert_eq!(engine.heartbeat_snapshot("beta"), (0.0, false));
    }

    #[test]
    fn concurrent_first_touch_lands_in_one_shared_scope() {
        let dir = tempdir().unwrap();
        let engine = Arc::new(engine(dir.path(), 10));

        let mut handles = Vec::new();
        for i in 0..4 {
            let engine = engine.clone();
            handles.push(std::thread::spawn(move || {
                engine.remember_user("busy", &format!("line {}", i), None);
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        // All writers ended up in the same scope context.
        let composed = engine.compose_input("busy", "x");
        for i in 0..4 {
            assert!(composed.contains(&format!("line {}", i)));
        }
    }

    #[test]
    fn raw_scope_names_map_to_the_same_normalized_scope() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path(), 10);
        engine.remember_user("group/7", "shared", None);
        let composed = engine.compose_input("group_7", "x");
        assert!(composed.contains("user: shared"));
    }
}

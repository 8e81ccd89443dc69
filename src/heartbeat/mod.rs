//! Heartbeat-based trigger state machine for passive activation.
//!
//! Each scope carries a bounded "heartbeat" scalar. Directed messages always
//! engage and put the scope into a tense hold; passive messages either grow
//! the heartbeat (idle) or are tested for lexical relatedness against the
//! current focus (tense). The trigger probability for idle traffic scales
//! linearly with the accumulated heartbeat.

pub mod store;

use std::sync::{Arc, OnceLock};

use chrono::Utc;
use regex_lite::Regex;

use crate::config::HeartbeatConfig;
use store::{HeartbeatState, HeartbeatStore};

/// Injectable time source so hold expiry is testable.
pub trait Clock: Send + Sync {
    fn now_unix(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix(&self) -> i64 {
        Utc::now().timestamp()
    }
}

/// Injectable randomness for the idle trigger draw.
pub trait TriggerSource: Send {
    /// Uniform draw in `[0, 1)`.
    fn draw(&mut self) -> f64;
}

impl TriggerSource for fastrand::Rng {
    fn draw(&mut self) -> f64 {
        self.f64()
    }
}

/// How long a tense hold lasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldPolicy {
    /// Hold expires after this many seconds, then the scope resets to idle.
    Timed(u64),
    /// Legacy behavior: tense persists until an unrelated message arrives.
    UntilUnrelated,
}

impl HoldPolicy {
    pub fn from_secs(hold_secs: u64) -> Self {
        if hold_secs == 0 {
            HoldPolicy::UntilUnrelated
        } else {
            HoldPolicy::Timed(hold_secs)
        }
    }
}

pub struct HeartbeatMonitor {
    scope: String,
    config: HeartbeatConfig,
    hold: HoldPolicy,
    state: HeartbeatState,
    store: Option<Arc<HeartbeatStore>>,
    clock: Arc<dyn Clock>,
    trigger: Box<dyn TriggerSource>,
}

impl HeartbeatMonitor {
    /// Build a monitor for `scope`, loading any persisted state. A store
    /// load failure degrades to a fresh idle state.
    pub fn new(
        scope: &str,
        config: HeartbeatConfig,
        store: Option<Arc<HeartbeatStore>>,
        clock: Arc<dyn Clock>,
        trigger: Box<dyn TriggerSource>,
    ) -> Self {
        let state = match store.as_deref().map(|s| s.load(scope)) {
            Some(Ok(Some(state))) => state,
            Some(Ok(None)) | None => HeartbeatState::idle(),
            Some(Err(e)) => {
                tracing::warn!("Failed to load heartbeat state for '{}': {}", scope, e);
                HeartbeatState::idle()
            }
        };

        let hold = HoldPolicy::from_secs(config.hold_secs);
        Self {
            scope: scope.to_string(),
            config,
            hold,
            state,
            store,
            clock,
            trigger,
        }
    }

    pub fn heartbeat(&self) -> f64 {
        self.state.heartbeat
    }

    pub fn is_tense(&self) -> bool {
        self.state.is_tense
    }

    pub fn focus_text(&self) -> &str {
        &self.state.focus_text
    }

    /// Decide whether to engage with `message`. Always engages on directed
    /// messages; otherwise applies the relatedness (tense) or probabilistic
    /// (idle) path. State is persisted after every decision.
    pub fn decide(&mut self, message: &str, is_direct: bool) -> bool {
        let clean = message.trim();
        if clean.is_empty() {
            return false;
        }

        if is_direct {
            self.set_tense(clean);
            self.raise_heartbeat();
            self.persist();
            return true;
        }

        // An expired hold means the scope fell back to idle before this
        // message is evaluated.
        if self.state.is_tense && self.hold_expired() {
            self.drop_to_zero();
        }

        if self.state.is_tense {
            if self.is_related(clean) {
                self.set_tense(clean);
                self.raise_heartbeat();
                self.persist();
                return true;
            }
            self.drop_to_zero();
            self.persist();
            return false;
        }

        self.grow_idle_heartbeat();
        let trigger_prob = self.state.heartbeat / self.config.max_heartbeat;
        let engaged = self.trigger.draw() < trigger_prob;
        if engaged {
            self.set_tense(clean);
        }
        self.persist();
        engaged
    }

    /// Anchor attention on the exchange that just happened so the next
    /// passive message is tested against it.
    pub fn on_invoked(&mut self, trigger_message: &str, reply: &str) {
        let merged = format!("{} {}", trigger_message.trim(), reply.trim());
        self.set_tense(merged.trim());
        self.raise_heartbeat();
        self.persist();
    }

    fn hold_expired(&self) -> bool {
        self.state.tense_until != 0 && self.clock.now_unix() >= self.state.tense_until
    }

    fn grow_idle_heartbeat(&mut self) {
        if self.state.heartbeat <= 0.0 {
            // The first growth step is a floor, not an increment.
            self.state.heartbeat = self.config.wakeup_growth.min(self.config.max_heartbeat);
            return;
        }
        self.state.heartbeat =
            (self.state.heartbeat + self.config.idle_growth).min(self.config.max_heartbeat);
    }

    fn raise_heartbeat(&mut self) {
        let base = self.state.heartbeat.max(self.config.tense_floor);
        self.state.heartbeat = (base + self.config.tense_boost).min(self.config.max_heartbeat);
    }

    fn drop_to_zero(&mut self) {
        self.state = HeartbeatState::idle();
    }

    fn set_tense(&mut self, focus: &str) {
        self.state.is_tense = true;
        self.state.focus_text = focus.trim().to_string();
        self.state.tense_until = match self.hold {
            HoldPolicy::Timed(secs) => self.clock.now_unix() + secs as i64,
            HoldPolicy::UntilUnrelated => 0,
        };
    }

    fn is_related(&self, message: &str) -> bool {
        if self.state.focus_text.is_empty() {
            return true;
        }

        let (msg_words, msg_chars) = collect_signals(message);
        let (focus_words, focus_chars) = collect_signals(&self.state.focus_text);

        if !msg_words.is_empty()
            && !focus_words.is_empty()
            && msg_words.iter().any(|w| focus_words.contains(w))
        {
            return true;
        }

        let shared_chars = msg_chars.iter().filter(|c| focus_chars.contains(*c)).count();
        shared_chars >= 2
    }

    fn persist(&self) {
        let Some(store) = self.store.as_deref() else {
            return;
        };
        if let Err(e) = store.save(&self.scope, &self.state) {
            tracing::warn!(
                "Failed to persist heartbeat state for '{}', continuing in memory: {}",
                self.scope,
                e
            );
        }
    }
}

fn word_regex() -> &'static Regex {
    static WORDS: OnceLock<Regex> = OnceLock::new();
    WORDS.get_or_init(|| Regex::new(r"[a-z0-9_]{2,}").expect("word token pattern"))
}

/// Lowercase word tokens (len >= 2) plus individual CJK characters.
fn collect_signals(text: &str) -> (Vec<String>, Vec<char>) {
    let lowered = text.to_lowercase();
    let mut words: Vec<String> = word_regex()
        .find_iter(&lowered)
        .map(|m| m.as_str().to_string())
        .collect();
    words.sort();
    words.dedup();

    let mut chars: Vec<char> = lowered
        .chars()
        .filter(|c| ('\u{4e00}'..='\u{9fff}').contains(c))
        .collect();
    chars.sort();
    chars.dedup();

    (words, chars)
}

//! Engine configuration.

use tracing::warn;

/// Hard cap on model round-trips per turn.
///
/// Deep enough for lore lookup, two agent calls, a rule query and a dice
/// request with room to spare.
pub const MAX_TOOL_ITERATIONS: usize = 8;

/// Default size, in characters, of a streamed content chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 40;

/// Default number of log messages replayed to the model each turn.
pub const DEFAULT_HISTORY_WINDOW: usize = 20;

/// Configuration for the Game Master and its delegates.
#[derive(Debug, Clone)]
pub struct GmConfig {
    /// Model for the Game Master (provider default when unset).
    pub model: Option<String>,

    /// Maximum tokens for Game Master responses.
    pub max_tokens: usize,

    /// Temperature for narration.
    pub temperature: Option<f32>,

    /// Iteration cap for the tool-calling loop.
    pub max_iterations: usize,

    /// Streamed chunk size in characters.
    pub chunk_size: usize,

    /// Recent messages included in the model transcript.
    pub history_window: usize,

    /// Model for delegate agents (falls back to `model`).
    pub delegate_model: Option<String>,

    /// Maximum tokens for delegate replies.
    pub delegate_max_tokens: usize,

    /// Replaces the built-in system prompt.
    pub custom_system_prompt: Option<String>,
}

impl Default for GmConfig {
    fn default() -> Self {
        Self {
            model: None,
            max_tokens: 2048,
            temperature: Some(0.8),
            max_iterations: MAX_TOOL_ITERATIONS,
            chunk_size: DEFAULT_CHUNK_SIZE,
            history_window: DEFAULT_HISTORY_WINDOW,
            delegate_model: None,
            delegate_max_tokens: 1024,
            custom_system_prompt: None,
        }
    }
}

impl GmConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read overrides from `GM_MODEL`, `GM_DELEGATE_MODEL`,
    /// `GM_MAX_ITERATIONS` and `GM_CHUNK_SIZE`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(model) = lookup("GM_MODEL").filter(|m| !m.trim().is_empty()) {
            config.model = Some(model);
        }
        if let Some(model) = lookup("GM_DELEGATE_MODEL").filter(|m| !m.trim().is_empty()) {
            config.delegate_model = Some(model);
        }
        if let Some(n) = parse_positive(&lookup, "GM_MAX_ITERATIONS") {
            config.max_iterations = n;
        }
        if let Some(n) = parse_positive(&lookup, "GM_CHUNK_SIZE") {
            config.chunk_size = n;
        }

        config
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_max_tokens(mut self, tokens: usize) -> Self {
        self.max_tokens = tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set the iteration cap. Values below 1 are raised to 1.
    pub fn with_max_iterations(mut self, n: usize) -> Self {
        self.max_iterations = n.max(1);
        self
    }

    /// Set the chunk size. Values below 1 are raised to 1.
    pub fn with_chunk_size(mut self, n: usize) -> Self {
        self.chunk_size = n.max(1);
        self
    }

    pub fn with_history_window(mut self, n: usize) -> Self {
        self.history_window = n;
        self
    }

    pub fn with_delegate_model(mut self, model: impl Into<String>) -> Self {
        self.delegate_model = Some(model.into());
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.custom_system_prompt = Some(prompt.into());
        self
    }

    /// Model used by delegates.
    pub fn delegate_model(&self) -> Option<&str> {
        self.delegate_model.as_deref().or(self.model.as_deref())
    }
}

fn parse_positive(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<usize> {
    let raw = lookup(key)?;
    match raw.trim().parse::<usize>() {
        Ok(n) if n > 0 => Some(n),
        _ => {
            warn!(key, value = %raw, "Ignoring invalid configuration value");
            None
        }
    }
}

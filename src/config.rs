use std::env;
use std::str::FromStr;

use tracing::warn;

/// Sizing and tiering knobs for an [`Engine`](crate::engine::Engine).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Arena capacity in words. The heap never grows past this.
    pub heap_words: usize,
    /// Maximum number of suspended call frames.
    pub max_call_depth: usize,
    /// Maximum operand-stack depth, in values.
    pub max_stack: usize,
    /// Invocation count at which an interpreted closure is compiled.
    /// Zero keeps every closure interpreted.
    pub compile_threshold: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            heap_words: 1 << 20,
            max_call_depth: 100_000,
            max_stack: 1 << 20,
            compile_threshold: 3,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `EMBER_HEAP_WORDS`, `EMBER_MAX_CALL_DEPTH`
    /// and `EMBER_COMPILE_THRESHOLD` when they are set and parse.
    pub fn from_env() -> Self {
        let mut config = EngineConfig::default();
        override_from_env("EMBER_HEAP_WORDS", &mut config.heap_words);
        override_from_env("EMBER_MAX_CALL_DEPTH", &mut config.max_call_depth);
        override_from_env("EMBER_COMPILE_THRESHOLD", &mut config.compile_threshold);
        config
    }

    pub fn with_heap_words(mut self, words: usize) -> Self {
        self.heap_words = words;
        self
    }

    pub fn with_compile_threshold(mut self, threshold: u32) -> Self {
        self.compile_threshold = threshold;
        self
    }

    pub fn with_max_call_depth(mut self, depth: usize) -> Self {
        self.max_call_depth = depth;
        self
    }
}

fn override_from_env<T: FromStr>(key: &str, slot: &mut T) {
    let Ok(raw) = env::var(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(parsed) => *slot = parsed,
        Err(_) => warn!(target: "ember::config", key, value = %raw, "ignoring unparsable setting"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_override_defaults() {
        let config = EngineConfig::default()
            .with_heap_words(4096)
            .with_compile_threshold(0);
        assert_eq!(config.heap_words, 4096);
        assert_eq!(config.compile_threshold, 0);
        assert_eq!(config.max_call_depth, EngineConfig::default().max_call_depth);
    }
}

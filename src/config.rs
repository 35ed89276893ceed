use serde::Deserialize;

/// Engine configuration.
///
/// Every field has a default, so a partial JSON document is enough:
///
/// ```
/// use passage_macros::config::Config;
///
/// let config = Config::from_json(r#"{ "debug": true, "maxLoopIterations": 10 }"#).unwrap();
/// assert!(config.debug);
/// assert_eq!(config.max_loop_iterations, 10);
/// assert_eq!(config.dom_delay_ms, 40);
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Wrap macro output in debug views.
    pub debug: bool,
    /// Upper bound on `<<for>>` iterations before it reports an error.
    pub max_loop_iterations: usize,
    /// Whether `<<type>>` animates in passages the player has seen before.
    pub type_visited_passages: bool,
    /// Key that finishes the current `<<type>>` animation.
    pub type_skip_key: String,
    /// Minimum delay for timer-driven macros, in milliseconds.
    pub dom_delay_ms: u64,
    /// Maximum nesting depth of recursive renders.
    pub max_render_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            debug: false,
            max_loop_iterations: 1000,
            type_visited_passages: true,
            type_skip_key: " ".to_string(),
            dom_delay_ms: 40,
            max_render_depth: 100,
        }
    }
}

impl Config {
    pub fn from_json(source: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = Config::from_json("{}").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_camel_case_keys() {
        let config =
            Config::from_json(r#"{ "typeVisitedPassages": false, "typeSkipKey": "Enter" }"#)
                .unwrap();
        assert!(!config.type_visited_passages);
        assert_eq!(config.type_skip_key, "Enter");
    }

    #[test]
    fn test_rejects_malformed_json() {
        assert!(Config::from_json("{ debug: yes }").is_err());
    }
}

//! Configuration for the reference agent.
//!
//! All configuration is loaded from environment variables.

use std::time::Duration;

use crate::error::BotError;

/// Reference agent configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotConfig {
    /// Address to accept the trainer on (e.g. `127.0.0.1:9000`).
    pub listen: String,
    /// Name announced in the handshake.
    pub name: String,
    /// Artificial thinking time before each input.
    pub delay: Duration,
    /// Keep accepting trainers after a session ends.
    pub serve_forever: bool,
}

impl BotConfig {
    /// Load configuration from environment variables.
    ///
    /// Optional variables:
    /// - `BOT_LISTEN` -- listen address (default `127.0.0.1:9000`)
    /// - `BOT_NAME` -- announced name (default `arena-bot`)
    /// - `BOT_DELAY_MS` -- delay before each input in milliseconds (default 0)
    /// - `BOT_SERVE_FOREVER` -- accept further sessions (default `false`)
    pub fn from_env() -> Result<Self, BotError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from any key lookup.
    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, BotError> {
        let listen = lookup("BOT_LISTEN").unwrap_or_else(|| "127.0.0.1:9000".to_owned());
        let name = lookup("BOT_NAME").unwrap_or_else(|| "arena-bot".to_owned());

        let delay_ms: u64 = lookup("BOT_DELAY_MS")
            .unwrap_or_else(|| "0".to_owned())
            .parse()
            .map_err(|e| BotError::Config(format!("invalid BOT_DELAY_MS: {e}")))?;

        let serve_forever: bool = lookup("BOT_SERVE_FOREVER")
            .unwrap_or_else(|| "false".to_owned())
            .parse()
            .map_err(|e| BotError::Config(format!("invalid BOT_SERVE_FOREVER: {e}")))?;

        if name.trim().is_empty() {
            return Err(BotError::Config("BOT_NAME must not be empty".to_owned()));
        }

        Ok(Self {
            listen,
            name,
            delay: Duration::from_millis(delay_ms),
            serve_forever,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = BotConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.listen, "127.0.0.1:9000");
        assert_eq!(config.name, "arena-bot");
        assert_eq!(config.delay, Duration::ZERO);
        assert!(!config.serve_forever);
    }

    #[test]
    fn reads_overrides() {
        let config = BotConfig::from_lookup(lookup(&[
            ("BOT_LISTEN", "0.0.0.0:9100"),
            ("BOT_NAME", "scout"),
            ("BOT_DELAY_MS", "15"),
            ("BOT_SERVE_FOREVER", "true"),
        ]))
        .unwrap();
        assert_eq!(config.listen, "0.0.0.0:9100");
        assert_eq!(config.name, "scout");
        assert_eq!(config.delay, Duration::from_millis(15));
        assert!(config.serve_forever);
    }

    #[test]
    fn rejects_bad_delay() {
        let err = BotConfig::from_lookup(lookup(&[("BOT_DELAY_MS", "soon")])).unwrap_err();
        assert!(err.to_string().contains("BOT_DELAY_MS"));
    }
}

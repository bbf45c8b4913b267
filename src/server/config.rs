//! Typed server configuration map.
//!
//! Configuration is stored as string key-value pairs (that is also how it is
//! frozen to disk) and read through typed accessors with per-key defaults.

use std::collections::HashMap;

/// Per-virtual-server configuration.
#[derive(Clone, Debug, Default)]
pub struct Config {
    values: HashMap<String, String>,
}

/// Built-in default for a key, if any.
fn default_value(key: &str) -> Option<&'static str> {
    Some(match key {
        "MaxBandwidth" => "72000",
        "MaxUsers" => "1000",
        "WelcomeText" => "Welcome to this server running <b>Grumble</b>.",
        "SendOSInfo" => "true",
        "SendVersion" => "true",
        "CertRequired" => "false",
        "AllowHTML" => "true",
        "RememberChannel" => "true",
        "DefaultChannel" => "0",
        "TimeoutSeconds" => "30",
        "OpusThreshold" => "100",
        "MaxTextMessageLength" => "5000",
        "MaxImageMessageLength" => "131072",
        "RateLimitMessages" => "4",
        "RateLimitBurst" => "30",
        "PluginMessagesPerSecond" => "4",
        "PluginMessageBurst" => "15",
        "SuggestPositional" => "",
        "SuggestPushToTalk" => "",
        "SuperUserPassword" => "",
        _ => return None,
    })
}

impl Config {
    pub fn new() -> Self {
        Default::default()
    }

    /// Explicitly set keys, for freezing.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.values.insert(key.to_owned(), value.to_owned());
    }

    /// Removes an explicit value, falling back to the default.
    pub fn reset(&mut self, key: &str) {
        self.values.remove(key);
    }

    pub fn str_value(&self, key: &str) -> String {
        self.values
            .get(key)
            .map(String::as_str)
            .or_else(|| default_value(key))
            .unwrap_or("")
            .to_owned()
    }

    pub fn int_value(&self, key: &str) -> i64 {
        self.values
            .get(key)
            .map(String::as_str)
            .or_else(|| default_value(key))
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    pub fn bool_value(&self, key: &str) -> bool {
        let value = self.str_value(key);
        matches!(value.as_str(), "true" | "1" | "on" | "yes")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_apply_when_unset() {
        let cfg = Config::new();
        assert_eq!(cfg.int_value("MaxBandwidth"), 72_000);
        assert_eq!(cfg.int_value("MaxUsers"), 1000);
        assert!(cfg.bool_value("AllowHTML"));
        assert!(!cfg.bool_value("CertRequired"));
        assert_eq!(cfg.int_value("DefaultChannel"), 0);
    }

    #[test]
    fn explicit_values_win() {
        let mut cfg = Config::new();
        cfg.set("MaxUsers", "25");
        cfg.set("CertRequired", "true");
        assert_eq!(cfg.int_value("MaxUsers"), 25);
        assert!(cfg.bool_value("CertRequired"));

        cfg.reset("MaxUsers");
        assert_eq!(cfg.int_value("MaxUsers"), 1000);
    }

    #[test]
    fn unknown_keys_are_empty() {
        let cfg = Config::new();
        assert_eq!(cfg.str_value("NoSuchKey"), "");
        assert_eq!(cfg.int_value("NoSuchKey"), 0);
        assert!(!cfg.bool_value("NoSuchKey"));
    }

    #[test]
    fn malformed_int_falls_back_to_zero() {
        let mut cfg = Config::new();
        cfg.set("MaxUsers", "plenty");
        assert_eq!(cfg.int_value("MaxUsers"), 0);
    }
}

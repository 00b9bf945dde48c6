//! Translator options.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{LockError, Result};

/// Options of the locks translator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LocksConfig {
    /// Gate reads, writes and truncates of mandatory-marked files.
    pub mandatory_locks: bool,
    /// Log every lock request and its verdict at INFO.
    pub trace: bool,
}

impl LocksConfig {
    /// Builds the config from the volfile option map.
    ///
    /// Unknown keys are left to other translators.
    pub fn from_options(options: &HashMap<String, String>) -> Result<Self> {
        let mut config = LocksConfig::default();

        let mandatory = options
            .get("mandatory-locks")
            .map(|v| ("mandatory-locks", v))
            .or_else(|| options.get("mandatory").map(|v| ("mandatory", v)));
        if let Some((key, value)) = mandatory {
            config.mandatory_locks = parse_bool(key, value)?;
        }

        if let Some(value) = options.get("trace") {
            config.trace = parse_bool("trace", value)?;
        }

        Ok(config)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "on" | "yes" | "true" | "enable" | "1" => Ok(true),
        "off" | "no" | "false" | "disable" | "0" => Ok(false),
        _ => Err(LockError::invalid(format!(
            "'{}' takes on only boolean values, got '{}'",
            key, value
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_off() {
        let config = LocksConfig::from_options(&HashMap::new()).unwrap();
        assert_eq!(config, LocksConfig::default());
        assert!(!config.mandatory_locks);
        assert!(!config.trace);
    }

    #[test]
    fn test_gluster_booleans() {
        for v in ["on", "YES", "true", "enable", "1"] {
            let c = LocksConfig::from_options(&opts(&[("trace", v)])).unwrap();
            assert!(c.trace, "{} should parse as true", v);
        }
        for v in ["off", "no", "False", "disable", "0"] {
            let c = LocksConfig::from_options(&opts(&[("trace", v)])).unwrap();
            assert!(!c.trace, "{} should parse as false", v);
        }
    }

    #[test]
    fn test_mandatory_alias() {
        let c = LocksConfig::from_options(&opts(&[("mandatory", "on")])).unwrap();
        assert!(c.mandatory_locks);
        let c = LocksConfig::from_options(&opts(&[("mandatory-locks", "yes")])).unwrap();
        assert!(c.mandatory_locks);
    }

    #[test]
    fn test_bad_boolean_rejected() {
        let err = LocksConfig::from_options(&opts(&[("trace", "maybe")])).unwrap_err();
        assert!(matches!(err, LockError::InvalidArgument { .. }));
        assert!(err.to_string().contains("trace"));
    }

    #[test]
    fn test_serde_round_trip() {
        let c = LocksConfig {
            mandatory_locks: true,
            trace: false,
        };
        let json = serde_json::to_string(&c).unwrap();
        let back: LocksConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(c, back);
    }
}

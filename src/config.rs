//! Service configuration, read from `COURTSIDE_*` environment variables.
//!
//! | Variable                       | Default               |
//! |--------------------------------|-----------------------|
//! | `COURTSIDE_DATA_DIR`           | `./data`              |
//! | `COURTSIDE_JOURNAL_FILE`       | `courtside.wal`       |
//! | `COURTSIDE_METRICS_PORT`       | unset (disabled)      |
//! | `COURTSIDE_EXPIRY_HOUR`        | `3`                   |
//! | `COURTSIDE_COMPACT_THRESHOLD`  | `1000`                |
//! | `COURTSIDE_NOTIFIER`           | `log`                 |
//! | `COURTSIDE_OUTBOX_PATH`        | `<data dir>/outbox.jsonl` |
//! | `COURTSIDE_MAIL_FROM`          | `noreply@courtside.local` |
//! | `COURTSIDE_NOTIFY_QUEUE`       | `1024`                |

use std::path::PathBuf;
use std::str::FromStr;

use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NotifierKind {
    #[default]
    Log,
    Outbox,
}

impl FromStr for NotifierKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "log" => Ok(NotifierKind::Log),
            "outbox" => Ok(NotifierKind::Outbox),
            other => Err(format!("unknown notifier '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub journal_file: String,
    pub metrics_port: Option<u16>,
    /// Local hour (0-23) at which penalty expiry runs.
    pub expiry_hour: u32,
    pub compact_threshold: u64,
    pub notifier: NotifierKind,
    pub outbox_path: PathBuf,
    pub mail_from: String,
    pub notify_queue: usize,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = PathBuf::from("./data");
        Self {
            outbox_path: data_dir.join("outbox.jsonl"),
            data_dir,
            journal_file: "courtside.wal".into(),
            metrics_port: None,
            expiry_hour: 3,
            compact_threshold: 1000,
            notifier: NotifierKind::Log,
            mail_from: "noreply@courtside.local".into(),
            notify_queue: 1024,
        }
    }
}

/// Parse `key`'s value, falling back to `default` (with a warning) when it
/// does not parse.
fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("{key}={raw:?} is not valid, using default");
            default
        }),
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. `from_env` passes the process
    /// environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let data_dir = lookup("COURTSIDE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);
        let outbox_path = lookup("COURTSIDE_OUTBOX_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("outbox.jsonl"));

        let mut expiry_hour = parsed(&lookup, "COURTSIDE_EXPIRY_HOUR", defaults.expiry_hour);
        if expiry_hour > 23 {
            warn!("COURTSIDE_EXPIRY_HOUR={expiry_hour} is out of range, using default");
            expiry_hour = defaults.expiry_hour;
        }

        Self {
            journal_file: lookup("COURTSIDE_JOURNAL_FILE").unwrap_or(defaults.journal_file),
            metrics_port: lookup("COURTSIDE_METRICS_PORT").and_then(|s| s.trim().parse().ok()),
            expiry_hour,
            compact_threshold: parsed(&lookup, "COURTSIDE_COMPACT_THRESHOLD", defaults.compact_threshold),
            notifier: parsed(&lookup, "COURTSIDE_NOTIFIER", defaults.notifier),
            mail_from: lookup("COURTSIDE_MAIL_FROM").unwrap_or(defaults.mail_from),
            notify_queue: parsed(&lookup, "COURTSIDE_NOTIFY_QUEUE", defaults.notify_queue),
            data_dir,
            outbox_path,
        }
    }

    pub fn journal_path(&self) -> PathBuf {
        self.data_dir.join(&self.journal_file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = Config::from_lookup(lookup(&[]));
        assert_eq!(config, Config::default());
        assert_eq!(config.journal_path(), PathBuf::from("./data/courtside.wal"));
    }

    #[test]
    fn reads_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("COURTSIDE_DATA_DIR", "/var/lib/courtside"),
            ("COURTSIDE_METRICS_PORT", "9100"),
            ("COURTSIDE_EXPIRY_HOUR", "4"),
            ("COURTSIDE_NOTIFIER", "Outbox"),
        ]));
        assert_eq!(config.metrics_port, Some(9100));
        assert_eq!(config.expiry_hour, 4);
        assert_eq!(config.notifier, NotifierKind::Outbox);
        assert_eq!(config.outbox_path, PathBuf::from("/var/lib/courtside/outbox.jsonl"));
    }

    #[test]
    fn invalid_values_fall_back() {
        let config = Config::from_lookup(lookup(&[
            ("COURTSIDE_EXPIRY_HOUR", "25"),
            ("COURTSIDE_COMPACT_THRESHOLD", "lots"),
            ("COURTSIDE_NOTIFIER", "pigeon"),
        ]));
        assert_eq!(config.expiry_hour, 3);
        assert_eq!(config.compact_threshold, 1000);
        assert_eq!(config.notifier, NotifierKind::Log);
    }
}

use std::path::PathBuf;
use std::time::Duration;

use crate::guest::GuestSettings;
use crate::limits::*;

/// Process configuration, read from `SLOTBOOK_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub data_dir: PathBuf,
    /// Uploaded documents; defaults to `<data_dir>/files`.
    pub files_dir: PathBuf,
    pub sweep_interval: Duration,
    /// WAL records between compactions.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub guest_daily_limit: usize,
    pub guest_token_ttl_hours: i64,
    pub public_url: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parsed<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
        ) -> Option<T> {
            lookup(key).and_then(|s| s.trim().parse().ok())
        }

        let data_dir = PathBuf::from(lookup("SLOTBOOK_DATA_DIR").unwrap_or_else(|| "./data".into()));
        let files_dir = lookup("SLOTBOOK_FILES_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("files"));
        Self {
            files_dir,
            sweep_interval: Duration::from_secs(
                parsed(&lookup, "SLOTBOOK_SWEEP_INTERVAL_SECS")
                    .filter(|secs| *secs > 0)
                    .unwrap_or(60),
            ),
            compact_threshold: parsed(&lookup, "SLOTBOOK_COMPACT_THRESHOLD").unwrap_or(1000),
            metrics_port: parsed(&lookup, "SLOTBOOK_METRICS_PORT"),
            guest_daily_limit: parsed(&lookup, "SLOTBOOK_GUEST_DAILY_LIMIT")
                .unwrap_or(DEFAULT_GUEST_DAILY_LIMIT),
            guest_token_ttl_hours: parsed(&lookup, "SLOTBOOK_GUEST_TOKEN_TTL_HOURS")
                .filter(|hours| *hours > 0)
                .unwrap_or(GUEST_TOKEN_TTL_HOURS),
            public_url: lookup("SLOTBOOK_PUBLIC_URL")
                .unwrap_or_else(|| "http://localhost:8080".into()),
            data_dir,
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("slotbook.wal")
    }

    pub fn outbox_path(&self) -> PathBuf {
        self.data_dir.join("outbox.jsonl")
    }

    pub fn guest_settings(&self) -> GuestSettings {
        GuestSettings {
            daily_limit: self.guest_daily_limit,
            token_ttl: chrono::Duration::hours(self.guest_token_ttl_hours),
            public_url: self.public_url.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults_when_unset() {
        let config = Config::from_lookup(|_| None);
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.files_dir, PathBuf::from("./data/files"));
        assert_eq!(config.sweep_interval, Duration::from_secs(60));
        assert_eq!(config.metrics_port, None);
        assert_eq!(config.guest_daily_limit, 1);
        assert_eq!(config.wal_path(), PathBuf::from("./data/slotbook.wal"));
    }

    #[test]
    fn overrides_and_bad_numbers() {
        let vars: HashMap<&str, &str> = [
            ("SLOTBOOK_DATA_DIR", "/srv/slotbook"),
            ("SLOTBOOK_SWEEP_INTERVAL_SECS", "15"),
            ("SLOTBOOK_METRICS_PORT", "9100"),
            ("SLOTBOOK_GUEST_DAILY_LIMIT", "three"),
            ("SLOTBOOK_PUBLIC_URL", "https://book.example.org"),
        ]
        .into_iter()
        .collect();
        let config = Config::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.files_dir, PathBuf::from("/srv/slotbook/files"));
        assert_eq!(config.sweep_interval, Duration::from_secs(15));
        assert_eq!(config.metrics_port, Some(9100));
        assert_eq!(config.guest_daily_limit, DEFAULT_GUEST_DAILY_LIMIT);
        assert_eq!(config.guest_settings().public_url, "https://book.example.org");
    }

    #[test]
    fn zero_intervals_fall_back_to_defaults() {
        let vars: HashMap<&str, &str> = [
            ("SLOTBOOK_SWEEP_INTERVAL_SECS", "0"),
            ("SLOTBOOK_GUEST_TOKEN_TTL_HOURS", "0"),
        ]
        .into_iter()
        .collect();
        let config = Config::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.sweep_interval, Duration::from_secs(60));
        assert_eq!(config.guest_token_ttl_hours, GUEST_TOKEN_TTL_HOURS);
    }
}

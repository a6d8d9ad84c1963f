//! Coordinator configuration.
//!
//! Loaded from `~/.config/netshare/config.json`. Failures fall back to the
//! defaults; the coordinator always has a usable configuration.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::upstream::UpstreamKind;

/// Persisted coordinator settings.
///
/// Missing fields fall back to their defaults, so partial files load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Upstream kinds in order of preference. Kinds not listed rank after all
    /// listed ones. Ties go to the most recently added network.
    #[serde(default = "default_upstream_preference")]
    pub upstream_preference: Vec<UpstreamKind>,

    /// Whether a metered upstream may be shared.
    #[serde(default = "default_true")]
    pub allow_metered: bool,

    /// Upper bound for every interface or forwarding operation.
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,

    /// Extra attempts at bringing a downstream interface up or down.
    #[serde(default = "default_activation_retries")]
    pub activation_retries: u32,

    /// Return from Error to Init as soon as cleanup completes.
    #[serde(default = "default_true")]
    pub auto_clear_errors: bool,

    /// How often the default-route probe runs.
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,

    /// Interfaces whose traffic is billed by volume.
    #[serde(default)]
    pub metered_interfaces: Vec<String>,

    /// Requesters allowed to control sharing (None = anyone).
    #[serde(default)]
    pub allowed_requesters: Option<Vec<String>>,
}

fn default_true() -> bool {
    true
}

fn default_upstream_preference() -> Vec<UpstreamKind> {
    vec![
        UpstreamKind::Ethernet,
        UpstreamKind::WifiClient,
        UpstreamKind::Cellular,
    ]
}

fn default_operation_timeout_ms() -> u64 {
    5_000
}

fn default_activation_retries() -> u32 {
    2
}

fn default_probe_interval_secs() -> u64 {
    5
}

impl Default for Config {
    fn default() -> Self {
        Self {
            upstream_preference: default_upstream_preference(),
            allow_metered: true,
            operation_timeout_ms: default_operation_timeout_ms(),
            activation_retries: default_activation_retries(),
            auto_clear_errors: true,
            probe_interval_secs: default_probe_interval_secs(),
            metered_interfaces: Vec::new(),
            allowed_requesters: None,
        }
    }
}

impl Config {
    /// Config file path: `~/.config/netshare/config.json`.
    ///
    /// `None` when no config directory is known for this user.
    pub fn path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("netshare").join("config.json"))
    }

    /// Read the config file. A missing or unreadable file yields the defaults.
    pub fn load() -> Self {
        match Self::path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    pub fn load_from(path: &Path) -> Self {
        let Ok(contents) = fs::read_to_string(path) else {
            return Self::default();
        };

        match serde_json::from_str(&contents) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(path = %path.display(), "ignoring invalid config: {}", e);
                Self::default()
            }
        }
    }

    /// Write the config file unless one already exists, so users have a
    /// file to edit. Best effort.
    pub fn save_if_missing(&self) {
        if let Some(path) = Self::path() {
            if !path.exists() {
                self.save_to(&path);
            }
        }
    }

    /// Best-effort write, creating the directory first. Never panics.
    pub fn save_to(&self, path: &Path) {
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }

        let Ok(json) = serde_json::to_string_pretty(self) else {
            return;
        };

        if let Err(e) = fs::write(path, json) {
            tracing::debug!(path = %path.display(), "could not write config: {}", e);
        }
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs.max(1))
    }

    /// Rank of `kind` in the preference list; lower is better.
    pub fn preference_rank(&self, kind: UpstreamKind) -> usize {
        self.upstream_preference
            .iter()
            .position(|k| *k == kind)
            .unwrap_or(self.upstream_preference.len())
    }

    pub fn is_metered(&self, iface: &str) -> bool {
        self.metered_interfaces.iter().any(|m| m == iface)
    }
}

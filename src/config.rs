//! Process configuration.
//!
//! One `Config` is loaded at startup from `~/.commsync/config.json` and passed
//! by reference into the orchestrator, matcher and server constructors. There
//! is no ambient global — every consumer names its dependency.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the invocation surface binds to.
    pub listen_addr: String,
    /// Hard cap on records ingested in a single run (full scans included).
    pub max_records_per_run: usize,
    /// Wall-clock budget per run, in seconds. A run past budget stops
    /// fetching, writes what it has and reports partial.
    pub run_budget_secs: u64,
    /// Default region for phone normalization (currently "US" semantics:
    /// 10-digit numbers gain a +1 prefix).
    pub default_region: String,
    pub mailbox: SourceConfig,
    pub crm: SourceConfig,
    pub telephony: SourceConfig,
    pub marketing: SourceConfig,
    pub provider: ProviderConfig,
}

/// Per-source connection + quota settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub enabled: bool,
    pub base_url: String,
    pub api_key: Option<String>,
    pub page_size: u32,
    /// Call budget inside the sliding rate-limit window.
    pub rate_limit_calls: usize,
    /// Sliding window length in milliseconds.
    pub rate_limit_window_ms: u64,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: String::new(),
            api_key: None,
            page_size: 100,
            rate_limit_calls: 25,
            rate_limit_window_ms: 1_000,
            request_timeout_secs: 30,
        }
    }
}

/// LLM/embedding collaborator settings. Disabled unless an endpoint is set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub enabled: bool,
    pub base_url: String,
    pub api_key: Option<String>,
    pub generate_model: String,
    pub embed_model: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:7380".to_string(),
            max_records_per_run: 5_000,
            run_budget_secs: 600,
            default_region: "US".to_string(),
            mailbox: SourceConfig::default(),
            crm: SourceConfig::default(),
            telephony: SourceConfig::default(),
            marketing: SourceConfig::default(),
            provider: ProviderConfig::default(),
        }
    }
}

/// Resolve the config file path: `~/.commsync/config.json`.
pub fn config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_default()
        .join(".commsync")
        .join("config.json")
}

/// Load configuration from disk, falling back to defaults when the file is
/// missing. A present-but-unparseable file is an error — silently running
/// with defaults against production quotas is worse than failing startup.
pub fn load_config() -> Result<Config, String> {
    load_config_from(&config_path())
}

pub fn load_config_from(path: &std::path::Path) -> Result<Config, String> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read {}: {e}", path.display()))?;
    serde_json::from_str(&content).map_err(|e| format!("Failed to parse {}: {e}", path.display()))
}

impl Config {
    /// Settings for one source by kind.
    pub fn source(&self, kind: crate::sources::SourceKind) -> &SourceConfig {
        use crate::sources::SourceKind;
        match kind {
            SourceKind::Mailbox => &self.mailbox,
            SourceKind::Crm => &self.crm,
            SourceKind::Telephony => &self.telephony,
            SourceKind::Marketing => &self.marketing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_when_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_config_from(&dir.path().join("nope.json")).unwrap();
        assert_eq!(cfg.listen_addr, "127.0.0.1:7380");
        assert_eq!(cfg.max_records_per_run, 5_000);
        assert!(!cfg.mailbox.enabled);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut f = std::fs::File::create(&path).unwrap();
        write!(
            f,
            r#"{{"mailbox": {{"enabled": true, "base_url": "https://mail.example.com", "rate_limit_calls": 5}}}}"#
        )
        .unwrap();

        let cfg = load_config_from(&path).unwrap();
        assert!(cfg.mailbox.enabled);
        assert_eq!(cfg.mailbox.base_url, "https://mail.example.com");
        assert_eq!(cfg.mailbox.rate_limit_calls, 5);
        // Untouched fields keep defaults
        assert_eq!(cfg.mailbox.page_size, 100);
        assert_eq!(cfg.run_budget_secs, 600);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(load_config_from(&path).is_err());
    }
}

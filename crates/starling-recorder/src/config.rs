use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub bot: BotConfig,
    #[serde(default)]
    pub recording: RecordingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    #[serde(default)]
    pub id: i64,
    #[serde(default = "default_api_bind")]
    pub api_bind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Absolute, or relative to the config directory.
    #[serde(default = "default_path")]
    pub path: String,
    /// Quota with K/M/G/T suffix; "0" or unparsable disables eviction.
    #[serde(default = "default_max_total_size")]
    pub max_total_size: String,
    /// How long to keep recording an empty channel before stopping.
    #[serde(default = "default_stop_delay")]
    pub stop_delay: String,
    /// Recordings shorter than this are discarded on finalize.
    #[serde(default = "default_min_duration")]
    pub min_duration: String,
    /// Opus encoder bitrate in kbps.
    #[serde(default = "default_bitrate")]
    pub bitrate: u32,
    /// Uids that don't count when deciding whether the channel is empty.
    #[serde(default)]
    pub exclude_uids: Vec<String>,
}

fn default_api_bind() -> String {
    "127.0.0.1:58913".to_string()
}

fn default_path() -> String {
    "recordings".to_string()
}

fn default_max_total_size() -> String {
    "0".to_string()
}

fn default_stop_delay() -> String {
    "30s".to_string()
}

fn default_min_duration() -> String {
    "2s".to_string()
}

fn default_bitrate() -> u32 {
    48
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            id: 0,
            api_bind: default_api_bind(),
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_path(),
            max_total_size: default_max_total_size(),
            stop_delay: default_stop_delay(),
            min_duration: default_min_duration(),
            bitrate: default_bitrate(),
            exclude_uids: Vec::new(),
        }
    }
}

impl RecordingConfig {
    pub fn max_total_size_bytes(&self) -> Option<u64> {
        match parse_size(&self.max_total_size) {
            Some(0) | None => None,
            Some(bytes) => Some(bytes),
        }
    }

    pub fn stop_delay(&self) -> Duration {
        parse_duration(&self.stop_delay).unwrap_or(Duration::from_secs(30))
    }

    pub fn min_duration(&self) -> Duration {
        parse_duration(&self.min_duration).unwrap_or(Duration::ZERO)
    }

    pub fn root(&self, config_dir: &Path) -> PathBuf {
        let path = Path::new(&self.path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            config_dir.join(path)
        }
    }
}

/// Byte count from a decimal number with an optional K/M/G/T suffix.
pub fn parse_size(raw: &str) -> Option<u64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let (digits, multiplier) = match trimmed.chars().last()? {
        'k' | 'K' => (&trimmed[..trimmed.len() - 1], 1u64 << 10),
        'm' | 'M' => (&trimmed[..trimmed.len() - 1], 1u64 << 20),
        'g' | 'G' => (&trimmed[..trimmed.len() - 1], 1u64 << 30),
        't' | 'T' => (&trimmed[..trimmed.len() - 1], 1u64 << 40),
        _ => (trimmed, 1u64),
    };
    let value: u64 = digits.trim().parse().ok()?;
    value.checked_mul(multiplier)
}

/// Duration from a decimal number with an ms/s/m/h suffix (plain numbers are
/// seconds).
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let (digits, unit_ms) = if let Some(head) = trimmed.strip_suffix("ms") {
        (head, 1u64)
    } else if let Some(head) = trimmed.strip_suffix('s') {
        (head, 1000)
    } else if let Some(head) = trimmed.strip_suffix('m') {
        (head, 60 * 1000)
    } else if let Some(head) = trimmed.strip_suffix('h') {
        (head, 60 * 60 * 1000)
    } else {
        (trimmed, 1000)
    };
    let value: u64 = digits.trim().parse().ok()?;
    Some(Duration::from_millis(value.checked_mul(unit_ms)?))
}

/// Load the config file, falling back to defaults when it doesn't exist.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config: {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("failed to parse config: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_parse_with_binary_suffixes() {
        assert_eq!(parse_size("0"), Some(0));
        assert_eq!(parse_size("512"), Some(512));
        assert_eq!(parse_size("7M"), Some(7 * 1024 * 1024));
        assert_eq!(parse_size("2g"), Some(2u64 << 30));
        assert_eq!(parse_size("1T"), Some(1u64 << 40));
        assert_eq!(parse_size("junk"), None);
        assert_eq!(parse_size(""), None);
    }

    #[test]
    fn zero_or_invalid_quota_disables_eviction() {
        let mut cfg = RecordingConfig::default();
        assert_eq!(cfg.max_total_size_bytes(), None);
        cfg.max_total_size = "nonsense".into();
        assert_eq!(cfg.max_total_size_bytes(), None);
        cfg.max_total_size = "7M".into();
        assert_eq!(cfg.max_total_size_bytes(), Some(7 * 1024 * 1024));
    }

    #[test]
    fn durations_parse_with_unit_suffixes() {
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("45"), Some(Duration::from_secs(45)));
        assert_eq!(parse_duration("abc"), None);
    }

    #[test]
    fn bad_durations_fall_back_to_defaults() {
        let mut cfg = RecordingConfig::default();
        cfg.stop_delay = "???".into();
        cfg.min_duration = "???".into();
        assert_eq!(cfg.stop_delay(), Duration::from_secs(30));
        assert_eq!(cfg.min_duration(), Duration::ZERO);
    }

    #[test]
    fn root_resolves_relative_to_config_dir() {
        let cfg = RecordingConfig::default();
        assert_eq!(
            cfg.root(Path::new("/etc/starling")),
            PathBuf::from("/etc/starling/recordings")
        );
        let abs = RecordingConfig {
            path: "/var/rec".into(),
            ..Default::default()
        };
        assert_eq!(abs.root(Path::new("/etc/starling")), PathBuf::from("/var/rec"));
    }

    #[test]
    fn config_roundtrips_through_toml() {
        let cfg = Config::default();
        let text = toml::to_string(&cfg).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.recording.bitrate, 48);
        assert_eq!(parsed.recording.stop_delay, "30s");
    }

    #[test]
    fn missing_fields_take_defaults() {
        let parsed: Config = toml::from_str("[recording]\nenabled = true\n").unwrap();
        assert!(parsed.recording.enabled);
        assert_eq!(parsed.recording.path, "recordings");
        assert_eq!(parsed.bot.api_bind, "127.0.0.1:58913");
    }
}

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use toml::map::Entry;
use tracing::{debug, warn};

use crate::error::Result;
use crate::portal::{CURSOR_MODE_EMBEDDED, SUPPORTED_CURSOR_MODES};
use crate::types::{DeviceTypes, SourceTypes};

/// Directory name used under the user's config dir.
pub const APP_DIR: &str = "remote-desktop-portal";
/// Environment variable naming an extra TOML file layered over the defaults.
pub const CONFIG_ENV: &str = "REMOTE_DESKTOP_PORTAL_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub handshake: HandshakeConfig,
    pub capture: CaptureConfig,
    pub input: InputConfig,
    pub consent: ConsentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    /// Deadline for CreateSession, SelectDevices and SelectSources.
    pub step_timeout_ms: u64,
    /// Deadline for Start, which is where the consent dialog is shown.
    pub start_timeout_ms: u64,
    pub device_types: u32,
    pub source_types: u32,
    pub cursor_mode: u32,
    /// X11/Wayland parent window identifier handed to Start.
    pub parent_window: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub frame_timeout_ms: u64,
    pub frame_max_staleness_ms: u64,
    pub screenshot_timeout_ms: u64,
    pub screenshot_max_staleness_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    /// Spacing between key events of a combo or a single press.
    pub key_spacing_ms: u64,
    /// Spacing between pointer motion and button events of a click.
    pub click_spacing_ms: u64,
    pub type_interval_ms: u64,
    /// Extra `alias = "KeysymName"` entries consulted before the built-in aliases.
    pub key_aliases: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsentConfig {
    /// Location of the consent record; `None` means the per-user default.
    pub token_path: Option<PathBuf>,
    pub invalidate_on_decline: bool,
}

static CONFIG: OnceLock<Config> = OnceLock::new();

impl Default for Config {
    fn default() -> Self {
        Self {
            handshake: HandshakeConfig::default(),
            capture: CaptureConfig::default(),
            input: InputConfig::default(),
            consent: ConsentConfig::default(),
        }
    }
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            step_timeout_ms: 30_000,
            start_timeout_ms: 120_000,
            device_types: (DeviceTypes::KEYBOARD | DeviceTypes::POINTER | DeviceTypes::TOUCHSCREEN)
                .bits(),
            source_types: SourceTypes::MONITOR.bits(),
            cursor_mode: CURSOR_MODE_EMBEDDED,
            parent_window: String::new(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            frame_timeout_ms: 2_000,
            frame_max_staleness_ms: 100,
            screenshot_timeout_ms: 2_000,
            screenshot_max_staleness_ms: 0,
        }
    }
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            key_spacing_ms: 50,
            click_spacing_ms: 50,
            type_interval_ms: 10,
            key_aliases: BTreeMap::new(),
        }
    }
}

impl Default for ConsentConfig {
    fn default() -> Self {
        Self {
            token_path: None,
            invalidate_on_decline: true,
        }
    }
}

impl Config {
    /// Runs `f` against the process-wide configuration, loading it on first use.
    pub fn with<R>(f: impl FnOnce(&Config) -> R) -> R {
        let config = CONFIG.get_or_init(Config::load);
        f(config)
    }

    /// Defaults, overlaid by the user config file, overlaid by `$REMOTE_DESKTOP_PORTAL_CONFIG`.
    pub fn load() -> Self {
        let mut merged = match toml::Value::try_from(Self::default()) {
            Ok(value) => value,
            Err(err) => {
                warn!("Failed to serialize default config: {err}");
                return Self::default();
            }
        };

        let mut candidates: Vec<PathBuf> = Vec::new();
        if let Some(dir) = dirs::config_dir() {
            candidates.push(dir.join(APP_DIR).join("config.toml"));
        }
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            candidates.push(PathBuf::from(path));
        }

        for candidate in candidates {
            if let Ok(content) = std::fs::read_to_string(&candidate) {
                match content.parse::<toml::Value>() {
                    Ok(value) => {
                        debug!(path = %candidate.display(), "Applying config overrides");
                        merge_value(&mut merged, value);
                    }
                    Err(err) => warn!(path = %candidate.display(), "Failed to parse config: {err}"),
                }
            }
        }

        let config: Config = merged.try_into().unwrap_or_else(|err| {
            warn!("Falling back to default config due to invalid overrides: {err}");
            Self::default()
        });
        config.sanitized()
    }

    /// Parses a full or partial TOML document on top of the defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let overrides = content.parse::<toml::Value>()?;
        let mut merged = toml::Value::try_from(Self::default())
            .map_err(|err| crate::error::Error::InvalidState(err.to_string()))?;
        merge_value(&mut merged, overrides);
        let config: Config = merged.try_into()?;
        Ok(config.sanitized())
    }

    fn sanitized(mut self) -> Self {
        if SUPPORTED_CURSOR_MODES & self.handshake.cursor_mode == 0 {
            warn!(
                cursor_mode = self.handshake.cursor_mode,
                "Unsupported cursor_mode, falling back to embedded"
            );
            self.handshake.cursor_mode = CURSOR_MODE_EMBEDDED;
        }
        if DeviceTypes::from_bits(self.handshake.device_types).is_none() {
            warn!(
                device_types = self.handshake.device_types,
                "Ignoring unknown device type bits"
            );
            self.handshake.device_types =
                DeviceTypes::from_bits_truncate(self.handshake.device_types).bits();
        }
        if SourceTypes::from_bits_truncate(self.handshake.source_types).is_empty() {
            warn!("No usable source type configured, using monitor");
            self.handshake.source_types = SourceTypes::MONITOR.bits();
        }
        self
    }

    /// Resolved consent file location.
    pub fn token_path(&self) -> PathBuf {
        self.consent
            .token_path
            .clone()
            .unwrap_or_else(default_token_path)
    }
}

impl HandshakeConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    pub fn device_types(&self) -> DeviceTypes {
        DeviceTypes::from_bits_truncate(self.device_types)
    }

    pub fn source_types(&self) -> SourceTypes {
        SourceTypes::from_bits_truncate(self.source_types)
    }
}

impl CaptureConfig {
    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    pub fn frame_max_staleness(&self) -> Duration {
        Duration::from_millis(self.frame_max_staleness_ms)
    }

    pub fn screenshot_timeout(&self) -> Duration {
        Duration::from_millis(self.screenshot_timeout_ms)
    }

    pub fn screenshot_max_staleness(&self) -> Duration {
        Duration::from_millis(self.screenshot_max_staleness_ms)
    }
}

impl InputConfig {
    pub fn key_spacing(&self) -> Duration {
        Duration::from_millis(self.key_spacing_ms.max(1))
    }

    pub fn click_spacing(&self) -> Duration {
        Duration::from_millis(self.click_spacing_ms.max(1))
    }

    pub fn type_interval(&self) -> Duration {
        Duration::from_millis(self.type_interval_ms)
    }
}

pub fn default_token_path() -> PathBuf {
    let base = dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
        .unwrap_or_else(|| Path::new(".").to_path_buf());
    base.join(APP_DIR).join("consent.json")
}

fn merge_value(base: &mut toml::Value, overrides: toml::Value) {
    match (base, overrides) {
        (toml::Value::Table(base_map), toml::Value::Table(override_map)) => {
            for (key, override_value) in override_map {
                match base_map.entry(key) {
                    Entry::Occupied(mut entry) => merge_value(entry.get_mut(), override_value),
                    Entry::Vacant(entry) => {
                        entry.insert(override_value);
                    }
                }
            }
        }
        (base_value, override_value) => {
            *base_value = override_value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_overrides_keep_other_defaults() {
        let config = Config::from_toml_str(
            r#"
            [capture]
            screenshot_timeout_ms = 500

            [input.key_aliases]
            copy = "XF86Copy"
        "#,
        )
        .expect("config should parse");

        assert_eq!(config.capture.screenshot_timeout(), Duration::from_millis(500));
        assert_eq!(config.capture.frame_timeout(), Duration::from_secs(2));
        assert_eq!(config.handshake.step_timeout(), Duration::from_secs(30));
        assert_eq!(
            config.input.key_aliases.get("copy").map(String::as_str),
            Some("XF86Copy")
        );
        assert!(config.consent.invalidate_on_decline);
    }

    #[test]
    fn unsupported_cursor_mode_falls_back_to_embedded() {
        let config = Config::from_toml_str("[handshake]\ncursor_mode = 8\n").unwrap();
        assert_eq!(config.handshake.cursor_mode, CURSOR_MODE_EMBEDDED);
    }

    #[test]
    fn explicit_token_path_wins() {
        let config = Config::from_toml_str("[consent]\ntoken_path = \"/tmp/consent.json\"\n")
            .unwrap();
        assert_eq!(config.token_path(), PathBuf::from("/tmp/consent.json"));
    }

    #[test]
    fn key_spacing_is_never_zero() {
        let config = Config::from_toml_str("[input]\nkey_spacing_ms = 0\n").unwrap();
        assert!(config.input.key_spacing() > Duration::ZERO);
    }
}

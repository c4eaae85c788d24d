use crate::domain::packet::{
    Signature, DEFAULT_SIGNATURE_MASK, DEFAULT_SIGNATURE_PATTERN, PACKET_SIZE,
};
use crate::infrastructure::bluetooth::protocol;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_true")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_true")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_true(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_true(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "gesture_remote".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// Remote link, framing and watchdog settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkSettings {
    // BLE
    #[serde(default = "default_service_uuid")]
    pub service_uuid: String,
    #[serde(default = "default_data_uuid")]
    pub data_char_uuid: String,
    #[serde(default = "default_pairing_pin")]
    pub pairing_pin: String,
    #[serde(default = "default_true")]
    pub require_encrypted_pairing: bool,

    // Framing
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,
    #[serde(default = "default_signature_pattern")]
    pub signature_pattern: u8,
    #[serde(default = "default_signature_mask")]
    pub signature_mask: u8,
    #[serde(default = "default_hits_to_align")]
    pub hits_to_align: u32,
    #[serde(default = "default_max_align_attempts")]
    pub max_align_attempts: u32,
    #[serde(default = "default_max_backlog")]
    pub max_backlog: usize,

    // Watchdog
    #[serde(default = "default_soft_timeout_ms")]
    pub data_timeout_warn_ms: u64,
    #[serde(default = "default_hard_timeout_ms")]
    pub data_timeout_disconnect_ms: u64,
    #[serde(default = "default_watchdog_poll_ms")]
    pub watchdog_poll_ms: u64,

    // Reconnection
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_discovery_timeout_ms")]
    pub discovery_timeout_ms: u64,
    #[serde(default)]
    pub max_connection_attempts: Option<u32>,
    #[serde(default = "default_false")]
    pub auto_reconnect: bool,

    // Debug
    #[serde(default = "default_false")]
    pub forward_raw_data: bool,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            service_uuid: default_service_uuid(),
            data_char_uuid: default_data_uuid(),
            pairing_pin: default_pairing_pin(),
            require_encrypted_pairing: true,
            ring_capacity: default_ring_capacity(),
            signature_pattern: default_signature_pattern(),
            signature_mask: default_signature_mask(),
            hits_to_align: default_hits_to_align(),
            max_align_attempts: default_max_align_attempts(),
            max_backlog: default_max_backlog(),
            data_timeout_warn_ms: default_soft_timeout_ms(),
            data_timeout_disconnect_ms: default_hard_timeout_ms(),
            watchdog_poll_ms: default_watchdog_poll_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            discovery_timeout_ms: default_discovery_timeout_ms(),
            max_connection_attempts: None,
            auto_reconnect: false,
            forward_raw_data: false,
        }
    }
}

fn default_service_uuid() -> String {
    protocol::SERVICE_UUID.to_string()
}
fn default_data_uuid() -> String {
    protocol::DATA_CHAR_UUID.to_string()
}
fn default_pairing_pin() -> String {
    "605011".to_string()
}
fn default_ring_capacity() -> usize {
    256
}
fn default_signature_pattern() -> u8 {
    DEFAULT_SIGNATURE_PATTERN
}
fn default_signature_mask() -> u8 {
    DEFAULT_SIGNATURE_MASK
}
fn default_hits_to_align() -> u32 {
    5
}
fn default_max_align_attempts() -> u32 {
    1000
}
fn default_max_backlog() -> usize {
    3
}
fn default_soft_timeout_ms() -> u64 {
    200
}
fn default_hard_timeout_ms() -> u64 {
    3000
}
fn default_watchdog_poll_ms() -> u64 {
    100
}
fn default_reconnect_delay_ms() -> u64 {
    3000
}
fn default_discovery_timeout_ms() -> u64 {
    5 * 60 * 1000
}

impl LinkSettings {
    pub fn signature(&self) -> Signature {
        Signature {
            pattern: self.signature_pattern,
            mask: self.signature_mask,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub log_settings: LogSettings,
    #[serde(default)]
    pub link: LinkSettings,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("ring capacity {0} cannot hold one {PACKET_SIZE}-byte packet")]
    RingTooSmall(usize),
    #[error("signature pattern {pattern:#04x} has bits outside mask {mask:#04x}")]
    UnsatisfiableSignature { pattern: u8, mask: u8 },
    #[error("{0} must be at least 1")]
    Zero(&'static str),
    #[error("disconnect timeout {hard_ms} ms is shorter than warning timeout {soft_ms} ms")]
    TimeoutOrder { soft_ms: u64, hard_ms: u64 },
    #[error("invalid UUID {0:?}")]
    InvalidUuid(String),
}

impl Settings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let link = &self.link;

        // One slot of the ring is always kept free.
        if link.ring_capacity <= PACKET_SIZE {
            return Err(ConfigError::RingTooSmall(link.ring_capacity));
        }
        if !link.signature().is_satisfiable() {
            return Err(ConfigError::UnsatisfiableSignature {
                pattern: link.signature_pattern,
                mask: link.signature_mask,
            });
        }
        if link.hits_to_align == 0 {
            return Err(ConfigError::Zero("hits_to_align"));
        }
        if link.max_backlog == 0 {
            return Err(ConfigError::Zero("max_backlog"));
        }
        if link.watchdog_poll_ms == 0 {
            return Err(ConfigError::Zero("watchdog_poll_ms"));
        }
        if link.data_timeout_disconnect_ms < link.data_timeout_warn_ms {
            return Err(ConfigError::TimeoutOrder {
                soft_ms: link.data_timeout_warn_ms,
                hard_ms: link.data_timeout_disconnect_ms,
            });
        }
        for uuid in [&link.service_uuid, &link.data_char_uuid] {
            if protocol::parse_uuid(uuid).is_err() {
                return Err(ConfigError::InvalidUuid(uuid.clone()));
            }
        }
        Ok(())
    }
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();

        Ok(Self {
            settings,
            settings_path,
        })
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("GestureRemote");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert_eq!(Settings::default().validate(), Ok(()));
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let json = r#"{ "link": { "max_backlog": 5, "auto_reconnect": true } }"#;
        let settings: Settings = serde_json::from_str(json).unwrap();

        assert_eq!(settings.link.max_backlog, 5);
        assert!(settings.link.auto_reconnect);
        assert_eq!(settings.link.hits_to_align, 5);
        assert_eq!(settings.link.signature_pattern, 0b1010_1000);
        assert_eq!(settings.link.max_connection_attempts, None);
        assert_eq!(settings.log_settings.level, "info");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut settings = Settings::default();
        settings.link.ring_capacity = PACKET_SIZE;
        assert_eq!(
            settings.validate(),
            Err(ConfigError::RingTooSmall(PACKET_SIZE))
        );

        let mut settings = Settings::default();
        settings.link.signature_mask = 0xF0;
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::UnsatisfiableSignature { .. })
        ));

        let mut settings = Settings::default();
        settings.link.data_timeout_disconnect_ms = 100;
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::TimeoutOrder { .. })
        ));

        let mut settings = Settings::default();
        settings.link.service_uuid = "not-a-uuid".to_string();
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::InvalidUuid(_))
        ));
    }
}

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

use crate::infrastructure::bluetooth::protocol;

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

/// GATT profile of the sensor board
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BleSettings {
    #[serde(default = "default_service_uuid")]
    pub service_uuid: Uuid,
    #[serde(default = "default_control_uuid")]
    pub control_char_uuid: Uuid,
    #[serde(default = "default_data_uuid")]
    pub data_char_uuid: Uuid,
    #[serde(default = "default_mtu")]
    pub requested_mtu: u16,
}

impl Default for BleSettings {
    fn default() -> Self {
        Self {
            service_uuid: default_service_uuid(),
            control_char_uuid: default_control_uuid(),
            data_char_uuid: default_data_uuid(),
            requested_mtu: default_mtu(),
        }
    }
}

/// Bound and constant delay for one kind of retried operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryLimit {
    pub max_attempts: u32,
    pub delay_ms: u64,
}

impl RetryLimit {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_reconnect_limit")]
    pub reconnect: RetryLimit,
    #[serde(default = "default_gatt_op_limit")]
    pub descriptor_write: RetryLimit,
    #[serde(default = "default_gatt_op_limit")]
    pub characteristic_read: RetryLimit,
    #[serde(default = "default_gatt_op_limit")]
    pub characteristic_write: RetryLimit,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            reconnect: default_reconnect_limit(),
            descriptor_write: default_gatt_op_limit(),
            characteristic_read: default_gatt_op_limit(),
            characteristic_write: default_gatt_op_limit(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_export_dir")]
    pub directory: PathBuf,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            directory: default_export_dir(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log_settings: LogSettings,
    #[serde(default)]
    pub ble: BleSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub export: ExportSettings,
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
    "sensor_link".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}
fn default_service_uuid() -> Uuid {
    protocol::SERVICE_UUID
}
fn default_control_uuid() -> Uuid {
    protocol::CONTROL_CHAR_UUID
}
fn default_data_uuid() -> Uuid {
    protocol::DATA_CHAR_UUID
}
fn default_mtu() -> u16 {
    protocol::REQUESTED_MTU
}
fn default_reconnect_limit() -> RetryLimit {
    RetryLimit {
        max_attempts: 5,
        delay_ms: 2000,
    }
}
fn default_gatt_op_limit() -> RetryLimit {
    RetryLimit {
        max_attempts: 5,
        delay_ms: 3000,
    }
}
fn default_export_dir() -> PathBuf {
    dirs::document_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("SensorLink")
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::from_path(settings_path))
    }

    /// Load from an explicit file, falling back to defaults when it is missing or unreadable
    pub fn from_path(settings_path: PathBuf) -> Self {
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();
        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("SensorLink");
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

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }
}

use crate::domain::models::BdAddr;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error" or full directives
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_true")]
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
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_true(),
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
    "btbr".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// USB identity and pipe parameters of the radio
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSettings {
    #[serde(default = "default_vendor_id")]
    pub vendor_id: u16,
    #[serde(default = "default_product_id")]
    pub product_id: u16,
    #[serde(default)]
    pub interface: u8,
    #[serde(default = "default_endpoint_in")]
    pub endpoint_in: u8,
    #[serde(default = "default_endpoint_out")]
    pub endpoint_out: u8,
    /// Bounded poll of the receive loop
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    /// Pause after the initial idle command before issuing anything else
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            vendor_id: default_vendor_id(),
            product_id: default_product_id(),
            interface: 0,
            endpoint_in: default_endpoint_in(),
            endpoint_out: default_endpoint_out(),
            read_timeout_ms: default_read_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            settle_ms: default_settle_ms(),
        }
    }
}

impl DeviceSettings {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

fn default_vendor_id() -> u16 {
    0x1d50
}
fn default_product_id() -> u16 {
    0x6002
}
fn default_endpoint_in() -> u8 {
    0x82
}
fn default_endpoint_out() -> u8 {
    0x05
}
fn default_read_timeout_ms() -> u64 {
    100
}
fn default_write_timeout_ms() -> u64 {
    1000
}
fn default_settle_ms() -> u64 {
    1000
}

/// Duty cycle of the discoverable composite session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverableSettings {
    #[serde(default = "default_dwell_ms")]
    pub inquiry_scan_dwell_ms: u64,
    #[serde(default = "default_dwell_ms")]
    pub page_scan_dwell_ms: u64,
    #[serde(default = "default_stop_poll_ms")]
    pub stop_poll_ms: u64,
}

impl Default for DiscoverableSettings {
    fn default() -> Self {
        Self {
            inquiry_scan_dwell_ms: default_dwell_ms(),
            page_scan_dwell_ms: default_dwell_ms(),
            stop_poll_ms: default_stop_poll_ms(),
        }
    }
}

fn default_dwell_ms() -> u64 {
    2000
}
fn default_stop_poll_ms() -> u64 {
    500
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log_settings: LogSettings,

    #[serde(default)]
    pub device: DeviceSettings,

    // Local identity
    #[serde(default)]
    pub local_bdaddr: Option<BdAddr>,
    /// Name answered to LMP name requests
    #[serde(default = "default_device_name")]
    pub device_name: String,
    /// Local name advertised in the extended inquiry response
    #[serde(default)]
    pub eir_name: Option<String>,

    // Radio tuning
    #[serde(default)]
    pub freq_offset: Option<u8>,
    #[serde(default)]
    pub max_ac_errors: Option<u8>,

    #[serde(default)]
    pub discoverable: DiscoverableSettings,

    /// How long a stopped session may take to report STANDBY before it is shut down
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_settings: LogSettings::default(),
            device: DeviceSettings::default(),
            local_bdaddr: None,
            device_name: default_device_name(),
            eir_name: None,
            freq_offset: None,
            max_ac_errors: None,
            discoverable: DiscoverableSettings::default(),
            stop_grace_ms: default_stop_grace_ms(),
        }
    }
}

impl Settings {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

fn default_device_name() -> String {
    "Ubertooth".to_string()
}
fn default_stop_grace_ms() -> u64 {
    2000
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    /// Load from the per-user config directory
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::from_path(settings_path))
    }

    /// Load from an explicit file, falling back to defaults when missing or invalid
    pub fn from_path(settings_path: PathBuf) -> Self {
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::debug!(
                    "Using default settings ({}: {})",
                    settings_path.display(),
                    e
                );
                Settings::default()
            }
        };

        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("btbr");
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(dir) = self.settings_path.parent() {
            fs::create_dir_all(dir)?;
        }
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

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }
}

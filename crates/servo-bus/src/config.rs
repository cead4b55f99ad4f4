use crate::protocol::{DEFAULT_BAUD_RATE, DEFAULT_PROTOCOL_END, MAX_ID};
use crate::types::{DeviceId, Role};
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: DeviceId,
    pub role: Role,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Port to open. When absent the first USB serial port is used.
    #[serde(default)]
    pub port: Option<String>,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_protocol_end")]
    pub protocol_end: u8,
    /// Minimum gap before each queued command.
    #[serde(default = "default_command_delay_ms")]
    pub command_delay_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_init_acceleration")]
    pub init_acceleration: i32,
    #[serde(default = "default_init_speed")]
    pub init_speed: i32,
    /// Ticks moved by a full-magnitude directional request.
    #[serde(default = "default_max_step_ticks")]
    pub max_step_ticks: i32,
    /// Wheel speed for a full-magnitude directional request.
    #[serde(default = "default_wheel_max_speed")]
    pub wheel_max_speed: i32,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}
fn default_protocol_end() -> u8 {
    DEFAULT_PROTOCOL_END
}
fn default_command_delay_ms() -> u64 {
    5
}
fn default_read_timeout_ms() -> u64 {
    50
}
fn default_init_acceleration() -> i32 {
    10
}
fn default_init_speed() -> i32 {
    300
}
fn default_max_step_ticks() -> i32 {
    40
}
fn default_wheel_max_speed() -> i32 {
    1000
}

impl Default for BusConfig {
    /// A six-joint arm on ids 1..=6.
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: default_baud_rate(),
            protocol_end: default_protocol_end(),
            command_delay_ms: default_command_delay_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            init_acceleration: default_init_acceleration(),
            init_speed: default_init_speed(),
            max_step_ticks: default_max_step_ticks(),
            wheel_max_speed: default_wheel_max_speed(),
            devices: (1..=6)
                .map(|id| DeviceConfig {
                    id,
                    role: Role::Joint,
                    name: None,
                })
                .collect(),
        }
    }
}

impl BusConfig {
    pub fn command_delay(&self) -> Duration {
        Duration::from_millis(self.command_delay_ms)
    }

    pub fn device_ids(&self) -> Vec<DeviceId> {
        self.devices.iter().map(|d| d.id).collect()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.devices.is_empty() {
            bail!("no devices configured");
        }
        if self.protocol_end > 1 {
            bail!("protocol_end must be 0 or 1, got {}", self.protocol_end);
        }
        let mut seen = HashSet::new();
        for dev in &self.devices {
            if dev.id == 0 || dev.id > MAX_ID {
                bail!("servo id {} out of range 1..={MAX_ID}", dev.id);
            }
            if !seen.insert(dev.id) {
                bail!("duplicate servo id {}", dev.id);
            }
        }
        Ok(())
    }
}

pub fn load_config_file(path: impl AsRef<Path>) -> anyhow::Result<BusConfig> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading bus config: {}", path.display()))?;
    let config: BusConfig = serde_yaml::from_str(&raw)
        .with_context(|| format!("parsing yaml: {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("validating bus config: {}", path.display()))?;
    Ok(config)
}

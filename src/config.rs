//! Typed configuration.
//!
//! The daemon starts only from a fully validated `Config`; every structural
//! problem (bad addresses, unknown data types, mixed register classes in a
//! group) is fatal at load time rather than a runtime surprise.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::bridge::tag::RegisterClass;
use crate::bridge::liveness::{SLAVE_ID_MAX, SLAVE_ID_MIN};
use crate::mqtt::{MQTT_BROKER_DEFAULT, MQTT_PORT_DEFAULT};

pub const CFG_FILENAME_EXT: &str = ".cfg";
pub const MAIN_LOOP_INTERVAL_MIN_MS: u64 = 50;
pub const MAIN_LOOP_INTERVAL_MAX_MS: u64 = 2000;
const MAIN_LOOP_INTERVAL_DEFAULT_MS: u64 = 250;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_main_loop_interval")]
    pub mainloopinterval: u64,
    #[serde(default)]
    pub mqtt: MqttConfig,
    pub modbusrtu: ModbusRtuConfig,
    pub updatecycles: Vec<CycleConfig>,
    pub mbslaves: Vec<SlaveConfig>,
    #[serde(default)]
    pub mqtt_tags: Vec<WriteTagConfig>,
    #[serde(default)]
    pub cputemp: Option<CpuTempConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_broker")]
    pub broker: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub retain_default: bool,
    #[serde(default)]
    pub clearonexit: bool,
    #[serde(default)]
    pub noreadonexit: bool,
    #[serde(default)]
    pub debug: bool,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: default_broker(),
            port: default_mqtt_port(),
            retain_default: false,
            clearonexit: false,
            noreadonexit: false,
            debug: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModbusRtuConfig {
    pub device: String,
    pub baudrate: u32,
    #[serde(default)]
    pub responsetimeout_s: u64,
    #[serde(default = "default_response_timeout_us")]
    pub responsetimeout_us: u64,
    /// Microseconds between transactions addressed to different slaves.
    #[serde(default)]
    pub interslavedelay: u64,
    #[serde(default)]
    pub maxretries: u32,
    /// 0 = off, 1 = request tracing, >1 = frame hex dumps.
    #[serde(default)]
    pub debuglevel: u8,
    #[serde(default)]
    pub slavestatustopic: String,
    #[serde(default)]
    pub slavestatusretain: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CycleConfig {
    pub id: u32,
    /// Seconds between polls.
    pub interval: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SlaveConfig {
    pub id: u8,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub default_retain: bool,
    #[serde(default = "default_noread_action")]
    pub default_noreadaction: i8,
    #[serde(default)]
    pub tags: Vec<ReadTagConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReadTagConfig {
    pub address: u16,
    pub update_cycle: u32,
    #[serde(default)]
    pub group: u16,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default)]
    pub offset: f64,
    #[serde(default)]
    pub retain: Option<bool>,
    #[serde(default)]
    pub noreadvalue: f64,
    #[serde(default)]
    pub noreadaction: Option<i8>,
    #[serde(default)]
    pub noreadignore: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WriteTagConfig {
    pub topic: String,
    pub slaveid: u8,
    pub address: u16,
    /// `r` = holding register, `i`/`q` = single bit.
    pub datatype: String,
    #[serde(default)]
    pub ignoreretained: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CpuTempConfig {
    pub topic: String,
    pub readinterval: u64,
    pub publishinterval: u64,
}

impl Config {
    /// Read and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Clamp and cross-check the parsed structure.
    pub fn validate(&mut self) -> Result<()> {
        let clamped = self
            .mainloopinterval
            .clamp(MAIN_LOOP_INTERVAL_MIN_MS, MAIN_LOOP_INTERVAL_MAX_MS);
        if clamped != self.mainloopinterval {
            log::info!(
                "main loop interval {}ms clamped to {}ms",
                self.mainloopinterval,
                clamped
            );
            self.mainloopinterval = clamped;
        }

        if self.modbusrtu.device.is_empty() {
            bail!("modbusrtu.device must not be empty");
        }
        if self.modbusrtu.baudrate == 0 {
            bail!("modbusrtu.baudrate must not be zero");
        }

        if self.updatecycles.is_empty() {
            bail!("no update cycles configured");
        }
        for cycle in &self.updatecycles {
            if cycle.interval == 0 {
                bail!("update cycle {} has a zero interval", cycle.id);
            }
        }
        let cycle_ids: HashSet<u32> = self.updatecycles.iter().map(|cycle| cycle.id).collect();

        if self.mbslaves.is_empty() {
            bail!("no Modbus slaves configured");
        }
        for slave in &self.mbslaves {
            if !(SLAVE_ID_MIN..=SLAVE_ID_MAX).contains(&slave.id) {
                bail!("slave id {} is outside {SLAVE_ID_MIN}..{SLAVE_ID_MAX}", slave.id);
            }
            if !slave.enabled {
                continue;
            }
            // all members of one group must live in one register class, or
            // the coalesced range read could not be issued
            let mut group_classes: HashMap<u16, RegisterClass> = HashMap::new();
            for tag in &slave.tags {
                let (class, _) = RegisterClass::decode(tag.address)
                    .with_context(|| format!("slave {} tag {}", slave.id, tag.address))?;
                if tag.group > 0 {
                    match group_classes.get(&tag.group) {
                        Some(&seen) if seen != class => bail!(
                            "slave {} group {} mixes register classes ({seen:?} and {class:?})",
                            slave.id,
                            tag.group
                        ),
                        Some(_) => {}
                        None => {
                            group_classes.insert(tag.group, class);
                        }
                    }
                }
                if !cycle_ids.contains(&tag.update_cycle) {
                    log::warn!(
                        "slave {} tag {} references unknown update cycle {}",
                        slave.id,
                        tag.address,
                        tag.update_cycle
                    );
                }
                if let Some(action) = tag.noreadaction {
                    if !(-1..=1).contains(&action) {
                        bail!(
                            "slave {} tag {} has invalid noreadaction {action}",
                            slave.id,
                            tag.address
                        );
                    }
                }
            }
            if !(-1..=1).contains(&slave.default_noreadaction) {
                bail!(
                    "slave {} has invalid default_noreadaction {}",
                    slave.id,
                    slave.default_noreadaction
                );
            }
        }
        Ok(())
    }

    /// Total Modbus response timeout.
    pub fn response_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.modbusrtu.responsetimeout_s)
            + std::time::Duration::from_micros(self.modbusrtu.responsetimeout_us)
    }
}

/// Configuration base name plus the fixed extension.
pub fn config_file_name(base: &str) -> String {
    format!("{base}{CFG_FILENAME_EXT}")
}

fn default_main_loop_interval() -> u64 {
    MAIN_LOOP_INTERVAL_DEFAULT_MS
}

fn default_broker() -> String {
    MQTT_BROKER_DEFAULT.to_string()
}

fn default_mqtt_port() -> u16 {
    MQTT_PORT_DEFAULT
}

fn default_response_timeout_us() -> u64 {
    500_000
}

fn default_true() -> bool {
    true
}

fn default_noread_action() -> i8 {
    -1
}

fn default_multiplier() -> f64 {
    1.0
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    let mut config: Config = toml::from_str(SAMPLE_CONFIG).unwrap();
    config.validate().unwrap();
    config
}

#[cfg(test)]
const SAMPLE_CONFIG: &str = r#"
mainloopinterval = 250

[mqtt]
broker = "127.0.0.1"
retain_default = false
clearonexit = true
noreadonexit = false

[modbusrtu]
device = "/dev/ttyUSB0"
baudrate = 19200
responsetimeout_s = 0
responsetimeout_us = 250000
interslavedelay = 10000
maxretries = 2
slavestatustopic = "plant/status/"
slavestatusretain = true

[[updatecycles]]
id = 1
interval = 10

[[updatecycles]]
id = 2
interval = 60

[[mbslaves]]
id = 3
name = "meter"
default_retain = true
default_noreadaction = 1

[[mbslaves.tags]]
address = 40010
update_cycle = 1
topic = "plant/power"
format = "%.1f"
multiplier = 0.1
noreadvalue = -1.0
noreadignore = 1

[[mbslaves.tags]]
address = 40011
update_cycle = 2

[[mqtt_tags]]
topic = "plant/setpoint"
slaveid = 3
address = 40020
datatype = "r"
ignoreretained = true

[cputemp]
topic = "sys/cputemp"
readinterval = 5
publishinterval = 30
"#;

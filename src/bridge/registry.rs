//! Tag registry: owns all read, write and local tags.
//!
//! Tags are stored in contiguous arrays and referenced by index everywhere
//! else (cycles, the write queue). Topic lookup is a linear scan; the tag
//! population is small and fixed at startup.

use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};

use crate::config::{Config, CpuTempConfig, WriteTagConfig};

use super::liveness::{SLAVE_ID_MAX, SLAVE_ID_MIN};
use super::tag::{NoreadAction, ReadTag, RegisterClass, WriteKind, WriteTag};

/// An out-of-band telemetry value sourced from the local host rather than
/// the field bus (CPU temperature).
#[derive(Debug, Clone)]
pub struct LocalTag {
    pub topic: String,
    pub read_interval: Duration,
    pub publish_interval: Duration,
    pub next_read: Instant,
    pub next_publish: Instant,
    pub value: f64,
    pub retain: bool,
    pub publish_enabled: bool,
}

impl LocalTag {
    pub fn new(cfg: &CpuTempConfig, retain: bool, now: Instant) -> Self {
        let read_interval = Duration::from_secs(cfg.readinterval);
        let publish_interval = Duration::from_secs(cfg.publishinterval);
        Self {
            topic: cfg.topic.clone(),
            read_interval,
            publish_interval,
            next_read: now + read_interval,
            next_publish: now + publish_interval,
            value: 0.0,
            retain,
            publish_enabled: cfg.publishinterval > 0,
        }
    }
}

pub struct TagRegistry {
    pub read_tags: Vec<ReadTag>,
    pub write_tags: Vec<WriteTag>,
    pub local_tags: Vec<LocalTag>,
}

impl TagRegistry {
    /// Build the full tag population from a validated configuration.
    pub fn from_config(cfg: &Config, now: Instant) -> Result<Self> {
        let mut read_tags = Vec::new();
        for slave in &cfg.mbslaves {
            if !slave.enabled {
                log::info!("slave {} ({}) disabled in config", slave.id, slave.name);
                continue;
            }
            for tag_cfg in &slave.tags {
                let mut tag = ReadTag::new(slave.id, tag_cfg.address)
                    .with_context(|| format!("slave {} tag {}", slave.id, tag_cfg.address))?;
                tag.update_cycle_id = tag_cfg.update_cycle;
                tag.group = tag_cfg.group;
                if let Some(topic) = &tag_cfg.topic {
                    tag.topic = topic.clone();
                    tag.retain = tag_cfg.retain.unwrap_or(slave.default_retain);
                    if let Some(format) = &tag_cfg.format {
                        tag.format = format.clone();
                    }
                    tag.multiplier = tag_cfg.multiplier;
                    tag.offset = tag_cfg.offset;
                    tag.noread_value = tag_cfg.noreadvalue;
                    let action_code = tag_cfg.noreadaction.unwrap_or(slave.default_noreadaction);
                    tag.noread_action = NoreadAction::from_code(action_code)
                        .with_context(|| {
                            format!("invalid noreadaction {action_code} for topic {topic}")
                        })?;
                    tag.noread_ignore = tag_cfg.noreadignore;
                }
                read_tags.push(tag);
            }
        }

        let mut write_tags = Vec::new();
        for tag_cfg in &cfg.mqtt_tags {
            write_tags.push(build_write_tag(tag_cfg)?);
        }
        if cfg.mqtt_tags.is_empty() {
            log::info!("configuration has no mqtt_tags, nothing will be written to the bus");
        }

        let mut local_tags = Vec::new();
        if let Some(cputemp) = &cfg.cputemp {
            local_tags.push(LocalTag::new(cputemp, cfg.mqtt.retain_default, now));
        }

        Ok(Self {
            read_tags,
            write_tags,
            local_tags,
        })
    }

    /// Find the write tag subscribed to a topic.
    pub fn find_write_tag(&self, topic: &str) -> Option<usize> {
        self.write_tags.iter().position(|tag| tag.topic == topic)
    }
}

fn build_write_tag(cfg: &WriteTagConfig) -> Result<WriteTag> {
    let kind = match WriteKind::parse(&cfg.datatype) {
        Some(kind) => kind,
        None => bail!(
            "unknown datatype {:?} for write tag {}",
            cfg.datatype,
            cfg.topic
        ),
    };
    if !(SLAVE_ID_MIN..=SLAVE_ID_MAX).contains(&cfg.slaveid) {
        bail!("write tag {} has invalid slave id {}", cfg.topic, cfg.slaveid);
    }
    let (class, _) = RegisterClass::decode(cfg.address)
        .with_context(|| format!("write tag {}", cfg.topic))?;
    let class_matches = match kind {
        WriteKind::HoldingRegister => class == RegisterClass::HoldingRegister,
        WriteKind::DiscreteInputLike | WriteKind::CoilLike => class == RegisterClass::Coil,
    };
    if !class_matches {
        bail!(
            "write tag {} cannot write address {} (class {:?}) as datatype {:?}",
            cfg.topic,
            cfg.address,
            class,
            cfg.datatype
        );
    }
    Ok(WriteTag::new(
        cfg.topic.clone(),
        cfg.slaveid,
        cfg.address,
        kind,
        cfg.ignoreretained,
    )?)
}

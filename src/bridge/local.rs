//! Locally sourced telemetry (host CPU temperature).
//!
//! Local tags run on their own read/publish intervals, independent of the
//! field bus. Reads happen whether or not the broker is reachable; only the
//! publication itself needs the connection, and missed publish slots are
//! skipped rather than queued.

use std::time::Instant;

use super::publisher::render_value;
use super::Bridge;

const CPU_TEMP_PATH: &str = "/sys/class/thermal/thermal_zone0/temp";

/// Read the CPU temperature in degrees Celsius (sysfs reports
/// millidegrees).
pub fn read_cpu_temp() -> Option<f64> {
    let raw = std::fs::read_to_string(CPU_TEMP_PATH).ok()?;
    let millidegrees: f64 = raw.trim().parse().ok()?;
    Some(millidegrees / 1000.0)
}

impl Bridge {
    pub(crate) fn process_local_tags(&mut self, now: Instant) -> bool {
        let mut processed = false;
        for tag in &mut self.registry.local_tags {
            if now >= tag.next_read {
                match read_cpu_temp() {
                    Some(value) => tag.value = value,
                    None => log::debug!("cpu temperature unavailable"),
                }
                tag.next_read = now + tag.read_interval;
                processed = true;
            }
            if tag.publish_enabled && now >= tag.next_publish {
                if self.mqtt.is_connected() {
                    self.mqtt
                        .publish(&tag.topic, &render_value("%.1f", tag.value), tag.retain);
                    processed = true;
                }
                tag.next_publish = now + tag.publish_interval;
            }
        }
        processed
    }
}

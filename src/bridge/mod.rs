//! The bridge engine.
//!
//! One value owns everything: the tag registry, the update cycles, the
//! slave liveness table, the Modbus transport and the MQTT link. The main
//! loop ticks at a fixed period; each tick drains MQTT events, runs one
//! scheduler pass and at most one write, then services the local tags.

pub mod cycle;
pub mod liveness;
pub mod local;
pub mod publisher;
pub mod registry;
pub mod scheduler;
pub mod tag;
pub mod writer;

use std::time::{Duration, Instant};

use anyhow::Result;

use crate::config::Config;
use crate::modbus::ModbusTransport;
use crate::mqtt::{InboundMessage, MqttEvent, MqttLink};
use crate::signal;

pub use cycle::{assign_update_cycles, UpdateCycle};
pub use liveness::SlaveStatus;
pub use registry::TagRegistry;
pub use scheduler::GroupReadOutcome;
pub use tag::{ReadTag, RegisterClass, WriteKind, WriteTag};
pub use writer::{DrainOutcome, WRITE_MAX_ATTEMPTS};

#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub main_loop_interval: Duration,
    pub inter_slave_delay: Duration,
    pub max_retries: u32,
    pub write_max_attempts: u32,
    pub modbus_debug: u8,
    pub clear_on_exit: bool,
    pub noread_on_exit: bool,
}

pub struct Bridge {
    pub(crate) settings: BridgeSettings,
    pub(crate) registry: TagRegistry,
    pub(crate) cycles: Vec<UpdateCycle>,
    pub(crate) slaves: SlaveStatus,
    /// Taken on shutdown to close the serial line before the broker sweep.
    pub(crate) transport: Option<Box<dyn ModbusTransport>>,
    pub(crate) mqtt: MqttLink,
    /// Count of write tags with the pending flag set.
    pub(crate) pending_writes: usize,
    pub(crate) last_write_slave: Option<u8>,
}

impl Bridge {
    pub fn new(
        settings: BridgeSettings,
        registry: TagRegistry,
        cycles: Vec<UpdateCycle>,
        slaves: SlaveStatus,
        transport: Box<dyn ModbusTransport>,
        mqtt: MqttLink,
    ) -> Self {
        Self {
            settings,
            registry,
            cycles,
            slaves,
            transport: Some(transport),
            mqtt,
            pending_writes: 0,
            last_write_slave: None,
        }
    }

    /// Assemble the engine from a validated configuration.
    pub fn from_config(
        cfg: &Config,
        transport: Box<dyn ModbusTransport>,
        mqtt: MqttLink,
    ) -> Result<Self> {
        let now = Instant::now();
        let registry = TagRegistry::from_config(cfg, now)?;
        let cycles = assign_update_cycles(&cfg.updatecycles, &registry.read_tags, now);
        let slaves = SlaveStatus::new(
            cfg.modbusrtu.slavestatustopic.clone(),
            cfg.modbusrtu.slavestatusretain,
        );
        let settings = BridgeSettings {
            main_loop_interval: Duration::from_millis(cfg.mainloopinterval),
            inter_slave_delay: Duration::from_micros(cfg.modbusrtu.interslavedelay),
            max_retries: cfg.modbusrtu.maxretries,
            write_max_attempts: WRITE_MAX_ATTEMPTS,
            modbus_debug: cfg.modbusrtu.debuglevel,
            clear_on_exit: cfg.mqtt.clearonexit,
            noread_on_exit: cfg.mqtt.noreadonexit,
        };
        Ok(Self::new(settings, registry, cycles, slaves, transport, mqtt))
    }

    /// Fixed-period main loop; runs until an exit signal arrives.
    pub fn run(&mut self) {
        let interval = self.settings.main_loop_interval;
        let mut min_time = Duration::MAX;
        let mut max_time = Duration::ZERO;

        while !signal::exit_requested() {
            let start = Instant::now();
            let processed = self.tick();
            let processing_time = start.elapsed();

            if processed {
                log::debug!("tick took {}us", processing_time.as_micros());
                min_time = min_time.min(processing_time);
                max_time = max_time.max(processing_time);
            }

            if processing_time < interval {
                std::thread::sleep(interval - processing_time);
            }

            if self.mqtt.reconnect_due(Instant::now()) {
                self.mqtt.connect();
            }
        }

        if max_time > Duration::ZERO {
            log::info!(
                "modbus processing time: {}us - {}us",
                min_time.as_micros(),
                max_time.as_micros()
            );
        }
    }

    /// One main-loop tick. Returns true when any bus or local work was done.
    pub fn tick(&mut self) -> bool {
        // connection state and inbound write intents first, on this thread
        let events = self.mqtt.poll_events();
        for event in events {
            match event {
                MqttEvent::Connected => self.on_mqtt_connected(),
                MqttEvent::Message(message) => self.handle_inbound_message(&message),
                MqttEvent::Disconnected => {}
            }
        }

        let mut processed = false;
        if self.mqtt.is_connected() {
            let now = Instant::now();
            if self.run_read_pass(now) {
                processed = true;
            }
            if self.drain_one_write() == DrainOutcome::Progressed {
                processed = true;
            }
        }
        if self.process_local_tags(Instant::now()) {
            processed = true;
        }
        processed
    }

    /// Subscriptions are (re)established on every successful connect, before
    /// any publish of the new session.
    fn on_mqtt_connected(&mut self) {
        for tag in &self.registry.write_tags {
            self.mqtt.subscribe(&tag.topic);
        }
    }

    /// Inbound message → topic lookup → write intent on the matching tag.
    fn handle_inbound_message(&mut self, message: &InboundMessage) {
        let Some(index) = self.registry.find_write_tag(&message.topic) else {
            log::warn!("<{}> is not a subscribed topic", message.topic);
            return;
        };
        if message.retain && self.registry.write_tags[index].ignore_retained {
            return;
        }
        let text = String::from_utf8_lossy(&message.payload);
        let Ok(value) = text.trim().parse::<f64>() else {
            log::warn!(
                "ignoring non-numeric payload on {}: {:?}",
                message.topic,
                text
            );
            return;
        };
        let tag = &mut self.registry.write_tags[index];
        tag.set_raw(value as i32 as u16);
        if !tag.write_pending {
            tag.write_pending = true;
            self.pending_writes += 1;
        }
    }

    pub(crate) fn set_slave_online(&mut self, slave: u8, status: bool, force: bool) {
        if let Some(report) = self.slaves.set_online(slave, status, force) {
            self.mqtt.publish(&report.topic, report.payload, report.retain);
        }
    }

    /// Pacing delay between transactions to different slaves.
    pub(crate) fn inter_slave_pause(&self) {
        if !self.settings.inter_slave_delay.is_zero() {
            std::thread::sleep(self.settings.inter_slave_delay);
        }
    }

    /// Orderly shutdown: report every online slave as offline, close the
    /// serial line, run the optional retained-state sweep, then disconnect
    /// from the broker (waiting up to 5 s for the session to drop).
    pub fn shutdown(&mut self) {
        for slave in self.slaves.online_slaves() {
            self.set_slave_online(slave, false, false);
        }

        if self.transport.take().is_some() {
            log::info!("modbus closed");
        }

        if self.settings.noread_on_exit || self.settings.clear_on_exit {
            log::debug!("clearing MQTT tags");
            publisher::clear_all_tags(
                &self.mqtt,
                &self.registry,
                &self.cycles,
                self.settings.noread_on_exit,
                self.settings.clear_on_exit,
            );
        }

        self.mqtt.disconnect();
        for _ in 0..50 {
            self.mqtt.poll_events();
            if !self.mqtt.is_connected() {
                break;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        if self.mqtt.is_connected() {
            log::debug!("MQTT disconnect failed (waited for 5s)");
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::{due_cycle, test_bridge};
    use super::*;
    use crate::mqtt::TestOp;
    use bytes::Bytes;

    fn write_tag(topic: &str, ignore_retained: bool) -> WriteTag {
        WriteTag::new(
            topic.to_string(),
            3,
            40020,
            WriteKind::HoldingRegister,
            ignore_retained,
        )
        .unwrap()
    }

    fn inbound(topic: &str, payload: &str, retain: bool) -> InboundMessage {
        InboundMessage {
            topic: topic.to_string(),
            payload: Bytes::copy_from_slice(payload.as_bytes()),
            retain,
        }
    }

    #[test]
    fn inbound_message_enqueues_a_write_intent() {
        let (mut bridge, _transport, _outbox) =
            test_bridge(vec![], vec![write_tag("plant/sp", false)], true);

        bridge.handle_inbound_message(&inbound("plant/sp", "100", false));

        let tag = &bridge.registry.write_tags[0];
        assert!(tag.write_pending());
        assert_eq!(tag.raw_value(), 100);
        assert_eq!(bridge.pending_writes, 1);
    }

    #[test]
    fn retained_messages_are_suppressed_when_configured() {
        let (mut bridge, transport, _outbox) =
            test_bridge(vec![], vec![write_tag("plant/sp", true)], true);

        bridge.handle_inbound_message(&inbound("plant/sp", "100", true));

        assert!(!bridge.registry.write_tags[0].write_pending());
        assert_eq!(bridge.pending_writes, 0);
        bridge.drain_one_write();
        assert!(transport.requests().is_empty());

        // a live (non-retained) message on the same tag still writes
        bridge.handle_inbound_message(&inbound("plant/sp", "7", false));
        assert!(bridge.registry.write_tags[0].write_pending());
    }

    #[test]
    fn unknown_topics_and_bad_payloads_are_dropped() {
        let (mut bridge, _transport, _outbox) =
            test_bridge(vec![], vec![write_tag("plant/sp", false)], true);

        bridge.handle_inbound_message(&inbound("plant/unknown", "1", false));
        bridge.handle_inbound_message(&inbound("plant/sp", "on", false));

        assert!(!bridge.registry.write_tags[0].write_pending());
        assert_eq!(bridge.pending_writes, 0);
    }

    #[test]
    fn duplicate_updates_keep_the_pending_count_consistent() {
        let (mut bridge, _transport, _outbox) =
            test_bridge(vec![], vec![write_tag("plant/sp", false)], true);

        bridge.handle_inbound_message(&inbound("plant/sp", "1", false));
        bridge.handle_inbound_message(&inbound("plant/sp", "2", false));

        // latest value wins, but it is still one pending write
        assert_eq!(bridge.registry.write_tags[0].raw_value(), 2);
        assert_eq!(bridge.pending_writes, 1);
        let pending = bridge
            .registry
            .write_tags
            .iter()
            .filter(|tag| tag.write_pending())
            .count();
        assert_eq!(pending, bridge.pending_writes);
    }

    #[test]
    fn payloads_parse_like_c_number_conversion() {
        let (mut bridge, _transport, _outbox) =
            test_bridge(vec![], vec![write_tag("plant/sp", false)], true);
        bridge.handle_inbound_message(&inbound("plant/sp", " 41.7 ", false));
        // fractional payloads truncate toward zero
        assert_eq!(bridge.registry.write_tags[0].raw_value(), 41);
    }

    #[test]
    fn no_bus_traffic_while_disconnected() {
        let mut tag = ReadTag::new(3, 40010).unwrap();
        tag.update_cycle_id = 1;
        tag.topic = "plant/power".to_string();
        let (mut bridge, transport, _outbox) = test_bridge(vec![tag], vec![], false);
        let now = Instant::now();
        bridge.cycles = vec![due_cycle(vec![0], now)];

        bridge.tick();

        assert!(transport.requests().is_empty());
    }

    #[test]
    fn connect_resubscribes_before_anything_is_published() {
        let (mut bridge, _transport, outbox) = test_bridge(
            vec![],
            vec![write_tag("plant/sp", false), write_tag("plant/sp2", false)],
            true,
        );

        bridge.on_mqtt_connected();
        bridge.set_slave_online(3, true, false);

        let ops: Vec<TestOp> = outbox.try_iter().collect();
        assert_eq!(
            ops[0],
            TestOp::Subscribe {
                topic: "plant/sp".to_string()
            }
        );
        assert_eq!(
            ops[1],
            TestOp::Subscribe {
                topic: "plant/sp2".to_string()
            }
        );
        assert!(matches!(ops[2], TestOp::Publish { .. }));
    }

    #[test]
    fn shutdown_reports_offline_and_sweeps_retained_state() {
        let mut tag = ReadTag::new(3, 40010).unwrap();
        tag.update_cycle_id = 1;
        tag.topic = "plant/power".to_string();
        tag.noread_value = -9.0;
        tag.format = "%.0f".to_string();
        let (mut bridge, transport, outbox) = test_bridge(vec![tag], vec![], true);
        let now = Instant::now();
        bridge.cycles = vec![due_cycle(vec![0], now)];
        bridge.settings.noread_on_exit = true;
        bridge.settings.clear_on_exit = true;

        // bring slave 3 online so shutdown has something to report
        transport.push_read(Ok(vec![1]));
        bridge.run_read_pass(now);
        let _ = outbox.try_iter().collect::<Vec<_>>();

        bridge.shutdown();

        let ops: Vec<TestOp> = outbox.try_iter().collect();
        assert_eq!(
            ops[0],
            TestOp::Publish {
                topic: "status/3".to_string(),
                payload: "0".to_string(),
                retain: false,
            }
        );
        assert!(ops.contains(&TestOp::Publish {
            topic: "plant/power".to_string(),
            payload: "-9".to_string(),
            retain: false,
        }));
        assert!(ops.contains(&TestOp::ClearRetained {
            topic: "plant/power".to_string(),
        }));

        // the serial line is gone; later reads fail without touching the bus
        transport.clear_requests();
        bridge.read_single_tag(0);
        assert!(transport.requests().is_empty());
    }

    #[test]
    fn tick_runs_reads_before_the_write_drain() {
        let mut tag = ReadTag::new(3, 40010).unwrap();
        tag.update_cycle_id = 1;
        let (mut bridge, transport, _outbox) =
            test_bridge(vec![tag], vec![write_tag("plant/sp", false)], true);
        let now = Instant::now();
        bridge.cycles = vec![due_cycle(vec![0], now)];
        transport.push_read(Ok(vec![1]));
        transport.push_write(Ok(()));
        bridge.registry.write_tags[0].write_pending = true;
        bridge.pending_writes = 1;

        bridge.tick();

        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].function, 3);
        assert_eq!(requests[1].function, 6);
    }
}

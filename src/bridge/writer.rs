//! Write queue.
//!
//! Pending writes are drained one attempt per main-loop tick so reads keep
//! getting bus time. A failed write stays pending and is retried on later
//! ticks until it succeeds or hits the attempt limit, at which point it is
//! abandoned and its counters reset.

use crate::modbus::ModbusError;

use super::tag::WriteKind;
use super::Bridge;

pub const WRITE_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// One write was attempted (successfully or not).
    Progressed,
    /// Nothing was pending.
    Idle,
}

impl Bridge {
    /// Attempt the first pending write in tag order.
    pub(crate) fn drain_one_write(&mut self) -> DrainOutcome {
        for index in 0..self.registry.write_tags.len() {
            if !self.registry.write_tags[index].write_pending {
                continue;
            }
            let slave = self.registry.write_tags[index].slave_id;
            if let Some(previous) = self.last_write_slave {
                if previous != slave {
                    self.inter_slave_pause();
                }
            }
            self.last_write_slave = Some(slave);

            if self.write_tag(index) {
                let tag = &mut self.registry.write_tags[index];
                tag.write_pending = false;
                tag.write_failed_count = 0;
                self.pending_writes -= 1;
                self.set_slave_online(slave, true, false);
            } else {
                let failed_count = {
                    let tag = &mut self.registry.write_tags[index];
                    tag.write_failed_count += 1;
                    tag.write_failed_count
                };
                if self.settings.modbus_debug > 0 && self.slaves.is_online(slave) {
                    let address = self.registry.write_tags[index].address;
                    log::warn!(
                        "modbus write attempt #{failed_count} failed [slave {slave} addr {address}]"
                    );
                }
                if failed_count >= self.settings.write_max_attempts {
                    let tag = &mut self.registry.write_tags[index];
                    tag.write_pending = false;
                    tag.write_failed_count = 0;
                    self.pending_writes -= 1;
                }
            }
            return DrainOutcome::Progressed;
        }
        DrainOutcome::Idle
    }

    /// Dispatch one write to the bus: FC6 for holding registers, FC5 for the
    /// single-bit kinds.
    fn write_tag(&mut self, index: usize) -> bool {
        let (slave, address, class_offset, kind, raw, bit) = {
            let tag = &self.registry.write_tags[index];
            (
                tag.slave_id,
                tag.address,
                tag.class_offset,
                tag.kind,
                tag.raw_value(),
                tag.bool_value(),
            )
        };
        if self.settings.modbus_debug > 0 {
            log::debug!("writing {raw} to slave {slave} addr {address}");
        }
        let result = match self.transport.as_deref_mut() {
            Some(transport) => match kind {
                WriteKind::HoldingRegister => {
                    transport.write_single_register(slave, class_offset, raw)
                }
                WriteKind::DiscreteInputLike | WriteKind::CoilLike => {
                    transport.write_single_coil(slave, class_offset, bit)
                }
            },
            None => Err(ModbusError::Other("serial port closed".to_string())),
        };
        match result {
            Ok(()) => {
                if self.settings.modbus_debug > 0 {
                    log::debug!("write success, value = {raw} [0x{raw:04x}]");
                }
                true
            }
            Err(err) => {
                if err == ModbusError::Timeout {
                    self.set_slave_online(slave, false, false);
                }
                log::error!("modbus write #{slave} (addr {address}) failed: {err}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::tag::WriteTag;
    use crate::bridge::testutil::test_bridge;
    use crate::mqtt::TestOp;

    fn holding_tag(topic: &str, slave: u8, address: u16) -> WriteTag {
        WriteTag::new(
            topic.to_string(),
            slave,
            address,
            WriteKind::HoldingRegister,
            false,
        )
        .unwrap()
    }

    #[test]
    fn idle_when_nothing_is_pending() {
        let tags = vec![holding_tag("plant/sp", 3, 40020)];
        let (mut bridge, transport, _outbox) = test_bridge(vec![], tags, true);
        assert_eq!(bridge.drain_one_write(), DrainOutcome::Idle);
        assert!(transport.requests().is_empty());
    }

    #[test]
    fn successful_write_clears_pending_and_marks_online() {
        let tags = vec![holding_tag("plant/sp", 3, 40020)];
        let (mut bridge, transport, outbox) = test_bridge(vec![], tags, true);
        bridge.registry.write_tags[0].set_raw(100);
        bridge.registry.write_tags[0].write_pending = true;
        bridge.pending_writes = 1;
        transport.push_write(Ok(()));

        assert_eq!(bridge.drain_one_write(), DrainOutcome::Progressed);

        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].function, 6);
        assert_eq!(requests[0].slave, 3);
        assert_eq!(requests[0].address, 20);
        assert_eq!(requests[0].value, 100);

        assert!(!bridge.registry.write_tags[0].write_pending());
        assert_eq!(bridge.pending_writes, 0);
        assert!(bridge.slaves.is_online(3));
        let ops: Vec<TestOp> = outbox.try_iter().collect();
        assert!(ops.contains(&TestOp::Publish {
            topic: "status/3".to_string(),
            payload: "1".to_string(),
            retain: false,
        }));
    }

    #[test]
    fn bit_kinds_write_a_clamped_coil() {
        let tags = vec![
            WriteTag::new("plant/run".to_string(), 4, 12, WriteKind::CoilLike, false).unwrap(),
        ];
        let (mut bridge, transport, _outbox) = test_bridge(vec![], tags, true);
        bridge.registry.write_tags[0].set_raw(200);
        bridge.registry.write_tags[0].write_pending = true;
        bridge.pending_writes = 1;
        transport.push_write(Ok(()));

        bridge.drain_one_write();

        let requests = transport.requests();
        assert_eq!(requests[0].function, 5);
        assert_eq!(requests[0].address, 12);
        assert_eq!(requests[0].value, 1);
    }

    #[test]
    fn failed_writes_retry_across_ticks_then_abandon() {
        let tags = vec![holding_tag("plant/sp", 3, 40020)];
        let (mut bridge, transport, _outbox) = test_bridge(vec![], tags, true);
        bridge.registry.write_tags[0].set_raw(100);
        bridge.registry.write_tags[0].write_pending = true;
        bridge.pending_writes = 1;

        for expected_count in 1..=2u32 {
            transport.push_write(Err(ModbusError::Timeout));
            assert_eq!(bridge.drain_one_write(), DrainOutcome::Progressed);
            assert!(bridge.registry.write_tags[0].write_pending());
            assert_eq!(
                bridge.registry.write_tags[0].write_failed_count(),
                expected_count
            );
            assert_eq!(bridge.pending_writes, 1);
        }

        // third failed attempt abandons the write
        transport.push_write(Err(ModbusError::Timeout));
        assert_eq!(bridge.drain_one_write(), DrainOutcome::Progressed);
        assert!(!bridge.registry.write_tags[0].write_pending());
        assert_eq!(bridge.registry.write_tags[0].write_failed_count(), 0);
        assert_eq!(bridge.pending_writes, 0);
        assert!(!bridge.slaves.is_online(3));

        // exactly three attempts reached the bus
        let writes: Vec<_> = transport
            .requests()
            .into_iter()
            .filter(|request| request.function == 6)
            .collect();
        assert_eq!(writes.len(), 3);

        assert_eq!(bridge.drain_one_write(), DrainOutcome::Idle);
    }

    #[test]
    fn only_one_write_is_attempted_per_drain() {
        let tags = vec![
            holding_tag("plant/a", 3, 40020),
            holding_tag("plant/b", 4, 40021),
        ];
        let (mut bridge, transport, _outbox) = test_bridge(vec![], tags, true);
        for index in 0..2 {
            bridge.registry.write_tags[index].write_pending = true;
        }
        bridge.pending_writes = 2;
        transport.push_write(Ok(()));
        transport.push_write(Ok(()));

        bridge.drain_one_write();
        assert_eq!(transport.requests().len(), 1);
        assert_eq!(bridge.pending_writes, 1);

        bridge.drain_one_write();
        assert_eq!(transport.requests().len(), 2);
        assert_eq!(bridge.pending_writes, 0);
        assert_eq!(transport.requests()[1].slave, 4);
    }
}

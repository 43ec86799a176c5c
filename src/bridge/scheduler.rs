//! Cyclic read scheduling and group-coalesced reads.
//!
//! Each pass walks the due cycles in declaration order and their tags in
//! list order. Ungrouped tags are read one register at a time; grouped tags
//! are coalesced into a single range read per (slave, group) and pass, with
//! the pass reference instant marking members already covered. Pending
//! writes abort the pass early so write latency stays bounded on the shared
//! half-duplex link.

use std::time::Instant;

use crate::modbus::ModbusError;

use super::publisher;
use super::tag::RegisterClass;
use super::Bridge;

/// A range read must fit a single Modbus response.
pub const GROUP_READ_MAX_REGISTERS: u16 = 125;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupReadOutcome {
    /// The referenced tag carries no group id; caller falls back to a single
    /// read.
    NotAGroup,
    /// The group was already fetched earlier in this pass; only the
    /// referenced tag was published.
    AlreadyRead,
    /// One range read updated every member.
    Read,
    /// The range read failed; every member took a noread.
    Failed,
    /// The group spans more registers than one request can carry.
    RangeTooLarge,
}

impl Bridge {
    /// Run one scheduler pass over all due cycles. Returns true when any
    /// cycle was serviced.
    pub(crate) fn run_read_pass(&mut self, now: Instant) -> bool {
        let mut processed = false;
        let mut last_slave: Option<u8> = None;
        for cycle_index in 0..self.cycles.len() {
            if self.cycles[cycle_index].tag_indexes.is_empty() {
                continue;
            }
            if now < self.cycles[cycle_index].next_fire {
                continue;
            }
            let interval = self.cycles[cycle_index].interval;
            self.cycles[cycle_index].next_fire = now + interval;
            // reference instant for group de-duplication within this pass
            let reference = Instant::now();
            let tag_indexes = self.cycles[cycle_index].tag_indexes.clone();
            for (position, &tag_index) in tag_indexes.iter().enumerate() {
                let slave = self.registry.read_tags[tag_index].slave_id;
                if last_slave != Some(slave) {
                    if last_slave.is_some() {
                        self.inter_slave_pause();
                    }
                    last_slave = Some(slave);
                }
                if self.registry.read_tags[tag_index].group == 0 {
                    self.read_single_tag(tag_index);
                } else {
                    self.read_group(&tag_indexes, position, reference);
                }
                // leave the bus to the write queue as soon as work appears
                if self.pending_writes > 0 {
                    return true;
                }
            }
            processed = true;
        }
        processed
    }

    /// Read one ungrouped tag and publish the result.
    pub(crate) fn read_single_tag(&mut self, tag_index: usize) {
        let (slave, class, class_offset) = {
            let tag = &self.registry.read_tags[tag_index];
            (tag.slave_id, tag.class, tag.class_offset)
        };
        match self.read_registers(slave, class, class_offset, 1) {
            Ok(values) if !values.is_empty() => {
                self.registry.read_tags[tag_index].set_raw(values[0]);
            }
            _ => self.registry.read_tags[tag_index].noread_notify(),
        }
        publisher::publish_tag(&self.mqtt, &self.registry.read_tags[tag_index]);
    }

    /// Coalesced read of all tags sharing the referenced tag's slave and
    /// group. Publishes only the referenced tag; the other members publish
    /// when their own list position comes up and hits the already-read path.
    pub(crate) fn read_group(
        &mut self,
        tag_indexes: &[usize],
        position: usize,
        reference: Instant,
    ) -> GroupReadOutcome {
        let referenced = tag_indexes[position];
        let (group, slave, class) = {
            let tag = &self.registry.read_tags[referenced];
            (tag.group, tag.slave_id, tag.class)
        };
        if group == 0 {
            return GroupReadOutcome::NotAGroup;
        }
        if self.registry.read_tags[referenced].reference_time == Some(reference) {
            publisher::publish_tag(&self.mqtt, &self.registry.read_tags[referenced]);
            return GroupReadOutcome::AlreadyRead;
        }

        let members: Vec<usize> = tag_indexes
            .iter()
            .copied()
            .filter(|&index| {
                let tag = &self.registry.read_tags[index];
                tag.slave_id == slave && tag.group == group
            })
            .collect();
        let addr_lo = members
            .iter()
            .map(|&index| self.registry.read_tags[index].address)
            .min()
            .unwrap_or(0);
        let addr_hi = members
            .iter()
            .map(|&index| self.registry.read_tags[index].address)
            .max()
            .unwrap_or(0);
        // gaps inside the range are read along but mapped to no tag
        let span = addr_hi - addr_lo + 1;
        if span > GROUP_READ_MAX_REGISTERS {
            log::error!(
                "group {group} on slave {slave} spans {span} registers, limit is {GROUP_READ_MAX_REGISTERS}"
            );
            self.registry.read_tags[referenced].noread_notify();
            publisher::publish_tag(&self.mqtt, &self.registry.read_tags[referenced]);
            return GroupReadOutcome::RangeTooLarge;
        }

        let result = self.read_registers(slave, class, addr_lo - class.base(), span);
        let outcome = match &result {
            Ok(_) => {
                self.inter_slave_pause();
                GroupReadOutcome::Read
            }
            Err(_) => GroupReadOutcome::Failed,
        };
        for &member in &members {
            let tag = &mut self.registry.read_tags[member];
            match &result {
                Ok(registers) => {
                    let slot = (tag.address - addr_lo) as usize;
                    if let Some(&value) = registers.get(slot) {
                        tag.set_raw(value);
                    }
                }
                Err(_) => tag.noread_notify(),
            }
            tag.reference_time = Some(reference);
        }
        publisher::publish_tag(&self.mqtt, &self.registry.read_tags[referenced]);
        outcome
    }

    /// Issue a class read with the retry policy: timeouts are retried only
    /// while the slave is still considered online, an illegal data address
    /// is never retried, everything else retries up to the configured limit.
    /// Liveness follows the outcome.
    pub(crate) fn read_registers(
        &mut self,
        slave: u8,
        class: RegisterClass,
        class_offset: u16,
        count: u16,
    ) -> Result<Vec<u16>, ModbusError> {
        let mut retry_count: u32 = 0;
        loop {
            let result = match self.transport.as_deref_mut() {
                Some(transport) => class.read(transport, slave, class_offset, count),
                None => Err(ModbusError::Other("serial port closed".to_string())),
            };
            let err = match result {
                Ok(values) => {
                    self.set_slave_online(slave, true, false);
                    return Ok(values);
                }
                Err(err) => err,
            };
            log::error!("modbus read #{slave} ({class:?} {class_offset}) failed: {err}");
            if retry_count < self.settings.max_retries {
                let retry = match err {
                    ModbusError::Timeout => self.slaves.is_online(slave),
                    ModbusError::IllegalDataAddress => false,
                    ModbusError::Other(_) => true,
                };
                if retry {
                    retry_count += 1;
                    if self.settings.modbus_debug > 0 {
                        log::debug!("read retry #{retry_count} for slave {slave}");
                    }
                    continue;
                }
            }
            if err == ModbusError::Timeout {
                self.set_slave_online(slave, false, false);
            }
            return Err(err);
        }
    }
}

//! Update cycles: named polling periods and the read tags assigned to them.

use std::time::{Duration, Instant};

use crate::config::CycleConfig;

use super::tag::ReadTag;

/// One polling period. `tag_indexes` points into the registry's read-tag
/// array and is built once at startup.
#[derive(Debug, Clone)]
pub struct UpdateCycle {
    pub ident: u32,
    pub interval: Duration,
    pub next_fire: Instant,
    pub tag_indexes: Vec<usize>,
}

/// Assign every read tag to the cycle carrying its cycle id. Cycles keep
/// their declaration order; a tag referencing an unknown cycle is never
/// polled and gets a warning.
pub fn assign_update_cycles(
    cycles: &[CycleConfig],
    read_tags: &[ReadTag],
    now: Instant,
) -> Vec<UpdateCycle> {
    let assigned: Vec<UpdateCycle> = cycles
        .iter()
        .map(|cycle| UpdateCycle {
            ident: cycle.id,
            interval: Duration::from_secs(cycle.interval),
            next_fire: now + Duration::from_secs(cycle.interval),
            tag_indexes: read_tags
                .iter()
                .enumerate()
                .filter(|(_, tag)| tag.update_cycle_id == cycle.id)
                .map(|(index, _)| index)
                .collect(),
        })
        .collect();

    for tag in read_tags {
        if !cycles.iter().any(|cycle| cycle.id == tag.update_cycle_id) {
            log::warn!(
                "tag {} on slave {} references unknown update cycle {}",
                tag.address,
                tag.slave_id,
                tag.update_cycle_id
            );
        }
    }

    assigned
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(slave: u8, address: u16, cycle: u32) -> ReadTag {
        let mut tag = ReadTag::new(slave, address).unwrap();
        tag.update_cycle_id = cycle;
        tag
    }

    #[test]
    fn tags_are_grouped_by_cycle_id_in_declaration_order() {
        let cycles = vec![
            CycleConfig { id: 1, interval: 10 },
            CycleConfig { id: 2, interval: 60 },
        ];
        let tags = vec![
            tag(1, 40000, 1),
            tag(1, 40001, 2),
            tag(2, 40002, 1),
            tag(2, 40003, 9), // unknown cycle, left unpolled
        ];
        let now = Instant::now();
        let assigned = assign_update_cycles(&cycles, &tags, now);

        assert_eq!(assigned.len(), 2);
        assert_eq!(assigned[0].ident, 1);
        assert_eq!(assigned[0].tag_indexes, vec![0, 2]);
        assert_eq!(assigned[0].interval, Duration::from_secs(10));
        assert_eq!(assigned[1].tag_indexes, vec![1]);
        assert!(assigned[0].next_fire > now);
    }
}

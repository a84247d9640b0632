use meshradio_core::{Schedule, WallTime};

use crate::slotted::SlotScheduler;

/// TDMA slot scheduling: the schedule bitmap alone decides who transmits
/// when.
pub struct Tdma;

impl SlotScheduler for Tdma {
    fn find_next_slot(&self, schedule: &Schedule, t: WallTime) -> Option<(WallTime, usize)> {
        let nslots = schedule.nslots();

        if nslots == 0 {
            return None;
        }

        let slot_size = schedule.slot_size();
        let cur_slot = schedule.slot_at(t);
        let slot_pos = schedule.slot_offset_at(t);

        for tx_slot in 1..=nslots {
            let slotidx = (cur_slot + tx_slot) % nslots;

            if schedule.can_transmit_in_slot(slotidx) {
                return Some((t + (tx_slot as f64 * slot_size - slot_pos), slotidx));
            }
        }

        None
    }

    fn can_transmit(&self, schedule: &Schedule) -> bool {
        schedule.can_transmit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_next_slot() {
        // We own slot 2 of 4; slots are 100 ms
        let schedule = Schedule::new(vec![vec![false, false, true, false]], 0.1, 0.01);
        let tdma = Tdma;

        // From inside slot 0, the next ownable slot starts at t = 0.2
        let (t, idx) = tdma.find_next_slot(&schedule, WallTime(0.05)).unwrap();
        assert_eq!(idx, 2);
        assert!((t.secs() - 0.2).abs() < 1e-9);
        assert!(schedule.can_transmit_in_slot(idx));
        assert!(t >= WallTime(0.05));

        // From inside our own slot, the next one is a full frame later
        let (t, idx) = tdma.find_next_slot(&schedule, WallTime(0.25)).unwrap();
        assert_eq!(idx, 2);
        assert!((t.secs() - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_empty_schedule_has_no_slot() {
        let schedule = Schedule::new(vec![vec![false, false]], 0.1, 0.01);
        let tdma = Tdma;

        assert!(tdma.find_next_slot(&schedule, WallTime(0.0)).is_none());
        assert!(!tdma.can_transmit(&schedule));
    }
}

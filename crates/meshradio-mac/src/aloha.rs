use std::sync::atomic::{AtomicUsize, Ordering};

use meshradio_core::{Schedule, WallTime};

use crate::slotted::SlotScheduler;

/// Slotted-ALOHA scheduling: every slot boundary is a transmission
/// opportunity, taken with probability `p`.
pub struct SlottedAloha {
    p: f64,
    slotidx: AtomicUsize,
}

impl SlottedAloha {
    pub fn new(p: f64) -> Self {
        assert!((0.0..=1.0).contains(&p));

        Self {
            p,
            slotidx: AtomicUsize::new(0),
        }
    }

    /// The slot index used for modulation
    pub fn set_slot_index(&self, slotidx: usize) {
        self.slotidx.store(slotidx, Ordering::Relaxed);
    }

    pub fn slot_index(&self) -> usize {
        self.slotidx.load(Ordering::Relaxed)
    }
}

impl SlotScheduler for SlottedAloha {
    fn find_next_slot(&self, schedule: &Schedule, t: WallTime) -> Option<(WallTime, usize)> {
        if schedule.nslots() == 0 {
            return None;
        }

        let slot_size = schedule.slot_size();
        let slot_pos = schedule.slot_offset_at(t);

        Some((t + (slot_size - slot_pos), self.slot_index()))
    }

    fn transmit_in_slot(&self, _t: WallTime, _slotidx: usize) -> bool {
        rand::random::<f64>() < self.p
    }

    fn can_transmit(&self, _schedule: &Schedule) -> bool {
        // ALOHA may always contend for the medium
        true
    }
}

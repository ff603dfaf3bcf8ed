use super::SlotClock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use types::Slot;

/// Determines the present slot from the system clock, anchored at the
/// chain's genesis time.
#[derive(Clone)]
pub struct SystemTimeSlotClock {
    genesis_slot: Slot,
    genesis_duration: Duration,
    slot_duration: Duration,
}

impl SystemTimeSlotClock {
    fn read_clock(&self) -> Option<Duration> {
        SystemTime::now().duration_since(UNIX_EPOCH).ok()
    }
}

impl SlotClock for SystemTimeSlotClock {
    fn new(genesis_slot: Slot, genesis_duration: Duration, slot_duration: Duration) -> Self {
        Self {
            genesis_slot,
            genesis_duration,
            slot_duration,
        }
    }

    fn now(&self) -> Option<Slot> {
        self.slot_of(self.read_clock()?)
    }

    fn now_duration(&self) -> Option<Duration> {
        self.read_clock()
    }

    fn slot_duration(&self) -> Duration {
        self.slot_duration
    }

    fn start_of(&self, slot: Slot) -> Option<Duration> {
        let slot = slot.as_u64().checked_sub(self.genesis_slot.as_u64())?;
        let unadjusted = self.slot_duration.checked_mul(u32::try_from(slot).ok()?)?;
        self.genesis_duration.checked_add(unadjusted)
    }

    fn slot_of(&self, now: Duration) -> Option<Slot> {
        if now < self.genesis_duration {
            return None;
        }
        let since_genesis = now.checked_sub(self.genesis_duration)?;
        let slots_since_genesis = since_genesis.as_millis() / self.slot_duration.as_millis();
        Some(self.genesis_slot + Slot::from(slots_since_genesis as u64))
    }

    fn duration_to_next_slot(&self) -> Option<Duration> {
        let current = self.now()?;
        self.duration_to_slot(current + 1u64)
    }

    fn duration_to_slot(&self, slot: Slot) -> Option<Duration> {
        self.start_of(slot)?.checked_sub(self.read_clock()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pre_genesis_clock_has_no_slot() {
        let far_future = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            + Duration::from_secs(3600);
        let clock = SystemTimeSlotClock::new(Slot::new(0), far_future, Duration::from_secs(12));
        assert_eq!(clock.now(), None);
        assert!(clock.duration_to_slot(Slot::new(0)).is_some());
    }

    #[test]
    fn post_genesis_clock_advances() {
        let past = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            - Duration::from_secs(120);
        let clock = SystemTimeSlotClock::new(Slot::new(0), past, Duration::from_secs(12));
        let slot = clock.now().unwrap();
        assert!(slot >= Slot::new(9) && slot <= Slot::new(10));
    }
}

use super::SlotClock;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use types::Slot;

/// A slot clock where the current time is set manually, for testing.
#[derive(Clone)]
pub struct ManualSlotClock {
    genesis_slot: Slot,
    /// Duration from UNIX epoch to genesis.
    genesis_duration: Duration,
    /// Duration from UNIX epoch to right now.
    current_time: Arc<RwLock<Duration>>,
    /// The length of each slot.
    slot_duration: Duration,
}

impl ManualSlotClock {
    pub fn set_current_time(&self, duration: Duration) {
        *self.current_time.write() = duration;
    }

    /// Sets the clock to the exact start of `slot`.
    pub fn set_slot(&self, slot: Slot) {
        let slots_since_genesis = slot
            .as_u64()
            .checked_sub(self.genesis_slot.as_u64())
            .expect("slot must be post-genesis");
        self.set_current_time(self.genesis_duration + self.slot_duration * slots_since_genesis as u32);
    }

    pub fn advance_slot(&self) {
        let current = *self.current_time.read();
        self.set_current_time(current + self.slot_duration);
    }

    pub fn advance(&self, duration: Duration) {
        let current = *self.current_time.read();
        self.set_current_time(current + duration);
    }
}

impl SlotClock for ManualSlotClock {
    fn new(genesis_slot: Slot, genesis_duration: Duration, slot_duration: Duration) -> Self {
        if slot_duration.as_millis() == 0 {
            panic!("ManualSlotClock cannot have a < 1ms slot duration");
        }

        Self {
            genesis_slot,
            current_time: Arc::new(RwLock::new(genesis_duration)),
            genesis_duration,
            slot_duration,
        }
    }

    fn now(&self) -> Option<Slot> {
        self.slot_of(*self.current_time.read())
    }

    fn now_duration(&self) -> Option<Duration> {
        Some(*self.current_time.read())
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
        let genesis = self.genesis_duration;

        if now >= genesis {
            let since_genesis = now
                .checked_sub(genesis)
                .expect("should be impossible due to previous check");
            let slots_since_genesis = since_genesis.as_millis() / self.slot_duration.as_millis();
            Some(self.genesis_slot + Slot::from(slots_since_genesis as u64))
        } else {
            None
        }
    }

    fn duration_to_next_slot(&self) -> Option<Duration> {
        let current = self.now()?;
        self.duration_to_slot(current + 1u64)
    }

    fn duration_to_slot(&self, slot: Slot) -> Option<Duration> {
        self.start_of(slot)?.checked_sub(*self.current_time.read())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progression() {
        let clock = ManualSlotClock::new(
            Slot::new(0),
            Duration::from_secs(100),
            Duration::from_secs(12),
        );

        clock.set_current_time(Duration::from_secs(99));
        assert_eq!(clock.now(), None, "before genesis there is no slot");

        clock.set_current_time(Duration::from_secs(100));
        assert_eq!(clock.now(), Some(Slot::new(0)));

        clock.set_current_time(Duration::from_secs(111));
        assert_eq!(clock.now(), Some(Slot::new(0)));

        clock.set_current_time(Duration::from_secs(112));
        assert_eq!(clock.now(), Some(Slot::new(1)));

        assert_eq!(clock.duration_to_next_slot(), Some(Duration::from_secs(12)));
        clock.advance(Duration::from_secs(5));
        assert_eq!(clock.duration_to_next_slot(), Some(Duration::from_secs(7)));
    }

    #[test]
    fn set_slot_lands_on_slot_start(){
        let clock = ManualSlotClock::new(
            Slot::new(0),
            Duration::from_secs(0),
            Duration::from_secs(5),
        );
        clock.set_slot(Slot::new(7));
        assert_eq!(clock.now(), Some(Slot::new(7)));
        assert_eq!(clock.seconds_into_slot(), Some(Duration::ZERO));
    }

    #[test]
    fn duration_to_next_epoch() {
        let clock = ManualSlotClock::new(
            Slot::new(0),
            Duration::from_secs(0),
            Duration::from_secs(12),
        );
        clock.set_slot(Slot::new(1));
        assert_eq!(
            clock.duration_to_next_epoch(32),
            Some(Duration::from_secs(31 * 12))
        );
    }
}

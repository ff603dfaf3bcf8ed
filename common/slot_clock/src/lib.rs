//! This crate provides a clock that reports the current slot, given a
//! genesis time and per-slot duration. Durations are relative to the Unix
//! epoch.

mod manual_slot_clock;
mod system_time_slot_clock;

use std::time::Duration;
use types::Slot;

pub use crate::manual_slot_clock::ManualSlotClock;
pub use crate::system_time_slot_clock::SystemTimeSlotClock;

/// A clock that reports the current slot.
///
/// The clock is not required to be monotonically increasing and may go
/// backwards.
pub trait SlotClock: Send + Sync + Sized + Clone {
    /// Creates a new slot clock where the first slot is `genesis_slot`,
    /// genesis occurred `genesis_duration` after the `UNIX_EPOCH` and each
    /// slot is `slot_duration` apart.
    fn new(genesis_slot: Slot, genesis_duration: Duration, slot_duration: Duration) -> Self;

    /// Returns the slot at this present time.
    fn now(&self) -> Option<Slot>;

    /// Returns the present time as a duration since the `UNIX_EPOCH`.
    fn now_duration(&self) -> Option<Duration>;

    /// Returns the duration between slots.
    fn slot_duration(&self) -> Duration;

    /// Returns the duration from `UNIX_EPOCH` to the start of `slot`.
    fn start_of(&self, slot: Slot) -> Option<Duration>;

    /// Returns the first slot to be returned at or after `duration`.
    fn slot_of(&self, duration: Duration) -> Option<Slot>;

    /// Returns the duration until the next slot.
    fn duration_to_next_slot(&self) -> Option<Duration>;

    /// Returns the duration until the start of `slot`, or `None` if it has
    /// already begun.
    fn duration_to_slot(&self, slot: Slot) -> Option<Duration>;

    /// Returns the duration until the first slot of the next epoch.
    fn duration_to_next_epoch(&self, slots_per_epoch: u64) -> Option<Duration> {
        let current = self.now()?;
        let next_epoch_start = (current.epoch(slots_per_epoch) + 1u64).start_slot(slots_per_epoch);
        self.duration_to_slot(next_epoch_start)
    }

    /// The duration from the start of `slot` to `numerator / denominator`
    /// of the way through it, used to compute intra-slot duty deadlines.
    fn start_of_plus_fraction(
        &self,
        slot: Slot,
        numerator: u32,
        denominator: u32,
    ) -> Option<Duration> {
        Some(self.start_of(slot)? + (self.slot_duration() * numerator) / denominator)
    }

    /// How far through the current slot we are, if the clock has started.
    fn seconds_into_slot(&self) -> Option<Duration> {
        let now = self.now_duration()?;
        let start = self.start_of(self.now()?)?;
        now.checked_sub(start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fraction_deadlines() {
        let clock = ManualSlotClock::new(
            Slot::new(0),
            Duration::from_secs(0),
            Duration::from_secs(12),
        );
        // Attestation deadline for slot 100: start + 4s.
        assert_eq!(
            clock.start_of_plus_fraction(Slot::new(100), 1, 3),
            Some(Duration::from_secs(1204))
        );
        // The publication cut-off used by the coordinator: start + 4/12.
        assert_eq!(
            clock.start_of_plus_fraction(Slot::new(100), 4, 12),
            Some(Duration::from_secs(1204))
        );
        assert_eq!(
            clock.start_of_plus_fraction(Slot::new(100), 2, 3),
            Some(Duration::from_secs(1208))
        );
    }
}

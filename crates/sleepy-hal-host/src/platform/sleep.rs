use std::sync::Arc;

use log::info;
use sleepy_core::host::{SleepConfiguration, SleepResult, WAKEUP_REASON_BY_GPIO};

use super::clock::VirtualClock;

/// Sleeps by pushing the virtual clock forward.
#[derive(Debug)]
pub struct SimulatedSleep {
    clock: Arc<VirtualClock>,
    pin_wake: Option<(u16, u64)>,
    sleeps: u32,
}

impl SimulatedSleep {
    pub fn new(clock: Arc<VirtualClock>) -> Self {
        Self {
            clock,
            pin_wake: None,
            sleeps: 0,
        }
    }

    /// Makes the next sleep end early on `pin` after `after_ms`, if the sleep
    /// configuration enables that pin.
    pub fn schedule_pin_wake(&mut self, pin: u16, after_ms: u64) {
        self.pin_wake = Some((pin, after_ms));
    }

    pub fn sleep_count(&self) -> u32 {
        self.sleeps
    }

    pub fn sleep(&mut self, config: &SleepConfiguration) -> SleepResult {
        self.sleeps = self.sleeps.saturating_add(1);
        let pin_wake = self.pin_wake.take().filter(|(pin, after_ms)| {
            *after_ms < config.duration_ms
                && config.gpio_wake.iter().any(|(wake_pin, _)| wake_pin == pin)
        });

        let result = match pin_wake {
            Some((pin, after_ms)) => {
                self.clock.advance(after_ms);
                SleepResult {
                    wake_reason: WAKEUP_REASON_BY_GPIO,
                    wakeup_pin: Some(pin),
                }
            }
            None => {
                self.clock.advance(config.duration_ms);
                SleepResult::by_rtc()
            }
        };
        info!(
            "sleep: {:?} ms={} standby={} woke reason={}",
            config.mode, config.duration_ms, config.network_standby, result.wake_reason
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use sleepy_core::host::{WAKEUP_REASON_BY_RTC, WakeEdge};

    use super::*;

    fn sleeper() -> (Arc<VirtualClock>, SimulatedSleep) {
        let clock = Arc::new(VirtualClock::starting_at(1_718_020_800, true));
        (Arc::clone(&clock), SimulatedSleep::new(clock))
    }

    #[test]
    fn timed_sleep_advances_clock() {
        let (clock, mut sleeper) = sleeper();
        let config = SleepConfiguration {
            duration_ms: 60_000,
            ..Default::default()
        };
        let before = clock.now();
        assert_eq!(sleeper.sleep(&config), SleepResult::by_rtc());
        assert!(clock.now() >= before + 60);
        assert_eq!(sleeper.sleep_count(), 1);
        assert_eq!(SleepResult::by_rtc().wake_reason, WAKEUP_REASON_BY_RTC);
    }

    #[test]
    fn pin_wake_needs_configured_pin() {
        let (_clock, mut sleeper) = sleeper();
        let plain = SleepConfiguration {
            duration_ms: 60_000,
            ..Default::default()
        };
        sleeper.schedule_pin_wake(3, 1_000);
        assert_eq!(sleeper.sleep(&plain).wakeup_pin, None);

        let with_pin = plain.clone().with_gpio(3, WakeEdge::Falling);
        sleeper.schedule_pin_wake(3, 1_000);
        let result = sleeper.sleep(&with_pin);
        assert_eq!(result.wake_reason, WAKEUP_REASON_BY_GPIO);
        assert_eq!(result.wakeup_pin, Some(3));
    }
}

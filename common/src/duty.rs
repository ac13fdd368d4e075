use std::time::Duration;

use crate::config::DeviceConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DutyState {
    IdleDisabled,
    Polling,
    DeepSleeping,
    /// Deep sleep requested while sensing is disabled.
    Misconfigured,
}

impl DutyState {
    pub fn from_config(config: &DeviceConfig) -> Self {
        match (config.enabled, config.deep_sleep) {
            (false, false) => Self::IdleDisabled,
            (false, true) => Self::Misconfigured,
            (true, false) => Self::Polling,
            (true, true) => Self::DeepSleeping,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::IdleDisabled => "IDLE_DISABLED",
            Self::Polling => "POLLING",
            Self::DeepSleeping => "DEEP_SLEEPING",
            Self::Misconfigured => "MISCONFIGURED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DutyAction {
    None,
    Warn,
    Sample,
    Suspend { duration: Duration, wake_pin: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeCause {
    Timer,
    WakePin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WakeEvent {
    pub cause: WakeCause,
    pub elapsed: Duration,
}

/// Whole-process suspend that ends on timer expiry or a wake-pin edge.
pub trait PowerControl {
    fn suspend(&mut self, duration: Duration, wake_pin: u8) -> WakeEvent;
}

#[derive(Debug, Clone)]
pub struct DutyCycleController {
    wake_pin: u8,
    last_read_ms: Option<u64>,
}

impl DutyCycleController {
    pub fn new(wake_pin: u8) -> Self {
        Self {
            wake_pin,
            last_read_ms: None,
        }
    }

    pub fn last_read_ms(&self) -> Option<u64> {
        self.last_read_ms
    }

    pub fn record_read(&mut self, now_ms: u64) {
        self.last_read_ms = Some(now_ms);
    }

    pub fn tick(&self, config: &DeviceConfig, now_ms: u64) -> DutyAction {
        match DutyState::from_config(config) {
            DutyState::IdleDisabled => DutyAction::None,
            DutyState::Misconfigured => DutyAction::Warn,
            DutyState::Polling => {
                let due = self
                    .last_read_ms
                    .map(|last| now_ms.saturating_sub(last) >= u64::from(config.delay_ms))
                    .unwrap_or(true);
                if due {
                    DutyAction::Sample
                } else {
                    DutyAction::None
                }
            }
            DutyState::DeepSleeping => DutyAction::Suspend {
                duration: sleep_duration(config.delay_ms),
                wake_pin: self.wake_pin,
            },
        }
    }
}

/// Suspend length in whole seconds, never shorter than one.
pub fn sleep_duration(delay_ms: u32) -> Duration {
    Duration::from_secs(u64::from((delay_ms / 1_000).max(1)))
}

/// How a level-triggered wake input is armed to behave like a falling edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeArming {
    FallingEdge,
    /// The pin is already low; arming it would wake at once.
    TimerOnly,
}

impl WakeArming {
    pub fn for_level(pin_high: bool) -> Self {
        if pin_high {
            Self::FallingEdge
        } else {
            Self::TimerOnly
        }
    }
}

/// Fixed-rate deadline for the station loop. Remote requests are served while
/// waiting, but never push the deadline back.
#[derive(Debug, Clone)]
pub struct TickTimer {
    interval_ms: u64,
    next_ms: u64,
}

impl TickTimer {
    pub fn new(interval_ms: u64, now_ms: u64) -> Self {
        Self {
            interval_ms,
            next_ms: now_ms.saturating_add(interval_ms),
        }
    }

    pub fn remaining(&self, now_ms: u64) -> Duration {
        Duration::from_millis(self.next_ms.saturating_sub(now_ms))
    }

    /// `true` once the deadline has passed; the next one starts from `now_ms`.
    pub fn poll(&mut self, now_ms: u64) -> bool {
        if now_ms < self.next_ms {
            return false;
        }
        self.next_ms = now_ms.saturating_add(self.interval_ms);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(enabled: bool, deep_sleep: bool) -> DeviceConfig {
        DeviceConfig {
            enabled,
            deep_sleep,
            ..DeviceConfig::default()
        }
    }

    #[test]
    fn state_follows_flags() {
        assert_eq!(
            DutyState::from_config(&config(false, false)),
            DutyState::IdleDisabled
        );
        assert_eq!(
            DutyState::from_config(&config(false, true)),
            DutyState::Misconfigured
        );
        assert_eq!(DutyState::from_config(&config(true, false)), DutyState::Polling);
        assert_eq!(
            DutyState::from_config(&config(true, true)),
            DutyState::DeepSleeping
        );
    }

    #[test]
    fn polling_waits_for_full_delay() {
        let mut duty = DutyCycleController::new(33);
        duty.record_read(1_000);
        let polling = config(true, false);

        assert_eq!(duty.tick(&polling, 1_000), DutyAction::None);
        assert_eq!(duty.tick(&polling, 900_999), DutyAction::None);
        assert_eq!(duty.tick(&polling, 901_000), DutyAction::Sample);
    }

    #[test]
    fn polling_without_baseline_samples() {
        let duty = DutyCycleController::new(33);
        assert_eq!(duty.tick(&config(true, false), 0), DutyAction::Sample);
    }

    #[test]
    fn deep_sleep_suspends_in_whole_seconds() {
        let duty = DutyCycleController::new(8);
        let mut sleeping = config(true, true);
        sleeping.delay_ms = 61_999;

        assert_eq!(
            duty.tick(&sleeping, 0),
            DutyAction::Suspend {
                duration: Duration::from_secs(61),
                wake_pin: 8,
            }
        );
    }

    #[test]
    fn sub_second_delay_sleeps_one_second() {
        assert_eq!(sleep_duration(250), Duration::from_secs(1));
    }

    #[test]
    fn tick_timer_fires_despite_steady_requests() {
        let mut timer = TickTimer::new(1_000, 0);

        // A request handled every 100ms never moves the deadline.
        for now_ms in (100..1_000).step_by(100) {
            assert!(!timer.poll(now_ms));
            assert_eq!(timer.remaining(now_ms), Duration::from_millis(1_000 - now_ms));
        }

        assert_eq!(timer.remaining(1_050), Duration::ZERO);
        assert!(timer.poll(1_050));
        assert!(!timer.poll(1_100));
        assert_eq!(timer.remaining(1_100), Duration::from_millis(950));
        assert!(timer.poll(2_050));
    }

    #[test]
    fn wake_pin_held_low_falls_back_to_timer() {
        assert_eq!(WakeArming::for_level(true), WakeArming::FallingEdge);
        assert_eq!(WakeArming::for_level(false), WakeArming::TimerOnly);
    }

    #[test]
    fn disabled_states_never_sample() {
        let duty = DutyCycleController::new(33);

        assert_eq!(duty.tick(&config(false, false), 5_000_000), DutyAction::None);
        assert_eq!(duty.tick(&config(false, true), 5_000_000), DutyAction::Warn);
    }
}

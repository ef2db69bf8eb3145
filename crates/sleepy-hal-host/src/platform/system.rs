use std::{collections::VecDeque, sync::Arc};

use parking_lot::Mutex;
use sleepy_core::host::SystemEvent;

/// Cloneable sender into the system-event feed.
#[derive(Clone, Debug, Default)]
pub struct SystemEventSender {
    queue: Arc<Mutex<VecDeque<SystemEvent>>>,
}

impl SystemEventSender {
    pub fn send(&self, event: SystemEvent) {
        self.queue.lock().push_back(event);
    }
}

/// Reset reason, a draining battery and the system-event feed.
#[derive(Debug)]
pub struct HostSystem {
    reset_reason: i32,
    battery: Option<f32>,
    drain_per_sleep: f32,
    events: SystemEventSender,
}

impl HostSystem {
    pub fn new(reset_reason: i32) -> Self {
        Self {
            reset_reason,
            battery: None,
            drain_per_sleep: 0.0,
            events: SystemEventSender::default(),
        }
    }

    pub fn with_battery(mut self, soc: f32, drain_per_sleep: f32) -> Self {
        self.battery = Some(soc.clamp(0.0, 100.0));
        self.drain_per_sleep = drain_per_sleep;
        self
    }

    pub fn events(&self) -> SystemEventSender {
        self.events.clone()
    }

    pub fn reset_reason(&self) -> i32 {
        self.reset_reason
    }

    pub fn battery_charge(&self) -> Option<f32> {
        self.battery
    }

    pub fn poll_event(&mut self) -> Option<SystemEvent> {
        self.events.queue.lock().pop_front()
    }

    pub(crate) fn drain_battery(&mut self) {
        if let Some(soc) = self.battery.as_mut() {
            *soc = (*soc - self.drain_per_sleep).max(0.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_arrive_in_order() {
        let mut system = HostSystem::new(0);
        let sender = system.events();
        sender.send(SystemEvent::FirmwareUpdateBegin);
        sender.send(SystemEvent::Reset);
        assert_eq!(system.poll_event(), Some(SystemEvent::FirmwareUpdateBegin));
        assert_eq!(system.poll_event(), Some(SystemEvent::Reset));
        assert_eq!(system.poll_event(), None);
    }

    #[test]
    fn battery_drains_to_zero() {
        let mut system = HostSystem::new(0).with_battery(1.0, 0.75);
        system.drain_battery();
        assert_eq!(system.battery_charge(), Some(0.25));
        system.drain_battery();
        assert_eq!(system.battery_charge(), Some(0.0));
        assert_eq!(HostSystem::new(0).battery_charge(), None);
    }
}

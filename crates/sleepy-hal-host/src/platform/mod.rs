//! Clock, sleep and system feed, bundled with the radio into one [`HostPlatform`].

use std::sync::Arc;

use sleepy_core::host::{
    Clock, PublishCompletion, PublishItem, Radio, SleepConfiguration, SleepControl,
    SleepResult, SystemEvent, SystemEvents,
};

use crate::network::{CellularConfig, SimulatedCellular};

pub mod clock;
pub mod sleep;
pub mod system;

use clock::VirtualClock;
use sleep::SimulatedSleep;
use system::HostSystem;

pub struct HostPlatform {
    clock: Arc<VirtualClock>,
    radio: SimulatedCellular,
    sleeper: SimulatedSleep,
    system: HostSystem,
}

impl HostPlatform {
    pub fn new(clock: Arc<VirtualClock>, cellular: CellularConfig, system: HostSystem) -> Self {
        Self {
            radio: SimulatedCellular::new(cellular, Arc::clone(&clock)),
            sleeper: SimulatedSleep::new(Arc::clone(&clock)),
            clock,
            system,
        }
    }

    pub fn clock(&self) -> &Arc<VirtualClock> {
        &self.clock
    }

    pub fn radio(&self) -> &SimulatedCellular {
        &self.radio
    }

    pub fn sleep_count(&self) -> u32 {
        self.sleeper.sleep_count()
    }

    pub fn sleeper_mut(&mut self) -> &mut SimulatedSleep {
        &mut self.sleeper
    }

    pub fn system(&self) -> &HostSystem {
        &self.system
    }
}

impl Clock for HostPlatform {
    fn now(&self) -> i64 {
        self.clock.now()
    }

    fn is_valid(&self) -> bool {
        self.clock.is_valid()
    }

    fn millis(&self) -> u64 {
        self.clock.millis()
    }
}

impl Radio for HostPlatform {
    fn connect(&mut self) {
        self.radio.connect();
    }

    fn cloud_connected(&self) -> bool {
        self.radio.cloud_connected()
    }

    fn disconnect(&mut self, graceful_timeout_ms: u32) {
        self.radio.disconnect(graceful_timeout_ms);
    }

    fn disconnected(&self) -> bool {
        self.radio.disconnected()
    }

    fn network_disconnect(&mut self) {
        self.radio.network_disconnect();
    }

    fn ready(&self) -> bool {
        self.radio.ready()
    }

    fn off(&mut self) {
        self.radio.off();
    }

    fn is_off(&self) -> bool {
        self.radio.is_off()
    }

    fn publish(&mut self, item: &PublishItem, completion: PublishCompletion) -> bool {
        self.radio.publish(item, completion)
    }
}

impl SleepControl for HostPlatform {
    fn sleep(&mut self, config: &SleepConfiguration) -> SleepResult {
        if !config.network_standby {
            self.radio.off();
        }
        let result = self.sleeper.sleep(config);
        self.system.drain_battery();
        result
    }
}

impl SystemEvents for HostPlatform {
    fn reset_reason(&self) -> i32 {
        self.system.reset_reason()
    }

    fn battery_charge(&self) -> Option<f32> {
        self.system.battery_charge()
    }

    fn poll_system_event(&mut self) -> Option<SystemEvent> {
        self.system.poll_event()
    }
}

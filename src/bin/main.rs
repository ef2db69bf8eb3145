//! Host runner: drives the wake-cycle coordinator against the simulated board.

use std::{sync::Arc, thread, time::Duration};

use log::{info, warn};
use sleepy_core::{CoordinatorConfig, CycleState, SleepCoordinator, host::SystemEvent};
use sleepy_hal_host::{
    HostPlatform,
    network::CellularConfig,
    platform::{clock::VirtualClock, system::HostSystem},
    storage::posix_fs::PosixFileSystem,
};

use runner::RunnerConfig;

#[path = "main/demo.rs"]
mod demo;
#[path = "main/runner.rs"]
mod runner;

const LOOP_INTERVAL_MS: u64 = 10;
const RESET_REASON_POWER_DOWN: i32 = 20;
const BATTERY_START_SOC: f32 = 92.0;
const BATTERY_DRAIN_PER_SLEEP: f32 = 0.4;
const DEFAULT_SETTINGS: &str = r#"{"sleepCapMs":3600000,"tempDecimals":1}"#;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let runner = RunnerConfig::from_env();
    info!(
        "sleepy: state_dir={} tz={:?} cycles={}",
        runner.state_dir.display(),
        runner.time_zone,
        runner.cycles
    );

    let fs = Arc::new(PosixFileSystem::new(&runner.state_dir));
    let clock = Arc::new(VirtualClock::new(false));
    let system = HostSystem::new(RESET_REASON_POWER_DOWN)
        .with_battery(BATTERY_START_SOC, BATTERY_DRAIN_PER_SLEEP);
    let events = system.events();
    let platform = HostPlatform::new(clock, CellularConfig::default(), system);

    let config = CoordinatorConfig::default()
        .with_time_zone(&runner.time_zone)
        .with_default_settings(DEFAULT_SETTINGS);
    let mut coordinator = SleepCoordinator::new(platform, fs, config);
    demo::register(&mut coordinator);
    coordinator.setup();

    let mut completed = 0u32;
    let mut previous = coordinator.state();
    while completed < runner.cycles {
        coordinator.tick();
        let state = coordinator.state();
        if state != previous && state == CycleState::SleepDone {
            completed += 1;
            info!("sleepy: cycle {}/{} done", completed, runner.cycles);
        }
        previous = state;
        thread::sleep(Duration::from_millis(LOOP_INTERVAL_MS));
    }

    // Flush stores the way a reset request would.
    events.send(SystemEvent::Reset);
    coordinator.tick();
    if coordinator.persistent().is_dirty() {
        warn!("sleepy: persistent record not saved");
    }
    info!(
        "sleepy: stopped after {} sleeps, history pending={}",
        coordinator.platform().sleep_count(),
        coordinator.history().has_events()
    );
}

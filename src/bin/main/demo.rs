use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use log::{debug, info, warn};
use sleepy_core::{
    SleepCoordinator,
    schedule::{DayOfWeekMask, Hms, Restriction},
};
use sleepy_hal_host::HostPlatform;

const FULL_WAKE_MINUTES: u8 = 15;
const OFF_HOURS_FULL_WAKE_HOURS: u8 = 2;
const DATA_CAPTURE_MINUTES: u8 = 2;
const MAX_CONNECT_MS: u64 = 90_000;
const MINIMUM_SOC: f32 = 10.0;
const LOW_BATTERY_CONVICTION: i32 = 90;
const SENSOR_WARM_UP_STEPS: u32 = 2;
const SAMPLES_PRIORITY: i32 = 60;
const DEFAULT_TEMP_DECIMALS: u32 = 1;

pub(super) fn register(coordinator: &mut SleepCoordinator<HostPlatform>) {
    register_schedules(coordinator);
    let samples = register_capture(coordinator);
    register_reporting(coordinator, samples);
}

fn register_schedules(coordinator: &mut SleepCoordinator<HostPlatform>) {
    let business_hours = Restriction::weekdays(DayOfWeekMask::WEEKDAYS)
        .with_hours(Hms::new(9, 0, 0), Hms::new(16, 59, 59));
    let weekday_off_hours = Restriction::weekdays(DayOfWeekMask::WEEKDAYS)
        .with_hours(Hms::new(17, 0, 0), Hms::new(8, 59, 59));
    let weekend = Restriction::weekdays(DayOfWeekMask::WEEKEND);

    coordinator
        .schedule_full()
        .with_minute_of_hour(FULL_WAKE_MINUTES, Some(business_hours))
        .with_hour_of_day(OFF_HOURS_FULL_WAKE_HOURS, Some(weekday_off_hours))
        .with_hour_of_day(OFF_HOURS_FULL_WAKE_HOURS, Some(weekend));
    coordinator
        .schedule_data_capture()
        .with_minute_of_hour(DATA_CAPTURE_MINUTES, None);
}

/// Fake temperature sensor: warms up for a few loop passes, then stores one sample.
fn register_capture(coordinator: &mut SleepCoordinator<HostPlatform>) -> Arc<AtomicU32> {
    let samples = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&samples);
    let clock = Arc::clone(coordinator.platform().clock());
    let history = Arc::clone(coordinator.history());
    let settings = Arc::clone(coordinator.settings());

    coordinator.with_data_capture_hook(move |state| {
        state.step += 1;
        if state.step <= SENSOR_WARM_UP_STEPS {
            return true;
        }

        let sample = counter.fetch_add(1, Ordering::Relaxed);
        let temp = 21.5 + 3.0 * (f64::from(sample) / 5.0).sin();
        let decimals = settings
            .get::<u32>("tempDecimals")
            .unwrap_or(DEFAULT_TEMP_DECIMALS);
        let appended = history.append_with(|writer| {
            writer
                .insert("ts", clock.now())
                .insert_rounded("temp", temp, decimals);
        });
        if let Err(err) = appended {
            warn!("demo: sample {} not stored: {:?}", sample, err);
        }
        false
    });
    samples
}

fn register_reporting(coordinator: &mut SleepCoordinator<HostPlatform>, samples: Arc<AtomicU32>) {
    let settings = Arc::clone(coordinator.settings());

    coordinator
        .with_wake_event_hook(move |writer, priority| {
            writer.insert("samples", samples.load(Ordering::Relaxed));
            *priority = SAMPLES_PRIORITY;
            true
        })
        .with_setting_change_hook(|key| {
            info!("demo: setting {} changed", key);
            true
        })
        .with_sleep_configuration_hook(move |_, params| {
            if let Some(cap) = settings
                .get::<i64>("sleepCapMs")
                .and_then(|cap| u64::try_from(cap).ok())
                && params.sleep_time_ms > cap
            {
                params.sleep_time_ms = cap;
            }
            info!(
                "demo: sleep {} ms, next full wake {:?}",
                params.sleep_time_ms, params.next_full_wake_time
            );
            true
        })
        .with_wake_hook(|result| {
            debug!("demo: woke {:?}", result);
            true
        })
        .with_wake_or_boot_hook(|reason| {
            info!("demo: wake or boot reason={:#x}", reason);
            true
        })
        .with_maximum_time_to_connect(MAX_CONNECT_MS)
        .with_should_connect_minimum_soc(MINIMUM_SOC, LOW_BATTERY_CONVICTION);
}

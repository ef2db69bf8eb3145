//! Wake-cycle state machine: decide, connect, publish, compute the next sleep, sleep.
//!
//! [`SleepCoordinator::setup`] runs once after boot, then [`SleepCoordinator::tick`] is
//! called from the main loop. Each tick runs loop hooks, the data-capture sub-loop
//! and exactly one state handler.

use std::{collections::VecDeque, sync::Arc};

use log::{debug, info, trace, warn};

use crate::{
    combiner::{CombinedPayload, DEFAULT_MAX_PAYLOAD, EventCombiner, WakeEventFlags},
    history::{DEFAULT_HISTORY_KEY, DEFAULT_HISTORY_PATH, EventHistory, HistoryError},
    hooks::{
        ConnectVote, DataCaptureHook, HookList, HookState, LoopHook, MaximumTimeToConnectHook,
        NoConnectionHook, SetupHook, ShouldConnectHooks, SleepConfigurationHook,
        SleepOrResetHook, SleepReadyHook, StatefulHookList, WakeHook, WakeOrBootHook,
    },
    host::{
        FileSystem, Platform, PublishCompletion, PublishFlags, PublishItem, SleepConfiguration,
        SleepResult, SystemEvent, WAKEUP_REASON_NO_SLEEP, WAKEUP_REASON_SETUP,
        WAKEUP_REASON_UNKNOWN,
    },
    json::JsonObjectWriter,
    persistent::{DEFAULT_PERSISTENT_PATH, DEFAULT_SAVE_DELAY_MS, PersistentStore},
    schedule::{
        DATA_SCHEDULE, FULL_SCHEDULE, QUICK_SCHEDULE, Schedule, ScheduleError, ScheduleFlags,
        ScheduleManager, TimeZone,
    },
    settings::{DEFAULT_SETTINGS_PATH, SettingsFile},
};

const DEFAULT_SLEEP_MS: u64 = 15 * 60_000;
const MINIMUM_CELLULAR_OFF_MS: u64 = 13 * 60_000;
const MINIMUM_SLEEP_MS: u64 = 10_000;
const SLEEP_FLOOR_MS: u64 = 1_000;
const PUBLISH_RATE_LIMIT_MS: u64 = 1_000;
const GRACEFUL_DISCONNECT_MS: u32 = 5_000;
const BUILTIN_CONVICTION: i32 = 80;
const DEFAULT_WAKE_EVENT_NAME: &str = "wakeEvent";

/// Log-enable bits checked before optional log lines.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LogFlags(u64);

impl LogFlags {
    /// Log each publish.
    pub const PUBLISH: Self = Self(0x0000_0000_0000_0001);
    /// Trace the full payload of each publish.
    pub const PUBLISH_DATA: Self = Self(0x0000_0100_0000_0000);
    /// Trace each record appended to the event history.
    pub const HISTORY_DATA: Self = Self(0x0000_0200_0000_0000);

    pub const NORMAL: Self = Self(0x0000_0000_00ff_ffff);
    pub const VERBOSE: Self = Self(0x0000_00ff_ff00_0000);
    pub const DEBUGGING: Self = Self(0x00ff_ff00_0000_0000);
    pub const ALL: Self = Self(u64::MAX);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// `true` when any bit of `other` is set.
    pub const fn enabled(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

impl Default for LogFlags {
    fn default() -> Self {
        Self::NORMAL
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CoordinatorConfig {
    pub default_sleep_ms: u64,
    /// Shorter sleeps before a full wake keep the modem in standby.
    pub minimum_cellular_off_ms: u64,
    /// Shorter sleeps are waited out awake.
    pub minimum_sleep_ms: u64,
    pub sleep_floor_ms: u64,
    pub publish_rate_limit_ms: u64,
    pub graceful_disconnect_ms: u32,
    pub max_payload: usize,
    /// Empty disables wake-event publishing.
    pub wake_event_name: String,
    pub publish_flags: PublishFlags,
    pub settings_path: String,
    pub default_settings: Option<String>,
    pub persistent_path: String,
    pub persistent_save_delay_ms: u64,
    pub history_path: String,
    pub history_key: String,
    /// POSIX TZ rule string, empty for UTC.
    pub time_zone: String,
    pub events_enabled: WakeEventFlags,
    pub log_flags: LogFlags,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            default_sleep_ms: DEFAULT_SLEEP_MS,
            minimum_cellular_off_ms: MINIMUM_CELLULAR_OFF_MS,
            minimum_sleep_ms: MINIMUM_SLEEP_MS,
            sleep_floor_ms: SLEEP_FLOOR_MS,
            publish_rate_limit_ms: PUBLISH_RATE_LIMIT_MS,
            graceful_disconnect_ms: GRACEFUL_DISCONNECT_MS,
            max_payload: DEFAULT_MAX_PAYLOAD,
            wake_event_name: DEFAULT_WAKE_EVENT_NAME.to_owned(),
            publish_flags: PublishFlags::default(),
            settings_path: DEFAULT_SETTINGS_PATH.to_owned(),
            default_settings: None,
            persistent_path: DEFAULT_PERSISTENT_PATH.to_owned(),
            persistent_save_delay_ms: DEFAULT_SAVE_DELAY_MS,
            history_path: DEFAULT_HISTORY_PATH.to_owned(),
            history_key: DEFAULT_HISTORY_KEY.to_owned(),
            time_zone: String::new(),
            events_enabled: WakeEventFlags::default(),
            log_flags: LogFlags::default(),
        }
    }
}

impl CoordinatorConfig {
    pub fn with_default_sleep_ms(mut self, ms: u64) -> Self {
        self.default_sleep_ms = ms;
        self
    }

    pub fn with_minimum_cellular_off_ms(mut self, ms: u64) -> Self {
        self.minimum_cellular_off_ms = ms;
        self
    }

    pub fn with_minimum_sleep_ms(mut self, ms: u64) -> Self {
        self.minimum_sleep_ms = ms;
        self
    }

    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    pub fn with_wake_event_name(mut self, name: &str) -> Self {
        self.wake_event_name = name.to_owned();
        self
    }

    pub fn with_default_settings(mut self, json: &str) -> Self {
        self.default_settings = Some(json.to_owned());
        self
    }

    pub fn with_event_history(mut self, path: &str, key: &str) -> Self {
        self.history_path = path.to_owned();
        self.history_key = key.to_owned();
        self
    }

    pub fn with_time_zone(mut self, posix: &str) -> Self {
        self.time_zone = posix.to_owned();
        self
    }

    pub fn with_events_enabled(mut self, events_enabled: WakeEventFlags) -> Self {
        self.events_enabled = events_enabled;
        self
    }

    pub fn with_log_flags(mut self, log_flags: LogFlags) -> Self {
        self.log_flags = log_flags;
        self
    }

    pub fn with_persistent_save_delay_ms(mut self, ms: u64) -> Self {
        self.persistent_save_delay_ms = ms;
        self
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum CycleState {
    Start,
    ConnectWait,
    TimeValidWait,
    ConnectedStart,
    ConnectedWakeEvents,
    Connected,
    PublishWait,
    PublishRateLimit,
    ReconnectWait,
    NoConnection,
    DisconnectBeforeSleep,
    DisconnectWait,
    WaitRadioDisconnected,
    WaitRadioOff,
    Sleep,
    SleepShort,
    SleepDone,
}

/// Inputs and results of the sleep computation. Sleep-configuration hooks may edit
/// `sleep_time_ms` and `disconnect_cellular`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SleepParameters {
    pub is_connected: bool,
    pub sleep_time_ms: u64,
    pub time_until_next_full_wake_ms: u64,
    pub next_full_wake_time: Option<i64>,
    /// `millis()` when the parameters were computed.
    pub calculated_millis: u64,
    pub disconnect_cellular: bool,
}

/// Drives one device through sleep, wake, capture, connect and publish.
pub struct SleepCoordinator<P: Platform> {
    platform: P,
    config: CoordinatorConfig,
    settings: Arc<SettingsFile>,
    persistent: Arc<PersistentStore>,
    history: Arc<EventHistory>,
    schedules: ScheduleManager,
    combiner: EventCombiner,

    setup_hooks: HookList<SetupHook>,
    loop_hooks: HookList<LoopHook>,
    data_capture_hooks: StatefulHookList<DataCaptureHook>,
    sleep_ready_hooks: StatefulHookList<SleepReadyHook>,
    no_connection_hooks: StatefulHookList<NoConnectionHook>,
    should_connect_hooks: ShouldConnectHooks,
    wake_or_boot_hooks: HookList<WakeOrBootHook>,
    sleep_or_reset_hooks: HookList<SleepOrResetHook>,
    maximum_time_to_connect_hooks: HookList<MaximumTimeToConnectHook>,
    sleep_configuration_hooks: HookList<SleepConfigurationHook>,
    wake_hooks: HookList<WakeHook>,
    minimum_soc: Option<(f32, i32)>,

    state: CycleState,
    sleep_config: SleepConfiguration,
    sleep_params: SleepParameters,
    wake_reason: i32,
    wake_event_payloads: Vec<CombinedPayload>,
    publish_queue: VecDeque<PublishItem>,
    publish_completion: Option<PublishCompletion>,
    state_time_ms: u64,
    connect_attempt_start_ms: u64,
    network_connected_ms: Option<u64>,
    connected_start_ms: u64,
    reconnect_attempt_start_ms: u64,
    data_capture_active: bool,
    firmware_update_in_progress: bool,
    firmware_update_pending: bool,
    out_of_memory: bool,
}

impl<P: Platform> SleepCoordinator<P> {
    pub fn new(platform: P, fs: Arc<dyn FileSystem>, config: CoordinatorConfig) -> Self {
        let mut settings = SettingsFile::new(Arc::clone(&fs))
            .with_path(&config.settings_path)
            .with_max_size(config.max_payload);
        if let Some(defaults) = config.default_settings.as_deref() {
            settings = settings.with_default_values(defaults);
        }
        let persistent = PersistentStore::new(Arc::clone(&fs)).with_path(&config.persistent_path);
        persistent.set_save_delay_ms(config.persistent_save_delay_ms);
        let history = Arc::new(EventHistory::new(fs).with_path(&config.history_path));

        let mut combiner = EventCombiner::new()
            .with_max_payload(config.max_payload)
            .with_history(Arc::clone(&history), &config.history_key);
        combiner.set_events_enabled(config.events_enabled);

        let mut schedules = ScheduleManager::new();
        match TimeZone::parse(&config.time_zone) {
            Ok(tz) => schedules.set_time_zone(tz),
            Err(err) => warn!("cycle: time zone {:?} rejected: {:?}", config.time_zone, err),
        }
        schedules
            .schedule_mut(QUICK_SCHEDULE)
            .set_flags(ScheduleFlags::QUICK_WAKE);
        schedules
            .schedule_mut(DATA_SCHEDULE)
            .set_flags(ScheduleFlags::QUICK_WAKE);
        schedules
            .schedule_mut(FULL_SCHEDULE)
            .set_flags(ScheduleFlags::FULL_WAKE);

        Self {
            platform,
            config,
            settings: Arc::new(settings),
            persistent: Arc::new(persistent),
            history,
            schedules,
            combiner,
            setup_hooks: HookList::new(),
            loop_hooks: HookList::new(),
            data_capture_hooks: StatefulHookList::new(),
            sleep_ready_hooks: StatefulHookList::new(),
            no_connection_hooks: StatefulHookList::new(),
            should_connect_hooks: ShouldConnectHooks::new(),
            wake_or_boot_hooks: HookList::new(),
            sleep_or_reset_hooks: HookList::new(),
            maximum_time_to_connect_hooks: HookList::new(),
            sleep_configuration_hooks: HookList::new(),
            wake_hooks: HookList::new(),
            minimum_soc: None,
            state: CycleState::Start,
            sleep_config: SleepConfiguration::default(),
            sleep_params: SleepParameters::default(),
            wake_reason: WAKEUP_REASON_UNKNOWN,
            wake_event_payloads: Vec::new(),
            publish_queue: VecDeque::new(),
            publish_completion: None,
            state_time_ms: 0,
            connect_attempt_start_ms: 0,
            network_connected_ms: None,
            connected_start_ms: 0,
            reconnect_attempt_start_ms: 0,
            data_capture_active: false,
            firmware_update_in_progress: false,
            firmware_update_pending: false,
            out_of_memory: false,
        }
    }

    /// Loads the stores and runs setup and wake-or-boot hooks. Call once before
    /// [`SleepCoordinator::tick`].
    pub fn setup(&mut self) {
        let reset_reason = self.platform.reset_reason();
        info!("cycle: setup reset_reason={}", reset_reason);

        self.settings.load();
        if !self.persistent.load() {
            debug!("cycle: persistent record started fresh");
        }

        self.setup_hooks.for_each(|hook| hook());
        self.wake_or_boot_hooks
            .for_each(|hook| hook(WAKEUP_REASON_SETUP));
        self.combiner
            .add_flag_fragment(WakeEventFlags::RESET_REASON, reset_reason);
        self.set_state(CycleState::Start);
    }

    /// One pass of the main loop.
    pub fn tick(&mut self) {
        self.poll_system_events();
        self.loop_hooks.for_each(|hook| hook());
        self.persistent.flush(false, self.platform.millis());
        self.data_capture_handler();

        match self.state {
            CycleState::Start => self.state_start(),
            CycleState::ConnectWait => self.state_connect_wait(),
            CycleState::TimeValidWait => self.state_time_valid_wait(),
            CycleState::ConnectedStart => self.state_connected_start(),
            CycleState::ConnectedWakeEvents => self.state_connected_wake_events(),
            CycleState::Connected => self.state_connected(),
            CycleState::PublishWait => self.state_publish_wait(),
            CycleState::PublishRateLimit => self.state_publish_rate_limit(),
            CycleState::ReconnectWait => self.state_reconnect_wait(),
            CycleState::NoConnection => self.state_no_connection(),
            CycleState::DisconnectBeforeSleep => self.state_disconnect_before_sleep(),
            CycleState::DisconnectWait => self.state_disconnect_wait(),
            CycleState::WaitRadioDisconnected => self.state_wait_radio_disconnected(),
            CycleState::WaitRadioOff => self.state_wait_radio_off(),
            CycleState::Sleep => self.state_sleep(),
            CycleState::SleepShort => self.state_sleep_short(),
            CycleState::SleepDone => self.state_sleep_done(),
        }
    }

    fn set_state(&mut self, next: CycleState) {
        if self.state != next {
            debug!("cycle: {:?} -> {:?}", self.state, next);
        }
        self.state = next;
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    pub fn settings(&self) -> &Arc<SettingsFile> {
        &self.settings
    }

    pub fn persistent(&self) -> &Arc<PersistentStore> {
        &self.persistent
    }

    pub fn history(&self) -> &Arc<EventHistory> {
        &self.history
    }

    pub fn combiner_mut(&mut self) -> &mut EventCombiner {
        &mut self.combiner
    }

    pub fn schedules(&self) -> &ScheduleManager {
        &self.schedules
    }

    pub fn schedules_mut(&mut self) -> &mut ScheduleManager {
        &mut self.schedules
    }

    pub fn schedule_quick(&mut self) -> &mut Schedule {
        self.schedules.schedule_mut(QUICK_SCHEDULE)
    }

    pub fn schedule_full(&mut self) -> &mut Schedule {
        self.schedules.schedule_mut(FULL_SCHEDULE)
    }

    pub fn schedule_data_capture(&mut self) -> &mut Schedule {
        self.schedules.schedule_mut(DATA_SCHEDULE)
    }

    pub fn sleep_parameters(&self) -> &SleepParameters {
        &self.sleep_params
    }

    pub fn sleep_configuration(&self) -> &SleepConfiguration {
        &self.sleep_config
    }

    /// Overrides the full-wake instant remembered from the last sleep computation.
    pub fn set_next_full_wake_time(&mut self, time: Option<i64>) {
        self.sleep_params.next_full_wake_time = time;
    }

    pub fn publish_queue_len(&self) -> usize {
        self.publish_queue.len()
    }

    pub fn is_data_capture_active(&self) -> bool {
        self.data_capture_active
    }

    pub fn firmware_update_in_progress(&self) -> bool {
        self.firmware_update_in_progress
    }

    pub fn firmware_update_pending(&self) -> bool {
        self.firmware_update_pending
    }

    /// Set once the system reported an out-of-memory condition. Acting on it, for
    /// example by resetting, is up to the application.
    pub fn out_of_memory(&self) -> bool {
        self.out_of_memory
    }

    pub fn log_enabled(&self, flag: LogFlags) -> bool {
        self.config.log_flags.enabled(flag)
    }

    pub fn set_log_flags(&mut self, log_flags: LogFlags) {
        self.config.log_flags = log_flags;
    }

    fn poll_system_events(&mut self) {
        while let Some(event) = self.platform.poll_system_event() {
            match event {
                SystemEvent::FirmwareUpdateBegin => {
                    info!("cycle: firmware update started");
                    self.firmware_update_in_progress = true;
                }
                SystemEvent::FirmwareUpdateProgress => {
                    trace!("cycle: firmware update progress");
                }
                SystemEvent::FirmwareUpdateComplete | SystemEvent::FirmwareUpdateFailed => {
                    info!("cycle: firmware update ended {:?}", event);
                    self.firmware_update_in_progress = false;
                }
                SystemEvent::FirmwareUpdatePending => {
                    self.firmware_update_pending = true;
                }
                SystemEvent::Reset => {
                    info!("cycle: reset requested");
                    self.run_sleep_or_reset(true);
                }
                SystemEvent::OutOfMemory => {
                    warn!("cycle: out of memory reported");
                    self.out_of_memory = true;
                }
            }
        }
    }

    fn run_sleep_or_reset(&mut self, reset: bool) {
        self.sleep_or_reset_hooks.for_each(|hook| hook(reset));
        self.persistent.flush(true, self.platform.millis());
    }
}

include!("registration.rs");
include!("states.rs");
include!("sleep.rs");

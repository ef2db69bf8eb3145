//! Capabilities the coordinator needs from the device it runs on.
//!
//! A board crate implements these on top of the real RTC, modem, sleep controller and
//! flash file system. [`mock`] provides scripted stand-ins for tests and bring-up.

use std::{
    io::ErrorKind,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
};

use heapless::{String as HeaplessString, Vec as HeaplessVec};

pub mod mock;

/// Wake reason reported to wake-or-boot hooks when `setup()` runs.
pub const WAKEUP_REASON_SETUP: i32 = 0x10001;
/// Wake reason used when the computed sleep was too short to enter low power.
pub const WAKEUP_REASON_NO_SLEEP: i32 = 0x10002;

pub const WAKEUP_REASON_UNKNOWN: i32 = 0;
pub const WAKEUP_REASON_BY_GPIO: i32 = 1;
pub const WAKEUP_REASON_BY_RTC: i32 = 4;
pub const WAKEUP_REASON_BY_NETWORK: i32 = 9;

pub const EVENT_NAME_BYTES: usize = 64;
pub const MAX_WAKE_PINS: usize = 4;

/// Wall clock and monotonic millisecond counter.
pub trait Clock {
    /// Seconds since the Unix epoch. Only meaningful when [`Clock::is_valid`].
    fn now(&self) -> i64;
    fn is_valid(&self) -> bool;
    /// Monotonic milliseconds, including time spent asleep.
    fn millis(&self) -> u64;
}

/// Cellular modem plus cloud session.
pub trait Radio {
    fn connect(&mut self);
    fn cloud_connected(&self) -> bool;
    /// Starts a graceful cloud disconnect that waits up to `graceful_timeout_ms` for
    /// outstanding acknowledgements.
    fn disconnect(&mut self, graceful_timeout_ms: u32);
    fn disconnected(&self) -> bool;
    /// Drops the cellular data session.
    fn network_disconnect(&mut self);
    fn ready(&self) -> bool;
    fn off(&mut self);
    fn is_off(&self) -> bool;
    /// Queues a publish. Returns `false` when the radio refused it outright; otherwise
    /// `completion` is completed once, possibly from another thread.
    fn publish(&mut self, item: &PublishItem, completion: PublishCompletion) -> bool;
}

pub trait SleepControl {
    fn sleep(&mut self, config: &SleepConfiguration) -> SleepResult;
}

/// Reset reason, battery gauge and the system-event feed.
pub trait SystemEvents {
    fn reset_reason(&self) -> i32;
    /// State of charge in percent, `None` when no gauge is fitted.
    fn battery_charge(&self) -> Option<f32>;
    fn poll_system_event(&mut self) -> Option<SystemEvent>;
}

/// Everything the cycle state machine drives.
pub trait Platform: Clock + Radio + SleepControl + SystemEvents {}

impl<T> Platform for T where T: Clock + Radio + SleepControl + SystemEvents {}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SystemEvent {
    FirmwareUpdateBegin,
    FirmwareUpdateProgress,
    FirmwareUpdateComplete,
    FirmwareUpdateFailed,
    FirmwareUpdatePending,
    Reset,
    OutOfMemory,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FsError {
    NotFound,
    Io(ErrorKind),
}

impl From<std::io::Error> for FsError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            ErrorKind::NotFound => Self::NotFound,
            kind => Self::Io(kind),
        }
    }
}

/// Path-addressed file operations with POSIX semantics.
pub trait FileSystem: Send + Sync {
    /// Reads from `offset` into `buf`, returning the number of bytes read (0 at EOF).
    fn read_at(&self, path: &str, offset: u64, buf: &mut [u8]) -> Result<usize, FsError>;
    /// Creates or truncates `path` and writes `data`.
    fn write(&self, path: &str, data: &[u8]) -> Result<(), FsError>;
    fn append(&self, path: &str, data: &[u8]) -> Result<(), FsError>;
    fn size(&self, path: &str) -> Result<u64, FsError>;
    fn remove(&self, path: &str) -> Result<(), FsError>;
    fn rename(&self, from: &str, to: &str) -> Result<(), FsError>;

    /// Reads at most `limit` bytes from the start of `path`.
    fn read_prefix(&self, path: &str, limit: usize) -> Result<Vec<u8>, FsError> {
        let mut out = vec![0u8; limit];
        let mut filled = 0usize;
        while filled < limit {
            let read = self.read_at(path, filled as u64, &mut out[filled..])?;
            if read == 0 {
                break;
            }
            filled += read;
        }
        out.truncate(filled);
        Ok(out)
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum SleepMode {
    #[default]
    UltraLowPower,
    Stop,
    Hibernate,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WakeEdge {
    Rising,
    Falling,
    Change,
}

/// What the sleep primitive is asked to do. Sleep-configuration hooks may edit it.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SleepConfiguration {
    pub mode: SleepMode,
    pub duration_ms: u64,
    /// Keep the cellular modem registered through the sleep.
    pub network_standby: bool,
    pub gpio_wake: HeaplessVec<(u16, WakeEdge), MAX_WAKE_PINS>,
}

impl SleepConfiguration {
    pub fn with_gpio(mut self, pin: u16, edge: WakeEdge) -> Self {
        if self.gpio_wake.push((pin, edge)).is_err() {
            log::warn!("sleep: wake pin {} dropped, table full", pin);
        }
        self
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SleepResult {
    pub wake_reason: i32,
    pub wakeup_pin: Option<u16>,
}

impl SleepResult {
    pub const fn by_rtc() -> Self {
        Self {
            wake_reason: WAKEUP_REASON_BY_RTC,
            wakeup_pin: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PublishFlags(u8);

impl PublishFlags {
    pub const PRIVATE: Self = Self(0x01);
    pub const NO_ACK: Self = Self(0x02);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl Default for PublishFlags {
    fn default() -> Self {
        Self::PRIVATE
    }
}

/// One entry of the publish queue.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PublishItem {
    pub name: HeaplessString<EVENT_NAME_BYTES>,
    pub data: String,
    pub flags: PublishFlags,
    /// Event-history cursor acknowledged once this item is published.
    pub(crate) history_end: Option<u64>,
}

impl PublishItem {
    pub fn new(name: &str, data: String, flags: PublishFlags) -> Self {
        let mut event_name = HeaplessString::new();
        for ch in name.chars() {
            if event_name.push(ch).is_err() {
                break;
            }
        }
        Self {
            name: event_name,
            data,
            flags,
            history_end: None,
        }
    }
}

const PUBLISH_PENDING: u8 = 0;
const PUBLISH_OK: u8 = 1;
const PUBLISH_FAILED: u8 = 2;

/// Completion slot for one publish, shared with whoever finishes it.
#[derive(Clone, Debug, Default)]
pub struct PublishCompletion {
    state: Arc<AtomicU8>,
}

impl PublishCompletion {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the outcome. Only the first call has an effect.
    pub fn complete(&self, ok: bool) {
        let next = if ok { PUBLISH_OK } else { PUBLISH_FAILED };
        let _ = self.state.compare_exchange(
            PUBLISH_PENDING,
            next,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub fn poll(&self) -> Option<bool> {
        match self.state.load(Ordering::Acquire) {
            PUBLISH_OK => Some(true),
            PUBLISH_FAILED => Some(false),
            _ => None,
        }
    }
}

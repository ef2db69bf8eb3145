//! No-hardware host used by tests and during bring-up.

use std::{
    collections::{BTreeMap, VecDeque},
    io::ErrorKind,
    sync::atomic::{AtomicBool, Ordering},
};

use parking_lot::Mutex;

use super::{
    Clock, FileSystem, FsError, PublishCompletion, PublishItem, Radio, SleepConfiguration,
    SleepControl, SleepResult, SystemEvent, SystemEvents,
};

/// Flat in-memory file system keyed by path.
#[derive(Debug, Default)]
pub struct MemoryFileSystem {
    files: Mutex<BTreeMap<String, Vec<u8>>>,
    fail_writes: AtomicBool,
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every mutating operation fail with an I/O error until cleared.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Release);
    }

    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().get(path).cloned()
    }

    pub fn exists(&self, path: &str) -> bool {
        self.files.lock().contains_key(path)
    }

    pub fn insert(&self, path: &str, data: &[u8]) {
        self.files.lock().insert(path.to_owned(), data.to_vec());
    }

    fn check_writable(&self) -> Result<(), FsError> {
        if self.fail_writes.load(Ordering::Acquire) {
            Err(FsError::Io(ErrorKind::Other))
        } else {
            Ok(())
        }
    }
}

impl FileSystem for MemoryFileSystem {
    fn read_at(&self, path: &str, offset: u64, buf: &mut [u8]) -> Result<usize, FsError> {
        let files = self.files.lock();
        let data = files.get(path).ok_or(FsError::NotFound)?;
        let start = (offset as usize).min(data.len());
        let len = buf.len().min(data.len() - start);
        buf[..len].copy_from_slice(&data[start..start + len]);
        Ok(len)
    }

    fn write(&self, path: &str, data: &[u8]) -> Result<(), FsError> {
        self.check_writable()?;
        self.files.lock().insert(path.to_owned(), data.to_vec());
        Ok(())
    }

    fn append(&self, path: &str, data: &[u8]) -> Result<(), FsError> {
        self.check_writable()?;
        self.files
            .lock()
            .entry(path.to_owned())
            .or_default()
            .extend_from_slice(data);
        Ok(())
    }

    fn size(&self, path: &str) -> Result<u64, FsError> {
        self.files
            .lock()
            .get(path)
            .map(|data| data.len() as u64)
            .ok_or(FsError::NotFound)
    }

    fn remove(&self, path: &str) -> Result<(), FsError> {
        self.check_writable()?;
        self.files
            .lock()
            .remove(path)
            .map(|_| ())
            .ok_or(FsError::NotFound)
    }

    fn rename(&self, from: &str, to: &str) -> Result<(), FsError> {
        self.check_writable()?;
        let mut files = self.files.lock();
        let data = files.remove(from).ok_or(FsError::NotFound)?;
        files.insert(to.to_owned(), data);
        Ok(())
    }
}

/// How the mock radio answers publishes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PublishBehavior {
    Succeed,
    Fail,
    /// `publish` returns `false`.
    Refuse,
    /// Completion is held until [`MockPlatform::complete_held_publish`].
    Hold,
}

/// Scripted clock, radio, sleep and system feed in one value.
#[derive(Debug)]
pub struct MockPlatform {
    pub epoch_at_boot: i64,
    pub millis: u64,
    pub time_valid: bool,
    /// Cloud session comes up this long after `connect`; `None` never connects.
    pub connect_delay_ms: Option<u64>,
    pub publish_behavior: PublishBehavior,
    pub reset_reason: i32,
    pub battery: Option<f32>,
    pub published: Vec<PublishItem>,
    pub sleeps: Vec<SleepConfiguration>,
    pub connect_calls: u32,
    pub disconnect_calls: u32,
    held: Option<PublishCompletion>,
    events: VecDeque<SystemEvent>,
    powered: bool,
    network_up: bool,
    session_requested_at: Option<u64>,
}

impl MockPlatform {
    pub fn new(epoch_at_boot: i64) -> Self {
        Self {
            epoch_at_boot,
            millis: 0,
            time_valid: true,
            connect_delay_ms: Some(2_000),
            publish_behavior: PublishBehavior::Succeed,
            reset_reason: 0,
            battery: None,
            published: Vec::new(),
            sleeps: Vec::new(),
            connect_calls: 0,
            disconnect_calls: 0,
            held: None,
            events: VecDeque::new(),
            powered: false,
            network_up: false,
            session_requested_at: None,
        }
    }

    pub fn advance_ms(&mut self, ms: u64) {
        self.millis = self.millis.saturating_add(ms);
    }

    pub fn push_event(&mut self, event: SystemEvent) {
        self.events.push_back(event);
    }

    /// Simulates the cloud session dropping while the modem stays registered.
    pub fn drop_cloud(&mut self) {
        self.session_requested_at = None;
    }

    pub fn complete_held_publish(&mut self, ok: bool) -> bool {
        match self.held.take() {
            Some(completion) => {
                completion.complete(ok);
                true
            }
            None => false,
        }
    }
}

impl Clock for MockPlatform {
    fn now(&self) -> i64 {
        self.epoch_at_boot + (self.millis / 1_000) as i64
    }

    fn is_valid(&self) -> bool {
        self.time_valid
    }

    fn millis(&self) -> u64 {
        self.millis
    }
}

impl Radio for MockPlatform {
    fn connect(&mut self) {
        self.connect_calls = self.connect_calls.saturating_add(1);
        self.powered = true;
        self.network_up = true;
        self.session_requested_at = Some(self.millis);
    }

    fn cloud_connected(&self) -> bool {
        match (self.session_requested_at, self.connect_delay_ms) {
            (Some(requested_at), Some(delay)) => {
                self.millis >= requested_at.saturating_add(delay)
            }
            _ => false,
        }
    }

    fn disconnect(&mut self, _graceful_timeout_ms: u32) {
        self.disconnect_calls = self.disconnect_calls.saturating_add(1);
        self.session_requested_at = None;
    }

    fn disconnected(&self) -> bool {
        !self.cloud_connected()
    }

    fn network_disconnect(&mut self) {
        self.network_up = false;
        self.session_requested_at = None;
    }

    fn ready(&self) -> bool {
        self.network_up
    }

    fn off(&mut self) {
        self.powered = false;
        self.network_up = false;
        self.session_requested_at = None;
    }

    fn is_off(&self) -> bool {
        !self.powered
    }

    fn publish(&mut self, item: &PublishItem, completion: PublishCompletion) -> bool {
        match self.publish_behavior {
            PublishBehavior::Refuse => return false,
            PublishBehavior::Succeed => completion.complete(true),
            PublishBehavior::Fail => completion.complete(false),
            PublishBehavior::Hold => self.held = Some(completion),
        }
        self.published.push(item.clone());
        true
    }
}

impl SleepControl for MockPlatform {
    fn sleep(&mut self, config: &SleepConfiguration) -> SleepResult {
        self.sleeps.push(config.clone());
        if !config.network_standby {
            self.off();
        }
        self.advance_ms(config.duration_ms);
        SleepResult::by_rtc()
    }
}

impl SystemEvents for MockPlatform {
    fn reset_reason(&self) -> i32 {
        self.reset_reason
    }

    fn battery_charge(&self) -> Option<f32> {
        self.battery
    }

    fn poll_system_event(&mut self) -> Option<SystemEvent> {
        self.events.pop_front()
    }
}

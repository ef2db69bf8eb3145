//! Small binary record of wake timestamps kept in a file across resets.
//!
//! Layout (little endian): a 16-byte header `{magic: u32, version: u16, size: u16,
//! reserved: u32, reserved: u32}` followed by four `u32` second counters. Writes are
//! debounced; [`PersistentStore::flush`] is driven from the main loop.

use std::sync::Arc;

use log::{debug, info, warn};

use crate::{
    host::{FileSystem, FsError},
    sync::{StoreGuard, StoreLock},
};

pub const DEFAULT_PERSISTENT_PATH: &str = "/usr/sleepData.dat";
pub const DEFAULT_SAVE_DELAY_MS: u64 = 1_000;

const PERSISTENT_MAGIC: u32 = 0xd87c_b6ce;
const PERSISTENT_VERSION: u16 = 1;
const HEADER_LEN: usize = 16;
const MIN_VALID_LEN: usize = 12;
pub const RECORD_LEN: usize = 32;

pub const OFFSET_LAST_UPDATE_CHECK: usize = HEADER_LEN;
pub const OFFSET_LAST_FULL_WAKE: usize = HEADER_LEN + 4;
pub const OFFSET_LAST_QUICK_WAKE: usize = HEADER_LEN + 8;
pub const OFFSET_NEXT_DATA_CAPTURE: usize = HEADER_LEN + 12;

/// Decoded copy of the record body.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PersistentRecord {
    pub last_update_check: u32,
    pub last_full_wake: u32,
    pub last_quick_wake: u32,
    pub next_data_capture: u32,
}

struct PersistentState {
    bytes: [u8; RECORD_LEN],
    dirty: bool,
    dirty_since_ms: Option<u64>,
    save_delay_ms: u64,
}

impl PersistentState {
    fn new() -> Self {
        let mut state = Self {
            bytes: [0; RECORD_LEN],
            dirty: false,
            dirty_since_ms: None,
            save_delay_ms: DEFAULT_SAVE_DELAY_MS,
        };
        state.initialize();
        state
    }

    fn initialize(&mut self) {
        self.bytes = [0; RECORD_LEN];
        self.bytes[0..4].copy_from_slice(&PERSISTENT_MAGIC.to_le_bytes());
        self.bytes[4..6].copy_from_slice(&PERSISTENT_VERSION.to_le_bytes());
        self.bytes[6..8].copy_from_slice(&(RECORD_LEN as u16).to_le_bytes());
    }

    /// Checks a record of which `data_len` bytes were read, zero-padding the rest.
    fn validate(&mut self, data_len: usize) -> bool {
        if data_len < MIN_VALID_LEN {
            return false;
        }

        let bytes = &self.bytes;
        let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        let size = u16::from_le_bytes([bytes[6], bytes[7]]) as usize;
        if magic != PERSISTENT_MAGIC || version != PERSISTENT_VERSION {
            return false;
        }
        if size < MIN_VALID_LEN || size > data_len {
            return false;
        }

        let keep = size.min(RECORD_LEN);
        self.bytes[keep..].fill(0);
        self.bytes[6..8].copy_from_slice(&(RECORD_LEN as u16).to_le_bytes());
        true
    }

    fn read_u32(&self, offset: usize) -> Option<u32> {
        let end = offset.checked_add(4)?;
        if offset < HEADER_LEN || end > RECORD_LEN {
            return None;
        }
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.bytes[offset..end]);
        Some(u32::from_le_bytes(raw))
    }

    fn record(&self) -> PersistentRecord {
        PersistentRecord {
            last_update_check: self.read_u32(OFFSET_LAST_UPDATE_CHECK).unwrap_or(0),
            last_full_wake: self.read_u32(OFFSET_LAST_FULL_WAKE).unwrap_or(0),
            last_quick_wake: self.read_u32(OFFSET_LAST_QUICK_WAKE).unwrap_or(0),
            next_data_capture: self.read_u32(OFFSET_NEXT_DATA_CAPTURE).unwrap_or(0),
        }
    }
}

/// File-backed [`PersistentRecord`] with debounced saves.
pub struct PersistentStore {
    fs: Arc<dyn FileSystem>,
    path: String,
    state: StoreLock<PersistentState>,
}

impl PersistentStore {
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self {
            fs,
            path: DEFAULT_PERSISTENT_PATH.to_owned(),
            state: StoreLock::new(PersistentState::new),
        }
    }

    pub fn with_path(mut self, path: &str) -> Self {
        self.path = path.to_owned();
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Holds the store lock across several operations.
    pub fn lock(&self) -> StoreGuard<'_> {
        self.state.guard()
    }

    /// Sets the debounce delay. Zero saves on every change and flushes anything pending.
    pub fn set_save_delay_ms(&self, save_delay_ms: u64) {
        self.state.with(|state| state.save_delay_ms = save_delay_ms);
        if save_delay_ms == 0 {
            self.flush(true, 0);
        }
    }

    /// Reads the record, reinitialising it when missing or invalid.
    ///
    /// Returns `true` when a valid record was found.
    pub fn load(&self) -> bool {
        let read = self.fs.read_prefix(&self.path, RECORD_LEN);
        self.state.with(|state| {
            let valid = match read {
                Ok(data) => {
                    state.bytes = [0; RECORD_LEN];
                    state.bytes[..data.len()].copy_from_slice(&data);
                    state.validate(data.len())
                }
                Err(FsError::NotFound) => false,
                Err(err) => {
                    warn!("persistent: read {} failed: {:?}", self.path, err);
                    false
                }
            };
            if !valid {
                info!("persistent: initialising {}", self.path);
                state.initialize();
            }
            state.dirty = false;
            state.dirty_since_ms = None;
            valid
        })
    }

    /// Writes the whole record now.
    pub fn save(&self) -> Result<(), FsError> {
        self.state.with(|state| self.save_locked(state))
    }

    fn save_locked(&self, state: &mut PersistentState) -> Result<(), FsError> {
        self.fs.write(&self.path, &state.bytes)?;
        state.dirty = false;
        state.dirty_since_ms = None;
        debug!("persistent: saved {}", self.path);
        Ok(())
    }

    /// Saves a pending change once it has aged past the save delay, or at once when
    /// `force` is set. A failed write stays pending for the next call.
    pub fn flush(&self, force: bool, now_ms: u64) {
        self.state.with(|state| {
            if !state.dirty {
                return;
            }
            let since = *state.dirty_since_ms.get_or_insert(now_ms);
            if !force && now_ms.saturating_sub(since) < state.save_delay_ms {
                return;
            }
            if let Err(err) = self.save_locked(state) {
                warn!("persistent: save {} failed: {:?}", self.path, err);
                state.dirty_since_ms = Some(now_ms);
            }
        });
    }

    pub fn is_dirty(&self) -> bool {
        self.state.with(|state| state.dirty)
    }

    pub fn get_u32(&self, offset: usize) -> Option<u32> {
        self.state.with(|state| state.read_u32(offset))
    }

    /// Stores `value` at `offset`. Returns `true` when the record changed.
    pub fn set_u32(&self, offset: usize, value: u32) -> bool {
        self.state.with(|state| {
            let Some(current) = state.read_u32(offset) else {
                warn!("persistent: offset {} outside record", offset);
                return false;
            };
            if current == value {
                return false;
            }

            state.bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
            if !state.dirty {
                state.dirty = true;
                state.dirty_since_ms = None;
            }
            if state.save_delay_ms == 0
                && let Err(err) = self.save_locked(state)
            {
                warn!("persistent: save {} failed: {:?}", self.path, err);
            }
            true
        })
    }

    pub fn record(&self) -> PersistentRecord {
        self.state.with(|state| state.record())
    }

    pub fn last_update_check(&self) -> i64 {
        self.get_u32(OFFSET_LAST_UPDATE_CHECK).unwrap_or(0) as i64
    }

    pub fn set_last_update_check(&self, time: i64) {
        self.set_u32(OFFSET_LAST_UPDATE_CHECK, clamp_time(time));
    }

    pub fn last_full_wake(&self) -> i64 {
        self.get_u32(OFFSET_LAST_FULL_WAKE).unwrap_or(0) as i64
    }

    pub fn set_last_full_wake(&self, time: i64) {
        self.set_u32(OFFSET_LAST_FULL_WAKE, clamp_time(time));
    }

    pub fn last_quick_wake(&self) -> i64 {
        self.get_u32(OFFSET_LAST_QUICK_WAKE).unwrap_or(0) as i64
    }

    pub fn set_last_quick_wake(&self, time: i64) {
        self.set_u32(OFFSET_LAST_QUICK_WAKE, clamp_time(time));
    }

    pub fn next_data_capture(&self) -> i64 {
        self.get_u32(OFFSET_NEXT_DATA_CAPTURE).unwrap_or(0) as i64
    }

    pub fn set_next_data_capture(&self, time: i64) {
        self.set_u32(OFFSET_NEXT_DATA_CAPTURE, clamp_time(time));
    }
}

fn clamp_time(time: i64) -> u32 {
    time.clamp(0, u32::MAX as i64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::mock::MemoryFileSystem;

    fn store() -> (Arc<MemoryFileSystem>, PersistentStore) {
        let fs = Arc::new(MemoryFileSystem::new());
        let store = PersistentStore::new(fs.clone());
        (fs, store)
    }

    #[test]
    fn missing_file_initialises_record() {
        let (_fs, store) = store();
        assert!(!store.load());
        assert_eq!(store.record(), PersistentRecord::default());
        assert!(!store.is_dirty());
    }

    #[test]
    fn saved_record_survives_reload() {
        let (fs, store) = store();
        store.load();
        store.set_last_full_wake(1_700_000_000);
        store.set_next_data_capture(1_700_000_120);
        store.flush(true, 0);

        let reloaded = PersistentStore::new(fs.clone());
        assert!(reloaded.load());
        assert_eq!(reloaded.last_full_wake(), 1_700_000_000);
        assert_eq!(reloaded.next_data_capture(), 1_700_000_120);

        let bytes = fs.contents(DEFAULT_PERSISTENT_PATH).unwrap_or_default();
        assert_eq!(bytes.len(), RECORD_LEN);
        assert_eq!(&bytes[0..4], &0xd87c_b6ceu32.to_le_bytes());
    }

    #[test]
    fn short_record_is_zero_padded() {
        let (fs, store) = store();
        let mut old = vec![0u8; 24];
        old[0..4].copy_from_slice(&PERSISTENT_MAGIC.to_le_bytes());
        old[4..6].copy_from_slice(&1u16.to_le_bytes());
        old[6..8].copy_from_slice(&24u16.to_le_bytes());
        old[20..24].copy_from_slice(&42u32.to_le_bytes());
        fs.insert(DEFAULT_PERSISTENT_PATH, &old);

        assert!(store.load());
        assert_eq!(store.last_full_wake(), 42);
        assert_eq!(store.last_quick_wake(), 0);
    }

    #[test]
    fn bad_magic_or_short_read_reinitialises() {
        let (fs, store) = store();
        let mut junk = vec![0xffu8; RECORD_LEN];
        junk[20..24].copy_from_slice(&7u32.to_le_bytes());
        fs.insert(DEFAULT_PERSISTENT_PATH, &junk);
        assert!(!store.load());
        assert_eq!(store.last_full_wake(), 0);

        fs.insert(DEFAULT_PERSISTENT_PATH, &[0xce, 0xb6, 0x7c, 0xd8]);
        assert!(!store.load());
    }

    #[test]
    fn declared_size_larger_than_file_is_rejected() {
        let (fs, store) = store();
        let mut data = vec![0u8; 20];
        data[0..4].copy_from_slice(&PERSISTENT_MAGIC.to_le_bytes());
        data[4..6].copy_from_slice(&1u16.to_le_bytes());
        data[6..8].copy_from_slice(&32u16.to_le_bytes());
        fs.insert(DEFAULT_PERSISTENT_PATH, &data);
        assert!(!store.load());
    }

    #[test]
    fn unchanged_value_does_not_dirty() {
        let (_fs, store) = store();
        store.load();
        assert!(!store.set_u32(OFFSET_LAST_QUICK_WAKE, 0));
        assert!(!store.is_dirty());
        assert!(store.set_u32(OFFSET_LAST_QUICK_WAKE, 5));
        assert!(store.is_dirty());
        assert!(!store.set_u32(RECORD_LEN, 5));
    }

    #[test]
    fn flush_waits_for_save_delay() {
        let (fs, store) = store();
        store.load();
        store.set_last_quick_wake(100);

        store.flush(false, 10_000);
        assert!(!fs.exists(DEFAULT_PERSISTENT_PATH));
        store.flush(false, 10_999);
        assert!(!fs.exists(DEFAULT_PERSISTENT_PATH));
        store.flush(false, 11_000);
        assert!(fs.exists(DEFAULT_PERSISTENT_PATH));
        assert!(!store.is_dirty());
    }

    #[test]
    fn failed_save_is_retried() {
        let (fs, store) = store();
        store.load();
        store.set_last_quick_wake(100);
        fs.set_fail_writes(true);
        store.flush(true, 0);
        assert!(store.is_dirty());

        fs.set_fail_writes(false);
        store.flush(true, 5);
        assert!(!store.is_dirty());
        assert!(fs.exists(DEFAULT_PERSISTENT_PATH));
    }

    #[test]
    fn zero_save_delay_writes_immediately() {
        let (fs, store) = store();
        store.load();
        store.set_last_full_wake(9);
        store.set_save_delay_ms(0);
        assert!(fs.exists(DEFAULT_PERSISTENT_PATH));

        store.set_last_full_wake(10);
        let reloaded = PersistentStore::new(fs.clone());
        reloaded.load();
        assert_eq!(reloaded.last_full_wake(), 10);
    }
}

//! Flat JSON settings document persisted as a file, with change notifications.

use std::{collections::VecDeque, sync::Arc};

use log::{debug, info, warn};
use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::{
    hooks::{HookList, SettingChangeHook},
    host::{FileSystem, FsError},
    json::{is_scalar, same_value},
    sync::{StoreGuard, StoreLock},
};

mod murmur;

pub use murmur::murmur3_32;

pub const DEFAULT_SETTINGS_PATH: &str = "/usr/sleepSettings.json";
pub const DEFAULT_CLOUD_SETTINGS_PATH: &str = "/usr/cloudSettings.json";
pub const DEFAULT_MAX_SETTINGS_BYTES: usize = 1024;
pub const CLOUD_SETTINGS_HASH_SEED: u32 = 0x5b4f_fa05;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SettingsError {
    Parse,
    NotObject,
    /// A value is an object, array or null.
    NotFlat,
    TooLarge,
    Storage(FsError),
}

impl From<FsError> for SettingsError {
    fn from(err: FsError) -> Self {
        Self::Storage(err)
    }
}

/// Types readable from a setting with an exact JSON type match.
pub trait SettingValue: Sized {
    fn from_setting(value: &Value) -> Option<Self>;
}

impl SettingValue for bool {
    fn from_setting(value: &Value) -> Option<Self> {
        value.as_bool()
    }
}

impl SettingValue for i64 {
    fn from_setting(value: &Value) -> Option<Self> {
        match value {
            Value::Number(number) if !number.is_f64() => number.as_i64(),
            _ => None,
        }
    }
}

impl SettingValue for i32 {
    fn from_setting(value: &Value) -> Option<Self> {
        i64::from_setting(value).and_then(|v| i32::try_from(v).ok())
    }
}

impl SettingValue for u32 {
    fn from_setting(value: &Value) -> Option<Self> {
        i64::from_setting(value).and_then(|v| u32::try_from(v).ok())
    }
}

impl SettingValue for f64 {
    fn from_setting(value: &Value) -> Option<Self> {
        match value {
            Value::Number(number) if number.is_f64() => number.as_f64(),
            _ => None,
        }
    }
}

impl SettingValue for String {
    fn from_setting(value: &Value) -> Option<Self> {
        value.as_str().map(str::to_owned)
    }
}

#[derive(Clone)]
struct SettingsState {
    doc: Map<String, Value>,
    /// Exact bytes of the document as last written or accepted.
    text: String,
}

impl SettingsState {
    fn empty() -> Self {
        Self {
            doc: Map::new(),
            text: "{}".to_owned(),
        }
    }

    fn reserialize(&mut self) {
        self.text = Value::Object(self.doc.clone()).to_string();
    }
}

fn parse_flat(json: &str) -> Result<Map<String, Value>, SettingsError> {
    let value: Value = serde_json::from_str(json).map_err(|_| SettingsError::Parse)?;
    let Value::Object(map) = value else {
        return Err(SettingsError::NotObject);
    };
    if !map.values().all(is_scalar) {
        return Err(SettingsError::NotFlat);
    }
    Ok(map)
}

/// Keys whose presence, type or serialized bytes differ between two documents.
fn changed_keys(old: &Map<String, Value>, new: &Map<String, Value>) -> Vec<String> {
    let mut changed: Vec<String> = new
        .iter()
        .filter(|(key, value)| old.get(*key).is_none_or(|prev| !same_value(prev, value)))
        .map(|(key, _)| key.clone())
        .collect();
    changed.extend(old.keys().filter(|key| !new.contains_key(*key)).cloned());
    changed
}

/// Change handlers plus the keys still waiting to be delivered to them.
///
/// The handlers are moved out while they run so a handler may write back into the
/// store; keys changed meanwhile are queued and delivered by the running dispatch.
#[derive(Default)]
struct ChangeNotifier {
    hooks: HookList<SettingChangeHook>,
    pending: VecDeque<String>,
    dispatching: bool,
}

/// Application settings document.
pub struct SettingsFile {
    fs: Arc<dyn FileSystem>,
    path: String,
    max_size: usize,
    defaults: Option<String>,
    state: StoreLock<SettingsState>,
    notifier: Mutex<ChangeNotifier>,
}

impl SettingsFile {
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self {
            fs,
            path: DEFAULT_SETTINGS_PATH.to_owned(),
            max_size: DEFAULT_MAX_SETTINGS_BYTES,
            defaults: None,
            state: StoreLock::new(SettingsState::empty),
            notifier: Mutex::new(ChangeNotifier::default()),
        }
    }

    pub fn with_path(mut self, path: &str) -> Self {
        self.path = path.to_owned();
        self
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Defaults merged into the document by every [`SettingsFile::load`].
    pub fn with_default_values(mut self, json: &str) -> Self {
        self.defaults = Some(json.to_owned());
        self
    }

    pub fn with_setting_change_hook(
        self,
        hook: impl FnMut(&str) -> bool + Send + 'static,
    ) -> Self {
        self.add_setting_change_hook(hook);
        self
    }

    /// Registers a handler called with each changed key.
    ///
    /// Handlers may read and write the store. Keys they change are delivered after the
    /// current key, once to every handler.
    pub fn add_setting_change_hook(&self, hook: impl FnMut(&str) -> bool + Send + 'static) {
        self.notifier.lock().hooks.add(Box::new(hook));
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Holds the store lock across several operations.
    pub fn lock(&self) -> StoreGuard<'_> {
        self.state.guard()
    }

    /// Reads the file, falling back to an empty document, then applies defaults.
    pub fn load(&self) {
        let loaded = match self.fs.read_prefix(&self.path, self.max_size) {
            Ok(bytes) => match core::str::from_utf8(&bytes).map(parse_flat) {
                Ok(Ok(doc)) => {
                    let text = String::from_utf8_lossy(&bytes).trim().to_owned();
                    Some(SettingsState { doc, text })
                }
                _ => {
                    warn!("settings: {} unreadable, starting empty", self.path);
                    None
                }
            },
            Err(FsError::NotFound) => None,
            Err(err) => {
                warn!("settings: read {} failed: {:?}", self.path, err);
                None
            }
        };

        let state = loaded.unwrap_or_else(SettingsState::empty);
        debug!("settings: loaded {} keys from {}", state.doc.len(), self.path);
        self.state.with(|current| *current = state);

        if let Some(defaults) = self.defaults.as_deref()
            && let Err(err) = self.add_default_values(defaults)
        {
            warn!("settings: defaults rejected: {:?}", err);
        }
    }

    /// Writes the document with create-truncate semantics.
    pub fn save(&self) -> Result<(), SettingsError> {
        self.state.with(|state| self.write_locked(state))
    }

    fn write_locked(&self, state: &SettingsState) -> Result<(), SettingsError> {
        self.fs.write(&self.path, state.text.as_bytes())?;
        Ok(())
    }

    /// Applies `edit` under the lock, persists, then notifies outside the lock.
    ///
    /// `edit` returns the changed keys; nothing is written when it returns none. A
    /// failed size check or write rolls the document back.
    fn commit(
        &self,
        notify: bool,
        edit: impl FnOnce(&mut SettingsState) -> Result<Vec<String>, SettingsError>,
    ) -> Result<Vec<String>, SettingsError> {
        let changed = self.state.with(|state| {
            let backup = state.clone();
            let changed = edit(state)?;
            if changed.is_empty() {
                return Ok(changed);
            }
            if state.text.len() > self.max_size {
                *state = backup;
                return Err(SettingsError::TooLarge);
            }
            if let Err(err) = self.write_locked(state) {
                *state = backup;
                return Err(err);
            }
            Ok(changed)
        })?;

        if notify && !changed.is_empty() {
            info!("settings: changed {:?}", changed);
            self.notify(&changed);
        }
        Ok(changed)
    }

    /// Delivers `changed` with neither the store lock nor the notifier lock held.
    fn notify(&self, changed: &[String]) {
        let mut hooks = {
            let mut notifier = self.notifier.lock();
            notifier.pending.extend(changed.iter().cloned());
            if notifier.dispatching {
                return;
            }
            notifier.dispatching = true;
            core::mem::take(&mut notifier.hooks)
        };

        loop {
            let key = {
                let mut notifier = self.notifier.lock();
                match notifier.pending.pop_front() {
                    Some(key) => key,
                    None => {
                        // Handlers registered during dispatch go after the existing ones.
                        hooks.append(&mut notifier.hooks);
                        notifier.hooks = hooks;
                        notifier.dispatching = false;
                        return;
                    }
                }
            };
            hooks.for_each(|hook| hook(key.as_str()));
        }
    }

    pub fn get<T: SettingValue>(&self, key: &str) -> Option<T> {
        self.state.with(|state| state.doc.get(key).and_then(T::from_setting))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state.with(|state| state.doc.contains_key(key))
    }

    /// Sets one scalar. Returns `true` when the value changed.
    pub fn set(&self, key: &str, value: impl Into<Value>) -> Result<bool, SettingsError> {
        let value = value.into();
        if !is_scalar(&value) {
            return Err(SettingsError::NotFlat);
        }

        let changed = self.commit(true, |state| {
            if state.doc.get(key).is_some_and(|prev| same_value(prev, &value)) {
                return Ok(Vec::new());
            }
            state.doc.insert(key.to_owned(), value);
            state.reserialize();
            Ok(vec![key.to_owned()])
        })?;
        Ok(!changed.is_empty())
    }

    /// Replaces the whole document with `json`.
    pub fn set_values_json(&self, json: &str) -> Result<Vec<String>, SettingsError> {
        let doc = parse_flat(json)?;
        let text = json.trim().to_owned();
        self.commit(true, |state| {
            let changed = changed_keys(&state.doc, &doc);
            if !changed.is_empty() {
                *state = SettingsState { doc, text };
            }
            Ok(changed)
        })
    }

    /// Merges `json` into the document; keys it does not name are kept.
    pub fn update_values_json(&self, json: &str) -> Result<Vec<String>, SettingsError> {
        let update = parse_flat(json)?;
        self.commit(true, |state| {
            let mut changed = Vec::new();
            for (key, value) in update {
                if state.doc.get(&key).is_some_and(|prev| same_value(prev, &value)) {
                    continue;
                }
                changed.push(key.clone());
                state.doc.insert(key, value);
            }
            if !changed.is_empty() {
                state.reserialize();
            }
            Ok(changed)
        })
    }

    /// Inserts keys from `json` that the document lacks. Existing values win and no
    /// change notifications fire.
    pub fn add_default_values(&self, json: &str) -> Result<Vec<String>, SettingsError> {
        let defaults = parse_flat(json)?;
        self.commit(false, |state| {
            let mut added = Vec::new();
            for (key, value) in defaults {
                if !state.doc.contains_key(&key) {
                    added.push(key.clone());
                    state.doc.insert(key, value);
                }
            }
            if !added.is_empty() {
                state.reserialize();
            }
            Ok(added)
        })
    }

    pub fn get_values_json(&self) -> String {
        self.state.with(|state| state.text.clone())
    }

    fn hash_with(&self, seed: u32) -> u32 {
        self.state.with(|state| murmur3_32(state.text.as_bytes(), seed))
    }
}

/// Settings pushed from the cloud as a whole document.
///
/// Only whole-document replacement is offered, so the local bytes stay identical to
/// what the cloud sent and [`CloudSettingsFile::hash`] can be compared against it.
pub struct CloudSettingsFile {
    inner: SettingsFile,
}

impl CloudSettingsFile {
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self {
            inner: SettingsFile::new(fs).with_path(DEFAULT_CLOUD_SETTINGS_PATH),
        }
    }

    pub fn with_path(mut self, path: &str) -> Self {
        self.inner = self.inner.with_path(path);
        self
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.inner = self.inner.with_max_size(max_size);
        self
    }

    pub fn with_setting_change_hook(
        mut self,
        hook: impl FnMut(&str) -> bool + Send + 'static,
    ) -> Self {
        self.inner = self.inner.with_setting_change_hook(hook);
        self
    }

    pub fn add_setting_change_hook(&self, hook: impl FnMut(&str) -> bool + Send + 'static) {
        self.inner.add_setting_change_hook(hook);
    }

    pub fn load(&self) {
        self.inner.load();
    }

    pub fn get<T: SettingValue>(&self, key: &str) -> Option<T> {
        self.inner.get(key)
    }

    pub fn set_values_json(&self, json: &str) -> Result<Vec<String>, SettingsError> {
        self.inner.set_values_json(json)
    }

    pub fn get_values_json(&self) -> String {
        self.inner.get_values_json()
    }

    /// Murmur3-32 of the document bytes, seeded with [`CLOUD_SETTINGS_HASH_SEED`].
    pub fn hash(&self) -> u32 {
        self.inner.hash_with(CLOUD_SETTINGS_HASH_SEED)
    }
}

#[cfg(test)]
mod tests;

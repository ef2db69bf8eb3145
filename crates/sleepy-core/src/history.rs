//! Append-only file of newline-separated JSON objects, drained into wake events.
//!
//! Draining hands out records from a cursor without deleting them. The head of the
//! file is cut only once the caller knows the records were delivered, either with
//! [`EventHistory::remove_events`] or [`EventHistory::remove_through`].

use std::sync::Arc;

use log::{debug, info, trace, warn};
use serde_json::Value;

use crate::{
    host::{FileSystem, FsError},
    json::{JsonObjectWriter, json_copy},
    sync::{StoreGuard, StoreLock},
};

pub const DEFAULT_HISTORY_PATH: &str = "/usr/eventHistory.txt";
pub const DEFAULT_HISTORY_KEY: &str = "eh";

const COPY_CHUNK_BYTES: usize = 512;
const TEMP_SUFFIX: &str = ".tmp";

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum HistoryError {
    /// Not a single-line JSON object.
    Invalid,
    Storage(FsError),
}

impl From<FsError> for HistoryError {
    fn from(err: FsError) -> Self {
        Self::Storage(err)
    }
}

/// Records handed out by one drain.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HistoryBatch {
    pub records: Vec<Value>,
    /// Cursor just past the last record consumed by this drain.
    pub end: u64,
}

impl HistoryBatch {
    pub fn to_json_array(&self) -> String {
        Value::Array(self.records.clone()).to_string()
    }
}

#[derive(Default)]
struct HistoryState {
    probed: bool,
    has_events: bool,
    /// Drain cursor, counted from the file head at the last rewind.
    remove_offset: u64,
    /// Bytes cut from the file head since the last rewind.
    removed: u64,
}

impl HistoryState {
    fn file_position(&self) -> u64 {
        self.remove_offset.saturating_sub(self.removed)
    }
}

pub struct EventHistory {
    fs: Arc<dyn FileSystem>,
    path: String,
    state: StoreLock<HistoryState>,
}

impl EventHistory {
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self {
            fs,
            path: DEFAULT_HISTORY_PATH.to_owned(),
            state: StoreLock::new(HistoryState::default),
        }
    }

    pub fn with_path(mut self, path: &str) -> Self {
        self.path = path.to_owned();
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn lock(&self) -> StoreGuard<'_> {
        self.state.guard()
    }

    /// Appends one JSON object as a line.
    pub fn append(&self, json: &str) -> Result<(), HistoryError> {
        let value: Value = serde_json::from_str(json).map_err(|_| HistoryError::Invalid)?;
        if !value.is_object() {
            return Err(HistoryError::Invalid);
        }
        self.append_line(value.to_string())
    }

    /// Appends the object built by `build`. Empty objects are not written.
    pub fn append_with(&self, build: impl FnOnce(&mut JsonObjectWriter)) -> Result<(), HistoryError> {
        let mut writer = JsonObjectWriter::new();
        build(&mut writer);
        if writer.is_empty() {
            return Ok(());
        }
        self.append_line(writer.to_json())
    }

    fn append_line(&self, mut line: String) -> Result<(), HistoryError> {
        trace!("history: append {}", line);
        line.push('\n');
        self.state.with(|state| {
            self.fs.append(&self.path, line.as_bytes())?;
            state.probed = true;
            state.has_events = true;
            Ok(())
        })
    }

    /// `true` when the file holds any record. Probes the file on first use.
    pub fn has_events(&self) -> bool {
        self.state.with(|state| self.has_events_locked(state))
    }

    fn has_events_locked(&self, state: &mut HistoryState) -> bool {
        if !state.probed {
            state.probed = true;
            state.has_events = self.fs.size(&self.path).is_ok_and(|size| size > 0);
        }
        state.has_events
    }

    /// `true` when records exist past the drain cursor.
    pub fn has_undrained(&self) -> bool {
        self.state.with(|state| {
            if !self.has_events_locked(state) {
                return false;
            }
            self.fs
                .size(&self.path)
                .is_ok_and(|size| size > state.file_position())
        })
    }

    /// Restarts draining from the head of the file.
    pub fn rewind(&self) {
        self.state.with(|state| {
            state.remove_offset = 0;
            state.removed = 0;
        });
    }

    /// Hands out records from the cursor whose JSON array fits in `max_bytes`.
    ///
    /// Returns `None` when there is nothing to drain. A batch may be empty when only
    /// an unusable record (corrupt, or too large for `max_bytes`) was skipped.
    pub fn drain(&self, max_bytes: usize, auto_remove: bool) -> Option<HistoryBatch> {
        if max_bytes < 2 {
            return None;
        }

        let batch = self.state.with(|state| {
            if !self.has_events_locked(state) {
                return None;
            }
            let batch = self.drain_locked(state, max_bytes)?;
            if auto_remove && let Err(err) = self.remove_through_locked(state, batch.end) {
                warn!("history: remove after drain failed: {:?}", err);
            }
            Some(batch)
        })?;

        debug!(
            "history: drained {} records, cursor {}",
            batch.records.len(),
            batch.end
        );
        Some(batch)
    }

    fn drain_locked(&self, state: &mut HistoryState, max_bytes: usize) -> Option<HistoryBatch> {
        let start = state.file_position();
        let mut window = vec![0u8; max_bytes];
        let mut filled = 0usize;
        while filled < max_bytes {
            match self.fs.read_at(&self.path, start + filled as u64, &mut window[filled..]) {
                Ok(0) => break,
                Ok(read) => filled += read,
                Err(FsError::NotFound) => {
                    state.has_events = false;
                    return None;
                }
                Err(err) => {
                    warn!("history: read {} failed: {:?}", self.path, err);
                    return None;
                }
            }
        }
        window.truncate(filled);
        if window.is_empty() {
            return None;
        }

        let Some(last_newline) = window.iter().rposition(|b| *b == b'\n') else {
            if filled < max_bytes {
                // Unterminated tail; wait for the writer.
                return None;
            }
            let skip = self.skip_oversized(start + filled as u64)?;
            warn!("history: record over {} bytes skipped", max_bytes);
            state.remove_offset += filled as u64 + skip;
            return Some(HistoryBatch {
                records: Vec::new(),
                end: state.remove_offset,
            });
        };

        let mut records = Vec::new();
        let mut used = 2usize;
        let mut consumed = 0usize;
        for line in window[..=last_newline].split_inclusive(|b| *b == b'\n') {
            let body = &line[..line.len() - 1];
            if body.iter().all(u8::is_ascii_whitespace) {
                consumed += line.len();
                continue;
            }
            let Ok(value) = serde_json::from_slice::<Value>(body) else {
                warn!("history: corrupt record skipped ({} bytes)", body.len());
                consumed += line.len();
                continue;
            };

            let copy = json_copy(&value);
            let encoded_len = copy.to_string().len();
            if used + encoded_len + 1 > max_bytes {
                if records.is_empty() {
                    warn!("history: record of {} bytes cannot fit, skipped", encoded_len);
                    consumed += line.len();
                }
                break;
            }
            used += encoded_len + 1;
            consumed += line.len();
            records.push(copy);
        }

        state.remove_offset += consumed as u64;
        Some(HistoryBatch {
            records,
            end: state.remove_offset,
        })
    }

    /// Length of the rest of a record starting at `from`, including its newline.
    fn skip_oversized(&self, from: u64) -> Option<u64> {
        let mut chunk = [0u8; COPY_CHUNK_BYTES];
        let mut offset = from;
        loop {
            let read = match self.fs.read_at(&self.path, offset, &mut chunk) {
                Ok(read) => read,
                Err(err) => {
                    warn!("history: read {} failed: {:?}", self.path, err);
                    return None;
                }
            };
            if read == 0 {
                return Some(offset - from);
            }
            if let Some(pos) = chunk[..read].iter().position(|b| *b == b'\n') {
                return Some(offset - from + pos as u64 + 1);
            }
            offset += read as u64;
        }
    }

    /// Removes every record handed out so far.
    pub fn remove_events(&self) -> Result<(), FsError> {
        self.state.with(|state| {
            let end = state.remove_offset;
            self.remove_through_locked(state, end)
        })
    }

    /// Removes records up to `end`, a cursor from [`HistoryBatch::end`].
    pub fn remove_through(&self, end: u64) -> Result<(), FsError> {
        self.state.with(|state| self.remove_through_locked(state, end))
    }

    fn remove_through_locked(&self, state: &mut HistoryState, end: u64) -> Result<(), FsError> {
        let cut = end.saturating_sub(state.removed);
        if cut == 0 {
            return Ok(());
        }

        let size = match self.fs.size(&self.path) {
            Ok(size) => size,
            Err(FsError::NotFound) => {
                state.has_events = false;
                state.removed = end;
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        if cut >= size {
            self.fs.remove(&self.path)?;
            state.has_events = false;
            info!("history: all events removed");
        } else {
            self.rewrite_tail(cut, size)?;
            info!("history: removed {} bytes, {} remain", cut, size - cut);
        }
        state.removed = end;
        state.remove_offset = state.remove_offset.max(end);
        Ok(())
    }

    /// Moves bytes `[cut, size)` into a new file that replaces the original.
    fn rewrite_tail(&self, cut: u64, size: u64) -> Result<(), FsError> {
        let temp = format!("{}{}", self.path, TEMP_SUFFIX);
        self.fs.write(&temp, &[])?;

        let mut chunk = [0u8; COPY_CHUNK_BYTES];
        let mut offset = cut;
        while offset < size {
            let read = self.fs.read_at(&self.path, offset, &mut chunk)?;
            if read == 0 {
                break;
            }
            self.fs.append(&temp, &chunk[..read])?;
            offset += read as u64;
        }

        self.fs.rename(&temp, &self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::mock::MemoryFileSystem;

    fn new_history() -> (Arc<MemoryFileSystem>, EventHistory) {
        let fs = Arc::new(MemoryFileSystem::new());
        let history = EventHistory::new(fs.clone());
        (fs, history)
    }

    fn file_text(fs: &MemoryFileSystem) -> String {
        String::from_utf8(fs.contents(DEFAULT_HISTORY_PATH).unwrap_or_default())
            .unwrap_or_default()
    }

    #[test]
    fn has_events_probes_existing_file() {
        let (fs, history) = new_history();
        fs.insert(DEFAULT_HISTORY_PATH, b"{\"a\":1}\n");
        assert!(history.has_events());

        let (_fs, empty) = new_history();
        assert!(!empty.has_events());
        assert_eq!(empty.drain(100, true), None);
    }

    #[test]
    fn append_writes_one_line_per_record() {
        let (fs, history) = new_history();
        history.append(r#"{"t": 20.5}"#).unwrap_or(());
        history
            .append_with(|w| {
                w.insert("t", 21);
            })
            .unwrap_or(());
        history.append_with(|_| {}).unwrap_or(());

        assert_eq!(file_text(&fs), "{\"t\":20.5}\n{\"t\":21}\n");
        assert_eq!(history.append("[1]"), Err(HistoryError::Invalid));
        assert!(history.has_events());
    }

    #[test]
    fn drain_with_auto_remove_keeps_what_did_not_fit() {
        let (fs, history) = new_history();
        for i in 0..5 {
            history.append(&format!(r#"{{"i":{}}}"#, i)).unwrap_or(());
        }

        // Each record is 7 bytes; 2 + 3 * 8 = 26 fits, a fourth does not.
        let batch = history.drain(30, true);
        let records = batch.map(|batch| batch.to_json_array());
        assert_eq!(records.as_deref(), Some(r#"[{"i":0},{"i":1},{"i":2}]"#));
        assert_eq!(file_text(&fs), "{\"i\":3}\n{\"i\":4}\n");

        let batch = history.drain(30, true);
        assert_eq!(batch.map(|b| b.records.len()), Some(2));
        assert!(!fs.exists(DEFAULT_HISTORY_PATH));
        assert!(!fs.exists("/usr/eventHistory.txt.tmp"));
        assert!(!history.has_events());
        assert_eq!(history.drain(30, true), None);
    }

    #[test]
    fn drain_without_remove_advances_cursor_only() {
        let (fs, history) = new_history();
        for i in 0..3 {
            history.append(&format!(r#"{{"i":{}}}"#, i)).unwrap_or(());
        }

        let first = history.drain(20, false).unwrap_or_default();
        assert_eq!(first.to_json_array(), r#"[{"i":0},{"i":1}]"#);
        assert!(history.has_undrained());

        let second = history.drain(20, false).unwrap_or_default();
        assert_eq!(second.to_json_array(), r#"[{"i":2}]"#);
        assert!(!history.has_undrained());
        assert_eq!(file_text(&fs).lines().count(), 3);

        // Acknowledge only the first batch.
        history.remove_through(first.end).unwrap_or(());
        assert_eq!(file_text(&fs), "{\"i\":2}\n");

        history.rewind();
        let again = history.drain(20, false).unwrap_or_default();
        assert_eq!(again.to_json_array(), r#"[{"i":2}]"#);
        history.remove_through(again.end).unwrap_or(());
        assert!(!fs.exists(DEFAULT_HISTORY_PATH));
    }

    #[test]
    fn records_appended_during_a_session_survive_removal() {
        let (fs, history) = new_history();
        history.append(r#"{"i":0}"#).unwrap_or(());
        let batch = history.drain(100, false).unwrap_or_default();
        history.append(r#"{"i":1}"#).unwrap_or(());

        history.remove_through(batch.end).unwrap_or(());
        assert_eq!(file_text(&fs), "{\"i\":1}\n");
        assert!(history.has_events());
    }

    #[test]
    fn numbers_are_normalised() {
        let (fs, history) = new_history();
        fs.insert(DEFAULT_HISTORY_PATH, b"{\"a\":3.0,\"b\":1.5}\n");
        let batch = history.drain(100, true).unwrap_or_default();
        assert_eq!(batch.to_json_array(), r#"[{"a":3,"b":1.5}]"#);
    }

    #[test]
    fn corrupt_and_oversized_records_are_skipped() {
        let (fs, history) = new_history();
        let big = format!("{{\"x\":\"{}\"}}\n", "y".repeat(40));
        let content = format!("not json\n{}{{\"ok\":1}}\n", big);
        fs.insert(DEFAULT_HISTORY_PATH, content.as_bytes());

        // Window of 20 bytes holds the corrupt line but not the big record.
        let first = history.drain(20, true).unwrap_or_default();
        assert!(first.records.is_empty());
        let second = history.drain(20, true).unwrap_or_default();
        assert!(second.records.is_empty());
        let third = history.drain(20, true).unwrap_or_default();
        assert_eq!(third.to_json_array(), r#"[{"ok":1}]"#);
        assert!(!history.has_events());
    }

    #[test]
    fn tiny_budget_returns_nothing() {
        let (_fs, history) = new_history();
        history.append(r#"{"a":1}"#).unwrap_or(());
        assert_eq!(history.drain(1, true), None);
    }
}

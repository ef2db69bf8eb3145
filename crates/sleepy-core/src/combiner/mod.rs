//! Packs wake-event fragments and event history into size-bounded JSON payloads.
//!
//! Fragments come from hooks that write a flat object and pick a priority. They are
//! ordered by priority, de-duplicated on top-level keys and packed greedily. After the
//! first payload fills, only fragments at [`STARVATION_PRIORITY`] or above continue
//! into further payloads. Any history that did not ride along is sent in payloads of
//! its own.

use std::sync::Arc;

use log::{debug, info, trace, warn};
use serde_json::Value;

use crate::{
    history::{DEFAULT_HISTORY_KEY, EventHistory},
    hooks::{HookList, WakeEventHook},
    json::JsonObjectWriter,
};

pub const DEFAULT_MAX_PAYLOAD: usize = 1024;
/// Priority of the standard fragments.
pub const STANDARD_PRIORITY: i32 = 50;
/// Lower priorities are only sent in the first payload.
pub const STARVATION_PRIORITY: i32 = 50;
/// Hook priorities above this are treated as this.
pub const MAX_PRIORITY: i32 = 100;
const HISTORY_PRIORITY: i32 = 1;
/// `{"key":[...]}` framing sharing a payload: key quotes, colon, braces and a comma on each side.
const HISTORY_FRAGMENT_OVERHEAD: usize = 7;
/// `{"key":[...]}` framing in a payload of its own: key quotes, colon, braces and a terminator byte.
const HISTORY_PAYLOAD_OVERHEAD: usize = 6;

/// Standard fragments, each a bit in the enabled mask.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WakeEventFlags(u64);

impl WakeEventFlags {
    pub const WAKE_REASON: Self = Self(0x01);
    pub const TIME_TO_CONNECT: Self = Self(0x02);
    pub const RESET_REASON: Self = Self(0x04);
    pub const BATTERY_SOC: Self = Self(0x08);
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

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// JSON key of a single standard flag.
    pub const fn key(self) -> Option<&'static str> {
        match self.0 {
            0x01 => Some("wr"),
            0x02 => Some("ttc"),
            0x04 => Some("rr"),
            0x08 => Some("soc"),
            _ => None,
        }
    }
}

impl Default for WakeEventFlags {
    fn default() -> Self {
        Self::ALL
    }
}

/// One publishable JSON object.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CombinedPayload {
    pub data: String,
    /// History cursor to acknowledge once this payload is delivered.
    pub history_end: Option<u64>,
}

#[derive(Debug)]
struct Fragment {
    /// Object body without the surrounding braces.
    body: String,
    priority: i32,
    keys: Vec<String>,
    history_end: Option<u64>,
}

impl Fragment {
    fn capture(hook: &mut WakeEventHook, max_payload: usize) -> Option<Self> {
        let mut writer = JsonObjectWriter::new();
        let mut priority = 0;
        let _ = hook(&mut writer, &mut priority);
        if priority <= 0 || writer.is_empty() {
            return None;
        }

        let json = writer.to_json();
        if json.len() > max_payload {
            warn!(
                "combiner: fragment of {} bytes exceeds payload limit, dropped",
                json.len()
            );
            return None;
        }

        Some(Self {
            body: json[1..json.len() - 1].to_owned(),
            priority: priority.clamp(1, MAX_PRIORITY),
            keys: writer.keys().map(str::to_owned).collect(),
            history_end: None,
        })
    }
}

struct PayloadBuilder {
    max_payload: usize,
    current: String,
    history_end: Option<u64>,
    done: Vec<CombinedPayload>,
}

impl PayloadBuilder {
    fn new(max_payload: usize) -> Self {
        Self {
            max_payload,
            current: String::from("{"),
            history_end: None,
            done: Vec::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.current.len() <= 1
    }

    fn fits(&self, body: &str) -> bool {
        let separator = usize::from(!self.is_empty());
        self.current.len() + separator + body.len() + 1 <= self.max_payload
    }

    fn push(&mut self, fragment: &Fragment) {
        if !self.is_empty() {
            self.current.push(',');
        }
        self.current.push_str(&fragment.body);
        if fragment.history_end.is_some() {
            self.history_end = fragment.history_end;
        }
    }

    fn finish_current(&mut self) {
        if self.is_empty() {
            return;
        }
        let mut data = core::mem::replace(&mut self.current, String::from("{"));
        data.push('}');
        self.done.push(CombinedPayload {
            data,
            history_end: self.history_end.take(),
        });
    }
}

/// Builds the wake-event payloads published after each full wake.
pub struct EventCombiner {
    hooks: HookList<WakeEventHook>,
    one_time_hooks: HookList<WakeEventHook>,
    history: Option<Arc<EventHistory>>,
    history_key: String,
    max_payload: usize,
    events_enabled: WakeEventFlags,
}

impl EventCombiner {
    pub fn new() -> Self {
        Self {
            hooks: HookList::new(),
            one_time_hooks: HookList::new(),
            history: None,
            history_key: DEFAULT_HISTORY_KEY.to_owned(),
            max_payload: DEFAULT_MAX_PAYLOAD,
            events_enabled: WakeEventFlags::default(),
        }
    }

    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    pub fn with_history(mut self, history: Arc<EventHistory>, key: &str) -> Self {
        self.set_history(history, key);
        self
    }

    pub fn set_history(&mut self, history: Arc<EventHistory>, key: &str) {
        self.history = Some(history);
        self.history_key = key.to_owned();
    }

    pub fn set_max_payload(&mut self, max_payload: usize) {
        self.max_payload = max_payload;
    }

    pub fn set_events_enabled(&mut self, events_enabled: WakeEventFlags) {
        self.events_enabled = events_enabled;
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    pub fn history(&self) -> Option<&Arc<EventHistory>> {
        self.history.as_ref()
    }

    pub fn add_hook(
        &mut self,
        hook: impl FnMut(&mut JsonObjectWriter, &mut i32) -> bool + Send + 'static,
    ) {
        self.hooks.add(Box::new(hook));
    }

    /// Registers a hook used for the next [`EventCombiner::generate_events`] only.
    pub fn add_one_time_hook(
        &mut self,
        hook: impl FnMut(&mut JsonObjectWriter, &mut i32) -> bool + Send + 'static,
    ) {
        self.one_time_hooks.add(Box::new(hook));
    }

    /// Queues a standard one-time fragment when `flag` is enabled.
    pub fn add_flag_fragment(&mut self, flag: WakeEventFlags, value: impl Into<Value>) -> bool {
        let Some(key) = flag.key() else {
            return false;
        };
        if !self.events_enabled.contains(flag) {
            return false;
        }
        let value = value.into();
        self.add_one_time_hook(move |writer, priority| {
            writer.insert(key, value.clone());
            *priority = STANDARD_PRIORITY;
            true
        });
        true
    }

    pub fn one_time_hook_count(&self) -> usize {
        self.one_time_hooks.len()
    }

    /// Runs every hook, drains history and packs the results.
    ///
    /// Every payload is a JSON object of at most the payload limit with no repeated
    /// top-level key. One-time hooks are cleared afterwards.
    pub fn generate_events(&mut self) -> Vec<CombinedPayload> {
        let max_payload = self.max_payload;
        let mut fragments = Vec::new();
        let mut capture = |hook: &mut WakeEventHook| {
            if let Some(fragment) = Fragment::capture(hook, max_payload) {
                fragments.push(fragment);
            }
            true
        };
        self.one_time_hooks.for_each_reversed(&mut capture);
        self.hooks.for_each(&mut capture);
        self.one_time_hooks.remove_all();

        if let Some(fragment) = self.history_fragment() {
            fragments.push(fragment);
        }

        fragments.sort_by(|a, b| b.priority.cmp(&a.priority));
        let mut seen_keys: Vec<String> = Vec::new();
        fragments.retain(|fragment| {
            if fragment.keys.iter().any(|key| seen_keys.contains(key)) {
                debug!("combiner: duplicate key in {:?}, dropped", fragment.keys);
                return false;
            }
            seen_keys.extend(fragment.keys.iter().cloned());
            true
        });

        let mut builder = PayloadBuilder::new(max_payload);
        let mut first_payload = true;
        let mut history_placed = false;
        for fragment in fragments.iter() {
            if !builder.fits(&fragment.body) {
                builder.finish_current();
                first_payload = false;
            }
            if !first_payload && fragment.priority < STARVATION_PRIORITY {
                debug!("combiner: priority {} fragments deferred", fragment.priority);
                break;
            }
            if !builder.fits(&fragment.body) {
                continue;
            }
            builder.push(fragment);
            history_placed |= fragment.history_end.is_some();
        }
        builder.finish_current();

        let mut payloads = builder.done;
        if let Some(history) = self.history.as_ref() {
            if !history_placed {
                history.rewind();
            }
            payloads.extend(self.history_only_payloads(history));
        }

        info!("combiner: {} payloads", payloads.len());
        for payload in payloads.iter() {
            trace!("combiner: payload {}", payload.data);
        }
        payloads
    }

    fn quoted_history_key(&self) -> String {
        Value::String(self.history_key.clone()).to_string()
    }

    fn history_fragment(&self) -> Option<Fragment> {
        let history = self.history.as_ref()?;
        history.rewind();
        if !history.has_events() {
            return None;
        }

        let budget = self.max_payload
            .saturating_sub(self.history_key.len() + HISTORY_FRAGMENT_OVERHEAD);
        let batch = history.drain(budget, false)?;
        if batch.records.is_empty() {
            return None;
        }
        Some(Fragment {
            body: format!("{}:{}", self.quoted_history_key(), batch.to_json_array()),
            priority: HISTORY_PRIORITY,
            keys: vec![self.history_key.clone()],
            history_end: Some(batch.end),
        })
    }

    fn history_only_payloads(&self, history: &EventHistory) -> Vec<CombinedPayload> {
        let budget = self.max_payload
            .saturating_sub(self.history_key.len() + HISTORY_PAYLOAD_OVERHEAD);
        let key = self.quoted_history_key();
        let mut payloads = Vec::new();
        while history.has_undrained() {
            let Some(batch) = history.drain(budget, false) else {
                break;
            };
            if batch.records.is_empty() {
                continue;
            }
            payloads.push(CombinedPayload {
                data: format!("{{{}:{}}}", key, batch.to_json_array()),
                history_end: Some(batch.end),
            });
        }
        payloads
    }

    /// Removes history delivered by a payload carrying `history_end`.
    pub fn acknowledge(&self, history_end: u64) {
        if let Some(history) = self.history.as_ref()
            && let Err(err) = history.remove_through(history_end)
        {
            warn!("combiner: history removal failed: {:?}", err);
        }
    }
}

impl Default for EventCombiner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests;

//! Ordered callback lists with boolean reductions.
//!
//! Reductions take an invoker closure instead of fixed arguments, so one list type
//! serves every hook signature, including ones with `&mut` out-parameters:
//!
//! ```
//! use sleepy_core::hooks::HookList;
//!
//! let mut hooks: HookList<dyn FnMut(i32) -> bool + Send> = HookList::new();
//! hooks.add(Box::new(|reason: i32| reason > 0));
//! assert!(hooks.while_any_true(false, |hook| hook(3)));
//! ```

use core::fmt;

use crate::{
    host::{SleepConfiguration, SleepResult},
    json::JsonObjectWriter,
};

pub type SetupHook = dyn FnMut() -> bool + Send;
pub type LoopHook = dyn FnMut() -> bool + Send;
pub type DataCaptureHook = dyn FnMut(&mut HookState) -> bool + Send;
/// Receives milliseconds since the cloud session came up.
pub type SleepReadyHook = dyn FnMut(&mut HookState, u64) -> bool + Send;
pub type NoConnectionHook = dyn FnMut(&mut HookState) -> bool + Send;
/// Receives `(connect, no_connect)` conviction slots, both 0..=100.
pub type ShouldConnectHook = dyn FnMut(&mut i32, &mut i32) + Send;
pub type WakeOrBootHook = dyn FnMut(i32) -> bool + Send;
/// Receives `true` for a reset, `false` for sleep.
pub type SleepOrResetHook = dyn FnMut(bool) -> bool + Send;
/// Receives milliseconds since the connect attempt started; `false` gives up.
pub type MaximumTimeToConnectHook = dyn FnMut(u64) -> bool + Send;
pub type SleepConfigurationHook =
    dyn FnMut(&mut SleepConfiguration, &mut crate::cycle::SleepParameters) -> bool + Send;
pub type WakeHook = dyn FnMut(&SleepResult) -> bool + Send;
pub type SettingChangeHook = dyn FnMut(&str) -> bool + Send;
/// Writes a wake-event fragment and sets its priority; priority 0 discards it.
pub type WakeEventHook = dyn FnMut(&mut JsonObjectWriter, &mut i32) -> bool + Send;

/// Callbacks invoked in registration order.
pub struct HookList<F: ?Sized> {
    hooks: Vec<Box<F>>,
}

impl<F: ?Sized> HookList<F> {
    pub const fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    pub fn add(&mut self, hook: Box<F>) {
        self.hooks.push(hook);
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn remove_all(&mut self) {
        self.hooks.clear();
    }

    /// Moves every hook from `other` to the end of this list.
    pub fn append(&mut self, other: &mut Self) {
        self.hooks.append(&mut other.hooks);
    }

    pub fn for_each(&mut self, mut call: impl FnMut(&mut F) -> bool) {
        for hook in self.hooks.iter_mut() {
            let _ = call(&mut **hook);
        }
    }

    /// Like [`HookList::for_each`], newest registration first.
    pub fn for_each_reversed(&mut self, mut call: impl FnMut(&mut F) -> bool) {
        for hook in self.hooks.iter_mut().rev() {
            let _ = call(&mut **hook);
        }
    }

    /// Stops at the first `true`. Returns `default` when nothing returned `true`.
    pub fn until_true(&mut self, default: bool, mut call: impl FnMut(&mut F) -> bool) -> bool {
        for hook in self.hooks.iter_mut() {
            if call(&mut **hook) {
                return true;
            }
        }
        default
    }

    /// Calls every hook; `true` if any returned `true`, otherwise `default`.
    pub fn while_any_true(&mut self, default: bool, mut call: impl FnMut(&mut F) -> bool) -> bool {
        let mut result = default;
        for hook in self.hooks.iter_mut() {
            if call(&mut **hook) {
                result = true;
            }
        }
        result
    }

    /// Stops at the first `false`. Returns `default` when nothing returned `false`.
    pub fn until_false(&mut self, default: bool, mut call: impl FnMut(&mut F) -> bool) -> bool {
        for hook in self.hooks.iter_mut() {
            if !call(&mut **hook) {
                return false;
            }
        }
        default
    }

    /// Calls every hook; `false` if any returned `false`, otherwise `default`.
    pub fn while_any_false(
        &mut self,
        default: bool,
        mut call: impl FnMut(&mut F) -> bool,
    ) -> bool {
        let mut result = default;
        for hook in self.hooks.iter_mut() {
            if !call(&mut **hook) {
                result = false;
            }
        }
        result
    }
}

impl<F: ?Sized> Default for HookList<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: ?Sized> fmt::Debug for HookList<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookList").field("len", &self.hooks.len()).finish()
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum HookStatus {
    /// Has not run yet this cycle.
    #[default]
    Start,
    Running,
    /// Returned `false`; skipped until the next reset.
    DoneFalse,
}

/// Per-registration state for hooks that run across many loop iterations.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct HookState {
    pub status: HookStatus,
    /// Free for the hook's own phase tracking; cleared on reset.
    pub step: u32,
}

impl HookState {
    pub fn is_start(&self) -> bool {
        self.status == HookStatus::Start
    }
}

struct StatefulEntry<F: ?Sized> {
    state: HookState,
    hook: Box<F>,
}

/// Hooks that keep returning `true` until their work for the cycle is done.
pub struct StatefulHookList<F: ?Sized> {
    entries: Vec<StatefulEntry<F>>,
}

impl<F: ?Sized> StatefulHookList<F> {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn add(&mut self, hook: Box<F>) {
        self.entries.push(StatefulEntry {
            state: HookState::default(),
            hook,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn remove_all(&mut self) {
        self.entries.clear();
    }

    pub fn set_start_state(&mut self) {
        for entry in self.entries.iter_mut() {
            entry.state = HookState::default();
        }
    }

    /// Calls every hook that has not yet returned `false`.
    ///
    /// Returns `true` while at least one of them still returns `true`.
    pub fn while_any_true(&mut self, mut call: impl FnMut(&mut F, &mut HookState) -> bool) -> bool {
        let mut any_true = false;
        for entry in self.entries.iter_mut() {
            if entry.state.status == HookStatus::DoneFalse {
                continue;
            }
            if call(&mut *entry.hook, &mut entry.state) {
                if entry.state.status == HookStatus::Start {
                    entry.state.status = HookStatus::Running;
                }
                any_true = true;
            } else {
                entry.state.status = HookStatus::DoneFalse;
            }
        }
        any_true
    }
}

impl<F: ?Sized> Default for StatefulHookList<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: ?Sized> fmt::Debug for StatefulHookList<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let states: Vec<HookState> = self.entries.iter().map(|entry| entry.state).collect();
        f.debug_struct("StatefulHookList")
            .field("states", &states)
            .finish()
    }
}

/// Outcome of a connect/no-connect vote.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ConnectVote {
    pub connect: i32,
    pub no_connect: i32,
}

impl ConnectVote {
    /// Ties go to connecting.
    pub const fn should_connect(self) -> bool {
        self.connect >= self.no_connect
    }

    fn merge(&mut self, connect: i32, no_connect: i32) {
        self.connect = self.connect.max(connect.clamp(0, 100));
        self.no_connect = self.no_connect.max(no_connect.clamp(0, 100));
    }
}

/// Should-connect hooks reduced by maximum conviction on each side.
#[derive(Debug, Default)]
pub struct ShouldConnectHooks {
    hooks: HookList<ShouldConnectHook>,
}

impl ShouldConnectHooks {
    pub const fn new() -> Self {
        Self {
            hooks: HookList::new(),
        }
    }

    pub fn add(&mut self, hook: Box<ShouldConnectHook>) {
        self.hooks.add(hook);
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn vote(&mut self) -> ConnectVote {
        self.vote_with(ConnectVote::default())
    }

    /// Folds every hook's conviction into `initial`.
    pub fn vote_with(&mut self, initial: ConnectVote) -> ConnectVote {
        let mut vote = initial;
        self.hooks.for_each(|hook| {
            let mut connect = 0;
            let mut no_connect = 0;
            hook(&mut connect, &mut no_connect);
            vote.merge(connect, no_connect);
            true
        });
        vote
    }

    pub fn should_connect(&mut self) -> bool {
        self.vote().should_connect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };

    use super::*;

    type Flag = dyn FnMut() -> bool + Send;

    fn counted(calls: &Arc<AtomicU32>, result: bool) -> Box<Flag> {
        let calls = Arc::clone(calls);
        Box::new(move || {
            calls.fetch_add(1, Ordering::Relaxed);
            result
        })
    }

    #[test]
    fn until_true_stops_at_first_true() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut hooks: HookList<Flag> = HookList::new();
        hooks.add(counted(&calls, false));
        hooks.add(counted(&calls, true));
        hooks.add(counted(&calls, true));

        assert!(hooks.until_true(false, |hook| hook()));
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn reductions_return_default_on_empty_list() {
        let mut hooks: HookList<Flag> = HookList::new();
        assert!(hooks.until_true(true, |hook| hook()));
        assert!(!hooks.while_any_true(false, |hook| hook()));
        assert!(hooks.until_false(true, |hook| hook()));
        assert!(!hooks.while_any_false(false, |hook| hook()));
    }

    #[test]
    fn while_any_false_calls_everything() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut hooks: HookList<Flag> = HookList::new();
        hooks.add(counted(&calls, false));
        hooks.add(counted(&calls, true));

        assert!(!hooks.while_any_false(true, |hook| hook()));
        assert_eq!(calls.load(Ordering::Relaxed), 2);

        assert!(!hooks.until_false(true, |hook| hook()));
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn stateful_hooks_are_skipped_after_returning_false() {
        let mut hooks: StatefulHookList<dyn FnMut(&mut HookState) -> bool + Send> =
            StatefulHookList::new();
        hooks.add(Box::new(|state: &mut HookState| {
            state.step += 1;
            state.step < 3
        }));
        hooks.add(Box::new(|_: &mut HookState| false));

        assert!(hooks.while_any_true(|hook, state| hook(state)));
        assert!(hooks.while_any_true(|hook, state| hook(state)));
        assert!(!hooks.while_any_true(|hook, state| hook(state)));
        // Both are DoneFalse now, nothing runs.
        assert!(!hooks.while_any_true(|_, _| panic!("skipped hooks must not run")));

        hooks.set_start_state();
        assert!(hooks.while_any_true(|hook, state| hook(state)));
    }

    #[test]
    fn stateful_status_moves_from_start_to_running() {
        let mut hooks: StatefulHookList<dyn FnMut(&mut HookState) -> bool + Send> =
            StatefulHookList::new();
        hooks.add(Box::new(|state: &mut HookState| {
            assert!(state.is_start() || state.status == HookStatus::Running);
            true
        }));
        assert!(hooks.while_any_true(|hook, state| hook(state)));
        assert!(hooks.while_any_true(|hook, state| hook(state)));
    }

    #[test]
    fn should_connect_uses_maximum_conviction() {
        let mut hooks = ShouldConnectHooks::new();
        hooks.add(Box::new(|connect: &mut i32, _: &mut i32| *connect = 40));
        hooks.add(Box::new(|_: &mut i32, no_connect: &mut i32| *no_connect = 60));
        hooks.add(Box::new(|connect: &mut i32, _: &mut i32| *connect = 20));

        let vote = hooks.vote();
        assert_eq!(vote, ConnectVote { connect: 40, no_connect: 60 });
        assert!(!vote.should_connect());

        hooks.add(Box::new(|connect: &mut i32, _: &mut i32| *connect = 500));
        assert_eq!(hooks.vote().connect, 100);
        assert!(hooks.should_connect());
    }

    #[test]
    fn empty_vote_connects() {
        let mut hooks = ShouldConnectHooks::new();
        assert!(hooks.should_connect());
    }
}

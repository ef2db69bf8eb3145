//! Simulated cellular modem and cloud session.
//!
//! Registration and cloud handshakes complete after configurable latencies measured on
//! the [`VirtualClock`]. Publishes are acknowledged from a worker thread, the way a
//! modem stack reports delivery from its own task.

use std::{
    sync::{
        Arc, mpsc,
        atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering},
    },
    thread,
    time::Duration,
};

use log::{debug, info, warn};
use sleepy_core::host::{PublishCompletion, PublishItem, Radio};

use crate::platform::clock::VirtualClock;

const DEFAULT_REGISTER_MS: u64 = 1_200;
const DEFAULT_CLOUD_HANDSHAKE_MS: u64 = 800;
const DEFAULT_PUBLISH_LATENCY_MS: u64 = 40;

/// Modem lifecycle as seen by logs and the runner.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum CellularState {
    Off = 0,
    Registering = 1,
    Ready = 2,
    CloudConnecting = 3,
    CloudConnected = 4,
}

impl CellularState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Registering,
            2 => Self::Ready,
            3 => Self::CloudConnecting,
            4 => Self::CloudConnected,
            _ => Self::Off,
        }
    }
}

/// Immutable connectivity snapshot.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ConnectivitySnapshot {
    pub state: CellularState,
    pub powered: bool,
    pub registered: bool,
    pub cloud: bool,
    pub revision: u32,
}

impl ConnectivitySnapshot {
    pub const fn off() -> Self {
        Self {
            state: CellularState::Off,
            powered: false,
            registered: false,
            cloud: false,
            revision: 0,
        }
    }
}

/// Lock-free shared connectivity status.
#[derive(Debug)]
pub struct ConnectivityHandle {
    state: AtomicU8,
    powered: AtomicBool,
    registered: AtomicBool,
    cloud: AtomicBool,
    revision: AtomicU32,
}

impl ConnectivityHandle {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(CellularState::Off as u8),
            powered: AtomicBool::new(false),
            registered: AtomicBool::new(false),
            cloud: AtomicBool::new(false),
            revision: AtomicU32::new(0),
        }
    }

    pub fn snapshot(&self) -> ConnectivitySnapshot {
        ConnectivitySnapshot {
            state: CellularState::from_raw(self.state.load(Ordering::Acquire)),
            powered: self.powered.load(Ordering::Acquire),
            registered: self.registered.load(Ordering::Acquire),
            cloud: self.cloud.load(Ordering::Acquire),
            revision: self.revision.load(Ordering::Acquire),
        }
    }

    /// Returns `true` when anything changed.
    pub fn update(&self, powered: bool, registered: bool, session_requested: bool, cloud: bool) -> bool {
        let mut changed = false;
        changed |= self.store_bool(&self.powered, powered);
        changed |= self.store_bool(&self.registered, registered);
        changed |= self.store_bool(&self.cloud, cloud);
        changed |= self.store_state(Self::state_for(powered, registered, session_requested, cloud));
        if changed {
            self.bump_revision();
        }
        changed
    }

    fn state_for(powered: bool, registered: bool, session_requested: bool, cloud: bool) -> CellularState {
        if !powered {
            CellularState::Off
        } else if !registered {
            CellularState::Registering
        } else if cloud {
            CellularState::CloudConnected
        } else if session_requested {
            CellularState::CloudConnecting
        } else {
            CellularState::Ready
        }
    }

    fn store_state(&self, next: CellularState) -> bool {
        self.state.swap(next as u8, Ordering::AcqRel) != next as u8
    }

    fn store_bool(&self, cell: &AtomicBool, next: bool) -> bool {
        cell.swap(next, Ordering::AcqRel) != next
    }

    fn bump_revision(&self) {
        self.revision.fetch_add(1, Ordering::AcqRel);
    }
}

impl Default for ConnectivityHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CellularConfig {
    pub register_ms: u64,
    pub cloud_handshake_ms: u64,
    /// Real time the worker waits before acknowledging a publish.
    pub publish_latency_ms: u64,
    /// Every n-th publish is reported as failed.
    pub fail_every_nth_publish: Option<u32>,
}

impl Default for CellularConfig {
    fn default() -> Self {
        Self {
            register_ms: DEFAULT_REGISTER_MS,
            cloud_handshake_ms: DEFAULT_CLOUD_HANDSHAKE_MS,
            publish_latency_ms: DEFAULT_PUBLISH_LATENCY_MS,
            fail_every_nth_publish: None,
        }
    }
}

impl CellularConfig {
    pub fn with_register_ms(mut self, ms: u64) -> Self {
        self.register_ms = ms;
        self
    }

    pub fn with_cloud_handshake_ms(mut self, ms: u64) -> Self {
        self.cloud_handshake_ms = ms;
        self
    }

    pub fn with_publish_latency_ms(mut self, ms: u64) -> Self {
        self.publish_latency_ms = ms;
        self
    }

    pub fn with_fail_every_nth_publish(mut self, n: u32) -> Self {
        self.fail_every_nth_publish = (n > 0).then_some(n);
        self
    }
}

struct PublishJob {
    name: String,
    bytes: usize,
    ok: bool,
    completion: PublishCompletion,
}

struct PublishWorker {
    sender: Option<mpsc::Sender<PublishJob>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl PublishWorker {
    fn spawn(latency: Duration) -> Option<Self> {
        let (sender, receiver) = mpsc::channel::<PublishJob>();
        let spawned = thread::Builder::new()
            .name("radio-publish".to_owned())
            .spawn(move || {
                for job in receiver {
                    thread::sleep(latency);
                    debug!(
                        "radio: {} bytes to {} acknowledged ok={}",
                        job.bytes, job.name, job.ok
                    );
                    job.completion.complete(job.ok);
                }
            });
        match spawned {
            Ok(thread) => Some(Self {
                sender: Some(sender),
                thread: Some(thread),
            }),
            Err(err) => {
                warn!("radio: publish worker unavailable: {}", err);
                None
            }
        }
    }

    /// Hands the job back when the worker has gone away.
    fn submit(&self, job: PublishJob) -> Result<(), PublishJob> {
        match self.sender.as_ref() {
            Some(sender) => sender.send(job).map_err(|err| err.0),
            None => Err(job),
        }
    }
}

impl Drop for PublishWorker {
    fn drop(&mut self) {
        self.sender = None;
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!("radio: publish worker panicked");
        }
    }
}

pub struct SimulatedCellular {
    config: CellularConfig,
    clock: Arc<VirtualClock>,
    handle: Arc<ConnectivityHandle>,
    powered_at: Option<u64>,
    attached: bool,
    session_at: Option<u64>,
    publishes: u32,
    worker: Option<PublishWorker>,
}

impl SimulatedCellular {
    pub fn new(config: CellularConfig, clock: Arc<VirtualClock>) -> Self {
        Self {
            config,
            clock,
            handle: Arc::new(ConnectivityHandle::new()),
            powered_at: None,
            attached: false,
            session_at: None,
            publishes: 0,
            worker: PublishWorker::spawn(Duration::from_millis(config.publish_latency_ms)),
        }
    }

    pub fn connectivity(&self) -> Arc<ConnectivityHandle> {
        Arc::clone(&self.handle)
    }

    /// Recomputes the lifecycle from elapsed virtual time.
    pub fn refresh(&self) -> ConnectivitySnapshot {
        let now = self.clock.millis();
        let registered_at = self
            .powered_at
            .filter(|_| self.attached)
            .map(|powered_at| powered_at.saturating_add(self.config.register_ms));
        let registered = registered_at.is_some_and(|at| now >= at);
        let cloud = match (registered_at, self.session_at) {
            (Some(registered_at), Some(session_at)) if registered => {
                now >= registered_at
                    .max(session_at)
                    .saturating_add(self.config.cloud_handshake_ms)
            }
            _ => false,
        };

        let powered = self.powered_at.is_some();
        if self
            .handle
            .update(powered, registered, self.session_at.is_some(), cloud)
        {
            let snapshot = self.handle.snapshot();
            info!("radio: {:?} rev={}", snapshot.state, snapshot.revision);
        }
        if cloud && !self.clock.is_valid() {
            self.clock.set_valid(true);
        }
        self.handle.snapshot()
    }
}

impl Radio for SimulatedCellular {
    fn connect(&mut self) {
        let now = self.clock.millis();
        if self.powered_at.is_none() {
            self.powered_at = Some(now);
        }
        self.attached = true;
        self.session_at = Some(now);
        debug!("radio: connect requested at {} ms", now);
        self.refresh();
    }

    fn cloud_connected(&self) -> bool {
        self.refresh().cloud
    }

    fn disconnect(&mut self, graceful_timeout_ms: u32) {
        debug!("radio: cloud disconnect, graceful {} ms", graceful_timeout_ms);
        self.session_at = None;
        self.refresh();
    }

    fn disconnected(&self) -> bool {
        !self.refresh().cloud
    }

    fn network_disconnect(&mut self) {
        self.attached = false;
        self.session_at = None;
        self.refresh();
    }

    fn ready(&self) -> bool {
        self.refresh().registered
    }

    fn off(&mut self) {
        self.powered_at = None;
        self.attached = false;
        self.session_at = None;
        self.refresh();
    }

    fn is_off(&self) -> bool {
        !self.refresh().powered
    }

    fn publish(&mut self, item: &PublishItem, completion: PublishCompletion) -> bool {
        if !self.refresh().cloud {
            warn!("radio: publish to {} refused, no cloud session", item.name);
            return false;
        }

        self.publishes = self.publishes.wrapping_add(1);
        let ok = self
            .config
            .fail_every_nth_publish
            .is_none_or(|n| !self.publishes.is_multiple_of(n));
        let job = PublishJob {
            name: item.name.as_str().to_owned(),
            bytes: item.data.len(),
            ok,
            completion,
        };
        let unsent = match self.worker.as_ref() {
            Some(worker) => worker.submit(job).err(),
            None => Some(job),
        };
        if let Some(job) = unsent {
            job.completion.complete(job.ok);
        }
        true
    }
}

//! Phantom thread bookkeeping and abort handling.

use crate::coord::{join, CoordinationService, CreateMode, WatchEvent};
use crate::pilot::{PilotState, PilotStatus};
use crate::task::PhantomTask;
use crate::{CoordinationError, Result};
use crossbeam_channel::{bounded, select, Receiver, Sender};
use dashmap::DashMap;
use parking_lot::Mutex;
use pilot_config::{
    log_registry_debug, log_registry_error, log_registry_info, log_registry_warn, Config,
};
use pilot_context::{self as context, ExecutionMode, PhantomThread, PilotId, Resumable};
use pilot_fs::ShadowWorkspace;
use pilot_sync::{AbortHandle, AbortRequest};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

// ============================================================================
// Settings
// ============================================================================

#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// Parent of the per-pilot nodes
    pub pilot_path: String,
    /// Parent of the per-pilot failure markers
    pub result_path: String,
    /// Prefix of phantom thread node names
    pub host_identifier: String,
    pub wait_timeout: Duration,
    pub poll_interval: Duration,
    /// How long cleanup waits after interrupting a pilot's threads
    pub interrupt_grace: Duration,
    pub id_allocation_retries: u32,
}

impl From<&Config> for RegistrySettings {
    fn from(config: &Config) -> Self {
        Self {
            pilot_path: config.coordination.pilot_path.clone(),
            result_path: config.coordination.result_path.clone(),
            host_identifier: config
                .coordination
                .host_identifier
                .clone()
                .unwrap_or_else(context::host_identifier),
            wait_timeout: config.pilot.wait_timeout(),
            poll_interval: config.pilot.poll_interval(),
            interrupt_grace: config.pilot.interrupt_grace(),
            id_allocation_retries: config.pilot.id_allocation_retries,
        }
    }
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

// ============================================================================
// Retired pilots
// ============================================================================

/// Cleaned pilots remembered so late registrants are still interrupted.
const RETIRED_CAPACITY: usize = 1024;

/// Cleaned pilots, oldest first. Past [`RETIRED_CAPACITY`] the oldest is
/// forgotten.
#[derive(Debug, Default)]
struct Retired {
    order: VecDeque<PilotId>,
    members: HashSet<PilotId>,
}

impl Retired {
    fn contains(&self, pilot: PilotId) -> bool {
        self.members.contains(&pilot)
    }

    /// `false` if `pilot` was already retired.
    fn insert(&mut self, pilot: PilotId) -> bool {
        if !self.members.insert(pilot) {
            return false;
        }
        self.order.push_back(pilot);
        if self.order.len() > RETIRED_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
        true
    }
}

type PilotEndHook = Arc<dyn Fn(PilotId) + Send + Sync>;

// ============================================================================
// Registry
// ============================================================================

/// Local record of every phantom thread, per pilot, mirrored into the
/// coordination service as ephemeral nodes.
///
/// Construct one per process with [`PhantomThreadRegistry::new`] and share
/// the returned `Arc`. Locks get an [`AbortHandle`] from
/// [`abort_handle`](Self::abort_handle); requests sent through it are
/// handled on the registry's abort worker thread.
pub struct PhantomThreadRegistry {
    settings: RegistrySettings,
    coordinator: Arc<dyn CoordinationService>,
    threads: DashMap<PilotId, Vec<PhantomThread>>,
    tasks: DashMap<PilotId, Vec<PhantomTask>>,
    /// Pilots that have not been cleaned yet
    states: DashMap<PilotId, PilotState>,
    retired: Mutex<Retired>,
    end_hooks: Mutex<Vec<PilotEndHook>>,
    /// Highest id handed out, used when the service cannot allocate
    local_ids: AtomicU64,
    abort: AbortHandle,
    stop: Mutex<Option<Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for PhantomThreadRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhantomThreadRegistry")
            .field("settings", &self.settings)
            .field("pilots", &self.states.len())
            .field("tracked", &self.threads.len())
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

impl PhantomThreadRegistry {
    /// Build the registry, make sure the pilot and result paths exist,
    /// install the pilot watch and start the abort worker.
    ///
    /// An unreachable coordination service is not fatal: the registry
    /// starts in local-only mode and logs a warning.
    pub fn new(
        coordinator: Arc<dyn CoordinationService>,
        settings: RegistrySettings,
    ) -> Result<Arc<Self>> {
        let (abort, requests) = AbortHandle::channel();
        let (stop_tx, stop_rx) = bounded::<()>(0);

        let registry = Arc::new(Self {
            settings,
            coordinator,
            threads: DashMap::new(),
            tasks: DashMap::new(),
            states: DashMap::new(),
            retired: Mutex::new(Retired::default()),
            end_hooks: Mutex::new(Vec::new()),
            local_ids: AtomicU64::new(0),
            abort,
            stop: Mutex::new(Some(stop_tx)),
            worker: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        });

        registry.prepare_namespace();

        let weak = Arc::downgrade(&registry);
        let worker = thread::Builder::new()
            .name("pilot-abort".into())
            .spawn(move || abort_worker(weak, requests, stop_rx))?;
        *registry.worker.lock() = Some(worker);

        Ok(registry)
    }

    pub fn from_config(
        coordinator: Arc<dyn CoordinationService>,
        config: &Config,
    ) -> Result<Arc<Self>> {
        Self::new(coordinator, RegistrySettings::from(config))
    }

    fn prepare_namespace(self: &Arc<Self>) {
        let setup = || -> std::result::Result<(), CoordinationError> {
            self.coordinator.create_recursive(&self.settings.pilot_path)?;
            self.coordinator.create_recursive(&self.settings.result_path)?;
            let weak = Arc::downgrade(self);
            self.coordinator.watch_children(
                &self.settings.pilot_path,
                Box::new(move |event| {
                    if let Some(registry) = weak.upgrade() {
                        registry.on_pilot_event(event);
                    }
                }),
            )
        };
        if let Err(e) = setup() {
            log_registry_warn!(
                "Coordination service unavailable, registry runs local-only",
                error = %e,
                path = %self.settings.pilot_path
            );
        }
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    pub fn coordinator(&self) -> &Arc<dyn CoordinationService> {
        &self.coordinator
    }

    /// Handle for locks and conditions to request aborts through.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn pilot_node(&self, pilot: PilotId) -> String {
        join(&self.settings.pilot_path, &pilot.to_string())
    }

    pub fn result_node(&self, pilot: PilotId) -> String {
        join(&self.settings.result_path, &pilot.to_string())
    }

    fn thread_node(&self, pilot: PilotId, thread: &PhantomThread) -> String {
        join(
            &self.pilot_node(pilot),
            &format!("{}-{}", self.settings.host_identifier, thread.id()),
        )
    }

    pub fn pilot_state(&self, pilot: PilotId) -> Option<PilotState> {
        let retired = self.retired.lock();
        if retired.contains(pilot) {
            return Some(PilotState::Cleaned);
        }
        self.states.get(&pilot).map(|state| *state)
    }

    /// Phantom threads currently tracked for `pilot`.
    pub fn threads_of(&self, pilot: PilotId) -> Vec<PhantomThread> {
        self.threads
            .get(&pilot)
            .map(|threads| threads.clone())
            .unwrap_or_default()
    }

    pub fn is_tracked(&self, pilot: PilotId) -> bool {
        self.threads.contains_key(&pilot)
    }

    /// Scheduled tasks of `pilot` that have not been cancelled by cleanup.
    pub fn tasks_of(&self, pilot: PilotId) -> Vec<PhantomTask> {
        self.tasks
            .get(&pilot)
            .map(|tasks| tasks.clone())
            .unwrap_or_default()
    }

    fn set_state(&self, pilot: PilotId, running: usize) -> PilotState {
        let retired = self.retired.lock();
        if retired.contains(pilot) {
            return PilotState::Cleaned;
        }
        let mut state = self.states.entry(pilot).or_insert(PilotState::Allocated);
        *state = state.with_threads(running);
        *state
    }

    /// Move `pilot` to the retired set. `true` the first time.
    fn mark_cleaned(&self, pilot: PilotId) -> bool {
        let mut retired = self.retired.lock();
        self.states.remove(&pilot);
        retired.insert(pilot)
    }

    /// Run `hook` once for every pilot, the first time it is cleaned up.
    pub fn on_pilot_end(&self, hook: impl Fn(PilotId) + Send + Sync + 'static) {
        self.end_hooks.lock().push(Arc::new(hook));
    }

    /// Discard a pilot's shadow files when the pilot ends.
    pub fn attach_shadow_workspace(&self, workspace: Arc<ShadowWorkspace>) {
        self.on_pilot_end(move |pilot| match workspace.end_pilot(pilot) {
            Ok(discarded) => {
                log_registry_debug!("Shadow state released", pilot = %pilot, discarded);
            }
            Err(e) => {
                log_registry_warn!("Shadow state not released", error = %e, pilot = %pilot);
            }
        });
    }

    fn run_end_hooks(&self, pilot: PilotId) {
        let hooks = self.end_hooks.lock().clone();
        for hook in hooks {
            hook(pilot);
        }
    }

    // ------------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------------

    /// Track `thread` under `pilot` and publish its ephemeral node.
    ///
    /// A thread registering into a pilot that is already cleaned is
    /// interrupted straight away.
    pub fn register_phantom_thread(&self, pilot: PilotId, thread: PhantomThread) {
        if self.pilot_state(pilot).is_some_and(PilotState::is_terminal) {
            log_registry_debug!(
                "Pilot already cleaned, interrupting",
                pilot = %pilot,
                thread = thread.id()
            );
            thread.interrupt();
            return;
        }

        let node = self.thread_node(pilot, &thread);
        let published = self
            .coordinator
            .create_recursive(&self.pilot_node(pilot))
            .and_then(|()| self.coordinator.create(&node, CreateMode::Ephemeral));
        match published {
            Ok(()) | Err(CoordinationError::NodeExists(_)) => {}
            Err(e) => log_registry_warn!(
                "Phantom thread not published, tracking locally",
                error = %e,
                node = %node
            ),
        }

        let running = {
            let mut threads = self.threads.entry(pilot).or_default();
            if !threads.contains(&thread) {
                threads.push(thread.clone());
            }
            threads.iter().filter(|t| t.is_alive()).count()
        };
        let state = self.set_state(pilot, running);
        log_registry_debug!(
            "Phantom thread registered",
            pilot = %pilot,
            thread = thread.id(),
            state = %state
        );
    }

    /// Forget `thread` and remove its ephemeral node.
    pub fn deregister_phantom_thread(&self, pilot: PilotId, thread: &PhantomThread) {
        let node = self.thread_node(pilot, thread);
        match self.coordinator.delete(&node) {
            Ok(()) | Err(CoordinationError::NoNode(_)) => {}
            Err(e) => log_registry_warn!(
                "Phantom thread node not removed",
                error = %e,
                node = %node
            ),
        }

        let running = match self.threads.get_mut(&pilot) {
            Some(mut threads) => {
                threads.retain(|t| t != thread);
                threads.iter().filter(|t| t.is_alive()).count()
            }
            None => 0,
        };
        self.threads.remove_if(&pilot, |_, threads| threads.is_empty());
        let state = self.set_state(pilot, running);
        log_registry_debug!(
            "Phantom thread deregistered",
            pilot = %pilot,
            thread = thread.id(),
            state = %state
        );
    }

    /// Interrupt every local thread of `pilot`, give them a moment to
    /// notice, then drop the pilot's entry. Scheduled tasks are cancelled
    /// and, the first time, the pilot-end hooks run.
    pub fn cleanup_phantom_threads(&self, pilot: PilotId) {
        let first = self.mark_cleaned(pilot);
        let cancelled = self.cancel_tasks(pilot);
        let threads = self.threads_of(pilot);

        let mut interrupted = 0;
        for thread in &threads {
            if thread.is_alive() {
                thread.interrupt();
                interrupted += 1;
            } else {
                log_registry_debug!(
                    "Phantom thread already finished",
                    pilot = %pilot,
                    thread = thread.id()
                );
            }
        }
        if interrupted > 0 {
            thread::sleep(self.settings.interrupt_grace);
        }

        self.threads.remove(&pilot);
        if first {
            self.run_end_hooks(pilot);
        }
        log_registry_info!(
            "Phantom threads cleaned up",
            pilot = %pilot,
            interrupted,
            cancelled,
            tracked = threads.len()
        );
    }

    fn cancel_tasks(&self, pilot: PilotId) -> usize {
        self.tasks
            .remove(&pilot)
            .map_or(0, |(_, tasks)| tasks.iter().filter(|task| task.cancel()).count())
    }

    fn track_task(&self, pilot: PilotId, task: PhantomTask) -> PhantomTask {
        {
            let mut tasks = self.tasks.entry(pilot).or_default();
            tasks.retain(|t| !t.is_finished());
            tasks.push(task.clone());
        }
        if self.pilot_state(pilot).is_some_and(PilotState::is_terminal) {
            self.cancel_tasks(pilot);
        }
        task
    }

    // ------------------------------------------------------------------------
    // Pilot lifecycle
    // ------------------------------------------------------------------------

    /// Reserve a fresh pilot id by creating its node under the pilot path.
    ///
    /// Scans existing numeric children and claims the first free id above
    /// the maximum. Falls back to a local counter if the service cannot
    /// be used.
    pub fn allocate_pilot_id(&self) -> PilotId {
        let pilot = match self.claim_pilot_id() {
            Ok(pilot) => pilot,
            Err(e) => {
                let pilot = PilotId(self.local_ids.fetch_add(1, Ordering::SeqCst) + 1);
                log_registry_warn!("Pilot id allocated locally", error = %e, pilot = %pilot);
                pilot
            }
        };
        self.local_ids.fetch_max(pilot.get(), Ordering::SeqCst);
        self.states.insert(pilot, PilotState::Allocated);
        log_registry_info!("Pilot id allocated", pilot = %pilot);
        pilot
    }

    fn claim_pilot_id(&self) -> std::result::Result<PilotId, CoordinationError> {
        let root = &self.settings.pilot_path;
        self.coordinator.create_recursive(root)?;

        let mut last = CoordinationError::NodeExists(root.clone());
        let mut attempts = 0;
        while attempts < self.settings.id_allocation_retries {
            let max = self
                .coordinator
                .get_children(root)?
                .iter()
                .filter_map(|name| name.parse::<u64>().ok())
                .max()
                .unwrap_or(0)
                .max(self.local_ids.load(Ordering::SeqCst));
            let candidate = PilotId(max + 1);
            match self
                .coordinator
                .create(&self.pilot_node(candidate), CreateMode::Persistent)
            {
                Ok(()) => return Ok(candidate),
                Err(e @ CoordinationError::NodeExists(_)) => {
                    log_registry_debug!("Pilot id taken, retrying", pilot = %candidate);
                    last = e;
                }
                Err(e) => return Err(e),
            }
            attempts += 1;
        }
        Err(last)
    }

    /// Record that `pilot` failed. [`wait_until_pilot_finished`] reports
    /// [`PilotStatus::Failure`] for it.
    ///
    /// [`wait_until_pilot_finished`]: Self::wait_until_pilot_finished
    pub fn report_failure(&self, pilot: PilotId) -> Result<()> {
        self.coordinator.create_recursive(&self.settings.result_path)?;
        match self
            .coordinator
            .create(&self.result_node(pilot), CreateMode::Persistent)
        {
            Ok(()) | Err(CoordinationError::NodeExists(_)) => {
                log_registry_info!("Pilot failure recorded", pilot = %pilot);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Poll until the pilot node has no phantom thread children left (or
    /// is gone, or `timeout` passes), then delete the pilot and result
    /// nodes and report the outcome.
    ///
    /// Interrupting the waiting thread ends the wait with
    /// [`RegistryError::Interrupted`](crate::RegistryError::Interrupted).
    pub fn wait_until_pilot_finished(&self, pilot: PilotId, timeout: Duration) -> Result<PilotStatus> {
        let node = self.pilot_node(pilot);
        let started = Instant::now();
        let mut timed_out = false;

        loop {
            match self.coordinator.get_children(&node) {
                Ok(children) if children.is_empty() => break,
                Ok(children) => {
                    log_registry_debug!(
                        "Pilot still running",
                        pilot = %pilot,
                        remaining = children.len()
                    );
                }
                Err(CoordinationError::NoNode(_)) => break,
                Err(e) => {
                    log_registry_warn!("Cannot poll pilot node", error = %e, pilot = %pilot);
                }
            }
            if started.elapsed() >= timeout {
                timed_out = true;
                break;
            }
            context::sleep_interruptibly(self.settings.poll_interval)?;
        }

        let failed = self
            .coordinator
            .exists(&self.result_node(pilot))
            .unwrap_or(false);
        // Retire before the node goes away so the watch has nothing left
        // to clean up.
        self.cleanup_phantom_threads(pilot);
        for path in [node, self.result_node(pilot)] {
            if let Err(e) = self.coordinator.delete_recursive(&path) {
                log_registry_error!("Failed to remove pilot node", error = %e, node = %path);
            }
        }

        let status = if timed_out {
            PilotStatus::Timeout
        } else if failed {
            PilotStatus::Failure
        } else {
            PilotStatus::Success
        };
        log_registry_info!(
            "Pilot finished",
            pilot = %pilot,
            status = %status,
            waited_ms = started.elapsed().as_millis() as u64
        );
        Ok(status)
    }

    /// Abort `pilot` everywhere: interrupt local threads, record the
    /// failure and delete the pilot node so other hosts follow.
    pub fn abort_pilot(&self, pilot: PilotId) {
        log_registry_info!("Aborting pilot", pilot = %pilot);
        self.cleanup_phantom_threads(pilot);
        if let Err(e) = self.report_failure(pilot) {
            log_registry_warn!("Failure not recorded", error = %e, pilot = %pilot);
        }
        if let Err(e) = self.coordinator.delete_recursive(&self.pilot_node(pilot)) {
            log_registry_warn!("Pilot node not removed", error = %e, pilot = %pilot);
        }
    }

    /// Run `work` on a new phantom thread of `pilot`.
    ///
    /// The thread enters dry-run mode, registers itself, runs `work` and
    /// deregisters when it returns or unwinds.
    pub fn spawn_phantom<R: Resumable>(
        self: &Arc<Self>,
        pilot: PilotId,
        name: impl Into<String>,
        work: R,
    ) -> Result<JoinHandle<()>> {
        let mode = Arc::new(ExecutionMode::dry_run(pilot, self.settings.host_identifier.clone()));
        let entry = Box::new(work).wrap_entry_point(mode);
        let registry = Arc::clone(self);

        let (registered_tx, registered_rx) = bounded::<()>(1);

        let handle = thread::Builder::new().name(name.into()).spawn(move || {
            let me = PhantomThread::current();
            registry.register_phantom_thread(pilot, me.clone());
            let _registration = Registration {
                registry,
                pilot,
                thread: me,
            };
            let _ = registered_tx.send(());
            entry();
        })?;
        // The thread is registered before this returns.
        let _ = registered_rx.recv();
        Ok(handle)
    }

    /// Run `work` once on a phantom thread of `pilot` after `delay`.
    ///
    /// The task counts as one of the pilot's threads while it waits.
    /// Cleaning the pilot up before the delay passes skips `work`.
    pub fn schedule_phantom<F>(
        self: &Arc<Self>,
        pilot: PilotId,
        name: impl Into<String>,
        delay: Duration,
        work: F,
    ) -> Result<PhantomTask>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        let task = self.track_task(pilot, PhantomTask::new(name.clone()));
        let runner = task.clone();
        let spawned = self.spawn_phantom(pilot, name, move || {
            let _finished = runner.attach();
            if context::sleep_interruptibly(delay).is_ok() && !runner.is_cancelled() {
                work();
                runner.record_run();
            }
        });
        if let Err(e) = spawned {
            task.cancel();
            return Err(e);
        }
        log_registry_debug!(
            "Phantom task scheduled",
            pilot = %pilot,
            task = %task.name(),
            delay_ms = delay.as_millis() as u64
        );
        Ok(task)
    }

    /// Run `work` on a phantom thread of `pilot` every `period`, first
    /// after `initial_delay`, until the task is cancelled or the pilot is
    /// cleaned up. A periodic task keeps the pilot running.
    pub fn schedule_phantom_periodic<F>(
        self: &Arc<Self>,
        pilot: PilotId,
        name: impl Into<String>,
        initial_delay: Duration,
        period: Duration,
        mut work: F,
    ) -> Result<PhantomTask>
    where
        F: FnMut() + Send + 'static,
    {
        let name = name.into();
        let task = self.track_task(pilot, PhantomTask::new(name.clone()));
        let runner = task.clone();
        let spawned = self.spawn_phantom(pilot, name, move || {
            let _finished = runner.attach();
            let mut delay = initial_delay;
            while context::sleep_interruptibly(delay).is_ok() && !runner.is_cancelled() {
                work();
                runner.record_run();
                delay = period;
            }
        });
        if let Err(e) = spawned {
            task.cancel();
            return Err(e);
        }
        log_registry_debug!(
            "Periodic phantom task scheduled",
            pilot = %pilot,
            task = %task.name(),
            period_ms = period.as_millis() as u64
        );
        Ok(task)
    }

    /// Allocate a pilot id and start `entry` as the pilot's root phantom
    /// thread. The thread is detached; use
    /// [`wait_until_pilot_finished`](Self::wait_until_pilot_finished) to
    /// wait for the whole pilot.
    pub fn start_pilot<R: Resumable>(self: &Arc<Self>, entry: R) -> Result<PilotId> {
        let pilot = self.allocate_pilot_id();
        self.spawn_phantom(pilot, format!("pilot-{pilot}"), entry)?;
        log_registry_info!("Pilot started", pilot = %pilot);
        Ok(pilot)
    }

    /// Stop the abort worker. Requests sent afterwards are dropped.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop.lock().take();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
        log_registry_debug!("Registry shut down");
    }

    fn on_pilot_event(&self, event: WatchEvent) {
        let WatchEvent::NodeDeleted(_) = &event else {
            return;
        };
        match event.node_name().parse::<PilotId>() {
            Ok(pilot) => {
                let active = self.pilot_state(pilot).is_some_and(|s| !s.is_terminal());
                if active || self.is_tracked(pilot) {
                    log_registry_info!("Pilot node deleted", pilot = %pilot);
                    self.cleanup_phantom_threads(pilot);
                }
            }
            Err(_) => {
                log_registry_debug!("Ignoring non-numeric pilot node", node = %event.path());
            }
        }
    }

    fn handle_abort(&self, request: AbortRequest) {
        if self.shut_down.load(Ordering::Acquire) {
            return;
        }
        log_registry_warn!("Abort requested", pilot = ?request.pilot, reason = %request.reason);
        match request.pilot {
            Some(pilot) => self.abort_pilot(pilot),
            None => {
                let active: Vec<PilotId> = self
                    .states
                    .iter()
                    .filter(|entry| !entry.value().is_terminal())
                    .map(|entry| *entry.key())
                    .collect();
                for pilot in active {
                    self.abort_pilot(pilot);
                }
            }
        }
    }
}

/// Deregisters on drop, so a panicking phantom thread is still removed.
struct Registration {
    registry: Arc<PhantomThreadRegistry>,
    pilot: PilotId,
    thread: PhantomThread,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry
            .deregister_phantom_thread(self.pilot, &self.thread);
    }
}

fn abort_worker(
    registry: Weak<PhantomThreadRegistry>,
    requests: Receiver<AbortRequest>,
    stop: Receiver<()>,
) {
    loop {
        select! {
            recv(requests) -> request => {
                let Ok(request) = request else { break };
                let Some(registry) = registry.upgrade() else { break };
                registry.handle_abort(request);
            },
            recv(stop) -> _ => break,
        }
    }
    log_registry_debug!("Abort worker stopped");
}

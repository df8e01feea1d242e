// src/runtime/thread_manager.rs
//! Thread lifecycle management for agents
//!
//! Every agent thread runs inside a guard that:
//! - Attaches the thread to its execution context before any agent code runs,
//!   and before the spawning call returns
//! - Catches panics at the thread boundary, so agent code can never unwind into the host
//! - Detaches the thread and releases its slot in the group on exit
//!
//! Stopping is cooperative: a stop request cancels the agent's token and halts
//! its turn gate. A thread that ignores the request for longer than the grace
//! period is abandoned. It is never killed, because killing a thread that
//! holds a lock can wedge the host. Instead its context is torn down, so every
//! later sensitive call from it is denied, and the agent's thread group is
//! replaced by a fresh one.

use crate::observability::metrics;
use crate::runtime::agent_runtime::AgentRuntime;
use crate::runtime::host::ThreadRegistry;
use crate::runtime::identity::AgentId;
use crate::utils::errors::{EngineError, Result};
use crossbeam_channel::{bounded, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Unwind payload that ends an agent thread without counting as a crash
#[derive(Debug, Clone)]
pub struct ThreadTermination {
    pub reason: String,
}

/// Identifies one generation of an agent's thread group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ThreadGroupId {
    pub agent: AgentId,
    pub generation: u32,
}

impl fmt::Display for ThreadGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/group-{}", self.agent, self.generation)
    }
}

struct TrackedThread {
    name: String,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct GroupState {
    /// Reserved slots; a slot is taken before the thread is spawned
    live: usize,
    threads: Vec<TrackedThread>,
}

/// The set of threads of one execution context
pub struct ThreadGroup {
    id: ThreadGroupId,
    agent: String,
    cap: usize,
    state: Mutex<GroupState>,
}

impl fmt::Debug for ThreadGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadGroup")
            .field("id", &self.id)
            .field("cap", &self.cap)
            .field("live", &self.live_count())
            .finish()
    }
}

impl ThreadGroup {
    pub fn new(agent: AgentId, name: &str, generation: u32, cap: usize) -> Self {
        Self {
            id: ThreadGroupId { agent, generation },
            agent: name.to_string(),
            cap,
            state: Mutex::new(GroupState::default()),
        }
    }

    pub fn id(&self) -> ThreadGroupId {
        self.id
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Reserved slots, including threads that are starting up
    pub fn live_count(&self) -> usize {
        self.state.lock().live
    }

    /// Take a slot if the cap allows. Check and increment happen under the
    /// group lock, so concurrent spawns from several threads of the same
    /// agent cannot overshoot.
    pub fn reserve(self: &Arc<Self>, runtime: &Arc<AgentRuntime>) -> Option<ThreadLease> {
        let live = {
            let mut state = self.state.lock();
            if state.live >= self.cap {
                return None;
            }
            state.live += 1;
            state.live
        };
        runtime.quota().record_live_threads(live);
        metrics::record_live_threads(&self.agent, live);
        Some(ThreadLease {
            group: Arc::clone(self),
            runtime: Arc::clone(runtime),
        })
    }

    fn release(&self) -> usize {
        let mut state = self.state.lock();
        state.live = state.live.saturating_sub(1);
        state.live
    }

    fn track(&self, name: String, handle: JoinHandle<()>) {
        let mut state = self.state.lock();
        state.threads.retain(|t| !t.handle.is_finished());
        state.threads.push(TrackedThread { name, handle });
    }

    /// Whether the thread `id` of this group is still running
    pub fn is_running(&self, id: ThreadId) -> bool {
        self.state
            .lock()
            .threads
            .iter()
            .any(|t| t.handle.thread().id() == id && !t.handle.is_finished())
    }

    /// Threads that have not finished yet
    pub fn running_threads(&self) -> Vec<String> {
        self.state
            .lock()
            .threads
            .iter()
            .filter(|t| !t.handle.is_finished())
            .map(|t| t.name.clone())
            .collect()
    }

    /// Detach every unfinished thread; returns their names
    fn abandon(&self) -> Vec<String> {
        let mut state = self.state.lock();
        let threads = std::mem::take(&mut state.threads);
        let mut abandoned = Vec::new();
        for thread in threads {
            if thread.handle.is_finished() {
                let _ = thread.handle.join();
            } else {
                // Dropping the handle detaches the thread
                abandoned.push(thread.name);
            }
        }
        abandoned
    }
}

/// A reserved thread slot, released when dropped
pub struct ThreadLease {
    group: Arc<ThreadGroup>,
    runtime: Arc<AgentRuntime>,
}

impl Drop for ThreadLease {
    fn drop(&mut self) {
        let live = self.group.release();
        self.runtime.quota().record_live_threads(live);
        metrics::record_live_threads(&self.group.agent, live);
    }
}

/// Liveness of an agent's threads as seen at the end of a turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Liveness {
    Running,

    /// All threads have exited
    Exited,

    /// Stop requested this many turns ago, threads still running
    Stopping { turns: u64 },

    /// Still running past the grace period
    Undead { threads: Vec<String> },
}

pub struct ThreadLifecycleManager {
    registry: Arc<ThreadRegistry>,
    stop_wait: Duration,
    grace_turns: u32,
    /// Forced stops run one at a time
    force_lock: Mutex<()>,
}

impl ThreadLifecycleManager {
    pub fn new(registry: Arc<ThreadRegistry>, stop_wait: Duration, grace_turns: u32) -> Self {
        Self {
            registry,
            stop_wait,
            grace_turns,
            force_lock: Mutex::new(()),
        }
    }

    /// Start the agent's primary thread
    pub fn spawn_primary<F>(&self, runtime: &Arc<AgentRuntime>, body: F) -> Result<ThreadId>
    where
        F: FnOnce() + Send + 'static,
    {
        let lease = runtime.group().reserve(runtime).ok_or_else(|| {
            EngineError::InternalFault(format!(
                "no thread slot left for the primary thread of {}",
                runtime.name()
            ))
        })?;
        let name = format!("{} (round {})", runtime.name(), runtime.round());
        self.spawn_with_lease(runtime, lease, name, body)
    }

    /// Start a thread in an already reserved slot
    pub fn spawn_with_lease<F>(
        &self,
        runtime: &Arc<AgentRuntime>,
        lease: ThreadLease,
        name: String,
        body: F,
    ) -> Result<ThreadId>
    where
        F: FnOnce() + Send + 'static,
    {
        let group = Arc::clone(&lease.group);
        let registry = Arc::clone(&self.registry);
        let context = Arc::clone(runtime);
        let thread_name = name.clone();

        let (tracked_tx, tracked_rx) = bounded::<()>(1);
        let (ready_tx, ready_rx) = bounded::<()>(1);

        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            // Agent code runs only once the group can see this thread
            let _ = tracked_rx.recv();
            run_guarded(registry, context, lease, thread_name, ready_tx, body)
        })?;

        let id = handle.thread().id();
        group.track(name.clone(), handle);
        let _ = tracked_tx.send(());
        // Returns once the new thread is attached to the context
        let _ = ready_rx.recv();
        debug!(agent = %runtime.name(), thread = %name, "agent thread started");
        Ok(id)
    }

    /// Classify the agent's threads at the end of `turn`
    pub fn poll_liveness(&self, runtime: &AgentRuntime, turn: u64) -> Liveness {
        let running = runtime.group().running_threads();
        match runtime.status().stop_requested_at {
            _ if running.is_empty() => Liveness::Exited,
            None => Liveness::Running,
            Some(at) => {
                let turns = turn.saturating_sub(at);
                if turns > u64::from(self.grace_turns) {
                    Liveness::Undead { threads: running }
                } else {
                    Liveness::Stopping { turns }
                }
            }
        }
    }

    /// Wait up to the stop timeout for every thread of the agent to exit
    pub fn wait_for_stop(&self, runtime: &AgentRuntime) -> bool {
        let deadline = Instant::now() + self.stop_wait;
        loop {
            if runtime.group().running_threads().is_empty() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(STOP_POLL_INTERVAL);
        }
    }

    /// Abandon the agent's running threads and recycle its thread group.
    /// Returns the names of the abandoned threads.
    pub fn force_stop(&self, runtime: &AgentRuntime) -> Vec<String> {
        let _serial = self.force_lock.lock();

        let group = runtime.group();
        let abandoned = group.abandon();
        runtime.mark_forced_stop();
        runtime.system("This robot has been stopped. No score will be generated.");

        let next = group.id().generation + 1;
        runtime.replace_group(ThreadGroup::new(
            runtime.id(),
            runtime.name(),
            next,
            group.cap(),
        ));

        metrics::record_forced_stop();
        warn!(
            agent = %runtime.name(),
            threads = ?abandoned,
            "forced stop: abandoned unresponsive threads"
        );
        abandoned
    }

    /// Stop the agent and discard its context. Returns the threads that had
    /// to be abandoned.
    pub fn teardown(&self, runtime: &AgentRuntime, turn: u64) -> Vec<String> {
        runtime.request_stop(turn);
        let abandoned = if self.wait_for_stop(runtime) {
            Vec::new()
        } else {
            self.force_stop(runtime)
        };
        runtime.mark_torn_down();
        self.registry.release_context(runtime);
        info!(agent = %runtime.name(), abandoned = abandoned.len(), "execution context torn down");
        abandoned
    }
}

fn run_guarded<F>(
    registry: Arc<ThreadRegistry>,
    runtime: Arc<AgentRuntime>,
    lease: ThreadLease,
    name: String,
    ready: Sender<()>,
    body: F,
) where
    F: FnOnce(),
{
    let id = thread::current().id();
    registry.attach(id, &runtime);
    let _ = ready.send(());
    drop(ready);

    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(body)) {
        match payload.downcast_ref::<ThreadTermination>() {
            Some(termination) => {
                debug!(agent = %runtime.name(), thread = %name, reason = %termination.reason, "thread terminated");
            }
            None => runtime.report_panic(&name, &panic_message(payload.as_ref())),
        }
    }

    registry.detach(id);
    drop(lease);
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::Fingerprint;
    use crate::runtime::diagnostics::DiagnosticLog;
    use crate::runtime::identity::AgentIdentity;
    use crate::runtime::resource_limiter::{PermissionDomain, ResourceLimits};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn setup(cap: usize) -> (Arc<ThreadRegistry>, ThreadLifecycleManager, Arc<AgentRuntime>, DiagnosticLog) {
        let log = DiagnosticLog::new();
        let identity = Arc::new(AgentIdentity::new(
            AgentId(1),
            "sample.Worker",
            "1.0",
            Some(Fingerprint::of(b"worker")),
            PermissionDomain::new(ResourceLimits {
                thread_cap: cap,
                ..ResourceLimits::default()
            }),
        ));
        let runtime = Arc::new(AgentRuntime::new(identity, 1, 16, log.sink()));
        let registry = Arc::new(ThreadRegistry::new());
        registry.register_context(&runtime);
        let manager = ThreadLifecycleManager::new(
            Arc::clone(&registry),
            Duration::from_millis(200),
            2,
        );
        (registry, manager, runtime, log)
    }

    #[test]
    fn test_reserve_respects_cap() {
        let (_registry, _manager, runtime, _log) = setup(2);
        let group = runtime.group();
        let a = group.reserve(&runtime).unwrap();
        let _b = group.reserve(&runtime).unwrap();
        assert!(group.reserve(&runtime).is_none());
        drop(a);
        assert!(group.reserve(&runtime).is_some());
    }

    #[test]
    fn test_primary_thread_exits() {
        let (registry, manager, runtime, _log) = setup(5);
        let seen = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&seen);
        let reg = Arc::clone(&registry);
        let id = manager
            .spawn_primary(&runtime, move || {
                let me = thread::current().id();
                flag.store(reg.resolve_agent(me).is_some(), Ordering::SeqCst);
            })
            .unwrap();

        assert!(manager.wait_for_stop(&runtime));
        assert!(seen.load(Ordering::SeqCst));
        assert!(registry.resolve_agent(id).is_none());
        assert_eq!(runtime.group().live_count(), 0);
    }

    #[test]
    fn test_thread_is_tracked_before_it_runs() {
        let (_registry, manager, runtime, _log) = setup(5);
        let seen = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&seen);
        let context = Arc::clone(&runtime);
        manager
            .spawn_primary(&runtime, move || {
                let running = context.group().running_threads();
                flag.store(running == vec!["sample.Worker (round 1)".to_string()], Ordering::SeqCst);
            })
            .unwrap();

        assert!(manager.wait_for_stop(&runtime));
        assert!(seen.load(Ordering::SeqCst));
    }

    #[test]
    fn test_panic_is_contained() {
        let (_registry, manager, runtime, log) = setup(5);
        manager
            .spawn_primary(&runtime, || panic!("boom"))
            .unwrap();
        assert!(manager.wait_for_stop(&runtime));
        assert_eq!(runtime.energy(), 0.0);
        assert!(runtime.output().contains("boom"));
        assert_eq!(log.drain().len(), 1);
    }

    #[test]
    fn test_termination_payload_is_not_a_crash() {
        let (_registry, manager, runtime, log) = setup(5);
        manager
            .spawn_primary(&runtime, || {
                panic::resume_unwind(Box::new(ThreadTermination {
                    reason: "terminated".into(),
                }))
            })
            .unwrap();
        assert!(manager.wait_for_stop(&runtime));
        assert!(log.drain().is_empty());
    }

    #[test]
    fn test_undead_thread_is_abandoned() {
        let (_registry, manager, runtime, _log) = setup(5);
        let release = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&release);
        manager
            .spawn_primary(&runtime, move || {
                // Ignores the stop token on purpose
                while !flag.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(5));
                }
            })
            .unwrap();

        assert_eq!(manager.poll_liveness(&runtime, 1), Liveness::Running);
        runtime.request_stop(1);
        assert_eq!(
            manager.poll_liveness(&runtime, 2),
            Liveness::Stopping { turns: 1 }
        );
        assert!(matches!(
            manager.poll_liveness(&runtime, 4),
            Liveness::Undead { .. }
        ));

        let generation = runtime.group().id().generation;
        let abandoned = manager.force_stop(&runtime);
        assert_eq!(abandoned.len(), 1);
        assert_eq!(runtime.group().id().generation, generation + 1);
        assert!(runtime
            .output()
            .contains("This robot has been stopped. No score will be generated."));

        release.store(true, Ordering::SeqCst);
    }
}

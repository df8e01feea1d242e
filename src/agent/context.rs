// src/agent/context.rs
//! Agent-side execution context
//!
//! [`AgentServices`] holds what every thread of an agent may use: output,
//! properties, files, helper threads. [`AgentContext`] adds the turn state
//! of the primary thread and drives the agent's event dispatcher.

use crate::agent::{AccessError, Agent, EventHandler, Halt};
use crate::battle::snapshot::{AgentView, CommandBuffer, TurnSnapshot};
use crate::events::dispatcher::{Admission, EventDispatcher};
use crate::events::event::{Event, EventKind};
use crate::observability::metrics;
use crate::runtime::agent_runtime::AgentRuntime;
use crate::runtime::file_system::HandleId;
use crate::runtime::host::SandboxHost;
use crate::runtime::sandbox::{Operation, PermissionEnforcer, StdStream, Verdict};
use crate::runtime::thread_manager::{ThreadGroupId, ThreadLifecycleManager, ThreadTermination};
use crate::utils::errors::Result as EngineResult;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

const HELPER_WAIT_SLICE: Duration = Duration::from_millis(10);

/// End the calling thread. The unwind is caught at the thread boundary and
/// not reported as a crash.
fn terminate(reason: String) -> ! {
    std::panic::resume_unwind(Box::new(ThreadTermination { reason }))
}

/// Services shared by every thread of one agent
#[derive(Clone)]
pub struct AgentServices {
    runtime: Arc<AgentRuntime>,
    enforcer: Arc<PermissionEnforcer>,
    lifecycle: Arc<ThreadLifecycleManager>,
    properties: Arc<BTreeMap<String, String>>,
}

impl AgentServices {
    pub fn new(runtime: Arc<AgentRuntime>, host: &SandboxHost) -> Self {
        Self {
            runtime,
            enforcer: Arc::clone(host.enforcer()),
            lifecycle: Arc::clone(host.lifecycle()),
            properties: Arc::clone(host.properties()),
        }
    }

    pub fn name(&self) -> &str {
        self.runtime.name()
    }

    pub fn energy(&self) -> f64 {
        self.runtime.energy()
    }

    pub fn round(&self) -> u32 {
        self.runtime.round()
    }

    pub fn thread_group(&self) -> ThreadGroupId {
        self.runtime.group().id()
    }

    /// Live threads of this agent, the primary thread included
    pub fn live_threads(&self) -> usize {
        self.runtime.group().live_count()
    }

    /// Whether the host asked this agent to stop
    pub fn is_stopping(&self) -> bool {
        self.runtime.stop_requested()
    }

    /// Check `operation` for the calling thread
    pub fn check(&self, operation: Operation) -> Result<(), AccessError> {
        match self.enforcer.check(&operation, thread::current().id()) {
            Verdict::Allow => Ok(()),
            Verdict::Deny(reason) => Err(AccessError::Denied(reason)),
            Verdict::Terminate(reason) => terminate(reason),
        }
    }

    /// Write a line to the agent's own output
    pub fn println(&self, line: impl AsRef<str>) {
        if self.check(Operation::StandardStream(StdStream::Out)).is_ok() {
            self.runtime.println(line.as_ref());
        }
    }

    pub fn property(&self, key: &str) -> Result<Option<String>, AccessError> {
        self.check(Operation::ReadProperty(key.to_string()))?;
        Ok(self.properties.get(key).cloned())
    }

    pub fn access_package(&self, package: &str) -> Result<(), AccessError> {
        self.check(Operation::AccessPackage(package.to_string()))
    }

    pub fn access_thread(&self, target: ThreadId) -> Result<(), AccessError> {
        self.check(Operation::AccessThread { target })
    }

    pub fn access_thread_group(&self, group: ThreadGroupId) -> Result<(), AccessError> {
        self.check(Operation::AccessThreadGroup { group })
    }

    pub fn open_socket(&self, address: &str) -> Result<(), AccessError> {
        self.check(Operation::Socket {
            address: address.to_string(),
        })
    }

    /// Never returns normally for agent threads
    pub fn show_window_unconfirmed(&self) -> Result<(), AccessError> {
        self.check(Operation::ShowWindowUnconfirmed)
    }

    /// The agent's data directory, if it has one
    pub fn data_dir(&self) -> Option<&Path> {
        self.runtime.files().writable_dir()
    }

    /// Read a file. Relative paths resolve against the agent's package directory.
    pub fn read_file(&self, path: impl AsRef<Path>) -> Result<Vec<u8>, AccessError> {
        let path = self.readable_path(path.as_ref());
        self.check(Operation::FileRead { path: path.clone() })?;
        Ok(fs::read(&path)?)
    }

    /// Read a file from the agent's data directory
    pub fn read_data(&self, name: &str) -> Result<Vec<u8>, AccessError> {
        let path = self.data_path(name)?;
        self.check(Operation::FileRead { path: path.clone() })?;
        Ok(fs::read(&path)?)
    }

    /// Open `name` in the data directory for writing.
    ///
    /// The handle is registered to the calling thread; every write through it
    /// is checked and charged against the byte quota.
    pub fn open_data(&self, name: &str, append: bool) -> Result<DataFile, AccessError> {
        let path = self.data_path(name)?;
        self.ensure_data_dir()?;
        self.check(Operation::OpenForWrite { path: path.clone() })?;

        let owner = thread::current().id();
        let handle = match self.runtime.files().register_handle(&path, owner) {
            Ok(handle) => handle,
            Err(reason) => {
                self.runtime.punish_violation(&reason);
                return Err(AccessError::Denied(reason));
            }
        };

        let opened = if append {
            OpenOptions::new().create(true).append(true).open(&path)
        } else {
            let existing = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&path)
                .map(|file| {
                    self.runtime.quota().release_bytes(existing);
                    file
                })
        };

        match opened {
            Ok(file) => Ok(DataFile {
                services: self.clone(),
                path,
                handle,
                file,
            }),
            Err(err) => {
                self.runtime.files().release_handle(handle);
                Err(AccessError::Io(err))
            }
        }
    }

    pub fn delete_data(&self, name: &str) -> Result<(), AccessError> {
        let path = self.data_path(name)?;
        self.check(Operation::FileDelete { path: path.clone() })?;
        let size = fs::metadata(&path)?.len();
        fs::remove_file(&path)?;
        self.runtime.quota().release_bytes(size);
        Ok(())
    }

    /// Start a helper thread. Refused once the agent's thread cap is reached.
    pub fn spawn_helper<F>(&self, name: &str, body: F) -> Result<ThreadId, AccessError>
    where
        F: FnOnce(HelperContext) + Send + 'static,
    {
        let (runtime, lease) = match self.enforcer.authorize_thread(thread::current().id()) {
            Ok(granted) => granted,
            Err(Verdict::Terminate(reason)) => terminate(reason),
            Err(Verdict::Deny(reason)) => return Err(AccessError::Denied(reason)),
            Err(Verdict::Allow) => {
                return Err(AccessError::Denied("thread creation refused".to_string()))
            }
        };

        let helper = HelperContext {
            services: AgentServices {
                runtime: Arc::clone(&runtime),
                ..self.clone()
            },
        };
        let thread_name = format!("{} ({})", runtime.name(), name);
        self.lifecycle
            .spawn_with_lease(&runtime, lease, thread_name, move || body(helper))
            .map_err(|e| AccessError::Io(io::Error::new(io::ErrorKind::Other, e.to_string())))
    }

    fn data_path(&self, name: &str) -> Result<PathBuf, AccessError> {
        self.runtime
            .files()
            .data_path(name)
            .ok_or_else(|| AccessError::Denied(format!("{} has no data directory.", self.name())))
    }

    fn ensure_data_dir(&self) -> Result<(), AccessError> {
        let Some(dir) = self.runtime.files().writable_dir() else {
            return Err(AccessError::Denied(format!(
                "{} has no data directory.",
                self.name()
            )));
        };
        if dir.exists() {
            return Ok(());
        }
        let dir = dir.to_path_buf();
        self.check(Operation::CreateDirectory { path: dir.clone() })?;
        fs::create_dir_all(&dir)?;
        Ok(())
    }

    fn readable_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            return path.to_path_buf();
        }
        match self.runtime.files().readable_dir() {
            Some(root) => root.join(path),
            None => path.to_path_buf(),
        }
    }
}

/// Output file in the agent's data directory
pub struct DataFile {
    services: AgentServices,
    path: PathBuf,
    handle: HandleId,
    file: File,
}

impl DataFile {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Write for DataFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let operation = Operation::FileWrite {
            path: self.path.clone(),
            handle: Some(self.handle),
        };
        if let Err(err) = self.services.check(operation) {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, err.to_string()));
        }
        let runtime = &self.services.runtime;
        if let Verdict::Deny(reason) = self.services.enforcer.charge_write(runtime, buf.len() as u64) {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, reason));
        }
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Drop for DataFile {
    fn drop(&mut self) {
        self.services.runtime.files().release_handle(self.handle);
    }
}

/// Context handed to helper threads
pub struct HelperContext {
    services: AgentServices,
}

impl HelperContext {
    /// Sleep, returning early with `Halt::Stopped` once a stop is requested
    pub fn sleep(&self, duration: Duration) -> Result<(), Halt> {
        let deadline = Instant::now() + duration;
        loop {
            if self.services.runtime.stop_requested() {
                return Err(Halt::Stopped);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::sleep((deadline - now).min(HELPER_WAIT_SLICE));
        }
    }

    /// Block until the host asks the agent to stop
    pub fn wait_for_stop(&self) {
        while !self.services.runtime.stop_requested() {
            thread::sleep(HELPER_WAIT_SLICE);
        }
    }
}

impl Deref for HelperContext {
    type Target = AgentServices;

    fn deref(&self) -> &AgentServices {
        &self.services
    }
}

/// Turn state of the agent's primary thread
pub struct AgentContext {
    services: AgentServices,
    dispatcher: EventDispatcher,
    handler: Option<Box<dyn EventHandler>>,
    turn: u64,
    snapshot: Arc<TurnSnapshot>,
    commands: CommandBuffer,

    /// Events of the current turn, kept for agents without a handler
    received: Vec<Event>,
}

impl AgentContext {
    pub fn new(services: AgentServices) -> Self {
        let capacity = services.runtime.inbox().capacity();
        let snapshot = Arc::new(TurnSnapshot::empty(services.runtime.round()));
        Self {
            services,
            dispatcher: EventDispatcher::new(capacity),
            handler: None,
            turn: 0,
            snapshot,
            commands: CommandBuffer::new(0),
            received: Vec::new(),
        }
    }

    pub fn turn(&self) -> u64 {
        self.turn
    }

    /// Snapshot of the current turn
    pub fn snapshot(&self) -> &Arc<TurnSnapshot> {
        &self.snapshot
    }

    /// This agent as seen in the current snapshot
    pub fn me(&self) -> Option<&AgentView> {
        self.snapshot.agent(self.services.runtime.id())
    }

    /// Queue a command for the current turn
    pub fn act(&mut self, name: impl Into<String>, args: serde_json::Value) {
        self.commands.push(name, args);
    }

    pub fn commands(&self) -> &CommandBuffer {
        &self.commands
    }

    /// Events received this turn when no handler is installed
    pub fn received_events(&self) -> &[Event] {
        &self.received
    }

    pub fn set_event_priority(&mut self, kind: EventKind, priority: i32) {
        if let Err(msg) = self.dispatcher.set_priority(kind, priority) {
            self.services.runtime.system(&msg);
        }
    }

    pub fn ignore_events(&mut self, kind: EventKind) {
        if let Err(msg) = self.dispatcher.ignore(kind) {
            self.services.runtime.system(&msg);
        }
    }

    pub(crate) fn install_handler(&mut self, handler: Option<Box<dyn EventHandler>>) {
        self.handler = handler;
    }

    /// The yield point.
    ///
    /// Hands in the commands for the current turn and parks until the next
    /// turn is published, then dispatches that turn's events. Inside an event
    /// handler it returns `Halt::Interrupted` when a strictly more urgent
    /// event arrived; the handler must return and is not resumed.
    pub fn execute(&mut self) -> Result<(), Halt> {
        let runtime = Arc::clone(&self.services.runtime);
        let buffer = std::mem::replace(&mut self.commands, CommandBuffer::new(self.turn));
        let (turn, snapshot) = runtime
            .gate()
            .yield_turn(buffer, self.turn, runtime.stop_token())?;

        self.turn = turn;
        self.snapshot = snapshot;
        self.commands = CommandBuffer::new(turn);
        self.collect_events();

        if self.dispatcher.is_dispatching() {
            if self.dispatcher.should_interrupt() {
                let priority = self.dispatcher.active_priority().unwrap_or_default();
                metrics::record_interruption();
                trace!(agent = %runtime.name(), turn, priority, "handler interrupted");
                return Err(Halt::Interrupted { priority });
            }
            return Ok(());
        }

        self.dispatch_events()
    }

    fn collect_events(&mut self) {
        for event in self.services.runtime.inbox().drain() {
            if self.dispatcher.admit(event) == Admission::Overflow {
                let capacity = self.services.runtime.inbox().capacity();
                self.services.runtime.system(&format!(
                    "Not adding to {}'s queue, exceeded {} events in queue.",
                    self.services.name(),
                    capacity
                ));
            }
        }
        let stale = self.dispatcher.discard_stale(self.turn);
        if stale > 0 {
            trace!(agent = %self.services.name(), stale, "discarded stale events");
        }
    }

    fn dispatch_events(&mut self) -> Result<(), Halt> {
        let Some(mut handler) = self.handler.take() else {
            self.received.clear();
            while let Some(event) = self.dispatcher.next() {
                self.received.push(event);
            }
            return Ok(());
        };

        let mut outcome = Ok(());
        while let Some(event) = self.dispatcher.next() {
            self.dispatcher.begin(&event);
            metrics::record_dispatch();
            let result = handler.on_event(&event, self);
            self.dispatcher.finish();
            match result {
                Ok(()) => {}
                Err(Halt::Interrupted { priority }) => {
                    debug!(
                        agent = %self.services.name(),
                        kind = %event.kind(),
                        priority,
                        "event handler abandoned"
                    );
                }
                Err(halt) => {
                    outcome = Err(halt);
                    break;
                }
            }
        }
        self.handler = Some(handler);
        outcome
    }
}

impl Deref for AgentContext {
    type Target = AgentServices;

    fn deref(&self) -> &AgentServices {
        &self.services
    }
}

/// Body of an agent's primary thread
fn drive<F>(create: F, mut ctx: AgentContext)
where
    F: FnOnce() -> Box<dyn Agent>,
{
    let mut agent = create();
    ctx.install_handler(agent.event_handler());

    let name = ctx.name().to_string();
    // Wait for the first turn
    let mut result = ctx.execute();
    if result.is_ok() {
        result = agent.run(&mut ctx);
    }
    // Keep serving events after run returns
    while result.is_ok() {
        result = ctx.execute();
    }

    match result {
        Err(Halt::Disabled(reason)) => debug!(agent = %name, reason = %reason, "agent disabled"),
        Err(halt) => debug!(agent = %name, %halt, "agent thread finished"),
        Ok(()) => {}
    }
}

/// Start the primary thread of `runtime`, running `agent`
pub fn launch(
    host: &SandboxHost,
    runtime: &Arc<AgentRuntime>,
    agent: Box<dyn Agent>,
) -> EngineResult<ThreadId> {
    launch_with(host, runtime, move || agent)
}

/// Start the primary thread of `runtime`. The agent is created on that
/// thread, so a panicking constructor is contained like any agent panic.
pub fn launch_with<F>(host: &SandboxHost, runtime: &Arc<AgentRuntime>, create: F) -> EngineResult<ThreadId>
where
    F: FnOnce() -> Box<dyn Agent> + Send + 'static,
{
    let ctx = AgentContext::new(AgentServices::new(Arc::clone(runtime), host));
    host.lifecycle().spawn_primary(runtime, move || drive(create, ctx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::AgentPackage;
    use crate::utils::config::EngineConfig;
    use parking_lot::Mutex;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    struct Firing;

    impl Agent for Firing {
        fn run(&mut self, ctx: &mut AgentContext) -> Result<(), Halt> {
            loop {
                let turn = ctx.turn();
                ctx.act("fire", json!({ "turn": turn }));
                ctx.execute()?;
            }
        }
    }

    fn setup(config: EngineConfig) -> (SandboxHost, Arc<AgentRuntime>) {
        let host = SandboxHost::new(config);
        let id = host
            .admit(Arc::new(AgentPackage::builtin("sample.Probe", || Firing)))
            .unwrap();
        let identity = host.identity(id).unwrap();
        let runtime = host.create_context(&identity, 1);
        (host, runtime)
    }

    fn snapshot(turn: u64) -> Arc<TurnSnapshot> {
        Arc::new(TurnSnapshot::new(1, turn, json!({}), Vec::new()))
    }

    fn step(runtime: &AgentRuntime, turn: u64) -> Option<CommandBuffer> {
        runtime.gate().publish(turn, snapshot(turn));
        let deadline = Instant::now() + Duration::from_secs(5);
        assert!(runtime.gate().wait_parked(turn, deadline, &CancellationToken::new()));
        runtime.gate().take_submission(turn)
    }

    #[test]
    fn test_commands_computed_from_matching_turn() {
        let (host, runtime) = setup(EngineConfig::default());
        launch(&host, &runtime, Box::new(Firing)).unwrap();

        for turn in 1..=3 {
            let buffer = step(&runtime, turn).unwrap();
            assert_eq!(buffer.turn(), turn);
            assert_eq!(buffer.actions()[0].args, json!({ "turn": turn }));
        }

        host.lifecycle().teardown(&runtime, 3);
        assert!(runtime.group().running_threads().is_empty());
    }

    #[test]
    fn test_events_dispatched_by_priority() {
        struct Recording(Arc<Mutex<Vec<String>>>);

        impl Agent for Recording {
            fn run(&mut self, ctx: &mut AgentContext) -> Result<(), Halt> {
                loop {
                    ctx.execute()?;
                }
            }

            fn event_handler(&mut self) -> Option<Box<dyn EventHandler>> {
                let seen = Arc::clone(&self.0);
                Some(Box::new(move |event: &Event, _ctx: &mut AgentContext| {
                    seen.lock().push(event.kind().name().to_string());
                    Ok(())
                }))
            }
        }

        let (host, runtime) = setup(EngineConfig::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        launch(&host, &runtime, Box::new(Recording(Arc::clone(&seen)))).unwrap();

        host.deliver(&runtime, EventKind::Status, 1, json!({}));
        host.deliver(&runtime, EventKind::Scanned, 1, json!({}));
        host.deliver(&runtime, EventKind::HitWall, 1, json!({}));
        step(&runtime, 1);

        assert_eq!(*seen.lock(), vec!["hit_wall", "scanned", "status"]);
        host.lifecycle().teardown(&runtime, 1);
    }

    #[test]
    fn test_critical_priority_change_refused() {
        struct Fiddler;

        impl Agent for Fiddler {
            fn run(&mut self, ctx: &mut AgentContext) -> Result<(), Halt> {
                ctx.set_event_priority(EventKind::Death, 99);
                ctx.set_event_priority(EventKind::Status, 1);
                loop {
                    ctx.execute()?;
                }
            }
        }

        let (host, runtime) = setup(EngineConfig::default());
        launch(&host, &runtime, Box::new(Fiddler)).unwrap();
        step(&runtime, 1);
        step(&runtime, 2);
        assert!(runtime
            .output()
            .contains("SYSTEM: You may not change the priority of the critical event death."));
        host.lifecycle().teardown(&runtime, 2);
    }

    #[test]
    fn test_read_outside_package_denied() {
        struct Reader(Arc<Mutex<Option<bool>>>);

        impl Agent for Reader {
            fn run(&mut self, ctx: &mut AgentContext) -> Result<(), Halt> {
                let denied = matches!(ctx.read_file("/etc/hostname"), Err(AccessError::Denied(_)));
                *self.0.lock() = Some(denied);
                loop {
                    ctx.execute()?;
                }
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let host = SandboxHost::new(EngineConfig::default());
        let package = AgentPackage::builtin("sample.Reader", || Firing)
            .with_root_dir(dir.path())
            .with_data_root(dir.path());
        let id = host.admit(Arc::new(package)).unwrap();
        let runtime = host.create_context(&host.identity(id).unwrap(), 1);
        let outcome = Arc::new(Mutex::new(None));
        launch(&host, &runtime, Box::new(Reader(Arc::clone(&outcome)))).unwrap();

        step(&runtime, 1);
        assert_eq!(*outcome.lock(), Some(true));
        assert_eq!(runtime.energy(), 0.0);
        host.lifecycle().teardown(&runtime, 1);
    }

    #[test]
    fn test_data_file_round_trip() {
        struct Writer(Arc<Mutex<Option<Vec<u8>>>>);

        impl Agent for Writer {
            fn run(&mut self, ctx: &mut AgentContext) -> Result<(), Halt> {
                {
                    let mut file = ctx.open_data("notes.txt", false)?;
                    file.write_all(b"hello").map_err(AccessError::from)?;
                }
                *self.0.lock() = Some(ctx.read_data("notes.txt")?);
                loop {
                    ctx.execute()?;
                }
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let host = SandboxHost::new(EngineConfig::default());
        let package = AgentPackage::builtin("sample.Writer", || Firing)
            .with_root_dir(dir.path())
            .with_data_root(dir.path());
        let id = host.admit(Arc::new(package)).unwrap();
        let runtime = host.create_context(&host.identity(id).unwrap(), 1);
        let read_back = Arc::new(Mutex::new(None));
        launch(&host, &runtime, Box::new(Writer(Arc::clone(&read_back)))).unwrap();

        step(&runtime, 1);
        assert_eq!(read_back.lock().as_deref(), Some(&b"hello"[..]));
        assert_eq!(runtime.quota().bytes_used(), 5);
        assert_eq!(runtime.files().open_handles(), 0);
        assert!(runtime.is_alive());
        host.lifecycle().teardown(&runtime, 1);
    }
}

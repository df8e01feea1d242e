// src/runtime/sandbox.rs
//! Permission enforcement for agent threads
//!
//! Every sensitive operation an agent performs is checked here, against the
//! permission domain of the agent that owns the calling thread:
//! - Thread creation (thread cap) and access to threads or thread groups
//! - File read / write / delete, confined to the agent's directories
//! - Standard streams, host properties, host-internal packages
//!
//! Policy is default-deny. Host ("safe") threads are always allowed. A denied
//! agent is soft-eliminated: its energy is forced to zero and the violation is
//! echoed into its own output.

use crate::runtime::agent_runtime::AgentRuntime;
use crate::runtime::file_system::{HandleId, ReadAccess};
use crate::runtime::host::{Resolution, ThreadRegistry};
use crate::runtime::resource_limiter::QuotaCheck;
use crate::runtime::thread_manager::{ThreadGroupId, ThreadLease};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::ThreadId;
use tracing::{debug, warn};

/// Namespace rooted at the host
pub const HOST_NAMESPACE: &str = "arena";

/// Package access rules shared by the loader and the enforcer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackagePolicy {
    /// Packages agents may never touch
    pub internal: Vec<String>,

    /// Host packages agents may use
    pub allowed: BTreeSet<String>,
}

impl Default for PackagePolicy {
    fn default() -> Self {
        Self {
            internal: vec![
                "arena.host".to_string(),
                "arena.control".to_string(),
                "arena.engine".to_string(),
            ],
            allowed: ["arena.api", "arena.util"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl PackagePolicy {
    /// Whether `symbol` lives in a package agents may not reference
    pub fn is_internal(&self, symbol: &str) -> bool {
        if self
            .allowed
            .iter()
            .any(|p| symbol == p || symbol.starts_with(&format!("{}.", p)))
        {
            return false;
        }
        self.internal
            .iter()
            .any(|p| symbol == p || symbol.starts_with(&format!("{}.", p)))
    }

    /// Whether `namespace` is reserved for the host
    pub fn is_reserved_namespace(&self, namespace: &str) -> bool {
        namespace == HOST_NAMESPACE || namespace.starts_with(&format!("{}.", HOST_NAMESPACE))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdStream {
    In,
    Out,
    Err,
}

/// A sensitive operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    CreateThread,
    AccessThreadGroup { group: ThreadGroupId },
    AccessThread { target: ThreadId },
    FileRead { path: PathBuf },
    /// Path-level check made before an output handle is registered
    OpenForWrite { path: PathBuf },
    FileWrite { path: PathBuf, handle: Option<HandleId> },
    FileDelete { path: PathBuf },
    CreateDirectory { path: PathBuf },
    StandardStream(StdStream),
    ReadProperty(String),
    AccessPackage(String),
    Socket { address: String },
    ShowWindowUnconfirmed,
    Other(String),
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::CreateThread => write!(f, "create thread"),
            Operation::AccessThreadGroup { group } => write!(f, "access thread group {}", group),
            Operation::AccessThread { target } => write!(f, "access thread {:?}", target),
            Operation::FileRead { path } => write!(f, "read {}", path.display()),
            Operation::OpenForWrite { path } => write!(f, "open {} for writing", path.display()),
            Operation::FileWrite { path, .. } => write!(f, "write {}", path.display()),
            Operation::FileDelete { path } => write!(f, "delete {}", path.display()),
            Operation::CreateDirectory { path } => write!(f, "create directory {}", path.display()),
            Operation::StandardStream(stream) => write!(f, "standard stream {:?}", stream),
            Operation::ReadProperty(key) => write!(f, "read property {}", key),
            Operation::AccessPackage(name) => write!(f, "access package {}", name),
            Operation::Socket { address } => write!(f, "open socket to {}", address),
            Operation::ShowWindowUnconfirmed => write!(f, "show window without confirmation"),
            Operation::Other(what) => write!(f, "{}", what),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny(String),

    /// The calling thread must not continue
    Terminate(String),
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allow)
    }
}

/// Single mediation point for sensitive operations
pub struct PermissionEnforcer {
    registry: Arc<ThreadRegistry>,
    policy: PackagePolicy,
}

impl PermissionEnforcer {
    pub fn new(registry: Arc<ThreadRegistry>, policy: PackagePolicy) -> Self {
        Self { registry, policy }
    }

    pub fn policy(&self) -> &PackagePolicy {
        &self.policy
    }

    /// Check `operation` for the thread `caller`. A deny is also punished.
    pub fn check(&self, operation: &Operation, caller: ThreadId) -> Verdict {
        match self.registry.resolve(caller) {
            Resolution::Safe => Verdict::Allow,
            Resolution::Unresolved => self.check_unresolved(operation, caller),
            Resolution::Agent(runtime) => {
                if runtime.is_torn_down() {
                    return Verdict::Deny(format!(
                        "Preventing {} from access: its execution context has been torn down.",
                        runtime.name()
                    ));
                }
                let verdict = self.evaluate(operation, caller, &runtime);
                self.enforce(operation, &runtime, verdict, caller)
            }
        }
    }

    /// Reserve a thread slot for the caller's agent. The reservation is the
    /// cap check, so there is no window between checking and spawning.
    pub fn authorize_thread(
        &self,
        caller: ThreadId,
    ) -> Result<(Arc<AgentRuntime>, ThreadLease), Verdict> {
        let runtime = match self.registry.resolve(caller) {
            Resolution::Agent(runtime) if !runtime.is_torn_down() => runtime,
            _ => {
                let verdict = match self.check(&Operation::CreateThread, caller) {
                    Verdict::Allow => Verdict::Deny(
                        "Only agent threads may create agent threads.".to_string(),
                    ),
                    other => other,
                };
                return Err(verdict);
            }
        };

        let group = runtime.group();
        match group.reserve(&runtime) {
            Some(lease) => Ok((runtime, lease)),
            None => {
                let reason = format!(
                    "{}: Agents are only allowed to create up to {} threads.",
                    runtime.name(),
                    group.cap()
                );
                Err(self.enforce(
                    &Operation::CreateThread,
                    &runtime,
                    Verdict::Deny(reason),
                    caller,
                ))
            }
        }
    }

    /// Charge a write of `bytes` against the caller's byte quota
    pub fn charge_write(&self, runtime: &AgentRuntime, bytes: u64) -> Verdict {
        match runtime.quota().try_consume_bytes(bytes) {
            QuotaCheck::Granted => Verdict::Allow,
            QuotaCheck::Exceeded { first_notice } => {
                runtime.report_quota_exhausted(first_notice);
                Verdict::Deny(format!(
                    "You have reached your filesystem quota of: {} bytes.",
                    runtime.quota().limits().byte_quota
                ))
            }
        }
    }

    fn check_unresolved(&self, operation: &Operation, caller: ThreadId) -> Verdict {
        match operation {
            Operation::ReadProperty(_)
            | Operation::AccessPackage(_)
            | Operation::StandardStream(_) => Verdict::Allow,
            other => {
                warn!(thread = ?caller, operation = %other, "denied operation from unattached thread");
                Verdict::Deny(format!(
                    "Preventing unknown thread {:?} from access: {}",
                    caller, other
                ))
            }
        }
    }

    /// Pure policy decision for an attached agent thread
    fn evaluate(&self, operation: &Operation, caller: ThreadId, runtime: &Arc<AgentRuntime>) -> Verdict {
        let name = runtime.name();
        match operation {
            Operation::CreateThread => {
                let group = runtime.group();
                if group.live_count() < group.cap() {
                    Verdict::Allow
                } else {
                    Verdict::Deny(format!(
                        "{}: Agents are only allowed to create up to {} threads.",
                        name,
                        group.cap()
                    ))
                }
            }

            Operation::AccessThreadGroup { group } => {
                if *group == runtime.group().id() {
                    Verdict::Allow
                } else {
                    Verdict::Deny(format!(
                        "Preventing {} from access to thread group {}.",
                        name, group
                    ))
                }
            }

            Operation::AccessThread { target } => match self.registry.resolve_agent(*target) {
                Some(owner) if Arc::ptr_eq(&owner, runtime) => Verdict::Allow,
                _ => Verdict::Deny(format!(
                    "Preventing {} from access to thread {:?}.",
                    name, target
                )),
            },

            Operation::FileRead { path } => match runtime.files().read_access(path) {
                ReadAccess::Allowed => Verdict::Allow,
                ReadAccess::OutsideDomain => Verdict::Deny(format!(
                    "Preventing {} from access to {}: You may only read files in your own root package directory.",
                    name,
                    path.display()
                )),
                ReadAccess::ForeignData => Verdict::Deny(format!(
                    "Preventing {} from access to {}: You may not read the data directory of another agent.",
                    name,
                    path.display()
                )),
            },

            Operation::OpenForWrite { path } | Operation::FileDelete { path } => {
                if runtime.files().is_writable(path) {
                    Verdict::Allow
                } else {
                    Verdict::Deny(self.outside_writable(name, path, runtime))
                }
            }

            Operation::FileWrite { path, handle } => {
                if !runtime.files().is_writable(path) {
                    return Verdict::Deny(self.outside_writable(name, path, runtime));
                }
                match handle {
                    Some(handle) if runtime.files().owns_handle(*handle, caller, path) => {
                        Verdict::Allow
                    }
                    _ => Verdict::Deny(format!(
                        "Preventing {} from writing {}: You must use an output handle opened by this thread.",
                        name,
                        path.display()
                    )),
                }
            }

            Operation::CreateDirectory { path } => {
                if runtime.files().is_writable_root(path) {
                    Verdict::Allow
                } else {
                    Verdict::Deny(format!(
                        "Preventing {} from creating {}: You may only create your own data directory.",
                        name,
                        path.display()
                    ))
                }
            }

            Operation::StandardStream(_) | Operation::ReadProperty(_) => Verdict::Allow,

            Operation::AccessPackage(package) => {
                if self.policy.is_internal(package) {
                    Verdict::Deny(format!(
                        "Preventing {} from access to the internal package: {}",
                        name, package
                    ))
                } else {
                    Verdict::Allow
                }
            }

            Operation::Socket { address } => Verdict::Deny(format!(
                "Preventing {} from opening a socket to {}: Agents may not use the network.",
                name, address
            )),

            Operation::ShowWindowUnconfirmed => Verdict::Terminate(format!(
                "Preventing {} from showing a window without confirmation. The thread has been terminated.",
                name
            )),

            Operation::Other(what) => Verdict::Deny(format!(
                "Preventing {} from access: {}",
                name, what
            )),
        }
    }

    fn outside_writable(&self, name: &str, path: &std::path::Path, runtime: &AgentRuntime) -> String {
        match runtime.files().writable_dir() {
            Some(dir) => format!(
                "Preventing {} from access to {}: You may only write files in your own data directory {}.",
                name,
                path.display(),
                dir.display()
            ),
            None => format!(
                "Preventing {} from access to {}: You have no data directory.",
                name,
                path.display()
            ),
        }
    }

    fn enforce(
        &self,
        operation: &Operation,
        runtime: &AgentRuntime,
        verdict: Verdict,
        caller: ThreadId,
    ) -> Verdict {
        match &verdict {
            Verdict::Allow => {
                debug!(agent = %runtime.name(), operation = %operation, "allowed");
            }
            Verdict::Deny(reason) => {
                warn!(agent = %runtime.name(), operation = %operation, reason = %reason, "denied");
                runtime.punish_violation(reason);
            }
            Verdict::Terminate(reason) => {
                warn!(agent = %runtime.name(), operation = %operation, reason = %reason, "terminating thread");
                runtime.punish_violation(reason);
                // Even if agent code catches the unwind, the thread is no
                // longer attached and every later check from it fails.
                self.registry.detach(caller);
            }
        }
        verdict
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::Fingerprint;
    use crate::runtime::diagnostics::{DiagnosticKind, DiagnosticLog};
    use crate::runtime::identity::{AgentId, AgentIdentity};
    use crate::runtime::resource_limiter::{PermissionDomain, ResourceLimits};
    use std::thread;

    struct Fixture {
        _root: tempfile::TempDir,
        registry: Arc<ThreadRegistry>,
        enforcer: PermissionEnforcer,
        runtime: Arc<AgentRuntime>,
        log: DiagnosticLog,
        data: PathBuf,
    }

    fn fixture(limits: ResourceLimits) -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let data = root.path().join("sample.Probe.data");
        let domain = PermissionDomain::new(limits)
            .with_readable_dir(root.path())
            .with_writable_dir(&data);
        let identity = Arc::new(AgentIdentity::new(
            AgentId(7),
            "sample.Probe",
            "1.0",
            Some(Fingerprint::of(b"probe")),
            domain,
        ));
        let log = DiagnosticLog::new();
        let runtime = Arc::new(AgentRuntime::new(identity, 1, 16, log.sink()));
        let registry = Arc::new(ThreadRegistry::new());
        registry.register_context(&runtime);
        registry.attach(thread::current().id(), &runtime);
        let enforcer = PermissionEnforcer::new(Arc::clone(&registry), PackagePolicy::default());
        Fixture {
            _root: root,
            registry,
            enforcer,
            runtime,
            log,
            data,
        }
    }

    #[test]
    fn test_safe_thread_always_allowed() {
        let f = fixture(ResourceLimits::default());
        let me = thread::current().id();
        f.registry.detach(me);
        f.registry.mark_safe(me);
        let op = Operation::Socket {
            address: "example.org:80".into(),
        };
        assert_eq!(f.enforcer.check(&op, me), Verdict::Allow);
    }

    #[test]
    fn test_unresolved_thread_exceptions() {
        let f = fixture(ResourceLimits::default());
        let me = thread::current().id();
        f.registry.detach(me);

        assert!(f
            .enforcer
            .check(&Operation::ReadProperty("os.name".into()), me)
            .is_allowed());
        assert!(f
            .enforcer
            .check(&Operation::StandardStream(StdStream::Out), me)
            .is_allowed());
        assert!(!f
            .enforcer
            .check(&Operation::FileRead { path: f.data.join("x") }, me)
            .is_allowed());
        // Nobody to punish
        assert_eq!(f.runtime.energy(), 100.0);
    }

    #[test]
    fn test_read_outside_domain_denied() {
        let f = fixture(ResourceLimits::default());
        let me = thread::current().id();
        let verdict = f.enforcer.check(
            &Operation::FileRead {
                path: PathBuf::from("/etc/hostname"),
            },
            me,
        );
        assert!(matches!(verdict, Verdict::Deny(_)));
        assert_eq!(f.runtime.energy(), 0.0);
        assert_eq!(f.log.drain().len(), 1);
    }

    #[test]
    fn test_write_requires_owned_handle() {
        let f = fixture(ResourceLimits::default());
        let me = thread::current().id();
        let path = f.data.join("state.txt");

        assert!(f
            .enforcer
            .check(&Operation::OpenForWrite { path: path.clone() }, me)
            .is_allowed());
        let untagged = f.enforcer.check(
            &Operation::FileWrite {
                path: path.clone(),
                handle: None,
            },
            me,
        );
        assert!(!untagged.is_allowed());
        assert_eq!(f.runtime.energy(), 0.0);
    }

    #[test]
    fn test_write_outside_data_dir_denied() {
        let f = fixture(ResourceLimits::default());
        let me = thread::current().id();
        let outside = f.data.parent().unwrap().join("escape.txt");
        let verdict = f.enforcer.check(&Operation::OpenForWrite { path: outside }, me);
        assert!(!verdict.is_allowed());
        assert_eq!(f.log.drain().len(), 1);
        assert_eq!(f.log.count(DiagnosticKind::PermissionViolation), 1);
    }

    #[test]
    fn test_create_own_data_dir_only() {
        let f = fixture(ResourceLimits::default());
        let me = thread::current().id();
        assert!(f
            .enforcer
            .check(&Operation::CreateDirectory { path: f.data.clone() }, me)
            .is_allowed());
        assert!(!f
            .enforcer
            .check(
                &Operation::CreateDirectory {
                    path: f.data.join("nested")
                },
                me
            )
            .is_allowed());
    }

    #[test]
    fn test_internal_package_denied() {
        let f = fixture(ResourceLimits::default());
        let me = thread::current().id();
        assert!(f
            .enforcer
            .check(&Operation::AccessPackage("arena.api.geometry".into()), me)
            .is_allowed());
        assert!(!f
            .enforcer
            .check(&Operation::AccessPackage("arena.host.registry".into()), me)
            .is_allowed());
    }

    #[test]
    fn test_thread_cap_reservation() {
        let f = fixture(ResourceLimits {
            thread_cap: 2,
            ..ResourceLimits::default()
        });
        let me = thread::current().id();
        let (_, first) = f.enforcer.authorize_thread(me).unwrap();
        let (_, second) = f.enforcer.authorize_thread(me).unwrap();
        assert!(f.enforcer.authorize_thread(me).is_err());
        assert_eq!(f.runtime.group().live_count(), 2);
        assert_eq!(f.runtime.energy(), 0.0);
        drop((first, second));
        assert_eq!(f.runtime.group().live_count(), 0);
    }

    #[test]
    fn test_show_window_terminates_and_detaches() {
        let f = fixture(ResourceLimits::default());
        let me = thread::current().id();
        let verdict = f.enforcer.check(&Operation::ShowWindowUnconfirmed, me);
        assert!(matches!(verdict, Verdict::Terminate(_)));
        assert!(f.registry.resolve_agent(me).is_none());
    }

    #[test]
    fn test_foreign_thread_denied() {
        let f = fixture(ResourceLimits::default());
        let me = thread::current().id();
        let stranger = thread::spawn(|| thread::current().id()).join().unwrap();
        assert!(!f
            .enforcer
            .check(&Operation::AccessThread { target: stranger }, me)
            .is_allowed());
        assert!(f
            .enforcer
            .check(&Operation::AccessThread { target: me }, me)
            .is_allowed());
    }

    #[test]
    fn test_policy_allowlist_wins() {
        let policy = PackagePolicy::default();
        assert!(policy.is_internal("arena.host"));
        assert!(policy.is_internal("arena.control.Port"));
        assert!(!policy.is_internal("arena.api.Vector"));
        assert!(!policy.is_internal("arenaa.host"));
        assert!(policy.is_reserved_namespace("arena.samples"));
        assert!(!policy.is_reserved_namespace("arenas"));
    }
}

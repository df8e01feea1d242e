// src/loader/isolation.rs
//! Isolation boundary
//!
//! Loads agent packages into their own namespace and fingerprints them.
//!
//! - **Namespace policy**: agent code must live in a qualified namespace that
//!   is not reserved for the host, and may not reference host internals
//! - **Closure**: units reachable from the entry unit; unreachable units are
//!   ignored and do not affect the fingerprint
//! - **Fingerprint**: SHA-256 over the closure's units plus the sorted set of
//!   external symbols it references
//! - **Cache**: keyed by fingerprint; reloading unchanged code returns the
//!   identical `Arc<LoadedAgent>`
//!
//! A package that fails to load is remembered and never retried.

use crate::agent::Agent;
use crate::loader::package::{AgentPackage, CodeUnit, Describable, Sourced};
use crate::runtime::sandbox::PackagePolicy;
use crate::utils::errors::LoadError;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// SHA-256 content fingerprint of loaded agent code
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn of(data: &[u8]) -> Self {
        let hash = Sha256::digest(data);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&hash);
        Self(bytes)
    }

    fn from_hasher(hasher: Sha256) -> Self {
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&hasher.finalize());
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 12 hex digits, for logs
    pub fn short(&self) -> String {
        self.to_hex().chars().take(12).collect()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

/// An agent package that passed the isolation checks
#[derive(Debug)]
pub struct LoadedAgent {
    package: Arc<AgentPackage>,
    fingerprint: Fingerprint,

    /// Unit names reachable from the entry unit, sorted
    closure: Vec<String>,

    /// Symbols referenced from the closure that are not part of the package
    external_symbols: BTreeSet<String>,
}

impl LoadedAgent {
    pub fn package(&self) -> &Arc<AgentPackage> {
        &self.package
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn closure(&self) -> &[String] {
        &self.closure
    }

    pub fn external_symbols(&self) -> &BTreeSet<String> {
        &self.external_symbols
    }

    /// Fresh agent instance for a new round
    pub fn instantiate(&self) -> Box<dyn Agent> {
        self.package.instantiate()
    }
}

/// Loads packages and caches them by content
pub struct AgentLoader {
    policy: PackagePolicy,
    cache: DashMap<Fingerprint, Arc<LoadedAgent>>,
    rejected: DashMap<String, LoadError>,
}

impl AgentLoader {
    pub fn new(policy: PackagePolicy) -> Self {
        Self {
            policy,
            cache: DashMap::new(),
            rejected: DashMap::new(),
        }
    }

    pub fn policy(&self) -> &PackagePolicy {
        &self.policy
    }

    /// Load `package`, or return the cached unit when its code is unchanged
    pub fn load(&self, package: Arc<AgentPackage>) -> Result<Arc<LoadedAgent>, LoadError> {
        if let Some(previous) = self.rejected.get(package.name()) {
            debug!(agent = %package.name(), "not retrying rejected package");
            return Err(previous.value().clone());
        }

        match self.inspect(&package) {
            Ok((fingerprint, closure, external_symbols)) => {
                let loaded = self
                    .cache
                    .entry(fingerprint)
                    .or_insert_with(|| {
                        debug!(
                            agent = %package.name(),
                            fingerprint = %fingerprint.short(),
                            units = closure.len(),
                            externals = external_symbols.len(),
                            "loaded agent code"
                        );
                        Arc::new(LoadedAgent {
                            package: Arc::clone(&package),
                            fingerprint,
                            closure,
                            external_symbols,
                        })
                    })
                    .clone();
                Ok(loaded)
            }
            Err(err) => {
                warn!(agent = %package.name(), error = %err, "rejected agent package");
                self.rejected.insert(package.name().to_string(), err.clone());
                Err(err)
            }
        }
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    pub fn is_rejected(&self, name: &str) -> bool {
        self.rejected.contains_key(name)
    }

    fn inspect(
        &self,
        package: &AgentPackage,
    ) -> Result<(Fingerprint, Vec<String>, BTreeSet<String>), LoadError> {
        let name = package.name();
        if name.is_empty() {
            return Err(LoadError::Missing("<unnamed package>".to_string()));
        }
        if !package.is_exempt() {
            self.check_namespace(package)?;
        }

        if package.units().is_empty() {
            return Err(LoadError::Missing(name.to_string()));
        }
        let mut seen = HashSet::new();
        for unit in package.units() {
            validate_unit(unit)?;
            if !seen.insert(unit.name.as_str()) {
                return Err(LoadError::Malformed {
                    unit: unit.name.clone(),
                    reason: "duplicate unit name".to_string(),
                });
            }
        }
        let entry = package
            .entry_unit()
            .ok_or_else(|| LoadError::Missing(format!("{} (entry unit)", name)))?;

        let (closure, external_symbols) = resolve_closure(package, entry);

        if !package.is_exempt() {
            if let Some(symbol) = external_symbols.iter().find(|s| self.policy.is_internal(s)) {
                return Err(LoadError::NamespaceViolation(format!(
                    "{} references host-internal {}",
                    name, symbol
                )));
            }
        }

        let mut hasher = Sha256::new();
        for unit in &closure {
            hasher.update(unit.name.as_bytes());
            hasher.update([0u8]);
            hasher.update((unit.bytes.len() as u64).to_le_bytes());
            hasher.update(&unit.bytes);
        }
        for symbol in &external_symbols {
            hasher.update(symbol.as_bytes());
            hasher.update([0u8]);
        }
        let fingerprint = Fingerprint::from_hasher(hasher);

        let names = closure.iter().map(|u| u.name.clone()).collect();
        Ok((fingerprint, names, external_symbols))
    }

    fn check_namespace(&self, package: &AgentPackage) -> Result<(), LoadError> {
        let namespace = package.namespace();
        if namespace.is_empty() {
            return Err(LoadError::NamespaceViolation(format!(
                "{} is not in a namespace",
                package.name()
            )));
        }
        if self.policy.is_reserved_namespace(namespace) {
            return Err(LoadError::NamespaceViolation(format!(
                "{} uses the reserved namespace {}",
                package.name(),
                namespace
            )));
        }
        if !namespace.split('.').all(is_identifier) {
            return Err(LoadError::NamespaceViolation(format!(
                "{} has an invalid namespace",
                package.name()
            )));
        }
        for unit in package.units() {
            if unit.name != package.name() && !unit.name.starts_with(&format!("{}.", namespace)) {
                return Err(LoadError::NamespaceViolation(format!(
                    "unit {} lies outside namespace {}",
                    unit.name, namespace
                )));
            }
        }
        Ok(())
    }
}

fn is_identifier(segment: &str) -> bool {
    let mut chars = segment.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

fn validate_unit(unit: &CodeUnit) -> Result<(), LoadError> {
    if unit.name.is_empty() || !unit.name.split('.').all(is_identifier) {
        return Err(LoadError::Malformed {
            unit: unit.name.clone(),
            reason: "invalid unit name".to_string(),
        });
    }
    if unit.bytes.is_empty() {
        return Err(LoadError::Malformed {
            unit: unit.name.clone(),
            reason: "empty code".to_string(),
        });
    }
    if let Some(bad) = unit
        .references
        .iter()
        .find(|r| r.is_empty() || !r.split('.').all(is_identifier))
    {
        return Err(LoadError::Malformed {
            unit: unit.name.clone(),
            reason: format!("invalid reference {:?}", bad),
        });
    }
    Ok(())
}

/// Breadth-first walk from the entry unit. Returns the reachable units sorted
/// by name and the external symbols they reference.
fn resolve_closure<'a>(
    package: &'a AgentPackage,
    entry: &'a CodeUnit,
) -> (Vec<&'a CodeUnit>, BTreeSet<String>) {
    let mut visited: HashSet<&str> = HashSet::new();
    let mut queue = VecDeque::new();
    let mut closure = Vec::new();
    let mut externals = BTreeSet::new();

    visited.insert(entry.name.as_str());
    queue.push_back(entry);
    while let Some(unit) = queue.pop_front() {
        closure.push(unit);
        for reference in &unit.references {
            match package.unit(reference) {
                Some(dep) => {
                    if visited.insert(dep.name.as_str()) {
                        queue.push_back(dep);
                    }
                }
                None => {
                    externals.insert(reference.clone());
                }
            }
        }
    }

    closure.sort_by(|a, b| a.name.cmp(&b.name));
    (closure, externals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentContext, Halt};

    struct Noop;

    impl Agent for Noop {
        fn run(&mut self, ctx: &mut AgentContext) -> Result<(), Halt> {
            ctx.execute()
        }
    }

    fn loader() -> AgentLoader {
        AgentLoader::new(PackagePolicy::default())
    }

    fn refs(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn two_unit(helper_bytes: &[u8]) -> Arc<AgentPackage> {
        Arc::new(
            AgentPackage::new("team.Bot", || Noop)
                .with_unit("team.Bot", b"main".to_vec(), refs(&["team.Helper", "arena.api.Robot"]))
                .with_unit("team.Helper", helper_bytes.to_vec(), refs(&["arena.util.Math"])),
        )
    }

    #[test]
    fn test_reload_returns_identical_unit() {
        let loader = loader();
        let first = loader.load(two_unit(b"helper")).unwrap();
        let second = loader.load(two_unit(b"helper")).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(loader.cached(), 1);
    }

    #[test]
    fn test_dependency_change_changes_fingerprint() {
        let loader = loader();
        let a = loader.load(two_unit(b"helper")).unwrap();
        let b = loader.load(two_unit(b"helper v2")).unwrap();
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(loader.cached(), 2);
    }

    #[test]
    fn test_unreachable_units_ignored() {
        let loader = loader();
        let base = loader.load(two_unit(b"helper")).unwrap();
        let extra = Arc::new(
            AgentPackage::new("team.Bot", || Noop)
                .with_unit("team.Bot", b"main".to_vec(), refs(&["team.Helper", "arena.api.Robot"]))
                .with_unit("team.Helper", b"helper".to_vec(), refs(&["arena.util.Math"]))
                .with_unit("team.Unused", b"dead".to_vec(), Vec::new()),
        );
        let loaded = loader.load(extra).unwrap();
        assert_eq!(base.fingerprint(), loaded.fingerprint());
        assert_eq!(loaded.closure(), &["team.Bot".to_string(), "team.Helper".to_string()]);
    }

    #[test]
    fn test_external_symbols_recorded() {
        let loaded = loader().load(two_unit(b"helper")).unwrap();
        let symbols: Vec<_> = loaded.external_symbols().iter().cloned().collect();
        assert_eq!(symbols, refs(&["arena.api.Robot", "arena.util.Math"]));
    }

    #[test]
    fn test_unqualified_name_rejected() {
        let package = Arc::new(AgentPackage::new("Bot", || Noop).with_unit("Bot", b"x".to_vec(), Vec::new()));
        assert!(matches!(
            loader().load(package),
            Err(LoadError::NamespaceViolation(_))
        ));
    }

    #[test]
    fn test_reserved_namespace_rejected() {
        let package = Arc::new(
            AgentPackage::new("arena.Bot", || Noop).with_unit("arena.Bot", b"x".to_vec(), Vec::new()),
        );
        assert!(matches!(
            loader().load(package),
            Err(LoadError::NamespaceViolation(_))
        ));
    }

    #[test]
    fn test_host_internal_reference_rejected() {
        let package = Arc::new(AgentPackage::new("team.Bot", || Noop).with_unit(
            "team.Bot",
            b"x".to_vec(),
            refs(&["arena.host.ThreadRegistry"]),
        ));
        let err = loader().load(package).unwrap_err();
        assert!(err.to_string().contains("arena.host.ThreadRegistry"));
    }

    #[test]
    fn test_missing_and_malformed() {
        let loader = loader();
        let empty = Arc::new(AgentPackage::new("team.Empty", || Noop));
        assert!(matches!(loader.load(empty), Err(LoadError::Missing(_))));

        let no_entry = Arc::new(
            AgentPackage::new("team.NoEntry", || Noop).with_unit("team.Other", b"x".to_vec(), Vec::new()),
        );
        assert!(matches!(loader.load(no_entry), Err(LoadError::Missing(_))));

        let blank = Arc::new(
            AgentPackage::new("team.Blank", || Noop).with_unit("team.Blank", Vec::new(), Vec::new()),
        );
        assert!(matches!(
            loader.load(blank),
            Err(LoadError::Malformed { .. })
        ));
    }

    #[test]
    fn test_rejected_package_not_retried() {
        let loader = loader();
        let bad = Arc::new(AgentPackage::new("team.Fix", || Noop));
        assert!(loader.load(bad).is_err());
        assert!(loader.is_rejected("team.Fix"));

        // Fixed code under the same name stays rejected
        let fixed = Arc::new(
            AgentPackage::new("team.Fix", || Noop).with_unit("team.Fix", b"ok".to_vec(), Vec::new()),
        );
        assert!(matches!(loader.load(fixed), Err(LoadError::Missing(_))));
    }

    #[test]
    fn test_builtin_exempt() {
        let loader = loader();
        let package = Arc::new(AgentPackage::builtin("Sitting", || Noop));
        let loaded = loader.load(package).unwrap();
        assert_eq!(loaded.closure(), &["Sitting".to_string()]);
    }

    #[test]
    fn test_builtins_keep_their_own_factory() {
        struct Other;

        impl Agent for Other {
            fn run(&mut self, ctx: &mut AgentContext) -> Result<(), Halt> {
                ctx.execute()
            }
        }

        let loader = loader();
        let first = Arc::new(AgentPackage::builtin("sample.Twin", || Noop));
        let second = Arc::new(AgentPackage::builtin("sample.Twin", || Other));
        let a = loader.load(Arc::clone(&first)).unwrap();
        let b = loader.load(Arc::clone(&second)).unwrap();

        assert_ne!(a.fingerprint(), b.fingerprint());
        assert!(Arc::ptr_eq(a.package(), &first));
        assert!(Arc::ptr_eq(b.package(), &second));
        assert!(Arc::ptr_eq(&a, &loader.load(first).unwrap()));
        assert_eq!(loader.cached(), 2);
    }

    #[test]
    fn test_fingerprint_display() {
        let fp = Fingerprint::of(b"abc");
        assert_eq!(fp.to_hex().len(), 64);
        assert_eq!(format!("{}", fp), fp.to_hex());
        assert_eq!(fp.short().len(), 12);
    }
}

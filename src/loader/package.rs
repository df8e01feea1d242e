// src/loader/package.rs
//! Agent packages
//!
//! One data record ([`AgentPackage`]) describes a loadable agent. What can be
//! asked of it is split into small capability traits:
//! - [`Describable`]: name, namespace, description
//! - [`Versioned`]: version string
//! - [`Sourced`]: code units and directories on disk

use crate::agent::Agent;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub const DEFAULT_VERSION: &str = "1.0";

static BUILTIN_INSTANCES: AtomicU64 = AtomicU64::new(0);

pub trait Describable {
    /// Fully qualified name, e.g. `sample.SittingDuck`
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Everything before the last `.`; empty for unqualified names
    fn namespace(&self) -> &str {
        match self.name().rfind('.') {
            Some(idx) => &self.name()[..idx],
            None => "",
        }
    }

    fn short_name(&self) -> &str {
        match self.name().rfind('.') {
            Some(idx) => &self.name()[idx + 1..],
            None => self.name(),
        }
    }
}

pub trait Versioned {
    fn version(&self) -> &str;
}

pub trait Sourced {
    fn units(&self) -> &[CodeUnit];

    /// Directory the agent was loaded from; reads are confined here
    fn root_dir(&self) -> Option<&Path>;

    /// Directory under which the agent's private data directory lives
    fn data_root(&self) -> Option<&Path>;
}

/// One named piece of agent code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeUnit {
    pub name: String,

    pub bytes: Vec<u8>,

    /// Symbols this unit refers to: other units of the package or external ones
    pub references: Vec<String>,
}

impl CodeUnit {
    pub fn new(name: impl Into<String>, bytes: impl Into<Vec<u8>>, references: Vec<String>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
            references,
        }
    }
}

/// Creates fresh agent instances, one per round
pub trait AgentFactory: Send + Sync {
    fn create(&self) -> Box<dyn Agent>;
}

impl<F, A> AgentFactory for F
where
    F: Fn() -> A + Send + Sync,
    A: Agent + 'static,
{
    fn create(&self) -> Box<dyn Agent> {
        Box::new(self())
    }
}

/// A loadable agent
pub struct AgentPackage {
    name: String,
    version: String,
    description: String,
    units: Vec<CodeUnit>,
    root_dir: Option<PathBuf>,
    data_root: Option<PathBuf>,
    exempt: bool,
    factory: Arc<dyn AgentFactory>,
}

impl AgentPackage {
    pub fn new(name: impl Into<String>, factory: impl AgentFactory + 'static) -> Self {
        Self {
            name: name.into(),
            version: DEFAULT_VERSION.to_string(),
            description: String::new(),
            units: Vec::new(),
            root_dir: None,
            data_root: None,
            exempt: false,
            factory: Arc::new(factory),
        }
    }

    /// A package compiled into the host (samples, tests).
    ///
    /// Exempt from the namespace policy and given a single synthesized code
    /// unit, so it still fingerprints like any other package. The unit is
    /// unique per call: two built-ins never share a cached factory, even
    /// under the same name.
    pub fn builtin(name: impl Into<String>, factory: impl AgentFactory + 'static) -> Self {
        let name = name.into();
        let instance = BUILTIN_INSTANCES.fetch_add(1, Ordering::Relaxed);
        let unit = CodeUnit::new(
            name.clone(),
            format!("builtin:{}#{}", name, instance).into_bytes(),
            vec!["arena.api".to_string()],
        );
        let mut package = Self::new(name, factory);
        package.units.push(unit);
        package.exempt = true;
        package
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_unit(
        mut self,
        name: impl Into<String>,
        bytes: impl Into<Vec<u8>>,
        references: Vec<String>,
    ) -> Self {
        self.units.push(CodeUnit::new(name, bytes, references));
        self
    }

    pub fn with_root_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.root_dir = Some(dir.into());
        self
    }

    pub fn with_data_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_root = Some(dir.into());
        self
    }

    /// Skip the namespace policy for this package
    pub fn exempt(mut self) -> Self {
        self.exempt = true;
        self
    }

    pub fn is_exempt(&self) -> bool {
        self.exempt
    }

    /// Entry unit: the one named after the package
    pub fn entry_unit(&self) -> Option<&CodeUnit> {
        self.units.iter().find(|u| u.name == self.name)
    }

    pub fn unit(&self, name: &str) -> Option<&CodeUnit> {
        self.units.iter().find(|u| u.name == name)
    }

    pub(crate) fn instantiate(&self) -> Box<dyn Agent> {
        self.factory.create()
    }
}

impl Describable for AgentPackage {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }
}

impl Versioned for AgentPackage {
    fn version(&self) -> &str {
        &self.version
    }
}

impl Sourced for AgentPackage {
    fn units(&self) -> &[CodeUnit] {
        &self.units
    }

    fn root_dir(&self) -> Option<&Path> {
        self.root_dir.as_deref()
    }

    fn data_root(&self) -> Option<&Path> {
        self.data_root.as_deref()
    }
}

impl fmt::Debug for AgentPackage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentPackage")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("units", &self.units.len())
            .field("root_dir", &self.root_dir)
            .field("data_root", &self.data_root)
            .field("exempt", &self.exempt)
            .finish()
    }
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

    #[test]
    fn test_name_parts() {
        let package = AgentPackage::new("sample.deep.Walls", || Noop);
        assert_eq!(package.namespace(), "sample.deep");
        assert_eq!(package.short_name(), "Walls");

        let bare = AgentPackage::new("Walls", || Noop);
        assert_eq!(bare.namespace(), "");
        assert_eq!(bare.short_name(), "Walls");
    }

    #[test]
    fn test_builtin_has_entry_unit() {
        let package = AgentPackage::builtin("sample.Noop", || Noop).with_version("2.1");
        assert!(package.is_exempt());
        assert_eq!(package.version(), "2.1");
        let entry = package.entry_unit().unwrap();
        assert_eq!(entry.name, "sample.Noop");
        assert!(!entry.bytes.is_empty());
    }

    #[test]
    fn test_builders() {
        let package = AgentPackage::new("team.Bot", || Noop)
            .with_unit("team.Bot", b"main".to_vec(), vec!["team.Helper".to_string()])
            .with_unit("team.Helper", b"helper".to_vec(), Vec::new())
            .with_root_dir("/agents/team")
            .with_data_root("/agents/data");
        assert_eq!(package.units().len(), 2);
        assert!(package.unit("team.Helper").is_some());
        assert_eq!(package.root_dir(), Some(Path::new("/agents/team")));
        assert_eq!(package.data_root(), Some(Path::new("/agents/data")));
        assert!(!package.is_exempt());
    }
}

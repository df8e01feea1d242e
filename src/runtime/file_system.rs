// src/runtime/file_system.rs
//! Per-agent file system view
//!
//! Resolves the agent's readable and writable directories once and answers
//! the path questions the permission enforcer asks. Output handles are
//! registered here with the thread that opened them; a write through a handle
//! owned by another thread is refused.

use crate::utils::paths::{is_direct_child_or_self, is_within, resolve};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::ThreadId;

/// Suffix of every agent data directory
pub const DATA_DIR_SUFFIX: &str = ".data";

/// Registered output handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct HandleId(u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handle#{}", self.0)
    }
}

/// Answer to a read-access query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadAccess {
    Allowed,

    /// Outside every directory the agent may read
    OutsideDomain,

    /// Inside the data directory of some other agent
    ForeignData,
}

#[derive(Debug, Clone)]
struct OpenHandle {
    path: PathBuf,
    owner: ThreadId,
}

#[derive(Debug)]
pub struct AgentFileSystem {
    readable: Option<PathBuf>,
    writable: Option<PathBuf>,
    max_open: usize,
    handles: Mutex<HashMap<HandleId, OpenHandle>>,
    next_handle: AtomicU64,
}

impl AgentFileSystem {
    pub fn new(readable: Option<&Path>, writable: Option<&Path>, max_open: usize) -> Self {
        Self {
            readable: readable.map(resolve),
            writable: writable.map(resolve),
            max_open,
            handles: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    pub fn writable_dir(&self) -> Option<&Path> {
        self.writable.as_deref()
    }

    pub fn readable_dir(&self) -> Option<&Path> {
        self.readable.as_deref()
    }

    /// Total size of the files already in the writable directory
    pub fn scan_usage(&self) -> u64 {
        let Some(dir) = &self.writable else {
            return 0;
        };
        let Ok(entries) = std::fs::read_dir(dir) else {
            return 0;
        };
        entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.metadata().ok())
            .filter(|meta| meta.is_file())
            .map(|meta| meta.len())
            .sum()
    }

    pub fn read_access(&self, path: &Path) -> ReadAccess {
        let path = resolve(path);

        if let Some(own) = &self.writable {
            if is_within(&path, own) {
                return ReadAccess::Allowed;
            }
        }

        let Some(root) = &self.readable else {
            return ReadAccess::OutsideDomain;
        };
        let Ok(relative) = path.strip_prefix(root) else {
            return ReadAccess::OutsideDomain;
        };

        // Any `.data` directory below the root that is not ours belongs to someone else
        let in_foreign_data = relative
            .parent()
            .map(|parent| {
                parent.components().any(|c| {
                    c.as_os_str()
                        .to_str()
                        .map(|s| s.ends_with(DATA_DIR_SUFFIX))
                        .unwrap_or(false)
                })
            })
            .unwrap_or(false);

        if in_foreign_data {
            ReadAccess::ForeignData
        } else {
            ReadAccess::Allowed
        }
    }

    /// Files may be written or deleted only directly inside the writable directory
    pub fn is_writable(&self, path: &Path) -> bool {
        match &self.writable {
            Some(dir) => {
                let path = resolve(path);
                path != *dir && is_direct_child_or_self(&path, dir)
            }
            None => false,
        }
    }

    /// Whether `path` is the writable directory itself
    pub fn is_writable_root(&self, path: &Path) -> bool {
        match &self.writable {
            Some(dir) => resolve(path) == *dir,
            None => false,
        }
    }

    /// Resolve a file name relative to the writable directory
    pub fn data_path(&self, name: &str) -> Option<PathBuf> {
        self.writable.as_ref().map(|dir| dir.join(name))
    }

    pub fn register_handle(&self, path: &Path, owner: ThreadId) -> Result<HandleId, String> {
        let mut handles = self.handles.lock();
        if handles.len() >= self.max_open {
            return Err(format!(
                "You may only have {} files open at a time.",
                self.max_open
            ));
        }
        let id = HandleId(self.next_handle.fetch_add(1, Ordering::Relaxed));
        handles.insert(
            id,
            OpenHandle {
                path: resolve(path),
                owner,
            },
        );
        Ok(id)
    }

    /// Whether `handle` is registered to `caller` for exactly `path`
    pub fn owns_handle(&self, handle: HandleId, caller: ThreadId, path: &Path) -> bool {
        let handles = self.handles.lock();
        match handles.get(&handle) {
            Some(open) => open.owner == caller && open.path == resolve(path),
            None => false,
        }
    }

    pub fn release_handle(&self, handle: HandleId) {
        self.handles.lock().remove(&handle);
    }

    pub fn open_handles(&self) -> usize {
        self.handles.lock().len()
    }
}

//! Target process discovery and classification.

use std::path::PathBuf;
use std::sync::Arc;

use hive_core::ProcessKey;
use sysinfo::System;
use tracing::{debug, trace};

use crate::memory::{MemoryError, ProcessBackend, RemoteProcess};

/// A running process whose executable matches the target name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessCandidate {
    pub pid: u32,
    /// Start time, seconds since the Unix epoch
    pub started_at: u64,
    pub name: String,
    pub exe_path: Option<PathBuf>,
}

impl ProcessCandidate {
    pub fn key(&self) -> ProcessKey {
        ProcessKey::new(self.pid, self.started_at)
    }
}

/// Injection status of a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    NotInjected,
    AlreadyInjected,
    /// Cannot be opened (permissions, exited mid-scan)
    Ineligible,
}

/// Source of the process table.
pub trait ProcessSource: Send {
    /// Fresh snapshot of every running process.
    fn processes(&mut self) -> Vec<ProcessCandidate>;

    /// Looks up a single process by pid.
    fn lookup(&mut self, pid: u32) -> Option<ProcessCandidate> {
        self.processes().into_iter().find(|p| p.pid == pid)
    }
}

/// Process table backed by `sysinfo`.
pub struct SysinfoSource {
    system: System,
}

impl SysinfoSource {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for SysinfoSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSource for SysinfoSource {
    fn processes(&mut self) -> Vec<ProcessCandidate> {
        self.system.refresh_all();
        self.system
            .processes()
            .iter()
            .map(|(pid, process)| ProcessCandidate {
                pid: pid.as_u32(),
                started_at: process.start_time(),
                name: process.name().to_string_lossy().into_owned(),
                exe_path: process.exe().map(PathBuf::from),
            })
            .collect()
    }
}

/// True if `file_name` is among the modules mapped in `process`.
pub fn has_module(process: &dyn RemoteProcess, file_name: &str) -> Result<bool, MemoryError> {
    Ok(process.modules()?.iter().any(|m| m.matches(file_name)))
}

/// Enumerates target processes and probes them for the extension module.
pub struct ProcessScanner {
    source: Box<dyn ProcessSource>,
    backend: Arc<dyn ProcessBackend>,
    target_executable: String,
    module_name: String,
}

impl ProcessScanner {
    /// Creates a scanner.
    ///
    /// `target_executable` and `module_name` are file names, compared
    /// case-insensitively.
    pub fn new(
        source: Box<dyn ProcessSource>,
        backend: Arc<dyn ProcessBackend>,
        target_executable: impl Into<String>,
        module_name: impl Into<String>,
    ) -> Self {
        Self {
            source,
            backend,
            target_executable: target_executable.into(),
            module_name: module_name.into(),
        }
    }

    pub fn target_executable(&self) -> &str {
        &self.target_executable
    }

    /// Running processes of the target executable, recomputed on every call.
    pub fn scan(&mut self) -> impl Iterator<Item = ProcessCandidate> + '_ {
        let target = &self.target_executable;
        self.source
            .processes()
            .into_iter()
            .filter(move |p| p.name.eq_ignore_ascii_case(target))
    }

    /// Finds a target process by pid.
    pub fn lookup(&mut self, pid: u32) -> Option<ProcessCandidate> {
        self.source
            .lookup(pid)
            .filter(|p| p.name.eq_ignore_ascii_case(&self.target_executable))
    }

    /// Probes a candidate's module list for the extension module.
    pub fn classify(&self, candidate: &ProcessCandidate) -> Classification {
        let process = match self.backend.open(candidate.pid) {
            Ok(process) => process,
            Err(e) => {
                debug!(pid = candidate.pid, error = %e, "Candidate cannot be opened");
                return Classification::Ineligible;
            }
        };
        match has_module(process.as_ref(), &self.module_name) {
            Ok(true) => Classification::AlreadyInjected,
            Ok(false) => Classification::NotInjected,
            Err(e) => {
                debug!(pid = candidate.pid, error = %e, "Module probe failed");
                Classification::Ineligible
            }
        }
    }

    /// Scans and classifies, dropping ineligible candidates.
    pub fn scan_classified(&mut self) -> Vec<(ProcessCandidate, Classification)> {
        let candidates: Vec<_> = self.scan().collect();
        candidates
            .into_iter()
            .filter_map(|candidate| match self.classify(&candidate) {
                Classification::Ineligible => None,
                class => {
                    trace!(pid = candidate.pid, ?class, "Classified candidate");
                    Some((candidate, class))
                }
            })
            .collect()
    }
}

//! Loader-thread injection of the extension module.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use hive_core::RemoteAddress;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::memory::{MemoryError, ProcessBackend, RemoteProcess, ThreadWait};
use crate::resolver::{resolve_export, resolve_module};
use crate::scanner::has_module;

/// Default module hosting the loader entry point.
pub const DEFAULT_LOADER_MODULE: &str = "kernel32.dll";

/// Default loader entry point; takes a wide, NUL-terminated path.
pub const DEFAULT_LOADER_SYMBOL: &str = "LoadLibraryW";

/// Default time to wait for the loader thread.
pub const DEFAULT_INJECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Settings for an [`Injector`].
#[derive(Debug, Clone)]
pub struct InjectorConfig {
    /// Absolute path of the extension module on disk
    pub module_path: PathBuf,
    pub loader_module: String,
    pub loader_symbol: String,
    pub timeout: Duration,
}

impl InjectorConfig {
    pub fn new(module_path: impl Into<PathBuf>) -> Self {
        Self {
            module_path: module_path.into(),
            loader_module: DEFAULT_LOADER_MODULE.to_string(),
            loader_symbol: DEFAULT_LOADER_SYMBOL.to_string(),
            timeout: DEFAULT_INJECT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// File name of the module, used to detect prior injection.
    pub fn module_file_name(&self) -> Option<String> {
        self.module_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
    }
}

/// Successful injection result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectOutcome {
    Injected,
    /// The module was already mapped; nothing was touched.
    AlreadyInjected,
}

/// Injection failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InjectError {
    #[error("Access denied to process {pid}")]
    AccessDenied { pid: u32 },

    #[error("Loader thread in process {pid} did not finish within {timeout:?}")]
    Timeout { pid: u32, timeout: Duration },

    #[error("Injection into process {pid} failed: {reason}")]
    RemoteFault { pid: u32, reason: String },

    #[error("Process {pid} is not eligible: {reason}")]
    Ineligible { pid: u32, reason: String },
}

impl InjectError {
    pub fn pid(&self) -> u32 {
        match self {
            Self::AccessDenied { pid }
            | Self::Timeout { pid, .. }
            | Self::RemoteFault { pid, .. }
            | Self::Ineligible { pid, .. } => *pid,
        }
    }

    fn fault(pid: u32, reason: impl ToString) -> Self {
        Self::RemoteFault {
            pid,
            reason: reason.to_string(),
        }
    }
}

/// Places the extension module into target processes.
///
/// Blocking: runs remote reads and waits on a remote thread. Async callers
/// should go through `spawn_blocking`. Never retries.
pub struct Injector {
    backend: Arc<dyn ProcessBackend>,
    config: InjectorConfig,
}

impl Injector {
    pub fn new(backend: Arc<dyn ProcessBackend>, config: InjectorConfig) -> Self {
        Self { backend, config }
    }

    pub fn config(&self) -> &InjectorConfig {
        &self.config
    }

    /// Injects the configured module into `pid`.
    pub fn inject(&self, pid: u32) -> Result<InjectOutcome, InjectError> {
        if !self.config.module_path.is_absolute() {
            return Err(InjectError::Ineligible {
                pid,
                reason: format!(
                    "module path {} is not absolute",
                    self.config.module_path.display()
                ),
            });
        }
        let module_name = self.config.module_file_name().ok_or_else(|| InjectError::Ineligible {
            pid,
            reason: "module path has no file name".to_string(),
        })?;

        let process = self.backend.open(pid).map_err(|e| open_error(pid, e))?;

        match has_module(process.as_ref(), &module_name) {
            Ok(true) => {
                debug!(pid, module = %module_name, "Module already present");
                return Ok(InjectOutcome::AlreadyInjected);
            }
            Ok(false) => {}
            Err(e) => return Err(open_error(pid, e)),
        }

        let path = wide_path(&self.config.module_path);
        let path_addr = process.alloc(path.len()).map_err(|e| InjectError::fault(pid, e))?;

        match self.load(process.as_ref(), path_addr, &path, &module_name) {
            LoadResult::Done(result) => {
                if let Err(e) = process.free(path_addr) {
                    warn!(pid, error = %e, "Failed to release path buffer");
                }
                result?;
                info!(pid, module = %module_name, "Module injected");
                Ok(InjectOutcome::Injected)
            }
            LoadResult::Abandoned(err) => {
                // The loader thread may still read the path; leave it mapped.
                warn!(pid, address = %path_addr, error = %err, "Loader thread abandoned, path buffer leaked");
                Err(err)
            }
        }
    }

    /// Writes the path and runs the loader thread. The caller owns `path_addr`.
    fn load(
        &self,
        process: &dyn RemoteProcess,
        path_addr: RemoteAddress,
        path: &[u8],
        module_name: &str,
    ) -> LoadResult {
        let pid = process.pid();

        if let Err(e) = process.write(path_addr, path) {
            return LoadResult::Done(Err(InjectError::fault(pid, e)));
        }

        let loader = match resolve_module(process, &self.config.loader_module)
            .and_then(|base| resolve_export(process, base, &self.config.loader_symbol))
        {
            Ok(address) => address,
            Err(e) => return LoadResult::Done(Err(InjectError::fault(pid, e))),
        };
        debug!(pid, loader = %loader, symbol = %self.config.loader_symbol, "Resolved loader");

        let mut thread = match process.spawn_thread(loader, path_addr) {
            Ok(thread) => thread,
            Err(MemoryError::AccessDenied { .. }) => {
                return LoadResult::Done(Err(InjectError::AccessDenied { pid }))
            }
            Err(e) => return LoadResult::Done(Err(InjectError::fault(pid, e))),
        };

        match thread.wait(self.config.timeout) {
            // The exit code holds only the low 32 bits of the module handle.
            Ok(ThreadWait::Exited(0)) => match has_module(process, module_name) {
                Ok(true) => {
                    debug!(pid, "Loader exit code truncated to zero, module is mapped");
                    LoadResult::Done(Ok(()))
                }
                _ => LoadResult::Done(Err(InjectError::fault(
                    pid,
                    format!("{} returned null", self.config.loader_symbol),
                ))),
            },
            Ok(ThreadWait::Exited(code)) => {
                debug!(pid, exit_code = code, "Loader thread finished");
                LoadResult::Done(Ok(()))
            }
            Ok(ThreadWait::TimedOut) => LoadResult::Abandoned(InjectError::Timeout {
                pid,
                timeout: self.config.timeout,
            }),
            Err(e) => LoadResult::Abandoned(InjectError::fault(pid, e)),
        }
    }
}

enum LoadResult {
    /// The loader is no longer running; the path buffer can be freed.
    Done(Result<(), InjectError>),
    /// The loader may still be running.
    Abandoned(InjectError),
}

fn open_error(pid: u32, err: MemoryError) -> InjectError {
    match err {
        MemoryError::AccessDenied { .. } => InjectError::AccessDenied { pid },
        other => InjectError::Ineligible {
            pid,
            reason: other.to_string(),
        },
    }
}

/// UTF-16LE, NUL-terminated encoding of `path`.
pub fn wide_path(path: &Path) -> Vec<u8> {
    path.to_string_lossy()
        .encode_utf16()
        .chain(std::iter::once(0))
        .flat_map(u16::to_le_bytes)
        .collect()
}

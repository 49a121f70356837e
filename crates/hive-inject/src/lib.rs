//! hive inject - places the extension module into target processes
//!
//! - [`scanner`] finds target processes and probes them for the module
//! - [`resolver`] resolves remote module bases and exports from PE headers
//! - [`injector`] runs the loader through a remote thread
//!
//! All remote access goes through the [`memory`] traits. [`default_backend`]
//! returns the Win32 implementation on Windows; elsewhere every open fails
//! with [`MemoryError::Unsupported`]. The `mock` feature adds an in-memory
//! backend for tests.

pub mod injector;
pub mod memory;
pub mod resolver;
pub mod scanner;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

#[cfg(windows)]
mod win32;

use std::sync::Arc;

pub use injector::{InjectError, InjectOutcome, Injector, InjectorConfig};
pub use memory::{MemoryError, ModuleInfo, ProcessBackend, RemoteProcess, RemoteThread, ThreadWait};
pub use resolver::{resolve_export, resolve_module, resolve_ordinal, ResolveError};
pub use scanner::{Classification, ProcessCandidate, ProcessScanner, ProcessSource, SysinfoSource};

#[cfg(windows)]
pub use win32::WindowsBackend;

/// Backend for hosts without remote process support.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedBackend;

impl ProcessBackend for UnsupportedBackend {
    fn open(&self, _pid: u32) -> Result<Box<dyn RemoteProcess>, MemoryError> {
        Err(MemoryError::Unsupported)
    }
}

/// The native backend for this platform.
pub fn default_backend() -> Arc<dyn ProcessBackend> {
    #[cfg(windows)]
    {
        Arc::new(WindowsBackend)
    }
    #[cfg(not(windows))]
    {
        Arc::new(UnsupportedBackend)
    }
}

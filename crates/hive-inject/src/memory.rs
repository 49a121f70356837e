//! Cross-process memory and thread primitives.
//!
//! The injection engine only talks to other processes through these traits.
//! The Windows backend implements them over Win32 calls; the `mock` feature
//! provides an in-memory implementation for tests.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use hive_core::RemoteAddress;
use thiserror::Error;

/// A module mapped into a remote process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    /// File name as reported by the loader, e.g. `KERNEL32.DLL`
    pub name: String,
    /// Full path on disk, when known
    pub path: Option<PathBuf>,
    pub base: RemoteAddress,
    pub size: u32,
}

impl ModuleInfo {
    /// Case-insensitive file-name comparison.
    pub fn matches(&self, file_name: &str) -> bool {
        self.name.eq_ignore_ascii_case(file_name)
    }
}

/// Outcome of waiting on a remote thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadWait {
    Exited(u32),
    TimedOut,
}

/// A thread started inside a remote process.
pub trait RemoteThread: Send {
    /// Blocks up to `timeout` for the thread to finish.
    fn wait(&mut self, timeout: Duration) -> Result<ThreadWait, MemoryError>;
}

/// An opened handle on another process.
///
/// Every address passed in must belong to this process; implementations
/// reject foreign addresses with [`MemoryError::ForeignAddress`].
pub trait RemoteProcess: Send {
    fn pid(&self) -> u32;

    /// Snapshot of currently mapped modules.
    fn modules(&self) -> Result<Vec<ModuleInfo>, MemoryError>;

    /// Fills `buf` from `addr`. Partial reads are errors.
    fn read(&self, addr: RemoteAddress, buf: &mut [u8]) -> Result<(), MemoryError>;

    fn write(&self, addr: RemoteAddress, data: &[u8]) -> Result<(), MemoryError>;

    /// Reserves and commits a read/write region of at least `len` bytes.
    fn alloc(&self, len: usize) -> Result<RemoteAddress, MemoryError>;

    fn free(&self, addr: RemoteAddress) -> Result<(), MemoryError>;

    /// Starts a thread at `entry` with `arg` as its single parameter.
    fn spawn_thread(
        &self,
        entry: RemoteAddress,
        arg: RemoteAddress,
    ) -> Result<Box<dyn RemoteThread>, MemoryError>;
}

/// Opens processes by pid.
pub trait ProcessBackend: Send + Sync {
    fn open(&self, pid: u32) -> Result<Box<dyn RemoteProcess>, MemoryError>;
}

/// Errors raised by remote process operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MemoryError {
    #[error("Access denied to process {pid}")]
    AccessDenied { pid: u32 },

    #[error("Process {pid} is not running")]
    ProcessGone { pid: u32 },

    #[error("Cannot read {len} bytes at {address}")]
    Unreadable { address: RemoteAddress, len: usize },

    #[error("Cannot write {len} bytes at {address}")]
    Unwritable { address: RemoteAddress, len: usize },

    #[error("Address {address} does not belong to process {pid}")]
    ForeignAddress { address: RemoteAddress, pid: u32 },

    #[error("{op} failed: {message}")]
    Os { op: &'static str, message: String },

    #[error("Remote process access is not supported on this platform")]
    Unsupported,
}

impl MemoryError {
    pub fn os(op: &'static str, err: impl fmt::Display) -> Self {
        Self::Os {
            op,
            message: err.to_string(),
        }
    }
}

// ============================================================================
// Typed reads
// ============================================================================

pub(crate) fn read_array<const N: usize>(
    process: &dyn RemoteProcess,
    addr: RemoteAddress,
) -> Result<[u8; N], MemoryError> {
    let mut buf = [0u8; N];
    process.read(addr, &mut buf)?;
    Ok(buf)
}

pub(crate) fn read_u16(process: &dyn RemoteProcess, addr: RemoteAddress) -> Result<u16, MemoryError> {
    read_array::<2>(process, addr).map(u16::from_le_bytes)
}

pub(crate) fn read_u32(process: &dyn RemoteProcess, addr: RemoteAddress) -> Result<u32, MemoryError> {
    read_array::<4>(process, addr).map(u32::from_le_bytes)
}

/// Reads a NUL-terminated ASCII string of at most `max` bytes.
///
/// Returns `None` if no terminator is found within `max` bytes.
pub(crate) fn read_cstr(
    process: &dyn RemoteProcess,
    addr: RemoteAddress,
    max: usize,
) -> Result<Option<Vec<u8>>, MemoryError> {
    const CHUNK: usize = 64;
    let mut out = Vec::new();
    let mut cursor = addr;

    while out.len() < max {
        let mut chunk = [0u8; CHUNK];
        let want = CHUNK.min(max - out.len());
        let slice = chunk.get_mut(..want).unwrap_or_default();
        if process.read(cursor, slice).is_err() {
            // The string may end right before an unmapped page; fall back to
            // byte reads for this chunk.
            return match read_cstr_bytewise(process, cursor, max - out.len())? {
                Some(tail) => {
                    out.extend_from_slice(&tail);
                    Ok(Some(out))
                }
                None => Ok(None),
            };
        }
        if let Some(nul) = slice.iter().position(|b| *b == 0) {
            out.extend_from_slice(slice.get(..nul).unwrap_or_default());
            return Ok(Some(out));
        }
        out.extend_from_slice(slice);
        cursor = match cursor.offset(want as u64) {
            Some(next) => next,
            None => return Ok(None),
        };
    }
    Ok(None)
}

fn read_cstr_bytewise(
    process: &dyn RemoteProcess,
    addr: RemoteAddress,
    max: usize,
) -> Result<Option<Vec<u8>>, MemoryError> {
    let mut out = Vec::new();
    for i in 0..max {
        let at = addr.offset(i as u64).ok_or(MemoryError::Unreadable {
            address: addr,
            len: max,
        })?;
        let [byte] = read_array::<1>(process, at)?;
        if byte == 0 {
            return Ok(Some(out));
        }
        out.push(byte);
    }
    Ok(None)
}

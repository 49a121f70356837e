//! Win32 implementation of the remote process primitives.

use std::ffi::c_void;
use std::mem::size_of;
use std::path::PathBuf;
use std::time::Duration;

use hive_core::RemoteAddress;
use tracing::trace;
use windows::Win32::Foundation::{
    CloseHandle, ERROR_ACCESS_DENIED, ERROR_INVALID_PARAMETER, HANDLE, WAIT_OBJECT_0, WAIT_TIMEOUT,
};
use windows::Win32::System::Diagnostics::Debug::{ReadProcessMemory, WriteProcessMemory};
use windows::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, Module32FirstW, Module32NextW, MODULEENTRY32W, TH32CS_SNAPMODULE,
    TH32CS_SNAPMODULE32,
};
use windows::Win32::System::Memory::{
    VirtualAllocEx, VirtualFreeEx, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE,
};
use windows::Win32::System::Threading::{
    CreateRemoteThread, GetExitCodeThread, OpenProcess, WaitForSingleObject,
    LPTHREAD_START_ROUTINE, PROCESS_CREATE_THREAD, PROCESS_QUERY_INFORMATION, PROCESS_VM_OPERATION,
    PROCESS_VM_READ, PROCESS_VM_WRITE,
};

use crate::memory::{MemoryError, ModuleInfo, ProcessBackend, RemoteProcess, RemoteThread, ThreadWait};

/// Owned Win32 handle, closed on drop.
struct OwnedHandle(HANDLE);

// Process and thread handles may be used from any thread.
unsafe impl Send for OwnedHandle {}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        if !self.0.is_invalid() {
            // SAFETY: the handle was returned by a successful Win32 call and
            // is closed exactly once.
            let _ = unsafe { CloseHandle(self.0) };
        }
    }
}

fn map_open_error(pid: u32, err: windows::core::Error) -> MemoryError {
    if err.code() == ERROR_ACCESS_DENIED.to_hresult() {
        MemoryError::AccessDenied { pid }
    } else if err.code() == ERROR_INVALID_PARAMETER.to_hresult() {
        MemoryError::ProcessGone { pid }
    } else {
        MemoryError::os("OpenProcess", err)
    }
}

fn wide_to_string(units: &[u16]) -> String {
    let len = units.iter().position(|u| *u == 0).unwrap_or(units.len());
    String::from_utf16_lossy(units.get(..len).unwrap_or_default())
}

/// Opens processes through `OpenProcess`.
#[derive(Debug, Default, Clone, Copy)]
pub struct WindowsBackend;

impl ProcessBackend for WindowsBackend {
    fn open(&self, pid: u32) -> Result<Box<dyn RemoteProcess>, MemoryError> {
        let access = PROCESS_CREATE_THREAD
            | PROCESS_QUERY_INFORMATION
            | PROCESS_VM_OPERATION
            | PROCESS_VM_READ
            | PROCESS_VM_WRITE;
        // SAFETY: plain FFI call; the returned handle is owned below.
        let handle = unsafe { OpenProcess(access, false, pid) }.map_err(|e| map_open_error(pid, e))?;
        Ok(Box::new(WindowsProcess {
            pid,
            handle: OwnedHandle(handle),
        }))
    }
}

struct WindowsProcess {
    pid: u32,
    handle: OwnedHandle,
}

impl WindowsProcess {
    fn ptr(&self, addr: RemoteAddress) -> Result<*mut c_void, MemoryError> {
        if addr.pid() != self.pid {
            return Err(MemoryError::ForeignAddress {
                address: addr,
                pid: self.pid,
            });
        }
        Ok(addr.value() as usize as *mut c_void)
    }
}

impl RemoteProcess for WindowsProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn modules(&self) -> Result<Vec<ModuleInfo>, MemoryError> {
        // SAFETY: snapshot handle is owned and closed on drop.
        let snapshot = unsafe {
            CreateToolhelp32Snapshot(TH32CS_SNAPMODULE | TH32CS_SNAPMODULE32, self.pid)
        }
        .map_err(|e| map_open_error(self.pid, e))?;
        let snapshot = OwnedHandle(snapshot);

        let mut entry = MODULEENTRY32W {
            dwSize: size_of::<MODULEENTRY32W>() as u32,
            ..Default::default()
        };
        let mut modules = Vec::new();
        // SAFETY: `entry` is a properly sized MODULEENTRY32W.
        let mut next = unsafe { Module32FirstW(snapshot.0, &mut entry) };
        while next.is_ok() {
            let path = wide_to_string(&entry.szExePath);
            modules.push(ModuleInfo {
                name: wide_to_string(&entry.szModule),
                path: (!path.is_empty()).then(|| PathBuf::from(path)),
                base: RemoteAddress::new(self.pid, entry.modBaseAddr as usize as u64),
                size: entry.modBaseSize,
            });
            // SAFETY: as above.
            next = unsafe { Module32NextW(snapshot.0, &mut entry) };
        }
        trace!(pid = self.pid, count = modules.len(), "Enumerated modules");
        Ok(modules)
    }

    fn read(&self, addr: RemoteAddress, buf: &mut [u8]) -> Result<(), MemoryError> {
        let ptr = self.ptr(addr)?;
        let mut read = 0usize;
        // SAFETY: `buf` is valid for `buf.len()` bytes of writes.
        let result = unsafe {
            ReadProcessMemory(
                self.handle.0,
                ptr,
                buf.as_mut_ptr().cast(),
                buf.len(),
                Some(&mut read),
            )
        };
        if result.is_err() || read != buf.len() {
            return Err(MemoryError::Unreadable {
                address: addr,
                len: buf.len(),
            });
        }
        Ok(())
    }

    fn write(&self, addr: RemoteAddress, data: &[u8]) -> Result<(), MemoryError> {
        let ptr = self.ptr(addr)?;
        let mut written = 0usize;
        // SAFETY: `data` is valid for `data.len()` bytes of reads.
        let result = unsafe {
            WriteProcessMemory(
                self.handle.0,
                ptr,
                data.as_ptr().cast(),
                data.len(),
                Some(&mut written),
            )
        };
        if result.is_err() || written != data.len() {
            return Err(MemoryError::Unwritable {
                address: addr,
                len: data.len(),
            });
        }
        Ok(())
    }

    fn alloc(&self, len: usize) -> Result<RemoteAddress, MemoryError> {
        // SAFETY: allocates in the target; no local memory is touched.
        let ptr = unsafe {
            VirtualAllocEx(
                self.handle.0,
                None,
                len,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_READWRITE,
            )
        };
        if ptr.is_null() {
            return Err(MemoryError::os("VirtualAllocEx", std::io::Error::last_os_error()));
        }
        Ok(RemoteAddress::new(self.pid, ptr as usize as u64))
    }

    fn free(&self, addr: RemoteAddress) -> Result<(), MemoryError> {
        let ptr = self.ptr(addr)?;
        // SAFETY: `ptr` came from VirtualAllocEx in this process.
        unsafe { VirtualFreeEx(self.handle.0, ptr, 0, MEM_RELEASE) }
            .map_err(|e| MemoryError::os("VirtualFreeEx", e))
    }

    fn spawn_thread(
        &self,
        entry: RemoteAddress,
        arg: RemoteAddress,
    ) -> Result<Box<dyn RemoteThread>, MemoryError> {
        let entry_ptr = self.ptr(entry)?;
        let arg_ptr = self.ptr(arg)?;
        // SAFETY: the start routine is an address in the target process; it
        // is never called locally.
        let routine: LPTHREAD_START_ROUTINE = unsafe { std::mem::transmute(entry_ptr) };
        // SAFETY: FFI call; the returned handle is owned below.
        let handle = unsafe {
            CreateRemoteThread(
                self.handle.0,
                None,
                0,
                routine,
                Some(arg_ptr.cast_const()),
                0,
                None,
            )
        }
        .map_err(|e| {
            if e.code() == ERROR_ACCESS_DENIED.to_hresult() {
                MemoryError::AccessDenied { pid: self.pid }
            } else {
                MemoryError::os("CreateRemoteThread", e)
            }
        })?;
        Ok(Box::new(WindowsThread {
            handle: OwnedHandle(handle),
        }))
    }
}

struct WindowsThread {
    handle: OwnedHandle,
}

impl RemoteThread for WindowsThread {
    fn wait(&mut self, timeout: Duration) -> Result<ThreadWait, MemoryError> {
        let millis = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX - 1);
        // SAFETY: waits on an owned thread handle.
        let status = unsafe { WaitForSingleObject(self.handle.0, millis) };
        if status == WAIT_TIMEOUT {
            return Ok(ThreadWait::TimedOut);
        }
        if status != WAIT_OBJECT_0 {
            return Err(MemoryError::os("WaitForSingleObject", std::io::Error::last_os_error()));
        }
        let mut code = 0u32;
        // SAFETY: `code` is a valid out pointer.
        unsafe { GetExitCodeThread(self.handle.0, &mut code) }
            .map_err(|e| MemoryError::os("GetExitCodeThread", e))?;
        Ok(ThreadWait::Exited(code))
    }
}

//! In-memory process backend for tests.
//!
//! [`MockBackend`] hosts fake processes with byte-addressable memory regions
//! and a module list. Synthetic images built with [`PeImageBuilder`] can be
//! mapped into them so the resolver walks real export tables. A process can
//! expose a loader export that, when run through `spawn_thread`, reads the
//! wide path argument and maps a module of that name, like `LoadLibraryW`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use hive_core::RemoteAddress;

use crate::memory::{MemoryError, ModuleInfo, ProcessBackend, RemoteProcess, RemoteThread, ThreadWait};

const ALLOC_BASE: u64 = 0x0000_0200_0000_0000;
const LOADED_MODULE_BASE: u64 = 0x0000_7ff6_1000_0000;
const MODULE_STRIDE: u64 = 0x0100_0000;

/// How the simulated loader reacts when invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoaderBehavior {
    /// Maps the requested module and returns its base.
    #[default]
    Load,
    /// Maps the module at a 4 GiB-aligned base, so the 32-bit exit code
    /// is zero although the load succeeded.
    LoadAligned,
    /// Returns null without mapping anything.
    Fail,
    /// Never finishes; every wait times out.
    Hang,
}

#[derive(Debug, Default)]
struct MockProcessState {
    modules: Vec<ModuleInfo>,
    regions: Vec<(u64, Vec<u8>)>,
    allocations: Vec<u64>,
    next_alloc: u64,
    next_module: u64,
    loader: Option<(u64, LoaderBehavior)>,
    deny_access: bool,
    threads_started: usize,
}

impl MockProcessState {
    fn region(&self, addr: u64, len: usize) -> Option<(usize, usize)> {
        self.regions.iter().enumerate().find_map(|(idx, (base, bytes))| {
            let start = addr.checked_sub(*base)? as usize;
            (start.checked_add(len)? <= bytes.len()).then_some((idx, start))
        })
    }

    fn map(&mut self, base: u64, bytes: Vec<u8>) {
        self.regions.push((base, bytes));
    }
}

type Shared = Arc<Mutex<HashMap<u32, MockProcessState>>>;

fn lock(shared: &Shared) -> MutexGuard<'_, HashMap<u32, MockProcessState>> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Backend over a table of fake processes.
#[derive(Debug, Clone, Default)]
pub struct MockBackend {
    processes: Shared,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an empty process.
    pub fn spawn(&self, pid: u32) {
        lock(&self.processes).insert(
            pid,
            MockProcessState {
                next_alloc: ALLOC_BASE,
                next_module: LOADED_MODULE_BASE,
                ..MockProcessState::default()
            },
        );
    }

    /// Adds a process with a `kernel32.dll` exporting `LoadLibraryW`.
    pub fn spawn_with_loader(&self, pid: u32, behavior: LoaderBehavior) {
        self.spawn(pid);
        let loader_rva = 0x1040;
        let image = PeImageBuilder::new()
            .export("GetProcAddress", 0x1010)
            .export("LoadLibraryW", loader_rva)
            .build();
        let base = 0x0000_7ffb_0000_0000;
        self.map_module(pid, "KERNEL32.DLL", base, image);
        self.with(pid, |state| state.loader = Some((base + loader_rva as u64, behavior)));
    }

    pub fn kill(&self, pid: u32) {
        lock(&self.processes).remove(&pid);
    }

    pub fn deny_access(&self, pid: u32) {
        self.with(pid, |state| state.deny_access = true);
    }

    pub fn set_loader_behavior(&self, pid: u32, behavior: LoaderBehavior) {
        self.with(pid, |state| {
            if let Some((_, current)) = state.loader.as_mut() {
                *current = behavior;
            }
        });
    }

    /// Maps `image` at `base` and lists it as module `name`.
    pub fn map_module(&self, pid: u32, name: &str, base: u64, image: Vec<u8>) {
        let size = image.len() as u32;
        self.with(pid, |state| {
            state.map(base, image);
            state.modules.push(ModuleInfo {
                name: name.to_string(),
                path: None,
                base: RemoteAddress::new(pid, base),
                size,
            });
        });
    }

    pub fn module_names(&self, pid: u32) -> Vec<String> {
        lock(&self.processes)
            .get(&pid)
            .map(|state| state.modules.iter().map(|m| m.name.clone()).collect())
            .unwrap_or_default()
    }

    /// Remote allocations not yet freed.
    pub fn live_allocations(&self, pid: u32) -> usize {
        lock(&self.processes)
            .get(&pid)
            .map(|state| state.allocations.len())
            .unwrap_or_default()
    }

    pub fn threads_started(&self, pid: u32) -> usize {
        lock(&self.processes)
            .get(&pid)
            .map(|state| state.threads_started)
            .unwrap_or_default()
    }

    fn with(&self, pid: u32, f: impl FnOnce(&mut MockProcessState)) {
        if let Some(state) = lock(&self.processes).get_mut(&pid) {
            f(state);
        }
    }
}

impl ProcessBackend for MockBackend {
    fn open(&self, pid: u32) -> Result<Box<dyn RemoteProcess>, MemoryError> {
        match lock(&self.processes).get(&pid) {
            None => Err(MemoryError::ProcessGone { pid }),
            Some(state) if state.deny_access => Err(MemoryError::AccessDenied { pid }),
            Some(_) => Ok(Box::new(MockProcess {
                pid,
                processes: Arc::clone(&self.processes),
            })),
        }
    }
}

/// Handle on a fake process.
pub struct MockProcess {
    pid: u32,
    processes: Shared,
}

impl MockProcess {
    fn state<T>(
        &self,
        f: impl FnOnce(&mut MockProcessState) -> Result<T, MemoryError>,
    ) -> Result<T, MemoryError> {
        let mut table = lock(&self.processes);
        let state = table
            .get_mut(&self.pid)
            .ok_or(MemoryError::ProcessGone { pid: self.pid })?;
        f(state)
    }

    fn own(&self, addr: RemoteAddress) -> Result<u64, MemoryError> {
        if addr.pid() != self.pid {
            return Err(MemoryError::ForeignAddress {
                address: addr,
                pid: self.pid,
            });
        }
        Ok(addr.value())
    }
}

impl RemoteProcess for MockProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn modules(&self) -> Result<Vec<ModuleInfo>, MemoryError> {
        self.state(|state| Ok(state.modules.clone()))
    }

    fn read(&self, addr: RemoteAddress, buf: &mut [u8]) -> Result<(), MemoryError> {
        let at = self.own(addr)?;
        self.state(|state| {
            let unreadable = MemoryError::Unreadable {
                address: addr,
                len: buf.len(),
            };
            let (idx, start) = state.region(at, buf.len()).ok_or(unreadable.clone())?;
            let src = state
                .regions
                .get(idx)
                .and_then(|(_, bytes)| bytes.get(start..start + buf.len()))
                .ok_or(unreadable)?;
            buf.copy_from_slice(src);
            Ok(())
        })
    }

    fn write(&self, addr: RemoteAddress, data: &[u8]) -> Result<(), MemoryError> {
        let at = self.own(addr)?;
        self.state(|state| {
            let unwritable = MemoryError::Unwritable {
                address: addr,
                len: data.len(),
            };
            let (idx, start) = state.region(at, data.len()).ok_or(unwritable.clone())?;
            let dst = state
                .regions
                .get_mut(idx)
                .and_then(|(_, bytes)| bytes.get_mut(start..start + data.len()))
                .ok_or(unwritable)?;
            dst.copy_from_slice(data);
            Ok(())
        })
    }

    fn alloc(&self, len: usize) -> Result<RemoteAddress, MemoryError> {
        let pid = self.pid;
        self.state(|state| {
            let base = state.next_alloc;
            state.next_alloc += (len as u64).max(1).next_multiple_of(0x1000);
            state.map(base, vec![0; len]);
            state.allocations.push(base);
            Ok(RemoteAddress::new(pid, base))
        })
    }

    fn free(&self, addr: RemoteAddress) -> Result<(), MemoryError> {
        let at = self.own(addr)?;
        self.state(|state| {
            let before = state.allocations.len();
            state.allocations.retain(|base| *base != at);
            if state.allocations.len() == before {
                return Err(MemoryError::os("VirtualFreeEx", "not an allocation"));
            }
            state.regions.retain(|(base, _)| *base != at);
            Ok(())
        })
    }

    fn spawn_thread(
        &self,
        entry: RemoteAddress,
        arg: RemoteAddress,
    ) -> Result<Box<dyn RemoteThread>, MemoryError> {
        let entry = self.own(entry)?;
        let behavior = self.state(|state| {
            state.threads_started += 1;
            match state.loader {
                Some((loader, behavior)) if loader == entry => Ok(behavior),
                _ => Err(MemoryError::os("CreateRemoteThread", "entry is not a known routine")),
            }
        })?;

        let exit = match behavior {
            LoaderBehavior::Hang => None,
            LoaderBehavior::Fail => Some(0),
            LoaderBehavior::Load => Some(self.simulate_load(arg, false)?),
            LoaderBehavior::LoadAligned => Some(self.simulate_load(arg, true)?),
        };
        Ok(Box::new(MockThread { exit }))
    }
}

impl MockProcess {
    /// Reads the wide path at `arg` and maps a module named after it.
    fn simulate_load(&self, arg: RemoteAddress, aligned: bool) -> Result<u32, MemoryError> {
        let mut units = Vec::new();
        let mut cursor = arg;
        loop {
            let mut pair = [0u8; 2];
            self.read(cursor, &mut pair)?;
            let unit = u16::from_le_bytes(pair);
            if unit == 0 {
                break;
            }
            units.push(unit);
            cursor = cursor.offset(2).ok_or(MemoryError::Unreadable {
                address: cursor,
                len: 2,
            })?;
        }
        let path = PathBuf::from(String::from_utf16_lossy(&units));
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let pid = self.pid;
        self.state(|state| {
            let base = if aligned {
                (state.next_module + 0xffff_ffff) & !0xffff_ffff
            } else {
                state.next_module
            };
            state.next_module = base + MODULE_STRIDE;
            state.map(base, PeImageBuilder::new().build());
            state.modules.push(ModuleInfo {
                name,
                path: Some(path),
                base: RemoteAddress::new(pid, base),
                size: 0x2000,
            });
            Ok(base as u32)
        })
    }
}

struct MockThread {
    exit: Option<u32>,
}

impl RemoteThread for MockThread {
    fn wait(&mut self, _timeout: Duration) -> Result<ThreadWait, MemoryError> {
        Ok(match self.exit {
            Some(code) => ThreadWait::Exited(code),
            None => ThreadWait::TimedOut,
        })
    }
}

// ============================================================================
// Synthetic PE images
// ============================================================================

#[derive(Debug, Clone)]
enum ExportBody {
    Rva(u32),
    Forward(String),
}

/// Builds minimal PE32+ images with an export directory.
#[derive(Debug, Clone)]
pub struct PeImageBuilder {
    ordinal_base: u32,
    exports: Vec<(Option<String>, ExportBody)>,
    size_of_image: u32,
}

impl Default for PeImageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PeImageBuilder {
    const NT_OFFSET: usize = 0x80;
    const EXPORT_DIR_RVA: usize = 0x200;

    pub fn new() -> Self {
        Self {
            ordinal_base: 1,
            exports: Vec::new(),
            size_of_image: 0x2000,
        }
    }

    pub fn ordinal_base(mut self, base: u32) -> Self {
        self.ordinal_base = base;
        self
    }

    /// Named export at `rva`. Ordinals follow insertion order.
    pub fn export(mut self, name: &str, rva: u32) -> Self {
        self.exports.push((Some(name.to_string()), ExportBody::Rva(rva)));
        self
    }

    /// Export reachable only by ordinal.
    pub fn export_unnamed(mut self, rva: u32) -> Self {
        self.exports.push((None, ExportBody::Rva(rva)));
        self
    }

    /// Named export forwarded to `target` (e.g. `"NTDLL.RtlFoo"`).
    pub fn forward(mut self, name: &str, target: &str) -> Self {
        self.exports
            .push((Some(name.to_string()), ExportBody::Forward(target.to_string())));
        self
    }

    pub fn size_of_image(mut self, size: u32) -> Self {
        self.size_of_image = size;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut image = vec![0u8; Self::EXPORT_DIR_RVA];

        // DOS header
        put(&mut image, 0, b"MZ");
        put(&mut image, 0x3C, &(Self::NT_OFFSET as u32).to_le_bytes());

        // NT headers: signature, file header, optional header
        let nt = Self::NT_OFFSET;
        put(&mut image, nt, b"PE\0\0");
        put(&mut image, nt + 4, &0x8664u16.to_le_bytes());
        put(&mut image, nt + 20, &240u16.to_le_bytes());
        let opt = nt + 24;
        put(&mut image, opt, &0x20Bu16.to_le_bytes());
        put(&mut image, opt + 108, &16u32.to_le_bytes());

        if !self.exports.is_empty() {
            self.append_exports(&mut image, opt);
        }

        let size = (self.size_of_image as usize).max(image.len().next_multiple_of(0x1000));
        image.resize(size, 0);
        put(&mut image, opt + 56, &(size as u32).to_le_bytes());
        image
    }

    fn append_exports(&self, image: &mut Vec<u8>, opt: usize) {
        let count = self.exports.len();
        let mut named: Vec<(&str, u16)> = self
            .exports
            .iter()
            .enumerate()
            .filter_map(|(idx, (name, _))| name.as_deref().map(|n| (n, idx as u16)))
            .collect();
        named.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));

        let dir = Self::EXPORT_DIR_RVA;
        let functions = dir + 40;
        let names = functions + count * 4;
        let ordinals = names + named.len() * 4;
        image.resize(ordinals + named.len() * 2, 0);

        // Strings live after the tables, inside the directory range.
        let mut name_rvas = Vec::new();
        for (name, _) in &named {
            name_rvas.push(push_cstr(image, name));
        }
        let mut function_rvas = Vec::new();
        for (_, body) in &self.exports {
            function_rvas.push(match body {
                ExportBody::Rva(rva) => *rva,
                ExportBody::Forward(target) => push_cstr(image, target),
            });
        }
        let dir_size = image.len() - dir;

        put(image, dir + 16, &self.ordinal_base.to_le_bytes());
        put(image, dir + 20, &(count as u32).to_le_bytes());
        put(image, dir + 24, &(named.len() as u32).to_le_bytes());
        put(image, dir + 28, &(functions as u32).to_le_bytes());
        put(image, dir + 32, &(names as u32).to_le_bytes());
        put(image, dir + 36, &(ordinals as u32).to_le_bytes());
        for (i, rva) in function_rvas.iter().enumerate() {
            put(image, functions + i * 4, &rva.to_le_bytes());
        }
        for (i, ((_, index), rva)) in named.iter().zip(&name_rvas).enumerate() {
            put(image, names + i * 4, &rva.to_le_bytes());
            put(image, ordinals + i * 2, &index.to_le_bytes());
        }

        put(image, opt + 112, &(dir as u32).to_le_bytes());
        put(image, opt + 116, &(dir_size as u32).to_le_bytes());
    }
}

fn put(image: &mut [u8], at: usize, bytes: &[u8]) {
    if let Some(dst) = image.get_mut(at..at + bytes.len()) {
        dst.copy_from_slice(bytes);
    }
}

fn push_cstr(image: &mut Vec<u8>, s: &str) -> u32 {
    let rva = image.len() as u32;
    image.extend_from_slice(s.as_bytes());
    image.push(0);
    rva
}

//! Remote module and export resolution.
//!
//! Locates a module inside another process and resolves exported symbols by
//! walking the PE export directory through cross-process reads. Nothing is
//! loaded into the supervisor.

use hive_core::RemoteAddress;
use thiserror::Error;
use tracing::{debug, trace};

use crate::memory::{read_array, read_cstr, read_u16, read_u32, MemoryError, ModuleInfo, RemoteProcess};

/// Maximum chain length when following forwarded exports.
pub const MAX_FORWARD_DEPTH: usize = 4;

/// Longest export or forwarder name we are willing to read.
const MAX_NAME_LEN: usize = 512;

/// Upper bound for `e_lfanew`; real images keep headers in the first page.
const MAX_NT_HEADER_OFFSET: u32 = 0x1000;

const DOS_MAGIC: [u8; 2] = *b"MZ";
const NT_SIGNATURE: [u8; 4] = *b"PE\0\0";
const PE32_MAGIC: u16 = 0x10B;
const PE32_PLUS_MAGIC: u16 = 0x20B;

// Offsets relative to the start of the optional header.
const OPT_SIZE_OF_IMAGE: u64 = 56;
const OPT_PE32_RVA_COUNT: u64 = 92;
const OPT_PE32_DATA_DIRS: u64 = 96;
const OPT_PE32_PLUS_RVA_COUNT: u64 = 108;
const OPT_PE32_PLUS_DATA_DIRS: u64 = 112;

const EXPORT_DIRECTORY_LEN: usize = 40;

/// Errors raised while resolving remote modules and symbols.
///
/// Every variant describes a lookup that did not succeed; none of them means
/// the supervisor touched invalid memory.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("Module not found: {name}")]
    ModuleNotFound { name: String },

    #[error("Symbol not found: {symbol} in module at {module}")]
    SymbolNotFound { module: RemoteAddress, symbol: String },

    #[error("Image at {module} has no export directory")]
    NoExports { module: RemoteAddress },

    #[error("Malformed image at {module}: {reason}")]
    BadImage { module: RemoteAddress, reason: String },

    #[error("RVA {rva:#x} outside image of {size_of_image:#x} bytes")]
    OutOfBounds { rva: u64, size_of_image: u32 },

    #[error("Forwarder chain for {symbol} exceeds {} hops", MAX_FORWARD_DEPTH)]
    ForwardDepthExceeded { symbol: String },

    #[error("Remote read failed: {0}")]
    Memory(#[from] MemoryError),
}

/// How an export is looked up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportRef<'a> {
    Name(&'a str),
    Ordinal(u32),
}

impl std::fmt::Display for ExportRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Name(name) => write!(f, "{name}"),
            Self::Ordinal(ordinal) => write!(f, "#{ordinal}"),
        }
    }
}

/// Finds a mapped module by case-insensitive file name.
pub fn find_module(process: &dyn RemoteProcess, name: &str) -> Result<ModuleInfo, ResolveError> {
    let wanted = normalize_module_name(name);
    process
        .modules()?
        .into_iter()
        .find(|m| m.matches(&wanted))
        .ok_or(ResolveError::ModuleNotFound { name: wanted })
}

/// Base address of a module in the remote process.
pub fn resolve_module(process: &dyn RemoteProcess, name: &str) -> Result<RemoteAddress, ResolveError> {
    find_module(process, name).map(|m| m.base)
}

/// Resolves an exported symbol by name.
pub fn resolve_export(
    process: &dyn RemoteProcess,
    module_base: RemoteAddress,
    symbol: &str,
) -> Result<RemoteAddress, ResolveError> {
    resolve(process, module_base, ExportRef::Name(symbol), 0)
}

/// Resolves an export by ordinal.
pub fn resolve_ordinal(
    process: &dyn RemoteProcess,
    module_base: RemoteAddress,
    ordinal: u32,
) -> Result<RemoteAddress, ResolveError> {
    resolve(process, module_base, ExportRef::Ordinal(ordinal), 0)
}

fn resolve(
    process: &dyn RemoteProcess,
    module_base: RemoteAddress,
    export: ExportRef<'_>,
    depth: usize,
) -> Result<RemoteAddress, ResolveError> {
    let table = ExportTable::read(process, module_base)?;

    let function_index = match &export {
        ExportRef::Name(name) => table.index_of_name(process, name)?,
        ExportRef::Ordinal(ordinal) => ordinal
            .checked_sub(table.ordinal_base)
            .filter(|idx| *idx < table.function_count),
    };
    let not_found = || ResolveError::SymbolNotFound {
        module: module_base,
        symbol: export.to_string(),
    };
    let function_index = function_index.ok_or_else(not_found)?;

    let rva = table.function_rva(process, function_index)?;
    if rva == 0 {
        return Err(not_found());
    }

    if table.is_forwarder(rva) {
        let target = table.read_name(process, rva)?;
        let forward = Forwarder::parse(&target).ok_or_else(|| ResolveError::BadImage {
            module: module_base,
            reason: format!("invalid forwarder '{target}'"),
        })?;
        if depth + 1 > MAX_FORWARD_DEPTH {
            return Err(ResolveError::ForwardDepthExceeded {
                symbol: export.to_string(),
            });
        }
        debug!(
            pid = process.pid(),
            export = %export,
            forward = %target,
            "Following forwarded export"
        );
        let next_base = resolve_module(process, &forward.module)?;
        let next = match &forward.export {
            ForwardTarget::Name(name) => ExportRef::Name(name),
            ForwardTarget::Ordinal(ordinal) => ExportRef::Ordinal(*ordinal),
        };
        return resolve(process, next_base, next, depth + 1);
    }

    let address = table.address_of(rva)?;
    trace!(pid = process.pid(), export = %export, %address, "Resolved export");
    Ok(address)
}

/// Appends `.dll` when a forwarder names a module without extension.
fn normalize_module_name(name: &str) -> String {
    if name.contains('.') {
        name.to_string()
    } else {
        format!("{name}.dll")
    }
}

// ============================================================================
// Export directory
// ============================================================================

/// Parsed `IMAGE_EXPORT_DIRECTORY` plus the bounds needed to validate it.
#[derive(Debug, Clone)]
struct ExportTable {
    base: RemoteAddress,
    size_of_image: u32,
    directory_rva: u32,
    directory_size: u32,
    ordinal_base: u32,
    function_count: u32,
    name_count: u32,
    functions_rva: u32,
    names_rva: u32,
    ordinals_rva: u32,
}

impl ExportTable {
    fn read(process: &dyn RemoteProcess, base: RemoteAddress) -> Result<Self, ResolveError> {
        let bad = |reason: &str| ResolveError::BadImage {
            module: base,
            reason: reason.to_string(),
        };
        let at = |offset: u64| base.offset(offset).ok_or_else(|| bad("address overflow"));

        if read_array::<2>(process, base)? != DOS_MAGIC {
            return Err(bad("missing MZ signature"));
        }
        let nt_offset = read_u32(process, at(0x3C)?)?;
        if nt_offset > MAX_NT_HEADER_OFFSET {
            return Err(bad("e_lfanew out of range"));
        }
        let nt = u64::from(nt_offset);
        if read_array::<4>(process, at(nt)?)? != NT_SIGNATURE {
            return Err(bad("missing PE signature"));
        }

        // Signature (4) + IMAGE_FILE_HEADER (20)
        let opt = nt + 24;
        let (count_offset, dirs_offset) = match read_u16(process, at(opt)?)? {
            PE32_MAGIC => (OPT_PE32_RVA_COUNT, OPT_PE32_DATA_DIRS),
            PE32_PLUS_MAGIC => (OPT_PE32_PLUS_RVA_COUNT, OPT_PE32_PLUS_DATA_DIRS),
            _ => return Err(bad("unknown optional header magic")),
        };
        let size_of_image = read_u32(process, at(opt + OPT_SIZE_OF_IMAGE)?)?;
        if read_u32(process, at(opt + count_offset)?)? == 0 {
            return Err(ResolveError::NoExports { module: base });
        }

        // Data directory 0 is the export directory.
        let directory_rva = read_u32(process, at(opt + dirs_offset)?)?;
        let directory_size = read_u32(process, at(opt + dirs_offset + 4)?)?;
        if directory_rva == 0 || directory_size == 0 {
            return Err(ResolveError::NoExports { module: base });
        }
        check_range(directory_rva, EXPORT_DIRECTORY_LEN as u64, size_of_image)?;

        let mut raw = [0u8; EXPORT_DIRECTORY_LEN];
        process.read(at(u64::from(directory_rva))?, &mut raw)?;
        let field = |offset: usize| {
            raw.get(offset..offset + 4)
                .and_then(|b| b.try_into().ok())
                .map(u32::from_le_bytes)
                .unwrap_or_default()
        };

        let table = Self {
            base,
            size_of_image,
            directory_rva,
            directory_size,
            ordinal_base: field(16),
            function_count: field(20),
            name_count: field(24),
            functions_rva: field(28),
            names_rva: field(32),
            ordinals_rva: field(36),
        };
        check_range(table.functions_rva, u64::from(table.function_count) * 4, size_of_image)?;
        check_range(table.names_rva, u64::from(table.name_count) * 4, size_of_image)?;
        check_range(table.ordinals_rva, u64::from(table.name_count) * 2, size_of_image)?;
        Ok(table)
    }

    fn at(&self, rva: u64) -> Result<RemoteAddress, ResolveError> {
        self.base.offset(rva).ok_or(ResolveError::OutOfBounds {
            rva,
            size_of_image: self.size_of_image,
        })
    }

    fn function_rva(&self, process: &dyn RemoteProcess, index: u32) -> Result<u32, ResolveError> {
        let slot = u64::from(self.functions_rva) + u64::from(index) * 4;
        Ok(read_u32(process, self.at(slot)?)?)
    }

    fn is_forwarder(&self, rva: u32) -> bool {
        let start = u64::from(self.directory_rva);
        let end = start + u64::from(self.directory_size);
        (start..end).contains(&u64::from(rva))
    }

    fn address_of(&self, rva: u32) -> Result<RemoteAddress, ResolveError> {
        check_range(rva, 1, self.size_of_image)?;
        self.at(u64::from(rva))
    }

    fn read_name(&self, process: &dyn RemoteProcess, rva: u32) -> Result<String, ResolveError> {
        check_range(rva, 1, self.size_of_image)?;
        let bytes = read_cstr(process, self.at(u64::from(rva))?, MAX_NAME_LEN)?.ok_or_else(|| {
            ResolveError::BadImage {
                module: self.base,
                reason: format!("unterminated name at rva {rva:#x}"),
            }
        })?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Binary search over the (lexically sorted) name pointer table.
    fn index_of_name(&self, process: &dyn RemoteProcess, wanted: &str) -> Result<Option<u32>, ResolveError> {
        let wanted = wanted.as_bytes();
        let (mut lo, mut hi) = (0u32, self.name_count);

        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let name_rva = read_u32(process, self.at(u64::from(self.names_rva) + u64::from(mid) * 4)?)?;
            let name = self.read_name(process, name_rva)?;
            match name.as_bytes().cmp(wanted) {
                std::cmp::Ordering::Equal => {
                    let slot = u64::from(self.ordinals_rva) + u64::from(mid) * 2;
                    let index = u32::from(read_u16(process, self.at(slot)?)?);
                    return Ok((index < self.function_count).then_some(index));
                }
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
            }
        }
        Ok(None)
    }
}

fn check_range(rva: u32, len: u64, size_of_image: u32) -> Result<(), ResolveError> {
    let end = u64::from(rva) + len;
    if end > u64::from(size_of_image) {
        return Err(ResolveError::OutOfBounds {
            rva: u64::from(rva),
            size_of_image,
        });
    }
    Ok(())
}

// ============================================================================
// Forwarders
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum ForwardTarget {
    Name(String),
    Ordinal(u32),
}

/// A forwarder string such as `NTDLL.RtlAllocateHeap` or `NTDLL.#12`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Forwarder {
    module: String,
    export: ForwardTarget,
}

impl Forwarder {
    fn parse(s: &str) -> Option<Self> {
        // Module names may contain dots (api-ms-win-*), so split on the last.
        let (module, export) = s.rsplit_once('.')?;
        if module.is_empty() || export.is_empty() {
            return None;
        }
        let export = match export.strip_prefix('#') {
            Some(ordinal) => ForwardTarget::Ordinal(ordinal.parse().ok()?),
            None => ForwardTarget::Name(export.to_string()),
        };
        Some(Self {
            module: normalize_module_name(module),
            export,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forwarder_parse() {
        let fwd = Forwarder::parse("NTDLL.RtlAllocateHeap").unwrap();
        assert_eq!(fwd.module, "NTDLL.dll");
        assert_eq!(fwd.export, ForwardTarget::Name("RtlAllocateHeap".into()));

        let fwd = Forwarder::parse("api-ms-win-core-heap-l1-1-0.#7").unwrap();
        assert_eq!(fwd.module, "api-ms-win-core-heap-l1-1-0.dll");
        assert_eq!(fwd.export, ForwardTarget::Ordinal(7));

        assert!(Forwarder::parse("nodot").is_none());
        assert!(Forwarder::parse("MOD.#x").is_none());
        assert!(Forwarder::parse(".Sym").is_none());
    }

    use crate::memory::ProcessBackend;
    use crate::mock::{MockBackend, PeImageBuilder};

    const PID: u32 = 7;
    const A_BASE: u64 = 0x1000_0000;
    const B_BASE: u64 = 0x2000_0000;

    fn process_with(modules: &[(&str, u64, PeImageBuilder)]) -> Box<dyn RemoteProcess> {
        let backend = MockBackend::new();
        backend.spawn(PID);
        for (name, base, image) in modules {
            backend.map_module(PID, name, *base, image.build());
        }
        backend.open(PID).unwrap()
    }

    #[test]
    fn test_resolve_module_case_insensitive() {
        let process = process_with(&[("Alpha.DLL", A_BASE, PeImageBuilder::new())]);
        let base = resolve_module(process.as_ref(), "alpha.dll").unwrap();
        assert_eq!(base, RemoteAddress::new(PID, A_BASE));
        assert!(matches!(
            resolve_module(process.as_ref(), "beta.dll"),
            Err(ResolveError::ModuleNotFound { .. })
        ));
    }

    #[test]
    fn test_resolve_export_by_name() {
        let image = PeImageBuilder::new()
            .export("Zeta", 0x1300)
            .export("Alpha", 0x1100)
            .export("Mid", 0x1200);
        let process = process_with(&[("a.dll", A_BASE, image)]);
        let base = RemoteAddress::new(PID, A_BASE);

        for (name, rva) in [("Alpha", 0x1100), ("Mid", 0x1200), ("Zeta", 0x1300)] {
            let addr = resolve_export(process.as_ref(), base, name).unwrap();
            assert_eq!(addr.pid(), PID);
            assert_eq!(addr.rva_from(&base), Some(rva));
        }
        assert!(matches!(
            resolve_export(process.as_ref(), base, "Missing"),
            Err(ResolveError::SymbolNotFound { .. })
        ));
    }

    #[test]
    fn test_resolve_by_ordinal() {
        let image = PeImageBuilder::new()
            .ordinal_base(10)
            .export("First", 0x1010)
            .export_unnamed(0x1020);
        let process = process_with(&[("a.dll", A_BASE, image)]);
        let base = RemoteAddress::new(PID, A_BASE);

        assert_eq!(
            resolve_ordinal(process.as_ref(), base, 11).unwrap().value(),
            A_BASE + 0x1020
        );
        assert!(resolve_ordinal(process.as_ref(), base, 9).is_err());
        assert!(resolve_ordinal(process.as_ref(), base, 12).is_err());
    }

    #[test]
    fn test_forwarded_export() {
        let a = PeImageBuilder::new().forward("Alloc", "B.RealAlloc");
        let b = PeImageBuilder::new().export("RealAlloc", 0x1500);
        let process = process_with(&[("a.dll", A_BASE, a), ("b.dll", B_BASE, b)]);

        let addr = resolve_export(process.as_ref(), RemoteAddress::new(PID, A_BASE), "Alloc").unwrap();
        assert_eq!(addr, RemoteAddress::new(PID, B_BASE + 0x1500));
    }

    #[test]
    fn test_forward_cycle_is_bounded() {
        let a = PeImageBuilder::new().forward("Loop", "B.Loop");
        let b = PeImageBuilder::new().forward("Loop", "A.Loop");
        let process = process_with(&[("a.dll", A_BASE, a), ("b.dll", B_BASE, b)]);

        assert!(matches!(
            resolve_export(process.as_ref(), RemoteAddress::new(PID, A_BASE), "Loop"),
            Err(ResolveError::ForwardDepthExceeded { .. })
        ));
    }

    #[test]
    fn test_rva_outside_image() {
        let image = PeImageBuilder::new().export("Far", 0x9000).size_of_image(0x2000);
        let process = process_with(&[("a.dll", A_BASE, image)]);

        assert!(matches!(
            resolve_export(process.as_ref(), RemoteAddress::new(PID, A_BASE), "Far"),
            Err(ResolveError::OutOfBounds { rva: 0x9000, .. })
        ));
    }

    #[test]
    fn test_bad_headers_are_errors() {
        let backend = MockBackend::new();
        backend.spawn(PID);
        backend.map_module(PID, "junk.dll", A_BASE, vec![0xCC; 0x1000]);
        let process = backend.open(PID).unwrap();

        assert!(matches!(
            resolve_export(process.as_ref(), RemoteAddress::new(PID, A_BASE), "X"),
            Err(ResolveError::BadImage { .. })
        ));
        // Nothing mapped here at all.
        assert!(matches!(
            resolve_export(process.as_ref(), RemoteAddress::new(PID, 0x5000_0000), "X"),
            Err(ResolveError::Memory(MemoryError::Unreadable { .. }))
        ));
        // Image without exports.
        backend.map_module(PID, "empty.dll", B_BASE, PeImageBuilder::new().build());
        assert!(matches!(
            resolve_export(process.as_ref(), RemoteAddress::new(PID, B_BASE), "X"),
            Err(ResolveError::NoExports { .. })
        ));
    }

    #[test]
    fn test_check_range() {
        assert!(check_range(0x100, 0x100, 0x200).is_ok());
        assert!(check_range(0x100, 0x101, 0x200).is_err());
        assert!(check_range(u32::MAX, 4, u32::MAX).is_err());
    }
}

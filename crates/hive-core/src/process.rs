//! Process identity and remote address value objects.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a running process instance.
///
/// A pid alone is not stable: the OS recycles it once the process exits.
/// Pairing it with the start time (seconds since the Unix epoch) yields a key
/// that is only ever reused by the same process instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessKey {
    pub pid: u32,
    pub started_at: u64,
}

impl ProcessKey {
    pub const fn new(pid: u32, started_at: u64) -> Self {
        Self { pid, started_at }
    }
}

impl fmt::Display for ProcessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.pid, self.started_at)
    }
}

/// An address inside another process's address space.
///
/// Only meaningful inside the process identified by `pid`. The value is never
/// dereferenced locally; it is only handed back to remote memory operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemoteAddress {
    pid: u32,
    value: u64,
}

impl RemoteAddress {
    pub const fn new(pid: u32, value: u64) -> Self {
        Self { pid, value }
    }

    /// Process this address belongs to.
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Raw numeric value, for passing to OS calls.
    pub const fn value(&self) -> u64 {
        self.value
    }

    pub const fn is_null(&self) -> bool {
        self.value == 0
    }

    /// Address of `rva` relative to this address (typically a module base).
    ///
    /// Returns `None` on overflow.
    pub fn offset(&self, rva: u64) -> Option<Self> {
        self.value.checked_add(rva).map(|value| Self {
            pid: self.pid,
            value,
        })
    }

    /// Distance from `base` to this address, if both live in the same process
    /// and this address is not below `base`.
    pub fn rva_from(&self, base: &RemoteAddress) -> Option<u64> {
        if self.pid != base.pid {
            return None;
        }
        self.value.checked_sub(base.value)
    }
}

impl fmt::Display for RemoteAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}@{}", self.value, self.pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_keeps_owner() {
        let base = RemoteAddress::new(42, 0x7ff0_0000_0000);
        let sym = base.offset(0x1234).unwrap();
        assert_eq!(sym.pid(), 42);
        assert_eq!(sym.value(), 0x7ff0_0000_1234);
        assert_eq!(sym.rva_from(&base), Some(0x1234));
    }

    #[test]
    fn test_offset_overflow() {
        let base = RemoteAddress::new(1, u64::MAX - 1);
        assert!(base.offset(2).is_none());
    }

    #[test]
    fn test_rva_from_other_process() {
        let a = RemoteAddress::new(1, 0x2000);
        let b = RemoteAddress::new(2, 0x1000);
        assert_eq!(a.rva_from(&b), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(RemoteAddress::new(7, 0x10).to_string(), "0x10@7");
        assert_eq!(ProcessKey::new(7, 99).to_string(), "7@99");
    }
}

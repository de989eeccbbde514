//! Memory probes used for adaptive partition sizing

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use sysinfo::{Pid, ProcessesToUpdate, System};

/// Reports current memory usage in bytes
pub trait MemoryProbe: Send + Sync {
    fn used_bytes(&self) -> Option<u64>;
}

/// Resident memory of this process, via `sysinfo`
pub struct SysinfoProbe {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            pid: sysinfo::get_current_pid().ok(),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SysinfoProbe {
    fn used_bytes(&self) -> Option<u64> {
        let mut system = self.system.lock().ok()?;
        match self.pid {
            Some(pid) => {
                system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
                system.process(pid).map(|process| process.memory())
            }
            None => {
                system.refresh_memory();
                Some(system.used_memory())
            }
        }
    }
}

/// Probe whose reading is set by hand
#[derive(Debug, Clone, Default)]
pub struct FixedProbe {
    bytes: Arc<AtomicU64>,
}

impl FixedProbe {
    pub fn new(bytes: u64) -> Self {
        Self {
            bytes: Arc::new(AtomicU64::new(bytes)),
        }
    }

    pub fn set(&self, bytes: u64) {
        self.bytes.store(bytes, Ordering::SeqCst);
    }
}

impl MemoryProbe for FixedProbe {
    fn used_bytes(&self) -> Option<u64> {
        Some(self.bytes.load(Ordering::SeqCst))
    }
}

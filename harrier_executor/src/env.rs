//! Contract between the executor kernel and the machine under test.

use thiserror::Error;

/// Result of one dispatched syscall. `res == u64::MAX` marks failure, in
/// which case `errno` carries the reason.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyscallRes {
    pub res: u64,
    pub errno: u32,
}

impl SyscallRes {
    #[inline]
    pub fn ok(res: u64) -> Self {
        Self { res, errno: 0 }
    }

    #[inline]
    pub fn err(errno: u32) -> Self {
        Self {
            res: u64::MAX,
            errno,
        }
    }

    #[inline]
    pub fn failed(&self) -> bool {
        self.res == u64::MAX
    }
}

/// Access to an unmapped or protected page. Expected at runtime: programs
/// point wherever they like. The executor swallows these and keeps going.
#[derive(Debug, Clone, Copy, Error)]
#[error("guest memory fault")]
pub struct MemFault;

/// Everything OS-specific the executor needs from the target.
///
/// Workers share one instance across threads, so implementations must be
/// internally synchronized. Real targets back `read_mem`/`write_mem` with
/// fault-guarded raw accesses (signal handler or equivalent); the coverage
/// hooks wrap the target's tracing device keyed by worker id.
pub trait ExecEnv: Send + Sync + 'static {
    /// Number of entries in the syscall table; call ids at or above this
    /// are a corrupt stream.
    fn syscall_count(&self) -> u64;

    /// Dispatches one syscall. Runs on a worker thread and may block
    /// indefinitely; the executor does not cancel it.
    fn execute_syscall(&self, call_num: u64, args: &[u64]) -> SyscallRes;

    /// Guarded read of guest memory.
    fn read_mem(&self, addr: u64, buf: &mut [u8]) -> Result<(), MemFault>;

    /// Guarded write of guest memory.
    fn write_mem(&self, addr: u64, data: &[u8]) -> Result<(), MemFault>;

    fn cover_enable(&self, _tid: usize) {}

    fn cover_reset(&self, _tid: usize) {}

    /// Coverage words recorded since the last reset on this worker: PCs in
    /// signal mode, packed comparison records in comparison mode.
    fn cover_collect(&self, _tid: usize) -> Vec<u64> {
        Vec::new()
    }

    /// Arms fault injection for the nth operation of the next call.
    fn inject_fault(&self, _nth: u64) {}

    /// Whether the armed fault actually fired.
    fn fault_injected(&self) -> bool {
        false
    }
}

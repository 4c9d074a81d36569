//! Control-pipe messages between the driver and the executor.

use super::{EnvFlags, ExecFlags};

pub const IN_MAGIC: u64 = 0xbadc0ffeebadface;
pub const OUT_MAGIC: u32 = 0xbadf00d;

/// Executor exit status reported in [`ExecuteReply`].
pub const STATUS_OK: u32 = 0;
pub const STATUS_INTERNAL_ERROR: u32 = 67;

#[repr(C)]
#[derive(Default, Debug, Clone, Copy)]
pub struct HandshakeReq {
    pub magic: u64,
    pub env_flags: EnvFlags,
    pub pid: u64,
}

#[repr(C)]
#[derive(Default, Debug, Clone, Copy)]
pub struct HandshakeReply {
    pub magic: u32,
}

#[repr(C)]
#[derive(Default, Debug, Clone, Copy)]
pub struct ExecuteReq {
    pub magic: u64,
    pub env_flags: EnvFlags,
    pub exec_flags: ExecFlags,
    pub pid: u64,
    pub fault_call: u64,
    pub fault_nth: u64,
    /// Number of program bytes following this header on the pipe.
    pub prog_size: u64,
}

#[repr(C)]
#[derive(Default, Debug, Clone, Copy)]
pub struct ExecuteReply {
    pub magic: u32,
    pub done: u32,
    pub status: u32,
}

//! Binary exec format shared by the encoder and the executor.
//!
//! The format is a sequence of u64 words encoding a sequence of calls,
//! terminated by `EXEC_INSTR_EOF`. Each call is
//! `(call id, copyout index, number of arguments, arguments...)`; copyin
//! and copyout pseudo instructions are drawn from the top of the u64 space
//! so they can never collide with call ids. The format is irreversible and
//! not self-describing: word meanings are assigned purely by position.

pub mod message;
pub mod serialize;

use iota::iota;

iota! {
    pub const EXEC_INSTR_EOF: u64 = (u64::MAX) ^ (iota);
        , EXEC_INSTR_COPY_IN
        , EXEC_INSTR_COPY_OUT
}

iota! {
    pub const EXEC_ARG_CONST: u64 = iota;
        , EXEC_ARG_RESULT
        , EXEC_ARG_DATA
        , EXEC_ARG_CSUM
}

iota! {
    pub const EXEC_ARG_CSUM_INET: u64 = iota;
}

iota! {
    pub const EXEC_ARG_CSUM_CHUNK_DATA: u64 = iota;
        , EXEC_ARG_CSUM_CHUNK_CONST
}

/// Copyout-index slot value meaning "do not preserve the return value".
pub const EXEC_NO_COPYOUT: u64 = u64::MAX;

/// Upper bound on a serialized program.
pub const EXEC_BUFFER_SIZE: usize = 2 << 20;
/// Max arguments of a single call.
pub const EXEC_MAX_ARGS: u64 = 9;
/// Max copyout indices per program.
pub const EXEC_MAX_COMMANDS: u64 = 1000;
/// Worker pool size on the executor side.
pub const EXEC_MAX_THREADS: usize = 16;
/// Per-thread coverage buffer capacity, in words.
pub const EXEC_COVER_SIZE: usize = 64 << 10;
/// Coverage signal dedup table slots.
pub const EXEC_DEDUP_TABLE_SIZE: usize = 8 << 10;

/// Results of failed calls resolve to this instead; -1 is an invalid fd
/// and an invalid address, and deterministic.
pub const EXEC_DEFAULT_VALUE: u64 = u64::MAX;

/// Env flags, fixed for the lifetime of an executor process.
pub type EnvFlags = u64;

iota! {
    pub const FLAG_DEBUG: EnvFlags = 1 << (iota);     // verbose diagnostics from the executor
    , FLAG_SIGNAL                                     // collect feedback signals
    , FLAG_SANDBOX_SETUID                             // impersonate nobody user
    , FLAG_SANDBOX_NAMESPACE                          // use namespaces for sandboxing
    , FLAG_ENABLE_TUN                                 // setup and use /dev/tun for packet injection
    , FLAG_ENABLE_FAULT_INJECTION                     // allow fault injection
}

/// Sandbox personality requested through env flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sandbox {
    None,
    Setuid,
    Namespace,
}

pub fn sandbox_of_flags(env: EnvFlags) -> Sandbox {
    if env & FLAG_SANDBOX_SETUID != 0 {
        Sandbox::Setuid
    } else if env & FLAG_SANDBOX_NAMESPACE != 0 {
        Sandbox::Namespace
    } else {
        Sandbox::None
    }
}

/// Exec flags, chosen per execute request.
pub type ExecFlags = u64;

iota! {
    pub const FLAG_COLLECT_COVER: ExecFlags = 1 << (iota);  // collect coverage PCs
    , FLAG_DEDUP_COVER                                      // deduplicate PCs in the executor
    , FLAG_INJECT_FAULT                                     // inject a fault in this execution
    , FLAG_COLLECT_COMPS                                    // collect comparison operands
    , FLAG_THREADED                                         // use the worker pool to mitigate blocked calls
    , FLAG_COLLIDE                                          // collide calls to provoke races
}

/// Per-request execution options.
#[derive(Debug, Clone)]
pub struct ExecOpt {
    pub flags: ExecFlags,
    /// Index of the call to inject a fault into.
    pub fault_call: u64,
    /// Inject the fault into the nth operation of that call.
    pub fault_nth: u64,
}

impl Default for ExecOpt {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecOpt {
    pub const fn new() -> Self {
        Self {
            flags: FLAG_DEDUP_COVER | FLAG_THREADED,
            fault_call: 0,
            fault_nth: 0,
        }
    }

    #[inline]
    pub fn enable(&mut self, flag: ExecFlags) {
        self.flags |= flag;
    }

    #[inline]
    pub fn disable(&mut self, flag: ExecFlags) {
        self.flags &= ExecFlags::MAX ^ flag;
    }

    #[inline]
    pub fn is_enabled(&self, flag: ExecFlags) -> bool {
        self.flags & flag != 0
    }

    /// Collide mode rides on top of threading; without threads there is
    /// nothing to skip waiting for.
    pub fn normalize(&mut self) {
        if !self.is_enabled(FLAG_THREADED) {
            self.disable(FLAG_COLLIDE);
        }
    }
}

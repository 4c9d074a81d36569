use std::fmt;
use std::hash::{Hash, Hasher};

/// Index of a system call in the target's syscall table, different from nr.
pub type SyscallId = usize;

/// Information related to one system call of the target.
#[derive(Debug, Clone)]
pub struct Syscall {
    /// Index into the target's syscall table.
    id: SyscallId,
    /// Call number, 0 for systems that do not use nr.
    nr: u64,
    /// Name of the call.
    name: Box<str>,
}

impl Syscall {
    pub fn new(id: SyscallId, nr: u64, name: &str) -> Self {
        Self {
            id,
            nr,
            name: name.into(),
        }
    }

    #[inline(always)]
    pub fn id(&self) -> SyscallId {
        self.id
    }

    #[inline(always)]
    pub fn nr(&self) -> u64 {
        self.nr
    }

    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Syscall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl PartialEq for Syscall {
    fn eq(&self, other: &Syscall) -> bool {
        self.id == other.id
    }
}

impl Eq for Syscall {}

impl Hash for Syscall {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_usize(self.id)
    }
}

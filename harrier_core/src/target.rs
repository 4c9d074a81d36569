use crate::arg::PtrArg;
use crate::syscall::{Syscall, SyscallId};

/// Static description of the machine under test: memory geometry plus the
/// syscall table the executor dispatches into.
#[derive(Debug, Clone)]
pub struct Target {
    /// Name of target os.
    os: Box<str>,
    /// Target arch.
    arch: Box<str>,
    /// Ptr size of target arch.
    ptr_sz: u64,
    /// Page size of target os.
    page_sz: u64,
    /// Number of data pages available to programs.
    page_num: u64,
    /// Base address of the program data region in the test process.
    data_offset: u64,
    /// Endian of target arch.
    le_endian: bool,
    /// All syscalls of the target, sorted by `SyscallId`.
    syscalls: Vec<Syscall>,
}

impl Target {
    pub fn new(
        os: &str,
        arch: &str,
        page_sz: u64,
        page_num: u64,
        data_offset: u64,
        syscalls: Vec<Syscall>,
    ) -> Self {
        debug_assert!(syscalls.iter().enumerate().all(|(i, s)| s.id() == i));
        Self {
            os: os.into(),
            arch: arch.into(),
            ptr_sz: 8,
            page_sz,
            page_num,
            data_offset,
            le_endian: true,
            syscalls,
        }
    }

    #[inline(always)]
    pub fn os(&self) -> &str {
        &self.os
    }

    #[inline(always)]
    pub fn arch(&self) -> &str {
        &self.arch
    }

    #[inline(always)]
    pub fn ptr_sz(&self) -> u64 {
        self.ptr_sz
    }

    #[inline(always)]
    pub fn page_sz(&self) -> u64 {
        self.page_sz
    }

    #[inline(always)]
    pub fn page_num(&self) -> u64 {
        self.page_num
    }

    #[inline(always)]
    pub fn data_offset(&self) -> u64 {
        self.data_offset
    }

    #[inline(always)]
    pub fn le_endian(&self) -> bool {
        self.le_endian
    }

    #[inline(always)]
    pub fn syscalls(&self) -> &[Syscall] {
        &self.syscalls
    }

    #[inline(always)]
    pub fn syscall_count(&self) -> u64 {
        self.syscalls.len() as u64
    }

    #[inline]
    pub fn syscall_of(&self, sid: SyscallId) -> &Syscall {
        &self.syscalls[sid]
    }

    #[inline]
    pub fn mem_size(&self) -> u64 {
        self.page_num * self.page_sz
    }

    /// Resolves a pointer value to the virtual address it denotes in the
    /// test process. Negative page offsets index backwards from the end of
    /// the page.
    pub fn physical_addr(&self, ptr: &PtrArg) -> u64 {
        let mut addr = ptr.page_index * self.page_sz + self.data_offset;
        if ptr.page_offset >= 0 {
            addr += ptr.page_offset as u64;
        } else {
            addr += self.page_sz - ptr.page_offset.unsigned_abs();
        }
        addr
    }
}

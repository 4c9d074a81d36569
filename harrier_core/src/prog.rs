//! Programs: ordered call sequences over an argument arena.

use crate::arg::{Arg, CsumChunk, CsumKind};
use crate::syscall::SyscallId;
use crate::HashSet;
use thiserror::Error;

/// Stable identity of an argument inside one program.
pub type ArgId = usize;

/// One syscall invocation of a program.
#[derive(Debug, Clone)]
pub struct Call {
    sid: SyscallId,
    args: Vec<ArgId>,
    /// Always a [`Arg::Ret`] node.
    ret: ArgId,
}

impl Call {
    #[inline(always)]
    pub fn sid(&self) -> SyscallId {
        self.sid
    }

    #[inline(always)]
    pub fn args(&self) -> &[ArgId] {
        &self.args
    }

    #[inline(always)]
    pub fn ret(&self) -> ArgId {
        self.ret
    }
}

/// An ordered sequence of calls plus the arena owning every argument node.
#[derive(Debug, Clone, Default)]
pub struct Prog {
    args: Vec<Arg>,
    calls: Vec<Call>,
}

#[derive(Debug, Error)]
pub enum ValidateError {
    #[error("call {call}: too many args: {num}")]
    TooManyArgs { call: usize, num: usize },
    #[error("arg {arg}: forward reference to arg {referent}")]
    ForwardRef { arg: ArgId, referent: ArgId },
    #[error("arg {arg}: result referent {referent} is not copyout material")]
    BadReferent { arg: ArgId, referent: ArgId },
    #[error("arg {arg}: checksum size {size} out of range")]
    BadCsumSize { arg: ArgId, size: u64 },
}

impl Prog {
    #[inline(always)]
    pub fn calls(&self) -> &[Call] {
        &self.calls
    }

    #[inline(always)]
    pub fn arg(&self, id: ArgId) -> &Arg {
        &self.args[id]
    }

    /// Byte size an argument occupies inside its parent structure.
    pub fn size_of(&self, id: ArgId) -> u64 {
        match self.arg(id) {
            Arg::Const(a) => a.size,
            Arg::Result(a) => a.size,
            Arg::Ptr(_) => 8,
            Arg::Data(a) => {
                if a.data.is_empty() {
                    a.out_size
                } else {
                    a.data.len() as u64
                }
            }
            Arg::Group(a) => a.fields.iter().map(|&f| self.size_of(f)).sum(),
            Arg::Union(a) => a.size,
            Arg::Ret(_) => 0,
            Arg::Csum(a) => a.size,
        }
    }

    /// The set of arguments referenced by some [`Arg::Result`] node; these
    /// are the arguments whose runtime values must be preserved.
    pub fn uses(&self) -> HashSet<ArgId> {
        let mut used = HashSet::default();
        for arg in &self.args {
            if let Arg::Result(res) = arg {
                if let Some(src) = res.src {
                    used.insert(src);
                }
            }
        }
        used
    }

    /// Checks the structural invariants the encoder relies on. The encoder
    /// runs this in debug builds; generators are expected to uphold it.
    pub fn validate(&self) -> Result<(), ValidateError> {
        for (ci, call) in self.calls.iter().enumerate() {
            if call.args.len() > crate::exec::EXEC_MAX_ARGS as usize {
                return Err(ValidateError::TooManyArgs {
                    call: ci,
                    num: call.args.len(),
                });
            }
        }
        for (id, arg) in self.args.iter().enumerate() {
            match arg {
                Arg::Result(res) => {
                    if let Some(src) = res.src {
                        if src >= id {
                            return Err(ValidateError::ForwardRef { arg: id, referent: src });
                        }
                        match self.arg(src) {
                            Arg::Ret(_) | Arg::Const(_) | Arg::Result(_) => {}
                            _ => {
                                return Err(ValidateError::BadReferent { arg: id, referent: src })
                            }
                        }
                    }
                }
                Arg::Csum(csum) => {
                    let bad = match csum.kind {
                        CsumKind::Inet => csum.size != 2,
                    };
                    if bad || csum.size > 8 {
                        return Err(ValidateError::BadCsumSize {
                            arg: id,
                            size: csum.size,
                        });
                    }
                    for chunk in &csum.chunks {
                        if let CsumChunk::Data { arg } = chunk {
                            if *arg >= id {
                                return Err(ValidateError::ForwardRef {
                                    arg: id,
                                    referent: *arg,
                                });
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Builds a program bottom-up: leaf arguments first, then composites, then
/// calls. Referenced nodes always end up with smaller arena ids than their
/// referrers, which is exactly the ordering [`Prog::validate`] checks.
#[derive(Debug, Default)]
pub struct ProgBuilder {
    args: Vec<Arg>,
    calls: Vec<Call>,
}

impl ProgBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(&mut self, arg: impl Into<Arg>) -> ArgId {
        let id = self.args.len();
        self.args.push(arg.into());
        id
    }

    /// Appends a call; a fresh return placeholder is allocated for it.
    pub fn call(&mut self, sid: SyscallId, args: Vec<ArgId>) -> ArgId {
        let ret = self.arg(Arg::Ret(crate::arg::RetArg));
        self.calls.push(Call { sid, args, ret });
        ret
    }

    pub fn finish(self) -> Prog {
        Prog {
            args: self.args,
            calls: self.calls,
        }
    }
}

macro_rules! impl_arg_from {
    ($($variant:ident($payload:ident)),* $(,)?) => {
        $(
            impl From<crate::arg::$payload> for Arg {
                fn from(a: crate::arg::$payload) -> Arg {
                    Arg::$variant(a)
                }
            }
        )*
    };
}

impl_arg_from!(
    Const(ConstArg),
    Result(ResultArg),
    Ptr(PtrArg),
    Data(DataArg),
    Group(GroupArg),
    Union(UnionArg),
    Ret(RetArg),
    Csum(CsumArg),
);

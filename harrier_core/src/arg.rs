//! Argument nodes of the program tree.
//!
//! Cross references (result sources, checksum chunks, pointees, composite
//! fields) are arena indices into the owning [`Prog`](crate::prog::Prog),
//! which keeps the graph acyclic without reference counting.

use crate::prog::ArgId;

/// Direction of an argument relative to the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Dir {
    In,
    Out,
    InOut,
}

/// One node of the argument graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    Const(ConstArg),
    Result(ResultArg),
    Ptr(PtrArg),
    Data(DataArg),
    Group(GroupArg),
    Union(UnionArg),
    Ret(RetArg),
    Csum(CsumArg),
}

impl Arg {
    pub fn dir(&self) -> Dir {
        match self {
            Arg::Const(a) => a.dir,
            Arg::Result(a) => a.dir,
            Arg::Ptr(a) => a.dir,
            Arg::Data(a) => a.dir,
            Arg::Group(a) => a.dir,
            Arg::Union(a) => a.dir,
            Arg::Ret(_) => Dir::Out,
            Arg::Csum(a) => a.dir,
        }
    }

    #[inline]
    pub fn as_ptr(&self) -> Option<&PtrArg> {
        if let Arg::Ptr(a) = self {
            Some(a)
        } else {
            None
        }
    }

    #[inline]
    pub fn as_csum(&self) -> Option<&CsumArg> {
        if let Arg::Csum(a) = self {
            Some(a)
        } else {
            None
        }
    }

    #[inline]
    pub fn is_ret(&self) -> bool {
        matches!(self, Arg::Ret(_))
    }
}

/// A plain value argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstArg {
    pub dir: Dir,
    /// Size of the storage unit in bytes.
    pub size: u64,
    pub val: u64,
    /// Per-pid stride: the encoded value is `val + pid_stride * pid`,
    /// partitioning ports and similar identifiers between test processes.
    pub pid_stride: u64,
    /// Bitfield offset within the unit, bits.
    pub bf_off: u64,
    /// Bitfield length, bits; 0 means not a bitfield.
    pub bf_len: u64,
    /// Padding field, never copied in.
    pub pad: bool,
}

impl ConstArg {
    pub fn new(dir: Dir, size: u64, val: u64) -> Self {
        Self {
            dir,
            size,
            val,
            pid_stride: 0,
            bf_off: 0,
            bf_len: 0,
            pad: false,
        }
    }

    pub fn value(&self, pid: u64) -> u64 {
        self.val.wrapping_add(self.pid_stride.wrapping_mul(pid))
    }
}

/// Either a literal placeholder or a reference to the result of an earlier
/// argument, transformed as `src / op_div + op_add`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultArg {
    pub dir: Dir,
    pub size: u64,
    /// Referent; `None` makes this a plain literal.
    pub src: Option<ArgId>,
    /// Literal value used when unlinked.
    pub val: u64,
    pub op_div: u64,
    pub op_add: u64,
}

impl ResultArg {
    pub fn new_ref(dir: Dir, size: u64, src: ArgId) -> Self {
        Self {
            dir,
            size,
            src: Some(src),
            val: 0,
            op_div: 0,
            op_add: 0,
        }
    }

    pub fn new_literal(dir: Dir, size: u64, val: u64) -> Self {
        Self {
            dir,
            size,
            src: None,
            val,
            op_div: 0,
            op_add: 0,
        }
    }
}

/// A pointer into the program data region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtrArg {
    pub dir: Dir,
    pub page_index: u64,
    /// Signed offset inside the page; negative values count back from the
    /// end of the page.
    pub page_offset: i64,
    pub pointee: Option<ArgId>,
}

impl PtrArg {
    pub fn new(dir: Dir, page_index: u64, page_offset: i64, pointee: Option<ArgId>) -> Self {
        Self {
            dir,
            page_index,
            page_offset,
            pointee,
        }
    }
}

/// A byte blob argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataArg {
    pub dir: Dir,
    pub data: Vec<u8>,
    /// Size reserved for out buffers that carry no bytes of their own.
    pub out_size: u64,
}

impl DataArg {
    pub fn new(dir: Dir, data: Vec<u8>) -> Self {
        Self {
            dir,
            data,
            out_size: 0,
        }
    }

    pub fn new_out(size: u64) -> Self {
        Self {
            dir: Dir::Out,
            data: Vec::new(),
            out_size: size,
        }
    }
}

/// Struct or array: an ordered run of fields laid out back to back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupArg {
    pub dir: Dir,
    pub fields: Vec<ArgId>,
}

impl GroupArg {
    pub fn new(dir: Dir, fields: Vec<ArgId>) -> Self {
        Self { dir, fields }
    }
}

/// One chosen option of a union type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnionArg {
    pub dir: Dir,
    pub option: ArgId,
    /// Storage size of the union, at least the size of the chosen option.
    pub size: u64,
}

impl UnionArg {
    pub fn new(dir: Dir, option: ArgId, size: u64) -> Self {
        Self { dir, option, size }
    }
}

/// Placeholder for the result of the owning call. Carries no payload; it is
/// "used" when a later [`ResultArg`] references it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetArg;

/// Checksum kinds understood by the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsumKind {
    Inet,
}

/// One chunk fed into a checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsumChunk {
    /// Bytes of another argument, located by its resolved address.
    Data { arg: ArgId },
    /// A literal value, already byte-swapped to wire order by the
    /// generator; the low `size` bytes are fed in memory order.
    Const { val: u64, size: u64 },
}

/// A field whose runtime value is a checksum over the listed chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsumArg {
    pub dir: Dir,
    pub kind: CsumKind,
    pub size: u64,
    pub chunks: Vec<CsumChunk>,
}

impl CsumArg {
    pub fn new_inet(size: u64, chunks: Vec<CsumChunk>) -> Self {
        Self {
            dir: Dir::In,
            kind: CsumKind::Inet,
            size,
            chunks,
        }
    }
}

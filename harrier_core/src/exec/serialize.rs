//! Serialization of programs into the packed exec format.

use super::*;
use crate::arg::{Arg, CsumChunk, CsumKind};
use crate::prog::{ArgId, Call, Prog};
use crate::target::Target;
use crate::{HashMap, HashSet};
use bytes::BufMut;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SerializeError {
    #[error("buffer too small to serialize the prog, provided size: {provided} bytes")]
    BufferTooSmall { provided: usize },
    #[error("prog needs {count} copyout indices, max is {}", EXEC_MAX_COMMANDS)]
    CopyoutOverflow { count: u64 },
}

/// Serializes `p` for execution by process `pid` into `buf`, returning the
/// number of bytes written. The buffer is left partially written on error.
pub fn serialize(
    target: &Target,
    p: &Prog,
    pid: u64,
    buf: &mut [u8],
) -> Result<usize, SerializeError> {
    #[cfg(debug_assertions)]
    if let Err(e) = p.validate() {
        panic!("serializing invalid program: {}", e);
    }

    let provided = buf.len();
    let mut ctx = ExecCtx {
        target,
        prog: p,
        pid,
        used: p.uses(),
        buf,
        res_args: HashMap::default(),
        copyout_seq: 0,
        eof: false,
    };
    for call in p.calls() {
        ctx.serialize_call(call);
    }
    ctx.write_u64(EXEC_INSTR_EOF);

    if ctx.eof {
        Err(SerializeError::BufferTooSmall { provided })
    } else if ctx.copyout_seq > EXEC_MAX_COMMANDS {
        Err(SerializeError::CopyoutOverflow {
            count: ctx.copyout_seq,
        })
    } else {
        Ok(provided - ctx.buf.len())
    }
}

struct ExecCtx<'a, 'b> {
    target: &'a Target,
    prog: &'a Prog,
    pid: u64,
    used: HashSet<ArgId>,
    buf: &'b mut [u8],
    res_args: HashMap<ArgId, ArgInfo>,
    copyout_seq: u64,
    eof: bool,
}

#[derive(Clone, Copy)]
struct ArgInfo {
    /// Resolved address of the argument in the test process.
    addr: u64,
    /// Copyout index assigned to its runtime value.
    idx: u64,
    /// Value comes from the call return rather than a copyout.
    ret: bool,
}

impl ArgInfo {
    fn with_ret(idx: u64) -> Self {
        Self {
            addr: 0,
            idx,
            ret: true,
        }
    }

    fn with_addr(addr: u64) -> Self {
        Self {
            addr,
            idx: 0,
            ret: false,
        }
    }
}

impl ExecCtx<'_, '_> {
    fn serialize_call(&mut self, c: &Call) {
        let csums = self.call_csums(c);
        self.write_copyin(c, &csums);
        self.write_csums(csums);

        self.write_u64(c.sid() as u64);
        if self.used.contains(&c.ret()) {
            let idx = self.next_copyout_seq();
            self.res_args.insert(c.ret(), ArgInfo::with_ret(idx));
            self.write_u64(idx);
        } else {
            self.write_u64(EXEC_NO_COPYOUT);
        }
        self.write_u64(c.args().len() as u64);
        for &arg in c.args() {
            self.write_arg(arg);
        }
        self.write_copyout(c);
    }

    /// Checksum args of the call plus every arg their chunks cover; all of
    /// them need their addresses memoized during the copyin walk.
    fn call_csums(&self, c: &Call) -> CallCsums {
        let mut csums = CallCsums::default();
        let prog = self.prog;
        foreach_call_args(prog, self.target, c, &mut |id, _| {
            if let Some(csum) = prog.arg(id).as_csum() {
                csums.args.push(id);
                csums.uses.insert(id);
                for chunk in &csum.chunks {
                    if let CsumChunk::Data { arg } = chunk {
                        csums.uses.insert(*arg);
                    }
                }
            }
        });
        csums
    }

    fn write_copyin(&mut self, c: &Call, csums: &CallCsums) {
        let prog = self.prog;
        foreach_call_args(prog, self.target, c, &mut |id, ctx| {
            let base = match ctx.base {
                Some(base) => base,
                None => return,
            };
            let addr = base + ctx.offset;
            let arg = prog.arg(id);
            if self.used.contains(&id) || csums.uses.contains(&id) {
                self.res_args.insert(id, ArgInfo::with_addr(addr));
            }
            match arg {
                // Composites only contribute field offsets.
                Arg::Group(_) | Arg::Union(_) => return,
                // Checksums are emitted separately, ordered by address.
                Arg::Csum(_) => return,
                Arg::Const(a) if a.pad => return,
                Arg::Const(a) if a.size == 0 && a.bf_len == 0 => return,
                Arg::Data(a) if a.data.is_empty() => return,
                _ => {}
            }
            if arg.dir() == crate::arg::Dir::Out {
                return;
            }
            self.write_u64(EXEC_INSTR_COPY_IN);
            self.write_u64(addr);
            self.write_arg(id);
        });
    }

    /// Checksum instructions go out in reverse address order: an outer
    /// checksum may cover bytes whose own checksum is written by a later
    /// instruction, and the executor runs the stream sequentially.
    fn write_csums(&mut self, mut csums: CallCsums) {
        let prog = self.prog;
        csums.args.sort_by_key(|id| self.res_args[id].addr);
        for id in csums.args.into_iter().rev() {
            let csum = prog.arg(id).as_csum().expect("csum arg is not csum type");
            self.write_u64(EXEC_INSTR_COPY_IN);
            self.write_u64(self.res_args[&id].addr);
            self.write_u64(EXEC_ARG_CSUM);
            self.write_u64(csum.size);
            match csum.kind {
                CsumKind::Inet => {
                    self.write_u64(EXEC_ARG_CSUM_INET);
                    self.write_u64(csum.chunks.len() as u64);
                    for chunk in &csum.chunks {
                        match *chunk {
                            CsumChunk::Data { arg } => {
                                self.write_u64(EXEC_ARG_CSUM_CHUNK_DATA);
                                self.write_u64(self.res_args[&arg].addr);
                                self.write_u64(prog.size_of(arg));
                            }
                            CsumChunk::Const { val, size } => {
                                self.write_u64(EXEC_ARG_CSUM_CHUNK_CONST);
                                self.write_u64(val);
                                self.write_u64(size);
                            }
                        }
                    }
                }
            }
        }
    }

    fn write_copyout(&mut self, c: &Call) {
        let prog = self.prog;
        foreach_call_args(prog, self.target, c, &mut |id, ctx| {
            if !self.used.contains(&id) {
                return;
            }
            match prog.arg(id) {
                // Idx was already assigned at call emission.
                Arg::Ret(_) => {}
                Arg::Const(_) | Arg::Result(_) => {
                    assert!(ctx.base.is_some(), "copyout arg base is not a pointer");
                    let idx = self.next_copyout_seq();
                    let info = self.res_args.get_mut(&id).expect("copyout arg has no addr");
                    info.idx = idx;
                    let addr = info.addr;
                    self.write_u64(EXEC_INSTR_COPY_OUT);
                    self.write_u64(idx);
                    self.write_u64(addr);
                    self.write_u64(prog.size_of(id));
                }
                _ => unreachable!("bad arg kind in copyout"),
            }
        });
    }

    fn write_arg(&mut self, id: ArgId) {
        let prog = self.prog;
        match prog.arg(id) {
            Arg::Const(a) => {
                let val = a.value(self.pid);
                self.write_const_arg(a.size, val, a.bf_off, a.bf_len);
            }
            Arg::Result(a) => match a.src {
                None => self.write_const_arg(a.size, a.val, 0, 0),
                Some(src) => {
                    let info = self.res_args.get(&src).expect("no copyout index");
                    let idx = info.idx;
                    self.write_u64(EXEC_ARG_RESULT);
                    self.write_u64(a.size);
                    self.write_u64(idx);
                    self.write_u64(a.op_div);
                    self.write_u64(a.op_add);
                }
            },
            Arg::Ptr(a) => {
                let addr = self.target.physical_addr(a);
                self.write_const_arg(prog.size_of(id), addr, 0, 0);
            }
            Arg::Data(a) => {
                if a.data.is_empty() {
                    return;
                }
                self.write_u64(EXEC_ARG_DATA);
                self.write_u64(a.data.len() as u64);
                self.write_slice(&a.data);
                let pad = 8 - a.data.len() % 8;
                if pad != 8 {
                    static PAD: [u8; 8] = [0; 8];
                    self.write_slice(&PAD[..pad]);
                }
            }
            Arg::Union(a) => self.write_arg(a.option),
            Arg::Group(_) | Arg::Ret(_) | Arg::Csum(_) => unreachable!("bad arg kind in write_arg"),
        }
    }

    fn write_const_arg(&mut self, size: u64, val: u64, bf_off: u64, bf_len: u64) {
        self.write_u64(EXEC_ARG_CONST);
        self.write_u64(size);
        self.write_u64(val);
        self.write_u64(bf_off);
        self.write_u64(bf_len);
    }

    fn write_u64(&mut self, val: u64) {
        if self.buf.len() >= 8 {
            self.buf.put_u64_le(val);
        } else {
            self.eof = true;
        }
    }

    fn write_slice(&mut self, slice: &[u8]) {
        if self.buf.len() >= slice.len() {
            self.buf.put_slice(slice);
        } else {
            self.eof = true;
        }
    }

    fn next_copyout_seq(&mut self) -> u64 {
        let tmp = self.copyout_seq;
        self.copyout_seq += 1;
        tmp
    }
}

#[derive(Default)]
struct CallCsums {
    args: Vec<ArgId>,
    uses: HashSet<ArgId>,
}

#[derive(Default, Clone)]
struct WalkCtx {
    /// Resolved address of the innermost enclosing pointee, if any.
    base: Option<u64>,
    /// Byte offset of the current arg inside that pointee.
    offset: u64,
}

fn foreach_call_args(
    prog: &Prog,
    target: &Target,
    call: &Call,
    f: &mut dyn FnMut(ArgId, &WalkCtx),
) {
    let mut ctx = WalkCtx::default();
    foreach_arg(prog, target, call.ret(), &mut ctx, f);
    for &arg in call.args() {
        foreach_arg(prog, target, arg, &mut ctx, f);
    }
}

fn foreach_arg(
    prog: &Prog,
    target: &Target,
    id: ArgId,
    ctx: &mut WalkCtx,
    f: &mut dyn FnMut(ArgId, &WalkCtx),
) {
    let ctx_backup = ctx.clone();

    f(id, ctx);

    match prog.arg(id) {
        Arg::Group(group) => {
            for &field in &group.fields {
                foreach_arg(prog, target, field, ctx, f);
                ctx.offset += prog.size_of(field);
            }
        }
        Arg::Union(union) => foreach_arg(prog, target, union.option, ctx, f),
        Arg::Ptr(ptr) => {
            if let Some(pointee) = ptr.pointee {
                ctx.base = Some(target.physical_addr(ptr));
                ctx.offset = 0;
                foreach_arg(prog, target, pointee, ctx, f);
            }
        }
        _ => {}
    }

    *ctx = ctx_backup;
}

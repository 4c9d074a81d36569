//! Control pipe serving: handshake, execute requests, replies.

use crate::env::ExecEnv;
use crate::exec::Executor;
use crate::output::Output;
use harrier_core::exec::message::{
    ExecuteReply, ExecuteReq, HandshakeReply, HandshakeReq, IN_MAGIC, OUT_MAGIC,
    STATUS_INTERNAL_ERROR, STATUS_OK,
};
use harrier_core::exec::{sandbox_of_flags, ExecOpt, EXEC_BUFFER_SIZE, FLAG_DEBUG};
use log::{debug, error};
use std::io::{ErrorKind, Read, Write};
use std::mem;
use std::slice;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CommError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad handshake magic {magic:#x}")]
    BadHandshakeMagic { magic: u64 },
    #[error("bad execute request magic {magic:#x}")]
    BadExecuteMagic { magic: u64 },
    #[error("bad execute prog size {size:#x}")]
    BadProgSize { size: u64 },
}

/// Serves execute requests from the control pipe until the peer hangs up.
/// Per-call records land in `out_buf`; replies go back on `output`.
pub fn serve<E, R, W>(
    env: Arc<E>,
    mut input: R,
    mut output: W,
    out_buf: &mut [u8],
) -> Result<(), CommError>
where
    E: ExecEnv,
    R: Read,
    W: Write,
{
    let hs: HandshakeReq = read_pod(&mut input)?;
    if hs.magic != IN_MAGIC {
        return Err(CommError::BadHandshakeMagic { magic: hs.magic });
    }
    debug!(
        "handshake: pid={} sandbox={:?}",
        hs.pid,
        sandbox_of_flags(hs.env_flags)
    );
    let mut exec = Executor::new(env);
    exec.set_debug(hs.env_flags & FLAG_DEBUG != 0);
    write_pod(&mut output, &HandshakeReply { magic: OUT_MAGIC })?;

    loop {
        let req: ExecuteReq = match read_pod(&mut input) {
            Ok(req) => req,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if req.magic != IN_MAGIC {
            return Err(CommError::BadExecuteMagic { magic: req.magic });
        }
        if req.prog_size as usize > EXEC_BUFFER_SIZE {
            return Err(CommError::BadProgSize {
                size: req.prog_size,
            });
        }
        exec.set_debug(req.env_flags & FLAG_DEBUG != 0);
        let mut prog = vec![0u8; req.prog_size as usize];
        input.read_exact(&mut prog)?;
        let opt = ExecOpt {
            flags: req.exec_flags,
            fault_call: req.fault_call,
            fault_nth: req.fault_nth,
        };
        debug!(
            "exec opts: flags={:#x} fault={}/{} prog={}",
            req.exec_flags, req.fault_call, req.fault_nth, req.prog_size
        );

        let mut out = Output::new(&mut *out_buf);
        let status = match exec.execute_one(&prog, &mut out, &opt) {
            Ok(()) => STATUS_OK,
            Err(e) => {
                error!("execute failed: {}", e);
                STATUS_INTERNAL_ERROR
            }
        };
        write_pod(
            &mut output,
            &ExecuteReply {
                magic: OUT_MAGIC,
                done: 1,
                status,
            },
        )?;
    }
}

fn read_pod<T: Default, R: Read>(r: &mut R) -> Result<T, std::io::Error> {
    let mut v = T::default();
    let data =
        unsafe { slice::from_raw_parts_mut((&mut v as *mut T).cast::<u8>(), mem::size_of::<T>()) };
    r.read_exact(data)?;
    Ok(v)
}

fn write_pod<T, W: Write>(w: &mut W, v: &T) -> Result<(), std::io::Error> {
    let data = unsafe { slice::from_raw_parts((v as *const T).cast::<u8>(), mem::size_of::<T>()) };
    w.write_all(data)
}

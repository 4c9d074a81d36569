//! Guarded loads and stores into guest memory.
//!
//! All accesses may target unmapped pages; faults are reported by the env
//! and swallowed here so the program keeps executing. Only operand sizes
//! 1/2/4/8 are legal, anything else is a corrupt stream.

use crate::env::ExecEnv;
use crate::exec::ExecError;
use harrier_core::exec::EXEC_DEFAULT_VALUE;
use log::debug;

fn check_size(size: u64) -> Result<usize, ExecError> {
    match size {
        1 | 2 | 4 | 8 => Ok(size as usize),
        _ => Err(ExecError::BadOperandSize { size }),
    }
}

/// Writes the low `size` bytes of `val` at `addr`. A nonzero `bf_len`
/// selects the `[bf_off, bf_off + bf_len)` bit range of the unit instead,
/// preserving the other bits.
pub(crate) fn copyin<E: ExecEnv>(
    env: &E,
    addr: u64,
    val: u64,
    size: u64,
    bf_off: u64,
    bf_len: u64,
) -> Result<(), ExecError> {
    let size = check_size(size)?;
    let word = if bf_off == 0 && bf_len == 0 {
        val
    } else {
        let mut unit = [0u8; 8];
        if env.read_mem(addr, &mut unit[..size]).is_err() {
            debug!("copyin: fault loading bitfield unit at {:#x}", addr);
            return Ok(());
        }
        let cur = u64::from_le_bytes(unit);
        let mask = (((1u128 << bf_len) - 1) as u64) << bf_off;
        (cur & !mask) | ((val << bf_off) & mask)
    };
    if env.write_mem(addr, &word.to_le_bytes()[..size]).is_err() {
        debug!("copyin: fault storing {} bytes at {:#x}", size, addr);
    }
    Ok(())
}

/// Reads `size` bytes at `addr`, zero-extended; faults yield the default
/// value so dependents resolve deterministically.
pub(crate) fn copyout<E: ExecEnv>(env: &E, addr: u64, size: u64) -> Result<u64, ExecError> {
    let size = check_size(size)?;
    let mut buf = [0u8; 8];
    if env.read_mem(addr, &mut buf[..size]).is_err() {
        debug!("copyout: fault loading {} bytes at {:#x}", size, addr);
        return Ok(EXEC_DEFAULT_VALUE);
    }
    Ok(u64::from_le_bytes(buf))
}

//! Program execution: stream parsing, call scheduling on the worker pool
//! and completion handling.

use crate::cover::{hash, DedupTable, KcovComparison};
use crate::csum::CsumInet;
use crate::env::{ExecEnv, SyscallRes};
use crate::event::Event;
use crate::mem;
use crate::output::Output;
use harrier_core::exec::{
    ExecOpt, EXEC_ARG_CONST, EXEC_ARG_CSUM, EXEC_ARG_CSUM_CHUNK_CONST, EXEC_ARG_CSUM_CHUNK_DATA,
    EXEC_ARG_CSUM_INET, EXEC_ARG_DATA, EXEC_ARG_RESULT, EXEC_BUFFER_SIZE, EXEC_COVER_SIZE,
    EXEC_DEFAULT_VALUE, EXEC_INSTR_COPY_IN, EXEC_INSTR_COPY_OUT, EXEC_INSTR_EOF, EXEC_MAX_ARGS,
    EXEC_MAX_COMMANDS, EXEC_MAX_THREADS, EXEC_NO_COPYOUT, FLAG_COLLECT_COMPS, FLAG_COLLECT_COVER,
    FLAG_COLLIDE, FLAG_DEDUP_COVER, FLAG_INJECT_FAULT, FLAG_THREADED,
};
use log::debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// Programmer errors: a corrupt stream, a broken encoder or an impossible
/// scheduler state. All of them stop the execution with a diagnostic.
/// Expected runtime faults (guest memory accesses) never surface here.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("input command overflows input at word {pos}")]
    InputOverrun { pos: usize },
    #[error("prog size {size} overflows input buffer")]
    ProgTooLarge { size: usize },
    #[error("bad argument type {typ:#x}")]
    BadArgType { typ: u64 },
    #[error("bad checksum kind {kind}")]
    BadCsumKind { kind: u64 },
    #[error("bad checksum chunk kind {kind}")]
    BadCsumChunkKind { kind: u64 },
    #[error("bad checksum const chunk size {size}")]
    BadCsumChunkSize { size: u64 },
    #[error("inet checksum must be 2 bytes, not {size}")]
    BadCsumSize { size: u64 },
    #[error("bad argument size {size}")]
    BadOperandSize { size: u64 },
    #[error("invalid call number {call_num}")]
    BadCallNum { call_num: u64 },
    #[error("call has bad number of arguments {num_args}")]
    BadNumArgs { num_args: u64 },
    #[error("result index {idx} overflows max commands")]
    BadResultIndex { idx: u64 },
    #[error("out of threads")]
    OutOfThreads,
    #[error("bad thread state: ready={ready} done={done} handled={handled}")]
    BadThreadState {
        ready: bool,
        done: bool,
        handled: bool,
    },
    #[error("using non-main thread {tid} in non-thread mode")]
    NonMainThread { tid: usize },
    #[error("running count went negative")]
    NegativeRunning,
    #[error("both collide and fault injection are enabled")]
    CollideFaultConflict,
    #[error("too many coverage words: {words}")]
    CoverOverflow { words: usize },
    #[error("output buffer overflow")]
    OutputOverflow,
}

#[derive(Debug, Clone, Copy, Default)]
struct ResEntry {
    executed: bool,
    val: u64,
}

/// Call slot shared between the coordinator and one worker. The ready/done
/// handshake guarantees exactly one side touches it at a time.
#[derive(Default)]
struct CallSlot {
    call_num: u64,
    num_args: usize,
    args: [u64; EXEC_MAX_ARGS as usize],
    inject_fault: bool,
    fault_nth: u64,
    res: SyscallRes,
    fault_injected: bool,
    cover: Vec<u64>,
}

struct ThreadShared {
    id: usize,
    ready: Event,
    done: Event,
    stop: AtomicBool,
    slot: Mutex<CallSlot>,
}

/// Coordinator-side view of one pool slot. Everything here is owned by the
/// coordinator; workers only ever touch their `ThreadShared`.
struct Thread {
    created: bool,
    spawned: bool,
    handled: bool,
    call_index: usize,
    call_num: u64,
    copyout_index: u64,
    /// Word position right after the call's arguments; completion re-reads
    /// the copyout instructions from here.
    copyout_pos: usize,
    shared: Arc<ThreadShared>,
    join: Option<thread::JoinHandle<()>>,
}

impl Thread {
    fn new(id: usize) -> Self {
        Self {
            created: false,
            spawned: false,
            handled: false,
            call_index: 0,
            call_num: 0,
            copyout_index: EXEC_NO_COPYOUT,
            copyout_pos: 0,
            shared: Arc::new(ThreadShared {
                id,
                ready: Event::new(),
                done: Event::new(),
                stop: AtomicBool::new(false),
                slot: Mutex::new(CallSlot::default()),
            }),
            join: None,
        }
    }
}

/// Executes serialized programs against one target env. The results table,
/// dedup table and worker pool live as long as the executor and are
/// re-seeded at the start of every program.
pub struct Executor<E: ExecEnv> {
    env: Arc<E>,
    debug: bool,
    opt: ExecOpt,
    input: Vec<u64>,
    results: Vec<ResEntry>,
    dedup: DedupTable,
    threads: Vec<Thread>,
    running: i64,
    completed: u32,
    completed_pos: usize,
    collide: bool,
}

impl<E: ExecEnv> Executor<E> {
    pub fn new(env: Arc<E>) -> Self {
        Self {
            env,
            debug: false,
            opt: ExecOpt::new(),
            input: Vec::new(),
            results: vec![ResEntry::default(); EXEC_MAX_COMMANDS as usize],
            dedup: DedupTable::new(),
            threads: (0..EXEC_MAX_THREADS).map(Thread::new).collect(),
            running: 0,
            completed: 0,
            completed_pos: 0,
            collide: false,
        }
    }

    /// Debug mode stretches the per-call completion timeout so single-step
    /// diagnostics do not turn every call into a straggler.
    pub fn set_debug(&mut self, debug: bool) {
        self.debug = debug;
    }

    /// Runs one serialized program, emitting a record per completed call
    /// into `out`.
    pub fn execute_one(
        &mut self,
        prog: &[u8],
        out: &mut Output<'_>,
        opt: &ExecOpt,
    ) -> Result<(), ExecError> {
        if prog.len() > EXEC_BUFFER_SIZE {
            return Err(ExecError::ProgTooLarge { size: prog.len() });
        }
        let mut opt = opt.clone();
        opt.normalize();
        self.opt = opt;
        self.input.clear();
        self.input.extend(
            prog.chunks_exact(8)
                .map(|w| u64::from_le_bytes(w.try_into().unwrap())),
        );
        self.results.fill(ResEntry::default());
        self.dedup.clear();
        self.completed = 0;
        self.collide = false;
        // Number of executed calls, updated after each record.
        self.completed_pos = out.write_u32(0)?;

        loop {
            self.run_pass(out)?;
            if self.opt.is_enabled(FLAG_COLLIDE)
                && !self.opt.is_enabled(FLAG_INJECT_FAULT)
                && !self.collide
            {
                debug!("enabling collider");
                self.collide = true;
                continue;
            }
            break;
        }
        Ok(())
    }

    fn run_pass(&mut self, out: &mut Output<'_>) -> Result<(), ExecError> {
        let threaded = self.opt.is_enabled(FLAG_THREADED);
        if !self.collide && !threaded {
            self.env.cover_enable(0);
        }

        let mut pos = 0usize;
        let mut call_index = 0usize;
        loop {
            let call_num = self.read_input(&mut pos)?;
            if call_num == EXEC_INSTR_EOF {
                break;
            }
            if call_num == EXEC_INSTR_COPY_IN {
                self.do_copyin(&mut pos)?;
                continue;
            }
            if call_num == EXEC_INSTR_COPY_OUT {
                // The copyout happens when/if the owning call completes.
                self.read_input(&mut pos)?;
                self.read_input(&mut pos)?;
                self.read_input(&mut pos)?;
                continue;
            }

            // Normal syscall.
            if call_num >= self.env.syscall_count() {
                return Err(ExecError::BadCallNum { call_num });
            }
            let copyout_index = self.read_input(&mut pos)?;
            let num_args = self.read_input(&mut pos)?;
            if num_args > EXEC_MAX_ARGS {
                return Err(ExecError::BadNumArgs { num_args });
            }
            let mut args = [0u64; EXEC_MAX_ARGS as usize];
            for arg in args.iter_mut().take(num_args as usize) {
                *arg = self.read_arg(&mut pos)?;
            }
            let ti = self.schedule_call(
                call_index,
                call_num,
                copyout_index,
                num_args as usize,
                args,
                pos,
                out,
            )?;
            call_index += 1;

            if self.collide && call_index % 2 == 0 {
                // Don't wait; results from the previous pass stand in.
            } else if threaded {
                let timeout = Duration::from_millis(if self.debug { 500 } else { 20 });
                if self.threads[ti].shared.done.timed_wait(timeout) {
                    self.handle_completion(ti, out)?;
                }
                if self.running < 0 {
                    return Err(ExecError::NegativeRunning);
                }
                if self.running > 0 {
                    // Slow calls may have been unblocked by the one we just
                    // issued; grant them a grace window before moving on.
                    let last = self.peek_input(pos)? == EXEC_INSTR_EOF;
                    thread::sleep(Duration::from_millis(if last { 10 } else { 1 }));
                    for i in 0..self.threads.len() {
                        let th = &self.threads[i];
                        if th.created && !th.handled && th.shared.done.is_set() {
                            self.handle_completion(i, out)?;
                        }
                    }
                }
            } else {
                if ti != 0 {
                    return Err(ExecError::NonMainThread { tid: ti });
                }
                execute_call(&self.threads[0].shared, &*self.env);
                self.handle_completion(0, out)?;
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn schedule_call(
        &mut self,
        call_index: usize,
        call_num: u64,
        copyout_index: u64,
        num_args: usize,
        args: [u64; EXEC_MAX_ARGS as usize],
        pos: usize,
        out: &mut Output<'_>,
    ) -> Result<usize, ExecError> {
        if self.opt.is_enabled(FLAG_INJECT_FAULT) && self.opt.is_enabled(FLAG_COLLIDE) {
            return Err(ExecError::CollideFaultConflict);
        }
        if copyout_index != EXEC_NO_COPYOUT && copyout_index >= EXEC_MAX_COMMANDS {
            return Err(ExecError::BadResultIndex { idx: copyout_index });
        }
        let threaded = self.opt.is_enabled(FLAG_THREADED);

        // Find a spare thread to execute the call.
        let mut chosen = None;
        for i in 0..self.threads.len() {
            self.thread_create(i, threaded);
            if self.threads[i].shared.done.is_set() {
                if !self.threads[i].handled {
                    self.handle_completion(i, out)?;
                }
                chosen = Some(i);
                break;
            }
        }
        let ti = chosen.ok_or(ExecError::OutOfThreads)?;

        let (ready, done, handled) = {
            let th = &self.threads[ti];
            (th.shared.ready.is_set(), th.shared.done.is_set(), th.handled)
        };
        if ready || !done || !handled {
            return Err(ExecError::BadThreadState {
                ready,
                done,
                handled,
            });
        }
        debug!("scheduling call {} [{}] on thread {}", call_index, call_num, ti);

        let inject =
            self.opt.is_enabled(FLAG_INJECT_FAULT) && call_index as u64 == self.opt.fault_call;
        let fault_nth = self.opt.fault_nth;
        let th = &mut self.threads[ti];
        th.copyout_pos = pos;
        th.copyout_index = copyout_index;
        th.shared.done.reset();
        th.handled = false;
        th.call_index = call_index;
        th.call_num = call_num;
        {
            let mut slot = th.shared.slot.lock().unwrap();
            slot.call_num = call_num;
            slot.num_args = num_args;
            slot.args = args;
            slot.inject_fault = inject;
            slot.fault_nth = fault_nth;
        }
        self.running += 1;
        if threaded {
            th.shared.ready.set();
        }
        Ok(ti)
    }

    fn thread_create(&mut self, i: usize, threaded: bool) {
        let th = &mut self.threads[i];
        if !th.created {
            th.created = true;
            th.handled = true;
            th.shared.done.set();
        }
        if threaded && !th.spawned {
            th.spawned = true;
            let shared = Arc::clone(&th.shared);
            let env = Arc::clone(&self.env);
            th.join = Some(thread::spawn(move || worker_thread(shared, env)));
        }
    }

    fn handle_completion(&mut self, ti: usize, out: &mut Output<'_>) -> Result<(), ExecError> {
        let (ready, done, handled) = {
            let th = &self.threads[ti];
            (th.shared.ready.is_set(), th.shared.done.is_set(), th.handled)
        };
        if ready || !done || handled {
            return Err(ExecError::BadThreadState {
                ready,
                done,
                handled,
            });
        }
        debug!(
            "completion of call {} [{}] on thread {}",
            self.threads[ti].call_index, self.threads[ti].call_num, ti
        );
        let (res, fault_injected, cover) = {
            let mut slot = self.threads[ti].shared.slot.lock().unwrap();
            (slot.res, slot.fault_injected, std::mem::take(&mut slot.cover))
        };

        if !res.failed() {
            if self.threads[ti].copyout_index != EXEC_NO_COPYOUT {
                let idx = self.threads[ti].copyout_index as usize;
                self.results[idx] = ResEntry {
                    executed: true,
                    val: res.res,
                };
            }
            let mut pos = self.threads[ti].copyout_pos;
            loop {
                let instr = self.read_input(&mut pos)?;
                if instr != EXEC_INSTR_COPY_OUT {
                    break;
                }
                let index = self.read_input(&mut pos)?;
                let addr = self.read_input(&mut pos)?;
                let size = self.read_input(&mut pos)?;
                let val = mem::copyout(&*self.env, addr, size)?;
                if index >= EXEC_MAX_COMMANDS {
                    return Err(ExecError::BadResultIndex { idx: index });
                }
                self.results[index as usize] = ResEntry {
                    executed: true,
                    val,
                };
                debug!("copyout {:#x} from {:#x}", val, addr);
            }
        }

        if !self.collide {
            self.write_call_record(ti, res, fault_injected, &cover, out)?;
            self.completed += 1;
            out.set_u32(self.completed_pos, self.completed);
        }
        self.threads[ti].handled = true;
        self.running -= 1;
        Ok(())
    }

    fn write_call_record(
        &mut self,
        ti: usize,
        res: SyscallRes,
        fault_injected: bool,
        cover: &[u64],
        out: &mut Output<'_>,
    ) -> Result<(), ExecError> {
        let call_index = self.threads[ti].call_index;
        let call_num = self.threads[ti].call_num;
        let errno = if res.failed() { res.errno } else { 0 };
        out.write_u32(call_index as u32)?;
        out.write_u32(call_num as u32)?;
        out.write_u32(errno)?;
        out.write_u32(fault_injected as u32)?;
        let signal_count_pos = out.write_u32(0)?;
        let cover_count_pos = out.write_u32(0)?;
        let comps_count_pos = out.write_u32(0)?;
        let mut nsig = 0u32;
        let mut cover_size = 0u32;
        let mut comps_size = 0u32;

        if self.opt.is_enabled(FLAG_COLLECT_COMPS) {
            if cover.len() > EXEC_COVER_SIZE {
                return Err(ExecError::CoverOverflow { words: cover.len() });
            }
            let mut comps: Vec<KcovComparison> = cover
                .chunks_exact(4)
                .map(KcovComparison::from_words)
                .collect();
            comps.sort_unstable_by_key(|c| c.key());
            comps.dedup_by_key(|c| c.key());
            for cmp in &comps {
                if cmp.ignore() {
                    continue;
                }
                comps_size += 1;
                cmp.write(out)?;
            }
        } else {
            // Feedback signals: code edges as the xor of two subsequent
            // basic block PCs.
            let mut prev = 0u32;
            for &word in cover {
                let pc = word as u32;
                let sig = pc ^ prev;
                prev = hash(pc);
                if self.dedup.dedup(sig) {
                    continue;
                }
                out.write_u32(sig)?;
                nsig += 1;
            }
            if self.opt.is_enabled(FLAG_COLLECT_COVER) {
                let mut pcs = cover.to_vec();
                if self.opt.is_enabled(FLAG_DEDUP_COVER) {
                    pcs.sort_unstable();
                    pcs.dedup();
                }
                cover_size = pcs.len() as u32;
                // PCs are truncated to u32; fine for x86_64 and arm64
                // without KASLR.
                for pc in pcs {
                    out.write_u32(pc as u32)?;
                }
            }
        }

        out.set_u32(signal_count_pos, nsig);
        out.set_u32(cover_count_pos, cover_size);
        out.set_u32(comps_count_pos, comps_size);
        debug!(
            "out #{}: index={} num={} errno={} sig={} cover={} comps={}",
            self.completed, call_index, call_num, errno, nsig, cover_size, comps_size
        );
        Ok(())
    }

    fn do_copyin(&self, pos: &mut usize) -> Result<(), ExecError> {
        let addr = self.read_input(pos)?;
        let typ = self.read_input(pos)?;
        let size = self.read_input(pos)?;
        debug!("copyin to {:#x}", addr);
        match typ {
            EXEC_ARG_CONST => {
                let val = self.read_input(pos)?;
                let bf_off = self.read_input(pos)?;
                let bf_len = self.read_input(pos)?;
                mem::copyin(&*self.env, addr, val, size, bf_off, bf_len)
            }
            EXEC_ARG_RESULT => {
                let val = self.read_result(pos)?;
                mem::copyin(&*self.env, addr, val, size, 0, 0)
            }
            EXEC_ARG_DATA => {
                let len = size as usize;
                let nwords = len.checked_add(7).ok_or(ExecError::InputOverrun { pos: *pos })? / 8;
                let end = pos
                    .checked_add(nwords)
                    .filter(|&end| end <= self.input.len())
                    .ok_or(ExecError::InputOverrun { pos: *pos })?;
                let mut bytes = Vec::with_capacity(nwords * 8);
                for &word in &self.input[*pos..end] {
                    bytes.extend_from_slice(&word.to_le_bytes());
                }
                bytes.truncate(len);
                if self.env.write_mem(addr, &bytes).is_err() {
                    debug!("copyin: fault storing {} data bytes at {:#x}", len, addr);
                }
                *pos = end;
                Ok(())
            }
            EXEC_ARG_CSUM => self.do_csum(pos, addr, size),
            _ => Err(ExecError::BadArgType { typ }),
        }
    }

    fn do_csum(&self, pos: &mut usize, addr: u64, size: u64) -> Result<(), ExecError> {
        let kind = self.read_input(pos)?;
        match kind {
            EXEC_ARG_CSUM_INET => {
                if size != 2 {
                    return Err(ExecError::BadCsumSize { size });
                }
                debug!("calculating inet checksum for {:#x}", addr);
                let mut csum = CsumInet::new();
                let chunks = self.read_input(pos)?;
                for i in 0..chunks {
                    let chunk_kind = self.read_input(pos)?;
                    let chunk_value = self.read_input(pos)?;
                    let chunk_size = self.read_input(pos)?;
                    match chunk_kind {
                        EXEC_ARG_CSUM_CHUNK_DATA => {
                            debug!(
                                "#{}: data chunk, addr {:#x}, size {}",
                                i, chunk_value, chunk_size
                            );
                            let mut buf = vec![0u8; chunk_size as usize];
                            if self.env.read_mem(chunk_value, &mut buf).is_ok() {
                                csum.update(&buf);
                            } else {
                                debug!(
                                    "csum: fault reading {} bytes at {:#x}",
                                    chunk_size, chunk_value
                                );
                            }
                        }
                        EXEC_ARG_CSUM_CHUNK_CONST => {
                            if chunk_size != 2 && chunk_size != 4 && chunk_size != 8 {
                                return Err(ExecError::BadCsumChunkSize { size: chunk_size });
                            }
                            debug!(
                                "#{}: const chunk, value {:#x}, size {}",
                                i, chunk_value, chunk_size
                            );
                            csum.update(&chunk_value.to_le_bytes()[..chunk_size as usize]);
                        }
                        _ => return Err(ExecError::BadCsumChunkKind { kind: chunk_kind }),
                    }
                }
                let digest = csum.digest();
                debug!("writing inet checksum {:#x} to {:#x}", digest, addr);
                mem::copyin(&*self.env, addr, digest as u64, 2, 0, 0)
            }
            _ => Err(ExecError::BadCsumKind { kind }),
        }
    }

    fn read_arg(&self, pos: &mut usize) -> Result<u64, ExecError> {
        let typ = self.read_input(pos)?;
        let _size = self.read_input(pos)?;
        match typ {
            EXEC_ARG_CONST => {
                let val = self.read_input(pos)?;
                // Bitfields can't be args of a plain call; skip the words.
                self.read_input(pos)?;
                self.read_input(pos)?;
                Ok(val)
            }
            EXEC_ARG_RESULT => self.read_result(pos),
            _ => Err(ExecError::BadArgType { typ }),
        }
    }

    fn read_result(&self, pos: &mut usize) -> Result<u64, ExecError> {
        let idx = self.read_input(pos)?;
        let op_div = self.read_input(pos)?;
        let op_add = self.read_input(pos)?;
        if idx >= EXEC_MAX_COMMANDS {
            return Err(ExecError::BadResultIndex { idx });
        }
        let entry = self.results[idx as usize];
        if !entry.executed {
            return Ok(EXEC_DEFAULT_VALUE);
        }
        let mut val = entry.val;
        if op_div != 0 {
            val /= op_div;
        }
        Ok(val.wrapping_add(op_add))
    }

    fn read_input(&self, pos: &mut usize) -> Result<u64, ExecError> {
        let word = self
            .input
            .get(*pos)
            .copied()
            .ok_or(ExecError::InputOverrun { pos: *pos })?;
        *pos += 1;
        Ok(word)
    }

    fn peek_input(&self, pos: usize) -> Result<u64, ExecError> {
        self.input
            .get(pos)
            .copied()
            .ok_or(ExecError::InputOverrun { pos })
    }
}

impl<E: ExecEnv> Drop for Executor<E> {
    fn drop(&mut self) {
        for th in &self.threads {
            if th.spawned {
                th.shared.stop.store(true, Ordering::SeqCst);
                th.shared.ready.set();
            }
        }
        for th in &mut self.threads {
            if let Some(join) = th.join.take() {
                let _ = join.join();
            }
        }
    }
}

fn worker_thread<E: ExecEnv>(shared: Arc<ThreadShared>, env: Arc<E>) {
    env.cover_enable(shared.id);
    loop {
        shared.ready.wait();
        if shared.stop.load(Ordering::SeqCst) {
            break;
        }
        execute_call(&shared, &*env);
    }
}

fn execute_call<E: ExecEnv>(shared: &ThreadShared, env: &E) {
    shared.ready.reset();
    let (call_num, num_args, args, inject, fault_nth) = {
        let slot = shared.slot.lock().unwrap();
        (
            slot.call_num,
            slot.num_args,
            slot.args,
            slot.inject_fault,
            slot.fault_nth,
        )
    };
    debug!("#{}: call {}({:?})", shared.id, call_num, &args[..num_args]);
    if inject {
        debug!("#{}: injecting fault into {}-th operation", shared.id, fault_nth);
        env.inject_fault(fault_nth);
    }
    env.cover_reset(shared.id);
    let res = env.execute_syscall(call_num, &args[..num_args]);
    let cover = env.cover_collect(shared.id);
    let fault_injected = inject && env.fault_injected();
    if res.failed() {
        debug!("#{}: call {} = errno({})", shared.id, call_num, res.errno);
    } else {
        debug!("#{}: call {} = {:#x}", shared.id, call_num, res.res);
    }
    {
        let mut slot = shared.slot.lock().unwrap();
        slot.res = res;
        slot.fault_injected = fault_injected;
        slot.cover = cover;
    }
    shared.done.set();
}

//! Encoder-to-executor tests against a scripted in-memory target.

use harrier_core::arg::{ConstArg, CsumArg, CsumChunk, DataArg, Dir, GroupArg, PtrArg, ResultArg};
use harrier_core::exec::serialize::{serialize, SerializeError};
use harrier_core::exec::{
    ExecOpt, EXEC_BUFFER_SIZE, FLAG_COLLECT_COMPS, FLAG_COLLIDE, FLAG_INJECT_FAULT, FLAG_THREADED,
};
use harrier_core::prog::{Prog, ProgBuilder};
use harrier_core::syscall::Syscall;
use harrier_core::target::Target;
use harrier_executor::csum::CsumInet;
use harrier_executor::{ExecEnv, ExecError, Executor, MemFault, Output, SyscallRes};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const PAGE_SIZE: u64 = 4096;
const PAGE_NUM: u64 = 256;
const DATA_OFFSET: u64 = 0x10000;

const SC_ALLOC: usize = 0;
const SC_ECHO: usize = 1;
const SC_FAIL: usize = 2;
const SC_FILL: usize = 3;
const SC_SLEEP: usize = 4;

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn target() -> Target {
    let names = ["alloc", "echo", "fail", "fill", "sleep"];
    let syscalls = names
        .iter()
        .enumerate()
        .map(|(id, name)| Syscall::new(id, id as u64, name))
        .collect();
    Target::new("test", "amd64", PAGE_SIZE, PAGE_NUM, DATA_OFFSET, syscalls)
}

/// Scripted target: flat guest memory at `DATA_OFFSET`, a handful of fake
/// syscalls and queued coverage.
struct TestEnv {
    mem: Mutex<Vec<u8>>,
    calls: Mutex<Vec<(u64, Vec<u64>)>>,
    cover_script: Mutex<VecDeque<Vec<u64>>>,
    next_handle: AtomicU64,
    fault_armed: AtomicBool,
}

impl TestEnv {
    fn new() -> Self {
        Self {
            mem: Mutex::new(vec![0; (PAGE_SIZE * PAGE_NUM) as usize]),
            calls: Mutex::new(Vec::new()),
            cover_script: Mutex::new(VecDeque::new()),
            next_handle: AtomicU64::new(100),
            fault_armed: AtomicBool::new(false),
        }
    }

    fn with_cover(script: Vec<Vec<u64>>) -> Self {
        let env = Self::new();
        *env.cover_script.lock().unwrap() = script.into();
        env
    }

    fn calls(&self) -> Vec<(u64, Vec<u64>)> {
        self.calls.lock().unwrap().clone()
    }

    fn mem_at(&self, addr: u64, len: usize) -> Vec<u8> {
        let start = (addr - DATA_OFFSET) as usize;
        self.mem.lock().unwrap()[start..start + len].to_vec()
    }
}

impl ExecEnv for TestEnv {
    fn syscall_count(&self) -> u64 {
        5
    }

    fn execute_syscall(&self, call_num: u64, args: &[u64]) -> SyscallRes {
        self.calls.lock().unwrap().push((call_num, args.to_vec()));
        match call_num as usize {
            SC_ALLOC => SyscallRes::ok(self.next_handle.fetch_add(1, Ordering::SeqCst)),
            SC_ECHO => SyscallRes::ok(args.first().copied().unwrap_or(0)),
            SC_FAIL => SyscallRes::err(13),
            SC_FILL => {
                let _ = self.write_mem(args[0] + 4, &0x12345678u32.to_le_bytes());
                SyscallRes::ok(0)
            }
            SC_SLEEP => {
                thread::sleep(Duration::from_millis(200));
                SyscallRes::ok(7)
            }
            _ => SyscallRes::err(38),
        }
    }

    fn read_mem(&self, addr: u64, buf: &mut [u8]) -> Result<(), MemFault> {
        let mem = self.mem.lock().unwrap();
        let start = addr.checked_sub(DATA_OFFSET).ok_or(MemFault)? as usize;
        let end = start.checked_add(buf.len()).ok_or(MemFault)?;
        buf.copy_from_slice(mem.get(start..end).ok_or(MemFault)?);
        Ok(())
    }

    fn write_mem(&self, addr: u64, data: &[u8]) -> Result<(), MemFault> {
        let mut mem = self.mem.lock().unwrap();
        let start = addr.checked_sub(DATA_OFFSET).ok_or(MemFault)? as usize;
        let end = start.checked_add(data.len()).ok_or(MemFault)?;
        mem.get_mut(start..end)
            .ok_or(MemFault)?
            .copy_from_slice(data);
        Ok(())
    }

    fn cover_collect(&self, _tid: usize) -> Vec<u64> {
        self.cover_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default()
    }

    fn inject_fault(&self, _nth: u64) {
        self.fault_armed.store(true, Ordering::SeqCst);
    }

    fn fault_injected(&self) -> bool {
        self.fault_armed.swap(false, Ordering::SeqCst)
    }
}

#[derive(Debug, Default, Clone)]
struct CallRecord {
    index: u32,
    num: u32,
    errno: u32,
    fault: u32,
    signals: Vec<u32>,
    cover: Vec<u32>,
    comps: Vec<Vec<u32>>,
}

fn parse_output(words: &[u32]) -> (u32, Vec<CallRecord>) {
    let completed = words[0];
    let mut pos = 1;
    let mut records = Vec::new();
    for _ in 0..completed {
        let mut rec = CallRecord {
            index: words[pos],
            num: words[pos + 1],
            errno: words[pos + 2],
            fault: words[pos + 3],
            ..CallRecord::default()
        };
        let nsig = words[pos + 4] as usize;
        let ncover = words[pos + 5] as usize;
        let ncomps = words[pos + 6] as usize;
        pos += 7;
        rec.signals = words[pos..pos + nsig].to_vec();
        pos += nsig;
        rec.cover = words[pos..pos + ncover].to_vec();
        pos += ncover;
        for _ in 0..ncomps {
            let typ = words[pos];
            let operand_words = if typ as u64 & 6 == 6 { 4 } else { 2 };
            rec.comps.push(words[pos..pos + 1 + operand_words].to_vec());
            pos += 1 + operand_words;
        }
        records.push(rec);
    }
    (completed, records)
}

fn encode(p: &Prog) -> Vec<u8> {
    let t = target();
    let mut buf = vec![0u8; 1 << 16];
    let n = serialize(&t, p, 0, &mut buf).unwrap();
    buf.truncate(n);
    buf
}

fn run(env: &Arc<TestEnv>, p: &Prog, opt: &ExecOpt) -> Result<(u32, Vec<CallRecord>), ExecError> {
    let prog = encode(p);
    let mut exec = Executor::new(Arc::clone(env));
    let mut buf = vec![0u8; 1 << 20];
    let mut out = Output::new(&mut buf);
    exec.execute_one(&prog, &mut out, opt)?;
    Ok(parse_output(&out.words()))
}

/// Options driving the synchronous single-thread path.
fn inline_opt() -> ExecOpt {
    let mut opt = ExecOpt::new();
    opt.disable(FLAG_THREADED);
    opt
}

#[test]
fn copyin_populates_guest_memory() {
    init_logs();
    let mut b = ProgBuilder::new();
    let field = b.arg(ConstArg::new(Dir::In, 4, 0xaabbccdd));
    let blob = b.arg(DataArg::new(Dir::In, b"xyz".to_vec()));
    let group = b.arg(GroupArg::new(Dir::In, vec![field, blob]));
    let ptr = b.arg(PtrArg::new(Dir::In, 0, 0, Some(group)));
    b.call(SC_ECHO, vec![ptr]);
    let p = b.finish();

    let env = Arc::new(TestEnv::new());
    let (completed, records) = run(&env, &p, &inline_opt()).unwrap();

    assert_eq!(completed, 1);
    assert_eq!(records[0].index, 0);
    assert_eq!(records[0].num, SC_ECHO as u32);
    assert_eq!(records[0].errno, 0);
    assert_eq!(env.mem_at(DATA_OFFSET, 7), b"\xdd\xcc\xbb\xaaxyz");
    // The call saw the resolved pointer.
    assert_eq!(env.calls(), vec![(SC_ECHO as u64, vec![DATA_OFFSET])]);
}

#[test]
fn result_chaining_applies_transform() {
    let mut b = ProgBuilder::new();
    let ret = b.call(SC_ALLOC, vec![]);
    let mut res = ResultArg::new_ref(Dir::In, 8, ret);
    res.op_div = 2;
    res.op_add = 1;
    let fd = b.arg(res);
    b.call(SC_ECHO, vec![fd]);
    let p = b.finish();

    let env = Arc::new(TestEnv::new());
    let (completed, records) = run(&env, &p, &inline_opt()).unwrap();

    assert_eq!(completed, 2);
    assert_eq!(records[1].errno, 0);
    // alloc returned 100; echo got 100 / 2 + 1.
    assert_eq!(env.calls()[1], (SC_ECHO as u64, vec![51]));
}

#[test]
fn copyout_feeds_later_calls() {
    let mut b = ProgBuilder::new();
    let field0 = b.arg(ConstArg::new(Dir::In, 4, 0));
    let field1 = b.arg(ConstArg::new(Dir::InOut, 4, 0));
    let group = b.arg(GroupArg::new(Dir::In, vec![field0, field1]));
    let ptr = b.arg(PtrArg::new(Dir::In, 0, 0, Some(group)));
    b.call(SC_FILL, vec![ptr]);
    let observed = b.arg(ResultArg::new_ref(Dir::In, 4, field1));
    b.call(SC_ECHO, vec![observed]);
    let p = b.finish();

    let env = Arc::new(TestEnv::new());
    let (completed, _) = run(&env, &p, &inline_opt()).unwrap();

    assert_eq!(completed, 2);
    // fill wrote 0x12345678 into the struct; the copyout captured it.
    assert_eq!(env.calls()[1], (SC_ECHO as u64, vec![0x12345678]));
}

#[test]
fn failed_call_suppresses_its_copyouts() {
    let mut b = ProgBuilder::new();
    let ret = b.call(SC_FAIL, vec![]);
    let fd = b.arg(ResultArg::new_ref(Dir::In, 8, ret));
    b.call(SC_ECHO, vec![fd]);
    let p = b.finish();

    let env = Arc::new(TestEnv::new());
    let (completed, records) = run(&env, &p, &inline_opt()).unwrap();

    assert_eq!(completed, 2);
    assert_eq!(records[0].errno, 13);
    // The dependent resolved to the default value.
    assert_eq!(env.calls()[1], (SC_ECHO as u64, vec![u64::MAX]));
}

#[test]
fn checksum_computed_over_chunks() {
    let payload_val: u64 = 0x1122334455667788;
    let mut b = ProgBuilder::new();
    let payload = b.arg(ConstArg::new(Dir::In, 8, payload_val));
    // Checksum covers the payload bytes plus a pseudo-header constant.
    let csum = b.arg(CsumArg::new_inet(
        2,
        vec![
            CsumChunk::Data { arg: payload },
            CsumChunk::Const {
                val: 0x1100,
                size: 2,
            },
        ],
    ));
    let group = b.arg(GroupArg::new(Dir::In, vec![csum, payload]));
    let ptr = b.arg(PtrArg::new(Dir::In, 0, 0, Some(group)));
    b.call(SC_ECHO, vec![ptr]);
    let p = b.finish();

    let env = Arc::new(TestEnv::new());
    run(&env, &p, &inline_opt()).unwrap();

    let mut expect = CsumInet::new();
    expect.update(&payload_val.to_le_bytes());
    expect.update(&0x1100u64.to_le_bytes()[..2]);
    let stored = env.mem_at(DATA_OFFSET, 2);
    assert_eq!(stored, expect.digest().to_le_bytes());
}

#[test]
fn threaded_run_completes_every_call() {
    init_logs();
    let mut b = ProgBuilder::new();
    for i in 0..4 {
        let arg = b.arg(ConstArg::new(Dir::In, 8, i + 1));
        b.call(SC_ECHO, vec![arg]);
    }
    let p = b.finish();

    let env = Arc::new(TestEnv::new());
    let mut opt = ExecOpt::new();
    opt.enable(FLAG_THREADED);
    let (completed, records) = run(&env, &p, &opt).unwrap();

    assert_eq!(completed, 4);
    let mut indices: Vec<u32> = records.iter().map(|r| r.index).collect();
    indices.sort_unstable();
    assert_eq!(indices, [0, 1, 2, 3]);
}

#[test]
fn slow_call_is_left_running() {
    let mut b = ProgBuilder::new();
    b.call(SC_SLEEP, vec![]);
    let arg = b.arg(ConstArg::new(Dir::In, 8, 2));
    b.call(SC_ECHO, vec![arg]);
    let p = b.finish();

    let env = Arc::new(TestEnv::new());
    let mut opt = ExecOpt::new();
    opt.enable(FLAG_THREADED);
    let (completed, records) = run(&env, &p, &opt).unwrap();

    // The sleeping call blew its completion window; only echo reported.
    assert_eq!(completed, 1);
    assert_eq!(records[0].index, 1);
    assert_eq!(records[0].num, SC_ECHO as u32);
}

#[test]
fn collide_replay_emits_no_extra_records() {
    let mut b = ProgBuilder::new();
    for _ in 0..4 {
        b.call(SC_ALLOC, vec![]);
    }
    let p = b.finish();

    let env = Arc::new(TestEnv::new());
    let mut opt = ExecOpt::new();
    opt.enable(FLAG_THREADED);
    opt.enable(FLAG_COLLIDE);
    let (completed, records) = run(&env, &p, &opt).unwrap();

    assert_eq!(completed, 4);
    assert_eq!(records.len(), 4);
    // The replay re-ran the calls without reporting them.
    assert!(env.calls().len() > 4);
}

#[test]
fn collide_and_fault_injection_conflict() {
    let mut b = ProgBuilder::new();
    b.call(SC_ALLOC, vec![]);
    let p = b.finish();

    let env = Arc::new(TestEnv::new());
    let mut opt = ExecOpt::new();
    opt.enable(FLAG_THREADED);
    opt.enable(FLAG_COLLIDE);
    opt.enable(FLAG_INJECT_FAULT);
    assert!(matches!(
        run(&env, &p, &opt),
        Err(ExecError::CollideFaultConflict)
    ));
}

#[test]
fn fault_injection_reported_for_target_call() {
    let mut b = ProgBuilder::new();
    b.call(SC_ALLOC, vec![]);
    b.call(SC_ALLOC, vec![]);
    let p = b.finish();

    let env = Arc::new(TestEnv::new());
    let mut opt = inline_opt();
    opt.enable(FLAG_INJECT_FAULT);
    opt.fault_call = 1;
    let (completed, records) = run(&env, &p, &opt).unwrap();

    assert_eq!(completed, 2);
    assert_eq!(records[0].fault, 0);
    assert_eq!(records[1].fault, 1);
}

#[test]
fn repeated_signals_are_deduped_across_calls() {
    let mut b = ProgBuilder::new();
    b.call(SC_ALLOC, vec![]);
    b.call(SC_ALLOC, vec![]);
    let p = b.finish();

    let env = Arc::new(TestEnv::with_cover(vec![
        vec![0x100, 0x200],
        vec![0x100, 0x200],
    ]));
    let (_, records) = run(&env, &p, &inline_opt()).unwrap();

    assert_eq!(records[0].signals.len(), 2);
    assert!(records[1].signals.is_empty());
}

#[test]
fn comparison_records_sorted_and_filtered() {
    let mut b = ProgBuilder::new();
    b.call(SC_ALLOC, vec![]);
    let p = b.finish();

    // Three records: a duplicate pair (different PCs), one zero compare.
    let words = vec![
        4, 0x30, 0x40, 0x1000, // size4 compare
        4, 0x30, 0x40, 0x2000, // same operands, other pc
        6, 0, 0, 0x3000, // both-zero, ignored
    ];
    let env = Arc::new(TestEnv::with_cover(vec![words]));
    let mut opt = inline_opt();
    opt.enable(FLAG_COLLECT_COMPS);
    let (_, records) = run(&env, &p, &opt).unwrap();

    assert_eq!(records[0].comps, vec![vec![4, 0x30, 0x40]]);
}

#[test]
fn oversized_prog_rejected_by_both_sides() {
    let mut b = ProgBuilder::new();
    let blob = b.arg(DataArg::new(Dir::In, vec![0x41; EXEC_BUFFER_SIZE + 8]));
    let ptr = b.arg(PtrArg::new(Dir::In, 0, 0, Some(blob)));
    b.call(SC_ECHO, vec![ptr]);
    let p = b.finish();

    let t = target();
    let mut buf = vec![0u8; EXEC_BUFFER_SIZE];
    assert!(matches!(
        serialize(&t, &p, 0, &mut buf),
        Err(SerializeError::BufferTooSmall { .. })
    ));

    let env = Arc::new(TestEnv::new());
    let mut exec = Executor::new(Arc::clone(&env));
    let oversized = vec![0u8; EXEC_BUFFER_SIZE + 8];
    let mut out_buf = vec![0u8; 4096];
    let mut out = Output::new(&mut out_buf);
    assert!(matches!(
        exec.execute_one(&oversized, &mut out, &ExecOpt::new()),
        Err(ExecError::ProgTooLarge { .. })
    ));
}

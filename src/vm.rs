use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread::JoinHandle;

use num_bigint::{BigInt, BigUint};
use num_traits::{FromPrimitive, One, ToPrimitive, Zero};
use serde::{Deserialize, Serialize};

use crate::checkpoint::{CheckpointError, CheckpointSink, Snapshot};
use crate::chunk::{self, Op};
use crate::debugger::Debugger;
use crate::host::{HostGateway, LocalGateway, Service};
use crate::memory::Memory;
use crate::ntt;
use crate::profiler::Profiler;

/// Shift amounts above this are treated as corrupt rather than honored;
/// a 2^20-bit operand is already far beyond any legitimate program.
const MAX_SHIFT: i64 = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmErrorKind {
    ChunkCorrupt(String),
    StackUnderflow,
    DivisionByZero,
    InvalidShift(BigInt),
    MemoryOutOfRange(BigInt),
    HostGatewayFailure {
        service: &'static str,
        message: String,
    },
    InputExhausted,
    IntegrityFailure,
    ProgramBounds,
    ThreadUnavailable,
}

impl std::fmt::Display for VmErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmErrorKind::ChunkCorrupt(message) => write!(f, "chunk corrupt: {message}"),
            VmErrorKind::StackUnderflow => write!(f, "stack underflow"),
            VmErrorKind::DivisionByZero => write!(f, "division by zero"),
            VmErrorKind::InvalidShift(amount) => write!(f, "invalid shift amount {amount}"),
            VmErrorKind::MemoryOutOfRange(addr) => {
                write!(f, "memory access out of range: {addr}")
            }
            VmErrorKind::HostGatewayFailure { service, message } => {
                write!(f, "host gateway failure ({service}): {message}")
            }
            VmErrorKind::InputExhausted => write!(f, "input queue exhausted"),
            VmErrorKind::IntegrityFailure => write!(f, "ntt roundtrip mismatch"),
            VmErrorKind::ProgramBounds => write!(f, "instruction index out of program bounds"),
            VmErrorKind::ThreadUnavailable => write!(f, "no joinable thread"),
        }
    }
}

/// Fatal engine error: the kind plus the chunk index that raised it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmError {
    pub kind: VmErrorKind,
    pub ip: usize,
}

impl VmError {
    fn new(kind: VmErrorKind, ip: usize) -> Self {
        Self { kind, ip }
    }
}

impl std::fmt::Display for VmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "chunk {}: {}", self.ip, self.kind)
    }
}

impl std::error::Error for VmError {}

pub type VmResult<T> = Result<T, VmError>;

#[derive(Debug, PartialEq, Eq)]
pub enum VmStatus {
    Halted,
    Yielded,
}

/// One entry of the tagged output queue. PRINT and OUTPUT differ only in
/// their trace classification; TRACE peeks without popping; BRK is a bare
/// marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    Print(BigInt),
    Output(BigInt),
    Trace(BigInt),
    Brk,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub call_site: usize,
    pub return_ip: usize,
}

/// Blocking input fallback used when the queue is empty. Returning `None`
/// means the source is exhausted and INPUT becomes fatal.
pub trait InputSource {
    fn read(&mut self) -> Option<BigInt>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoStats {
    pub hits: u64,
    pub misses: u64,
}

/// Immutable chunk sequence. Subordinate VMs (BLOCK bodies, thread bodies)
/// share the backing storage through `Arc` and see a sub-slice.
#[derive(Clone, Debug)]
pub struct Program {
    chunks: Arc<Vec<BigUint>>,
    start: usize,
    len: usize,
}

impl Program {
    pub fn new(chunks: Vec<BigUint>) -> Self {
        let len = chunks.len();
        Self {
            chunks: Arc::new(chunks),
            start: 0,
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn view(&self) -> &[BigUint] {
        &self.chunks[self.start..self.start + self.len]
    }

    pub fn chunk(&self, idx: usize) -> Option<&BigUint> {
        self.view().get(idx)
    }

    fn slice(&self, start: usize, len: usize) -> Option<Program> {
        let end = start.checked_add(len)?;
        if end > self.len {
            return None;
        }
        Some(Program {
            chunks: Arc::clone(&self.chunks),
            start: self.start + start,
            len,
        })
    }

    /// blake3 over the decimal chunk list; checkpoint snapshots carry this
    /// so a reload cannot be applied to a different program.
    pub fn identity_hash(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for chunk in self.view() {
            hasher.update(chunk.to_string().as_bytes());
            hasher.update(b"\n");
        }
        hasher.finalize().to_hex().to_string()
    }
}

type ThreadOutcome = Result<Vec<OutputEvent>, VmError>;

pub struct Vm {
    program: Program,
    ip: usize,
    stack: Vec<BigInt>,
    memory: Memory,
    frames: Vec<Frame>,
    input: VecDeque<BigInt>,
    output: Vec<OutputEvent>,
    input_source: Option<Box<dyn InputSource>>,
    gateway: Box<dyn HostGateway>,
    checkpoint_sink: Option<Box<dyn CheckpointSink>>,
    decode_memo: HashMap<BigUint, (Op, BigInt)>,
    memo_stats: MemoStats,
    pending_threads: VecDeque<JoinHandle<ThreadOutcome>>,
    step_limit: Option<u64>,
    steps: u64,
    halted: bool,
}

impl Vm {
    pub fn new(program: Program) -> Self {
        Self {
            program,
            ip: 0,
            stack: Vec::new(),
            memory: Memory::new(),
            frames: Vec::new(),
            input: VecDeque::new(),
            output: Vec::new(),
            input_source: None,
            gateway: Box::new(LocalGateway::new()),
            checkpoint_sink: None,
            decode_memo: HashMap::new(),
            memo_stats: MemoStats::default(),
            pending_threads: VecDeque::new(),
            step_limit: None,
            steps: 0,
            halted: false,
        }
    }

    pub fn set_gateway(&mut self, gateway: Box<dyn HostGateway>) {
        self.gateway = gateway;
    }

    pub fn set_input_source(&mut self, source: Box<dyn InputSource>) {
        self.input_source = Some(source);
    }

    pub fn set_checkpoint_sink(&mut self, sink: Box<dyn CheckpointSink>) {
        self.checkpoint_sink = Some(sink);
    }

    /// Yield (instead of halting) once this many instructions have executed.
    /// The count is cumulative across `resume` calls.
    pub fn set_step_limit(&mut self, limit: Option<u64>) {
        self.step_limit = limit;
    }

    pub fn push_input(&mut self, value: BigInt) {
        self.input.push_back(value);
    }

    pub fn run(&mut self) -> VmResult<VmStatus> {
        self.run_internal(None, None)
    }

    pub fn resume(&mut self) -> VmResult<VmStatus> {
        self.run()
    }

    pub fn run_with_debugger(&mut self, debugger: &mut Debugger) -> VmResult<VmStatus> {
        self.run_internal(Some(debugger), None)
    }

    pub fn run_with_profiler(&mut self, profiler: &mut Profiler) -> VmResult<VmStatus> {
        self.run_internal(None, Some(profiler))
    }

    pub fn stack(&self) -> &[BigInt] {
        &self.stack
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn ip(&self) -> usize {
        self.ip
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn output(&self) -> &[OutputEvent] {
        &self.output
    }

    pub fn take_output(&mut self) -> Vec<OutputEvent> {
        std::mem::take(&mut self.output)
    }

    pub fn memo_stats(&self) -> MemoStats {
        self.memo_stats
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            program_hash: self.program.identity_hash(),
            ip: self.ip,
            stack: self.stack.clone(),
            memory: self.memory.image(),
            frames: self.frames.clone(),
        }
    }

    /// Restore state captured by a CHECKPOINT of the same program.
    pub fn restore_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), CheckpointError> {
        let expected = self.program.identity_hash();
        if snapshot.program_hash != expected {
            return Err(CheckpointError::ProgramMismatch {
                expected,
                found: snapshot.program_hash.clone(),
            });
        }
        self.ip = snapshot.ip;
        self.stack = snapshot.stack.clone();
        self.memory = Memory::from_image(&snapshot.memory);
        self.frames = snapshot.frames.clone();
        self.halted = false;
        Ok(())
    }

    fn run_internal(
        &mut self,
        mut debugger: Option<&mut Debugger>,
        mut profiler: Option<&mut Profiler>,
    ) -> VmResult<VmStatus> {
        while !self.halted && self.ip < self.program.len() {
            if let Some(limit) = self.step_limit {
                if self.steps >= limit {
                    return Ok(VmStatus::Yielded);
                }
            }
            let ip = self.ip;
            let (op, operand) = self.fetch(ip).map_err(|err| {
                tracing::debug!(ip, error = %err, "fetch failed");
                err
            })?;

            if let Some(active) = debugger.as_deref_mut() {
                active.on_instruction(self, ip, op, &operand);
            }

            self.steps += 1;
            self.execute(op, &operand, ip, debugger.as_deref_mut())?;

            if let Some(active) = debugger.as_deref_mut() {
                active.after_instruction(self);
            }
            if let Some(active) = profiler.as_deref_mut() {
                active.record(self, ip, op);
            }
        }
        Ok(VmStatus::Halted)
    }

    fn fetch(&mut self, idx: usize) -> VmResult<(Op, BigInt)> {
        let chunk = self
            .program
            .chunk(idx)
            .cloned()
            .ok_or_else(|| VmError::new(VmErrorKind::ProgramBounds, idx))?;
        if let Some((op, operand)) = self.decode_memo.get(&chunk) {
            self.memo_stats.hits += 1;
            return Ok((*op, operand.clone()));
        }
        match chunk::decode(&chunk) {
            Ok((op, operand)) => {
                self.memo_stats.misses += 1;
                self.decode_memo.insert(chunk, (op, operand.clone()));
                Ok((op, operand))
            }
            Err(err) => Err(VmError::new(VmErrorKind::ChunkCorrupt(err.to_string()), idx)),
        }
    }

    fn execute(
        &mut self,
        op: Op,
        operand: &BigInt,
        ip: usize,
        debugger: Option<&mut Debugger>,
    ) -> VmResult<()> {
        self.ip = ip + 1;
        match op {
            Op::Nop => {}
            Op::Halt => self.halted = true,
            Op::Push => self.stack.push(operand.clone()),
            Op::Add => self.binary_op(ip, |a, b| Ok(a + b))?,
            Op::Sub => self.binary_op(ip, |a, b| Ok(a - b))?,
            Op::Mul => self.binary_op(ip, |a, b| Ok(a * b))?,
            Op::Div => self.binary_op(ip, |a, b| {
                if b.is_zero() {
                    return Err(VmErrorKind::DivisionByZero);
                }
                Ok(a / b)
            })?,
            Op::Mod => self.binary_op(ip, |a, b| {
                if b.is_zero() {
                    return Err(VmErrorKind::DivisionByZero);
                }
                Ok(a % b)
            })?,
            Op::Neg => {
                let value = self.pop_value(ip)?;
                self.stack.push(-value);
            }
            Op::Fmul => self.binary_float_op(ip, |a, b| Ok(a * b))?,
            Op::Fdiv => self.binary_float_op(ip, |a, b| {
                if b == 0.0 {
                    return Err(VmErrorKind::DivisionByZero);
                }
                Ok(a / b)
            })?,
            Op::F2i => {
                let bits = float_bits(&self.pop_value(ip)?);
                let value = f64::from_bits(bits);
                self.stack.push(float_to_int(value));
            }
            Op::I2f => {
                let value = self.pop_value(ip)?;
                let float = value.to_f64().unwrap_or(f64::INFINITY);
                self.stack.push(BigInt::from(float.to_bits()));
            }
            Op::And => self.binary_op(ip, |a, b| Ok(a & b))?,
            Op::Or => self.binary_op(ip, |a, b| Ok(a | b))?,
            Op::Xor => self.binary_op(ip, |a, b| Ok(a ^ b))?,
            Op::Shl => {
                let amount = self.pop_shift_amount(ip)?;
                let value = self.pop_value(ip)?;
                self.stack.push(value << amount);
            }
            Op::Shr => {
                let amount = self.pop_shift_amount(ip)?;
                let value = self.pop_value(ip)?;
                self.stack.push(value >> amount);
            }
            Op::Load => {
                let addr = self.operand_addr(operand, ip)?;
                self.stack.push(self.memory.load(addr));
            }
            Op::Store => {
                let addr = self.operand_addr(operand, ip)?;
                let value = self.pop_value(ip)?;
                self.memory.store(addr, value);
            }
            Op::Alloc => {
                let size = operand.to_usize().ok_or_else(|| {
                    VmError::new(VmErrorKind::MemoryOutOfRange(operand.clone()), ip)
                })?;
                let base = self.memory.alloc(size);
                self.stack.push(BigInt::from(base));
            }
            Op::Free => {
                let base = if operand.is_zero() {
                    let top = self.pop_value(ip)?;
                    top.to_i64().ok_or_else(|| {
                        VmError::new(VmErrorKind::MemoryOutOfRange(top.clone()), ip)
                    })?
                } else {
                    self.operand_addr(operand, ip)?
                };
                if !self.memory.free(base) {
                    return Err(VmError::new(
                        VmErrorKind::MemoryOutOfRange(BigInt::from(base)),
                        ip,
                    ));
                }
            }
            Op::Jmp => self.branch(operand, ip)?,
            Op::Jz => {
                let value = self.pop_value(ip)?;
                if value.is_zero() {
                    self.branch(operand, ip)?;
                }
            }
            Op::Jnz => {
                let value = self.pop_value(ip)?;
                if !value.is_zero() {
                    self.branch(operand, ip)?;
                }
            }
            Op::Call => {
                self.frames.push(Frame {
                    call_site: ip,
                    return_ip: ip + 1,
                });
                self.branch(operand, ip)?;
            }
            Op::Ret => match self.frames.pop() {
                Some(frame) => self.ip = frame.return_ip,
                None => self.halted = true,
            },
            Op::Print => {
                let value = self.pop_value(ip)?;
                self.output.push(OutputEvent::Print(value));
            }
            Op::Output => {
                let value = self.pop_value(ip)?;
                self.output.push(OutputEvent::Output(value));
            }
            Op::Input => {
                let value = match self.input.pop_front() {
                    Some(value) => value,
                    None => match self.input_source.as_mut().and_then(|source| source.read()) {
                        Some(value) => value,
                        None => return Err(VmError::new(VmErrorKind::InputExhausted, ip)),
                    },
                };
                self.stack.push(value);
            }
            Op::NetSend => self.gateway_call(Service::NetSend, ip)?,
            Op::NetRecv => self.gateway_call(Service::NetRecv, ip)?,
            Op::Hash => self.gateway_call(Service::Hash, ip)?,
            Op::Sign => self.gateway_call(Service::Sign, ip)?,
            Op::Verify => self.gateway_call(Service::Verify, ip)?,
            Op::Rng => self.gateway_call(Service::Rng, ip)?,
            Op::Syscall => self.gateway_call(Service::Syscall, ip)?,
            Op::Int => self.gateway_call(Service::Interrupt, ip)?,
            Op::Trace => {
                let value = self.peek_value(ip)?.clone();
                tracing::trace!(ip, value = %value, "trace");
                self.output.push(OutputEvent::Trace(value));
            }
            Op::Brk => {
                self.output.push(OutputEvent::Brk);
                if let Some(active) = debugger {
                    active.on_brk(self);
                }
            }
            Op::Checkpoint => {
                if let Some(mut sink) = self.checkpoint_sink.take() {
                    let snapshot = self.snapshot();
                    let result = sink.save(&snapshot);
                    self.checkpoint_sink = Some(sink);
                    result.map_err(|err| {
                        VmError::new(
                            VmErrorKind::HostGatewayFailure {
                                service: "checkpoint",
                                message: err.to_string(),
                            },
                            ip,
                        )
                    })?;
                }
            }
            Op::Block => {
                let len = operand
                    .to_usize()
                    .ok_or_else(|| VmError::new(VmErrorKind::ProgramBounds, ip))?;
                let body = self
                    .program
                    .slice(ip + 1, len)
                    .ok_or_else(|| VmError::new(VmErrorKind::ProgramBounds, ip))?;
                tracing::trace!(ip, len, "entering block");
                let mut child = Vm::new(body);
                child.stack = self.stack.clone();
                child.run()?;
                self.output.append(&mut child.output);
                self.ip = ip + 1 + len;
            }
            Op::Ntt => {
                let len = operand
                    .to_usize()
                    .ok_or_else(|| VmError::new(VmErrorKind::ProgramBounds, ip))?;
                let view = self.program.view();
                let body = view
                    .get(ip + 1..ip + 1 + len)
                    .ok_or_else(|| VmError::new(VmErrorKind::ProgramBounds, ip))?;
                if !ntt::roundtrip_is_identity(body) {
                    return Err(VmError::new(VmErrorKind::IntegrityFailure, ip));
                }
            }
            Op::ThreadStart => {
                let end = self.find_halt(ip + 1)?;
                let body = self
                    .program
                    .slice(ip + 1, end - ip)
                    .ok_or_else(|| VmError::new(VmErrorKind::ProgramBounds, ip))?;
                let stack = self.stack.clone();
                tracing::debug!(ip, body_len = end - ip, "spawning thread");
                let handle = std::thread::spawn(move || {
                    let mut child = Vm::new(body);
                    child.stack = stack;
                    match child.run() {
                        Ok(_) => Ok(child.output),
                        Err(err) => Err(err),
                    }
                });
                self.pending_threads.push_back(handle);
                self.ip = end + 1;
            }
            Op::ThreadJoin => {
                let handle = self
                    .pending_threads
                    .pop_front()
                    .ok_or_else(|| VmError::new(VmErrorKind::ThreadUnavailable, ip))?;
                tracing::debug!(ip, "joining thread");
                match handle.join() {
                    Ok(Ok(mut output)) => self.output.append(&mut output),
                    Ok(Err(child_err)) => return Err(child_err),
                    Err(_) => {
                        return Err(VmError::new(
                            VmErrorKind::HostGatewayFailure {
                                service: "thread",
                                message: "child thread panicked".to_string(),
                            },
                            ip,
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    /// Body of a THREAD_START: everything up to the first chunk that decodes
    /// to HALT, inclusive. Returns the HALT index.
    fn find_halt(&mut self, from: usize) -> VmResult<usize> {
        for idx in from..self.program.len() {
            let (op, _) = self.fetch(idx)?;
            if op == Op::Halt {
                return Ok(idx);
            }
        }
        Err(VmError::new(VmErrorKind::ProgramBounds, from))
    }

    fn branch(&mut self, offset: &BigInt, ip: usize) -> VmResult<()> {
        let delta = offset
            .to_i64()
            .ok_or_else(|| VmError::new(VmErrorKind::ProgramBounds, ip))?;
        let target = ip as i128 + 1 + i128::from(delta);
        if target < 0 || target > self.program.len() as i128 {
            return Err(VmError::new(VmErrorKind::ProgramBounds, ip));
        }
        self.ip = target as usize;
        Ok(())
    }

    fn gateway_call(&mut self, service: Service, ip: usize) -> VmResult<()> {
        let mut stack = std::mem::take(&mut self.stack);
        let result = self.gateway.call(service, &mut stack);
        self.stack = stack;
        result.map_err(|err| {
            VmError::new(
                VmErrorKind::HostGatewayFailure {
                    service: service.name(),
                    message: err.message,
                },
                ip,
            )
        })
    }

    fn pop_value(&mut self, ip: usize) -> VmResult<BigInt> {
        self.stack
            .pop()
            .ok_or_else(|| VmError::new(VmErrorKind::StackUnderflow, ip))
    }

    fn peek_value(&self, ip: usize) -> VmResult<&BigInt> {
        self.stack
            .last()
            .ok_or_else(|| VmError::new(VmErrorKind::StackUnderflow, ip))
    }

    fn pop_shift_amount(&mut self, ip: usize) -> VmResult<usize> {
        let amount = self.pop_value(ip)?;
        match amount.to_i64() {
            Some(value) if (0..=MAX_SHIFT).contains(&value) => Ok(value as usize),
            _ => Err(VmError::new(VmErrorKind::InvalidShift(amount), ip)),
        }
    }

    fn operand_addr(&self, operand: &BigInt, ip: usize) -> VmResult<i64> {
        operand
            .to_i64()
            .ok_or_else(|| VmError::new(VmErrorKind::MemoryOutOfRange(operand.clone()), ip))
    }

    /// Pops `b` then `a`, pushes `f(a, b)`.
    fn binary_op(
        &mut self,
        ip: usize,
        f: impl FnOnce(&BigInt, &BigInt) -> Result<BigInt, VmErrorKind>,
    ) -> VmResult<()> {
        let b = self.pop_value(ip)?;
        let a = self.pop_value(ip)?;
        let result = f(&a, &b).map_err(|kind| VmError::new(kind, ip))?;
        self.stack.push(result);
        Ok(())
    }

    /// Same as `binary_op`, but the operands are bit-punned f64 values and
    /// the result is pushed as its bit pattern.
    fn binary_float_op(
        &mut self,
        ip: usize,
        f: impl FnOnce(f64, f64) -> Result<f64, VmErrorKind>,
    ) -> VmResult<()> {
        let b = f64::from_bits(float_bits(&self.pop_value(ip)?));
        let a = f64::from_bits(float_bits(&self.pop_value(ip)?));
        let result = f(a, b).map_err(|kind| VmError::new(kind, ip))?;
        self.stack.push(BigInt::from(result.to_bits()));
        Ok(())
    }
}

/// Low 64 bits of the two's-complement value.
fn float_bits(value: &BigInt) -> u64 {
    let mask = (BigInt::one() << 64u32) - 1;
    (value & &mask).to_u64().unwrap_or(0)
}

fn float_to_int(value: f64) -> BigInt {
    if !value.is_finite() {
        return BigInt::zero();
    }
    BigInt::from_f64(value.trunc()).unwrap_or_else(BigInt::zero)
}

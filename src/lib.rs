pub mod assembler;
pub mod checkpoint;
pub mod chunk;
pub mod debugger;
pub mod host;
pub mod logging;
pub mod memory;
pub mod ntt;
pub mod primes;
pub mod profiler;
pub mod vm;
pub mod wire;

pub use assembler::{assemble, AsmErrorKind, AssemblerError};
pub use checkpoint::{load_snapshot, CheckpointError, CheckpointSink, FileBackend, Snapshot};
pub use chunk::{decode, encode, encode_op, CodecError, Op, ALL_OPS};
pub use debugger::{Debugger, StepMode};
pub use host::{HostError, HostGateway, LocalGateway, Service};
pub use memory::{Memory, MemoryImage, HEAP_BASE};
pub use profiler::Profiler;
pub use vm::{
    Frame, InputSource, MemoStats, OutputEvent, Program, Vm, VmError, VmErrorKind, VmResult,
    VmStatus,
};
pub use wire::{
    looks_like_chunks, parse_chunks, read_chunks_path, write_chunks, write_chunks_path, WireError,
};

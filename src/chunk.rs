use num_bigint::{BigInt, BigUint, Sign};
use num_traits::{One, ToPrimitive, Zero};

use crate::primes;

/// Exponent slots of the chunk integer. A chunk is
/// `2^opcode * 3^|operand| * 5^neg * 7^checksum`; decoding divides out
/// exactly these four primes and nothing else.
const OPCODE_SLOT: u32 = 2;
const OPERAND_SLOT: u32 = 3;
const NEG_SLOT: u32 = 5;
const CHECKSUM_SLOT: u32 = 7;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Op {
    Nop = 1,
    Halt = 2,
    Push = 3,
    Add = 4,
    Sub = 5,
    Mul = 6,
    Div = 7,
    Mod = 8,
    Neg = 9,
    Fmul = 10,
    Fdiv = 11,
    F2i = 12,
    I2f = 13,
    And = 14,
    Or = 15,
    Xor = 16,
    Shl = 17,
    Shr = 18,
    Load = 19,
    Store = 20,
    Alloc = 21,
    Free = 22,
    Jmp = 23,
    Jz = 24,
    Jnz = 25,
    Call = 26,
    Ret = 27,
    Print = 28,
    Output = 29,
    Input = 30,
    NetSend = 31,
    NetRecv = 32,
    Hash = 33,
    Sign = 34,
    Verify = 35,
    Rng = 36,
    Syscall = 37,
    Int = 38,
    Trace = 39,
    Brk = 40,
    Checkpoint = 41,
    Block = 42,
    Ntt = 43,
    ThreadStart = 44,
    ThreadJoin = 45,
}

pub const ALL_OPS: [Op; 45] = [
    Op::Nop,
    Op::Halt,
    Op::Push,
    Op::Add,
    Op::Sub,
    Op::Mul,
    Op::Div,
    Op::Mod,
    Op::Neg,
    Op::Fmul,
    Op::Fdiv,
    Op::F2i,
    Op::I2f,
    Op::And,
    Op::Or,
    Op::Xor,
    Op::Shl,
    Op::Shr,
    Op::Load,
    Op::Store,
    Op::Alloc,
    Op::Free,
    Op::Jmp,
    Op::Jz,
    Op::Jnz,
    Op::Call,
    Op::Ret,
    Op::Print,
    Op::Output,
    Op::Input,
    Op::NetSend,
    Op::NetRecv,
    Op::Hash,
    Op::Sign,
    Op::Verify,
    Op::Rng,
    Op::Syscall,
    Op::Int,
    Op::Trace,
    Op::Brk,
    Op::Checkpoint,
    Op::Block,
    Op::Ntt,
    Op::ThreadStart,
    Op::ThreadJoin,
];

impl Op {
    pub fn id(self) -> u16 {
        self as u16
    }

    pub fn from_id(id: u16) -> Option<Self> {
        ALL_OPS.get(id.checked_sub(1)? as usize).copied()
    }

    /// Whether an immediate operand follows the opcode.
    pub fn arity(self) -> u8 {
        match self {
            Op::Push
            | Op::Load
            | Op::Store
            | Op::Alloc
            | Op::Free
            | Op::Jmp
            | Op::Jz
            | Op::Jnz
            | Op::Call
            | Op::Block
            | Op::Ntt => 1,
            _ => 0,
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Op::Nop => "NOP",
            Op::Halt => "HALT",
            Op::Push => "PUSH",
            Op::Add => "ADD",
            Op::Sub => "SUB",
            Op::Mul => "MUL",
            Op::Div => "DIV",
            Op::Mod => "MOD",
            Op::Neg => "NEG",
            Op::Fmul => "FMUL",
            Op::Fdiv => "FDIV",
            Op::F2i => "F2I",
            Op::I2f => "I2F",
            Op::And => "AND",
            Op::Or => "OR",
            Op::Xor => "XOR",
            Op::Shl => "SHL",
            Op::Shr => "SHR",
            Op::Load => "LOAD",
            Op::Store => "STORE",
            Op::Alloc => "ALLOC",
            Op::Free => "FREE",
            Op::Jmp => "JMP",
            Op::Jz => "JZ",
            Op::Jnz => "JNZ",
            Op::Call => "CALL",
            Op::Ret => "RET",
            Op::Print => "PRINT",
            Op::Output => "OUTPUT",
            Op::Input => "INPUT",
            Op::NetSend => "NET_SEND",
            Op::NetRecv => "NET_RECV",
            Op::Hash => "HASH",
            Op::Sign => "SIGN",
            Op::Verify => "VERIFY",
            Op::Rng => "RNG",
            Op::Syscall => "SYSCALL",
            Op::Int => "INT",
            Op::Trace => "TRACE",
            Op::Brk => "BRK",
            Op::Checkpoint => "CHECKPOINT",
            Op::Block => "BLOCK",
            Op::Ntt => "NTT",
            Op::ThreadStart => "THREAD_START",
            Op::ThreadJoin => "THREAD_JOIN",
        }
    }

    /// Case-insensitive mnemonic lookup.
    pub fn parse_mnemonic(token: &str) -> Option<Self> {
        let upper = token.to_ascii_uppercase();
        ALL_OPS.iter().copied().find(|op| op.mnemonic() == upper)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    OperandTooLarge,
    ZeroChunk,
    ForeignFactor,
    NegFlagInvalid(u64),
    UnknownOpcode(u64),
    ChecksumMismatch { expected: u8, found: u64 },
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::OperandTooLarge => write!(f, "operand magnitude exceeds encodable range"),
            CodecError::ZeroChunk => write!(f, "chunk is zero"),
            CodecError::ForeignFactor => {
                write!(f, "chunk carries a prime factor outside the slot primes")
            }
            CodecError::NegFlagInvalid(exp) => {
                write!(f, "negative-flag exponent {exp} is not 0 or 1")
            }
            CodecError::UnknownOpcode(id) => write!(f, "unknown opcode id {id}"),
            CodecError::ChecksumMismatch { expected, found } => {
                write!(f, "checksum mismatch: expected {expected}, found {found}")
            }
        }
    }
}

impl std::error::Error for CodecError {}

/// Encode one instruction as a single chunk integer.
///
/// Arity-0 opcodes must pass operand 0. Operand 0 always encodes with
/// NEG_FLAG 0, so `-0` and `+0` produce the same chunk.
pub fn encode(op: Op, operand: &BigInt) -> Result<BigUint, CodecError> {
    let magnitude = operand
        .magnitude()
        .to_u32()
        .ok_or(CodecError::OperandTooLarge)?;
    let neg = u32::from(operand.sign() == Sign::Minus);
    let chk = primes::checksum(op.id(), operand);

    let mut chunk = BigUint::from(OPCODE_SLOT).pow(op.id() as u32);
    if magnitude > 0 {
        chunk *= BigUint::from(OPERAND_SLOT).pow(magnitude);
    }
    if neg == 1 {
        chunk *= BigUint::from(NEG_SLOT);
    }
    if chk > 0 {
        chunk *= BigUint::from(CHECKSUM_SLOT).pow(chk as u32);
    }
    Ok(chunk)
}

/// Arity-0 convenience encoder.
pub fn encode_op(op: Op) -> BigUint {
    encode(op, &BigInt::zero()).expect("zero operand always encodes")
}

/// Decode and verify one chunk. Divides out the four slot primes, requires
/// the residue to be exactly 1, and recomputes the checksum.
pub fn decode(chunk: &BigUint) -> Result<(Op, BigInt), CodecError> {
    if chunk.is_zero() {
        return Err(CodecError::ZeroChunk);
    }
    let mut rest = chunk.clone();
    let op_exp = strip_factor(&mut rest, OPCODE_SLOT);
    let arg_exp = strip_factor(&mut rest, OPERAND_SLOT);
    let neg_exp = strip_factor(&mut rest, NEG_SLOT);
    let chk_exp = strip_factor(&mut rest, CHECKSUM_SLOT);
    if !rest.is_one() {
        return Err(CodecError::ForeignFactor);
    }
    if neg_exp > 1 {
        return Err(CodecError::NegFlagInvalid(neg_exp));
    }

    let id = u16::try_from(op_exp).map_err(|_| CodecError::UnknownOpcode(op_exp))?;
    let op = Op::from_id(id).ok_or(CodecError::UnknownOpcode(op_exp))?;

    // A signed-zero chunk decodes the same as +0.
    let mut operand = BigInt::from(arg_exp);
    if neg_exp == 1 && arg_exp != 0 {
        operand = -operand;
    }

    let expected = primes::checksum(op.id(), &operand);
    if chk_exp != expected as u64 {
        return Err(CodecError::ChecksumMismatch {
            expected,
            found: chk_exp,
        });
    }
    Ok((op, operand))
}

fn strip_factor(n: &mut BigUint, p: u32) -> u64 {
    let p = BigUint::from(p);
    let mut count = 0u64;
    while (&*n % &p).is_zero() {
        *n /= &p;
        count += 1;
    }
    count
}

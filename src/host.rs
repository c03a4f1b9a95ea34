use std::collections::VecDeque;

use num_bigint::{BigInt, BigUint, Sign};
use num_traits::Zero;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

/// Services the engine forwards verbatim. Each call receives the whole
/// evaluation stack and may rewrite it; the exact operand contract is owned
/// by the gateway implementation, not the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Service {
    Hash,
    Sign,
    Verify,
    Rng,
    Syscall,
    Interrupt,
    NetSend,
    NetRecv,
}

impl Service {
    pub fn name(self) -> &'static str {
        match self {
            Service::Hash => "hash",
            Service::Sign => "sign",
            Service::Verify => "verify",
            Service::Rng => "rng",
            Service::Syscall => "syscall",
            Service::Interrupt => "interrupt",
            Service::NetSend => "net_send",
            Service::NetRecv => "net_recv",
        }
    }
}

#[derive(Debug)]
pub struct HostError {
    pub message: String,
}

impl HostError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for HostError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for HostError {}

/// Host-provided service surface. The engine treats every call as fallible
/// and turns failures into fatal VM errors.
pub trait HostGateway {
    fn call(&mut self, service: Service, stack: &mut Vec<BigInt>) -> Result<(), HostError>;
}

/// In-process default gateway.
///
/// Stack contracts (top listed first):
/// - hash: pops `v`, pushes `blake3(v)` truncated to 128 bits.
/// - sign: pops `key`, `message`; pushes a keyed tag.
/// - verify: pops `tag`, `key`, `message`; pushes 1 or 0.
/// - rng: pushes a uniform 64-bit value.
/// - syscall / interrupt: pop a code, push 0.
/// - net_send: pops into the outbox; net_recv: pushes from the inbox, or 0
///   when the inbox is empty.
pub struct LocalGateway {
    inbox: VecDeque<BigInt>,
    outbox: VecDeque<BigInt>,
    rng: StdRng,
}

impl Default for LocalGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalGateway {
    pub fn new() -> Self {
        Self {
            inbox: VecDeque::new(),
            outbox: VecDeque::new(),
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic variant for tests.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            inbox: VecDeque::new(),
            outbox: VecDeque::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn push_inbound(&mut self, value: BigInt) {
        self.inbox.push_back(value);
    }

    pub fn outbound(&self) -> &VecDeque<BigInt> {
        &self.outbox
    }

    fn pop(stack: &mut Vec<BigInt>, what: &str) -> Result<BigInt, HostError> {
        stack
            .pop()
            .ok_or_else(|| HostError::new(format!("missing {what} operand")))
    }
}

impl HostGateway for LocalGateway {
    fn call(&mut self, service: Service, stack: &mut Vec<BigInt>) -> Result<(), HostError> {
        match service {
            Service::Hash => {
                let value = Self::pop(stack, "hash")?;
                stack.push(digest_to_int(blake3::hash(&value.to_signed_bytes_be())));
            }
            Service::Sign => {
                let key = Self::pop(stack, "sign key")?;
                let message = Self::pop(stack, "sign message")?;
                stack.push(keyed_tag(&key, &message));
            }
            Service::Verify => {
                let tag = Self::pop(stack, "verify tag")?;
                let key = Self::pop(stack, "verify key")?;
                let message = Self::pop(stack, "verify message")?;
                let ok = keyed_tag(&key, &message) == tag;
                stack.push(BigInt::from(u8::from(ok)));
            }
            Service::Rng => {
                stack.push(BigInt::from(self.rng.next_u64()));
            }
            Service::Syscall | Service::Interrupt => {
                let _code = Self::pop(stack, "service code")?;
                stack.push(BigInt::zero());
            }
            Service::NetSend => {
                let value = Self::pop(stack, "net_send")?;
                self.outbox.push_back(value);
            }
            Service::NetRecv => {
                let value = self.inbox.pop_front().unwrap_or_else(BigInt::zero);
                stack.push(value);
            }
        }
        Ok(())
    }
}

fn keyed_tag(key: &BigInt, message: &BigInt) -> BigInt {
    let key_material = blake3::hash(&key.to_signed_bytes_be());
    let tag = blake3::keyed_hash(key_material.as_bytes(), &message.to_signed_bytes_be());
    digest_to_int(tag)
}

fn digest_to_int(digest: blake3::Hash) -> BigInt {
    let magnitude = BigUint::from_bytes_be(&digest.as_bytes()[..16]);
    BigInt::from_biguint(Sign::Plus, magnitude)
}

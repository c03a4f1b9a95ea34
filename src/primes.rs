use std::sync::Mutex;

use num_bigint::BigInt;
use num_traits::ToPrimitive;

/// Process-wide prime table. Append-only: once an index has been handed out
/// its value never changes for the lifetime of the process.
static PRIMES: Mutex<Vec<u64>> = Mutex::new(Vec::new());

const SEED: [u64; 4] = [2, 3, 5, 7];

fn ensure_seed(cache: &mut Vec<u64>) {
    if cache.is_empty() {
        cache.extend_from_slice(&SEED);
    }
}

/// Extend the cache by one prime. The cache holds every prime up to its last
/// entry, so trial division against cached entries is exact.
fn grow(cache: &mut Vec<u64>) {
    let mut candidate = cache.last().copied().unwrap_or(1) + 1;
    loop {
        let mut composite = false;
        for &p in cache.iter() {
            if p.saturating_mul(p) > candidate {
                break;
            }
            if candidate % p == 0 {
                composite = true;
                break;
            }
        }
        if !composite {
            cache.push(candidate);
            return;
        }
        candidate += 1;
    }
}

/// The `idx`-th prime, zero-based: `prime(0) == 2`.
pub fn prime(idx: usize) -> u64 {
    let mut cache = PRIMES.lock().expect("prime table poisoned");
    ensure_seed(&mut cache);
    while cache.len() <= idx {
        grow(&mut cache);
    }
    cache[idx]
}

/// Trial-division primality test backed by the shared table.
pub fn is_prime(n: u64) -> bool {
    if n < 2 {
        return false;
    }
    let mut cache = PRIMES.lock().expect("prime table poisoned");
    ensure_seed(&mut cache);
    let mut i = 0;
    loop {
        while cache.len() <= i {
            grow(&mut cache);
        }
        let p = cache[i];
        if p.saturating_mul(p) > n {
            return true;
        }
        if n % p == 0 {
            return n == p;
        }
        i += 1;
    }
}

/// Per-chunk checksum: `(opcode_id * 131 + operand) mod 7`, reduced into
/// `0..=6` so negative operands are well-defined. Detects corruption of the
/// chunk integer, not adversarial tampering.
pub fn checksum(opcode_id: u16, operand: &BigInt) -> u8 {
    let sum = BigInt::from(opcode_id as i64 * 131) + operand;
    let mut rem: BigInt = sum % 7;
    if rem < BigInt::from(0) {
        rem += 7;
    }
    rem.to_u8().unwrap_or(0)
}

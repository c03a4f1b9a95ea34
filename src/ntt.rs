use num_bigint::BigUint;
use num_traits::ToPrimitive;

use crate::primes;

/// Number-theoretic transform roundtrip used as a chunk-integrity probe.
///
/// The field is chosen per block length: the smallest cached prime
/// `p ≡ 1 (mod n)`, which guarantees an n-th root of unity exists. This is
/// the only place the process-wide prime table grows at runtime.
pub fn roundtrip_is_identity(chunks: &[BigUint]) -> bool {
    let n = chunks.len();
    if n == 0 {
        return true;
    }
    let p = field_for(n as u64);
    let root = nth_root(p, n as u64);
    let coeffs: Vec<u64> = chunks
        .iter()
        .map(|chunk| (chunk % BigUint::from(p)).to_u64().unwrap_or(0))
        .collect();
    let spectrum = forward(&coeffs, p, root);
    let back = inverse(&spectrum, p, root);
    back == coeffs
}

/// Smallest prime congruent to 1 modulo `n`, drawn from the shared table.
fn field_for(n: u64) -> u64 {
    let target = 1 % n;
    let mut idx = 0;
    loop {
        let p = primes::prime(idx);
        if p % n == target {
            return p;
        }
        idx += 1;
    }
}

/// `g^((p-1)/n)` for a primitive root `g` of `p`; has multiplicative order
/// exactly `n` because `n` divides `p - 1`.
fn nth_root(p: u64, n: u64) -> u64 {
    if p == 2 {
        return 1;
    }
    let g = primitive_root(p);
    pow_mod(g, (p - 1) / n, p)
}

fn primitive_root(p: u64) -> u64 {
    let order = p - 1;
    let factors = prime_factors(order);
    let mut g = 2;
    loop {
        if factors
            .iter()
            .all(|&q| pow_mod(g, order / q, p) != 1)
        {
            return g;
        }
        g += 1;
    }
}

fn prime_factors(mut n: u64) -> Vec<u64> {
    let mut factors = Vec::new();
    let mut idx = 0;
    while n > 1 {
        let p = primes::prime(idx);
        if p.saturating_mul(p) > n {
            factors.push(n);
            break;
        }
        if n % p == 0 {
            factors.push(p);
            while n % p == 0 {
                n /= p;
            }
        }
        idx += 1;
    }
    factors
}

fn pow_mod(base: u64, mut exp: u64, modulus: u64) -> u64 {
    let mut result = 1u128;
    let mut base = u128::from(base % modulus);
    let modulus = u128::from(modulus);
    while exp > 0 {
        if exp & 1 == 1 {
            result = result * base % modulus;
        }
        base = base * base % modulus;
        exp >>= 1;
    }
    result as u64
}

/// Definitional O(n²) forward transform: `X[k] = Σ x[j]·root^(jk) mod p`.
pub fn forward(coeffs: &[u64], p: u64, root: u64) -> Vec<u64> {
    let n = coeffs.len() as u64;
    (0..n)
        .map(|k| {
            let mut acc = 0u128;
            for (j, &x) in coeffs.iter().enumerate() {
                let twiddle = pow_mod(root, (j as u64 * k) % n, p);
                acc = (acc + u128::from(x) * u128::from(twiddle)) % u128::from(p);
            }
            acc as u64
        })
        .collect()
}

/// Inverse transform via `root^{-1}` and `n^{-1}` (Fermat inverses).
pub fn inverse(spectrum: &[u64], p: u64, root: u64) -> Vec<u64> {
    let n = spectrum.len() as u64;
    let inv_root = pow_mod(root, p - 2, p);
    let inv_n = pow_mod(n % p, p - 2, p);
    (0..n)
        .map(|k| {
            let mut acc = 0u128;
            for (j, &x) in spectrum.iter().enumerate() {
                let twiddle = pow_mod(inv_root, (j as u64 * k) % n, p);
                acc = (acc + u128::from(x) * u128::from(twiddle)) % u128::from(p);
            }
            (acc * u128::from(inv_n) % u128::from(p)) as u64
        })
        .collect()
}

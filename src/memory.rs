use std::collections::HashMap;

use num_bigint::BigInt;
use num_traits::Zero;
use serde::{Deserialize, Serialize};

/// First heap address. Base 0 is never a valid region, which keeps the
/// FREE instruction's operand-0 (pop base from stack) form unambiguous.
pub const HEAP_BASE: i64 = 0x1000;

/// Address-indexed store plus the region allocator. Undefined reads yield 0.
#[derive(Debug, Default)]
pub struct Memory {
    cells: HashMap<i64, BigInt>,
    regions: HashMap<i64, usize>,
    free_by_size: HashMap<usize, Vec<i64>>,
    high_water: i64,
}

/// Serializable image of the full memory state, allocator bookkeeping
/// included, so a restored VM allocates exactly as the captured one would.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryImage {
    pub cells: Vec<(i64, BigInt)>,
    pub regions: Vec<(i64, usize)>,
    pub free: Vec<(usize, Vec<i64>)>,
    pub high_water: i64,
}

impl Memory {
    pub fn new() -> Self {
        Self {
            cells: HashMap::new(),
            regions: HashMap::new(),
            free_by_size: HashMap::new(),
            high_water: HEAP_BASE,
        }
    }

    pub fn load(&self, addr: i64) -> BigInt {
        self.cells.get(&addr).cloned().unwrap_or_else(BigInt::zero)
    }

    pub fn store(&mut self, addr: i64, value: BigInt) {
        if value.is_zero() {
            self.cells.remove(&addr);
        } else {
            self.cells.insert(addr, value);
        }
    }

    /// Reserve `size` contiguous unallocated addresses and return the base.
    /// A free block of exactly matching size is reused before the high-water
    /// mark is extended.
    pub fn alloc(&mut self, size: usize) -> i64 {
        if let Some(bases) = self.free_by_size.get_mut(&size) {
            if let Some(base) = bases.pop() {
                self.regions.insert(base, size);
                return base;
            }
        }
        let base = self.high_water;
        self.high_water += size as i64;
        self.regions.insert(base, size);
        base
    }

    /// Release the region at `base`. Fails when `base` is not a live region.
    pub fn free(&mut self, base: i64) -> bool {
        let Some(size) = self.regions.remove(&base) else {
            return false;
        };
        for offset in 0..size as i64 {
            self.cells.remove(&(base + offset));
        }
        self.free_by_size.entry(size).or_default().push(base);
        true
    }

    pub fn live_regions(&self) -> usize {
        self.regions.len()
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    pub fn image(&self) -> MemoryImage {
        let mut cells: Vec<(i64, BigInt)> = self
            .cells
            .iter()
            .map(|(addr, value)| (*addr, value.clone()))
            .collect();
        cells.sort_by_key(|(addr, _)| *addr);
        let mut regions: Vec<(i64, usize)> =
            self.regions.iter().map(|(base, size)| (*base, *size)).collect();
        regions.sort_by_key(|(base, _)| *base);
        let mut free: Vec<(usize, Vec<i64>)> = self
            .free_by_size
            .iter()
            .map(|(size, bases)| (*size, bases.clone()))
            .collect();
        free.sort_by_key(|(size, _)| *size);
        MemoryImage {
            cells,
            regions,
            free,
            high_water: self.high_water,
        }
    }

    pub fn from_image(image: &MemoryImage) -> Self {
        Self {
            cells: image.cells.iter().cloned().collect(),
            regions: image.regions.iter().copied().collect(),
            free_by_size: image.free.iter().cloned().collect(),
            high_water: image.high_water,
        }
    }
}

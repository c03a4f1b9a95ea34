use std::collections::HashMap;

use serde::Serialize;

use crate::chunk::Op;
use crate::vm::{MemoStats, Vm};

/// Execution metrics collector. Passed into the run loop the same way the
/// debugger is; a run without one pays nothing.
#[derive(Debug, Default)]
pub struct Profiler {
    instruction_count: u64,
    opcode_counts: HashMap<&'static str, u64>,
    ip_counts: HashMap<usize, u64>,
    samples: HashMap<String, u64>,
}

#[derive(Serialize)]
struct Report<'a> {
    instruction_count: u64,
    opcode_counts: &'a HashMap<&'static str, u64>,
    ip_hotspots: &'a HashMap<usize, u64>,
    decode_cache: CacheReport,
}

#[derive(Serialize)]
struct CacheReport {
    hits: u64,
    misses: u64,
}

impl Profiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, vm: &Vm, ip: usize, op: Op) {
        self.instruction_count += 1;
        *self.opcode_counts.entry(op.mnemonic()).or_default() += 1;
        *self.ip_counts.entry(ip).or_default() += 1;
        *self.samples.entry(folded_stack(vm, ip)).or_default() += 1;
    }

    pub fn instruction_count(&self) -> u64 {
        self.instruction_count
    }

    pub fn opcode_count(&self, op: Op) -> u64 {
        self.opcode_counts.get(op.mnemonic()).copied().unwrap_or(0)
    }

    /// JSON metrics report; decode-cache stats come from the VM because the
    /// memo lives there.
    pub fn report(&self, memo: MemoStats) -> String {
        let report = Report {
            instruction_count: self.instruction_count,
            opcode_counts: &self.opcode_counts,
            ip_hotspots: &self.ip_counts,
            decode_cache: CacheReport {
                hits: memo.hits,
                misses: memo.misses,
            },
        };
        serde_json::to_string_pretty(&report).unwrap_or_else(|_| "{}".to_string())
    }

    /// Folded-stack samples for flamegraph tooling, one `stack count` line
    /// per distinct call path, sorted for stable output.
    pub fn flamegraph(&self) -> String {
        let mut lines: Vec<String> = self
            .samples
            .iter()
            .map(|(stack, count)| format!("{stack} {count}\n"))
            .collect();
        lines.sort();
        lines.concat()
    }
}

fn folded_stack(vm: &Vm, ip: usize) -> String {
    let mut parts = vec!["root".to_string()];
    for frame in vm.frames() {
        parts.push(format!("call@{}", frame.call_site));
    }
    parts.push(format!("chunk_{ip}"));
    parts.join(";")
}

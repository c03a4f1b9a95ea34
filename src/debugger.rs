use std::collections::{HashMap, HashSet, VecDeque};
use std::io::Write;

use num_bigint::BigInt;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use crate::chunk::Op;
use crate::logging;
use crate::vm::Vm;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepMode {
    Running,
    Step,
}

/// Interactive controller attached to a run via `Vm::run_with_debugger`.
///
/// Breakpoints key on chunk indices; watchpoints key on memory addresses and
/// fire on the first post-execute callback where the watched value differs
/// from the recorded snapshot. A hit suspends the run in a command loop
/// until an external continue/step. Tests and embedders drive the same loop
/// with a scripted command queue instead of the terminal.
pub struct Debugger {
    breakpoints: HashSet<usize>,
    watch_values: HashMap<i64, BigInt>,
    step_mode: StepMode,
    script: Option<VecDeque<String>>,
    transcript: Vec<u8>,
    editor: Option<DefaultEditor>,
}

impl Default for Debugger {
    fn default() -> Self {
        Self::new()
    }
}

impl Debugger {
    pub fn new() -> Self {
        Self {
            breakpoints: HashSet::new(),
            watch_values: HashMap::new(),
            step_mode: StepMode::Running,
            script: None,
            transcript: Vec::new(),
            editor: None,
        }
    }

    /// Drive the command loop from a fixed list instead of the terminal.
    /// When the list runs dry every pause resumes immediately.
    pub fn with_script(commands: impl IntoIterator<Item = String>) -> Self {
        let mut debugger = Self::new();
        debugger.script = Some(commands.into_iter().collect());
        debugger
    }

    pub fn stop_on_entry(&mut self) {
        self.step_mode = StepMode::Step;
    }

    pub fn add_breakpoint(&mut self, ip: usize) {
        self.breakpoints.insert(ip);
    }

    pub fn remove_breakpoint(&mut self, ip: usize) {
        self.breakpoints.remove(&ip);
    }

    /// Watch `addr` against a zero baseline; undefined reads are 0, so the
    /// first store of a nonzero value fires.
    pub fn add_watchpoint(&mut self, addr: i64) {
        self.watch_values.insert(addr, BigInt::from(0));
    }

    pub fn remove_watchpoint(&mut self, addr: i64) {
        self.watch_values.remove(&addr);
    }

    /// Command output accumulated while scripted.
    pub fn transcript(&self) -> String {
        String::from_utf8_lossy(&self.transcript).into_owned()
    }

    pub(crate) fn on_instruction(&mut self, vm: &Vm, ip: usize, op: Op, operand: &BigInt) {
        let mut hit = self.breakpoints.contains(&ip);
        if self.step_mode == StepMode::Step {
            self.step_mode = StepMode::Running;
            hit = true;
        }
        if hit {
            let label = logging::label_break();
            if op.arity() == 1 {
                self.emit(format!("{label} chunk {ip}: {} {operand}", op.mnemonic()));
            } else {
                self.emit(format!("{label} chunk {ip}: {}", op.mnemonic()));
            }
            self.pause(vm);
        }
    }

    pub(crate) fn after_instruction(&mut self, vm: &Vm) {
        let mut fired = Vec::new();
        for (addr, last) in self.watch_values.iter_mut() {
            let now = vm.memory().load(*addr);
            if now != *last {
                fired.push((*addr, last.clone(), now.clone()));
                *last = now;
            }
        }
        if fired.is_empty() {
            return;
        }
        for (addr, old, new) in fired {
            let label = logging::label_watch();
            self.emit(format!("{label} addr {addr}: {old} -> {new}"));
        }
        self.pause(vm);
    }

    pub(crate) fn on_brk(&mut self, vm: &Vm) {
        let label = logging::label_brk();
        self.emit(format!("{label} chunk {}", vm.ip().saturating_sub(1)));
        self.pause(vm);
    }

    fn pause(&mut self, vm: &Vm) {
        loop {
            let Some(line) = self.next_command() else {
                return;
            };
            let scripted = self.script.is_some();
            let action = if scripted {
                handle_command(
                    &line,
                    vm,
                    &mut self.breakpoints,
                    &mut self.watch_values,
                    &mut self.step_mode,
                    &mut self.transcript,
                )
            } else {
                handle_command(
                    &line,
                    vm,
                    &mut self.breakpoints,
                    &mut self.watch_values,
                    &mut self.step_mode,
                    &mut std::io::stdout(),
                )
            };
            if action == ReplAction::Resume {
                return;
            }
        }
    }

    fn next_command(&mut self) -> Option<String> {
        if let Some(script) = self.script.as_mut() {
            return script.pop_front();
        }
        if self.editor.is_none() {
            self.editor = DefaultEditor::new().ok();
        }
        let editor = self.editor.as_mut()?;
        match editor.readline("(dbg) ") {
            Ok(line) => {
                let _ = editor.add_history_entry(line.as_str());
                Some(line)
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => None,
            Err(_) => None,
        }
    }

    fn emit(&mut self, text: String) {
        if self.script.is_some() {
            self.transcript.extend_from_slice(text.as_bytes());
            self.transcript.push(b'\n');
        } else {
            println!("{text}");
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReplAction {
    Stay,
    Resume,
}

fn handle_command(
    line: &str,
    vm: &Vm,
    breakpoints: &mut HashSet<usize>,
    watches: &mut HashMap<i64, BigInt>,
    step: &mut StepMode,
    out: &mut dyn Write,
) -> ReplAction {
    let mut parts = line.split_whitespace();
    let Some(cmd) = parts.next() else {
        return ReplAction::Stay;
    };
    match cmd {
        "c" | "continue" => return ReplAction::Resume,
        "s" | "step" => {
            *step = StepMode::Step;
            return ReplAction::Resume;
        }
        "b" | "break" => {
            if let Some(ip) = parse_usize(parts.next()) {
                breakpoints.insert(ip);
                let _ = writeln!(out, "breakpoint set at {ip}");
            } else {
                let _ = writeln!(out, "usage: break <chunk index>");
            }
        }
        "clear" => {
            if let Some(ip) = parse_usize(parts.next()) {
                breakpoints.remove(&ip);
                let _ = writeln!(out, "breakpoint cleared at {ip}");
            } else {
                let _ = writeln!(out, "usage: clear <chunk index>");
            }
        }
        "breaks" => {
            let mut sorted: Vec<usize> = breakpoints.iter().copied().collect();
            sorted.sort_unstable();
            let _ = writeln!(out, "breakpoints: {sorted:?}");
        }
        "w" | "watch" => {
            if let Some(addr) = parse_i64(parts.next()) {
                watches.insert(addr, vm.memory().load(addr));
                let _ = writeln!(out, "watchpoint set at {addr}");
            } else {
                let _ = writeln!(out, "usage: watch <addr>");
            }
        }
        "unwatch" => {
            if let Some(addr) = parse_i64(parts.next()) {
                watches.remove(&addr);
                let _ = writeln!(out, "watchpoint cleared at {addr}");
            } else {
                let _ = writeln!(out, "usage: unwatch <addr>");
            }
        }
        "stack" => {
            let rendered: Vec<String> = vm.stack().iter().map(BigInt::to_string).collect();
            let _ = writeln!(out, "stack: [{}]", rendered.join(", "));
        }
        "mem" => {
            if let Some(addr) = parse_i64(parts.next()) {
                let _ = writeln!(out, "mem[{addr}] = {}", vm.memory().load(addr));
            } else {
                let _ = writeln!(out, "usage: mem <addr>");
            }
        }
        "bt" => {
            for (depth, frame) in vm.frames().iter().rev().enumerate() {
                let _ = writeln!(
                    out,
                    "#{depth} call@{} -> {}",
                    frame.call_site, frame.return_ip
                );
            }
            if vm.frames().is_empty() {
                let _ = writeln!(out, "no call frames");
            }
        }
        "ip" => {
            let _ = writeln!(out, "ip: {}", vm.ip());
        }
        "help" => {
            let _ = writeln!(
                out,
                "commands: continue, step, break, clear, breaks, watch, unwatch, stack, mem, bt, ip, help"
            );
        }
        _ => {
            let _ = writeln!(out, "unknown command");
        }
    }
    ReplAction::Stay
}

fn parse_usize(token: Option<&str>) -> Option<usize> {
    token.and_then(|value| value.parse::<usize>().ok())
}

fn parse_i64(token: Option<&str>) -> Option<i64> {
    token.and_then(|value| value.parse::<i64>().ok())
}

use std::io::Read;
use std::process::ExitCode;

use num_bigint::BigInt;
use num_traits::ToPrimitive;

use vm::{
    assemble, logging, looks_like_chunks, parse_chunks, write_chunks_path, Debugger, OutputEvent,
    Profiler, Program, Vm,
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Assemble {
        output: Option<String>,
        input: Option<String>,
    },
    Run {
        input: Option<String>,
    },
    Debug {
        breakpoints: Vec<usize>,
        watchpoints: Vec<i64>,
        input: String,
    },
    Profile {
        input: String,
    },
    Flamegraph {
        input: String,
    },
    Help,
}

fn main() -> ExitCode {
    let _ = logging::init();
    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = match parse_cli_args(&args) {
        Ok(command) => command,
        Err(message) => {
            eprintln!("{message}");
            print_usage();
            return ExitCode::from(2);
        }
    };

    match command {
        Command::Help => {
            print_usage();
            ExitCode::SUCCESS
        }
        Command::Assemble { output, input } => cmd_assemble(output.as_deref(), input.as_deref()),
        Command::Run { input } => cmd_run(input.as_deref()),
        Command::Debug {
            breakpoints,
            watchpoints,
            input,
        } => cmd_debug(&breakpoints, &watchpoints, &input),
        Command::Profile { input } => cmd_profile(&input, false),
        Command::Flamegraph { input } => cmd_profile(&input, true),
    }
}

fn parse_cli_args(args: &[String]) -> Result<Command, String> {
    let Some(subcommand) = args.first() else {
        return Err("missing subcommand".to_string());
    };
    let rest = &args[1..];
    match subcommand.as_str() {
        "-h" | "--help" | "help" => Ok(Command::Help),
        "assemble" => {
            let mut output = None;
            let mut input = None;
            let mut index = 0;
            while index < rest.len() {
                match rest[index].as_str() {
                    "-o" | "--output" => {
                        let value = rest
                            .get(index + 1)
                            .ok_or_else(|| "missing value for -o".to_string())?;
                        output = Some(value.clone());
                        index += 2;
                    }
                    flag if flag.starts_with('-') => {
                        return Err(format!("unknown flag '{flag}'"));
                    }
                    path => {
                        if input.is_some() {
                            return Err("multiple input paths provided".to_string());
                        }
                        input = Some(path.to_string());
                        index += 1;
                    }
                }
            }
            Ok(Command::Assemble { output, input })
        }
        "run" => {
            let mut input = None;
            for arg in rest {
                if arg.starts_with('-') {
                    return Err(format!("unknown flag '{arg}'"));
                }
                if input.is_some() {
                    return Err("multiple input paths provided".to_string());
                }
                input = Some(arg.clone());
            }
            Ok(Command::Run { input })
        }
        "debug" => {
            let mut breakpoints = Vec::new();
            let mut watchpoints = Vec::new();
            let mut input = None;
            let mut index = 0;
            while index < rest.len() {
                match rest[index].as_str() {
                    "-b" | "--break" => {
                        let value = rest
                            .get(index + 1)
                            .ok_or_else(|| "missing value for -b".to_string())?;
                        let ip = value
                            .parse::<usize>()
                            .map_err(|_| format!("invalid breakpoint '{value}'"))?;
                        breakpoints.push(ip);
                        index += 2;
                    }
                    "-w" | "--watch" => {
                        let value = rest
                            .get(index + 1)
                            .ok_or_else(|| "missing value for -w".to_string())?;
                        let addr = value
                            .parse::<i64>()
                            .map_err(|_| format!("invalid watch address '{value}'"))?;
                        watchpoints.push(addr);
                        index += 2;
                    }
                    flag if flag.starts_with('-') => {
                        return Err(format!("unknown flag '{flag}'"));
                    }
                    path => {
                        if input.is_some() {
                            return Err("multiple input paths provided".to_string());
                        }
                        input = Some(path.to_string());
                        index += 1;
                    }
                }
            }
            let input = input.ok_or_else(|| "debug requires an input path".to_string())?;
            Ok(Command::Debug {
                breakpoints,
                watchpoints,
                input,
            })
        }
        "profile" | "flamegraph" => {
            let mut input = None;
            for arg in rest {
                if arg.starts_with('-') {
                    return Err(format!("unknown flag '{arg}'"));
                }
                if input.is_some() {
                    return Err("multiple input paths provided".to_string());
                }
                input = Some(arg.clone());
            }
            let input =
                input.ok_or_else(|| format!("{subcommand} requires an input path"))?;
            if subcommand == "profile" {
                Ok(Command::Profile { input })
            } else {
                Ok(Command::Flamegraph { input })
            }
        }
        other => Err(format!("unknown subcommand '{other}'")),
    }
}

fn print_usage() {
    println!("Usage:");
    println!("  pf-vm assemble [-o OUT] [IN]");
    println!("  pf-vm run [IN]");
    println!("  pf-vm debug [-b IDX]... [-w ADDR]... IN");
    println!("  pf-vm profile IN");
    println!("  pf-vm flamegraph IN");
    println!();
    println!("IN defaults to stdin where optional. Inputs may be assembly");
    println!("source or an encoded chunk list (one decimal integer per line).");
}

fn cmd_assemble(output: Option<&str>, input: Option<&str>) -> ExitCode {
    let text = match read_input(input) {
        Ok(text) => text,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::from(2);
        }
    };
    let chunks = match assemble(&text) {
        Ok(chunks) => chunks,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::from(2);
        }
    };
    match output {
        Some(path) => {
            if let Err(err) = write_chunks_path(path, &chunks) {
                eprintln!("{err}");
                return ExitCode::from(2);
            }
        }
        None => {
            for chunk in &chunks {
                println!("{chunk}");
            }
        }
    }
    ExitCode::SUCCESS
}

fn cmd_run(input: Option<&str>) -> ExitCode {
    let mut vm = match load_vm(input) {
        Ok(vm) => vm,
        Err(code) => return code,
    };
    let result = vm.run();
    emit_output(vm.take_output());
    match result {
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::from(1)
        }
    }
}

fn cmd_debug(breakpoints: &[usize], watchpoints: &[i64], input: &str) -> ExitCode {
    let mut vm = match load_vm(Some(input)) {
        Ok(vm) => vm,
        Err(code) => return code,
    };
    let mut debugger = Debugger::new();
    for &ip in breakpoints {
        debugger.add_breakpoint(ip);
    }
    for &addr in watchpoints {
        debugger.add_watchpoint(addr);
    }
    if breakpoints.is_empty() && watchpoints.is_empty() {
        debugger.stop_on_entry();
    }
    let result = vm.run_with_debugger(&mut debugger);
    emit_output(vm.take_output());
    match result {
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::from(1)
        }
    }
}

fn cmd_profile(input: &str, folded: bool) -> ExitCode {
    let mut vm = match load_vm(Some(input)) {
        Ok(vm) => vm,
        Err(code) => return code,
    };
    let mut profiler = Profiler::new();
    let result = vm.run_with_profiler(&mut profiler);
    if let Err(err) = result {
        eprintln!("{err}");
        return ExitCode::from(1);
    }
    if folded {
        print!("{}", profiler.flamegraph());
    } else {
        println!("{}", profiler.report(vm.memo_stats()));
    }
    ExitCode::SUCCESS
}

fn load_vm(input: Option<&str>) -> Result<Vm, ExitCode> {
    let text = read_input(input).map_err(|err| {
        eprintln!("{err}");
        ExitCode::from(2)
    })?;
    let chunks = if looks_like_chunks(&text) {
        parse_chunks(&text).map_err(|err| {
            eprintln!("{err}");
            ExitCode::from(2)
        })?
    } else {
        assemble(&text).map_err(|err| {
            eprintln!("{err}");
            ExitCode::from(2)
        })?
    };
    Ok(Vm::new(Program::new(chunks)))
}

fn read_input(path: Option<&str>) -> std::io::Result<String> {
    match path {
        Some(path) => std::fs::read_to_string(path),
        None => {
            let mut text = String::new();
            std::io::stdin().read_to_string(&mut text)?;
            Ok(text)
        }
    }
}

/// Print/Output values in the printable ASCII range render as their
/// character; everything else renders in decimal. TRACE entries go to the
/// trace channel on stderr; BRK markers render literally.
fn emit_output(events: Vec<OutputEvent>) {
    let mut rendered = String::new();
    for event in events {
        match event {
            OutputEvent::Print(value) | OutputEvent::Output(value) => {
                rendered.push_str(&render_value(&value));
            }
            OutputEvent::Trace(value) => {
                eprintln!("{} {value}", logging::label_trace());
            }
            OutputEvent::Brk => rendered.push_str("BRK"),
        }
    }
    println!("{rendered}");
}

fn render_value(value: &BigInt) -> String {
    if let Some(code) = value.to_u32() {
        if (0x20..=0x7E).contains(&code) {
            if let Some(ch) = char::from_u32(code) {
                return ch.to_string();
            }
        }
    }
    value.to_string()
}

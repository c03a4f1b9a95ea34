use std::sync::{Arc, Mutex};

use num_bigint::BigInt;
use vm::{
    assemble, HostError, HostGateway, InputSource, OutputEvent, Program, Service, Vm, VmErrorKind,
    VmStatus,
};

fn run_source(source: &str) -> Vm {
    let mut machine = Vm::new(Program::new(assemble(source).expect("assemble should succeed")));
    let status = machine.run().expect("vm should run");
    assert_eq!(status, VmStatus::Halted);
    machine
}

fn prints(machine: &Vm) -> Vec<BigInt> {
    machine
        .output()
        .iter()
        .filter_map(|event| match event {
            OutputEvent::Print(value) | OutputEvent::Output(value) => Some(value.clone()),
            _ => None,
        })
        .collect()
}

#[test]
fn arithmetic_pops_b_then_a() {
    let machine = run_source("PUSH 10\nPUSH 3\nSUB\nPRINT\nHALT\n");
    assert_eq!(prints(&machine), vec![BigInt::from(7)]);

    let machine = run_source("PUSH 10\nPUSH 3\nDIV\nPRINT\nHALT\n");
    assert_eq!(prints(&machine), vec![BigInt::from(3)]);

    let machine = run_source("PUSH 10\nPUSH 3\nMOD\nPRINT\nHALT\n");
    assert_eq!(prints(&machine), vec![BigInt::from(1)]);
}

#[test]
fn neg_and_signed_division_truncate_toward_zero() {
    let machine = run_source("PUSH 7\nNEG\nPUSH 2\nDIV\nPRINT\nHALT\n");
    assert_eq!(prints(&machine), vec![BigInt::from(-3)]);

    let machine = run_source("PUSH 7\nNEG\nPUSH 3\nMOD\nPRINT\nHALT\n");
    assert_eq!(prints(&machine), vec![BigInt::from(-1)]);
}

#[test]
fn division_by_zero_is_fatal() {
    let mut machine = Vm::new(Program::new(
        assemble("PUSH 1\nPUSH 0\nDIV\n").expect("assemble should succeed"),
    ));
    let err = machine.run().expect_err("division should fail");
    assert_eq!(err.kind, VmErrorKind::DivisionByZero);
    assert_eq!(err.ip, 2);
}

#[test]
fn stack_underflow_reports_ip() {
    let mut machine = Vm::new(Program::new(
        assemble("NOP\nPRINT\n").expect("assemble should succeed"),
    ));
    let err = machine.run().expect_err("print should underflow");
    assert_eq!(err.kind, VmErrorKind::StackUnderflow);
    assert_eq!(err.ip, 1);
}

#[test]
fn bitwise_ops_and_shifts() {
    let machine = run_source("PUSH 6\nPUSH 3\nAND\nPRINT\nHALT\n");
    assert_eq!(prints(&machine), vec![BigInt::from(2)]);

    let machine = run_source("PUSH 6\nPUSH 3\nOR\nPRINT\nHALT\n");
    assert_eq!(prints(&machine), vec![BigInt::from(7)]);

    let machine = run_source("PUSH 6\nPUSH 3\nXOR\nPRINT\nHALT\n");
    assert_eq!(prints(&machine), vec![BigInt::from(5)]);

    let machine = run_source("PUSH 3\nPUSH 2\nSHL\nPRINT\nHALT\n");
    assert_eq!(prints(&machine), vec![BigInt::from(12)]);

    let machine = run_source("PUSH 12\nPUSH 2\nSHR\nPRINT\nHALT\n");
    assert_eq!(prints(&machine), vec![BigInt::from(3)]);
}

#[test]
fn negative_shift_amount_is_invalid() {
    let mut machine = Vm::new(Program::new(
        assemble("PUSH 1\nPUSH 2\nNEG\nSHL\n").expect("assemble should succeed"),
    ));
    let err = machine.run().expect_err("negative shift should fail");
    assert!(matches!(err.kind, VmErrorKind::InvalidShift(_)));
}

#[test]
fn float_punning_roundtrips_through_fmul() {
    let machine = run_source("PUSH 3\nI2F\nPUSH 2\nI2F\nFMUL\nF2I\nPRINT\nHALT\n");
    assert_eq!(prints(&machine), vec![BigInt::from(6)]);
}

#[test]
fn fdiv_truncates_on_f2i() {
    let machine = run_source("PUSH 7\nI2F\nPUSH 2\nI2F\nFDIV\nF2I\nPRINT\nHALT\n");
    assert_eq!(prints(&machine), vec![BigInt::from(3)]);
}

#[test]
fn fdiv_by_zero_is_fatal() {
    let mut machine = Vm::new(Program::new(
        assemble("PUSH 1\nI2F\nPUSH 0\nI2F\nFDIV\n").expect("assemble should succeed"),
    ));
    let err = machine.run().expect_err("float division should fail");
    assert_eq!(err.kind, VmErrorKind::DivisionByZero);
}

#[test]
fn store_then_load_pushes_stored_value() {
    let machine = run_source("PUSH 41\nSTORE 9\nLOAD 9\nPRINT\nHALT\n");
    assert_eq!(prints(&machine), vec![BigInt::from(41)]);
}

#[test]
fn undefined_load_pushes_zero() {
    let machine = run_source("LOAD 1234\nPRINT\nHALT\n");
    assert_eq!(prints(&machine), vec![BigInt::from(0)]);
}

#[test]
fn alloc_pushes_base_and_free_by_operand_releases() {
    let machine = run_source("ALLOC 4\nPRINT\nFREE 4096\nHALT\n");
    assert_eq!(prints(&machine), vec![BigInt::from(4096)]);
    assert_eq!(machine.memory().live_regions(), 0);
}

#[test]
fn free_operand_zero_pops_base_from_stack() {
    let machine = run_source("ALLOC 8\nFREE 0\nHALT\n");
    assert_eq!(machine.memory().live_regions(), 0);
}

#[test]
fn free_of_unallocated_base_is_fatal() {
    let mut machine = Vm::new(Program::new(
        assemble("FREE 5\n").expect("assemble should succeed"),
    ));
    let err = machine.run().expect_err("free should fail");
    assert_eq!(err.kind, VmErrorKind::MemoryOutOfRange(BigInt::from(5)));
}

#[test]
fn alloc_reuses_freed_block_of_matching_size() {
    let machine = run_source("ALLOC 4\nFREE 0\nALLOC 4\nPRINT\nHALT\n");
    assert_eq!(prints(&machine), vec![BigInt::from(4096)]);
}

#[test]
fn jz_and_jnz_pop_their_condition() {
    let machine = run_source("PUSH 0\nJZ skip\nPUSH 1\nPRINT\nskip: PUSH 2\nPRINT\nHALT\n");
    assert_eq!(prints(&machine), vec![BigInt::from(2)]);

    let machine = run_source("PUSH 1\nJNZ skip\nPUSH 1\nPRINT\nskip: PUSH 2\nPRINT\nHALT\n");
    assert_eq!(prints(&machine), vec![BigInt::from(2)]);
}

#[test]
fn jump_lands_on_labeled_chunk() {
    // JMP L leaves the next fetch at exactly the chunk labeled L
    let machine = run_source("JMP target\nPUSH 1\nPRINT\ntarget: PUSH 2\nPRINT\nHALT\n");
    assert_eq!(prints(&machine), vec![BigInt::from(2)]);
}

#[test]
fn branch_past_end_is_program_bounds() {
    let mut machine = Vm::new(Program::new(
        assemble("JMP 9\nHALT\n").expect("assemble should succeed"),
    ));
    let err = machine.run().expect_err("wild jump should fail");
    assert_eq!(err.kind, VmErrorKind::ProgramBounds);
}

#[test]
fn branch_to_end_terminates_normally() {
    let machine = run_source("PUSH 1\nPRINT\nJMP 0\n");
    assert_eq!(prints(&machine), vec![BigInt::from(1)]);
}

#[test]
fn call_pushes_frame_and_ret_returns() {
    let machine = run_source("CALL sub\nPUSH 2\nPRINT\nHALT\nsub: PUSH 1\nPRINT\nRET\n");
    assert_eq!(prints(&machine), vec![BigInt::from(1), BigInt::from(2)]);
    assert!(machine.frames().is_empty());
}

#[test]
fn ret_on_empty_call_stack_halts() {
    let machine = run_source("PUSH 3\nPRINT\nRET\nPUSH 4\nPRINT\nHALT\n");
    assert_eq!(prints(&machine), vec![BigInt::from(3)]);
}

#[test]
fn input_pops_queue_in_order() {
    let mut machine = Vm::new(Program::new(
        assemble("INPUT\nPRINT\nINPUT\nPRINT\nHALT\n").expect("assemble should succeed"),
    ));
    machine.push_input(BigInt::from(5));
    machine.push_input(BigInt::from(6));
    machine.run().expect("vm should run");
    assert_eq!(prints(&machine), vec![BigInt::from(5), BigInt::from(6)]);
}

#[test]
fn input_on_empty_queue_is_fatal_without_source() {
    let mut machine = Vm::new(Program::new(
        assemble("INPUT\n").expect("assemble should succeed"),
    ));
    let err = machine.run().expect_err("input should exhaust");
    assert_eq!(err.kind, VmErrorKind::InputExhausted);
}

struct CountingSource {
    next: i64,
}

impl InputSource for CountingSource {
    fn read(&mut self) -> Option<BigInt> {
        self.next += 1;
        Some(BigInt::from(self.next))
    }
}

#[test]
fn input_falls_back_to_blocking_source() {
    let mut machine = Vm::new(Program::new(
        assemble("INPUT\nPRINT\nINPUT\nPRINT\nHALT\n").expect("assemble should succeed"),
    ));
    machine.push_input(BigInt::from(100));
    machine.set_input_source(Box::new(CountingSource { next: 0 }));
    machine.run().expect("vm should run");
    assert_eq!(prints(&machine), vec![BigInt::from(100), BigInt::from(1)]);
}

#[test]
fn trace_peeks_without_popping() {
    let machine = run_source("PUSH 9\nTRACE\nPRINT\nHALT\n");
    assert_eq!(
        machine.output(),
        &[
            OutputEvent::Trace(BigInt::from(9)),
            OutputEvent::Print(BigInt::from(9)),
        ]
    );
}

#[test]
fn output_and_print_carry_distinct_tags() {
    let machine = run_source("PUSH 1\nOUTPUT\nPUSH 2\nPRINT\nHALT\n");
    assert_eq!(
        machine.output(),
        &[
            OutputEvent::Output(BigInt::from(1)),
            OutputEvent::Print(BigInt::from(2)),
        ]
    );
}

struct RecordingGateway {
    calls: Arc<Mutex<Vec<&'static str>>>,
    fail_on: Option<Service>,
}

impl HostGateway for RecordingGateway {
    fn call(&mut self, service: Service, stack: &mut Vec<BigInt>) -> Result<(), HostError> {
        self.calls
            .lock()
            .expect("call log poisoned")
            .push(service.name());
        if self.fail_on == Some(service) {
            return Err(HostError::new("refused"));
        }
        if matches!(service, Service::Rng | Service::NetRecv) {
            stack.push(BigInt::from(7));
        }
        Ok(())
    }
}

#[test]
fn host_opcodes_forward_to_gateway() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let mut machine = Vm::new(Program::new(
        assemble("RNG\nPRINT\nNET_RECV\nPRINT\nPUSH 1\nSYSCALL\nHALT\n")
            .expect("assemble should succeed"),
    ));
    machine.set_gateway(Box::new(RecordingGateway {
        calls: Arc::clone(&calls),
        fail_on: None,
    }));
    machine.run().expect("vm should run");
    assert_eq!(
        calls.lock().expect("call log poisoned").as_slice(),
        &["rng", "net_recv", "syscall"]
    );
    assert_eq!(prints(&machine), vec![BigInt::from(7), BigInt::from(7)]);
}

#[test]
fn gateway_failure_becomes_fatal_with_service_name() {
    let mut machine = Vm::new(Program::new(
        assemble("PUSH 1\nHASH\n").expect("assemble should succeed"),
    ));
    machine.set_gateway(Box::new(RecordingGateway {
        calls: Arc::new(Mutex::new(Vec::new())),
        fail_on: Some(Service::Hash),
    }));
    let err = machine.run().expect_err("gateway should fail");
    match err.kind {
        VmErrorKind::HostGatewayFailure { service, message } => {
            assert_eq!(service, "hash");
            assert_eq!(message, "refused");
        }
        other => panic!("expected gateway failure, got {other:?}"),
    }
    assert_eq!(err.ip, 1);
}

#[test]
fn step_limit_yields_and_resume_continues() {
    let mut machine = Vm::new(Program::new(
        assemble("PUSH 1\nPRINT\nPUSH 2\nPRINT\nHALT\n").expect("assemble should succeed"),
    ));
    machine.set_step_limit(Some(2));
    let status = machine.run().expect("vm should run");
    assert_eq!(status, VmStatus::Yielded);
    assert_eq!(prints(&machine), vec![BigInt::from(1)]);

    machine.set_step_limit(None);
    let status = machine.resume().expect("vm should resume");
    assert_eq!(status, VmStatus::Halted);
    assert_eq!(prints(&machine), vec![BigInt::from(1), BigInt::from(2)]);
}

#[test]
fn block_runs_body_in_subordinate_vm_with_stack_copy() {
    // The child sees the parent's stack but its pops do not affect the
    // parent, and its memory is fresh.
    let machine = run_source(
        "PUSH 7\nSTORE 1\nPUSH 42\nBLOCK 3\nPRINT\nLOAD 1\nPRINT\nPRINT\nHALT\n",
    );
    // child: prints 42 (copied stack), then mem[1] which is 0 in its fresh
    // memory; parent then prints its own intact 42
    assert_eq!(
        prints(&machine),
        vec![BigInt::from(42), BigInt::from(0), BigInt::from(42)]
    );
}

#[test]
fn block_child_error_aborts_parent() {
    let mut machine = Vm::new(Program::new(
        assemble("BLOCK 1\nPRINT\nHALT\n").expect("assemble should succeed"),
    ));
    let err = machine.run().expect_err("child underflow should propagate");
    assert_eq!(err.kind, VmErrorKind::StackUnderflow);
}

#[test]
fn block_composition_matches_inlined_chunks() {
    let blocked = run_source("PUSH 10\nBLOCK 2\nPUSH 1\nPRINT\nPUSH 99\nPRINT\nHALT\n");
    let inlined = run_source("PUSH 10\nPUSH 1\nPRINT\nPUSH 99\nPRINT\nHALT\n");
    assert_eq!(prints(&blocked), prints(&inlined));
}

#[test]
fn block_past_end_is_program_bounds() {
    let mut machine = Vm::new(Program::new(
        assemble("BLOCK 5\nNOP\n").expect("assemble should succeed"),
    ));
    let err = machine.run().expect_err("oversized block should fail");
    assert_eq!(err.kind, VmErrorKind::ProgramBounds);
}

#[test]
fn ntt_roundtrip_leaves_state_unchanged() {
    let machine = run_source("NTT 3\nPUSH 1\nPUSH 2\nADD\nPRINT\nHALT\n");
    assert_eq!(prints(&machine), vec![BigInt::from(3)]);
}

#[test]
fn ntt_over_empty_window_is_noop() {
    let machine = run_source("NTT 0\nPUSH 4\nPRINT\nHALT\n");
    assert_eq!(prints(&machine), vec![BigInt::from(4)]);
}

#[test]
fn ntt_past_end_is_program_bounds() {
    let mut machine = Vm::new(Program::new(
        assemble("NTT 9\nNOP\n").expect("assemble should succeed"),
    ));
    let err = machine.run().expect_err("oversized ntt should fail");
    assert_eq!(err.kind, VmErrorKind::ProgramBounds);
}

#[test]
fn thread_join_merges_child_output_before_parent_continues() {
    let machine = run_source(
        "THREAD_START\nPUSH 1\nPRINT\nHALT\nTHREAD_JOIN\nPUSH 2\nPRINT\nHALT\n",
    );
    assert_eq!(prints(&machine), vec![BigInt::from(1), BigInt::from(2)]);
}

#[test]
fn thread_child_inherits_stack_copy() {
    let machine = run_source(
        "PUSH 5\nTHREAD_START\nPRINT\nHALT\nTHREAD_JOIN\nPRINT\nHALT\n",
    );
    // both the child and the parent print their own copy of the 5
    assert_eq!(prints(&machine), vec![BigInt::from(5), BigInt::from(5)]);
}

#[test]
fn thread_error_propagates_at_join() {
    let mut machine = Vm::new(Program::new(
        assemble("THREAD_START\nPUSH 1\nPUSH 0\nDIV\nHALT\nTHREAD_JOIN\nHALT\n")
            .expect("assemble should succeed"),
    ));
    let err = machine.run().expect_err("child error should propagate");
    assert_eq!(err.kind, VmErrorKind::DivisionByZero);
}

#[test]
fn thread_join_without_start_is_fatal() {
    let mut machine = Vm::new(Program::new(
        assemble("THREAD_JOIN\n").expect("assemble should succeed"),
    ));
    let err = machine.run().expect_err("join should fail");
    assert_eq!(err.kind, VmErrorKind::ThreadUnavailable);
}

#[test]
fn thread_start_without_halt_is_program_bounds() {
    let mut machine = Vm::new(Program::new(
        assemble("THREAD_START\nNOP\nNOP\n").expect("assemble should succeed"),
    ));
    let err = machine.run().expect_err("missing child halt should fail");
    assert_eq!(err.kind, VmErrorKind::ProgramBounds);
}

#[test]
fn decode_memo_hits_on_repeated_chunks() {
    let machine = run_source("PUSH 1\nPUSH 1\nPUSH 1\nADD\nADD\nPRINT\nHALT\n");
    let stats = machine.memo_stats();
    assert!(stats.hits >= 3, "expected memo hits, got {stats:?}");
    assert!(stats.misses >= 4);
}

#[test]
fn end_of_program_without_halt_terminates() {
    let machine = run_source("PUSH 1\nPRINT\n");
    assert_eq!(prints(&machine), vec![BigInt::from(1)]);
}

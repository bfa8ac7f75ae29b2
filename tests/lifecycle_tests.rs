//! Inferior lifecycle tests: creation, relocation, register fetch, and
//! backend construction/teardown.

use std::sync::Arc;

use exdbg::consts::ppc::*;
use exdbg::debugger::debugger::{DebuggerError, Signal, Target};
use exdbg::debugger::host_debuggers::debugger_exos::DebuggerExos;
use exdbg::debugger::inferior::Inferior;
use exdbg::debugger::registers::registers::RegCache;
use exdbg::debugger::sections::{Section, SectionTable, SymbolFile};
use exdbg::kernel::sim::{SimImage, SimKernel, SimSection};

fn demo_image() -> SimImage {
    SimImage {
        sections: vec![
            SimSection {
                name: ".text".to_string(),
                recorded_addr: 0x1000,
                bytes: vec![0; 64],
            },
            SimSection {
                name: ".data".to_string(),
                recorded_addr: 0x2000,
                bytes: vec![1, 2, 3, 4],
            },
        ],
    }
}

fn boot() -> (SimKernel, Arc<DebuggerExos>) {
    let sim = SimKernel::new();
    sim.register_executable("work/demo", demo_image());
    let backend = Arc::new(DebuggerExos::new(&sim).unwrap());
    (sim, backend)
}

#[test]
fn construction_fails_when_a_kernel_interface_is_missing() {
    for service in ["loader", "memory", "debug"] {
        let sim = SimKernel::new();
        sim.fail_next_open(service);
        assert_eq!(
            DebuggerExos::new(&sim).err(),
            Some(DebuggerError::SetupFailed),
            "{} failure must be fatal",
            service
        );
    }
}

#[test]
fn create_with_a_bad_path_is_a_user_error_and_sets_no_handle() {
    let (_sim, backend) = boot();
    let mut inf = Inferior::new();

    let result = backend.create_inferior(Some(&mut inf), Some("bad/path"), "", &[]);
    assert_eq!(result, Err(DebuggerError::NotExecutable));
    assert_eq!(backend.observed(), None);
    assert_eq!(inf.process(), None);
    assert!(!inf.target_is_pushed("exos-native"));
}

#[test]
fn create_without_an_inferior_is_a_configuration_error() {
    let (_sim, backend) = boot();
    let result = backend.create_inferior(None, Some("work/demo"), "", &[]);
    assert_eq!(result, Err(DebuggerError::NoInferior));
}

#[test]
fn create_resolves_the_path_from_the_set_executable() {
    let (sim, backend) = boot();
    let mut inf = Inferior::new();

    // nothing set anywhere
    let result = backend.create_inferior(Some(&mut inf), None, "", &[]);
    assert_eq!(result, Err(DebuggerError::NoExecutable));

    inf.exec_file = Some("work/demo".to_string());
    let task = backend.create_inferior(Some(&mut inf), None, "", &[]).unwrap();
    assert!(sim.task_exists(task));
}

#[test]
fn created_process_is_parked_and_published() {
    let (sim, backend) = boot();
    let mut inf = Inferior::new();

    let task = backend
        .create_inferior(Some(&mut inf), Some("work/demo"), "arg1 arg2", &[])
        .unwrap();

    // the self-suspend entry keeps the task parked until the first resume
    assert!(sim.task_is_suspended(task));
    assert_eq!(backend.observed(), Some(task));
    assert_eq!(inf.process(), Some(task));
    assert_eq!(inf.current_thread(), Some(task));
    assert!(inf.target_is_pushed("exos-native"));
}

#[test]
fn repeated_creates_do_not_stack_the_target_twice() {
    let (sim, backend) = boot();
    let mut inf = Inferior::new();

    let first = backend
        .create_inferior(Some(&mut inf), Some("work/demo"), "", &[])
        .unwrap();
    sim.exit_process(first, 0);
    let second = backend
        .create_inferior(Some(&mut inf), Some("work/demo"), "", &[])
        .unwrap();
    assert_ne!(first, second);
    assert_eq!(backend.observed(), Some(second));
    assert!(inf.target_is_pushed("exos-native"));
    // the first process's death notice does not leak into the new run
    assert_eq!(backend.pending_events(), 0);
}

#[test]
fn resume_restarts_the_parked_process() {
    let (sim, backend) = boot();
    let mut inf = Inferior::new();
    let task = backend
        .create_inferior(Some(&mut inf), Some("work/demo"), "", &[])
        .unwrap();

    // step and signal are not consulted here; stepping is planted as
    // breakpoints by the caller
    backend.resume(task, true, Signal::Trap).unwrap();
    assert!(!sim.task_is_suspended(task));
}

#[test]
fn attach_is_a_stub_that_reports_attach_without_wait() {
    let (_sim, backend) = boot();
    assert!(backend.attach("demo").is_ok());
    assert!(backend.attach_without_wait());
}

#[test]
fn exec_sections_are_relocated_to_actual_load_addresses() {
    let (sim, backend) = boot();
    let mut inf = Inferior::new();
    inf.exec_sections = SectionTable::new(vec![
        Section::new(".text", 0x1000, 64),
        Section::new(".data", 0x2000, 4),
        Section::new(".ghost", 0x3000, 8),
    ]);

    backend
        .create_inferior(Some(&mut inf), Some("work/demo"), "", &[])
        .unwrap();

    let text = inf.exec_sections.get(0).unwrap();
    let data = inf.exec_sections.get(1).unwrap();
    assert_ne!(text.addr, 0x1000);
    assert_ne!(data.addr, 0x2000);
    // addresses come straight from the loader
    let sim_text = sim.peek(text.addr, 4);
    assert_eq!(sim_text, vec![0, 0, 0, 0]);
    assert_eq!(sim.peek(data.addr, 4), vec![1, 2, 3, 4]);
    // sections the loader does not know keep their recorded address
    assert_eq!(inf.exec_sections.get(2).unwrap().addr, 0x3000);
}

#[test]
fn symbol_file_offsets_are_applied_as_one_relocation_event() {
    let (_sim, backend) = boot();
    let mut inf = Inferior::new();
    inf.exec_sections = SectionTable::new(vec![Section::new(".text", 0x1000, 64)]);
    inf.symfile = Some(SymbolFile::new(SectionTable::new(vec![
        Section::new(".text", 0x1000, 64),
        Section::new(".data", 0x2000, 4),
    ])));

    backend
        .create_inferior(Some(&mut inf), Some("work/demo"), "", &[])
        .unwrap();

    let symfile = inf.symfile.as_ref().unwrap();
    let text = symfile.sections.get(0).unwrap();
    let data = symfile.sections.get(1).unwrap();
    assert_ne!(text.addr, 0x1000);
    assert_ne!(data.addr, 0x2000);
    let offsets = symfile.applied_offsets();
    assert_eq!(offsets[0], text.addr as i64 - 0x1000);
    assert_eq!(offsets[1], data.addr as i64 - 0x2000);
    // with a symbol file active the executable's own table is left alone
    assert_eq!(inf.exec_sections.get(0).unwrap().addr, 0x1000);
}

#[test]
fn fetch_all_registers_copies_the_whole_context() {
    let (sim, backend) = boot();
    let mut inf = Inferior::new();
    let task = backend
        .create_inferior(Some(&mut inf), Some("work/demo"), "", &[])
        .unwrap();

    sim.set_task_context(task, |context| {
        context.gpr[3] = 0x1234_5678;
        context.gpr[31] = 0x0bad_cafe;
        context.ip = 0x0002_0040;
        context.msr = 0x0000_b030;
        context.cr = 0x8000_0001;
        context.lr = 0x0002_0000;
        context.ctr = 7;
        context.xer = 3;
        context.fpr[1] = 2.5;
        context.fpscr = 0x0000_00f0;
        context.vscr = 0x0001_0000;
        context.vr[2] = [0x11; 16];
        context.vrsave = 0x0000_ffff;
    });

    let mut cache = RegCache::new();
    backend.fetch_registers(&mut cache, None).unwrap();

    let mut word = [0u8; 4];
    cache.raw_collect(GPR0_REGNUM + 3, &mut word);
    assert_eq!(u32::from_be_bytes(word), 0x1234_5678);
    cache.raw_collect(GPR0_REGNUM + 31, &mut word);
    assert_eq!(u32::from_be_bytes(word), 0x0bad_cafe);
    cache.raw_collect(PC_REGNUM, &mut word);
    assert_eq!(u32::from_be_bytes(word), 0x0002_0040);
    cache.raw_collect(MSR_REGNUM, &mut word);
    assert_eq!(u32::from_be_bytes(word), 0x0000_b030);
    cache.raw_collect(CR_REGNUM, &mut word);
    assert_eq!(u32::from_be_bytes(word), 0x8000_0001);
    cache.raw_collect(LR_REGNUM, &mut word);
    assert_eq!(u32::from_be_bytes(word), 0x0002_0000);
    cache.raw_collect(CTR_REGNUM, &mut word);
    assert_eq!(u32::from_be_bytes(word), 7);
    cache.raw_collect(XER_REGNUM, &mut word);
    assert_eq!(u32::from_be_bytes(word), 3);
    cache.raw_collect(FPSCR_REGNUM, &mut word);
    assert_eq!(u32::from_be_bytes(word), 0x0000_00f0);
    cache.raw_collect(VSCR_REGNUM, &mut word);
    assert_eq!(u32::from_be_bytes(word), 0x0001_0000);
    cache.raw_collect(VRSAVE_REGNUM, &mut word);
    assert_eq!(u32::from_be_bytes(word), 0x0000_ffff);

    let mut dword = [0u8; 8];
    cache.raw_collect(FPR0_REGNUM + 1, &mut dword);
    assert_eq!(f64::from_bits(u64::from_be_bytes(dword)), 2.5);

    let mut vector = [0u8; 16];
    cache.raw_collect(VR0_REGNUM + 2, &mut vector);
    assert_eq!(vector, [0x11; 16]);
}

#[test]
fn fetch_a_single_register_leaves_the_rest_invalid() {
    let (sim, backend) = boot();
    let mut inf = Inferior::new();
    let task = backend
        .create_inferior(Some(&mut inf), Some("work/demo"), "", &[])
        .unwrap();
    sim.set_task_context(task, |context| {
        context.ip = 0x0002_1000;
    });

    let mut cache = RegCache::new();
    backend.fetch_registers(&mut cache, Some(PC_REGNUM)).unwrap();
    assert!(cache.is_valid(PC_REGNUM));
    assert!(!cache.is_valid(GPR0_REGNUM));
    assert_eq!(cache.raw_get_unsigned(PC_REGNUM), 0x0002_1000);
}

#[test]
#[should_panic(expected = "unexpected register")]
fn fetching_an_unmapped_register_is_fatal() {
    let (_sim, backend) = boot();
    let mut inf = Inferior::new();
    backend
        .create_inferior(Some(&mut inf), Some("work/demo"), "", &[])
        .unwrap();

    let mut cache = RegCache::new();
    let _ = backend.fetch_registers(&mut cache, Some(NUM_REGS + 5));
}

#[test]
fn store_registers_surfaces_the_unsupported_write() {
    let (_sim, backend) = boot();
    let mut inf = Inferior::new();
    backend
        .create_inferior(Some(&mut inf), Some("work/demo"), "", &[])
        .unwrap();

    let cache = RegCache::new();
    assert_eq!(
        backend.store_registers(&cache, Some(GPR0_REGNUM)),
        Err(DebuggerError::RegisterWriteUnsupported)
    );
}

#[test]
fn single_step_candidates_come_from_the_stopped_pc() {
    let (sim, backend) = boot();
    let mut inf = Inferior::new();
    let task = backend
        .create_inferior(Some(&mut inf), Some("work/demo"), "", &[])
        .unwrap();

    let pc = 0x0010_0000u32;
    // unconditional branch forward by 0x20
    let insn = 18u32 << 26 | 0x20;
    sim.poke(pc as u64, &insn.to_be_bytes());
    sim.set_task_context(task, |context| {
        context.ip = pc;
    });

    let candidates = backend.single_step_candidates().unwrap();
    assert_eq!(candidates.as_slice(), &[pc + 4, pc + 0x20]);
}

#[test]
fn single_step_reads_special_registers_for_register_branches() {
    let (sim, backend) = boot();
    let mut inf = Inferior::new();
    let task = backend
        .create_inferior(Some(&mut inf), Some("work/demo"), "", &[])
        .unwrap();

    let pc = 0x0010_0100u32;
    // bclr
    let insn = 19u32 << 26 | 16 << 1;
    sim.poke(pc as u64, &insn.to_be_bytes());
    sim.set_task_context(task, |context| {
        context.ip = pc;
        context.lr = 0x0010_0206;
    });

    let candidates = backend.single_step_candidates().unwrap();
    assert_eq!(candidates.as_slice(), &[pc + 4, 0x0010_0204]);
}

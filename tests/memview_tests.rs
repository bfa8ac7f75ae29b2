//! Memory transfer layer tests: shared-address-space access with the
//! attribute excursion, the null guard, and transfer delegation.

use std::sync::Arc;

use exdbg::debugger::debugger::{Target, TargetObject, TransferError};
use exdbg::debugger::host_debuggers::debugger_exos::DebuggerExos;
use exdbg::debugger::inferior::Inferior;
use exdbg::kernel::sim::{SimImage, SimKernel, SimSection};
use exdbg::kernel::{Kernel, MemoryAttrs, MemoryService};
use exdbg::memory::memview::{MemView, MemViewError};

fn boot() -> (SimKernel, Arc<DebuggerExos>) {
    let sim = SimKernel::new();
    let backend = Arc::new(DebuggerExos::new(&sim).unwrap());
    (sim, backend)
}

const SCRATCH: u64 = 0x0010_0000;

#[test]
fn write_then_read_roundtrip() {
    let (_sim, backend) = boot();
    let mut view = backend.memview();

    let payload = [0xde, 0xad, 0xbe, 0xef, 0x01];
    let mut addr = SCRATCH;
    view.write_bytes(&mut addr, &payload).unwrap();
    assert_eq!(addr, SCRATCH + payload.len() as u64);

    let mut out = [0u8; 5];
    let mut addr = SCRATCH;
    view.read_bytes(&mut addr, &mut out, 5).unwrap();
    assert_eq!(out, payload);
}

#[test]
fn attributes_are_restored_after_access() {
    let (sim, backend) = boot();
    let mem = sim.open_memory().unwrap();

    // read-only page: a write has to relax the attributes to get through
    mem.set_memory_attrs(SCRATCH, 16, MemoryAttrs::READ);
    let before = mem.memory_attrs(SCRATCH);

    let mut view = backend.memview();
    let mut addr = SCRATCH;
    view.write_bytes(&mut addr, &[1, 2, 3, 4]).unwrap();

    assert_eq!(mem.memory_attrs(SCRATCH), before);
    assert_eq!(sim.peek(SCRATCH, 4), vec![1, 2, 3, 4]);
}

#[test]
fn attributes_are_restored_on_failed_access() {
    let (sim, backend) = boot();
    let mem = sim.open_memory().unwrap();

    mem.set_memory_attrs(SCRATCH, 16, MemoryAttrs::READ);
    let before = mem.memory_attrs(SCRATCH);

    let view = backend.memview();
    let mut out = [0u8; 8];
    // out of the simulated address space entirely
    let mut addr = 0x7fff_ff00;
    assert!(view.read_bytes(&mut addr, &mut out, 8).is_err());

    assert_eq!(mem.memory_attrs(SCRATCH), before);
    assert!(!sim.in_supervisor());
}

#[test]
fn supervisor_state_is_left_after_every_access() {
    let (sim, backend) = boot();
    let mut view = backend.memview();

    let mut addr = SCRATCH;
    view.write_bytes(&mut addr, &[9; 8]).unwrap();
    assert!(!sim.in_supervisor());

    let mut out = [0u8; 8];
    let mut addr = SCRATCH;
    view.read_bytes(&mut addr, &mut out, 8).unwrap();
    assert!(!sim.in_supervisor());
}

#[test]
fn writes_flush_the_instruction_cache_reads_do_not() {
    let (sim, backend) = boot();
    let mut view = backend.memview();

    let mut addr = SCRATCH;
    view.write_bytes(&mut addr, &[0x60, 0, 0, 0]).unwrap();
    assert_eq!(sim.icache_flushes(), 1);

    let mut out = [0u8; 4];
    let mut addr = SCRATCH;
    view.read_bytes(&mut addr, &mut out, 4).unwrap();
    assert_eq!(sim.icache_flushes(), 1);
}

#[test]
fn null_address_is_rejected_with_zero_bytes_copied() {
    let (sim, backend) = boot();
    let mut view = backend.memview();

    let before = sim.peek(0, 8);
    let mut addr = 0u64;
    assert_eq!(
        view.write_bytes(&mut addr, &[0xff; 8]),
        Err(MemViewError::InvalidParameter)
    );
    assert_eq!(addr, 0);
    assert_eq!(sim.peek(0, 8), before);

    let mut out = [0u8; 8];
    let mut addr = 0u64;
    assert_eq!(
        view.read_bytes(&mut addr, &mut out, 8),
        Err(MemViewError::InvalidParameter)
    );
    assert!(!sim.in_supervisor());
}

#[test]
fn xfer_partial_rejects_offset_zero() {
    let (_sim, backend) = boot();
    let mut out = [0u8; 4];
    let status = backend.xfer_partial(TargetObject::Memory, None, Some(&mut out), None, 0);
    assert_eq!(status, Err(TransferError::Io));
}

#[test]
fn xfer_partial_memory_roundtrip() {
    let (_sim, backend) = boot();
    let data = [7u8, 8, 9];
    let written = backend
        .xfer_partial(TargetObject::Memory, None, None, Some(&data), SCRATCH)
        .unwrap();
    assert_eq!(written, 3);

    let mut out = [0u8; 3];
    let read = backend
        .xfer_partial(TargetObject::Memory, None, Some(&mut out), None, SCRATCH)
        .unwrap();
    assert_eq!(read, 3);
    assert_eq!(out, data);
}

#[test]
fn library_object_transfers_fail_with_io_error() {
    let (_sim, backend) = boot();
    let mut out = [0u8; 4];
    let status = backend.xfer_partial(
        TargetObject::Libraries,
        Some("demo.library"),
        Some(&mut out),
        None,
        SCRATCH,
    );
    assert_eq!(status, Err(TransferError::Io));
}

#[test]
fn unknown_object_classes_delegate_to_the_layer_beneath() {
    struct AuxvLayer;
    impl Target for AuxvLayer {
        fn name(&self) -> &'static str {
            "auxv-layer"
        }
        fn resume(
            &self,
            _: exdbg::kernel::TaskRef,
            _: bool,
            _: exdbg::debugger::debugger::Signal,
        ) -> Result<(), exdbg::debugger::debugger::DebuggerError> {
            unimplemented!()
        }
        fn wait(
            &self,
            _: &mut Inferior,
        ) -> Result<
            (exdbg::kernel::TaskRef, exdbg::debugger::debugger::WaitStatus),
            exdbg::debugger::debugger::DebuggerError,
        > {
            unimplemented!()
        }
        fn fetch_registers(
            &self,
            _: &mut exdbg::debugger::registers::registers::RegCache,
            _: Option<i32>,
        ) -> Result<(), exdbg::debugger::debugger::DebuggerError> {
            unimplemented!()
        }
        fn store_registers(
            &self,
            _: &exdbg::debugger::registers::registers::RegCache,
            _: Option<i32>,
        ) -> Result<(), exdbg::debugger::debugger::DebuggerError> {
            unimplemented!()
        }
        fn xfer_partial(
            &self,
            object: TargetObject,
            _annex: Option<&str>,
            readbuf: Option<&mut [u8]>,
            _writebuf: Option<&[u8]>,
            _offset: u64,
        ) -> Result<u64, TransferError> {
            if object == TargetObject::Auxv {
                if let Some(out) = readbuf {
                    out.fill(0xaa);
                    return Ok(out.len() as u64);
                }
            }
            Err(TransferError::Unsupported)
        }
    }

    let sim = SimKernel::new();
    sim.register_executable(
        "work/demo",
        SimImage {
            sections: vec![SimSection {
                name: ".text".to_string(),
                recorded_addr: 0x1000,
                bytes: vec![0; 16],
            }],
        },
    );
    let backend = Arc::new(DebuggerExos::new(&sim).unwrap());
    let mut inf = Inferior::new();
    inf.push_target(Arc::new(AuxvLayer));
    backend
        .create_inferior(Some(&mut inf), Some("work/demo"), "", &[])
        .unwrap();

    // the native layer doesn't know auxv; the layer beneath does
    let mut out = [0u8; 4];
    let len = inf
        .xfer_partial(TargetObject::Auxv, None, Some(&mut out), None, 0)
        .unwrap();
    assert_eq!(len, 4);
    assert_eq!(out, [0xaa; 4]);

    // nothing on the stack handles os-data: I/O error once the stack is
    // exhausted
    let status = inf.xfer_partial(TargetObject::OsData, None, Some(&mut out), None, 0);
    assert_eq!(status, Err(TransferError::Io));
}

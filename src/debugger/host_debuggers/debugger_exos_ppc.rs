use smallvec::SmallVec;

use crate::consts::ppc::{
    MsrBits, PPC_INSN_SIZE, TRAP_ALIGN, TRAP_DEC, TRAP_DSI, TRAP_EXTERN, TRAP_FPA, TRAP_FPU,
    TRAP_ISI, TRAP_MCE, TRAP_PROG, TRAP_RESERVEDA, TRAP_RESERVEDB, TRAP_SYSCALL, TRAP_TRACEI,
};
use crate::debugger::debugger::Signal;
use crate::kernel::TaskContext;

/// Map a trap to the portable signal reported for it. A missing context or
/// a terminated task is always `Quit`, whatever the vector says. Vectors
/// outside the table yield the unknown sentinel so the wait loop can log
/// them instead of mistaking them for a trace trap.
pub fn trap_to_signal(context: Option<&TaskContext>, terminated: bool) -> Signal {
    let context = match context {
        Some(c) if !terminated => c,
        _ => return Signal::Quit,
    };

    match context.trap_type {
        TRAP_MCE | TRAP_DSI => Signal::Segv,
        TRAP_ISI | TRAP_ALIGN => Signal::Bus,
        TRAP_EXTERN => Signal::Int,
        TRAP_PROG => {
            // the program-exception vector is shared; the cause is in the
            // saved status word
            let msr = MsrBits::from_bits_retain(context.msr);
            if msr.contains(MsrBits::EXC_FPE) {
                Signal::Fpe
            } else if msr.contains(MsrBits::EXC_ILLEGAL) || msr.contains(MsrBits::EXC_PRIV) {
                Signal::Ill
            } else {
                Signal::Trap
            }
        }
        TRAP_FPU | TRAP_FPA => Signal::Fpe,
        TRAP_DEC => Signal::Alrm,
        TRAP_RESERVEDA | TRAP_RESERVEDB => Signal::Ill,
        TRAP_SYSCALL => Signal::Chld,
        TRAP_TRACEI => Signal::Trap,
        _ => Signal::Unknown,
    }
}

/// Destination of a branch instruction, or `None` when `insn` is not a
/// branch. `lr`/`ctr` are the current special-register values; register
/// destinations are masked to instruction alignment.
pub fn branch_dest(opcode: u32, insn: u32, pc: u32, lr: u32, ctr: u32) -> Option<u32> {
    let absolute = (insn >> 1) & 1 == 1;

    match opcode {
        18 => {
            // b/ba/bl/bla: 26-bit displacement, sign extended
            let immediate = ((insn as i32 & !3) << 6) >> 6;
            if absolute {
                Some(immediate as u32)
            } else {
                Some(pc.wrapping_add(immediate as u32))
            }
        }
        16 => {
            // bc: 16-bit displacement, sign extended
            let immediate = ((insn as i32 & !3) << 16) >> 16;
            if absolute {
                Some(immediate as u32)
            } else {
                Some(pc.wrapping_add(immediate as u32))
            }
        }
        19 => {
            let ext_op = (insn >> 1) & 0x3ff;
            if ext_op == 16 {
                // bclr
                Some(lr & !3)
            } else if ext_op == 528 {
                // bcctr
                Some(ctr & !3)
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Candidate next-PC addresses for the instruction at `pc`. There is no
/// hardware single-step on this machine; the caller plants temporary
/// breakpoints at every returned address. Non-branch and undecodable
/// instructions contribute only the fall-through; duplicates collapse.
pub fn software_single_step(pc: u32, insn: u32, lr: u32, ctr: u32) -> SmallVec<u32, 2> {
    let mut next_pcs: SmallVec<u32, 2> = SmallVec::new();

    let fall_through = pc.wrapping_add(PPC_INSN_SIZE);
    next_pcs.push(fall_through);

    let opcode = insn >> 26;
    if let Some(dest) = branch_dest(opcode, insn, pc, lr, ctr) {
        if dest != fall_through {
            next_pcs.push(dest);
        }
    }

    next_pcs
}

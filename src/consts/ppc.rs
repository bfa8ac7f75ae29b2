use bitflags::bitflags;

// Interrupt vector offsets, merged from the ppc32 book III variants the
// kernel may report. Only a subset is ever classified; the rest map to the
// unknown sentinel.
pub const TRAP_RESET: u32 = 0x0100; /* System reset */
pub const TRAP_MCE: u32 = 0x0200; /* Machine check */
pub const TRAP_DSI: u32 = 0x0300; /* Data storage */
pub const TRAP_DSEGI: u32 = 0x0380; /* Data segment */
pub const TRAP_ISI: u32 = 0x0400; /* Instruction storage */
pub const TRAP_ISEGI: u32 = 0x0480; /* Instruction segment */
pub const TRAP_EXTERN: u32 = 0x0500; /* External interrupt */
pub const TRAP_ALIGN: u32 = 0x0600; /* Alignment */
pub const TRAP_PROG: u32 = 0x0700; /* Program */
pub const TRAP_FPU: u32 = 0x0800; /* FPU disabled */
pub const TRAP_DEC: u32 = 0x0900; /* Decrementer */
pub const TRAP_RESERVEDA: u32 = 0x0a00; /* Reserved */
pub const TRAP_RESERVEDB: u32 = 0x0b00; /* Reserved */
pub const TRAP_SYSCALL: u32 = 0x0c00; /* System call */
pub const TRAP_TRACEI: u32 = 0x0d00; /* Trace */
pub const TRAP_FPA: u32 = 0x0e00; /* Floating-point assist */
pub const TRAP_PMI: u32 = 0x0f00; /* Performance monitor */
pub const TRAP_APU: u32 = 0x0f20; /* APU unavailable */
pub const TRAP_PIT: u32 = 0x1000; /* Programmable-interval timer */
pub const TRAP_FIT: u32 = 0x1010; /* Fixed-interval timer */
pub const TRAP_WATCHDOG: u32 = 0x1020; /* Watchdog */
pub const TRAP_DTBL: u32 = 0x1100; /* Data TLB error */
pub const TRAP_ITBL: u32 = 0x1200; /* Instruction TLB error */
pub const TRAP_DEBUG: u32 = 0x2000; /* Debug */

bitflags! {
    // exception-cause bits the kernel folds into the saved machine status
    // word for program exceptions
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MsrBits: u32 {
        const TRACE_ENABLE = 0x0000_0400;
        const EXC_TRAP     = 0x0002_0000;
        const EXC_PRIV     = 0x0004_0000;
        const EXC_ILLEGAL  = 0x0008_0000;
        const EXC_FPE      = 0x0010_0000;
    }
}

pub const PPC_INSN_SIZE: u32 = 4;

// Register numbering handed to the register cache. The layout is fixed;
// fetch_registers treats anything outside it as an architecture-description
// mismatch.
pub const GPR0_REGNUM: i32 = 0; /* ..31 */
pub const FPR0_REGNUM: i32 = 32; /* ..63 */
pub const PC_REGNUM: i32 = 64;
pub const MSR_REGNUM: i32 = 65;
pub const CR_REGNUM: i32 = 66;
pub const LR_REGNUM: i32 = 67;
pub const CTR_REGNUM: i32 = 68;
pub const XER_REGNUM: i32 = 69;
pub const FPSCR_REGNUM: i32 = 70;
pub const VR0_REGNUM: i32 = 71; /* ..102 */
pub const VSCR_REGNUM: i32 = 103;
pub const VRSAVE_REGNUM: i32 = 104;
pub const NUM_REGS: i32 = 105;

pub const fn register_size(regno: i32) -> usize {
    match regno {
        r if r >= GPR0_REGNUM && r < GPR0_REGNUM + 32 => 4,
        r if r >= FPR0_REGNUM && r < FPR0_REGNUM + 32 => 8,
        r if r >= VR0_REGNUM && r < VR0_REGNUM + 32 => 16,
        PC_REGNUM | MSR_REGNUM | CR_REGNUM | LR_REGNUM | CTR_REGNUM | XER_REGNUM
        | FPSCR_REGNUM | VSCR_REGNUM | VRSAVE_REGNUM => 4,
        _ => 0,
    }
}

pub fn register_name(regno: i32) -> &'static str {
    use seq_macro::seq;
    const GPR_NAMES: [&str; 32] = seq!(N in 0..32 { [ #( concat!("r", N), )* ] });
    const FPR_NAMES: [&str; 32] = seq!(N in 0..32 { [ #( concat!("f", N), )* ] });
    const VR_NAMES: [&str; 32] = seq!(N in 0..32 { [ #( concat!("v", N), )* ] });
    match regno {
        r if r >= GPR0_REGNUM && r < GPR0_REGNUM + 32 => GPR_NAMES[(r - GPR0_REGNUM) as usize],
        r if r >= FPR0_REGNUM && r < FPR0_REGNUM + 32 => FPR_NAMES[(r - FPR0_REGNUM) as usize],
        r if r >= VR0_REGNUM && r < VR0_REGNUM + 32 => VR_NAMES[(r - VR0_REGNUM) as usize],
        PC_REGNUM => "pc",
        MSR_REGNUM => "msr",
        CR_REGNUM => "cr",
        LR_REGNUM => "lr",
        CTR_REGNUM => "ctr",
        XER_REGNUM => "xer",
        FPSCR_REGNUM => "fpscr",
        VSCR_REGNUM => "vscr",
        VRSAVE_REGNUM => "vrsave",
        _ => "?",
    }
}

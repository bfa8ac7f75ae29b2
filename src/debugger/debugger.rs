use crate::debugger::inferior::Inferior;
use crate::debugger::registers::registers::RegCache;
use crate::kernel::TaskRef;
use std::fmt;

/// Portable signal identity reported to the debugger core. Only the subset
/// the trap classifier can produce is modelled, plus a distinct sentinel for
/// vectors the classifier does not know; the sentinel is never silently
/// aliased to `Trap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Zero,
    Int,
    Ill,
    Trap,
    Fpe,
    Bus,
    Segv,
    Alrm,
    Chld,
    Quit,
    Unknown,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Signal::Zero => write!(f, "0"),
            Signal::Int => write!(f, "SIGINT"),
            Signal::Ill => write!(f, "SIGILL"),
            Signal::Trap => write!(f, "SIGTRAP"),
            Signal::Fpe => write!(f, "SIGFPE"),
            Signal::Bus => write!(f, "SIGBUS"),
            Signal::Segv => write!(f, "SIGSEGV"),
            Signal::Alrm => write!(f, "SIGALRM"),
            Signal::Chld => write!(f, "SIGCHLD"),
            Signal::Quit => write!(f, "SIGQUIT"),
            Signal::Unknown => write!(f, "(unknown)"),
        }
    }
}

/// Terminal status produced by one `wait` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    Exited(i32),
    Stopped(Signal),
    Signalled(Signal),
}

impl fmt::Display for WaitStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WaitStatus::Exited(code) => write!(f, "exited with code {}", code),
            WaitStatus::Stopped(sig) => write!(f, "stopped with {}", sig),
            WaitStatus::Signalled(sig) => write!(f, "terminated by {}", sig),
        }
    }
}

#[derive(Debug, ToPrimitive, Clone, Copy, PartialEq)]
pub enum DebuggerError {
    InvalidArguments = 0,
    NoInferior = 1,
    NoExecutable = 2,
    NotExecutable = 3,
    SpawnFailed = 4,
    NoProcess = 5,
    SetupFailed = 6,
    RegisterWriteUnsupported = 7,
    AttachUnsupported = 8,
    InternalError = 9,
}

impl fmt::Display for DebuggerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DebuggerError::InvalidArguments => write!(f, "the action was requested with invalid arguments"),
            DebuggerError::NoInferior => write!(f, "no current inferior present"),
            DebuggerError::NoExecutable => write!(f, "no executable file specified"),
            DebuggerError::NotExecutable => write!(f, "not an executable file"),
            DebuggerError::SpawnFailed => write!(f, "can't create the target process"),
            DebuggerError::NoProcess => write!(f, "no process to wait on"),
            DebuggerError::SetupFailed => write!(f, "a required kernel interface could not be acquired"),
            DebuggerError::RegisterWriteUnsupported => write!(f, "register write is not supported on this target"),
            DebuggerError::AttachUnsupported => write!(f, "attaching to a running process is not supported"),
            DebuggerError::InternalError => write!(f, "an internal operation failed"),
        }
    }
}

/// Object classes a partial transfer can address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetObject {
    Memory,
    Libraries,
    Auxv,
    OsData,
}

/// Transfer failure scoped to one `xfer_partial` call. `Unsupported` asks
/// the target stack to delegate to the next-lower layer; `Io` is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferError {
    Io,
    Unsupported,
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TransferError::Io => write!(f, "transfer failed"),
            TransferError::Unsupported => write!(f, "object class not handled by this layer"),
        }
    }
}

/// One layer of the target stack. The host backend implements this; the
/// inferior's stack walks layers top-down for transfers that a layer
/// reports as unsupported.
pub trait Target: Send + Sync {
    fn name(&self) -> &'static str;

    fn attach(&self, args: &str) -> Result<(), DebuggerError> {
        let _ = args;
        Err(DebuggerError::AttachUnsupported)
    }

    /// Whether a successful attach already leaves the process stopped, so
    /// the core must not issue a wait for the initial stop.
    fn attach_without_wait(&self) -> bool {
        false
    }

    fn resume(&self, task: TaskRef, step: bool, signal: Signal) -> Result<(), DebuggerError>;

    fn wait(&self, inf: &mut Inferior) -> Result<(TaskRef, WaitStatus), DebuggerError>;

    fn fetch_registers(&self, cache: &mut RegCache, regno: Option<i32>) -> Result<(), DebuggerError>;

    fn store_registers(&self, cache: &RegCache, regno: Option<i32>) -> Result<(), DebuggerError>;

    fn xfer_partial(
        &self,
        object: TargetObject,
        annex: Option<&str>,
        readbuf: Option<&mut [u8]>,
        writebuf: Option<&[u8]>,
        offset: u64,
    ) -> Result<u64, TransferError>;
}

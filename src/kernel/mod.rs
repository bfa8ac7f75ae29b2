//! Exos kernel interfaces consumed by the debugger backend.
//!
//! Everything the backend needs from the kernel sits behind the three
//! service traits here (loader/object, memory protection, kernel debug) so
//! the backend can run against the in-memory kernel in `sim` during tests.

pub mod hook;
pub mod sim;

use bitflags::bitflags;
use crossbeam::queue::ArrayQueue;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};

use crate::debugger::event_pool::EventRecord;

/// Opaque kernel task reference. Doubles as the debugger's process/thread id.
/// The kernel never hands out zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskRef(pub u32);

impl TaskRef {
    pub fn raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "task:{:#x}", self.0)
    }
}

/// Reference to a library/shared object the observed task touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LibraryRef(pub u64);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KernelError {
    NotFound,
    NoMemory,
    ProtectionViolation,
    InvalidHandle,
    InvalidArguments,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KernelError::NotFound => write!(f, "object does not exist"),
            KernelError::NoMemory => write!(f, "out of kernel memory"),
            KernelError::ProtectionViolation => write!(f, "memory protection violation"),
            KernelError::InvalidHandle => write!(f, "stale or foreign kernel handle"),
            KernelError::InvalidArguments => write!(f, "bad arguments to kernel call"),
        }
    }
}

bitflags! {
    /// Which register groups of a task context were captured.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ContextGroups: u32 {
        const INFO    = 1 << 0;
        const STATE   = 1 << 1;
        const GENERAL = 1 << 2;
        const FPU     = 1 << 3;
        const VECTOR  = 1 << 4;
        const SPECIAL = 1 << 5;
    }
}

/// Machine exception context: the register snapshot the kernel captures at
/// trap time. Read-only for this layer; there is no context-write entry
/// point in the debug service today.
#[derive(Clone)]
pub struct TaskContext {
    pub groups: ContextGroups,
    pub trap_type: u32,
    pub ip: u32,
    pub msr: u32,
    pub gpr: [u32; 32],
    pub cr: u32,
    pub lr: u32,
    pub ctr: u32,
    pub xer: u32,
    pub fpr: [f64; 32],
    pub fpscr: u32,
    pub vscr: u32,
    pub vr: [[u8; 16]; 32],
    pub vrsave: u32,
}

impl Default for TaskContext {
    fn default() -> TaskContext {
        TaskContext {
            groups: ContextGroups::empty(),
            trap_type: 0,
            ip: 0,
            msr: 0,
            gpr: [0; 32],
            cr: 0,
            lr: 0,
            ctr: 0,
            xer: 0,
            fpr: [0.0; 32],
            fpscr: 0,
            vscr: 0,
            vr: [[0; 16]; 32],
            vrsave: 0,
        }
    }
}

/// Raw debug-hook message classes as the kernel numbers them.
#[derive(Debug, FromPrimitive, ToPrimitive, Clone, Copy, PartialEq)]
pub enum DebugMessageClass {
    Exception = 0,
    AddTask = 1,
    RemTask = 2,
    OpenLib = 3,
    CloseLib = 4,
    SharedObjectOpen = 5,
    SharedObjectClose = 6,
}

/// One debug-hook upcall payload. `Unknown` carries the raw class id so the
/// hook can log classes newer than this backend.
pub enum DebugMessage<'a> {
    Exception(&'a TaskContext),
    TaskAdded,
    TaskRemoved,
    LibraryOpened(LibraryRef),
    LibraryClosed(LibraryRef),
    SharedObjectOpened(LibraryRef),
    SharedObjectClosed(LibraryRef),
    Unknown(u32),
}

/// What the debug hook tells the kernel to do with the faulting task.
/// An explicit enum: the raw 0/1 return at this boundary is exactly the kind
/// of sign confusion that does not survive review.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookVerdict {
    Resume,
    Suspend,
}

bitflags! {
    /// Task signal bits. The low word is reserved for kernel control
    /// signals; port bits are allocated from the high word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SignalSet: u32 {
        /// Terminal exit request for the debugger itself.
        const CONTROL_EXIT = 1 << 13;
        /// User interrupt (break) directed at the debugger.
        const CONTROL_INTERRUPT = 1 << 12;
        const _ = !0;
    }
}

/// Allocatable signal bit, `1 << n` form held in a `SignalSet`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalBit(pub u32);

impl SignalBit {
    pub fn mask(&self) -> SignalSet {
        SignalSet::from_bits_retain(1 << self.0)
    }
}

const PORT_SIGNAL_FIRST: u32 = 16;
const PORT_SIGNAL_LAST: u32 = 31;

/// The blocking-wait signal primitive shared between the debugger task and
/// everything that needs to wake it: the debug hook, death notification
/// delivery, and the user interface raising control signals.
pub struct SignalHub {
    state: Mutex<SignalHubState>,
    cond: Condvar,
}

struct SignalHubState {
    pending: SignalSet,
    allocated: u32,
}

impl SignalHub {
    pub fn new() -> SignalHub {
        SignalHub {
            state: Mutex::new(SignalHubState {
                pending: SignalSet::empty(),
                allocated: 0,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn alloc_signal(&self) -> Option<SignalBit> {
        let mut state = self.state.lock().unwrap();
        for bit in PORT_SIGNAL_FIRST..=PORT_SIGNAL_LAST {
            if state.allocated & (1 << bit) == 0 {
                state.allocated |= 1 << bit;
                return Some(SignalBit(bit));
            }
        }
        None
    }

    pub fn free_signal(&self, bit: SignalBit) {
        let mut state = self.state.lock().unwrap();
        state.allocated &= !(1 << bit.0);
        state.pending &= !bit.mask();
    }

    pub fn raise(&self, signals: SignalSet) {
        let mut state = self.state.lock().unwrap();
        state.pending |= signals;
        self.cond.notify_all();
    }

    /// Block until at least one signal in `mask` is pending; the returned
    /// bits are cleared. There is no timeout, matching the kernel call this
    /// stands in for.
    pub fn wait(&self, mask: SignalSet) -> SignalSet {
        let mut state = self.state.lock().unwrap();
        loop {
            let got = state.pending & mask;
            if !got.is_empty() {
                state.pending &= !got;
                return got;
            }
            state = self.cond.wait(state).unwrap();
        }
    }

    /// Non-blocking variant used by teardown paths.
    pub fn poll(&self, mask: SignalSet) -> SignalSet {
        let mut state = self.state.lock().unwrap();
        let got = state.pending & mask;
        state.pending &= !got;
        got
    }
}

impl Default for SignalHub {
    fn default() -> SignalHub {
        SignalHub::new()
    }
}

/// Out-of-band record delivered when the observed process dies. Not pool
/// owned; it is dropped by whoever consumes it.
#[derive(Debug, Clone, Copy)]
pub struct DeathRecord {
    pub process: TaskRef,
    pub return_code: i32,
}

/// Messages carried by a kernel message port.
pub enum PortMessage {
    Debug(EventRecord),
    Death(DeathRecord),
}

const PORT_QUEUE_DEPTH: usize = 32;

/// A message port: a fixed-depth lock-free queue plus the signal bit raised
/// on delivery. Puts never block and never allocate, so the debug hook can
/// use one from the faulting task's own execution context.
pub struct MessagePort {
    queue: ArrayQueue<PortMessage>,
    bit: SignalBit,
    hub: Arc<SignalHub>,
}

impl MessagePort {
    pub fn new(hub: Arc<SignalHub>, bit: SignalBit) -> MessagePort {
        MessagePort {
            queue: ArrayQueue::new(PORT_QUEUE_DEPTH),
            bit,
            hub,
        }
    }

    pub fn signal_mask(&self) -> SignalSet {
        self.bit.mask()
    }

    /// Deliver a message. On a full queue the message is returned to the
    /// caller, which owns the drop policy.
    pub fn put(&self, msg: PortMessage) -> Result<(), PortMessage> {
        self.queue.push(msg)?;
        self.hub.raise(self.bit.mask());
        Ok(())
    }

    pub fn get(&self) -> Option<PortMessage> {
        self.queue.pop()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Handle to a loaded executable's segment list. Kept alive until the
/// process created from it has finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentList(pub u32);

/// Handle to a loaded image opened for structured (section-level) access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedObject(pub u32);

/// Everything `create_process` needs. Stdio is inherited from the debugger;
/// `start_suspended` parks the new task before its first instruction so the
/// debug hook can be installed without racing it.
pub struct ProcessSpec {
    pub seglist: SegmentList,
    pub name: String,
    pub args: String,
    pub env: Vec<(String, String)>,
    pub home_dir: Option<PathBuf>,
    pub start_suspended: bool,
    pub inherit_stdio: bool,
    pub death_port: Option<Arc<MessagePort>>,
}

/// Loader/object service: executable loading, process creation, and
/// section-level queries against a loaded image.
pub trait LoaderService: Send + Sync {
    fn load_executable(&self, path: &str) -> Result<SegmentList, KernelError>;
    fn unload(&self, seglist: SegmentList);
    fn parent_dir(&self, path: &str) -> Option<PathBuf>;
    fn create_process(&self, spec: ProcessSpec) -> Result<TaskRef, KernelError>;
    fn open_object(&self, seglist: SegmentList) -> Result<LoadedObject, KernelError>;
    fn section_address(&self, object: LoadedObject, name: &str) -> Option<u64>;
    fn close_object(&self, object: LoadedObject);
}

bitflags! {
    /// Page protection attributes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MemoryAttrs: u32 {
        const READ    = 1 << 0;
        const WRITE   = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

impl MemoryAttrs {
    pub fn read_write() -> MemoryAttrs {
        MemoryAttrs::READ | MemoryAttrs::WRITE
    }
}

/// Token returned when entering supervisor state from user state; handed
/// back on exit. `None` from `super_state` means the caller already was in
/// supervisor state and must not leave it.
#[derive(Debug, PartialEq, Eq)]
pub struct SupervisorToken(pub u64);

/// Memory-protection service. The debugger shares the target's address
/// space, so all inferior access funnels through attribute toggling here.
pub trait MemoryService: Send + Sync {
    fn super_state(&self) -> Option<SupervisorToken>;
    fn user_state(&self, token: SupervisorToken);
    fn memory_attrs(&self, addr: u64) -> MemoryAttrs;
    fn set_memory_attrs(&self, addr: u64, len: u64, attrs: MemoryAttrs);
    fn copy_from(&self, addr: u64, out: &mut [u8]) -> Result<(), KernelError>;
    fn copy_to(&self, addr: u64, data: &[u8]) -> Result<(), KernelError>;
    fn flush_icache(&self, addr: u64, len: u64);
}

/// Kernel debug service: hook installation, context capture, task
/// suspend/restart, and the signal hub the wait loop blocks on.
pub trait DebugService: Send + Sync {
    fn signal_hub(&self) -> Arc<SignalHub>;
    fn install_debug_hook(
        &self,
        task: TaskRef,
        hook: Option<hook::HookToken>,
    ) -> Result<(), KernelError>;
    fn read_task_context(
        &self,
        task: TaskRef,
        groups: ContextGroups,
    ) -> Result<TaskContext, KernelError>;
    fn suspend_task(&self, task: TaskRef) -> Result<(), KernelError>;
    fn restart_task(&self, task: TaskRef) -> Result<(), KernelError>;
}

/// A kernel: the three services the backend acquires at construction.
/// Acquisition is fallible one service at a time so construction can unwind
/// in reverse order (drop of the already-acquired handles).
pub trait Kernel: Send + Sync {
    fn open_loader(&self) -> Result<Arc<dyn LoaderService>, KernelError>;
    fn open_memory(&self) -> Result<Arc<dyn MemoryService>, KernelError>;
    fn open_debug(&self) -> Result<Arc<dyn DebugService>, KernelError>;
}

//! In-memory Exos kernel used by the test suite.
//!
//! Implements the three kernel services over a flat address space and a
//! task table, with entry points for injecting the events a real kernel
//! would generate (traps, task/library notices, death messages, control
//! signals). The same pattern the pack uses for kernel-side code: the
//! service boundary is a trait, the tests drive a user-space double.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use num::FromPrimitive;

use super::hook::{self, HookToken};
use super::{
    ContextGroups, DeathRecord, DebugMessage, DebugMessageClass, DebugService, HookVerdict,
    Kernel, KernelError, LibraryRef, LoadedObject, LoaderService, MemoryAttrs, MemoryService,
    MessagePort, PortMessage, ProcessSpec, SegmentList, SignalHub, SupervisorToken, TaskContext,
    TaskRef,
};

const SIM_MEMORY_SIZE: usize = 2 * 1024 * 1024;
const SIM_PAGE_SHIFT: u64 = 12;
const SIM_LOAD_BASE: u64 = 0x0001_0000;

/// A section of a registered executable image: name, the address recorded
/// in the image, and its contents.
#[derive(Clone)]
pub struct SimSection {
    pub name: String,
    pub recorded_addr: u64,
    pub bytes: Vec<u8>,
}

/// An executable the simulated loader knows how to load.
#[derive(Clone, Default)]
pub struct SimImage {
    pub sections: Vec<SimSection>,
}

struct LoadedSection {
    name: String,
    actual_addr: u64,
}

struct LoadedSeglist {
    sections: Vec<LoadedSection>,
}

#[derive(Clone, Copy, PartialEq)]
enum TaskState {
    Suspended,
    Runnable,
    Dead,
}

struct SimTask {
    state: TaskState,
    hook: Option<HookToken>,
    context: TaskContext,
    death_port: Option<Arc<MessagePort>>,
}

struct SimState {
    hub: Arc<SignalHub>,
    tasks: Mutex<HashMap<u32, SimTask>>,
    next_task: AtomicU32,
    images: Mutex<HashMap<String, SimImage>>,
    seglists: Mutex<HashMap<u32, LoadedSeglist>>,
    objects: Mutex<HashMap<u32, u32>>,
    next_handle: AtomicU32,
    memory: Mutex<Vec<u8>>,
    attrs: Mutex<HashMap<u64, MemoryAttrs>>,
    supervisor: Mutex<bool>,
    load_cursor: AtomicU64,
    icache_flushes: AtomicUsize,
    fail_service: Mutex<Option<&'static str>>,
}

/// The simulated kernel. Cloning shares the underlying machine.
#[derive(Clone)]
pub struct SimKernel {
    state: Arc<SimState>,
}

impl SimKernel {
    pub fn new() -> SimKernel {
        SimKernel {
            state: Arc::new(SimState {
                hub: Arc::new(SignalHub::new()),
                tasks: Mutex::new(HashMap::new()),
                next_task: AtomicU32::new(1),
                images: Mutex::new(HashMap::new()),
                seglists: Mutex::new(HashMap::new()),
                objects: Mutex::new(HashMap::new()),
                next_handle: AtomicU32::new(1),
                memory: Mutex::new(vec![0; SIM_MEMORY_SIZE]),
                attrs: Mutex::new(HashMap::new()),
                supervisor: Mutex::new(false),
                load_cursor: AtomicU64::new(SIM_LOAD_BASE),
                icache_flushes: AtomicUsize::new(0),
                fail_service: Mutex::new(None),
            }),
        }
    }

    pub fn hub(&self) -> Arc<SignalHub> {
        Arc::clone(&self.state.hub)
    }

    /// Make the named service (`"loader"`, `"memory"`, `"debug"`) fail to
    /// open, for construction-unwind tests.
    pub fn fail_next_open(&self, service: &'static str) {
        *self.state.fail_service.lock().unwrap() = Some(service);
    }

    /// Register an executable under `path`.
    pub fn register_executable(&self, path: &str, image: SimImage) {
        self.state.images.lock().unwrap().insert(path.to_string(), image);
    }

    pub fn task_exists(&self, task: TaskRef) -> bool {
        self.state.tasks.lock().unwrap().contains_key(&task.0)
    }

    pub fn task_is_suspended(&self, task: TaskRef) -> bool {
        self.state
            .tasks
            .lock()
            .unwrap()
            .get(&task.0)
            .map(|t| t.state == TaskState::Suspended)
            .unwrap_or(false)
    }

    /// Edit a task's saved context, the way a running task would change its
    /// own registers.
    pub fn set_task_context(&self, task: TaskRef, edit: impl FnOnce(&mut TaskContext)) {
        if let Some(t) = self.state.tasks.lock().unwrap().get_mut(&task.0) {
            edit(&mut t.context);
        }
    }

    /// Deliver a debug message to every installed hook, the way the kernel
    /// broadcasts debug events; `task` is the task the event concerns.
    pub fn broadcast_debug_event(&self, task: TaskRef, msg: &DebugMessage) -> HookVerdict {
        let tokens: Vec<HookToken> = {
            let tasks = self.state.tasks.lock().unwrap();
            tasks.values().filter_map(|t| t.hook).collect()
        };
        let mut verdict = HookVerdict::Resume;
        for token in tokens {
            if hook::dispatch(token, task, msg) == HookVerdict::Suspend {
                verdict = HookVerdict::Suspend;
            }
        }
        verdict
    }

    /// Deliver a debug message by its raw kernel class number, the way the
    /// wire side of the hook sees it. Exceptions carry a context and go
    /// through `raise_exception` instead; here an exception class (or any
    /// class this table does not know) arrives as `Unknown`.
    pub fn inject_raw_debug_event(
        &self,
        task: TaskRef,
        class: u32,
        library: Option<LibraryRef>,
    ) -> HookVerdict {
        let lib = library.unwrap_or(LibraryRef(0));
        let msg = match DebugMessageClass::from_u32(class) {
            Some(DebugMessageClass::AddTask) => DebugMessage::TaskAdded,
            Some(DebugMessageClass::RemTask) => DebugMessage::TaskRemoved,
            Some(DebugMessageClass::OpenLib) => DebugMessage::LibraryOpened(lib),
            Some(DebugMessageClass::CloseLib) => DebugMessage::LibraryClosed(lib),
            Some(DebugMessageClass::SharedObjectOpen) => DebugMessage::SharedObjectOpened(lib),
            Some(DebugMessageClass::SharedObjectClose) => DebugMessage::SharedObjectClosed(lib),
            Some(DebugMessageClass::Exception) | None => DebugMessage::Unknown(class),
        };
        self.broadcast_debug_event(task, &msg)
    }

    /// Fire a trap on `task`: capture its context with the trap vector and
    /// status bits filled in, run the debug hooks on it, and park the task
    /// if the verdict says so.
    pub fn raise_exception(&self, task: TaskRef, trap_type: u32, msr_bits: u32) -> HookVerdict {
        let context = {
            let mut tasks = self.state.tasks.lock().unwrap();
            let Some(t) = tasks.get_mut(&task.0) else {
                return HookVerdict::Resume;
            };
            t.context.trap_type = trap_type;
            t.context.msr |= msr_bits;
            t.context.clone()
        };

        let verdict = self.broadcast_debug_event(task, &DebugMessage::Exception(&context));

        if verdict == HookVerdict::Suspend {
            if let Some(t) = self.state.tasks.lock().unwrap().get_mut(&task.0) {
                t.state = TaskState::Suspended;
            }
        }
        verdict
    }

    /// Terminate `task` and deliver its pre-armed death notification.
    pub fn exit_process(&self, task: TaskRef, return_code: i32) {
        let death_port = {
            let mut tasks = self.state.tasks.lock().unwrap();
            let Some(t) = tasks.get_mut(&task.0) else { return };
            t.state = TaskState::Dead;
            t.death_port.take()
        };
        if let Some(port) = death_port {
            let death = DeathRecord {
                process: task,
                return_code,
            };
            if port.put(PortMessage::Death(death)).is_err() {
                log::error!("death notification dropped: port full");
            }
        }
    }

    /// Library open/close notices as the kernel would raise them.
    pub fn open_library(&self, task: TaskRef, library: LibraryRef) -> HookVerdict {
        self.broadcast_debug_event(task, &DebugMessage::LibraryOpened(library))
    }

    pub fn close_library(&self, task: TaskRef, library: LibraryRef) -> HookVerdict {
        self.broadcast_debug_event(task, &DebugMessage::LibraryClosed(library))
    }

    /// Direct memory access for tests, bypassing protection.
    pub fn poke(&self, addr: u64, bytes: &[u8]) {
        let mut memory = self.state.memory.lock().unwrap();
        let start = addr as usize;
        memory[start..start + bytes.len()].copy_from_slice(bytes);
    }

    pub fn peek(&self, addr: u64, len: usize) -> Vec<u8> {
        let memory = self.state.memory.lock().unwrap();
        let start = addr as usize;
        memory[start..start + len].to_vec()
    }

    pub fn icache_flushes(&self) -> usize {
        self.state.icache_flushes.load(Ordering::Relaxed)
    }

    pub fn in_supervisor(&self) -> bool {
        *self.state.supervisor.lock().unwrap()
    }

    fn page_range(addr: u64, len: u64) -> std::ops::RangeInclusive<u64> {
        let first = addr >> SIM_PAGE_SHIFT;
        let last = if len == 0 { first } else { (addr + len - 1) >> SIM_PAGE_SHIFT };
        first..=last
    }

    fn check_access(&self, addr: u64, len: u64, needed: MemoryAttrs) -> Result<(), KernelError> {
        if addr as usize + len as usize > SIM_MEMORY_SIZE {
            return Err(KernelError::NotFound);
        }
        let attrs = self.state.attrs.lock().unwrap();
        for page in Self::page_range(addr, len) {
            let page_attrs = attrs
                .get(&page)
                .copied()
                .unwrap_or(MemoryAttrs::READ | MemoryAttrs::EXECUTE);
            if !page_attrs.contains(needed) {
                return Err(KernelError::ProtectionViolation);
            }
        }
        Ok(())
    }
}

impl Default for SimKernel {
    fn default() -> SimKernel {
        SimKernel::new()
    }
}

struct SimLoader {
    state: Arc<SimState>,
}

struct SimMemory {
    state: Arc<SimState>,
}

struct SimDebug {
    state: Arc<SimState>,
}

impl Kernel for SimKernel {
    fn open_loader(&self) -> Result<Arc<dyn LoaderService>, KernelError> {
        if self.state.fail_service.lock().unwrap().take_if(|s| *s == "loader").is_some() {
            return Err(KernelError::NotFound);
        }
        Ok(Arc::new(SimLoader {
            state: Arc::clone(&self.state),
        }))
    }

    fn open_memory(&self) -> Result<Arc<dyn MemoryService>, KernelError> {
        if self.state.fail_service.lock().unwrap().take_if(|s| *s == "memory").is_some() {
            return Err(KernelError::NotFound);
        }
        Ok(Arc::new(SimMemory {
            state: Arc::clone(&self.state),
        }))
    }

    fn open_debug(&self) -> Result<Arc<dyn DebugService>, KernelError> {
        if self.state.fail_service.lock().unwrap().take_if(|s| *s == "debug").is_some() {
            return Err(KernelError::NotFound);
        }
        Ok(Arc::new(SimDebug {
            state: Arc::clone(&self.state),
        }))
    }
}

impl LoaderService for SimLoader {
    fn load_executable(&self, path: &str) -> Result<SegmentList, KernelError> {
        let image = {
            let images = self.state.images.lock().unwrap();
            images.get(path).cloned().ok_or(KernelError::NotFound)?
        };

        let mut sections = Vec::with_capacity(image.sections.len());
        for section in &image.sections {
            let size = section.bytes.len().max(1) as u64;
            // load at a fresh address: images are position independent and
            // never land where the section table recorded them
            let aligned = (size + 0xf) & !0xf;
            let actual = self.state.load_cursor.fetch_add(aligned, Ordering::Relaxed);
            if actual as usize + size as usize > SIM_MEMORY_SIZE {
                return Err(KernelError::NoMemory);
            }
            {
                let mut memory = self.state.memory.lock().unwrap();
                let start = actual as usize;
                memory[start..start + section.bytes.len()].copy_from_slice(&section.bytes);
            }
            sections.push(LoadedSection {
                name: section.name.clone(),
                actual_addr: actual,
            });
        }

        let id = self.state.next_handle.fetch_add(1, Ordering::Relaxed);
        self.state
            .seglists
            .lock()
            .unwrap()
            .insert(id, LoadedSeglist { sections });
        Ok(SegmentList(id))
    }

    fn unload(&self, seglist: SegmentList) {
        self.state.seglists.lock().unwrap().remove(&seglist.0);
    }

    fn parent_dir(&self, path: &str) -> Option<PathBuf> {
        let parent = Path::new(path).parent()?;
        if parent.as_os_str().is_empty() {
            None
        } else {
            Some(parent.to_path_buf())
        }
    }

    fn create_process(&self, spec: ProcessSpec) -> Result<TaskRef, KernelError> {
        let entry = {
            let seglists = self.state.seglists.lock().unwrap();
            let loaded = seglists.get(&spec.seglist.0).ok_or(KernelError::InvalidHandle)?;
            loaded.sections.first().map(|s| s.actual_addr).unwrap_or(0)
        };

        let id = self.state.next_task.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "creating process '{}' (args: '{}', env: {} vars, home: {:?}, inherit stdio: {}, suspended: {})",
            spec.name,
            spec.args,
            spec.env.len(),
            spec.home_dir,
            spec.inherit_stdio,
            spec.start_suspended
        );
        let mut context = TaskContext::default();
        context.ip = entry as u32;
        context.groups = ContextGroups::all();

        self.state.tasks.lock().unwrap().insert(
            id,
            SimTask {
                state: if spec.start_suspended {
                    TaskState::Suspended
                } else {
                    TaskState::Runnable
                },
                hook: None,
                context,
                death_port: spec.death_port,
            },
        );
        Ok(TaskRef(id))
    }

    fn open_object(&self, seglist: SegmentList) -> Result<LoadedObject, KernelError> {
        if !self.state.seglists.lock().unwrap().contains_key(&seglist.0) {
            return Err(KernelError::InvalidHandle);
        }
        let id = self.state.next_handle.fetch_add(1, Ordering::Relaxed);
        self.state.objects.lock().unwrap().insert(id, seglist.0);
        Ok(LoadedObject(id))
    }

    fn section_address(&self, object: LoadedObject, name: &str) -> Option<u64> {
        let seglist_id = *self.state.objects.lock().unwrap().get(&object.0)?;
        let seglists = self.state.seglists.lock().unwrap();
        seglists
            .get(&seglist_id)?
            .sections
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.actual_addr)
    }

    fn close_object(&self, object: LoadedObject) {
        self.state.objects.lock().unwrap().remove(&object.0);
    }
}

impl SimMemory {
    fn kernel(&self) -> SimKernel {
        SimKernel {
            state: Arc::clone(&self.state),
        }
    }
}

impl MemoryService for SimMemory {
    fn super_state(&self) -> Option<SupervisorToken> {
        let mut supervisor = self.state.supervisor.lock().unwrap();
        if *supervisor {
            None
        } else {
            *supervisor = true;
            Some(SupervisorToken(1))
        }
    }

    fn user_state(&self, _token: SupervisorToken) {
        *self.state.supervisor.lock().unwrap() = false;
    }

    fn memory_attrs(&self, addr: u64) -> MemoryAttrs {
        self.state
            .attrs
            .lock()
            .unwrap()
            .get(&(addr >> SIM_PAGE_SHIFT))
            .copied()
            .unwrap_or(MemoryAttrs::READ | MemoryAttrs::EXECUTE)
    }

    fn set_memory_attrs(&self, addr: u64, len: u64, attrs: MemoryAttrs) {
        let mut table = self.state.attrs.lock().unwrap();
        for page in SimKernel::page_range(addr, len) {
            table.insert(page, attrs);
        }
    }

    fn copy_from(&self, addr: u64, out: &mut [u8]) -> Result<(), KernelError> {
        self.kernel()
            .check_access(addr, out.len() as u64, MemoryAttrs::READ)?;
        let memory = self.state.memory.lock().unwrap();
        let start = addr as usize;
        out.copy_from_slice(&memory[start..start + out.len()]);
        Ok(())
    }

    fn copy_to(&self, addr: u64, data: &[u8]) -> Result<(), KernelError> {
        self.kernel()
            .check_access(addr, data.len() as u64, MemoryAttrs::WRITE)?;
        let mut memory = self.state.memory.lock().unwrap();
        let start = addr as usize;
        memory[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn flush_icache(&self, _addr: u64, _len: u64) {
        self.state.icache_flushes.fetch_add(1, Ordering::Relaxed);
    }
}

impl DebugService for SimDebug {
    fn signal_hub(&self) -> Arc<SignalHub> {
        Arc::clone(&self.state.hub)
    }

    fn install_debug_hook(&self, task: TaskRef, hook: Option<HookToken>) -> Result<(), KernelError> {
        let mut tasks = self.state.tasks.lock().unwrap();
        let t = tasks.get_mut(&task.0).ok_or(KernelError::InvalidHandle)?;
        t.hook = hook;
        Ok(())
    }

    fn read_task_context(
        &self,
        task: TaskRef,
        groups: ContextGroups,
    ) -> Result<TaskContext, KernelError> {
        let tasks = self.state.tasks.lock().unwrap();
        let t = tasks.get(&task.0).ok_or(KernelError::InvalidHandle)?;
        let mut context = t.context.clone();
        context.groups = groups;
        Ok(context)
    }

    fn suspend_task(&self, task: TaskRef) -> Result<(), KernelError> {
        let mut tasks = self.state.tasks.lock().unwrap();
        let t = tasks.get_mut(&task.0).ok_or(KernelError::InvalidHandle)?;
        if t.state == TaskState::Dead {
            return Err(KernelError::InvalidHandle);
        }
        t.state = TaskState::Suspended;
        Ok(())
    }

    fn restart_task(&self, task: TaskRef) -> Result<(), KernelError> {
        let mut tasks = self.state.tasks.lock().unwrap();
        let t = tasks.get_mut(&task.0).ok_or(KernelError::InvalidHandle)?;
        if t.state == TaskState::Dead {
            return Err(KernelError::InvalidHandle);
        }
        t.state = TaskState::Runnable;
        Ok(())
    }
}

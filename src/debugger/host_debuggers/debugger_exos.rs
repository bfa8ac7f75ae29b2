use smallvec::SmallVec;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use super::debugger_exos_memview::ExosMemView;
use super::debugger_exos_ppc::{software_single_step, trap_to_signal};
use crate::consts::arch::Endianness;
use crate::consts::ppc::{
    register_name, CR_REGNUM, CTR_REGNUM, FPR0_REGNUM, FPSCR_REGNUM, GPR0_REGNUM, LR_REGNUM,
    MSR_REGNUM, PC_REGNUM, VR0_REGNUM, VRSAVE_REGNUM, VSCR_REGNUM, XER_REGNUM,
};
use crate::debugger::debugger::{
    DebuggerError, Signal, Target, TargetObject, TransferError, WaitStatus,
};
use crate::debugger::event_pool::{EventKind, EventPool, EventRecord};
use crate::debugger::inferior::Inferior;
use crate::debugger::registers::regmap::{supply_regset, SIZEOF_VRREGSET, VRREGMAP};
use crate::debugger::registers::registers::RegCache;
use crate::kernel::hook::{self, DebugHook, HookToken};
use crate::kernel::{
    ContextGroups, DebugMessage, DebugService, HookVerdict, Kernel, LoaderService, MemoryService,
    MessagePort, PortMessage, ProcessSpec, SegmentList, SignalBit, SignalHub, SignalSet,
    TaskContext, TaskRef,
};
use crate::memory::memview::MemView;

/// State shared between the backend and its debug hook. The hook runs on
/// the observed task's own execution thread at trap time, so everything
/// here is reachable without blocking: an atomic for the observed handle,
/// the lock-free record pool, and the non-blocking port.
pub struct ExosHookData {
    /// Raw handle of the observed process; 0 when nothing is observed.
    observed: AtomicU32,
    port: Arc<MessagePort>,
    pool: EventPool,
}

impl ExosHookData {
    fn observed(&self) -> Option<TaskRef> {
        match self.observed.load(Ordering::Acquire) {
            0 => None,
            raw => Some(TaskRef(raw)),
        }
    }

    /// Queue an informational record; these never halt the process.
    fn put_info(&self, task: TaskRef, kind: EventKind, library: Option<crate::kernel::LibraryRef>) {
        let Some(mut record) = self.pool.alloc(task) else {
            log::error!("event pool exhausted, dropping {:?} for {}", kind, task);
            return;
        };
        record.kind = kind;
        record.signal = None;
        record.library = library;
        self.deliver(record);
    }

    fn deliver(&self, record: EventRecord) {
        if let Err(PortMessage::Debug(record)) = self.port.put(PortMessage::Debug(record)) {
            log::error!("debugger port full, dropping {:?} for {}", record.kind, record.process);
            self.pool.free(record);
        }
    }
}

impl DebugHook for ExosHookData {
    fn on_debug_event(&self, task: TaskRef, msg: &DebugMessage) -> HookVerdict {
        // the hook sees every debug event on the system; anything not from
        // the observed process is waved through untouched
        match self.observed() {
            Some(observed) if observed == task => {}
            _ => {
                log::trace!("{} not under observation", task);
                return HookVerdict::Resume;
            }
        }

        match msg {
            DebugMessage::Exception(context) => {
                log::debug!("{} raised exception, trap {:#x}", task, context.trap_type);
                let Some(mut record) = self.pool.alloc(task) else {
                    log::error!("event pool exhausted, dropping exception for {}", task);
                    return HookVerdict::Resume;
                };
                record.kind = EventKind::Exception;
                record.signal = Some(trap_to_signal(Some(context), false));
                self.deliver(record);
                HookVerdict::Suspend
            }
            DebugMessage::TaskAdded => {
                log::debug!("{} added", task);
                self.put_info(task, EventKind::TaskAttached, None);
                HookVerdict::Resume
            }
            DebugMessage::TaskRemoved => {
                log::debug!("{} removed", task);
                self.put_info(task, EventKind::TaskTerminated, None);
                HookVerdict::Resume
            }
            DebugMessage::LibraryOpened(lib) => {
                log::debug!("{} opened library {:#x}", task, lib.0);
                self.put_info(task, EventKind::LibraryOpened, Some(*lib));
                HookVerdict::Resume
            }
            DebugMessage::LibraryClosed(lib) => {
                log::debug!("{} closed library {:#x}", task, lib.0);
                self.put_info(task, EventKind::LibraryClosed, Some(*lib));
                HookVerdict::Resume
            }
            DebugMessage::SharedObjectOpened(lib) => {
                log::debug!("{} opened shared object {:#x}", task, lib.0);
                HookVerdict::Resume
            }
            DebugMessage::SharedObjectClosed(lib) => {
                log::debug!("{} closed shared object {:#x}", task, lib.0);
                HookVerdict::Resume
            }
            DebugMessage::Unknown(class) => {
                log::debug!("{} sent unknown debug message class {}", task, class);
                HookVerdict::Resume
            }
        }
    }
}

/// Native execution-control backend for Exos processes.
///
/// One instance observes at most one process. The kernel interface handles
/// are acquired in the constructor and released by drop; a failed
/// construction unwinds whatever was already acquired in reverse order.
pub struct DebuggerExos {
    loader: Arc<dyn LoaderService>,
    mmu: Arc<dyn MemoryService>,
    debug: Arc<dyn DebugService>,
    hub: Arc<SignalHub>,
    port_bit: SignalBit,
    hook_data: Arc<ExosHookData>,
    hook_token: HookToken,
    // the seglist stays loaded for the lifetime of the process created
    // from it
    seglist: Mutex<Option<SegmentList>>,
}

impl DebuggerExos {
    pub fn new(kernel: &dyn Kernel) -> Result<DebuggerExos, DebuggerError> {
        let loader = kernel.open_loader().map_err(|e| {
            log::error!("can't open the loader service: {}", e);
            DebuggerError::SetupFailed
        })?;
        let mmu = kernel.open_memory().map_err(|e| {
            log::error!("can't get memory protection access: {}", e);
            DebuggerError::SetupFailed
        })?;
        let debug = kernel.open_debug().map_err(|e| {
            log::error!("can't find the kernel's debugger interface: {}", e);
            DebuggerError::SetupFailed
        })?;

        let hub = debug.signal_hub();
        let port_bit = hub.alloc_signal().ok_or_else(|| {
            log::error!("can't allocate a signal for the debugger port");
            DebuggerError::SetupFailed
        })?;
        let port = Arc::new(MessagePort::new(Arc::clone(&hub), port_bit));

        let hook_data = Arc::new(ExosHookData {
            observed: AtomicU32::new(0),
            port,
            pool: EventPool::new(),
        });
        let hook_token = hook::register(Arc::clone(&hook_data) as Arc<dyn DebugHook>);

        Ok(DebuggerExos {
            loader,
            mmu,
            debug,
            hub,
            port_bit,
            hook_data,
            hook_token,
            seglist: Mutex::new(None),
        })
    }

    pub fn observed(&self) -> Option<TaskRef> {
        self.hook_data.observed()
    }

    /// Free records left in the pool.
    pub fn pool_available(&self) -> usize {
        self.hook_data.pool.available()
    }

    /// Events queued for the wait loop.
    pub fn pending_events(&self) -> usize {
        self.hook_data.port.len()
    }

    /// Inferior memory accessor used by the transfer layer and the
    /// single-step address computation.
    pub fn memview(&self) -> ExosMemView {
        ExosMemView::new(Arc::clone(&self.mmu))
    }

    fn read_full_context(&self, task: TaskRef) -> Result<TaskContext, DebuggerError> {
        self.debug
            .read_task_context(
                task,
                ContextGroups::INFO
                    | ContextGroups::STATE
                    | ContextGroups::GENERAL
                    | ContextGroups::FPU
                    | ContextGroups::VECTOR
                    | ContextGroups::SPECIAL,
            )
            .map_err(|e| {
                log::error!("can't read the context of {}: {}", task, e);
                DebuggerError::InternalError
            })
    }

    /// Start a new inferior process from `exec_file` (or the inferior's
    /// configured executable). The new process is created parked on a
    /// self-suspending entry, the debug hook is installed while it has not
    /// run a single instruction yet, and only then is it published as the
    /// observed process.
    pub fn create_inferior(
        self: &Arc<Self>,
        inf: Option<&mut Inferior>,
        exec_file: Option<&str>,
        args: &str,
        env: &[(String, String)],
    ) -> Result<TaskRef, DebuggerError> {
        let inf = inf.ok_or(DebuggerError::NoInferior)?;

        // no path handed to us: fall back to the one set on the inferior
        let path = match exec_file {
            Some(path) => path.to_string(),
            None => inf.exec_file.clone().ok_or(DebuggerError::NoExecutable)?,
        };

        let seglist = self.loader.load_executable(&path).map_err(|_| {
            log::warn!("'{}': not an executable file", path);
            DebuggerError::NotExecutable
        })?;

        let home_dir = self.loader.parent_dir(&path);
        let name = Path::new(&path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(path.as_str())
            .to_string();

        let spec = ProcessSpec {
            seglist,
            name,
            args: args.to_string(),
            env: env.to_vec(),
            home_dir,
            start_suspended: true,
            inherit_stdio: true,
            // pre-armed death notification, bound to the process the kernel
            // is about to create
            death_port: Some(Arc::clone(&self.hook_data.port)),
        };

        let task = self.loader.create_process(spec).map_err(|e| {
            log::error!("can't create process for '{}': {}", path, e);
            self.loader.unload(seglist);
            DebuggerError::SpawnFailed
        })?;

        // the entry trampoline parks the task before its first instruction,
        // so installing the hook here cannot race the inferior
        self.debug
            .install_debug_hook(task, Some(self.hook_token))
            .map_err(|e| {
                log::error!("can't install the debug hook on {}: {}", task, e);
                DebuggerError::InternalError
            })?;

        // drop wait state left over from a previous run; the new process is
        // parked and cannot have produced anything yet
        while let Some(msg) = self.hook_data.port.get() {
            if let PortMessage::Debug(record) = msg {
                self.hook_data.pool.free(record);
            }
        }

        self.hook_data.observed.store(task.raw(), Ordering::Release);

        {
            let mut slot = self.seglist.lock().unwrap();
            if let Some(old) = slot.take() {
                self.loader.unload(old);
            }
            *slot = Some(seglist);
        }

        inf.set_process(task);
        inf.push_target(Arc::clone(self) as Arc<dyn Target>);
        inf.add_thread(task);
        inf.switch_to_thread(task);
        inf.clear_proceed_state();

        self.relocate_sections(inf, seglist);

        log::debug!("created inferior {} from '{}'", task, path);
        Ok(task)
    }

    /// Patch recorded section addresses to where the loader actually put
    /// them. With a symbol file active its offset table takes the deltas as
    /// one relocation event; otherwise the executable's own section table
    /// is updated in place.
    pub fn relocate_sections(&self, inf: &mut Inferior, seglist: SegmentList) {
        let object = match self.loader.open_object(seglist) {
            Ok(object) => object,
            Err(e) => {
                log::warn!("loaded image has no section info: {}", e);
                return;
            }
        };

        if let Some(symfile) = inf.symfile.as_mut() {
            let mut deltas = vec![0i64; symfile.section_count()];
            for (index, section) in symfile.sections.iter().enumerate() {
                if let Some(actual) = self.loader.section_address(object, &section.name) {
                    deltas[index] = actual as i64 - section.addr as i64;
                    log::debug!(
                        "symbol file section '{}' relocated {:#x} -> {:#x}",
                        section.name,
                        section.addr,
                        actual
                    );
                }
            }
            symfile.relocate(&deltas);
        } else {
            let updates: Vec<(usize, u64)> = inf
                .exec_sections
                .iter()
                .enumerate()
                .filter_map(|(index, section)| {
                    self.loader
                        .section_address(object, &section.name)
                        .map(|actual| {
                            log::debug!(
                                "exec section '{}' relocated {:#x} -> {:#x}",
                                section.name,
                                section.addr,
                                actual
                            );
                            (index, actual)
                        })
                })
                .collect();
            for (index, actual) in updates {
                inf.exec_sections.set_section_address(index, actual);
            }
        }

        self.loader.close_object(object);
    }

    /// Candidate next-PC addresses for the instruction the observed process
    /// is stopped at; the generic step logic plants temporary breakpoints
    /// on them.
    pub fn single_step_candidates(&self) -> Result<SmallVec<u32, 2>, DebuggerError> {
        let task = self.observed().ok_or(DebuggerError::NoProcess)?;
        let context = self.read_full_context(task)?;

        let mut addr = context.ip as u64;
        let insn = self
            .memview()
            .read_u32(&mut addr, Endianness::BigEndian)
            .map_err(|e| {
                log::error!("can't read instruction at {:#x}: {}", context.ip, e);
                DebuggerError::InternalError
            })?;

        Ok(software_single_step(context.ip, insn, context.lr, context.ctr))
    }

    fn wait_impl(&self, inf: &mut Inferior) -> Result<(TaskRef, WaitStatus), DebuggerError> {
        let process = self.observed().ok_or(DebuggerError::NoProcess)?;
        let mask =
            SignalSet::CONTROL_EXIT | SignalSet::CONTROL_INTERRUPT | self.hook_data.port.signal_mask();

        loop {
            // don't block while drained records are still queued: the port
            // signal may have been consumed by an earlier pass
            let mut signals = self.hub.poll(mask);
            if signals.is_empty() && self.hook_data.port.is_empty() {
                signals = self.hub.wait(mask);
            }

            // exit-control outranks everything and leaves the queue alone
            if signals.contains(SignalSet::CONTROL_EXIT) {
                log::debug!("wait: received exit-control signal");
                return Ok((process, WaitStatus::Exited(0)));
            }

            // a user interrupt preempts pending informational work; park
            // the process and report a trap-equivalent stop
            if signals.contains(SignalSet::CONTROL_INTERRUPT) {
                log::debug!("wait: received user interrupt");
                self.debug.suspend_task(process).map_err(|e| {
                    log::error!("can't suspend {}: {}", process, e);
                    DebuggerError::InternalError
                })?;
                return Ok((process, WaitStatus::Stopped(Signal::Trap)));
            }

            while let Some(msg) = self.hook_data.port.get() {
                match msg {
                    PortMessage::Death(death) => {
                        log::debug!(
                            "wait: {} died with return code {}",
                            death.process,
                            death.return_code
                        );
                        inf.set_proceed_pending(false);
                        return Ok((process, WaitStatus::Exited(death.return_code)));
                    }
                    PortMessage::Debug(record) => {
                        let status = self.drain_record(&record);
                        self.hook_data.pool.free(record);
                        if let Some(status) = status {
                            inf.set_proceed_pending(false);
                            return Ok((process, status));
                        }
                    }
                }
            }
        }
    }

    /// Turn one drained record into a terminal status, or `None` for
    /// records the loop swallows.
    fn drain_record(&self, record: &EventRecord) -> Option<WaitStatus> {
        let signal = match record.signal {
            None => {
                match record.kind {
                    EventKind::TaskAttached => log::debug!("wait: task attached"),
                    EventKind::TaskTerminated => log::debug!("wait: task terminated"),
                    EventKind::LibraryOpened => log::debug!("wait: task opened a library"),
                    EventKind::LibraryClosed => log::debug!("wait: task closed a library"),
                    EventKind::Exception => {
                        log::warn!("wait: exception record without a signal")
                    }
                }
                return None;
            }
            Some(signal) => signal,
        };

        log::debug!("wait: inferior {} signalled {}", record.process, signal);
        match signal {
            Signal::Chld => Some(WaitStatus::Signalled(Signal::Zero)),
            Signal::Quit => Some(WaitStatus::Signalled(Signal::Quit)),
            Signal::Trap => Some(WaitStatus::Stopped(Signal::Trap)),
            Signal::Segv | Signal::Bus | Signal::Int | Signal::Fpe | Signal::Ill | Signal::Alrm => {
                Some(WaitStatus::Stopped(signal))
            }
            Signal::Zero | Signal::Unknown => {
                log::warn!("wait: unknown signal from debug hook, event dropped");
                None
            }
        }
    }

    fn supply_context(&self, cache: &mut RegCache, context: &TaskContext, regno: Option<i32>) {
        // the vector group travels as one fixed-layout region
        let mut vrregs = [0u8; SIZEOF_VRREGSET];
        vrregs[..4].copy_from_slice(&context.vscr.to_be_bytes());
        for (i, vr) in context.vr.iter().enumerate() {
            let start = 16 + i * 16;
            vrregs[start..start + 16].copy_from_slice(vr);
        }
        vrregs[SIZEOF_VRREGSET - 4..].copy_from_slice(&context.vrsave.to_be_bytes());

        match regno {
            None => {
                for i in 0..32 {
                    cache.raw_supply(GPR0_REGNUM + i, &context.gpr[i as usize].to_be_bytes());
                }
                for i in 0..32 {
                    cache.raw_supply(FPR0_REGNUM + i, &context.fpr[i as usize].to_bits().to_be_bytes());
                }
                cache.raw_supply(PC_REGNUM, &context.ip.to_be_bytes());
                cache.raw_supply(MSR_REGNUM, &context.msr.to_be_bytes());
                cache.raw_supply(CR_REGNUM, &context.cr.to_be_bytes());
                cache.raw_supply(LR_REGNUM, &context.lr.to_be_bytes());
                cache.raw_supply(CTR_REGNUM, &context.ctr.to_be_bytes());
                cache.raw_supply(XER_REGNUM, &context.xer.to_be_bytes());
                cache.raw_supply(FPSCR_REGNUM, &context.fpscr.to_be_bytes());
                supply_regset(&VRREGMAP, cache, None, &vrregs);
            }
            Some(regno) => {
                if regno == PC_REGNUM {
                    cache.raw_supply(regno, &context.ip.to_be_bytes());
                } else if (GPR0_REGNUM..GPR0_REGNUM + 32).contains(&regno) {
                    cache.raw_supply(regno, &context.gpr[(regno - GPR0_REGNUM) as usize].to_be_bytes());
                } else if (FPR0_REGNUM..FPR0_REGNUM + 32).contains(&regno) {
                    cache.raw_supply(
                        regno,
                        &context.fpr[(regno - FPR0_REGNUM) as usize].to_bits().to_be_bytes(),
                    );
                } else if (VR0_REGNUM..VR0_REGNUM + 32).contains(&regno)
                    || regno == VSCR_REGNUM
                    || regno == VRSAVE_REGNUM
                {
                    supply_regset(&VRREGMAP, cache, Some(regno), &vrregs);
                } else if regno == MSR_REGNUM {
                    cache.raw_supply(regno, &context.msr.to_be_bytes());
                } else if regno == CR_REGNUM {
                    cache.raw_supply(regno, &context.cr.to_be_bytes());
                } else if regno == LR_REGNUM {
                    cache.raw_supply(regno, &context.lr.to_be_bytes());
                } else if regno == CTR_REGNUM {
                    cache.raw_supply(regno, &context.ctr.to_be_bytes());
                } else if regno == XER_REGNUM {
                    cache.raw_supply(regno, &context.xer.to_be_bytes());
                } else if regno == FPSCR_REGNUM {
                    cache.raw_supply(regno, &context.fpscr.to_be_bytes());
                } else {
                    // an index outside the mapping means the architecture
                    // description and this backend disagree; guessing a
                    // value here corrupts the debug session
                    panic!("fetch_registers: unexpected register: '{}'", register_name(regno));
                }
            }
        }
    }
}

impl Drop for DebuggerExos {
    fn drop(&mut self) {
        // clear the debug hook first so nothing fires into a dying backend
        if let Some(task) = self.observed() {
            if self.debug.install_debug_hook(task, None).is_err() {
                log::warn!("can't clear the debug hook on {}", task);
            }
        }
        hook::unregister(self.hook_token);

        // drain pending records back into the pool, then drop the channel
        while let Some(msg) = self.hook_data.port.get() {
            if let PortMessage::Debug(record) = msg {
                self.hook_data.pool.free(record);
            }
        }
        self.hub.free_signal(self.port_bit);

        if let Some(seglist) = self.seglist.lock().unwrap().take() {
            self.loader.unload(seglist);
        }
    }
}

impl Target for DebuggerExos {
    fn name(&self) -> &'static str {
        "exos-native"
    }

    fn attach(&self, args: &str) -> Result<(), DebuggerError> {
        // no live-process attach on this kernel
        log::debug!("attach requested (args: '{}'), nothing to do", args);
        Ok(())
    }

    fn attach_without_wait(&self) -> bool {
        true
    }

    fn resume(&self, task: TaskRef, step: bool, signal: Signal) -> Result<(), DebuggerError> {
        // stepping is handled by the caller planting breakpoints at the
        // single-step candidates; the task is restarted unconditionally
        log::debug!("resume {} (step: {}, signal: {})", task, step, signal);
        self.debug.restart_task(task).map_err(|e| {
            log::error!("can't restart {}: {}", task, e);
            DebuggerError::NoProcess
        })
    }

    fn wait(&self, inf: &mut Inferior) -> Result<(TaskRef, WaitStatus), DebuggerError> {
        self.wait_impl(inf)
    }

    fn fetch_registers(&self, cache: &mut RegCache, regno: Option<i32>) -> Result<(), DebuggerError> {
        let task = self.observed().ok_or(DebuggerError::NoProcess)?;
        let context = self.read_full_context(task)?;
        self.supply_context(cache, &context, regno);
        Ok(())
    }

    fn store_registers(&self, _cache: &RegCache, regno: Option<i32>) -> Result<(), DebuggerError> {
        // the debug service has no context-write entry point; surface that
        // instead of silently dropping the write
        log::warn!(
            "store_registers: register write not supported (regno: {:?})",
            regno
        );
        Err(DebuggerError::RegisterWriteUnsupported)
    }

    fn xfer_partial(
        &self,
        object: TargetObject,
        annex: Option<&str>,
        readbuf: Option<&mut [u8]>,
        writebuf: Option<&[u8]>,
        offset: u64,
    ) -> Result<u64, TransferError> {
        match object {
            TargetObject::Memory => {
                if offset == 0 {
                    // helps the unwinder fail fast on the null saved-pc
                    // sentinel instead of faulting the debugger
                    return Err(TransferError::Io);
                }

                let mut view = self.memview();
                let mut addr = offset;
                if let Some(out) = readbuf {
                    let len = out.len();
                    view.read_bytes(&mut addr, out, len as i32)
                        .map_err(|_| TransferError::Io)?;
                    log::trace!("transferred {} bytes from {:#x}", len, offset);
                    Ok(len as u64)
                } else if let Some(data) = writebuf {
                    view.write_bytes(&mut addr, data).map_err(|_| TransferError::Io)?;
                    log::trace!("transferred {} bytes to {:#x}", data.len(), offset);
                    Ok(data.len() as u64)
                } else {
                    Err(TransferError::Io)
                }
            }
            TargetObject::Libraries => {
                log::debug!("library list transfer ('{}') not supported", annex.unwrap_or(""));
                Err(TransferError::Io)
            }
            _ => Err(TransferError::Unsupported),
        }
    }
}

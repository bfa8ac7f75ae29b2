use std::sync::Arc;

use crate::debugger::debugger::{Target, TargetObject, TransferError};
use crate::debugger::sections::{SectionTable, SymbolFile};
use crate::kernel::TaskRef;

/// The single program under debugging: its executable identity, section
/// tables, thread registry, and the layered target stack transfers are
/// delegated through. The design tracks exactly one inferior.
#[derive(Default)]
pub struct Inferior {
    /// Path from a prior "set executable"; `create_inferior` falls back to
    /// this when no path is handed in.
    pub exec_file: Option<String>,
    /// Section table of the executable itself, used when no symbol file is
    /// active.
    pub exec_sections: SectionTable,
    /// Currently-loaded symbol file, if any.
    pub symfile: Option<SymbolFile>,
    targets: Vec<Arc<dyn Target>>,
    threads: Vec<TaskRef>,
    current_thread: Option<TaskRef>,
    process: Option<TaskRef>,
    /// Set while a resume is outstanding and cleared when a fresh process is
    /// created or a wait returns.
    proceed_pending: bool,
}

impl Inferior {
    pub fn new() -> Inferior {
        Inferior::default()
    }

    pub fn process(&self) -> Option<TaskRef> {
        self.process
    }

    pub fn set_process(&mut self, task: TaskRef) {
        self.process = Some(task);
    }

    pub fn clear_process(&mut self) {
        self.process = None;
        self.threads.clear();
        self.current_thread = None;
    }

    /// Push a target layer, topmost last. Pushing is idempotent: the stack
    /// is shared across process restarts and a layer must not stack up on
    /// itself.
    pub fn push_target(&mut self, target: Arc<dyn Target>) {
        self.unpush_target(target.name());
        self.targets.push(target);
    }

    pub fn unpush_target(&mut self, name: &str) {
        self.targets.retain(|t| t.name() != name);
    }

    pub fn target_is_pushed(&self, name: &str) -> bool {
        self.targets.iter().any(|t| t.name() == name)
    }

    pub fn top_target(&self) -> Option<&Arc<dyn Target>> {
        self.targets.last()
    }

    pub fn add_thread(&mut self, task: TaskRef) {
        if !self.threads.contains(&task) {
            self.threads.push(task);
        }
    }

    pub fn switch_to_thread(&mut self, task: TaskRef) {
        self.current_thread = Some(task);
    }

    pub fn current_thread(&self) -> Option<TaskRef> {
        self.current_thread
    }

    pub fn set_proceed_pending(&mut self, pending: bool) {
        self.proceed_pending = pending;
    }

    pub fn proceed_pending(&self) -> bool {
        self.proceed_pending
    }

    /// Reset per-run bookkeeping before the first resume of a new process.
    pub fn clear_proceed_state(&mut self) {
        self.proceed_pending = false;
    }

    /// Layered partial transfer: try each target from the top of the stack
    /// down, moving on while a layer reports the object class unsupported.
    /// With no layer left the transfer fails as an I/O error, which happens
    /// when unsupported objects are requested before a program is started.
    pub fn xfer_partial(
        &self,
        object: TargetObject,
        annex: Option<&str>,
        mut readbuf: Option<&mut [u8]>,
        writebuf: Option<&[u8]>,
        offset: u64,
    ) -> Result<u64, TransferError> {
        for target in self.targets.iter().rev() {
            let attempt = target.xfer_partial(
                object,
                annex,
                readbuf.as_deref_mut(),
                writebuf,
                offset,
            );
            match attempt {
                Err(TransferError::Unsupported) => continue,
                other => return other,
            }
        }
        Err(TransferError::Io)
    }
}

use arc_swap::ArcSwap;
use std::sync::{Arc, LazyLock};
use std::sync::atomic::{AtomicU32, Ordering};

use super::{DebugMessage, HookVerdict, TaskRef};

// The kernel invokes debug hooks on the faulting task's own execution
// context, so resolution must not take a lock that ordinary code holds.
// Hooks register under an integer token; the token -> hook table is a
// snapshot vector swapped atomically, read lock-free at dispatch time.
// Registering a raw pointer with the kernel and downcasting it in the
// upcall would also work, and is how type confusion happens.

/// Token identifying one registered debug hook. This is the value actually
/// handed to the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookToken(pub u32);

/// A debug hook target. The implementation must not block, allocate from
/// general memory, or contend shared locks; it runs on the observed task's
/// thread at trap time.
pub trait DebugHook: Send + Sync {
    fn on_debug_event(&self, task: TaskRef, msg: &DebugMessage) -> HookVerdict;
}

static HOOKS: LazyLock<ArcSwap<Vec<(u32, Arc<dyn DebugHook>)>>> =
    LazyLock::new(|| ArcSwap::from_pointee(Vec::new()));
static NEXT_TOKEN: AtomicU32 = AtomicU32::new(1);

pub fn register(hook: Arc<dyn DebugHook>) -> HookToken {
    let token = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
    // rcu in case two backends register at the same time
    HOOKS.rcu(|current| {
        let mut copy = current.as_ref().clone();
        copy.push((token, Arc::clone(&hook)));
        Arc::new(copy)
    });
    HookToken(token)
}

pub fn unregister(token: HookToken) -> bool {
    let mut removed = false;
    HOOKS.rcu(|current| {
        let copy: Vec<_> = current
            .iter()
            .filter(|(t, _)| *t != token.0)
            .cloned()
            .collect();
        removed = copy.len() != current.len();
        Arc::new(copy)
    });
    removed
}

/// Kernel-side entry point: resolve `token` and run the hook. A stale token
/// resumes the task; a debugger that has torn down must never leave a task
/// parked.
pub fn dispatch(token: HookToken, task: TaskRef, msg: &DebugMessage) -> HookVerdict {
    let hooks = HOOKS.load();
    for (t, hook) in hooks.iter() {
        if *t == token.0 {
            return hook.on_debug_event(task, msg);
        }
    }
    log::warn!("debug hook dispatch for unregistered token {}", token.0);
    HookVerdict::Resume
}

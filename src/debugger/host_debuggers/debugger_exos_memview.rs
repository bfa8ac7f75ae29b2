use std::sync::Arc;

use crate::kernel::{MemoryAttrs, MemoryService, SupervisorToken};
use crate::memory::memview::{MemView, MemViewError};

/// Inferior memory access on a machine where debugger and inferior share
/// one address space. Every access runs inside a supervisor excursion that
/// relaxes the page attributes over the range and restores them on the way
/// out.
pub struct ExosMemView {
    mmu: Arc<dyn MemoryService>,
}

/// Scoped privileged access to `[addr, addr + len)`. Construction snapshots
/// the current attributes and relaxes the range to read-write; dropping the
/// guard restores the attributes and leaves supervisor state, on every exit
/// path including error returns.
struct AttrExcursion<'a> {
    mmu: &'a dyn MemoryService,
    addr: u64,
    len: u64,
    saved: MemoryAttrs,
    user_token: Option<SupervisorToken>,
}

impl<'a> AttrExcursion<'a> {
    fn enter(mmu: &'a dyn MemoryService, addr: u64, len: u64) -> AttrExcursion<'a> {
        let user_token = mmu.super_state();
        let saved = mmu.memory_attrs(addr);
        mmu.set_memory_attrs(addr, len, MemoryAttrs::read_write());
        AttrExcursion {
            mmu,
            addr,
            len,
            saved,
            user_token,
        }
    }
}

impl Drop for AttrExcursion<'_> {
    fn drop(&mut self) {
        self.mmu.set_memory_attrs(self.addr, self.len, self.saved);
        if let Some(token) = self.user_token.take() {
            self.mmu.user_state(token);
        }
    }
}

impl ExosMemView {
    pub fn new(mmu: Arc<dyn MemoryService>) -> ExosMemView {
        ExosMemView { mmu }
    }
}

impl MemView for ExosMemView {
    fn read_bytes(&self, addr: &mut u64, out_data: &mut [u8], count: i32) -> Result<(), MemViewError> {
        if count < 0 || out_data.len() < count as usize {
            return Err(MemViewError::InvalidParameter);
        }
        // stack unwinding probes the saved pc of the outermost frame, which
        // is a null sentinel; that read must fail instead of faulting us
        if *addr == 0 {
            return Err(MemViewError::InvalidParameter);
        }
        let count = count as usize;

        let _excursion = AttrExcursion::enter(self.mmu.as_ref(), *addr, count as u64);
        self.mmu
            .copy_from(*addr, &mut out_data[..count])
            .map_err(|_| MemViewError::ReadAccessDenied)?;

        *addr += count as u64;
        Ok(())
    }

    fn write_bytes(&mut self, addr: &mut u64, value: &[u8]) -> Result<(), MemViewError> {
        if *addr == 0 {
            return Err(MemViewError::InvalidParameter);
        }
        let count = value.len();

        {
            let _excursion = AttrExcursion::enter(self.mmu.as_ref(), *addr, count as u64);
            self.mmu
                .copy_to(*addr, value)
                .map_err(|_| MemViewError::WriteAccessDenied)?;
            // breakpoints and other code patches must reach the
            // instruction stream before the task runs again
            self.mmu.flush_icache(*addr, count as u64);
        }

        *addr += count as u64;
        Ok(())
    }

    fn can_read_while_running(&self) -> bool {
        true
    }

    fn can_write_while_running(&self) -> bool {
        true
    }
}

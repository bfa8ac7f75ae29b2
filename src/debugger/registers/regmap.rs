use crate::consts::ppc::{register_size, VR0_REGNUM, VRSAVE_REGNUM, VSCR_REGNUM};
use crate::debugger::registers::registers::RegCache;

/// One run of same-sized slots in a raw register-set image.
#[derive(Clone, Copy)]
pub struct RegsetEntry {
    pub count: u32,
    pub regno: i32,
    pub slot_size: usize,
}

impl RegsetEntry {
    pub const fn new(count: u32, regno: i32, slot_size: usize) -> RegsetEntry {
        RegsetEntry {
            count,
            regno,
            slot_size,
        }
    }
}

// Layout of the vector group as captured in a machine exception context:
// one 16-byte status slot, the 32 vector registers, then the save word.
#[rustfmt::skip]
pub const VRREGMAP: [RegsetEntry; 3] = [
    RegsetEntry::new(1,  VSCR_REGNUM,   16),
    RegsetEntry::new(32, VR0_REGNUM,    16),
    RegsetEntry::new(1,  VRSAVE_REGNUM,  4),
];

pub const SIZEOF_VRREGSET: usize = 532;

const _: () = {
    let mut total = 0usize;
    let mut i = 0;
    while i < VRREGMAP.len() {
        total += VRREGMAP[i].count as usize * VRREGMAP[i].slot_size;
        i += 1;
    }
    assert!(total == SIZEOF_VRREGSET);
};

/// Supply registers described by `map` from a raw regset image. With
/// `regno` set only that register is transferred. Slots wider than the
/// register transfer the register's size from the slot start.
pub fn supply_regset(map: &[RegsetEntry], cache: &mut RegCache, regno: Option<i32>, data: &[u8]) {
    let mut offset = 0usize;
    for entry in map {
        for i in 0..entry.count as i32 {
            let reg = entry.regno + i;
            let size = register_size(reg).min(entry.slot_size);
            if regno.is_none() || regno == Some(reg) {
                cache.raw_supply(reg, &data[offset..offset + size]);
            }
            offset += entry.slot_size;
        }
    }
}

/// Collect registers described by `map` into a raw regset image; the
/// inverse of `supply_regset`.
pub fn collect_regset(map: &[RegsetEntry], cache: &RegCache, regno: Option<i32>, out: &mut [u8]) {
    let mut offset = 0usize;
    for entry in map {
        for i in 0..entry.count as i32 {
            let reg = entry.regno + i;
            let size = register_size(reg).min(entry.slot_size);
            if regno.is_none() || regno == Some(reg) {
                cache.raw_collect(reg, &mut out[offset..offset + size]);
            }
            offset += entry.slot_size;
        }
    }
}

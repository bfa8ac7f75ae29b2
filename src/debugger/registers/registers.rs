use crate::consts::arch::Endianness;
use crate::consts::ppc::{register_name, register_size, NUM_REGS};

/// Raw register cache with the architecture's fixed layout. The backend
/// supplies bytes captured from a machine exception context; the debugger
/// core collects them by register number.
pub struct RegCache {
    offsets: Vec<usize>,
    data: Vec<u8>,
    valid: Vec<bool>,
    endian: Endianness,
}

impl RegCache {
    pub fn new() -> RegCache {
        let mut offsets = Vec::with_capacity(NUM_REGS as usize);
        let mut total = 0usize;
        for regno in 0..NUM_REGS {
            offsets.push(total);
            total += register_size(regno);
        }
        RegCache {
            offsets,
            data: vec![0; total],
            valid: vec![false; NUM_REGS as usize],
            endian: Endianness::BigEndian,
        }
    }

    pub fn endian(&self) -> Endianness {
        self.endian
    }

    fn range(&self, regno: i32) -> std::ops::Range<usize> {
        assert!(
            regno >= 0 && regno < NUM_REGS,
            "register cache: no such register {}",
            regno
        );
        let start = self.offsets[regno as usize];
        start..start + register_size(regno)
    }

    /// Copy one register's bytes into the cache. `data` must hold at least
    /// the register's size; extra bytes are ignored.
    pub fn raw_supply(&mut self, regno: i32, data: &[u8]) {
        let range = self.range(regno);
        let size = range.len();
        assert!(
            data.len() >= size,
            "register cache: short supply for {} ({} < {})",
            register_name(regno),
            data.len(),
            size
        );
        self.data[range].copy_from_slice(&data[..size]);
        self.valid[regno as usize] = true;
    }

    /// Copy one register's bytes out of the cache.
    pub fn raw_collect(&self, regno: i32, out: &mut [u8]) {
        let range = self.range(regno);
        let size = range.len();
        assert!(
            out.len() >= size,
            "register cache: short collect for {}",
            register_name(regno)
        );
        out[..size].copy_from_slice(&self.data[range]);
    }

    pub fn is_valid(&self, regno: i32) -> bool {
        self.valid[regno as usize]
    }

    /// Read a register as an unsigned value; registers wider than 8 bytes
    /// cannot be read this way.
    pub fn raw_get_unsigned(&self, regno: i32) -> u64 {
        let range = self.range(regno);
        let bytes = &self.data[range];
        assert!(bytes.len() <= 8, "register {} too wide", register_name(regno));
        let mut value = 0u64;
        match self.endian {
            Endianness::BigEndian => {
                for b in bytes {
                    value = (value << 8) | *b as u64;
                }
            }
            Endianness::LittleEndian => {
                for b in bytes.iter().rev() {
                    value = (value << 8) | *b as u64;
                }
            }
        }
        value
    }
}

impl Default for RegCache {
    fn default() -> RegCache {
        RegCache::new()
    }
}

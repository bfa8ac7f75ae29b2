#[derive(PartialEq, Clone, Copy)]
pub enum Endianness {
    LittleEndian,
    BigEndian,
}

#[derive(PartialEq, Clone, Copy)]
pub enum Bitness {
    Bit32,
    Bit64,
}

// Helpers to store multi-byte numbers in on-flash structures
// independent of processor endianness. Everything on flash is
// little-endian.
//
// These take a slice and panic if it is too short, same as indexing.

use byteorder::{ByteOrder, LittleEndian};

pub fn r16(data: &[u8]) -> u16 {
    LittleEndian::read_u16(data)
}

pub fn r32(data: &[u8]) -> u32 {
    LittleEndian::read_u32(data)
}

pub fn w32(data: &mut [u8], v: u32) {
    LittleEndian::write_u32(data, v)
}

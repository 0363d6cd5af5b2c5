//! The packed 32-bit frame header.
//!
//! Layout, from high to low bits:
//!
//! ```text
//! 31       30        29..22     21..14     13..8     7..2      1..0
//! RST      priority  dst node   src node   dst port  src port  ACK,SYN
//! ```
//!
//! The word is serialized to the wire in a fixed little-endian 4-byte
//! layout, so the codec itself is endian-neutral.

use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian};

use crate::HEADER_SIZE;

bitflags! {
    /// Control flags carried by a frame.
    ///
    /// SYN and ACK travel in the two low bits of the header word; RST is
    /// encoded into bit 31 on pack and rematerialized into the high bit of
    /// the flags byte on unpack.
    pub struct Flags: u8 {
        const SYN = 0b0000_0001;
        const ACK = 0b0000_0010;
        const RST = 0b1000_0000;
    }
}

/// Transmit priority of a frame. Carried in bit 30 of the header word and
/// dropped on unpack; receivers do not act on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Normal,
    High,
}

const PORT_MASK: u32 = 0x3f;

/// The addressing fields of one frame. Ports are 6 bits wide, nodes 8 bits;
/// `pack` masks wider values down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub dst_node: u8,
    pub src_node: u8,
    pub dst_port: u8,
    pub src_port: u8,
    pub flags: Flags,
}

impl Header {
    pub fn new(dst_node: u8, src_node: u8, dst_port: u8, src_port: u8, flags: Flags) -> Header {
        Header {
            dst_node,
            src_node,
            dst_port,
            src_port,
            flags,
        }
    }

    /// Packs the header into its on-wire word.
    pub fn pack(&self, priority: Priority) -> u32 {
        let mut word = 0u32;
        if self.flags.contains(Flags::RST) {
            word |= 1 << 31;
        }
        if priority == Priority::High {
            word |= 1 << 30;
        }
        word |= u32::from(self.dst_node) << 22;
        word |= u32::from(self.src_node) << 14;
        word |= (u32::from(self.dst_port) & PORT_MASK) << 8;
        word |= (u32::from(self.src_port) & PORT_MASK) << 2;
        word |= u32::from((self.flags & (Flags::SYN | Flags::ACK)).bits());
        word
    }

    /// Unpacks an on-wire word. The priority bit is not reported.
    pub fn unpack(word: u32) -> Header {
        let mut flags = Flags::from_bits_truncate((word & 0b11) as u8);
        if word & (1 << 31) != 0 {
            flags |= Flags::RST;
        }
        Header {
            dst_node: (word >> 22) as u8,
            src_node: (word >> 14) as u8,
            dst_port: ((word >> 8) & PORT_MASK) as u8,
            src_port: ((word >> 2) & PORT_MASK) as u8,
            flags,
        }
    }
}

/// Reads the header word out of the first four bytes of a frame.
pub fn read_word(frame: &[u8]) -> u32 {
    LittleEndian::read_u32(&frame[..HEADER_SIZE])
}

/// Writes the header word into the first four bytes of a frame buffer.
pub fn write_word(word: u32, frame: &mut [u8]) {
    LittleEndian::write_u32(&mut frame[..HEADER_SIZE], word);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_round_trip() {
        let nodes = [0u8, 1, 18, 171, 254, 255];
        let ports = [0u8, 1, 12, 45, 62, 63];
        let flag_sets = [
            Flags::empty(),
            Flags::SYN,
            Flags::ACK,
            Flags::RST,
            Flags::SYN | Flags::ACK,
            Flags::RST | Flags::ACK,
        ];
        for &dst_node in &nodes {
            for &src_node in &nodes {
                for &dst_port in &ports {
                    for &src_port in &ports {
                        for &flags in &flag_sets {
                            let header = Header::new(dst_node, src_node, dst_port, src_port, flags);
                            assert_eq!(Header::unpack(header.pack(Priority::Normal)), header);
                            assert_eq!(Header::unpack(header.pack(Priority::High)), header);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn syn_round_trip() {
        let header = Header::new(171, 18, 45, 12, Flags::SYN);
        let unpacked = Header::unpack(header.pack(Priority::High));
        assert_eq!(unpacked.dst_node, 171);
        assert_eq!(unpacked.src_node, 18);
        assert_eq!(unpacked.dst_port, 45);
        assert_eq!(unpacked.src_port, 12);
        assert_eq!(unpacked.flags, Flags::SYN);
    }

    #[test]
    fn rst_occupies_bit_31() {
        let header = Header::new(0, 0, 0, 0, Flags::RST);
        assert_eq!(header.pack(Priority::Normal), 1 << 31);
        assert!(Header::unpack(1 << 31).flags.contains(Flags::RST));
    }

    #[test]
    fn field_positions() {
        let word = Header::new(0xab, 0x12, 45, 12, Flags::SYN).pack(Priority::High);
        assert_eq!(word >> 30, 0b01);
        assert_eq!((word >> 22) & 0xff, 0xab);
        assert_eq!((word >> 14) & 0xff, 0x12);
        assert_eq!((word >> 8) & 0x3f, 45);
        assert_eq!((word >> 2) & 0x3f, 12);
        assert_eq!(word & 0b11, 0b01);
    }

    #[test]
    fn wide_ports_are_masked() {
        let header = Header::new(1, 2, 64 + 3, 64 + 4, Flags::empty());
        let unpacked = Header::unpack(header.pack(Priority::Normal));
        assert_eq!(unpacked.dst_port, 3);
        assert_eq!(unpacked.src_port, 4);
    }

    #[test]
    fn wire_layout_is_little_endian() {
        let mut frame = [0u8; 4];
        write_word(0x0403_0201, &mut frame);
        assert_eq!(frame, [0x01, 0x02, 0x03, 0x04]);
        assert_eq!(read_word(&frame), 0x0403_0201);
    }
}

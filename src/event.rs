//! 64-bit event word codec.
//!
//! # Layout
//!
//! Every logged operation is one little-endian 64-bit word:
//!
//! ```text
//! 63      60 59      52 51            32 31                    0
//! +--------+----------+----------------+-----------------------+
//! | header | value_lo |    src_loc     |        address        |
//! +--------+----------+----------------+-----------------------+
//!   4 bits   8 bits       20 bits            32 bits
//! ```
//!
//! - `header`: event kind tag. `0b0001` is a timestamp; memory accesses use
//!   `0b1·W·SS` where `W` is the write bit and `SS` the log2 of the access
//!   size in bytes.
//! - `value_lo`: low 8 bits of the value stored or loaded.
//! - `src_loc`: instrumentation-site identifier truncated to 20 bits
//!   (~1M distinct sites). Collisions are legal and disambiguated offline.
//! - `address`: low 32 bits of the target address. For timestamp events,
//!   the low 32 bits of a cycle counter instead. The analyzer reconstructs
//!   the upper address bits from per-process mapping metadata.
//!
//! Encoding and decoding are pure and total; reserved header tags decode to
//! [`Event::Reserved`] rather than failing.

/// Bit position of the 4-bit header tag.
const HEADER_SHIFT: u32 = 60;
/// Bit position of the low value byte.
const VALUE_SHIFT: u32 = 52;
/// Bit position of the truncated source-location ID.
const SRC_LOC_SHIFT: u32 = 32;

/// Width of the source-location field.
pub const SRC_LOC_BITS: u32 = 20;

const VALUE_MASK: u64 = 0xFF;
const SRC_LOC_MASK: u64 = (1 << SRC_LOC_BITS) - 1;
const ADDR_MASK: u64 = 0xFFFF_FFFF;

/// Header tag of a timestamp event.
const HDR_TIMESTAMP: u64 = 0b0001;
/// Set on every memory-access tag.
const HDR_MEM_ACCESS_BIT: u64 = 0b1000;
/// Set on write accesses, clear on reads.
const HDR_WRITE_BIT: u64 = 0b0100;

/// Access width of a memory-access event, stored as log2 of the byte size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum AccessSize {
    B1 = 0,
    B2 = 1,
    B4 = 2,
    B8 = 3,
}

impl AccessSize {
    /// Width in bytes.
    #[inline]
    pub fn bytes(self) -> usize {
        1 << self as usize
    }

    #[inline]
    fn from_log2(log2: u64) -> Self {
        match log2 & 0b11 {
            0 => AccessSize::B1,
            1 => AccessSize::B2,
            2 => AccessSize::B4,
            _ => AccessSize::B8,
        }
    }
}

/// A decoded event word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    /// Periodic cycle-counter sample; only the low 32 bits survive.
    Timestamp { cycles_lo: u32 },

    /// One instrumented load or store.
    MemAccess {
        is_write: bool,
        size: AccessSize,
        /// Truncated instrumentation-site ID (20 bits).
        src_loc: u32,
        /// Low 32 bits of the accessed address.
        addr_lo: u32,
        /// Low 8 bits of the value loaded or stored.
        value_lo: u8,
    },

    /// Header tag outside the defined set. Kept so a consumer can skip the
    /// word and keep its cursor aligned.
    Reserved { header: u8 },
}

/// Pack one memory access into an event word.
///
/// `pc` keeps its low 20 bits, `addr` its low 32, `value` its low 8; all
/// other source bits are discarded.
#[inline(always)]
pub fn encode_mem_access(
    is_write: bool,
    size: AccessSize,
    pc: u64,
    addr: u64,
    value: u64,
) -> u64 {
    let header = HDR_MEM_ACCESS_BIT
        | if is_write { HDR_WRITE_BIT } else { 0 }
        | size as u64;
    (header << HEADER_SHIFT)
        | ((value & VALUE_MASK) << VALUE_SHIFT)
        | ((pc & SRC_LOC_MASK) << SRC_LOC_SHIFT)
        | (addr & ADDR_MASK)
}

/// Pack a cycle-counter sample into an event word.
#[inline(always)]
pub fn encode_timestamp(cycles: u64) -> u64 {
    (HDR_TIMESTAMP << HEADER_SHIFT) | (cycles & ADDR_MASK)
}

/// Unpack an event word.
#[inline]
pub fn decode(word: u64) -> Event {
    let header = word >> HEADER_SHIFT;
    if header & HDR_MEM_ACCESS_BIT != 0 {
        Event::MemAccess {
            is_write: header & HDR_WRITE_BIT != 0,
            size: AccessSize::from_log2(header),
            src_loc: ((word >> SRC_LOC_SHIFT) & SRC_LOC_MASK) as u32,
            addr_lo: (word & ADDR_MASK) as u32,
            value_lo: ((word >> VALUE_SHIFT) & VALUE_MASK) as u8,
        }
    } else if header == HDR_TIMESTAMP {
        Event::Timestamp {
            cycles_lo: (word & ADDR_MASK) as u32,
        }
    } else {
        Event::Reserved {
            header: header as u8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write8_round_trip() {
        let word = encode_mem_access(true, AccessSize::B8, 0xDEAD_BEEF, 0x7FFF_1234_5678, 0xAB);
        assert_eq!(
            decode(word),
            Event::MemAccess {
                is_write: true,
                size: AccessSize::B8,
                src_loc: 0xDEAD_BEEF & 0xF_FFFF,
                addr_lo: 0x1234_5678,
                value_lo: 0xAB,
            }
        );
    }

    #[test]
    fn read_sizes_round_trip() {
        for size in [AccessSize::B1, AccessSize::B2, AccessSize::B4, AccessSize::B8] {
            let word = encode_mem_access(false, size, 7, 0x1000, 0x11);
            match decode(word) {
                Event::MemAccess {
                    is_write,
                    size: got,
                    ..
                } => {
                    assert!(!is_write);
                    assert_eq!(got, size);
                }
                other => panic!("decoded {other:?}"),
            }
        }
    }

    #[test]
    fn fields_are_masked() {
        // Every field saturated: only the low bits must survive.
        let word = encode_mem_access(false, AccessSize::B1, u64::MAX, u64::MAX, u64::MAX);
        assert_eq!(
            decode(word),
            Event::MemAccess {
                is_write: false,
                size: AccessSize::B1,
                src_loc: (1 << SRC_LOC_BITS) - 1,
                addr_lo: u32::MAX,
                value_lo: u8::MAX,
            }
        );
    }

    #[test]
    fn timestamp_keeps_low_cycles() {
        let word = encode_timestamp(0xFFFF_0000_1234_5678);
        assert_eq!(decode(word), Event::Timestamp { cycles_lo: 0x1234_5678 });
        // Header tag occupies the top nibble, nothing else set.
        assert_eq!(word >> 32, 0b0001u64 << 28);
    }

    #[test]
    fn reserved_tags_decode_as_reserved() {
        for header in [0b0000u64, 0b0010, 0b0011, 0b0111] {
            let word = header << 60 | 0x1234;
            assert_eq!(decode(word), Event::Reserved { header: header as u8 });
        }
    }

    #[test]
    fn access_size_bytes() {
        assert_eq!(AccessSize::B1.bytes(), 1);
        assert_eq!(AccessSize::B2.bytes(), 2);
        assert_eq!(AccessSize::B4.bytes(), 4);
        assert_eq!(AccessSize::B8.bytes(), 8);
    }
}

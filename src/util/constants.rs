/// log2 of the number of bytes in a kilobyte
pub const LOG_BYTES_IN_KBYTE: u8 = 10;
/// The number of bytes in a kilobyte
pub const BYTES_IN_KBYTE: usize = 1 << LOG_BYTES_IN_KBYTE;

/// log2 of the number of bytes in a megabyte
pub const LOG_BYTES_IN_MBYTE: u8 = 20;
/// The number of bytes in a megabyte
pub const BYTES_IN_MBYTE: usize = 1 << LOG_BYTES_IN_MBYTE;

#[cfg(target_pointer_width = "32")]
/// log2 of the number of bytes in an address
pub const LOG_BYTES_IN_ADDRESS: u8 = 2;
#[cfg(target_pointer_width = "64")]
/// log2 of the number of bytes in an address
pub const LOG_BYTES_IN_ADDRESS: u8 = 3;
/// The number of bytes in an address
pub const BYTES_IN_ADDRESS: usize = 1 << LOG_BYTES_IN_ADDRESS;

/// log2 of the number of bytes in a heap slot. Slots are pointer sized.
pub const LOG_BYTES_IN_SLOT: u8 = LOG_BYTES_IN_ADDRESS;
/// The number of bytes in a heap slot
pub const BYTES_IN_SLOT: usize = 1 << LOG_BYTES_IN_SLOT;

/// The number of bits in a machine word, used by side bitmaps.
pub const BITS_IN_WORD: usize = usize::BITS as usize;

/// Bytes reserved for one external entity table segment.
pub const ENTITY_TABLE_SEGMENT_SIZE: usize = 64 * BYTES_IN_KBYTE;

#[cfg(target_pointer_width = "64")]
/// Bytes reserved for the external pointer table: enough for 2^26 eight byte entries.
pub const EXTERNAL_POINTER_TABLE_RESERVATION_SIZE: usize = 512 * BYTES_IN_MBYTE;
#[cfg(target_pointer_width = "32")]
/// Bytes reserved for the external pointer table.
pub const EXTERNAL_POINTER_TABLE_RESERVATION_SIZE: usize = 32 * BYTES_IN_MBYTE;

/// Handles are 32 bits and encode the entry index shifted left by this amount,
/// so the top of the handle range lines up with the top of the reservation.
pub const EXTERNAL_POINTER_INDEX_SHIFT: u32 =
    32 - (EXTERNAL_POINTER_TABLE_RESERVATION_SIZE / 8).trailing_zeros();

/// The maximum number of entries in an external pointer table.
pub const MAX_EXTERNAL_POINTERS: usize = EXTERNAL_POINTER_TABLE_RESERVATION_SIZE / 8;

/// A space smaller than this is never compacted.
pub const EXTERNAL_POINTER_COMPACTION_MIN_SPACE_SIZE: usize = BYTES_IN_MBYTE;
/// A space is only compacted if at least this percentage of its entries are free.
pub const EXTERNAL_POINTER_COMPACTION_MIN_FREE_PERCENT: usize = 10;

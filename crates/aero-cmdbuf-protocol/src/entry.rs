//! Command buffer entries and command headers.
//!
//! The ring buffer is an array of 4-byte little-endian words. A word is either a
//! [`CommandHeader`] (the first entry of every command) or a raw argument that the
//! command's handler reinterprets as `u32`, `i32` or `f32`.

use bytemuck::{Pod, Zeroable};

/// Size in bytes of one [`CommandBufferEntry`].
pub const COMMAND_BUFFER_ENTRY_SIZE: usize = 4;

/// Number of low header bits holding the command size (in entries).
pub const COMMAND_HEADER_SIZE_BITS: u32 = 21;

/// Number of high header bits holding the command id.
pub const COMMAND_HEADER_ID_BITS: u32 = 11;

const SIZE_MASK: u32 = (1 << COMMAND_HEADER_SIZE_BITS) - 1;

/// One 32-bit word of the command ring.
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct CommandBufferEntry(u32);

impl CommandBufferEntry {
    pub const ZERO: Self = Self(0);

    pub const fn from_u32(v: u32) -> Self {
        Self(v)
    }

    pub const fn from_i32(v: i32) -> Self {
        Self(v as u32)
    }

    pub fn from_f32(v: f32) -> Self {
        Self(v.to_bits())
    }

    pub const fn from_header(header: CommandHeader) -> Self {
        Self(header.0)
    }

    pub const fn value_u32(self) -> u32 {
        self.0
    }

    pub const fn value_i32(self) -> i32 {
        self.0 as i32
    }

    pub fn value_f32(self) -> f32 {
        f32::from_bits(self.0)
    }

    pub const fn header(self) -> CommandHeader {
        CommandHeader(self.0)
    }
}

impl core::fmt::Debug for CommandBufferEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "CommandBufferEntry(0x{:08x})", self.0)
    }
}

/// Packed command header: `size | (command << 21)`.
///
/// `size` counts entries and includes the header itself, so a command with no
/// arguments has size 1. Size 0 never appears in a valid stream.
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct CommandHeader(u32);

impl CommandHeader {
    /// Largest encodable command size, in entries.
    pub const MAX_SIZE: u32 = SIZE_MASK;

    /// Largest encodable command id.
    pub const MAX_COMMAND: u32 = (1 << COMMAND_HEADER_ID_BITS) - 1;

    /// Build a header, returning `None` if either field does not fit its bit range.
    pub const fn new(command: u32, size: u32) -> Option<Self> {
        if command > Self::MAX_COMMAND || size > Self::MAX_SIZE {
            return None;
        }
        Some(Self(size | (command << COMMAND_HEADER_SIZE_BITS)))
    }

    /// Header for a fixed-size command record of `T`.
    pub const fn for_fixed<T>(command: u32) -> Self {
        let size = (core::mem::size_of::<T>() / COMMAND_BUFFER_ENTRY_SIZE) as u32;
        match Self::new(command, size) {
            Some(h) => h,
            None => panic!("fixed command does not fit in a command header"),
        }
    }

    pub const fn from_u32(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn to_u32(self) -> u32 {
        self.0
    }

    pub const fn size(self) -> u32 {
        self.0 & SIZE_MASK
    }

    pub const fn command(self) -> u32 {
        self.0 >> COMMAND_HEADER_SIZE_BITS
    }
}

impl core::fmt::Debug for CommandHeader {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CommandHeader")
            .field("command", &self.command())
            .field("size", &self.size())
            .finish()
    }
}

/// Number of entries needed to hold `size_in_bytes` bytes.
///
/// Saturates at `u32::MAX` entries for pathological inputs.
pub fn compute_num_entries(size_in_bytes: usize) -> u32 {
    let entries = (size_in_bytes as u64).div_ceil(COMMAND_BUFFER_ENTRY_SIZE as u64);
    u32::try_from(entries).unwrap_or(u32::MAX)
}

/// Round `size_in_bytes` up to a whole number of entries. `None` if that overflows.
pub fn round_size_to_multiple_of_entries(size_in_bytes: usize) -> Option<usize> {
    size_in_bytes.checked_next_multiple_of(COMMAND_BUFFER_ENTRY_SIZE)
}

/// Round `value` up to a multiple of the power-of-two `alignment`.
pub const fn align_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (value + (alignment - 1)) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_is_one_word() {
        assert_eq!(core::mem::size_of::<CommandBufferEntry>(), COMMAND_BUFFER_ENTRY_SIZE);
        assert_eq!(core::mem::size_of::<CommandHeader>(), COMMAND_BUFFER_ENTRY_SIZE);
        assert_eq!(COMMAND_HEADER_SIZE_BITS + COMMAND_HEADER_ID_BITS, 32);
    }

    #[test]
    fn header_packs_size_in_low_bits() {
        let h = CommandHeader::new(3, 7).unwrap();
        assert_eq!(h.to_u32(), 7 | (3 << 21));
        assert_eq!(h.size(), 7);
        assert_eq!(h.command(), 3);

        let max = CommandHeader::new(CommandHeader::MAX_COMMAND, CommandHeader::MAX_SIZE).unwrap();
        assert_eq!(max.to_u32(), u32::MAX);
    }

    #[test]
    fn header_rejects_out_of_range_fields() {
        assert!(CommandHeader::new(0, CommandHeader::MAX_SIZE + 1).is_none());
        assert!(CommandHeader::new(CommandHeader::MAX_COMMAND + 1, 1).is_none());
    }

    #[test]
    fn entry_reinterprets_bits() {
        let e = CommandBufferEntry::from_i32(-1);
        assert_eq!(e.value_u32(), u32::MAX);
        assert_eq!(e.value_i32(), -1);

        let f = CommandBufferEntry::from_f32(1.5);
        assert_eq!(f.value_f32(), 1.5);
        assert_eq!(f.value_u32(), 1.5f32.to_bits());
    }

    #[test]
    fn num_entries_rounds_up() {
        assert_eq!(compute_num_entries(0), 0);
        assert_eq!(compute_num_entries(1), 1);
        assert_eq!(compute_num_entries(4), 1);
        assert_eq!(compute_num_entries(5), 2);
        assert_eq!(round_size_to_multiple_of_entries(0), Some(0));
        assert_eq!(round_size_to_multiple_of_entries(9), Some(12));
        assert_eq!(round_size_to_multiple_of_entries(12), Some(12));
        assert_eq!(round_size_to_multiple_of_entries(usize::MAX - 3), Some(usize::MAX - 3));
        assert_eq!(round_size_to_multiple_of_entries(usize::MAX - 2), None);
    }

    #[test]
    fn align_up_rounds_to_multiple() {
        assert_eq!(align_up(0, 4), 0);
        assert_eq!(align_up(1, 4), 4);
        assert_eq!(align_up(5, 16), 16);
        assert_eq!(align_up(256, 256), 256);
    }
}

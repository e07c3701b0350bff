//! The common command set shared by every command-buffer consumer.
//!
//! Ids `0..=255` are reserved for this table; extension command sets start at
//! [`FIRST_EXTENSION_COMMAND_ID`]. The table is append-only.

use core::mem::size_of;

use bytemuck::{Pod, Zeroable};

use crate::entry::{compute_num_entries, CommandBufferEntry, CommandHeader, COMMAND_BUFFER_ENTRY_SIZE};
use crate::error::CommandError;

/// Highest id reserved for the common command set.
pub const LAST_COMMON_COMMAND_ID: u32 = 255;

/// First id available to extension command sets.
pub const FIRST_EXTENSION_COMMAND_ID: u32 = 256;

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandId {
    Noop = 0,
    SetToken = 1,
    SetBucketSize = 2,
    SetBucketData = 3,
    SetBucketDataImmediate = 4,
    GetBucketStart = 5,
    GetBucketData = 6,
}

impl CommandId {
    pub const fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Noop),
            1 => Some(Self::SetToken),
            2 => Some(Self::SetBucketSize),
            3 => Some(Self::SetBucketData),
            4 => Some(Self::SetBucketDataImmediate),
            5 => Some(Self::GetBucketStart),
            6 => Some(Self::GetBucketData),
            _ => None,
        }
    }

    pub fn info(self) -> &'static CommandInfo {
        &COMMON_COMMANDS[self as usize]
    }

    pub fn name(self) -> &'static str {
        self.info().name
    }
}

/// How a command's argument count is validated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgFlags {
    /// Exactly `arg_count` argument entries.
    Fixed,
    /// At least `arg_count` argument entries.
    AtLeastN,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommandInfo {
    pub id: CommandId,
    pub name: &'static str,
    pub arg_flags: ArgFlags,
    /// Argument entries, not counting the header.
    pub arg_count: u32,
}

impl CommandInfo {
    pub fn accepts_arg_count(&self, arg_count: u32) -> bool {
        match self.arg_flags {
            ArgFlags::Fixed => arg_count == self.arg_count,
            ArgFlags::AtLeastN => arg_count >= self.arg_count,
        }
    }
}

/// Indexed by command id.
pub static COMMON_COMMANDS: [CommandInfo; 7] = [
    CommandInfo {
        id: CommandId::Noop,
        name: "Noop",
        arg_flags: ArgFlags::AtLeastN,
        arg_count: 0,
    },
    CommandInfo {
        id: CommandId::SetToken,
        name: "SetToken",
        arg_flags: ArgFlags::Fixed,
        arg_count: SetToken::ARG_COUNT,
    },
    CommandInfo {
        id: CommandId::SetBucketSize,
        name: "SetBucketSize",
        arg_flags: ArgFlags::Fixed,
        arg_count: SetBucketSize::ARG_COUNT,
    },
    CommandInfo {
        id: CommandId::SetBucketData,
        name: "SetBucketData",
        arg_flags: ArgFlags::Fixed,
        arg_count: SetBucketData::ARG_COUNT,
    },
    CommandInfo {
        id: CommandId::SetBucketDataImmediate,
        name: "SetBucketDataImmediate",
        arg_flags: ArgFlags::AtLeastN,
        arg_count: SetBucketDataImmediate::ARG_COUNT,
    },
    CommandInfo {
        id: CommandId::GetBucketStart,
        name: "GetBucketStart",
        arg_flags: ArgFlags::Fixed,
        arg_count: GetBucketStart::ARG_COUNT,
    },
    CommandInfo {
        id: CommandId::GetBucketData,
        name: "GetBucketData",
        arg_flags: ArgFlags::Fixed,
        arg_count: GetBucketData::ARG_COUNT,
    },
];

pub fn common_command_info(id: u32) -> Option<&'static CommandInfo> {
    CommandId::from_u32(id).map(CommandId::info)
}

/// Name of a common command, or `"unknown"` for ids outside the table.
pub fn common_command_name(id: u32) -> &'static str {
    common_command_info(id).map_or("unknown", |info| info.name)
}

/// A `#[repr(C)]` command record whose first field is its [`CommandHeader`].
pub trait FixedCommand: Pod {
    const COMMAND_ID: u32;
    const ARG_COUNT: u32 = (size_of::<Self>() / COMMAND_BUFFER_ENTRY_SIZE) as u32 - 1;

    /// The record as ring-buffer entries, header included.
    fn as_entries(&self) -> &[CommandBufferEntry] {
        bytemuck::cast_slice(core::slice::from_ref(self))
    }

    /// Decode a record from a full command (header included).
    ///
    /// Trailing entries beyond the record are ignored so variable-length commands can
    /// decode their fixed prefix.
    fn decode(entries: &[CommandBufferEntry]) -> Result<Self, CommandError> {
        let len = size_of::<Self>() / COMMAND_BUFFER_ENTRY_SIZE;
        let prefix = entries
            .get(..len)
            .ok_or(CommandError::InvalidArguments("command record truncated"))?;
        Ok(bytemuck::pod_read_unaligned(bytemuck::cast_slice(prefix)))
    }
}

macro_rules! fixed_command {
    ($ty:ident, $id:expr) => {
        impl FixedCommand for $ty {
            const COMMAND_ID: u32 = $id as u32;
        }

        impl $ty {
            pub const HEADER: CommandHeader = CommandHeader::for_fixed::<$ty>($id as u32);
        }
    };
}

/// Header-only record. The header's size may cover any number of skipped entries.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct Noop {
    pub header: CommandHeader,
}

fixed_command!(Noop, CommandId::Noop);

impl Noop {
    /// Header for a Noop that skips `skip_count` trailing entries.
    pub const fn header_for_skip(skip_count: u32) -> Option<CommandHeader> {
        match skip_count.checked_add(1) {
            Some(size) => CommandHeader::new(CommandId::Noop as u32, size),
            None => None,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct SetToken {
    pub header: CommandHeader,
    pub token: i32,
}

fixed_command!(SetToken, CommandId::SetToken);

impl SetToken {
    pub const fn new(token: i32) -> Self {
        Self {
            header: Self::HEADER,
            token,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct SetBucketSize {
    pub header: CommandHeader,
    pub bucket_id: u32,
    pub size: u32,
}

fixed_command!(SetBucketSize, CommandId::SetBucketSize);

impl SetBucketSize {
    pub const fn new(bucket_id: u32, size: u32) -> Self {
        Self {
            header: Self::HEADER,
            bucket_id,
            size,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct SetBucketData {
    pub header: CommandHeader,
    pub bucket_id: u32,
    pub offset: u32,
    pub size: u32,
    pub shared_memory_id: i32,
    pub shared_memory_offset: u32,
}

fixed_command!(SetBucketData, CommandId::SetBucketData);

impl SetBucketData {
    pub const fn new(
        bucket_id: u32,
        offset: u32,
        size: u32,
        shared_memory_id: i32,
        shared_memory_offset: u32,
    ) -> Self {
        Self {
            header: Self::HEADER,
            bucket_id,
            offset,
            size,
            shared_memory_id,
            shared_memory_offset,
        }
    }
}

/// Fixed prefix of SetBucketDataImmediate; `size` bytes of data follow, padded to whole entries.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct SetBucketDataImmediate {
    pub header: CommandHeader,
    pub bucket_id: u32,
    pub offset: u32,
    pub size: u32,
}

fixed_command!(SetBucketDataImmediate, CommandId::SetBucketDataImmediate);

impl SetBucketDataImmediate {
    /// Prefix for a command carrying `size` bytes of inline data.
    ///
    /// Returns `None` if the data does not fit in a single command.
    pub fn new(bucket_id: u32, offset: u32, size: u32) -> Option<Self> {
        let total = Self::total_entries(size)?;
        Some(Self {
            header: CommandHeader::new(Self::COMMAND_ID, total)?,
            bucket_id,
            offset,
            size,
        })
    }

    /// Total command size in entries, header and padded data included.
    pub fn total_entries(data_size: u32) -> Option<u32> {
        let prefix = (size_of::<Self>() / COMMAND_BUFFER_ENTRY_SIZE) as u32;
        prefix.checked_add(compute_num_entries(data_size as usize))
    }

    /// Split a full command into its prefix and the `size` bytes of inline data.
    pub fn decode_with_data(
        entries: &[CommandBufferEntry],
    ) -> Result<(Self, &[u8]), CommandError> {
        let prefix = Self::decode(entries)?;
        let data: &[u8] =
            bytemuck::cast_slice(&entries[size_of::<Self>() / COMMAND_BUFFER_ENTRY_SIZE..]);
        let data = data
            .get(..prefix.size as usize)
            .ok_or(CommandError::InvalidArguments("immediate data exceeds command size"))?;
        Ok((prefix, data))
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct GetBucketStart {
    pub header: CommandHeader,
    pub bucket_id: u32,
    /// Transfer buffer receiving the bucket size as a `u32`; the word must be 0 on entry.
    pub result_memory_id: i32,
    pub result_memory_offset: u32,
    /// Bytes of bucket data to copy out immediately (may be 0).
    pub data_memory_size: u32,
    pub data_memory_id: i32,
    pub data_memory_offset: u32,
}

fixed_command!(GetBucketStart, CommandId::GetBucketStart);

impl GetBucketStart {
    pub const fn new(
        bucket_id: u32,
        result_memory_id: i32,
        result_memory_offset: u32,
        data_memory_size: u32,
        data_memory_id: i32,
        data_memory_offset: u32,
    ) -> Self {
        Self {
            header: Self::HEADER,
            bucket_id,
            result_memory_id,
            result_memory_offset,
            data_memory_size,
            data_memory_id,
            data_memory_offset,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct GetBucketData {
    pub header: CommandHeader,
    pub bucket_id: u32,
    pub offset: u32,
    pub size: u32,
    pub shared_memory_id: i32,
    pub shared_memory_offset: u32,
}

fixed_command!(GetBucketData, CommandId::GetBucketData);

impl GetBucketData {
    pub const fn new(
        bucket_id: u32,
        offset: u32,
        size: u32,
        shared_memory_id: i32,
        shared_memory_offset: u32,
    ) -> Self {
        Self {
            header: Self::HEADER,
            bucket_id,
            offset,
            size,
            shared_memory_id,
            shared_memory_offset,
        }
    }
}

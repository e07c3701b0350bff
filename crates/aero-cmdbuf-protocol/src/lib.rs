//! Wire format of the Aero command-buffer channel.
//!
//! A producer writes commands into a ring of 32-bit entries living in shared memory; a
//! consumer parses them and reports progress through a small published state. This crate
//! holds the definitions both sides agree on:
//!
//! - [`CommandBufferEntry`] / [`CommandHeader`]: the entry word and `size | id << 21` header
//! - [`COMMON_COMMANDS`]: the base command table and its `#[repr(C)]` records
//! - [`ErrorCode`] / [`ContextLostReason`]: numeric codes published to the producer
//! - [`SharedState`]: seqlock-published `{get, token, error}` state
//! - [`Buffer`]: bounds-checked views into [`SharedMemory`]
//! - [`CommandBuffer`]: the producer's transport contract

mod buffer;
mod cmd;
mod command_buffer;
mod entry;
mod error;
mod shared_state;

pub use buffer::{Buffer, BufferAccessError, SharedMemory};
pub use cmd::{
    common_command_info, common_command_name, ArgFlags, CommandId, CommandInfo, FixedCommand,
    GetBucketData, GetBucketStart, Noop, SetBucketData, SetBucketDataImmediate, SetBucketSize,
    SetToken, COMMON_COMMANDS, FIRST_EXTENSION_COMMAND_ID, LAST_COMMON_COMMAND_ID,
};
pub use command_buffer::{in_range, CommandBuffer};
pub use entry::{
    align_up, compute_num_entries, round_size_to_multiple_of_entries, CommandBufferEntry,
    CommandHeader, COMMAND_BUFFER_ENTRY_SIZE, COMMAND_HEADER_ID_BITS, COMMAND_HEADER_SIZE_BITS,
};
pub use error::{CommandError, ContextLostReason, ErrorCode};
pub use shared_state::{
    state_index, SharedState, State, SHARED_STATE_GENERATION_BUSY_BIT, SHARED_STATE_U32_LEN,
};

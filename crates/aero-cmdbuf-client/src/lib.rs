//! Producer side of the Aero command-buffer channel.
//!
//! - [`CommandBufferHelper`]: writes commands into the ring, flushes, inserts and waits on tokens
//! - [`RingBuffer`]: circular sub-allocator reclaimed behind tokens
//! - [`TransferBuffer`]: one growable transfer buffer for streaming uploads
//! - [`MappedMemoryManager`]: pools small allocations across many transfer buffers

mod config;
mod helper;
mod mapped_memory;
mod ring_buffer;
mod transfer_buffer;

pub use config::{HelperConfig, MappedMemoryConfig, TransferBufferConfig};
pub use helper::{CommandBufferHelper, CommandSpace};
pub use mapped_memory::{MappedAllocation, MappedMemoryManager};
pub use ring_buffer::{
    Allocation, BlockInfo, BlockState, RingBuffer, RingBufferError, TokenTracker,
};
pub use transfer_buffer::TransferBuffer;

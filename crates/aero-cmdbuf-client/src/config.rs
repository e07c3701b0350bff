use std::time::Duration;

#[derive(Clone, Debug)]
pub struct HelperConfig {
    /// Flush automatically when too many entries are pending, and periodically.
    pub automatic_flushes: bool,
    /// Number of issued commands between checks of `periodic_flush_delay`.
    pub commands_per_flush_check: u32,
    /// Flush if this much time passed since the last flush when a check runs.
    pub periodic_flush_delay: Duration,
    /// While the service is idle (get has caught up with the last flush), at most
    /// `capacity / auto_flush_small_divisor` entries stay unflushed.
    pub auto_flush_small_divisor: u32,
    /// While the service is still busy, at most `capacity / auto_flush_big_divisor`
    /// entries stay unflushed.
    pub auto_flush_big_divisor: u32,
}

impl Default for HelperConfig {
    fn default() -> Self {
        Self {
            automatic_flushes: true,
            commands_per_flush_check: 100,
            periodic_flush_delay: Duration::from_micros(1_000_000 / 300),
            auto_flush_small_divisor: 16,
            auto_flush_big_divisor: 2,
        }
    }
}

#[derive(Clone, Debug)]
pub struct TransferBufferConfig {
    pub default_buffer_size: usize,
    pub min_buffer_size: usize,
    pub max_buffer_size: usize,
    /// Bytes reserved at the start of the buffer for command results.
    pub result_size: usize,
    pub alignment: usize,
}

impl Default for TransferBufferConfig {
    fn default() -> Self {
        Self {
            default_buffer_size: 64 * 1024,
            min_buffer_size: 16 * 1024,
            max_buffer_size: 16 * 1024 * 1024,
            result_size: 16,
            alignment: 16,
        }
    }
}

#[derive(Clone, Debug)]
pub struct MappedMemoryConfig {
    /// New chunks are rounded up to a multiple of this many bytes.
    pub chunk_size_multiple: usize,
    /// Once this many bytes are free (or pending), allocation waits on pending tokens
    /// instead of growing. `None` never waits.
    pub unused_memory_reclaim_limit: Option<usize>,
    /// Hard cap on bytes held by all chunks. `None` is unbounded.
    pub max_allocated_bytes: Option<usize>,
    pub alignment: usize,
}

impl Default for MappedMemoryConfig {
    fn default() -> Self {
        Self {
            chunk_size_multiple: 64 * 1024,
            unused_memory_reclaim_limit: None,
            max_allocated_bytes: None,
            alignment: 16,
        }
    }
}

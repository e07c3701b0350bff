//! Registry of shared-memory transfer buffers, keyed by client-chosen id.

use std::collections::HashMap;

use aero_cmdbuf_protocol::Buffer;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransferBufferStats {
    pub buffer_count: usize,
    pub bytes_allocated: usize,
}

#[derive(Debug, Default)]
pub struct TransferBufferManager {
    registered: HashMap<i32, Buffer>,
    shared_memory_bytes_allocated: usize,
}

impl TransferBufferManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `buffer` under `id`.
    ///
    /// Fails for ids <= 0, ids already registered, and buffers that do not start on an
    /// entry boundary.
    pub fn register_transfer_buffer(&mut self, id: i32, buffer: Buffer) -> bool {
        if id <= 0 {
            tracing::warn!(id, "rejecting transfer buffer with non-positive id");
            return false;
        }
        if self.registered.contains_key(&id) {
            tracing::warn!(id, "rejecting duplicate transfer buffer id");
            return false;
        }
        if !buffer.is_aligned() {
            tracing::warn!(id, offset = buffer.offset(), "rejecting misaligned transfer buffer");
            return false;
        }

        self.shared_memory_bytes_allocated += buffer.size();
        self.registered.insert(id, buffer);
        true
    }

    /// Unregister `id`. Unknown ids are ignored.
    pub fn destroy_transfer_buffer(&mut self, id: i32) {
        match self.registered.remove(&id) {
            Some(buffer) => {
                self.shared_memory_bytes_allocated -= buffer.size();
            }
            None => {
                tracing::debug!(id, "destroying unknown transfer buffer");
            }
        }
    }

    /// The buffer registered as `id`. Id 0 is never registered.
    pub fn get_transfer_buffer(&self, id: i32) -> Option<Buffer> {
        self.registered.get(&id).cloned()
    }

    pub fn shared_memory_bytes_allocated(&self) -> usize {
        self.shared_memory_bytes_allocated
    }

    pub fn len(&self) -> usize {
        self.registered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registered.is_empty()
    }

    pub fn stats(&self) -> TransferBufferStats {
        TransferBufferStats {
            buffer_count: self.registered.len(),
            bytes_allocated: self.shared_memory_bytes_allocated,
        }
    }
}

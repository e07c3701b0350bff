//! A single growable transfer buffer for streaming uploads.
//!
//! The first `result_size` bytes are a result area the service writes replies into; the
//! rest is managed by a [`RingBuffer`] so uploads can be freed behind tokens.

use aero_cmdbuf_protocol::{Buffer, CommandBuffer};

use crate::config::TransferBufferConfig;
use crate::helper::CommandBufferHelper;
use crate::ring_buffer::{Allocation, RingBuffer, RingBufferError};

#[derive(Debug)]
pub struct TransferBuffer {
    config: TransferBufferConfig,
    buffer_id: i32,
    buffer: Option<Buffer>,
    ring: Option<RingBuffer>,
    usable: bool,
}

impl TransferBuffer {
    pub fn new(config: TransferBufferConfig) -> Self {
        Self {
            config,
            buffer_id: -1,
            buffer: None,
            ring: None,
            usable: true,
        }
    }

    /// Create the initial buffer at the configured default size.
    pub fn initialize<C: CommandBuffer>(&mut self, helper: &mut CommandBufferHelper<C>) -> bool {
        let size = self.config.default_buffer_size;
        self.allocate(helper, size);
        self.have_buffer()
    }

    pub fn have_buffer(&self) -> bool {
        self.buffer.is_some()
    }

    /// False once every size down to `min_buffer_size` failed to allocate.
    pub fn usable(&self) -> bool {
        self.usable
    }

    pub fn shm_id(&self) -> i32 {
        self.buffer_id
    }

    pub fn buffer(&self) -> Option<&Buffer> {
        self.buffer.as_ref()
    }

    /// Offset of the result area within the buffer.
    pub fn result_offset(&self) -> usize {
        0
    }

    pub fn result_size(&self) -> usize {
        self.config.result_size
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer.as_ref().map_or(0, Buffer::size)
    }

    /// Largest allocation possible without replacing the buffer.
    pub fn current_max_allocation_without_realloc(&self) -> usize {
        self.ring
            .as_ref()
            .map_or(0, RingBuffer::largest_free_or_pending_size)
    }

    /// Largest allocation possible at all.
    pub fn max_allocation(&self) -> usize {
        self.config
            .max_buffer_size
            .saturating_sub(self.config.result_size)
    }

    fn allocate<C: CommandBuffer>(&mut self, helper: &mut CommandBufferHelper<C>, size: usize) {
        let mut size = size;
        while size >= self.config.min_buffer_size && size > self.config.result_size {
            if let Some((id, buffer)) = helper.command_buffer_mut().create_transfer_buffer(size) {
                self.ring = Some(RingBuffer::new(
                    self.config.alignment,
                    self.config.result_size,
                    buffer.size() - self.config.result_size,
                ));
                self.buffer_id = id;
                self.buffer = Some(buffer);
                tracing::debug!(id, size, "allocated transfer buffer");
                return;
            }
            size /= 2;
        }
        tracing::warn!(size = self.config.min_buffer_size, "unable to allocate a transfer buffer");
        self.usable = false;
    }

    fn reallocate<C: CommandBuffer>(&mut self, helper: &mut CommandBufferHelper<C>, size: usize) {
        let needed = size
            .saturating_add(self.config.result_size)
            .checked_next_power_of_two()
            .unwrap_or(usize::MAX)
            .max(self.config.default_buffer_size)
            .min(self.config.max_buffer_size);

        if self.usable && (!self.have_buffer() || needed > self.buffer_size()) {
            if self.have_buffer() {
                self.free(helper);
            }
            self.allocate(helper, needed);
        }
    }

    /// Allocate up to `size` bytes, returning a smaller block rather than waiting for one
    /// larger than what will ever be free.
    pub fn alloc_up_to<C: CommandBuffer>(
        &mut self,
        helper: &mut CommandBufferHelper<C>,
        size: usize,
    ) -> Option<Allocation> {
        self.reallocate(helper, size);
        let ring = self.ring.as_mut()?;
        let size = size.min(ring.largest_free_or_pending_size());
        if size == 0 {
            return None;
        }
        ring.alloc(size, helper)
    }

    /// Allocate exactly `size` bytes, waiting on pending tokens if needed.
    pub fn alloc<C: CommandBuffer>(
        &mut self,
        helper: &mut CommandBufferHelper<C>,
        size: usize,
    ) -> Option<Allocation> {
        self.reallocate(helper, size);
        let ring = self.ring.as_mut()?;
        if size > ring.largest_free_or_pending_size() {
            return None;
        }
        ring.alloc(size, helper)
    }

    /// Give back the tail of the most recent allocation.
    pub fn shrink_last_block(&mut self, new_size: usize) -> Result<(), RingBufferError> {
        match self.ring.as_mut() {
            Some(ring) => ring.shrink_last_block(new_size),
            None => Err(RingBufferError::InvalidShrink { new_size, size: 0 }),
        }
    }

    pub fn free_pending_token(
        &mut self,
        alloc: Allocation,
        token: i32,
    ) -> Result<(), RingBufferError> {
        match self.ring.as_mut() {
            Some(ring) => ring.free_pending_token(alloc, token),
            None => Err(RingBufferError::UnknownBlock {
                offset: alloc.offset,
            }),
        }
    }

    pub fn discard_block(&mut self, alloc: Allocation) -> Result<(), RingBufferError> {
        match self.ring.as_mut() {
            Some(ring) => ring.discard_block(alloc),
            None => Err(RingBufferError::UnknownBlock {
                offset: alloc.offset,
            }),
        }
    }

    /// Wait for the service to finish with the buffer, then destroy it.
    pub fn free<C: CommandBuffer>(&mut self, helper: &mut CommandBufferHelper<C>) {
        if !self.have_buffer() {
            return;
        }
        helper.finish();
        helper.command_buffer_mut().destroy_transfer_buffer(self.buffer_id);
        self.buffer_id = -1;
        self.buffer = None;
        self.ring = None;
    }
}

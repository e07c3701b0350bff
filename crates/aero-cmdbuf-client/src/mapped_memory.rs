//! Pools many small bulk allocations across a set of transfer buffers ("chunks").
//!
//! Creating a transfer buffer is a round trip to the service, so allocations are carved
//! out of existing chunks whenever possible and new chunks are created in multiples of
//! `chunk_size_multiple`.

use std::collections::BTreeMap;

use aero_cmdbuf_protocol::{Buffer, CommandBuffer};

use crate::config::MappedMemoryConfig;
use crate::helper::CommandBufferHelper;
use crate::ring_buffer::{Allocation, RingBuffer, RingBufferError};

/// A live allocation: `size` bytes at `shm_offset` in transfer buffer `shm_id`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MappedAllocation {
    pub shm_id: i32,
    pub shm_offset: usize,
    pub size: usize,
}

impl MappedAllocation {
    fn ring_allocation(&self) -> Allocation {
        Allocation {
            offset: self.shm_offset,
            size: self.size,
        }
    }
}

#[derive(Debug)]
struct MemoryChunk {
    buffer: Buffer,
    ring: RingBuffer,
}

impl MemoryChunk {
    fn size(&self) -> usize {
        self.buffer.size()
    }
}

#[derive(Debug)]
pub struct MappedMemoryManager {
    config: MappedMemoryConfig,
    /// Keyed by transfer-buffer id, so iteration follows creation order.
    chunks: BTreeMap<i32, MemoryChunk>,
    allocated_memory: usize,
}

impl MappedMemoryManager {
    pub fn new(config: MappedMemoryConfig) -> Self {
        Self {
            config,
            chunks: BTreeMap::new(),
            allocated_memory: 0,
        }
    }

    pub fn config(&self) -> &MappedMemoryConfig {
        &self.config
    }

    pub fn num_chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Total bytes held by all chunks.
    pub fn allocated_memory(&self) -> usize {
        self.allocated_memory
    }

    pub fn bytes_in_use(&self) -> usize {
        self.chunks.values().map(|c| c.ring.bytes_in_use()).sum()
    }

    /// A view of the allocation's bytes.
    pub fn buffer_for(&self, alloc: &MappedAllocation) -> Option<Buffer> {
        let chunk = self.chunks.get(&alloc.shm_id)?;
        chunk.buffer.sub_buffer(alloc.shm_offset, alloc.size).ok()
    }

    pub fn alloc<C: CommandBuffer>(
        &mut self,
        helper: &mut CommandBufferHelper<C>,
        size: usize,
    ) -> Option<MappedAllocation> {
        if size <= self.allocated_memory {
            let mut total_bytes_in_use = 0;
            for (&shm_id, chunk) in self.chunks.iter_mut() {
                chunk.ring.reclaim(helper);
                total_bytes_in_use += chunk.ring.bytes_in_use();
                if chunk.ring.largest_free_size_no_waiting(helper) >= size {
                    if let Some(alloc) = chunk.ring.alloc(size, helper) {
                        return Some(mapped(shm_id, alloc));
                    }
                }
            }

            // Plenty is free or about to be: wait on tokens rather than growing.
            if let Some(limit) = self.config.unused_memory_reclaim_limit {
                if self.allocated_memory - total_bytes_in_use >= limit {
                    for (&shm_id, chunk) in self.chunks.iter_mut() {
                        if chunk.ring.largest_free_or_pending_size() >= size {
                            if let Some(alloc) = chunk.ring.alloc(size, helper) {
                                return Some(mapped(shm_id, alloc));
                            }
                        }
                    }
                }
            }
        }

        if let Some(max) = self.config.max_allocated_bytes {
            if self.allocated_memory.saturating_add(size) > max {
                tracing::debug!(
                    size,
                    allocated = self.allocated_memory,
                    max,
                    "mapped memory limit reached"
                );
                return None;
            }
        }

        let chunk_size = self.chunk_size_for(size)?;
        let (shm_id, buffer) = helper
            .command_buffer_mut()
            .create_transfer_buffer(chunk_size)?;

        let mut chunk = MemoryChunk {
            ring: RingBuffer::new(self.config.alignment, 0, buffer.size()),
            buffer,
        };
        let Some(alloc) = chunk.ring.alloc(size, helper) else {
            tracing::warn!(shm_id, size, chunk_size, "allocation failed in a fresh chunk");
            helper.command_buffer_mut().destroy_transfer_buffer(shm_id);
            return None;
        };
        self.allocated_memory += chunk.size();
        tracing::debug!(shm_id, chunk_size, "created mapped memory chunk");
        self.chunks.insert(shm_id, chunk);
        Some(mapped(shm_id, alloc))
    }

    /// Size of a new chunk holding `size` bytes: the aligned request rounded up to
    /// `chunk_size_multiple`, then to the allocator alignment.
    fn chunk_size_for(&self, size: usize) -> Option<usize> {
        let alignment = self.config.alignment;
        let request = size.max(1).checked_next_multiple_of(alignment)?;
        request
            .checked_next_multiple_of(self.config.chunk_size_multiple.max(1))?
            .checked_next_multiple_of(alignment)
    }

    /// Release an allocation the service will never read.
    pub fn free(&mut self, alloc: &MappedAllocation) -> Result<(), RingBufferError> {
        self.chunk_mut(alloc)?.ring.free(alloc.ring_allocation())
    }

    /// Release an allocation once `token` has passed.
    pub fn free_pending_token(
        &mut self,
        alloc: &MappedAllocation,
        token: i32,
    ) -> Result<(), RingBufferError> {
        self.chunk_mut(alloc)?
            .ring
            .free_pending_token(alloc.ring_allocation(), token)
    }

    /// Destroy every chunk that holds nothing in use or pending.
    pub fn free_unused<C: CommandBuffer>(&mut self, helper: &mut CommandBufferHelper<C>) {
        let mut unused = Vec::new();
        for (&shm_id, chunk) in self.chunks.iter_mut() {
            chunk.ring.reclaim(helper);
            if !chunk.ring.has_pending_or_in_use() {
                unused.push(shm_id);
            }
        }
        for shm_id in unused {
            if let Some(chunk) = self.chunks.remove(&shm_id) {
                helper.command_buffer_mut().destroy_transfer_buffer(shm_id);
                self.allocated_memory -= chunk.size();
            }
        }
    }

    /// Wait for the service to go idle and destroy every chunk.
    pub fn release_all<C: CommandBuffer>(&mut self, helper: &mut CommandBufferHelper<C>) {
        if self.chunks.is_empty() {
            return;
        }
        helper.finish();
        for shm_id in std::mem::take(&mut self.chunks).into_keys() {
            helper.command_buffer_mut().destroy_transfer_buffer(shm_id);
        }
        self.allocated_memory = 0;
    }

    fn chunk_mut(&mut self, alloc: &MappedAllocation) -> Result<&mut MemoryChunk, RingBufferError> {
        self.chunks
            .get_mut(&alloc.shm_id)
            .ok_or(RingBufferError::UnknownBlock {
                offset: alloc.shm_offset,
            })
    }
}

fn mapped(shm_id: i32, alloc: Allocation) -> MappedAllocation {
    MappedAllocation {
        shm_id,
        shm_offset: alloc.offset,
        size: alloc.size,
    }
}

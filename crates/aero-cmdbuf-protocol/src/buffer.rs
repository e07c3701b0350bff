//! Shared-memory regions and bounds-checked views into them.
//!
//! Both sides hold the same [`SharedMemory`] through an `Arc`; every access goes through
//! relaxed 32-bit atomics so a misbehaving peer can race with us without causing undefined
//! behaviour. Ordering between the two sides is established by the shared state and flush
//! calls, never by the memory contents themselves.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::entry::{CommandBufferEntry, COMMAND_BUFFER_ENTRY_SIZE};

#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("shared memory access out of bounds: offset=0x{offset:x}, len=0x{len:x}, size=0x{size:x}")]
pub struct BufferAccessError {
    pub offset: usize,
    pub len: usize,
    pub size: usize,
}

/// A zero-initialized region of shared memory, stored as little-endian 32-bit words.
pub struct SharedMemory {
    words: Box<[AtomicU32]>,
    size: usize,
}

impl SharedMemory {
    pub fn new(size_bytes: usize) -> Self {
        let words = (0..size_bytes.div_ceil(4))
            .map(|_| AtomicU32::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            words,
            size: size_bytes,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn load_word(&self, word: usize) -> u32 {
        self.words[word].load(Ordering::Relaxed)
    }

    fn store_word(&self, word: usize, value: u32) {
        self.words[word].store(value, Ordering::Relaxed);
    }

    fn load_byte(&self, addr: usize) -> u8 {
        let shift = (addr % 4) * 8;
        (self.load_word(addr / 4) >> shift) as u8
    }

    fn store_byte(&self, addr: usize, value: u8) {
        let shift = (addr % 4) * 8;
        let mask = !(0xffu32 << shift);
        let bits = u32::from(value) << shift;
        // The closure always returns Some, so this cannot fail.
        let _ = self.words[addr / 4].fetch_update(Ordering::Relaxed, Ordering::Relaxed, |w| {
            Some((w & mask) | bits)
        });
    }
}

impl core::fmt::Debug for SharedMemory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SharedMemory")
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// A window `[offset, offset + size)` into a [`SharedMemory`] region.
///
/// Cloning a `Buffer` shares the underlying memory.
#[derive(Clone, Debug)]
pub struct Buffer {
    memory: Arc<SharedMemory>,
    offset: usize,
    size: usize,
}

impl Buffer {
    /// Allocate a fresh zero-filled region covering the whole buffer.
    pub fn new(size: usize) -> Self {
        Self {
            memory: Arc::new(SharedMemory::new(size)),
            offset: 0,
            size,
        }
    }

    /// View `size` bytes of `memory` starting at `offset`.
    pub fn from_shared(
        memory: Arc<SharedMemory>,
        offset: usize,
        size: usize,
    ) -> Result<Self, BufferAccessError> {
        let err = BufferAccessError {
            offset,
            len: size,
            size: memory.size(),
        };
        let end = offset.checked_add(size).ok_or_else(|| err.clone())?;
        if end > memory.size() {
            return Err(err);
        }
        Ok(Self {
            memory,
            offset,
            size,
        })
    }

    /// A narrower view of this buffer. `offset` is relative to this buffer.
    pub fn sub_buffer(&self, offset: usize, size: usize) -> Result<Self, BufferAccessError> {
        self.check(offset, size)?;
        Ok(Self {
            memory: self.memory.clone(),
            offset: self.offset + offset,
            size,
        })
    }

    pub fn memory(&self) -> &Arc<SharedMemory> {
        &self.memory
    }

    /// Byte offset of this view within its [`SharedMemory`].
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether the view starts on a command-entry boundary.
    pub fn is_aligned(&self) -> bool {
        self.offset % COMMAND_BUFFER_ENTRY_SIZE == 0
    }

    /// Number of whole entries that fit in the buffer.
    pub fn entry_count(&self) -> usize {
        self.size / COMMAND_BUFFER_ENTRY_SIZE
    }

    /// Whether both views share the same backing memory.
    pub fn same_memory(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.memory, &other.memory)
    }

    fn check(&self, offset: usize, len: usize) -> Result<(), BufferAccessError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(BufferAccessError {
                offset,
                len,
                size: self.size,
            }),
        }
    }

    pub fn read(&self, offset: usize, dst: &mut [u8]) -> Result<(), BufferAccessError> {
        self.check(offset, dst.len())?;
        let start = self.offset + offset;
        if start % 4 == 0 && dst.len() % 4 == 0 {
            for (i, chunk) in dst.chunks_exact_mut(4).enumerate() {
                chunk.copy_from_slice(&self.memory.load_word(start / 4 + i).to_le_bytes());
            }
        } else {
            for (i, b) in dst.iter_mut().enumerate() {
                *b = self.memory.load_byte(start + i);
            }
        }
        Ok(())
    }

    pub fn read_vec(&self, offset: usize, len: usize) -> Result<Vec<u8>, BufferAccessError> {
        self.check(offset, len)?;
        let mut out = vec![0u8; len];
        self.read(offset, &mut out)?;
        Ok(out)
    }

    pub fn write(&self, offset: usize, src: &[u8]) -> Result<(), BufferAccessError> {
        self.check(offset, src.len())?;
        let start = self.offset + offset;
        if start % 4 == 0 && src.len() % 4 == 0 {
            for (i, chunk) in src.chunks_exact(4).enumerate() {
                let word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                self.memory.store_word(start / 4 + i, word);
            }
        } else {
            for (i, b) in src.iter().enumerate() {
                self.memory.store_byte(start + i, *b);
            }
        }
        Ok(())
    }

    /// Set `len` bytes starting at `offset` to `value`.
    pub fn fill(&self, offset: usize, len: usize, value: u8) -> Result<(), BufferAccessError> {
        self.check(offset, len)?;
        for i in 0..len {
            self.memory.store_byte(self.offset + offset + i, value);
        }
        Ok(())
    }

    pub fn read_u32(&self, offset: usize) -> Result<u32, BufferAccessError> {
        let mut bytes = [0u8; 4];
        self.read(offset, &mut bytes)?;
        Ok(u32::from_le_bytes(bytes))
    }

    pub fn write_u32(&self, offset: usize, value: u32) -> Result<(), BufferAccessError> {
        self.write(offset, &value.to_le_bytes())
    }

    /// Copy `dst.len()` entries starting at entry index `first`.
    pub fn read_entries(
        &self,
        first: usize,
        dst: &mut [CommandBufferEntry],
    ) -> Result<(), BufferAccessError> {
        let offset = first.saturating_mul(COMMAND_BUFFER_ENTRY_SIZE);
        self.read(offset, bytemuck::cast_slice_mut(dst))
    }

    /// Store `src` starting at entry index `first`.
    pub fn write_entries(
        &self,
        first: usize,
        src: &[CommandBufferEntry],
    ) -> Result<(), BufferAccessError> {
        let offset = first.saturating_mul(COMMAND_BUFFER_ENTRY_SIZE);
        self.write(offset, bytemuck::cast_slice(src))
    }
}

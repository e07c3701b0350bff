//! Circular sub-allocator whose blocks are reclaimed once a token proves the service
//! has consumed them.
//!
//! Blocks are kept oldest first. Everything in `[in_use_offset, free_offset)` (wrapping)
//! is covered by blocks; the rest of the region is free. Allocation always happens at
//! `free_offset`; reclamation always happens at the oldest block.

use std::collections::VecDeque;
use std::fmt;

use aero_cmdbuf_protocol::align_up;
use thiserror::Error;

/// Completion tracking used by allocators that defer reuse until a token passes.
///
/// Implemented by the command helper. Allocators borrow it per call so they never hold on
/// to the helper.
pub trait TokenTracker {
    /// Last token the service was observed to have processed.
    fn last_token_read(&self) -> i32;

    /// Whether `token` is known to have passed, using only cached state.
    fn has_cached_token_passed(&self, token: i32) -> bool;

    /// Whether `token` has passed, refreshing the cached state if needed.
    fn has_token_passed(&mut self, token: i32) -> bool;

    /// Block until `token` has passed or the channel fails.
    fn wait_for_token(&mut self, token: i32);

    /// Whether the channel can still make progress.
    fn is_usable(&self) -> bool;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockState {
    Free,
    InUse,
    FreePendingToken,
    /// Reclaimable without a token wait: wrap padding or discarded blocks.
    Padding,
}

/// One entry of the partition returned by [`RingBuffer::blocks`]. Offsets are relative.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    pub offset: usize,
    pub size: usize,
    pub state: BlockState,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Block {
    offset: usize,
    size: usize,
    token: i32,
    state: BlockState,
}

/// Handle for a live ring-buffer allocation. `offset` includes the ring's base offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Allocation {
    pub offset: usize,
    pub size: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RingBufferError {
    #[error("no block at offset 0x{offset:x}")]
    UnknownBlock { offset: usize },
    #[error("block at offset 0x{offset:x} is {state:?}, expected InUse")]
    NotInUse { offset: usize, state: BlockState },
    #[error("cannot shrink the last block to {new_size} bytes (current size {size})")]
    InvalidShrink { new_size: usize, size: usize },
}

pub struct RingBuffer {
    alignment: usize,
    base_offset: usize,
    size: usize,
    blocks: VecDeque<Block>,
    free_offset: usize,
    in_use_offset: usize,
}

/// Offsets after reclaiming a prefix of the block list.
#[derive(Clone, Copy)]
struct Frontier {
    in_use_offset: usize,
    free_offset: usize,
    empty: bool,
}

impl RingBuffer {
    /// `alignment` must be a power of two.
    pub fn new(alignment: usize, base_offset: usize, size: usize) -> Self {
        debug_assert!(alignment.is_power_of_two());
        Self {
            alignment,
            base_offset,
            size,
            blocks: VecDeque::new(),
            free_offset: 0,
            in_use_offset: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn base_offset(&self) -> usize {
        self.base_offset
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Allocate `size` bytes, waiting on pending tokens if needed.
    ///
    /// Returns `None` if the rounded size exceeds the ring, the channel is unusable, or the
    /// oldest block is still in use so no amount of waiting can make room.
    pub fn alloc<T: TokenTracker + ?Sized>(
        &mut self,
        size: usize,
        tokens: &mut T,
    ) -> Option<Allocation> {
        let size = align_up(size.max(1), self.alignment);
        if size > self.size {
            tracing::warn!(size, capacity = self.size, "ring buffer allocation larger than the ring");
            return None;
        }
        if !tokens.is_usable() {
            return None;
        }

        self.reclaim(tokens);

        while size > self.largest_free_now() {
            let Some(oldest) = self.blocks.front().copied() else {
                break;
            };
            match oldest.state {
                BlockState::InUse => {
                    tracing::warn!(
                        size,
                        oldest_offset = oldest.offset,
                        "ring buffer exhausted by blocks still in use"
                    );
                    return None;
                }
                BlockState::FreePendingToken => {
                    tokens.wait_for_token(oldest.token);
                    if !tokens.is_usable() {
                        return None;
                    }
                }
                BlockState::Padding | BlockState::Free => {}
            }
            self.pop_oldest();
        }

        if self.free_offset + size > self.size {
            // Pad to the end so the allocation starts at 0.
            self.blocks.push_back(Block {
                offset: self.free_offset,
                size: self.size - self.free_offset,
                token: 0,
                state: BlockState::Padding,
            });
            self.free_offset = 0;
        }

        let offset = self.free_offset;
        self.blocks.push_back(Block {
            offset,
            size,
            token: 0,
            state: BlockState::InUse,
        });
        self.free_offset += size;
        if self.free_offset == self.size {
            self.free_offset = 0;
        }

        Some(Allocation {
            offset: self.base_offset + offset,
            size,
        })
    }

    /// Mark `alloc` free once `token` has passed.
    pub fn free_pending_token(
        &mut self,
        alloc: Allocation,
        token: i32,
    ) -> Result<(), RingBufferError> {
        let block = self.in_use_block_mut(alloc.offset)?;
        block.state = BlockState::FreePendingToken;
        block.token = token;
        Ok(())
    }

    /// Release `alloc` immediately. The service must never read its contents.
    pub fn free(&mut self, alloc: Allocation) -> Result<(), RingBufferError> {
        self.discard_block(alloc)
    }

    /// Drop a block whose contents were never submitted.
    ///
    /// The newest block and any padding before it are reclaimed at once, including across
    /// the wrap point. A block in the middle stays as padding until the blocks before it
    /// are reclaimed.
    pub fn discard_block(&mut self, alloc: Allocation) -> Result<(), RingBufferError> {
        self.in_use_block_mut(alloc.offset)?.state = BlockState::Padding;

        while let Some(back) = self.blocks.back() {
            if back.state != BlockState::Padding {
                break;
            }
            self.free_offset = back.offset;
            self.blocks.pop_back();
        }

        while let Some(front) = self.blocks.front() {
            if front.state != BlockState::Padding {
                break;
            }
            self.blocks.pop_front();
            if let Some(next) = self.blocks.front() {
                self.in_use_offset = next.offset;
            }
        }

        if self.blocks.is_empty() {
            self.in_use_offset = 0;
            self.free_offset = 0;
        }
        Ok(())
    }

    /// Shrink the newest block (which must be in use) to `new_size` bytes.
    pub fn shrink_last_block(&mut self, new_size: usize) -> Result<(), RingBufferError> {
        let new_size = align_up(new_size.max(1), self.alignment);
        let ring_size = self.size;
        let Some(last) = self.blocks.back_mut() else {
            return Err(RingBufferError::InvalidShrink { new_size, size: 0 });
        };
        if last.state != BlockState::InUse {
            return Err(RingBufferError::NotInUse {
                offset: last.offset,
                state: last.state,
            });
        }
        if new_size > last.size {
            return Err(RingBufferError::InvalidShrink {
                new_size,
                size: last.size,
            });
        }
        last.size = new_size;
        self.free_offset = (last.offset + new_size) % ring_size;
        Ok(())
    }

    /// Reclaim the oldest blocks that are padding or whose token has passed. Never blocks.
    pub fn reclaim<T: TokenTracker + ?Sized>(&mut self, tokens: &mut T) {
        while let Some(front) = self.blocks.front().copied() {
            let reclaimable = match front.state {
                BlockState::Padding | BlockState::Free => true,
                BlockState::FreePendingToken => tokens.has_token_passed(front.token),
                BlockState::InUse => false,
            };
            if !reclaimable {
                break;
            }
            self.pop_oldest();
        }
    }

    /// Largest contiguous allocation possible without waiting on any token.
    pub fn largest_free_size_no_waiting<T: TokenTracker + ?Sized>(&self, tokens: &T) -> usize {
        let frontier = self.frontier(|b| match b.state {
            BlockState::InUse => false,
            BlockState::FreePendingToken => tokens.has_cached_token_passed(b.token),
            BlockState::Padding | BlockState::Free => true,
        });
        self.free_sizes(frontier).0
    }

    /// Total free bytes without waiting on any token, contiguous or not.
    pub fn total_free_size_no_waiting<T: TokenTracker + ?Sized>(&self, tokens: &T) -> usize {
        let frontier = self.frontier(|b| match b.state {
            BlockState::InUse => false,
            BlockState::FreePendingToken => tokens.has_cached_token_passed(b.token),
            BlockState::Padding | BlockState::Free => true,
        });
        self.free_sizes(frontier).1
    }

    /// Largest contiguous allocation possible if every pending token were waited on.
    pub fn largest_free_or_pending_size(&self) -> usize {
        let frontier = self.frontier(|b| b.state != BlockState::InUse);
        self.free_sizes(frontier).0
    }

    /// Bytes held by blocks still in use.
    pub fn bytes_in_use(&self) -> usize {
        self.blocks
            .iter()
            .filter(|b| b.state == BlockState::InUse)
            .map(|b| b.size)
            .sum()
    }

    /// Whether any block is in use or waiting on a token.
    pub fn has_pending_or_in_use(&self) -> bool {
        self.blocks.iter().any(|b| {
            matches!(
                b.state,
                BlockState::InUse | BlockState::FreePendingToken
            )
        })
    }

    /// The full partition of the region, ordered by offset, with free runs included.
    pub fn blocks(&self) -> Vec<BlockInfo> {
        let mut out: Vec<BlockInfo> = self
            .blocks
            .iter()
            .map(|b| BlockInfo {
                offset: b.offset,
                size: b.size,
                state: b.state,
            })
            .collect();

        let mut push_free = |offset: usize, end: usize| {
            if end > offset {
                out.push(BlockInfo {
                    offset,
                    size: end - offset,
                    state: BlockState::Free,
                });
            }
        };
        if self.blocks.is_empty() {
            push_free(0, self.size);
        } else if self.free_offset > self.in_use_offset {
            push_free(self.free_offset, self.size);
            push_free(0, self.in_use_offset);
        } else if self.free_offset < self.in_use_offset {
            push_free(self.free_offset, self.in_use_offset);
        }

        out.sort_by_key(|b| b.offset);
        out
    }

    fn in_use_block_mut(&mut self, offset: usize) -> Result<&mut Block, RingBufferError> {
        let rel = offset
            .checked_sub(self.base_offset)
            .ok_or(RingBufferError::UnknownBlock { offset })?;
        let block = self
            .blocks
            .iter_mut()
            .rev()
            .find(|b| b.offset == rel)
            .ok_or(RingBufferError::UnknownBlock { offset })?;
        if block.state != BlockState::InUse {
            return Err(RingBufferError::NotInUse {
                offset,
                state: block.state,
            });
        }
        Ok(block)
    }

    fn pop_oldest(&mut self) {
        let Some(block) = self.blocks.pop_front() else {
            return;
        };
        self.in_use_offset += block.size;
        if self.in_use_offset == self.size {
            self.in_use_offset = 0;
        }
        if self.free_offset == self.in_use_offset {
            self.free_offset = 0;
            self.in_use_offset = 0;
        }
    }

    /// Offsets as they would be after reclaiming every leading block accepted by `reclaimable`.
    fn frontier(&self, reclaimable: impl Fn(&Block) -> bool) -> Frontier {
        let mut f = Frontier {
            in_use_offset: self.in_use_offset,
            free_offset: self.free_offset,
            empty: self.blocks.is_empty(),
        };
        let mut remaining = self.blocks.len();
        for block in self.blocks.iter() {
            if !reclaimable(block) {
                break;
            }
            remaining -= 1;
            f.in_use_offset += block.size;
            if f.in_use_offset == self.size {
                f.in_use_offset = 0;
            }
            if f.free_offset == f.in_use_offset {
                f.free_offset = 0;
                f.in_use_offset = 0;
            }
        }
        f.empty = remaining == 0;
        f
    }

    fn largest_free_now(&self) -> usize {
        self.free_sizes(Frontier {
            in_use_offset: self.in_use_offset,
            free_offset: self.free_offset,
            empty: self.blocks.is_empty(),
        })
        .0
    }

    /// `(largest contiguous, total)` free bytes for a frontier.
    fn free_sizes(&self, f: Frontier) -> (usize, usize) {
        if f.free_offset == f.in_use_offset {
            if f.empty {
                (self.size, self.size)
            } else {
                (0, 0)
            }
        } else if f.free_offset > f.in_use_offset {
            let tail = self.size - f.free_offset;
            (tail.max(f.in_use_offset), tail + f.in_use_offset)
        } else {
            let run = f.in_use_offset - f.free_offset;
            (run, run)
        }
    }
}

impl fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBuffer")
            .field("base_offset", &self.base_offset)
            .field("size", &self.size)
            .field("blocks", &self.blocks.len())
            .field("free_offset", &self.free_offset)
            .field("in_use_offset", &self.in_use_offset)
            .finish()
    }
}

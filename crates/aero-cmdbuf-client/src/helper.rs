//! Producer-side command writer.
//!
//! [`CommandBufferHelper`] owns the put cursor of one ring buffer. It hands out contiguous
//! entry space, pads with Noops when a command would straddle the end of the ring, flushes
//! put to the service, and tracks tokens so callers can tell when the service has consumed
//! everything up to a point.

use std::time::Instant;

use aero_cmdbuf_protocol::{
    Buffer, BufferAccessError, CommandBuffer, CommandBufferEntry, CommandHeader, FixedCommand,
    GetBucketData, GetBucketStart, Noop, SetBucketData, SetBucketDataImmediate, SetBucketSize,
    SetToken, State, COMMAND_BUFFER_ENTRY_SIZE,
};

use crate::config::HelperConfig;
use crate::ring_buffer::TokenTracker;

/// Tokens are 31-bit; negative values are never inserted.
const TOKEN_MASK: i32 = 0x7FFF_FFFF;

/// Contiguous entry space at the put cursor, returned by [`CommandBufferHelper::get_space`].
///
/// The helper has already advanced put past this space; the command must be fully written
/// before the next flush.
#[derive(Clone, Debug)]
pub struct CommandSpace {
    view: Buffer,
    first_entry: i32,
}

impl CommandSpace {
    /// Entry index of the first entry in the ring.
    pub fn first_entry(&self) -> i32 {
        self.first_entry
    }

    pub fn len(&self) -> usize {
        self.view.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn write_entries(
        &self,
        at: usize,
        src: &[CommandBufferEntry],
    ) -> Result<(), BufferAccessError> {
        self.view.write_entries(at, src)
    }

    pub fn write_bytes(&self, byte_offset: usize, data: &[u8]) -> Result<(), BufferAccessError> {
        self.view.write(byte_offset, data)
    }
}

pub struct CommandBufferHelper<C: CommandBuffer> {
    command_buffer: C,
    config: HelperConfig,

    ring_buffer_size: usize,
    ring_buffer_id: i32,
    ring_buffer: Option<Buffer>,
    total_entry_count: i32,
    immediate_entry_count: i32,

    token: i32,
    put: i32,
    last_put_sent: i32,
    cached_last_token_read: i32,
    cached_get_offset: i32,

    commands_issued: u32,
    flush_generation: u32,
    last_flush_time: Instant,
    usable: bool,
    context_lost: bool,
}

impl<C: CommandBuffer> CommandBufferHelper<C> {
    pub fn new(command_buffer: C) -> Self {
        Self::with_config(command_buffer, HelperConfig::default())
    }

    pub fn with_config(command_buffer: C, config: HelperConfig) -> Self {
        Self {
            command_buffer,
            config,
            ring_buffer_size: 0,
            ring_buffer_id: -1,
            ring_buffer: None,
            total_entry_count: 0,
            immediate_entry_count: 0,
            token: 0,
            put: 0,
            last_put_sent: 0,
            cached_last_token_read: 0,
            cached_get_offset: 0,
            commands_issued: 0,
            flush_generation: 0,
            last_flush_time: Instant::now(),
            usable: true,
            context_lost: false,
        }
    }

    /// Create the ring buffer (`ring_buffer_size` bytes) and attach it to the service.
    pub fn initialize(&mut self, ring_buffer_size: usize) -> bool {
        self.ring_buffer_size = ring_buffer_size;
        self.allocate_ring_buffer()
    }

    pub fn command_buffer(&self) -> &C {
        &self.command_buffer
    }

    pub fn command_buffer_mut(&mut self) -> &mut C {
        &mut self.command_buffer
    }

    pub fn config(&self) -> &HelperConfig {
        &self.config
    }

    /// False once ring-buffer creation failed; the helper never recovers.
    pub fn usable(&self) -> bool {
        self.usable
    }

    pub fn is_context_lost(&mut self) -> bool {
        if !self.context_lost {
            let state = self.command_buffer.get_last_state();
            self.update_cached_state(state);
        }
        self.context_lost
    }

    pub fn have_ring_buffer(&self) -> bool {
        self.ring_buffer.is_some()
    }

    pub fn ring_buffer_id(&self) -> i32 {
        self.ring_buffer_id
    }

    pub fn total_entry_count(&self) -> i32 {
        self.total_entry_count
    }

    pub fn put(&self) -> i32 {
        self.put
    }

    /// Last token inserted with [`insert_token`](Self::insert_token).
    pub fn token(&self) -> i32 {
        self.token
    }

    pub fn last_token_read(&self) -> i32 {
        self.cached_last_token_read
    }

    /// Incremented on every flush that reached the transport.
    pub fn flush_generation(&self) -> u32 {
        self.flush_generation
    }

    /// Entries that could be written right now without waiting, ignoring flush limits.
    pub fn get_total_free_entries_no_waiting(&self) -> i32 {
        let get = self.cached_get_offset;
        if get > self.put {
            get - self.put - 1
        } else {
            get + self.total_entry_count - self.put - i32::from(get == 0)
        }
    }

    fn allocate_ring_buffer(&mut self) -> bool {
        if !self.usable {
            return false;
        }
        if self.have_ring_buffer() {
            return true;
        }

        let Some((id, buffer)) = self
            .command_buffer
            .create_transfer_buffer(self.ring_buffer_size)
        else {
            tracing::warn!(
                size = self.ring_buffer_size,
                "failed to create command ring buffer"
            );
            self.usable = false;
            self.context_lost = true;
            return false;
        };

        let entries = buffer.size() / COMMAND_BUFFER_ENTRY_SIZE;
        let Ok(total_entry_count) = i32::try_from(entries) else {
            tracing::warn!(entries, "command ring buffer too large");
            self.command_buffer.destroy_transfer_buffer(id);
            self.usable = false;
            return false;
        };
        // One entry always stays free to tell a full ring from an empty one.
        if total_entry_count < 2 {
            tracing::warn!(total_entry_count, "command ring buffer too small");
            self.command_buffer.destroy_transfer_buffer(id);
            self.usable = false;
            return false;
        }

        self.command_buffer.set_get_buffer(id);
        tracing::debug!(id, total_entry_count, "attached command ring buffer");

        self.ring_buffer = Some(buffer);
        self.ring_buffer_id = id;
        self.total_entry_count = total_entry_count;
        self.put = 0;
        self.last_put_sent = 0;
        let state = self.command_buffer.get_last_state();
        self.update_cached_state(state);
        self.calc_immediate_entries(0);
        true
    }

    /// Drain and destroy the ring buffer. It is recreated on the next command.
    pub fn free_ring_buffer(&mut self) {
        if !self.have_ring_buffer() {
            return;
        }
        self.finish();
        self.command_buffer.destroy_transfer_buffer(self.ring_buffer_id);
        self.ring_buffer = None;
        self.ring_buffer_id = -1;
        self.total_entry_count = 0;
        self.immediate_entry_count = 0;
        self.put = 0;
        self.last_put_sent = 0;
        self.cached_get_offset = 0;
    }

    fn update_cached_state(&mut self, state: State) {
        self.cached_get_offset = state.get_offset;
        self.cached_last_token_read = state.token;
        let lost = state.is_error();
        if lost && !self.context_lost {
            tracing::warn!(
                error = ?state.error,
                reason = ?state.context_lost_reason,
                "command buffer context lost"
            );
        }
        self.context_lost = lost;
    }

    fn calc_immediate_entries(&mut self, waiting_count: i32) {
        if !self.usable || !self.have_ring_buffer() {
            self.immediate_entry_count = 0;
            return;
        }

        let total = self.total_entry_count;
        let get = self.cached_get_offset;
        let mut immediate = if get > self.put {
            get - self.put - 1
        } else {
            total - self.put - i32::from(get == 0)
        };

        if self.config.automatic_flushes {
            let divisor = if get == self.last_put_sent {
                self.config.auto_flush_small_divisor
            } else {
                self.config.auto_flush_big_divisor
            };
            let mut limit = total / (divisor.max(1) as i32);
            let pending = (self.put + total - self.last_put_sent) % total;
            if pending > 0 && pending >= limit {
                immediate = 0;
            } else {
                // Never limit below the request, or a command larger than the limit would
                // wait forever.
                limit = (limit - pending).max(waiting_count);
                immediate = immediate.min(limit);
            }
        }

        self.immediate_entry_count = immediate.max(0);
    }

    /// Publish put to the service.
    pub fn flush(&mut self) {
        if self.put == self.total_entry_count {
            self.put = 0;
        }
        if self.usable {
            self.last_flush_time = Instant::now();
            self.last_put_sent = self.put;
            self.command_buffer.flush(self.put);
            self.flush_generation = self.flush_generation.wrapping_add(1);
            self.calc_immediate_entries(0);
        }
    }

    /// Flush only if there are unpublished commands.
    pub fn flush_lazy(&mut self) {
        if self.put == self.last_put_sent {
            return;
        }
        self.flush();
    }

    fn periodic_flush_check(&mut self) {
        if self.last_flush_time.elapsed() > self.config.periodic_flush_delay {
            self.flush();
        }
    }

    /// Flush and wait until the service has consumed every command.
    ///
    /// Returns false if the context is lost.
    pub fn finish(&mut self) -> bool {
        if !self.usable {
            return false;
        }
        if self.put == self.cached_get_offset {
            return !self.context_lost;
        }
        self.flush_lazy();
        // After a flush put is always < total.
        if !self.wait_for_get_offset_in_range(self.put, self.put) {
            return false;
        }
        self.calc_immediate_entries(0);
        true
    }

    fn wait_for_get_offset_in_range(&mut self, start: i32, end: i32) -> bool {
        let state = self.command_buffer.wait_for_get_offset_in_range(start, end);
        self.update_cached_state(state);
        !self.context_lost
    }

    /// Insert a SetToken command and return its token, or -1 if the helper is unusable.
    ///
    /// When the 31-bit counter wraps to 0 the helper finishes, so every earlier token is
    /// known to have passed.
    pub fn insert_token(&mut self) -> i32 {
        self.allocate_ring_buffer();
        if !self.usable || self.context_lost {
            return -1;
        }

        self.token = (self.token + 1) & TOKEN_MASK;
        if self.cmd(&SetToken::new(self.token)) && self.token == 0 {
            tracing::debug!("token counter wrapped");
            self.finish();
        }
        self.token
    }

    /// Whether the service has processed `token`.
    pub fn has_token_passed(&mut self, token: i32) -> bool {
        // Tokens newer than the last inserted one predate a wrap, and the wrap finished.
        if token > self.token {
            return true;
        }
        if token <= self.cached_last_token_read {
            return true;
        }
        let state = self.command_buffer.get_last_state();
        self.update_cached_state(state);
        token <= self.cached_last_token_read
    }

    /// Block until `token` has passed or the context is lost.
    pub fn wait_for_token(&mut self, token: i32) {
        if token < 0 || self.has_token_passed(token) {
            return;
        }
        self.flush_lazy();
        let state = self
            .command_buffer
            .wait_for_token_in_range(token, self.token);
        self.update_cached_state(state);
    }

    /// Make at least `count` contiguous entries available at put, waiting if needed.
    pub fn wait_for_available_entries(&mut self, count: i32) {
        self.allocate_ring_buffer();
        if !self.usable || self.ring_buffer.is_none() {
            return;
        }
        let total = self.total_entry_count;
        if count >= total {
            tracing::warn!(count, total, "command larger than the ring buffer");
            return;
        }

        if self.put + count > total {
            // Pad to the end with Noops, but only once get has moved off 0 so that wrapping
            // put to 0 cannot look like an empty ring.
            let get = self.cached_get_offset;
            if get > self.put || get == 0 {
                self.flush_lazy();
                if !self.wait_for_get_offset_in_range(1, self.put) {
                    return;
                }
            }
            if !self.pad_to_end() {
                return;
            }
            self.put = 0;
        }

        self.calc_immediate_entries(count);
        if self.immediate_entry_count < count {
            self.flush_lazy();
            self.calc_immediate_entries(count);
            if self.immediate_entry_count < count {
                if !self.wait_for_get_offset_in_range((self.put + count + 1) % total, self.put) {
                    return;
                }
                self.calc_immediate_entries(count);
            }
        }
    }

    fn pad_to_end(&mut self) -> bool {
        let Some(ring) = self.ring_buffer.as_ref() else {
            return false;
        };
        let mut remaining = self.total_entry_count - self.put;
        while remaining > 0 {
            let size = remaining.min(CommandHeader::MAX_SIZE as i32);
            let Some(header) = Noop::header_for_skip(size as u32 - 1) else {
                return false;
            };
            if ring
                .write_entries(self.put as usize, &[CommandBufferEntry::from_header(header)])
                .is_err()
            {
                return false;
            }
            self.put += size;
            remaining -= size;
        }
        true
    }

    /// Reserve `entries` contiguous entries at put and advance put past them.
    pub fn get_space(&mut self, entries: i32) -> Option<CommandSpace> {
        self.commands_issued = self.commands_issued.wrapping_add(1);
        if self.config.automatic_flushes
            && self.config.commands_per_flush_check > 0
            && self.commands_issued % self.config.commands_per_flush_check == 0
        {
            self.periodic_flush_check();
        }

        if entries > self.immediate_entry_count {
            self.wait_for_available_entries(entries);
            if entries > self.immediate_entry_count {
                return None;
            }
        }

        let ring = self.ring_buffer.as_ref()?;
        let view = ring
            .sub_buffer(
                self.put as usize * COMMAND_BUFFER_ENTRY_SIZE,
                entries as usize * COMMAND_BUFFER_ENTRY_SIZE,
            )
            .ok()?;
        let space = CommandSpace {
            view,
            first_entry: self.put,
        };
        self.put += entries;
        self.immediate_entry_count -= entries;
        Some(space)
    }

    /// Write a fixed-size command. Returns false if no space could be obtained.
    pub fn cmd<T: FixedCommand>(&mut self, cmd: &T) -> bool {
        let entries = cmd.as_entries();
        match self.get_space(entries.len() as i32) {
            Some(space) => space.write_entries(0, entries).is_ok(),
            None => false,
        }
    }

    /// A Noop that skips `skip_count` entries after its header.
    pub fn noop(&mut self, skip_count: u32) -> bool {
        let Some(header) = Noop::header_for_skip(skip_count) else {
            return false;
        };
        match self.get_space(header.size() as i32) {
            Some(space) => space
                .write_entries(0, &[CommandBufferEntry::from_header(header)])
                .is_ok(),
            None => false,
        }
    }

    pub fn set_token(&mut self, token: i32) -> bool {
        self.cmd(&SetToken::new(token))
    }

    pub fn set_bucket_size(&mut self, bucket_id: u32, size: u32) -> bool {
        self.cmd(&SetBucketSize::new(bucket_id, size))
    }

    pub fn set_bucket_data(
        &mut self,
        bucket_id: u32,
        offset: u32,
        size: u32,
        shared_memory_id: i32,
        shared_memory_offset: u32,
    ) -> bool {
        self.cmd(&SetBucketData::new(
            bucket_id,
            offset,
            size,
            shared_memory_id,
            shared_memory_offset,
        ))
    }

    /// Copy `data` into the bucket through the command stream itself.
    pub fn set_bucket_data_immediate(&mut self, bucket_id: u32, offset: u32, data: &[u8]) -> bool {
        let Ok(size) = u32::try_from(data.len()) else {
            return false;
        };
        let Some(cmd) = SetBucketDataImmediate::new(bucket_id, offset, size) else {
            return false;
        };
        let Some(space) = self.get_space(cmd.header.size() as i32) else {
            return false;
        };

        let prefix = cmd.as_entries();
        let data_start = prefix.len() * COMMAND_BUFFER_ENTRY_SIZE;
        let padding = space.len() * COMMAND_BUFFER_ENTRY_SIZE - data_start - data.len();
        space.write_entries(0, prefix).is_ok()
            && space.write_bytes(data_start, data).is_ok()
            && space
                .write_bytes(data_start + data.len(), &[0u8; COMMAND_BUFFER_ENTRY_SIZE][..padding])
                .is_ok()
    }

    pub fn get_bucket_start(
        &mut self,
        bucket_id: u32,
        result_memory_id: i32,
        result_memory_offset: u32,
        data_memory_size: u32,
        data_memory_id: i32,
        data_memory_offset: u32,
    ) -> bool {
        self.cmd(&GetBucketStart::new(
            bucket_id,
            result_memory_id,
            result_memory_offset,
            data_memory_size,
            data_memory_id,
            data_memory_offset,
        ))
    }

    pub fn get_bucket_data(
        &mut self,
        bucket_id: u32,
        offset: u32,
        size: u32,
        shared_memory_id: i32,
        shared_memory_offset: u32,
    ) -> bool {
        self.cmd(&GetBucketData::new(
            bucket_id,
            offset,
            size,
            shared_memory_id,
            shared_memory_offset,
        ))
    }
}

impl<C: CommandBuffer> TokenTracker for CommandBufferHelper<C> {
    fn last_token_read(&self) -> i32 {
        self.cached_last_token_read
    }

    fn has_cached_token_passed(&self, token: i32) -> bool {
        token > self.token || token <= self.cached_last_token_read
    }

    fn has_token_passed(&mut self, token: i32) -> bool {
        CommandBufferHelper::has_token_passed(self, token)
    }

    fn wait_for_token(&mut self, token: i32) {
        CommandBufferHelper::wait_for_token(self, token)
    }

    fn is_usable(&self) -> bool {
        self.usable && !self.context_lost
    }
}

//! The consumer's end of the channel: published state, the put offset, the ring buffer
//! binding and the transfer-buffer registry.
//!
//! `{get, token, error}` is published lock-free through [`SharedState`]. The put offset and
//! ring binding live under a mutex with a condvar so a service thread can sleep until the
//! producer flushes, and a producer can sleep until the consumer makes progress.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use aero_cmdbuf_protocol::{
    in_range, Buffer, ContextLostReason, ErrorCode, SharedState, State, COMMAND_BUFFER_ENTRY_SIZE,
};

use crate::common_decoder::CommandBufferEngine;
use crate::transfer_buffer_manager::{TransferBufferManager, TransferBufferStats};

/// Producer-driven state that is not part of the published [`State`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ControlSnapshot {
    pub put_offset: i32,
    /// Transfer buffer id bound as the ring, or -1.
    pub ring_buffer_id: i32,
    pub num_entries: i32,
    /// Bumped every time the ring binding changes.
    pub set_get_buffer_count: u32,
    /// Bumped on every flush and ring binding change.
    pub change_count: u64,
    pub shut_down: bool,
}

/// Published state plus the control state, as seen at one instant.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ServiceState {
    pub state: State,
    pub control: ControlSnapshot,
}

pub struct CommandBufferService {
    shared: SharedState,
    control: Mutex<ControlSnapshot>,
    changed: Condvar,
    transfer_buffers: Mutex<TransferBufferManager>,
    next_transfer_buffer_id: AtomicI32,
}

impl Default for CommandBufferService {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CommandBufferService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBufferService")
            .field("state", &self.shared.snapshot())
            .field("control", &*self.lock_control())
            .finish_non_exhaustive()
    }
}

impl CommandBufferService {
    pub fn new() -> Self {
        Self {
            shared: SharedState::new(),
            control: Mutex::new(ControlSnapshot {
                ring_buffer_id: -1,
                ..ControlSnapshot::default()
            }),
            changed: Condvar::new(),
            transfer_buffers: Mutex::new(TransferBufferManager::new()),
            next_transfer_buffer_id: AtomicI32::new(1),
        }
    }

    fn lock_control(&self) -> MutexGuard<'_, ControlSnapshot> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_transfer_buffers(&self) -> MutexGuard<'_, TransferBufferManager> {
        self.transfer_buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Wake every waiter. Taking the lock orders the wakeup after any waiter's check.
    fn notify(&self) {
        let _guard = self.lock_control();
        self.changed.notify_all();
    }

    pub fn shared_state(&self) -> &SharedState {
        &self.shared
    }

    pub fn last_state(&self) -> State {
        self.shared.snapshot()
    }

    pub fn control(&self) -> ControlSnapshot {
        *self.lock_control()
    }

    pub fn state(&self) -> ServiceState {
        let control = self.lock_control();
        ServiceState {
            state: self.shared.snapshot(),
            control: *control,
        }
    }

    /// Publish a new put offset. Out-of-range offsets raise an OutOfBounds parse error.
    pub fn flush(&self, put_offset: i32) {
        let mut control = self.lock_control();
        if put_offset < 0 || put_offset > control.num_entries {
            drop(control);
            tracing::warn!(put_offset, "flush with put offset outside the ring buffer");
            self.set_parse_error(ErrorCode::OutOfBounds);
            return;
        }
        control.put_offset = put_offset;
        control.change_count += 1;
        self.changed.notify_all();
    }

    /// Bind transfer buffer `id` as the ring. Resets get and put.
    pub fn set_get_buffer(&self, id: i32) {
        let ring = self.get_transfer_buffer(id);
        if ring.is_none() {
            tracing::warn!(id, "binding unknown transfer buffer as the ring buffer");
        }
        let num_entries = ring
            .as_ref()
            .map_or(0, |b| i32::try_from(b.size() / COMMAND_BUFFER_ENTRY_SIZE).unwrap_or(0));

        let mut control = self.lock_control();
        control.ring_buffer_id = id;
        control.num_entries = num_entries;
        control.put_offset = 0;
        control.set_get_buffer_count = control.set_get_buffer_count.wrapping_add(1);
        control.change_count += 1;
        self.shared.set_get_offset(0);
        self.changed.notify_all();
    }

    /// The buffer currently bound as the ring.
    pub fn ring_buffer(&self) -> Option<Buffer> {
        let id = self.lock_control().ring_buffer_id;
        self.get_transfer_buffer(id)
    }

    /// Allocate and register a new transfer buffer. Ids are handed out from 1.
    pub fn create_transfer_buffer(&self, size: usize) -> Option<(i32, Buffer)> {
        let id = self.next_transfer_buffer_id.fetch_add(1, Ordering::Relaxed);
        if id <= 0 {
            tracing::error!("transfer buffer ids exhausted");
            return None;
        }
        let buffer = Buffer::new(size);
        if !self.register_transfer_buffer(id, buffer.clone()) {
            return None;
        }
        tracing::debug!(id, size, "created transfer buffer");
        Some((id, buffer))
    }

    /// Register a buffer allocated elsewhere.
    pub fn register_transfer_buffer(&self, id: i32, buffer: Buffer) -> bool {
        self.lock_transfer_buffers()
            .register_transfer_buffer(id, buffer)
    }

    /// Destroy transfer buffer `id`. Destroying the bound ring unbinds it and resets get
    /// and put.
    pub fn destroy_transfer_buffer(&self, id: i32) {
        self.lock_transfer_buffers().destroy_transfer_buffer(id);

        let mut control = self.lock_control();
        if control.ring_buffer_id == id {
            control.ring_buffer_id = -1;
            control.num_entries = 0;
            control.put_offset = 0;
            control.set_get_buffer_count = control.set_get_buffer_count.wrapping_add(1);
            control.change_count += 1;
            self.shared.set_get_offset(0);
            self.changed.notify_all();
        }
    }

    pub fn get_transfer_buffer(&self, id: i32) -> Option<Buffer> {
        self.lock_transfer_buffers().get_transfer_buffer(id)
    }

    pub fn transfer_buffer_stats(&self) -> TransferBufferStats {
        self.lock_transfer_buffers().stats()
    }

    pub fn set_get_offset(&self, get_offset: i32) {
        self.shared.set_get_offset(get_offset);
        self.notify();
    }

    pub fn set_token(&self, token: i32) {
        self.shared.set_token(token);
        self.notify();
    }

    /// Record a parse error. Only the first error sticks.
    pub fn set_parse_error(&self, error: ErrorCode) {
        let control = self.lock_control();
        let current = self.shared.snapshot();
        if current.error == ErrorCode::NoError {
            tracing::warn!(
                ?error,
                reason = ?current.context_lost_reason,
                "channel entered error state"
            );
            self.shared.set_error(error, current.context_lost_reason);
        }
        self.changed.notify_all();
        drop(control);
    }

    pub fn set_context_lost_reason(&self, reason: ContextLostReason) {
        self.shared.set_context_lost_reason(reason);
    }

    /// Block until the token is in `[start, end]` (wrapping) or the channel errors.
    pub fn wait_for_token_in_range(&self, start: i32, end: i32) -> State {
        self.wait_for_state(|s| in_range(start, end, s.token))
    }

    /// Block until get is in `[start, end]` (wrapping) or the channel errors.
    pub fn wait_for_get_offset_in_range(&self, start: i32, end: i32) -> State {
        self.wait_for_state(|s| in_range(start, end, s.get_offset))
    }

    fn wait_for_state(&self, done: impl Fn(&State) -> bool) -> State {
        let mut control = self.lock_control();
        loop {
            let state = self.shared.snapshot();
            if state.is_error() || done(&state) || control.shut_down {
                return state;
            }
            control = self
                .changed
                .wait(control)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block until the control state changes past `seen_change_count` or the service shuts
    /// down. Used by a service thread driving a scheduler.
    pub fn wait_for_flush(&self, seen_change_count: u64) -> ControlSnapshot {
        let mut control = self.lock_control();
        while control.change_count == seen_change_count && !control.shut_down {
            control = self
                .changed
                .wait(control)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *control
    }

    /// Like [`wait_for_flush`](Self::wait_for_flush), but gives up after `timeout`.
    pub fn wait_for_flush_timeout(&self, seen_change_count: u64, timeout: Duration) -> ControlSnapshot {
        let deadline = Instant::now() + timeout;
        let mut control = self.lock_control();
        while control.change_count == seen_change_count && !control.shut_down {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            control = self
                .changed
                .wait_timeout(control, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        *control
    }

    /// Tear the channel down. Waiters return and the producer sees a lost context.
    pub fn shutdown(&self) {
        let mut control = self.lock_control();
        control.shut_down = true;
        let current = self.shared.snapshot();
        if current.error == ErrorCode::NoError {
            self.shared
                .set_error(ErrorCode::LostContext, ContextLostReason::GpuChannelLost);
        }
        self.changed.notify_all();
        tracing::debug!("command buffer service shut down");
    }
}

impl CommandBufferEngine for CommandBufferService {
    fn get_transfer_buffer(&self, id: i32) -> Option<Buffer> {
        CommandBufferService::get_transfer_buffer(self, id)
    }

    fn set_token(&self, token: i32) {
        CommandBufferService::set_token(self, token)
    }

    fn set_get_offset(&self, offset: i32) {
        CommandBufferService::set_get_offset(self, offset)
    }

    fn set_parse_error(&self, error: ErrorCode) {
        CommandBufferService::set_parse_error(self, error)
    }

    fn set_context_lost_reason(&self, reason: ContextLostReason) {
        CommandBufferService::set_context_lost_reason(self, reason)
    }
}

/// Producer handle onto a service driven by a scheduler on another thread.
#[derive(Clone, Debug)]
pub struct SharedCommandBuffer(Arc<CommandBufferService>);

impl SharedCommandBuffer {
    pub fn new(service: Arc<CommandBufferService>) -> Self {
        Self(service)
    }

    pub fn service(&self) -> &Arc<CommandBufferService> {
        &self.0
    }
}

impl aero_cmdbuf_protocol::CommandBuffer for SharedCommandBuffer {
    fn get_last_state(&mut self) -> State {
        self.0.last_state()
    }

    fn flush(&mut self, put_offset: i32) {
        self.0.flush(put_offset)
    }

    fn wait_for_token_in_range(&mut self, start: i32, end: i32) -> State {
        self.0.wait_for_token_in_range(start, end)
    }

    fn wait_for_get_offset_in_range(&mut self, start: i32, end: i32) -> State {
        self.0.wait_for_get_offset_in_range(start, end)
    }

    fn set_get_buffer(&mut self, id: i32) {
        self.0.set_get_buffer(id)
    }

    fn create_transfer_buffer(&mut self, size: usize) -> Option<(i32, Buffer)> {
        self.0.create_transfer_buffer(size)
    }

    fn destroy_transfer_buffer(&mut self, id: i32) {
        self.0.destroy_transfer_buffer(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::thread;

    #[test]
    fn transfer_buffer_ids_start_at_one() {
        let service = CommandBufferService::new();
        let (a, buf_a) = service.create_transfer_buffer(64).unwrap();
        let (b, _) = service.create_transfer_buffer(32).unwrap();
        assert_eq!((a, b), (1, 2));
        assert!(service.get_transfer_buffer(1).unwrap().same_memory(&buf_a));
        assert!(service.get_transfer_buffer(0).is_none());
        assert_eq!(
            service.transfer_buffer_stats(),
            TransferBufferStats {
                buffer_count: 2,
                bytes_allocated: 96
            }
        );
    }

    #[test]
    fn flush_validates_put() {
        let service = CommandBufferService::new();
        let (id, _) = service.create_transfer_buffer(32).unwrap();
        service.set_get_buffer(id);
        assert_eq!(service.control().num_entries, 8);

        service.flush(5);
        assert_eq!(service.control().put_offset, 5);
        assert!(!service.last_state().is_error());

        service.flush(9);
        assert_eq!(service.control().put_offset, 5);
        assert_eq!(service.last_state().error, ErrorCode::OutOfBounds);
    }

    #[test]
    fn first_parse_error_wins() {
        let service = CommandBufferService::new();
        service.set_context_lost_reason(ContextLostReason::Guilty);
        service.set_parse_error(ErrorCode::InvalidArguments);
        service.set_parse_error(ErrorCode::LostContext);

        let state = service.last_state();
        assert_eq!(state.error, ErrorCode::InvalidArguments);
        assert_eq!(state.context_lost_reason, ContextLostReason::Guilty);
    }

    #[test]
    fn destroying_the_ring_unbinds_it() {
        let service = CommandBufferService::new();
        let (id, _) = service.create_transfer_buffer(64).unwrap();
        service.set_get_buffer(id);
        service.flush(3);
        service.set_get_offset(2);
        let before = service.control().set_get_buffer_count;

        service.destroy_transfer_buffer(id);
        let control = service.control();
        assert_eq!(control.ring_buffer_id, -1);
        assert_eq!((control.put_offset, control.num_entries), (0, 0));
        assert_eq!(control.set_get_buffer_count, before + 1);
        assert_eq!(service.last_state().get_offset, 0);
        assert!(service.ring_buffer().is_none());
    }

    #[test]
    fn token_wait_wakes_on_progress() {
        let service = Arc::new(CommandBufferService::new());
        let waiter = {
            let service = service.clone();
            thread::spawn(move || service.wait_for_token_in_range(5, 10))
        };

        thread::sleep(Duration::from_millis(10));
        service.set_token(3);
        service.set_token(7);

        let state = waiter.join().unwrap();
        assert!(in_range(5, 10, state.token));
    }

    #[test]
    fn waits_return_on_shutdown() {
        let service = Arc::new(CommandBufferService::new());
        let waiter = {
            let service = service.clone();
            thread::spawn(move || service.wait_for_get_offset_in_range(1, 1))
        };
        let flush_waiter = {
            let service = service.clone();
            thread::spawn(move || service.wait_for_flush(0))
        };

        thread::sleep(Duration::from_millis(10));
        service.shutdown();

        let state = waiter.join().unwrap();
        assert_eq!(state.error, ErrorCode::LostContext);
        assert_eq!(state.context_lost_reason, ContextLostReason::GpuChannelLost);
        assert!(flush_waiter.join().unwrap().shut_down);
    }

    #[test]
    fn wait_for_flush_sees_new_put() {
        let service = Arc::new(CommandBufferService::new());
        let (id, _) = service.create_transfer_buffer(64).unwrap();
        service.set_get_buffer(id);
        let seen = service.control().change_count;

        let waiter = {
            let service = service.clone();
            thread::spawn(move || service.wait_for_flush(seen))
        };
        service.flush(4);

        let control = waiter.join().unwrap();
        assert_eq!(control.put_offset, 4);
        assert!(control.change_count > seen);
    }

    #[test]
    fn shared_handle_drives_the_service_as_a_transport() {
        use aero_cmdbuf_protocol::CommandBuffer;

        let service = Arc::new(CommandBufferService::new());
        let mut transport = SharedCommandBuffer::new(service.clone());
        let (id, _) = transport.create_transfer_buffer(64).unwrap();
        transport.set_get_buffer(id);
        assert_eq!(service.control().ring_buffer_id, id);

        transport.flush(3);
        assert_eq!(service.control().put_offset, 3);

        service.set_get_offset(3);
        service.set_token(9);
        assert_eq!(transport.wait_for_get_offset_in_range(3, 3).get_offset, 3);
        assert_eq!(transport.get_last_token(), 9);

        transport.destroy_transfer_buffer(id);
        assert!(service.get_transfer_buffer(id).is_none());
    }

    #[test]
    fn timed_flush_wait_gives_up_without_a_flush() {
        let service = CommandBufferService::new();
        let seen = service.control().change_count;
        let started = Instant::now();
        let control = service.wait_for_flush_timeout(seen, Duration::from_millis(5));
        assert_eq!(control.change_count, seen);
        assert!(started.elapsed() >= Duration::from_millis(5));

        let (id, _) = service.create_transfer_buffer(32).unwrap();
        service.set_get_buffer(id);
        let control = service.wait_for_flush_timeout(seen, Duration::from_secs(10));
        assert!(control.change_count > seen);
    }
}

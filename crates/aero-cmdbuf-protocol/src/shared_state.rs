//! Lock-free `{get, token, error}` state published by the service.
//!
//! The state is an array of 32-bit words so it can live in a shared-memory page. Writers
//! serialize through a busy bit in `generation`; readers retry until they observe the same
//! non-busy generation before and after reading the payload words.

#[cfg(all(feature = "loom", test))]
use loom::sync::atomic::AtomicU32;
#[cfg(not(all(feature = "loom", test)))]
use std::sync::atomic::AtomicU32;

use std::sync::atomic::Ordering;

use crate::error::{ContextLostReason, ErrorCode};

/// Internal bit used to mark `generation` as "being updated".
///
/// Published generations never have this bit set and increment by 1 per completed update.
pub const SHARED_STATE_GENERATION_BUSY_BIT: u32 = 1 << 31;

/// Size of the shared state in 32-bit words.
pub const SHARED_STATE_U32_LEN: usize = 8;

pub mod state_index {
    //! Indices into the shared state when viewed as a `u32[]`.

    pub const GENERATION: usize = 0;
    pub const GET_OFFSET: usize = 1;
    pub const TOKEN: usize = 2;
    pub const ERROR: usize = 3;
    pub const CONTEXT_LOST_REASON: usize = 4;
}

/// Coherent snapshot of the shared state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct State {
    pub generation: u32,
    /// Consumer read cursor, in entries.
    pub get_offset: i32,
    /// Last token processed by the service.
    pub token: i32,
    pub error: ErrorCode,
    pub context_lost_reason: ContextLostReason,
}

impl State {
    pub const INITIAL: Self = Self {
        generation: 0,
        get_offset: 0,
        token: 0,
        error: ErrorCode::NoError,
        context_lost_reason: ContextLostReason::Unknown,
    };

    /// Whether the service has reported a fatal error on this channel.
    pub fn is_error(&self) -> bool {
        self.error.is_error()
    }
}

impl Default for State {
    fn default() -> Self {
        Self::INITIAL
    }
}

#[repr(C)]
pub struct SharedState {
    /// Sequence counter used to publish updates.
    ///
    /// The high bit ([`SHARED_STATE_GENERATION_BUSY_BIT`]) marks an in-progress update.
    generation: AtomicU32,

    get_offset: AtomicU32,
    token: AtomicU32,
    error: AtomicU32,
    context_lost_reason: AtomicU32,
    _reserved: [AtomicU32; 3],
}

impl SharedState {
    pub fn new() -> Self {
        Self {
            generation: AtomicU32::new(0),
            get_offset: AtomicU32::new(0),
            token: AtomicU32::new(0),
            error: AtomicU32::new(ErrorCode::NoError as u32),
            context_lost_reason: AtomicU32::new(ContextLostReason::Unknown as u32),
            _reserved: [AtomicU32::new(0), AtomicU32::new(0), AtomicU32::new(0)],
        }
    }

    /// Publish a new get offset.
    pub fn set_get_offset(&self, get_offset: i32) -> u32 {
        self.publish_with(|s| s.get_offset.store(get_offset as u32, Ordering::SeqCst))
    }

    /// Publish a new token.
    pub fn set_token(&self, token: i32) -> u32 {
        self.publish_with(|s| s.token.store(token as u32, Ordering::SeqCst))
    }

    /// Publish an error code and the accompanying context-lost reason together.
    pub fn set_error(&self, error: ErrorCode, reason: ContextLostReason) -> u32 {
        self.publish_with(|s| {
            s.context_lost_reason.store(reason as u32, Ordering::SeqCst);
            test_yield();
            s.error.store(error as u32, Ordering::SeqCst);
        })
    }

    pub fn set_context_lost_reason(&self, reason: ContextLostReason) -> u32 {
        self.publish_with(|s| s.context_lost_reason.store(reason as u32, Ordering::SeqCst))
    }

    /// Publish a complete state. `state.generation` is ignored.
    pub fn publish(&self, state: State) -> u32 {
        self.publish_with(|s| {
            s.get_offset.store(state.get_offset as u32, Ordering::SeqCst);
            test_yield();
            s.token.store(state.token as u32, Ordering::SeqCst);
            test_yield();
            s.context_lost_reason
                .store(state.context_lost_reason as u32, Ordering::SeqCst);
            test_yield();
            s.error.store(state.error as u32, Ordering::SeqCst);
        })
    }

    /// Protocol:
    /// 1) Mark the state as "in progress" by setting [`SHARED_STATE_GENERATION_BUSY_BIT`].
    /// 2) Store the payload fields.
    /// 3) Increment `generation` (busy bit cleared) as the final publish step.
    fn publish_with(&self, store: impl FnOnce(&Self)) -> u32 {
        // Acquire the write lock by setting the busy bit.
        let mut start = self.generation.load(Ordering::SeqCst);
        loop {
            if start & SHARED_STATE_GENERATION_BUSY_BIT != 0 {
                std::hint::spin_loop();
                test_yield();
                start = self.generation.load(Ordering::SeqCst);
                continue;
            }

            match self.generation.compare_exchange_weak(
                start,
                start | SHARED_STATE_GENERATION_BUSY_BIT,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => start = actual,
            }
        }

        test_yield();
        store(self);
        test_yield();

        let new_generation = start.wrapping_add(1) & !SHARED_STATE_GENERATION_BUSY_BIT;
        self.generation.store(new_generation, Ordering::SeqCst);
        new_generation
    }

    pub fn snapshot(&self) -> State {
        loop {
            let gen0 = self.generation.load(Ordering::SeqCst);
            if gen0 & SHARED_STATE_GENERATION_BUSY_BIT != 0 {
                // Writer in progress.
                std::hint::spin_loop();
                test_yield();
                continue;
            }

            let get_offset = self.get_offset.load(Ordering::SeqCst);
            let token = self.token.load(Ordering::SeqCst);
            let error = self.error.load(Ordering::SeqCst);
            let reason = self.context_lost_reason.load(Ordering::SeqCst);

            let gen1 = self.generation.load(Ordering::SeqCst);
            if gen0 != gen1 {
                test_yield();
                continue;
            }

            return State {
                generation: gen0,
                get_offset: get_offset as i32,
                token: token as i32,
                // Foreign writers may store codes this side doesn't know; treat them as fatal.
                error: ErrorCode::from_u32(error).unwrap_or(ErrorCode::GenericError),
                context_lost_reason: ContextLostReason::from_u32(reason)
                    .unwrap_or(ContextLostReason::Unknown),
            };
        }
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for SharedState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("SharedState").field(&self.snapshot()).finish()
    }
}

#[cfg(all(test, feature = "loom"))]
#[inline]
fn test_yield() {
    loom::thread::yield_now();
}

#[cfg(all(test, not(feature = "loom")))]
#[inline]
fn test_yield() {
    std::thread::yield_now();
}

#[cfg(not(test))]
#[inline]
fn test_yield() {}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn shared_state_struct_matches_declared_u32_len() {
        assert_eq!(
            core::mem::size_of::<SharedState>(),
            SHARED_STATE_U32_LEN * 4
        );
    }

    #[test]
    fn initial_snapshot_is_clean() {
        let state = SharedState::new();
        assert_eq!(state.snapshot(), State::INITIAL);
        assert!(!state.snapshot().is_error());
    }

    #[test]
    fn generation_increments_by_one_per_completed_publish() {
        let state = SharedState::new();

        let g0 = state.snapshot().generation;
        state.set_get_offset(4);
        let g1 = state.snapshot().generation;
        state.set_token(9);
        let g2 = state.snapshot().generation;

        assert_eq!(g1, g0.wrapping_add(1));
        assert_eq!(g2, g1.wrapping_add(1));

        let snap = state.snapshot();
        assert_eq!(snap.get_offset, 4);
        assert_eq!(snap.token, 9);
    }

    #[test]
    fn error_and_reason_are_published_together() {
        let state = SharedState::new();
        state.set_error(ErrorCode::LostContext, ContextLostReason::Guilty);

        let snap = state.snapshot();
        assert_eq!(snap.error, ErrorCode::LostContext);
        assert_eq!(snap.context_lost_reason, ContextLostReason::Guilty);
        assert!(snap.is_error());
    }

    #[test]
    fn snapshot_is_coherent_across_concurrent_updates() {
        let state = Arc::new(SharedState::new());

        let start = Arc::new(std::sync::Barrier::new(2));
        let done = Arc::new(AtomicBool::new(false));

        let writer_state = state.clone();
        let writer_start = start.clone();
        let writer_done = done.clone();
        let writer = thread::spawn(move || {
            writer_start.wait();

            for token in 0i32..10_000 {
                writer_state.publish(State {
                    generation: 0,
                    get_offset: token.wrapping_add(1),
                    token,
                    error: ErrorCode::NoError,
                    context_lost_reason: ContextLostReason::Unknown,
                });
            }

            writer_done.store(true, Ordering::SeqCst);
        });

        let reader_state = state.clone();
        let reader_start = start.clone();
        let reader_done = done.clone();
        let reader = thread::spawn(move || {
            reader_start.wait();

            while !reader_done.load(Ordering::SeqCst) {
                let snap = reader_state.snapshot();
                if snap.generation == 0 {
                    continue;
                }
                assert_eq!(snap.get_offset, snap.token.wrapping_add(1));
                assert_eq!(snap.error, ErrorCode::NoError);
            }

            let snap = reader_state.snapshot();
            assert_eq!(snap.token, 9_999);
            assert_eq!(snap.get_offset, 10_000);
        });

        writer.join().unwrap();
        reader.join().unwrap();
    }
}
